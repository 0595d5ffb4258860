//! Shared helpers for the integration tests.
//!
//! The isolation tool is a configured external binary, so the tests stand
//! in a small shell script for it. The interpreter fake speaks the frame
//! protocol well enough to exercise the full REPL path; the one-shot
//! fakes model a runner or compiler exiting with controlled output.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use codebox::config::Settings;
use codebox::exec::Orchestrator;
use codebox::files::FileStore;
use codebox::sandbox::{ReplLauncher, SandboxManager, SandboxPool};
use codebox::state::{FsColdTier, MemoryHotTier, StateStore};

/// Frame-speaking interpreter: answers every request with a fixed
/// success body carrying the snapshot bytes [1, 2, 3].
pub const FAKE_INTERPRETER: &str = r#"#!/bin/sh
echo ">>> READY <<<"
while IFS= read -r line; do
  case "$line" in
    *"REQUEST_END"*)
      echo ">>> RESPONSE_START <<<"
      printf '%s\n' '{"stdout":"ok\n","stderr":"","exit_code":0,"state":"AQID","files":[],"error":null}'
      echo ">>> RESPONSE_END <<<"
      ;;
  esac
done
"#;

/// Interpreter that warms up but never answers a request.
pub const FAKE_HANGING_INTERPRETER: &str = r#"#!/bin/sh
echo ">>> READY <<<"
while IFS= read -r line; do :; done
"#;

/// Interpreter that breaks the framing and exits mid-conversation.
pub const FAKE_BROKEN_INTERPRETER: &str = r#"#!/bin/sh
echo ">>> READY <<<"
IFS= read -r line
echo "this is not a frame"
exit 0
"#;

/// Interpreter that never emits the ready marker.
pub const FAKE_SILENT_INTERPRETER: &str = r#"#!/bin/sh
while IFS= read -r line; do :; done
"#;

/// One-shot runner: prints a line and writes one output file into the
/// sandbox scratch (located from the bind-mount argument).
pub const FAKE_RUNNER_WITH_FILE: &str = r#"#!/bin/sh
for a in "$@"; do
  case "$a" in
    *:/mnt/data) d="${a%%:*}";;
  esac
done
echo "hello"
[ -n "$d" ] && echo "artifact" > "$d/out.txt"
exit 0
"#;

/// One-shot runner that prints whatever was staged as input.txt.
pub const FAKE_RUNNER_CAT_INPUT: &str = r#"#!/bin/sh
for a in "$@"; do
  case "$a" in
    *:/mnt/data) d="${a%%:*}";;
  esac
done
cat "$d/input.txt" 2>/dev/null
exit 0
"#;

/// Compiler that fails with a diagnostic.
pub const FAKE_FAILING_COMPILER: &str = r#"#!/bin/sh
echo "main.c:1:1: error: expected declaration" >&2
exit 1
"#;

/// Process that dies to SIGKILL immediately, like a cgroup memory kill.
pub const FAKE_RESOURCE_KILLED: &str = r#"#!/bin/sh
kill -KILL $$
"#;

/// Writes an executable fake isolation binary and returns its path.
pub fn write_fake_isolation(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write fake isolation binary");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fake isolation binary");
    path
}

/// Settings pointed at temp directories and a fake isolation binary.
pub fn test_settings(root: &Path, fake_binary: &Path, pool_target: usize) -> Settings {
    let mut settings = Settings::new()
        .with_isolation_binary(fake_binary.to_string_lossy().into_owned())
        .with_sandbox_base_dir(root.join("sandboxes"))
        .with_file_bucket(root.join("files"))
        .with_pool_target(pool_target);
    settings.warmup_timeout = Duration::from_secs(5);
    settings.pool_acquire_timeout = Duration::from_secs(5);
    // The frame-level tests drive their own deadlines; skip the ping.
    settings.health_check_timeout = Duration::ZERO;
    settings
}

/// Everything wired the way `main` wires it, minus the HTTP surface.
pub struct TestStack {
    pub orchestrator: Orchestrator,
    pub pool: SandboxPool,
    pub store: Arc<StateStore>,
    pub hot: Arc<MemoryHotTier>,
    pub cold: Arc<FsColdTier>,
    pub files: Arc<FileStore>,
}

pub fn build_stack(settings: Settings) -> TestStack {
    let manager = Arc::new(SandboxManager::new(settings.clone()));
    let launcher = Arc::new(ReplLauncher::new(
        Arc::clone(&manager),
        settings.warmup_timeout,
    ));
    let pool = SandboxPool::new(launcher, manager, settings.clone());

    let hot = Arc::new(MemoryHotTier::new());
    let cold = Arc::new(FsColdTier::new(settings.file_bucket.join("state")));
    let store = Arc::new(StateStore::new(
        hot.clone(),
        cold.clone(),
        settings.hot_ttl,
        settings.session_meta_ttl,
        settings.max_snapshot_bytes,
    ));
    let files = Arc::new(FileStore::new(settings.file_bucket.join("uploads")));

    let orchestrator = Orchestrator::new(
        pool.clone(),
        Arc::clone(&store),
        Arc::clone(&files),
        settings,
    );
    TestStack {
        orchestrator,
        pool,
        store,
        hot,
        cold,
        files,
    }
}
