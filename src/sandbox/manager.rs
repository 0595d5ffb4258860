//! Sandbox lifecycle: scratch-directory allocation, launch, and destruction.
//!
//! # Scratch layout
//!
//! ```text
//! {base_dir}/{sandbox-id}/
//! └── data/           # bind-mounted read-write at /mnt/data
//!     └── .codebox/   # staged interpreter server + build artifacts,
//!                     # hidden from output-file scans
//! ```
//!
//! A sandbox's scratch directory outlives its process by at most the
//! destruction window, and is never shared with another sandbox.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::config::Settings;
use crate::error::SandboxError;
use crate::exec::protocol::READY_MARKER;
use crate::languages::Language;
use crate::sandbox::{
    IsolationSpec, ReplProcess, Sandbox, SandboxState, REPL_SERVER_FILE, REPL_SERVER_SOURCE,
};

/// Grace period between TERM and KILL during destruction.
const DESTROY_GRACE: Duration = Duration::from_secs(2);

/// Filesystem layout of one sandbox's scratch area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPaths {
    /// Root directory for this sandbox.
    pub root: PathBuf,
    /// Data directory bound read-write into the sandbox.
    pub data: PathBuf,
    /// Hidden directory for the staged interpreter and build artifacts.
    pub build: PathBuf,
}

impl SandboxPaths {
    /// Computes the paths for a sandbox id; creates nothing.
    #[must_use]
    pub fn new(base_dir: &Path, sandbox_id: &str) -> Self {
        let root = base_dir.join(sandbox_id);
        let data = root.join("data");
        Self {
            build: data.join(".codebox"),
            data,
            root,
        }
    }

    /// Creates the directory structure. The data directory is made
    /// world-writable: each sandbox owns its directory exclusively and the
    /// in-sandbox uid differs from the service uid.
    pub async fn create(&self) -> Result<(), SandboxError> {
        for dir in [&self.root, &self.data, &self.build] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| SandboxError::CreationFailed {
                    context: format!("create {}", dir.display()),
                    source: e,
                })?;
        }
        tokio::fs::set_permissions(&self.data, std::fs::Permissions::from_mode(0o777))
            .await
            .map_err(|e| SandboxError::CreationFailed {
                context: format!("chmod {}", self.data.display()),
                source: e,
            })?;
        Ok(())
    }

    /// Removes the whole scratch tree. Missing directories are fine.
    pub async fn cleanup(&self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Whether the scratch root still exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.root.exists()
    }
}

/// Builds sandboxes from the isolation driver plus scratch allocation,
/// and tears them down cleanly.
#[derive(Debug)]
pub struct SandboxManager {
    settings: Settings,
}

impl SandboxManager {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Whether the configured isolation binary can be found.
    #[must_use]
    pub fn is_available(&self) -> bool {
        crate::sandbox::resolve_binary(&self.settings.isolation_binary).is_some()
    }

    /// Creates a sandbox.
    ///
    /// Interactive sandboxes get the interpreter server staged and spawned
    /// immediately; the caller must still [`wait_ready`](Self::wait_ready)
    /// before handing the sandbox out. One-shot sandboxes are a scratch
    /// directory only; the executor spawns isolation processes into them
    /// per invocation.
    #[instrument(skip(self), fields(%language))]
    pub async fn create(
        &self,
        id: String,
        language: Language,
        repl_mode: bool,
    ) -> Result<Sandbox, SandboxError> {
        let paths = SandboxPaths::new(&self.settings.sandbox_base_dir, &id);
        paths.create().await?;

        let mut sandbox = Sandbox {
            id,
            language,
            paths,
            created_at: Instant::now(),
            state: if repl_mode {
                SandboxState::Warming
            } else {
                SandboxState::Ready
            },
            process: None,
        };

        if repl_mode {
            if let Err(e) = self.start_interpreter(&mut sandbox).await {
                let _ = sandbox.paths.cleanup().await;
                return Err(e);
            }
        }

        debug!(sandbox_id = %sandbox.id, repl_mode, "Created sandbox");
        Ok(sandbox)
    }

    async fn start_interpreter(&self, sandbox: &mut Sandbox) -> Result<(), SandboxError> {
        let script_path = sandbox.paths.build.join(REPL_SERVER_FILE);
        tokio::fs::write(&script_path, REPL_SERVER_SOURCE)
            .await
            .map_err(|e| SandboxError::CreationFailed {
                context: format!("stage interpreter server at {}", script_path.display()),
                source: e,
            })?;

        let spec = IsolationSpec::new(
            sandbox.language,
            &sandbox.paths.data,
            vec![
                "python3".to_string(),
                format!("/mnt/data/.codebox/{REPL_SERVER_FILE}"),
            ],
        )
        .repl_mode()
        .with_memory_limit_mb(self.settings.memory_limit_mb)
        .with_tmpfs_size_mb(self.settings.tmpfs_size_mb);

        let mut child = spec.spawn(&self.settings.isolation_binary)?;
        let stdin = child.stdin.take().ok_or_else(|| SandboxError::Unhealthy {
            reason: "interpreter stdin not piped".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SandboxError::Unhealthy {
            reason: "interpreter stdout not piped".to_string(),
        })?;

        sandbox.process = Some(ReplProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        });
        Ok(())
    }

    /// Waits for the interpreter server's ready marker.
    ///
    /// Lines before the marker are warmup log noise and are discarded.
    /// On timeout or premature exit the sandbox is left for the caller to
    /// destroy and `SandboxError::Unhealthy` is returned.
    #[instrument(skip(self, sandbox), fields(sandbox_id = %sandbox.id))]
    pub async fn wait_ready(
        &self,
        sandbox: &mut Sandbox,
        budget: Duration,
    ) -> Result<(), SandboxError> {
        let started = Instant::now();
        let repl = sandbox.process.as_mut().ok_or_else(|| SandboxError::Unhealthy {
            reason: "not an interactive sandbox".to_string(),
        })?;

        let wait = async {
            let mut line = String::new();
            loop {
                line.clear();
                let read = repl
                    .stdout
                    .read_line(&mut line)
                    .await
                    .map_err(|e| SandboxError::Unhealthy {
                        reason: format!("interpreter stdout read failed: {e}"),
                    })?;
                if read == 0 {
                    return Err(SandboxError::Unhealthy {
                        reason: "interpreter exited before ready marker".to_string(),
                    });
                }
                if line.trim_end() == READY_MARKER {
                    return Ok(());
                }
            }
        };

        match timeout(budget, wait).await {
            Ok(Ok(())) => {
                sandbox.state = SandboxState::Ready;
                debug!(elapsed_ms = %started.elapsed().as_millis(), "Interpreter ready");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SandboxError::Unhealthy {
                reason: format!("warmup exceeded {} s", budget.as_secs()),
            }),
        }
    }

    /// Destroys a sandbox: terminates the process group, waits briefly,
    /// force-kills on timeout, reaps, and removes the scratch directory.
    ///
    /// Idempotent; destruction failures are logged, never raised.
    #[instrument(skip(self, sandbox), fields(sandbox_id = %sandbox.id))]
    pub async fn destroy(&self, sandbox: &mut Sandbox) {
        if sandbox.state == SandboxState::Destroyed {
            return;
        }

        if let Some(mut repl) = sandbox.process.take() {
            if let Some(pid) = repl.child.id() {
                // Negative pid signals the whole process group.
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGTERM);
                }
                if timeout(DESTROY_GRACE, repl.child.wait()).await.is_err() {
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                    let _ = repl.child.kill().await;
                    let _ = repl.child.wait().await;
                }
            } else {
                let _ = repl.child.wait().await;
            }
        }

        if let Err(e) = sandbox.paths.cleanup().await {
            warn!(sandbox_id = %sandbox.id, error = %e, "Failed to remove sandbox scratch");
        }
        sandbox.state = SandboxState::Destroyed;
        debug!("Destroyed sandbox");
    }

    /// Service settings this manager was built with.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_layout() {
        let paths = SandboxPaths::new(Path::new("/tmp/base"), "py-000001");
        assert_eq!(paths.root, PathBuf::from("/tmp/base/py-000001"));
        assert_eq!(paths.data, paths.root.join("data"));
        assert_eq!(paths.build, paths.data.join(".codebox"));
    }

    #[tokio::test]
    async fn test_paths_create_and_cleanup() {
        let base = TempDir::new().unwrap();
        let paths = SandboxPaths::new(base.path(), "sbx-1");

        paths.create().await.unwrap();
        assert!(paths.exists());
        assert!(paths.build.is_dir());

        let mode = std::fs::metadata(&paths.data).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o777);

        paths.cleanup().await.unwrap();
        assert!(!paths.exists());
        // second cleanup is a no-op
        paths.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_oneshot_sandbox_has_no_process() {
        let base = TempDir::new().unwrap();
        let settings = Settings::new().with_sandbox_base_dir(base.path());
        let manager = SandboxManager::new(settings);

        let sandbox = manager
            .create("c-000001".to_string(), Language::C, false)
            .await
            .unwrap();
        assert_eq!(sandbox.state, SandboxState::Ready);
        assert!(sandbox.process.is_none());
        assert!(sandbox.paths.exists());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let base = TempDir::new().unwrap();
        let settings = Settings::new().with_sandbox_base_dir(base.path());
        let manager = SandboxManager::new(settings);

        let mut sandbox = manager
            .create("c-000002".to_string(), Language::C, false)
            .await
            .unwrap();
        manager.destroy(&mut sandbox).await;
        assert_eq!(sandbox.state, SandboxState::Destroyed);
        assert!(!sandbox.paths.exists());
        manager.destroy(&mut sandbox).await;
        assert_eq!(sandbox.state, SandboxState::Destroyed);
    }

    #[tokio::test]
    async fn test_interpreter_script_is_staged() {
        let base = TempDir::new().unwrap();
        let settings = Settings::new()
            .with_sandbox_base_dir(base.path())
            // `true` exits immediately; only the staging side matters here.
            .with_isolation_binary("true");
        let manager = SandboxManager::new(settings);

        let sandbox = manager
            .create("py-000001".to_string(), Language::Python, true)
            .await
            .unwrap();
        let staged = sandbox.paths.build.join(REPL_SERVER_FILE);
        assert!(staged.is_file());
        let body = std::fs::read_to_string(staged).unwrap();
        assert!(body.contains("REQUEST_START"));
    }
}
