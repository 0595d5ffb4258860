//! Isolation driver: turns a declarative sandbox specification into the
//! argument vector for the external isolation binary and spawns it.
//!
//! The isolation tool is treated as a configured external binary with an
//! nsjail-compatible CLI. The spawned child runs under distinct PID, mount
//! and (unless network is enabled) network namespaces, sees the host
//! filesystem only through the configured bind mounts, and is killed by
//! the kernel when it exceeds the cgroup limits.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, instrument};

use crate::error::SandboxError;
use crate::languages::{Language, DATA_MOUNT};

/// Seccomp policy applied to every sandbox: deny process inspection and
/// server sockets, allow everything else with EPERM rather than SIGSYS.
const DEFAULT_SECCOMP_POLICY: &str =
    "POLICY policy { ERRNO(1) { ptrace, bind } } USE policy DEFAULT ALLOW";

/// Declarative specification of one isolation invocation.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use codebox::languages::Language;
/// use codebox::sandbox::IsolationSpec;
///
/// let spec = IsolationSpec::new(Language::C, "/tmp/sbx/data", vec!["/mnt/data/.codebox/main".into()])
///     .with_time_limit(Duration::from_secs(30))
///     .with_memory_limit_mb(512);
/// let args = spec.build_args().unwrap();
/// assert!(args.contains(&"--really_quiet".to_string()));
/// ```
#[derive(Debug, Clone)]
pub struct IsolationSpec {
    pub language: Language,
    /// Host directory bound read-write at the data mount point.
    pub scratch_dir: PathBuf,
    /// Command and arguments executed inside the sandbox.
    pub command: Vec<String>,
    /// Wall-clock limit enforced by the isolation tool; `None` means no
    /// limit (interactive mode, where the host enforces deadlines).
    pub time_limit: Option<Duration>,
    /// CPU-seconds limit; defaults to the wall-clock limit when unset.
    pub cpu_time_limit: Option<Duration>,
    pub memory_limit_mb: u64,
    pub max_pids: u32,
    pub tmpfs_size_mb: u32,
    /// Allow outbound network. Off by default.
    pub network: bool,
    /// Interactive mode keeps the stdio pipes attached (no setsid).
    pub repl_mode: bool,
    pub seccomp_policy: String,
    extra_env: Vec<(String, String)>,
}

impl IsolationSpec {
    /// Creates a specification with service-default limits.
    #[must_use]
    pub fn new(language: Language, scratch_dir: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            language,
            scratch_dir: scratch_dir.into(),
            command,
            time_limit: Some(Duration::from_secs(30)),
            cpu_time_limit: None,
            memory_limit_mb: 512,
            max_pids: 256,
            tmpfs_size_mb: 64,
            network: false,
            repl_mode: false,
            seccomp_policy: DEFAULT_SECCOMP_POLICY.to_string(),
            extra_env: Vec::new(),
        }
    }

    /// Sets the wall-clock limit.
    #[must_use]
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Removes the isolation-level wall-clock limit (interactive sandboxes;
    /// the host read deadline takes over).
    #[must_use]
    pub fn without_time_limit(mut self) -> Self {
        self.time_limit = None;
        self
    }

    /// Sets the memory limit in megabytes.
    #[must_use]
    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    /// Sets a CPU-seconds limit distinct from the wall-clock limit.
    #[must_use]
    pub fn with_cpu_time_limit(mut self, limit: Duration) -> Self {
        self.cpu_time_limit = Some(limit);
        self
    }

    /// Sets the tmpfs size for /tmp in megabytes.
    #[must_use]
    pub fn with_tmpfs_size_mb(mut self, mb: u32) -> Self {
        self.tmpfs_size_mb = mb;
        self
    }

    /// Marks this invocation as an interactive interpreter session.
    #[must_use]
    pub fn repl_mode(mut self) -> Self {
        self.repl_mode = true;
        self.time_limit = None;
        self
    }

    /// Adds an environment variable on top of the language whitelist.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.push((key.into(), value.into()));
        self
    }

    /// Environment handed to the child: the common whitelist, the
    /// language's additions, then per-spec overrides, later wins.
    fn environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("PATH".into(), "/usr/local/bin:/usr/bin:/bin".into());
        env.insert("HOME".into(), "/tmp".into());
        env.insert("TMPDIR".into(), "/tmp".into());
        for (key, value) in self.language.config().env {
            env.insert((*key).into(), (*value).into());
        }
        for (key, value) in &self.extra_env {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    /// Builds the isolation binary's argument vector.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::ConfigInvalid` without spawning anything if
    /// the specification is unusable.
    pub fn build_args(&self) -> Result<Vec<String>, SandboxError> {
        if self.command.is_empty() {
            return Err(SandboxError::ConfigInvalid(
                "sandbox command cannot be empty".to_string(),
            ));
        }
        if !self.scratch_dir.is_absolute() {
            return Err(SandboxError::ConfigInvalid(format!(
                "scratch directory must be absolute: {}",
                self.scratch_dir.display()
            )));
        }
        if self.memory_limit_mb == 0 || self.max_pids == 0 {
            return Err(SandboxError::ConfigInvalid(
                "memory and pid limits must be non-zero".to_string(),
            ));
        }

        let mut args: Vec<String> = Vec::new();
        let mut push = |parts: &[&str]| args.extend(parts.iter().map(|s| s.to_string()));

        push(&["--mode", "o"]);
        push(&["--really_quiet"]);

        // Interactive mode must skip setsid(): a new session would detach
        // the child from the stdio pipes the frame protocol runs over.
        if self.repl_mode {
            push(&["--skip_setsid"]);
        }

        let time_limit = self.time_limit.map_or(0, |limit| limit.as_secs().max(1));
        push(&["--time_limit", &time_limit.to_string()]);

        // Per-process rlimits. Address space stays at "hard" because some
        // runtimes (Go in particular) reserve large virtual ranges.
        push(&["--rlimit_as", "hard"]);
        push(&["--rlimit_fsize", "100"]);
        push(&["--rlimit_nofile", "256"]);
        push(&["--rlimit_nproc", &self.max_pids.to_string()]);
        if let Some(cpu) = self.cpu_time_limit.or(self.time_limit) {
            push(&["--rlimit_cpu", &cpu.as_secs().max(1).to_string()]);
        }

        // Kernel-enforced limits for memory and process count.
        let mem_bytes = self.memory_limit_mb * 1024 * 1024;
        push(&["--cgroup_mem_max", &mem_bytes.to_string()]);
        push(&["--cgroup_pids_max", &self.max_pids.to_string()]);

        push(&["--disable_clone_newuser"]);
        if self.network {
            push(&["--disable_clone_newnet"]);
        } else {
            push(&["--iface_no_lo"]);
        }

        push(&["--hostname", "sandbox"]);
        push(&["--disable_proc"]);
        push(&["--seccomp_string", &self.seccomp_policy]);

        let scratch = self.scratch_dir.display();
        push(&["--bindmount", &format!("{scratch}:{DATA_MOUNT}")]);
        for bind in self.language.config().bind_paths {
            push(&["--bindmount_ro", bind]);
        }

        let tmpfs_bytes = u64::from(self.tmpfs_size_mb) * 1024 * 1024;
        push(&["--tmpfsmount", "/tmp"]);
        push(&["--tmpfs_size", &tmpfs_bytes.to_string()]);

        push(&["--cwd", DATA_MOUNT]);

        let uid = self.language.config().uid.to_string();
        push(&["--user", &uid]);
        push(&["--group", &uid]);

        for (key, value) in self.environment() {
            push(&["--env", &format!("{key}={value}")]);
        }

        push(&["--"]);
        args.extend(self.command.iter().cloned());

        Ok(args)
    }

    /// Spawns the isolation binary for this specification.
    ///
    /// The child gets piped stdin/stdout/stderr, its own process group
    /// (so the whole tree can be signalled), and is killed if the handle
    /// is dropped without being reaped.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` if the spec is bad, `SpawnFailed` if the binary
    /// could not be started.
    #[instrument(skip(self), fields(language = %self.language, repl = self.repl_mode))]
    pub fn spawn(&self, isolation_binary: &str) -> Result<Child, SandboxError> {
        let args = self.build_args()?;
        debug!(binary = isolation_binary, argc = args.len(), "Spawning isolation process");

        Command::new(isolation_binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::SpawnFailed {
                context: format!("{isolation_binary} for {}", self.language),
                source: e,
            })
    }
}

/// Looks up the isolation binary on PATH, mirroring `which`.
#[must_use]
pub fn resolve_binary(binary: &str) -> Option<PathBuf> {
    if binary.contains('/') {
        let path = Path::new(binary);
        return path.exists().then(|| path.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.exists())
}
