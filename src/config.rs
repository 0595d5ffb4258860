//! Service configuration.
//!
//! All settings are read from `CODEBOX_*` environment variables with
//! documented defaults; builder-style setters exist for programmatic
//! construction in tests.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Runtime configuration for the execution service.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path or name of the external isolation binary.
    pub isolation_binary: String,

    /// Base directory under which per-sandbox scratch directories are created.
    pub sandbox_base_dir: PathBuf,

    /// Size of the tmpfs mounted at /tmp inside each sandbox, in megabytes.
    pub tmpfs_size_mb: u32,

    /// Default memory limit per execution, in megabytes.
    pub memory_limit_mb: u64,

    /// Default wall-clock budget for a run step.
    pub time_limit: Duration,

    /// Wall-clock budget for a compile step (may exceed the run budget).
    pub compile_time_limit: Duration,

    /// Upper bound a request may ask for on time or memory.
    pub max_time_limit: Duration,
    pub max_memory_limit_mb: u64,

    /// Maximum accepted source size in bytes.
    pub max_code_bytes: usize,

    /// Target population of pre-warmed interactive sandboxes.
    pub pool_target: usize,

    /// How long an acquirer waits for a Ready sandbox before `PoolExhausted`.
    pub pool_acquire_timeout: Duration,

    /// Maximum concurrently running sandbox launchers.
    pub launch_parallelism: usize,

    /// Time budget for the interpreter server's warmup imports.
    pub warmup_timeout: Duration,

    /// Budget for the framed liveness probe on acquisition; zero disables it.
    pub health_check_timeout: Duration,

    /// Ready sandboxes older than this are evicted by pool maintenance.
    pub sandbox_ttl: Duration,

    /// Interval of the pool maintenance tick.
    pub pool_maintenance_interval: Duration,

    /// Hot-tier TTL for session snapshots.
    pub hot_ttl: Duration,

    /// Cold-tier TTL for archived snapshots.
    pub cold_ttl: Duration,

    /// TTL for session metadata documents.
    pub session_meta_ttl: Duration,

    /// Hot entries idle past this are moved to the cold tier.
    pub archive_after_idle: Duration,

    /// Interval of the archivist scan.
    pub archive_scan_interval: Duration,

    /// Maximum accepted snapshot size in bytes.
    pub max_snapshot_bytes: usize,

    /// Root of the upload/download file bucket.
    pub file_bucket: PathBuf,

    /// Caps on captured output.
    pub max_output_bytes: usize,
    pub max_output_files: usize,
    pub max_output_file_bytes: usize,

    /// HTTP bind address.
    pub bind: String,

    /// Maximum in-flight HTTP requests.
    pub max_inflight: usize,

    /// Whether a snapshot from a failed execution is persisted.
    pub capture_state_on_error: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            isolation_binary: String::from("nsjail"),
            sandbox_base_dir: PathBuf::from("/tmp/codebox/sandboxes"),
            tmpfs_size_mb: 64,
            memory_limit_mb: 512,
            time_limit: Duration::from_secs(30),
            compile_time_limit: Duration::from_secs(60),
            max_time_limit: Duration::from_secs(120),
            max_memory_limit_mb: 2048,
            max_code_bytes: 128 * 1024,
            pool_target: 4,
            pool_acquire_timeout: Duration::from_secs(10),
            launch_parallelism: 4,
            warmup_timeout: Duration::from_secs(20),
            health_check_timeout: Duration::from_secs(2),
            sandbox_ttl: Duration::from_secs(600),
            pool_maintenance_interval: Duration::from_secs(30),
            hot_ttl: Duration::from_secs(7200),
            cold_ttl: Duration::from_secs(86_400),
            session_meta_ttl: Duration::from_secs(86_400),
            archive_after_idle: Duration::from_secs(1800),
            archive_scan_interval: Duration::from_secs(300),
            max_snapshot_bytes: 16 * 1024 * 1024,
            file_bucket: PathBuf::from("/tmp/codebox/files"),
            max_output_bytes: 1024 * 1024,
            max_output_files: 20,
            max_output_file_bytes: 10 * 1024 * 1024,
            bind: String::from("0.0.0.0:8080"),
            max_inflight: 32,
            capture_state_on_error: false,
        }
    }
}

impl Settings {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the configuration from `CODEBOX_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Some(v) = read_env("CODEBOX_ISOLATION_BIN") {
            settings.isolation_binary = v;
        }
        if let Some(v) = read_env("CODEBOX_SANDBOX_DIR") {
            settings.sandbox_base_dir = PathBuf::from(v);
        }
        if let Some(v) = read_env("CODEBOX_FILE_BUCKET") {
            settings.file_bucket = PathBuf::from(v);
        }
        if let Some(v) = read_env("CODEBOX_BIND") {
            settings.bind = v;
        }

        settings.tmpfs_size_mb = parse_env("CODEBOX_TMPFS_MB", settings.tmpfs_size_mb)?;
        settings.memory_limit_mb = parse_env("CODEBOX_MEMORY_MB", settings.memory_limit_mb)?;
        settings.max_memory_limit_mb =
            parse_env("CODEBOX_MAX_MEMORY_MB", settings.max_memory_limit_mb)?;
        settings.max_code_bytes = parse_env("CODEBOX_MAX_CODE_BYTES", settings.max_code_bytes)?;
        settings.pool_target = parse_env("CODEBOX_POOL_TARGET", settings.pool_target)?;
        settings.launch_parallelism =
            parse_env("CODEBOX_LAUNCH_PARALLELISM", settings.pool_target.max(1))?;
        settings.max_snapshot_bytes =
            parse_env("CODEBOX_MAX_SNAPSHOT_BYTES", settings.max_snapshot_bytes)?;
        settings.max_output_bytes =
            parse_env("CODEBOX_MAX_OUTPUT_BYTES", settings.max_output_bytes)?;
        settings.max_output_files =
            parse_env("CODEBOX_MAX_OUTPUT_FILES", settings.max_output_files)?;
        settings.max_output_file_bytes =
            parse_env("CODEBOX_MAX_OUTPUT_FILE_BYTES", settings.max_output_file_bytes)?;
        settings.max_inflight = parse_env("CODEBOX_MAX_INFLIGHT", settings.max_inflight)?;
        settings.capture_state_on_error = parse_env(
            "CODEBOX_CAPTURE_STATE_ON_ERROR",
            settings.capture_state_on_error,
        )?;

        settings.time_limit = parse_secs("CODEBOX_TIME_LIMIT_SECS", settings.time_limit)?;
        settings.compile_time_limit =
            parse_secs("CODEBOX_COMPILE_LIMIT_SECS", settings.compile_time_limit)?;
        settings.max_time_limit = parse_secs("CODEBOX_MAX_TIME_LIMIT_SECS", settings.max_time_limit)?;
        settings.pool_acquire_timeout = parse_secs(
            "CODEBOX_POOL_ACQUIRE_TIMEOUT_SECS",
            settings.pool_acquire_timeout,
        )?;
        settings.warmup_timeout = parse_secs("CODEBOX_WARMUP_TIMEOUT_SECS", settings.warmup_timeout)?;
        settings.health_check_timeout =
            parse_secs("CODEBOX_HEALTH_TIMEOUT_SECS", settings.health_check_timeout)?;
        settings.sandbox_ttl = parse_secs("CODEBOX_SANDBOX_TTL_SECS", settings.sandbox_ttl)?;
        settings.pool_maintenance_interval = parse_secs(
            "CODEBOX_POOL_MAINTENANCE_SECS",
            settings.pool_maintenance_interval,
        )?;
        settings.hot_ttl = parse_secs("CODEBOX_HOT_TTL_SECS", settings.hot_ttl)?;
        settings.cold_ttl = parse_secs("CODEBOX_COLD_TTL_SECS", settings.cold_ttl)?;
        settings.session_meta_ttl =
            parse_secs("CODEBOX_SESSION_META_TTL_SECS", settings.session_meta_ttl)?;
        settings.archive_after_idle =
            parse_secs("CODEBOX_ARCHIVE_IDLE_SECS", settings.archive_after_idle)?;
        settings.archive_scan_interval =
            parse_secs("CODEBOX_ARCHIVE_SCAN_SECS", settings.archive_scan_interval)?;

        if settings.pool_target == 0 {
            tracing::warn!("CODEBOX_POOL_TARGET is 0; every interactive request will wait for a fresh sandbox");
        }

        Ok(settings)
    }

    /// Sets the sandbox base directory.
    #[must_use]
    pub fn with_sandbox_base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.sandbox_base_dir = path.into();
        self
    }

    /// Sets the isolation binary.
    #[must_use]
    pub fn with_isolation_binary(mut self, binary: impl Into<String>) -> Self {
        self.isolation_binary = binary.into();
        self
    }

    /// Sets the pre-warmed pool target.
    #[must_use]
    pub fn with_pool_target(mut self, target: usize) -> Self {
        self.pool_target = target;
        self
    }

    /// Sets the default execution time limit.
    #[must_use]
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    /// Sets the file bucket root.
    #[must_use]
    pub fn with_file_bucket(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_bucket = path.into();
        self
    }

    /// Sets the maximum snapshot size.
    #[must_use]
    pub fn with_max_snapshot_bytes(mut self, bytes: usize) -> Self {
        self.max_snapshot_bytes = bytes;
        self
    }
}

fn read_env(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match read_env(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            name: name.to_string(),
            reason: format!("cannot parse {raw:?}"),
        }),
        None => Ok(default),
    }
}

fn parse_secs(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_env(name, default.as_secs())?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.isolation_binary, "nsjail");
        assert_eq!(settings.pool_target, 4);
        assert_eq!(settings.hot_ttl, Duration::from_secs(7200));
        assert_eq!(settings.cold_ttl, Duration::from_secs(86_400));
        assert!(!settings.capture_state_on_error);
    }

    #[test]
    fn test_builder_chain() {
        let settings = Settings::new()
            .with_pool_target(2)
            .with_time_limit(Duration::from_secs(5))
            .with_isolation_binary("/usr/local/bin/nsjail")
            .with_max_snapshot_bytes(1024);

        assert_eq!(settings.pool_target, 2);
        assert_eq!(settings.time_limit, Duration::from_secs(5));
        assert_eq!(settings.isolation_binary, "/usr/local/bin/nsjail");
        assert_eq!(settings.max_snapshot_bytes, 1024);
    }
}
