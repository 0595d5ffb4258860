//! Startup environment checks.
//!
//! Verifies the pieces the service cannot run without: the isolation
//! binary on PATH and writable working directories. Run once at startup
//! before any sandbox is launched.

use std::path::Path;

use crate::config::Settings;
use crate::error::ConfigError;
use crate::sandbox;

/// Results of the startup checks.
#[derive(Debug, Clone)]
pub struct StartupReport {
    /// Resolved path of the isolation binary.
    pub isolation_binary: std::path::PathBuf,
    pub sandbox_dir: std::path::PathBuf,
    pub file_bucket: std::path::PathBuf,
}

/// Checks the runtime environment, creating the working directories.
///
/// # Errors
///
/// Returns the first failing requirement.
pub fn check_all(settings: &Settings) -> Result<StartupReport, ConfigError> {
    let isolation_binary = sandbox::resolve_binary(&settings.isolation_binary)
        .ok_or_else(|| ConfigError::IsolationBinaryMissing {
            binary: settings.isolation_binary.clone(),
        })?;

    ensure_writable_dir(&settings.sandbox_base_dir)?;
    ensure_writable_dir(&settings.file_bucket)?;

    Ok(StartupReport {
        isolation_binary,
        sandbox_dir: settings.sandbox_base_dir.clone(),
        file_bucket: settings.file_bucket.clone(),
    })
}

fn ensure_writable_dir(path: &Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(path).map_err(|e| ConfigError::DirectoryUnusable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    // Probe an actual write; read-only mounts pass create_dir_all.
    let probe = path.join(".codebox-write-probe");
    std::fs::write(&probe, b"probe").map_err(|e| ConfigError::DirectoryUnusable {
        path: path.display().to_string(),
        reason: format!("not writable: {e}"),
    })?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_check_all_with_usable_environment() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::new()
            .with_isolation_binary("sh")
            .with_sandbox_base_dir(dir.path().join("sandboxes"))
            .with_file_bucket(dir.path().join("files"));

        let report = check_all(&settings).unwrap();
        assert!(report.isolation_binary.exists());
        assert!(report.sandbox_dir.is_dir());
        assert!(report.file_bucket.is_dir());
    }

    #[test]
    fn test_missing_binary_is_reported() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::new()
            .with_isolation_binary("codebox-definitely-not-a-binary")
            .with_sandbox_base_dir(dir.path());

        let err = check_all(&settings).unwrap_err();
        assert!(matches!(err, ConfigError::IsolationBinaryMissing { .. }));
    }
}
