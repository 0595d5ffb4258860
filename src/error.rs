//! Error types for the codebox execution service.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//! Each subsystem gets its own enum; the top-level `Error` aggregates them so
//! callers can match on the domain without losing the underlying detail.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the service.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Configuration or startup-environment error
    #[error("Configuration error")]
    #[diagnostic(code(codebox::config))]
    Config(#[from] ConfigError),

    /// Sandbox pool error
    #[error("Sandbox pool error")]
    #[diagnostic(code(codebox::pool))]
    Pool(#[from] PoolError),

    /// Sandbox lifecycle error
    #[error("Sandbox error")]
    #[diagnostic(code(codebox::sandbox))]
    Sandbox(#[from] SandboxError),

    /// Execution error
    #[error("Execution error")]
    #[diagnostic(code(codebox::exec))]
    Exec(#[from] ExecError),

    /// State persistence error
    #[error("State store error")]
    #[diagnostic(code(codebox::state))]
    State(#[from] StateError),

    /// File store error
    #[error("File store error")]
    #[diagnostic(code(codebox::files))]
    File(#[from] FileError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(codebox::io))]
    Io(#[from] std::io::Error),
}

/// Errors related to configuration and the startup environment.
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    /// A setting could not be parsed from the environment
    #[error("Invalid value for {name}: {reason}")]
    #[diagnostic(code(codebox::config::invalid))]
    Invalid { name: String, reason: String },

    /// The isolation binary is not on PATH
    #[error("Isolation binary not found: {binary}")]
    #[diagnostic(
        code(codebox::config::isolation_binary),
        help("Install the isolation tool or point CODEBOX_ISOLATION_BIN at it")
    )]
    IsolationBinaryMissing { binary: String },

    /// A required directory could not be created or written
    #[error("Directory not usable: {path}: {reason}")]
    #[diagnostic(code(codebox::config::directory))]
    DirectoryUnusable { path: String, reason: String },
}

/// Errors related to the pre-warmed sandbox pool.
#[derive(Error, Debug, Diagnostic)]
pub enum PoolError {
    /// No sandbox became available within the acquisition budget
    #[error("Pool exhausted for language {language}: no sandbox within {waited_ms} ms")]
    #[diagnostic(
        code(codebox::pool::exhausted),
        help("Raise CODEBOX_POOL_TARGET or retry later")
    )]
    Exhausted { language: String, waited_ms: u64 },

    /// The pool is shutting down and no longer hands out sandboxes
    #[error("Pool is shutting down")]
    #[diagnostic(code(codebox::pool::shutdown))]
    ShuttingDown,
}

/// Errors related to sandbox lifecycle operations.
#[derive(Error, Debug, Diagnostic)]
pub enum SandboxError {
    /// The isolation specification is invalid, no process was spawned
    #[error("Invalid sandbox specification: {0}")]
    #[diagnostic(code(codebox::sandbox::config))]
    ConfigInvalid(String),

    /// The isolation binary could not be spawned
    #[error("Failed to spawn isolation process: {context}")]
    #[diagnostic(code(codebox::sandbox::spawn))]
    SpawnFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Scratch directory allocation or staging failed
    #[error("Failed to create sandbox: {context}")]
    #[diagnostic(code(codebox::sandbox::creation))]
    CreationFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The sandbox did not come up healthy: warmup timeout, early exit,
    /// broken framing, or a failed liveness probe
    #[error("Sandbox unhealthy: {reason}")]
    #[diagnostic(code(codebox::sandbox::unhealthy))]
    Unhealthy { reason: String },
}

/// Errors surfaced by the execution path.
#[derive(Error, Debug, Diagnostic)]
pub enum ExecError {
    /// Request validation failed before any resource was touched
    #[error("Bad request: {reason}")]
    #[diagnostic(code(codebox::exec::bad_request))]
    BadRequest { reason: String },

    /// The wall-clock budget expired and the sandbox was killed
    #[error("Execution timed out after {limit_secs} seconds")]
    #[diagnostic(code(codebox::exec::timeout))]
    TimeoutExceeded { limit_secs: u64 },

    /// The sandbox misbehaved mid-conversation (EOF, malformed frame)
    #[error("Sandbox unhealthy during execution: {reason}")]
    #[diagnostic(code(codebox::exec::unhealthy))]
    SandboxUnhealthy { reason: String },

    /// Unclassified internal failure
    #[error("Internal execution error: {0}")]
    #[diagnostic(code(codebox::exec::internal))]
    Internal(String),
}

/// Errors related to snapshot persistence.
#[derive(Error, Debug, Diagnostic)]
pub enum StateError {
    /// The snapshot exceeds the configured maximum
    #[error("State snapshot too large: {size} bytes (limit {limit})")]
    #[diagnostic(
        code(codebox::state::too_large),
        help("Hold less data in session variables, or raise CODEBOX_MAX_SNAPSHOT_BYTES")
    )]
    TooLarge { size: usize, limit: usize },

    /// A storage tier is unreachable; callers degrade rather than fail
    #[error("{tier} tier unavailable: {reason}")]
    #[diagnostic(code(codebox::state::unavailable))]
    Unavailable { tier: &'static str, reason: String },
}

/// Errors related to the upload/download file store.
#[derive(Error, Debug, Diagnostic)]
pub enum FileError {
    /// The requested file does not exist
    #[error("File not found: {session_id}/{file_id}")]
    #[diagnostic(code(codebox::files::not_found))]
    NotFound { session_id: String, file_id: String },

    /// The supplied name or identifier is not acceptable
    #[error("Invalid file reference: {reason}")]
    #[diagnostic(code(codebox::files::invalid))]
    InvalidReference { reason: String },

    /// I/O error during store operations
    #[error("File store I/O error: {context}")]
    #[diagnostic(code(codebox::files::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
