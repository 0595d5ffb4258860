//! Sandbox engine: isolation driver, lifecycle manager, and pre-warmed pool.
//!
//! A [`Sandbox`] is an isolated process tree plus a private scratch
//! directory. Interactive sandboxes carry a running interpreter server
//! reachable over stdio; one-shot sandboxes are a scratch directory into
//! which the executor spawns per-invocation isolation processes.
//!
//! Ownership model: the pool owns a sandbox while it is `Warming` or
//! `Ready`; acquisition transfers ownership to the caller, which must end
//! it with destruction. Sandboxes are never reused across requests.

mod isolation;
mod manager;
mod pool;

pub use isolation::{resolve_binary, IsolationSpec};
pub use manager::{SandboxManager, SandboxPaths};
pub use pool::{PoolStats, PoolStatus, ReplLauncher, SandboxLauncher, SandboxPool};

use std::time::Instant;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout};

use crate::languages::Language;

/// The interpreter server script staged into interactive sandboxes.
pub const REPL_SERVER_SOURCE: &str = include_str!("repl_server.py");

/// File name the interpreter server is staged under, inside the hidden
/// build directory of the scratch mount.
pub const REPL_SERVER_FILE: &str = "repl_server.py";

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Launched, interpreter warmup not yet confirmed.
    Warming,
    /// Warm and waiting in the pool.
    Ready,
    /// Handed to a request; exactly one request ever holds it.
    InUse,
    /// Process reaped and scratch removed. Terminal.
    Destroyed,
}

/// Stdio session with the in-sandbox interpreter server.
#[derive(Debug)]
pub struct ReplProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: BufReader<ChildStdout>,
}

impl ReplProcess {
    /// True while the interpreter process has not exited.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// Handle for one isolated execution environment.
#[derive(Debug)]
pub struct Sandbox {
    /// Opaque identifier, unique for the lifetime of the service.
    pub id: String,
    pub language: Language,
    pub paths: SandboxPaths,
    pub created_at: Instant,
    pub state: SandboxState,
    /// Running interpreter server, present only for interactive sandboxes.
    pub process: Option<ReplProcess>,
}

impl Sandbox {
    /// Age since launch, used for TTL eviction.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}
