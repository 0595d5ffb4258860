//! codebox - multi-tenant sandboxed code-execution service.
//!
//! Clients submit source code in one of twelve languages and get back
//! stdout, stderr, exit status, produced files, and (for the interactive
//! language) a persistable session namespace. Execution happens inside
//! process-level sandboxes driven through an external isolation binary.
//!
//! # Architecture
//!
//! - [`sandbox`] - isolation driver, lifecycle manager, pre-warmed pool
//! - [`exec`] - frame protocol, REPL and one-shot executors, orchestrator
//! - [`state`] - two-tier snapshot persistence with a background archivist
//! - [`files`] - upload/download bucket the executor consumes
//! - [`server`] - the HTTP surface
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use codebox::config::Settings;
//! use codebox::sandbox::{ReplLauncher, SandboxManager, SandboxPool};
//!
//! # async fn wire() {
//! let settings = Settings::from_env().unwrap();
//! let manager = Arc::new(SandboxManager::new(settings.clone()));
//! let launcher = Arc::new(ReplLauncher::new(manager.clone(), settings.warmup_timeout));
//! let pool = SandboxPool::new(launcher, manager, settings);
//! pool.warmup().await;
//! # }
//! ```

pub mod config;
pub mod error;
pub mod exec;
pub mod files;
pub mod languages;
pub mod sandbox;
pub mod server;
pub mod state;
pub mod system;

pub use error::{Error, Result};
pub use languages::Language;
