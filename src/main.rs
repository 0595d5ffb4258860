//! codebox - entry point.
//!
//! Wires all singletons explicitly at startup (no global lookup tables)
//! and hands them down: manager → pool → orchestrator → HTTP surface,
//! with the archivist and pool maintenance as background tasks.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

use codebox::config::Settings;
use codebox::exec::Orchestrator;
use codebox::files::FileStore;
use codebox::sandbox::{ReplLauncher, SandboxManager, SandboxPool};
use codebox::server::{self, AppState};
use codebox::state::{Archivist, FsColdTier, MemoryHotTier, StateStore};
use codebox::system;

/// Multi-tenant sandboxed code-execution service.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address, overriding CODEBOX_BIND
    #[arg(long)]
    bind: Option<String>,

    /// Skip the startup environment checks
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("codebox v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::from_env().into_diagnostic()?;
    if let Some(bind) = args.bind {
        settings.bind = bind;
    }

    if args.skip_checks {
        warn!("Skipping startup environment checks (--skip-checks)");
    } else {
        let report = system::check_all(&settings).into_diagnostic()?;
        info!(
            isolation_binary = %report.isolation_binary.display(),
            sandbox_dir = %report.sandbox_dir.display(),
            "Environment checks passed"
        );
    }

    // Explicit wiring, leaves first.
    let manager = Arc::new(SandboxManager::new(settings.clone()));
    let launcher = Arc::new(ReplLauncher::new(
        Arc::clone(&manager),
        settings.warmup_timeout,
    ));
    let pool = SandboxPool::new(launcher, Arc::clone(&manager), settings.clone());

    let hot = Arc::new(MemoryHotTier::new());
    let cold = Arc::new(FsColdTier::new(settings.file_bucket.join("state")));
    let state_store = Arc::new(StateStore::new(
        hot.clone(),
        cold.clone(),
        settings.hot_ttl,
        settings.session_meta_ttl,
        settings.max_snapshot_bytes,
    ));
    let files = Arc::new(FileStore::new(settings.file_bucket.join("uploads")));

    let orchestrator = Arc::new(Orchestrator::new(
        pool.clone(),
        Arc::clone(&state_store),
        Arc::clone(&files),
        settings.clone(),
    ));

    let ready = pool.warmup().await;
    info!(ready, target = settings.pool_target, "Sandbox pool warmed");

    let maintenance = pool.start_maintenance();
    let archivist = Arc::new(Archivist::new(
        hot,
        cold,
        settings.archive_after_idle,
        settings.archive_scan_interval,
        settings.cold_ttl,
    ))
    .spawn();

    let state = AppState {
        orchestrator,
        pool: pool.clone(),
        state_store,
        files,
        settings,
        started_at: Instant::now(),
    };
    let result = server::run(state).await;

    // Orderly teardown: stop background work, then destroy the population.
    archivist.abort();
    maintenance.abort();
    pool.shutdown().await;
    info!("codebox stopped");

    result.into_diagnostic()
}
