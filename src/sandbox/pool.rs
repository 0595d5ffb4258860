//! Pre-warmed sandbox pool.
//!
//! The pool keeps a configured population of warm interactive sandboxes so
//! acquisition completes in single-digit milliseconds. Sandboxes are
//! single-use: release destroys them and replenishment is asynchronous.
//! Acquirers contending on an empty pool are served strictly FIFO.
//!
//! Locking: one mutex guards the ready queue, the warming counter, and the
//! waiter queue; it is never held across an await. Launchers run as
//! detached tasks outside the critical section and retry failed launches
//! with capped exponential backoff.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::config::Settings;
use crate::error::{Error, PoolError, SandboxError};
use crate::exec::protocol;
use crate::languages::Language;
use crate::sandbox::{Sandbox, SandboxManager, SandboxState};

/// First retry delay after a failed launch.
const RETRY_BASE: Duration = Duration::from_millis(500);
/// Ceiling for the launch retry backoff.
const RETRY_CAP: Duration = Duration::from_secs(30);

/// Launches one warm sandbox. Seam for tests; production uses
/// [`ReplLauncher`].
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    async fn launch(&self, id: String) -> Result<Sandbox, SandboxError>;
}

/// Production launcher: interactive sandbox with a warmed interpreter.
pub struct ReplLauncher {
    manager: Arc<SandboxManager>,
    warmup_timeout: Duration,
}

impl ReplLauncher {
    #[must_use]
    pub fn new(manager: Arc<SandboxManager>, warmup_timeout: Duration) -> Self {
        Self {
            manager,
            warmup_timeout,
        }
    }
}

#[async_trait]
impl SandboxLauncher for ReplLauncher {
    async fn launch(&self, id: String) -> Result<Sandbox, SandboxError> {
        let mut sandbox = self.manager.create(id, Language::Python, true).await?;
        if let Err(e) = self.manager.wait_ready(&mut sandbox, self.warmup_timeout).await {
            self.manager.destroy(&mut sandbox).await;
            return Err(e);
        }
        Ok(sandbox)
    }
}

/// Counters exposed through the detailed health endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PoolStats {
    /// Acquisitions served straight from the warm queue.
    pub hits: u64,
    /// Acquisitions that found the queue empty and waited for a launch.
    pub misses: u64,
    pub exhausted: u64,
    pub fresh_oneshot: u64,
    pub evicted: u64,
    pub launch_failures: u64,
    pub probe_failures: u64,
    /// Running average time from acquire entry to sandbox hand-off.
    pub avg_acquire_micros: u64,
}

impl PoolStats {
    fn record_acquire(&mut self, hit: bool, micros: u64) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        let n = self.hits + self.misses;
        self.avg_acquire_micros = (self.avg_acquire_micros * (n - 1) + micros) / n;
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub ready: usize,
    pub warming: usize,
    pub target: usize,
    pub stats: PoolStats,
}

struct PoolShared {
    ready: VecDeque<Sandbox>,
    warming: usize,
    waiters: VecDeque<oneshot::Sender<Sandbox>>,
    next_id: u64,
    shutdown: bool,
    stats: PoolStats,
}

struct PoolInner {
    launcher: Arc<dyn SandboxLauncher>,
    manager: Arc<SandboxManager>,
    settings: Settings,
    shared: Mutex<PoolShared>,
}

/// Thread-safe, clonable handle to the pool.
#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl SandboxPool {
    #[must_use]
    pub fn new(
        launcher: Arc<dyn SandboxLauncher>,
        manager: Arc<SandboxManager>,
        settings: Settings,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                launcher,
                manager,
                settings,
                shared: Mutex::new(PoolShared {
                    ready: VecDeque::new(),
                    warming: 0,
                    waiters: VecDeque::new(),
                    next_id: 0,
                    shutdown: false,
                    stats: PoolStats::default(),
                }),
            }),
        }
    }

    /// Acquires a sandbox for `language`.
    ///
    /// The interactive language pops a Ready sandbox, or blocks FIFO until
    /// one arrives or the acquisition budget expires (`PoolExhausted`).
    /// Any other language gets a freshly constructed one-shot sandbox.
    #[instrument(skip(self), fields(%language))]
    pub async fn acquire(&self, language: Language) -> Result<Sandbox, Error> {
        if !language.is_interactive() {
            let id = self.inner.allocate_id(language);
            let mut sandbox = self.inner.manager.create(id, language, false).await?;
            sandbox.state = SandboxState::InUse;
            self.inner.lock().stats.fresh_oneshot += 1;
            return Ok(sandbox);
        }

        let start = Instant::now();

        // Pop from the warm queue, probing health. A failed probe destroys
        // the sandbox and retries once before falling back to waiting.
        let mut probe_failures = 0;
        while probe_failures < 2 {
            let candidate = {
                let mut shared = self.inner.lock();
                if shared.shutdown {
                    return Err(PoolError::ShuttingDown.into());
                }
                shared.ready.pop_front()
            };
            let Some(mut sandbox) = candidate else { break };
            self.inner.spawn_launchers();

            if self.probe(&mut sandbox).await {
                sandbox.state = SandboxState::InUse;
                let acquire_us = start.elapsed().as_micros() as u64;
                let mut shared = self.inner.lock();
                shared.stats.record_acquire(true, acquire_us);
                debug!(
                    sandbox_id = %sandbox.id,
                    acquire_us,
                    "Acquired warm sandbox"
                );
                return Ok(sandbox);
            }

            probe_failures += 1;
            warn!(sandbox_id = %sandbox.id, "Liveness probe failed, destroying sandbox");
            self.inner.lock().stats.probe_failures += 1;
            self.inner.manager.destroy(&mut sandbox).await;
        }

        // Queue behind earlier acquirers and wait for a launcher delivery.
        let (tx, rx) = oneshot::channel();
        {
            let mut shared = self.inner.lock();
            if shared.shutdown {
                return Err(PoolError::ShuttingDown.into());
            }
            shared.waiters.push_back(tx);
        }
        self.inner.spawn_launchers();

        match timeout(self.inner.settings.pool_acquire_timeout, rx).await {
            Ok(Ok(mut sandbox)) => {
                sandbox.state = SandboxState::InUse;
                let acquire_us = start.elapsed().as_micros() as u64;
                self.inner.lock().stats.record_acquire(false, acquire_us);
                debug!(
                    sandbox_id = %sandbox.id,
                    waited_ms = %start.elapsed().as_millis(),
                    "Acquired sandbox after waiting"
                );
                Ok(sandbox)
            }
            Ok(Err(_)) => Err(PoolError::ShuttingDown.into()),
            Err(_) => {
                self.inner.lock().stats.exhausted += 1;
                Err(PoolError::Exhausted {
                    language: language.as_tag().to_string(),
                    waited_ms: start.elapsed().as_millis() as u64,
                }
                .into())
            }
        }
    }

    /// Destroys a used sandbox and schedules replenishment. Sandboxes are
    /// never returned to the queue.
    pub async fn release(&self, mut sandbox: Sandbox) {
        self.inner.manager.destroy(&mut sandbox).await;
        self.inner.spawn_launchers();
    }

    /// Launches sandboxes up to the target in bounded parallel, waiting up
    /// to the warmup budget for the population to fill. Returns the number
    /// Ready at the end; partial warmup is not an error.
    pub async fn warmup(&self) -> usize {
        self.inner.spawn_launchers();
        let deadline = Instant::now() + self.inner.settings.warmup_timeout;
        loop {
            let (ready, warming) = {
                let shared = self.inner.lock();
                (shared.ready.len(), shared.warming)
            };
            if ready >= self.inner.settings.pool_target || Instant::now() >= deadline {
                info!(ready, warming, target = self.inner.settings.pool_target, "Pool warmup finished");
                return ready;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Spawns the periodic maintenance task: TTL eviction + replenishment.
    #[must_use]
    pub fn start_maintenance(&self) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let interval = pool.inner.settings.pool_maintenance_interval;
            loop {
                sleep(interval).await;
                if pool.inner.lock().shutdown {
                    return;
                }
                pool.evict_expired().await;
                pool.inner.spawn_launchers();
            }
        })
    }

    /// Destroys Ready sandboxes older than the configured TTL.
    pub async fn evict_expired(&self) {
        let ttl = self.inner.settings.sandbox_ttl;
        let expired: Vec<Sandbox> = {
            let mut shared = self.inner.lock();
            let drained = std::mem::take(&mut shared.ready);
            let (old, keep): (Vec<Sandbox>, Vec<Sandbox>) = drained
                .into_iter()
                .partition(|sandbox| sandbox.age() > ttl);
            shared.ready = keep.into();
            shared.stats.evicted += old.len() as u64;
            old
        };
        for mut sandbox in expired {
            debug!(sandbox_id = %sandbox.id, "Evicting sandbox past TTL");
            self.inner.manager.destroy(&mut sandbox).await;
        }
    }

    /// Stops replenishment and destroys all Ready sandboxes. Pending
    /// waiters are failed with `ShuttingDown`.
    pub async fn shutdown(&self) {
        let (ready, waiters) = {
            let mut shared = self.inner.lock();
            shared.shutdown = true;
            (
                std::mem::take(&mut shared.ready),
                std::mem::take(&mut shared.waiters),
            )
        };
        drop(waiters);
        for mut sandbox in ready {
            self.inner.manager.destroy(&mut sandbox).await;
        }
        info!("Sandbox pool shut down");
    }

    /// Current utilization and counters.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let shared = self.inner.lock();
        PoolStatus {
            ready: shared.ready.len(),
            warming: shared.warming,
            target: self.inner.settings.pool_target,
            stats: shared.stats.clone(),
        }
    }

    /// Allocates a pool-unique sandbox identifier.
    #[must_use]
    pub fn allocate_id(&self, language: Language) -> String {
        self.inner.allocate_id(language)
    }

    /// Cheap liveness check: the interpreter process must still be running
    /// and, when the probe budget is non-zero, answer a no-op frame.
    async fn probe(&self, sandbox: &mut Sandbox) -> bool {
        let Some(repl) = sandbox.process.as_mut() else {
            return true;
        };
        if !repl.is_alive() {
            return false;
        }
        let budget = self.inner.settings.health_check_timeout;
        if budget.is_zero() {
            return true;
        }
        protocol::ping(repl, budget).await
    }
}

impl PoolInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolShared> {
        // A poisoned pool mutex means a panic while holding it; the pool
        // accounting is unrecoverable at that point.
        #[allow(clippy::expect_used)]
        let guard = self.shared.lock().expect("pool mutex poisoned");
        guard
    }

    fn allocate_id(self: &Arc<Self>, language: Language) -> String {
        let mut shared = self.lock();
        shared.next_id += 1;
        format!("{}-{:06}", language.as_tag(), shared.next_id)
    }

    /// Starts one launcher per missing slot, bounded by the configured
    /// parallelism. No-op when the pool is full or shutting down.
    fn spawn_launchers(self: &Arc<Self>) {
        let to_launch = {
            let mut shared = self.lock();
            if shared.shutdown {
                0
            } else {
                let missing = self
                    .settings
                    .pool_target
                    .saturating_sub(shared.ready.len() + shared.warming);
                let slots = self
                    .settings
                    .launch_parallelism
                    .saturating_sub(shared.warming);
                let n = missing.min(slots);
                shared.warming += n;
                n
            }
        };

        for _ in 0..to_launch {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                inner.run_launcher().await;
            });
        }
    }

    /// One launcher: retries with capped exponential backoff until it
    /// delivers a warm sandbox or the pool shuts down.
    async fn run_launcher(self: Arc<Self>) {
        let mut delay = RETRY_BASE;
        loop {
            if self.lock().shutdown {
                self.lock().warming -= 1;
                return;
            }
            let id = {
                let mut shared = self.lock();
                shared.next_id += 1;
                format!("py-{:06}", shared.next_id)
            };
            match self.launcher.launch(id).await {
                Ok(sandbox) => {
                    self.deliver(sandbox).await;
                    // Delivery may have satisfied a waiter while more are
                    // queued; top the pool back up.
                    self.spawn_launchers();
                    return;
                }
                Err(e) => {
                    self.lock().stats.launch_failures += 1;
                    warn!(error = %e, retry_in_ms = %delay.as_millis(), "Sandbox launch failed");
                    sleep(delay).await;
                    delay = (delay * 2).min(RETRY_CAP);
                }
            }
        }
    }

    /// Hands a fresh sandbox to the oldest live waiter, or queues it Ready.
    async fn deliver(&self, mut sandbox: Sandbox) {
        let leftover = {
            let mut shared = self.lock();
            shared.warming = shared.warming.saturating_sub(1);
            if shared.shutdown {
                Some(sandbox)
            } else {
                loop {
                    match shared.waiters.pop_front() {
                        Some(tx) => match tx.send(sandbox) {
                            Ok(()) => break None,
                            // Waiter timed out and dropped its receiver.
                            Err(returned) => sandbox = returned,
                        },
                        None => {
                            sandbox.state = SandboxState::Ready;
                            shared.ready.push_back(sandbox);
                            break None;
                        }
                    }
                }
            }
        };
        if let Some(mut sandbox) = leftover {
            self.manager.destroy(&mut sandbox).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    use crate::sandbox::SandboxPaths;

    /// Launcher that fabricates process-less sandboxes after a fixed delay.
    struct StubLauncher {
        base: std::path::PathBuf,
        delay: Duration,
        launched: AtomicUsize,
        fail_first: AtomicUsize,
    }

    impl StubLauncher {
        fn new(base: &std::path::Path, delay: Duration) -> Self {
            Self {
                base: base.to_path_buf(),
                delay,
                launched: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            }
        }

        fn failing_first(self, n: usize) -> Self {
            self.fail_first.store(n, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl SandboxLauncher for StubLauncher {
        async fn launch(&self, id: String) -> Result<Sandbox, SandboxError> {
            sleep(self.delay).await;
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SandboxError::Unhealthy {
                    reason: "stubbed failure".to_string(),
                });
            }
            self.launched.fetch_add(1, Ordering::SeqCst);
            Ok(Sandbox {
                id,
                language: Language::Python,
                paths: SandboxPaths::new(&self.base, "stub"),
                created_at: Instant::now(),
                state: SandboxState::Ready,
                process: None,
            })
        }
    }

    fn pool_with(launcher: StubLauncher, settings: Settings) -> SandboxPool {
        let manager = Arc::new(SandboxManager::new(settings.clone()));
        SandboxPool::new(Arc::new(launcher), manager, settings)
    }

    fn fast_settings(base: &std::path::Path, target: usize) -> Settings {
        Settings::new()
            .with_sandbox_base_dir(base)
            .with_pool_target(target)
    }

    #[tokio::test]
    async fn test_warmup_fills_to_target() {
        let dir = TempDir::new().unwrap();
        let mut settings = fast_settings(dir.path(), 3);
        settings.warmup_timeout = Duration::from_secs(5);
        let pool = pool_with(
            StubLauncher::new(dir.path(), Duration::from_millis(10)),
            settings,
        );

        let ready = pool.warmup().await;
        assert_eq!(ready, 3);
        let status = pool.status();
        assert_eq!(status.ready, 3);
        assert_eq!(status.warming, 0);
    }

    #[tokio::test]
    async fn test_acquire_hits_warm_queue_and_replenishes() {
        let dir = TempDir::new().unwrap();
        let mut settings = fast_settings(dir.path(), 2);
        settings.warmup_timeout = Duration::from_secs(5);
        let pool = pool_with(
            StubLauncher::new(dir.path(), Duration::from_millis(5)),
            settings,
        );
        pool.warmup().await;

        let sandbox = pool.acquire(Language::Python).await.unwrap();
        assert_eq!(sandbox.state, SandboxState::InUse);
        let stats = pool.status().stats;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);

        // replenishment restores the target population
        sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.status().ready, 2);

        pool.release(sandbox).await;
    }

    #[tokio::test]
    async fn test_single_use_no_requeue() {
        let dir = TempDir::new().unwrap();
        let mut settings = fast_settings(dir.path(), 1);
        settings.warmup_timeout = Duration::from_secs(5);
        let pool = pool_with(
            StubLauncher::new(dir.path(), Duration::from_millis(5)),
            settings,
        );
        pool.warmup().await;

        let first = pool.acquire(Language::Python).await.unwrap();
        let first_id = first.id.clone();
        pool.release(first).await;

        sleep(Duration::from_millis(100)).await;
        let second = pool.acquire(Language::Python).await.unwrap();
        assert_ne!(second.id, first_id);
        pool.release(second).await;
    }

    #[tokio::test]
    async fn test_waiters_served_fifo() {
        let dir = TempDir::new().unwrap();
        let mut settings = fast_settings(dir.path(), 1);
        settings.pool_acquire_timeout = Duration::from_secs(5);
        // Slow launcher so both acquirers must queue.
        let pool = pool_with(
            StubLauncher::new(dir.path(), Duration::from_millis(80)),
            settings,
        );

        let pool_a = pool.clone();
        let a = tokio::spawn(async move {
            let sandbox = pool_a.acquire(Language::Python).await.unwrap();
            (Instant::now(), sandbox)
        });
        sleep(Duration::from_millis(20)).await;
        let pool_b = pool.clone();
        let b = tokio::spawn(async move {
            let sandbox = pool_b.acquire(Language::Python).await.unwrap();
            (Instant::now(), sandbox)
        });

        let (done_a, sandbox_a) = a.await.unwrap();
        let (done_b, sandbox_b) = b.await.unwrap();
        assert!(done_a <= done_b, "earlier acquirer must be unblocked first");

        // both acquisitions waited on a launch and their latency is tracked
        let stats = pool.status().stats;
        assert_eq!(stats.misses, 2);
        assert!(stats.avg_acquire_micros > 0);

        pool.release(sandbox_a).await;
        pool.release(sandbox_b).await;
    }

    #[test]
    fn test_record_acquire_running_average() {
        let mut stats = PoolStats::default();
        stats.record_acquire(true, 100);
        stats.record_acquire(false, 300);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.avg_acquire_micros, 200);
    }

    #[tokio::test]
    async fn test_exhausted_when_no_capacity() {
        let dir = TempDir::new().unwrap();
        let mut settings = fast_settings(dir.path(), 0);
        settings.pool_acquire_timeout = Duration::from_millis(50);
        let pool = pool_with(
            StubLauncher::new(dir.path(), Duration::from_millis(5)),
            settings,
        );

        let err = pool.acquire(Language::Python).await.unwrap_err();
        assert!(matches!(err, Error::Pool(PoolError::Exhausted { .. })));
        assert_eq!(pool.status().stats.exhausted, 1);
    }

    #[tokio::test]
    async fn test_launch_failures_retry_until_success() {
        let dir = TempDir::new().unwrap();
        let mut settings = fast_settings(dir.path(), 1);
        settings.pool_acquire_timeout = Duration::from_secs(10);
        let pool = pool_with(
            StubLauncher::new(dir.path(), Duration::from_millis(1)).failing_first(2),
            settings,
        );

        let sandbox = pool.acquire(Language::Python).await.unwrap();
        assert!(pool.status().stats.launch_failures >= 2);
        pool.release(sandbox).await;
    }

    #[tokio::test]
    async fn test_oneshot_acquire_is_fresh() {
        let dir = TempDir::new().unwrap();
        let settings = fast_settings(dir.path(), 0);
        let pool = pool_with(
            StubLauncher::new(dir.path(), Duration::from_millis(1)),
            settings,
        );

        let sandbox = pool.acquire(Language::C).await.unwrap();
        assert_eq!(sandbox.language, Language::C);
        assert!(sandbox.process.is_none());
        assert!(sandbox.paths.exists());
        assert_eq!(pool.status().stats.fresh_oneshot, 1);
        pool.release(sandbox).await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters_and_new_acquires() {
        let dir = TempDir::new().unwrap();
        let mut settings = fast_settings(dir.path(), 1);
        settings.pool_acquire_timeout = Duration::from_secs(5);
        let pool = pool_with(
            StubLauncher::new(dir.path(), Duration::from_millis(200)),
            settings,
        );

        let pool_w = pool.clone();
        let waiter =
            tokio::spawn(async move { pool_w.acquire(Language::Python).await });
        sleep(Duration::from_millis(20)).await;
        pool.shutdown().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Pool(PoolError::ShuttingDown))));
        let late = pool.acquire(Language::Python).await;
        assert!(matches!(late, Err(Error::Pool(PoolError::ShuttingDown))));
    }

    #[tokio::test]
    async fn test_ttl_eviction() {
        let dir = TempDir::new().unwrap();
        let mut settings = fast_settings(dir.path(), 1);
        settings.sandbox_ttl = Duration::from_millis(10);
        settings.warmup_timeout = Duration::from_secs(5);
        let pool = pool_with(
            StubLauncher::new(dir.path(), Duration::from_millis(1)),
            settings,
        );
        pool.warmup().await;
        assert_eq!(pool.status().ready, 1);

        sleep(Duration::from_millis(30)).await;
        pool.evict_expired().await;
        assert_eq!(pool.status().stats.evicted, 1);
    }
}
