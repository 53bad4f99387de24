//! Async executor
//!
//! Two acquisition loops, one for async continuations and one for due
//! timers. Each loop locks a batch of jobs, runs up to `max_concurrency` of
//! them at once and sleeps its wait time whenever a poll finds nothing.
//! A job that loses an optimistic-lock race is unlocked without using up a
//! retry.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{Job, JobKind};
use crate::engine::EngineContext;
use crate::error::{EngineError, Result};
use crate::persistence::StoreError;
use crate::runtime::{execute_job, record_job_failure, release_job};

/// Async executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncExecutorConfig {
    /// Pause of the async job loop after an empty poll
    #[serde(with = "duration_millis")]
    pub default_async_job_acquire_wait_time: Duration,

    /// Pause of the timer loop after an empty poll
    #[serde(with = "duration_millis")]
    pub default_timer_job_acquire_wait_time: Duration,

    /// Jobs locked per poll
    pub max_jobs_per_acquisition: usize,

    /// How long an acquired job stays locked
    #[serde(with = "duration_millis")]
    pub lock_time: Duration,

    /// Jobs executed at once per loop
    pub max_concurrency: usize,

    /// Lock owner written on acquired jobs (generated if not provided)
    pub lock_owner: String,

    /// Random share (0.0 to 1.0) added to or taken off the idle wait
    #[serde(default)]
    pub idle_jitter: f64,
}

impl Default for AsyncExecutorConfig {
    fn default() -> Self {
        Self {
            default_async_job_acquire_wait_time: Duration::from_millis(5000),
            default_timer_job_acquire_wait_time: Duration::from_millis(5000),
            max_jobs_per_acquisition: 10,
            lock_time: Duration::from_secs(5 * 60),
            max_concurrency: 8,
            lock_owner: format!("executor-{}", Uuid::now_v7()),
            idle_jitter: 0.0,
        }
    }
}

impl AsyncExecutorConfig {
    pub fn with_async_job_acquire_wait_time(mut self, wait: Duration) -> Self {
        self.default_async_job_acquire_wait_time = wait;
        self
    }

    pub fn with_timer_job_acquire_wait_time(mut self, wait: Duration) -> Self {
        self.default_timer_job_acquire_wait_time = wait;
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.max_jobs_per_acquisition = max.max(1);
        self
    }

    pub fn with_lock_time(mut self, lock_time: Duration) -> Self {
        self.lock_time = lock_time;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = owner.into();
        self
    }

    /// Spread idle waits by up to `share` of their length, e.g. 0.1 for ±10%
    pub fn with_idle_jitter(mut self, share: f64) -> Self {
        self.idle_jitter = share.clamp(0.0, 1.0);
        self
    }

    fn wait_time(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::AsyncContinuation => self.default_async_job_acquire_wait_time,
            JobKind::Timer => self.default_timer_job_acquire_wait_time,
        }
    }
}

/// Runs jobs in the background
pub struct AsyncExecutor {
    ctx: Arc<EngineContext>,
    config: AsyncExecutorConfig,
}

impl AsyncExecutor {
    pub(crate) fn new(ctx: Arc<EngineContext>, config: AsyncExecutorConfig) -> Self {
        Self { ctx, config }
    }

    /// Spawn both acquisition loops
    pub fn start(self) -> AsyncExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(
            lock_owner = %self.config.lock_owner,
            max_concurrency = self.config.max_concurrency,
            "Starting async executor"
        );
        self.ctx.executor_running.store(true, Ordering::Release);

        let handles = [JobKind::AsyncContinuation, JobKind::Timer]
            .into_iter()
            .map(|kind| {
                let ctx = Arc::clone(&self.ctx);
                let config = self.config.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(acquisition_loop(ctx, config, kind, shutdown_rx))
            })
            .collect();

        AsyncExecutorHandle {
            ctx: self.ctx,
            shutdown_tx,
            handles,
        }
    }

    /// Acquire and run one batch of `kind`; returns the number of jobs run
    pub async fn poll_once(&self, kind: JobKind) -> Result<usize> {
        poll_once(&self.ctx, &self.config, kind).await
    }
}

/// Handle to a running executor
pub struct AsyncExecutorHandle {
    ctx: Arc<EngineContext>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl AsyncExecutorHandle {
    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Stop both loops, letting in-flight jobs finish
    pub async fn shutdown(self) {
        info!("Stopping async executor");
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Async executor loop panicked: {}", e);
            }
        }
        self.ctx.executor_running.store(false, Ordering::Release);
        info!("Async executor stopped");
    }
}

async fn acquisition_loop(
    ctx: Arc<EngineContext>,
    config: AsyncExecutorConfig,
    kind: JobKind,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let wait = config.wait_time(kind);
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let found = match poll_once(&ctx, &config, kind).await {
            Ok(found) => found,
            Err(e) => {
                error!(%kind, "Job acquisition failed: {}", e);
                0
            }
        };

        if found == 0 {
            tokio::select! {
                _ = tokio::time::sleep(jittered(wait, config.idle_jitter)) => {}
                _ = shutdown_rx.changed() => {
                    debug!(%kind, "Acquisition loop: shutdown requested");
                    break;
                }
            }
        }
    }
    debug!(%kind, "Acquisition loop exited");
}

/// `wait` shifted by up to ±`share` of itself
fn jittered(wait: Duration, share: f64) -> Duration {
    let range = wait.as_secs_f64() * share;
    if range <= 0.0 {
        return wait;
    }
    let offset = rand::thread_rng().gen_range(-range..range);
    Duration::from_secs_f64((wait.as_secs_f64() + offset).max(0.0))
}

async fn poll_once(
    ctx: &Arc<EngineContext>,
    config: &AsyncExecutorConfig,
    kind: JobKind,
) -> Result<usize> {
    let now = ctx.now();
    let lock_time = chrono::Duration::from_std(config.lock_time)
        .unwrap_or_else(|_| chrono::Duration::minutes(5));
    let jobs = ctx
        .store
        .acquire_jobs(
            kind,
            now,
            &config.lock_owner,
            now + lock_time,
            config.max_jobs_per_acquisition,
        )
        .await?;

    let count = jobs.len();
    if count > 0 {
        debug!(%kind, count, "Acquired jobs");
    }
    futures::stream::iter(jobs)
        .for_each_concurrent(config.max_concurrency, |job| {
            let ctx = Arc::clone(ctx);
            async move {
                let _ = run_job(&ctx, job).await;
            }
        })
        .await;
    Ok(count)
}

/// Execute a job, recording the failure on the job if it fails
///
/// A concurrency conflict is not a failure of the activity: the job is
/// only unlocked.
pub(crate) async fn run_job(ctx: &EngineContext, job: Job) -> Result<()> {
    match execute_job(ctx, &job).await {
        Ok(()) => Ok(()),
        Err(err @ EngineError::Store(StoreError::ConcurrencyConflict { .. })) => {
            if let Err(store_err) = release_job(ctx, &job).await {
                error!(job_id = %job.id, "Failed to release job: {}", store_err);
            }
            Err(err)
        }
        Err(err) => {
            if let Err(store_err) = record_job_failure(ctx, &job, &err.to_string()).await {
                error!(job_id = %job.id, "Failed to record job failure: {}", store_err);
            }
            Err(err)
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_is_opt_in() {
        let wait = Duration::from_millis(5000);
        let config = AsyncExecutorConfig::default();
        assert_eq!(config.idle_jitter, 0.0);
        assert_eq!(jittered(wait, config.idle_jitter), wait);

        let share = AsyncExecutorConfig::default().with_idle_jitter(0.1).idle_jitter;
        for _ in 0..100 {
            let slept = jittered(wait, share);
            assert!(slept >= Duration::from_millis(4500) && slept <= Duration::from_millis(5500));
        }
        assert_eq!(jittered(Duration::ZERO, share), Duration::ZERO);
    }

    #[test]
    fn test_default_config() {
        let config = AsyncExecutorConfig::default();
        assert_eq!(config.default_async_job_acquire_wait_time, Duration::from_millis(5000));
        assert_eq!(config.default_timer_job_acquire_wait_time, Duration::from_millis(5000));
        assert_eq!(config.max_jobs_per_acquisition, 10);
        assert_eq!(config.max_concurrency, 8);
        assert!(config.lock_owner.starts_with("executor-"));
    }

    #[test]
    fn test_builder_clamps_zero() {
        let config = AsyncExecutorConfig::default()
            .with_max_concurrency(0)
            .with_max_jobs_per_acquisition(0)
            .with_timer_job_acquire_wait_time(Duration::from_millis(250));
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.max_jobs_per_acquisition, 1);
        assert_eq!(config.wait_time(JobKind::Timer), Duration::from_millis(250));
        assert_eq!(config.wait_time(JobKind::AsyncContinuation), Duration::from_millis(5000));
    }

    #[test]
    fn test_config_serializes_millis() {
        let config = AsyncExecutorConfig::default().with_lock_owner("node-1");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["default_async_job_acquire_wait_time"], 5000);
        assert_eq!(json["lock_time"], 300_000);
        let back: AsyncExecutorConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
