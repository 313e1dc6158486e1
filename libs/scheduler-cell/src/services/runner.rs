use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use shared_database::locks::{DistributedLock, LockLease};
use shared_models::AppError;

use crate::models::JobOutcome;
use crate::SchedulerError;

const MIN_RENEW_EVERY: Duration = Duration::from_millis(10);

/// Runs named jobs at most once at a time across all processes.
pub struct JobRunner {
    lock: Arc<dyn DistributedLock>,
    ttl: Duration,
}

impl JobRunner {
    pub fn new(lock: Arc<dyn DistributedLock>, ttl: Duration) -> Self {
        Self { lock, ttl }
    }

    /// Run `job` under lock `job:<name>`. An invocation that finds the lock
    /// held is skipped, not retried. The lease is renewed every third of its
    /// TTL for as long as the job runs.
    #[instrument(skip(self, job))]
    pub async fn run_singleton<T, F, Fut>(&self, name: &str, job: F) -> Result<JobOutcome<T>, SchedulerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let key = format!("job:{}", name);

        let lease = self
            .lock
            .try_acquire(&key, self.ttl)
            .await
            .map_err(|e| SchedulerError::Lock(format!("{}: {}", key, e)))?;
        let Some(lease) = lease else {
            info!("Job {} is already running elsewhere, skipping", name);
            return Ok(JobOutcome::Skipped);
        };

        let result = self.renewing(&lease, job()).await;

        if let Err(e) = self.lock.release(&lease).await {
            warn!("Failed to release job lock {}: {}", key, e);
        }

        Ok(JobOutcome::Completed(result?))
    }

    async fn renewing<T, Fut>(&self, lease: &LockLease, job: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let every = (self.ttl / 3).max(MIN_RENEW_EVERY);
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(job);
        loop {
            tokio::select! {
                result = &mut job => return result,
                _ = renew.tick() => match self.lock.extend(lease, self.ttl).await {
                    Ok(true) => debug!("Renewed job lock {}", lease.key),
                    Ok(false) => warn!("Job lock {} expired while the job was running", lease.key),
                    Err(e) => warn!("Failed to renew job lock {}: {}", lease.key, e),
                },
            }
        }
    }
}
