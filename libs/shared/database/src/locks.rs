use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::supabase::SupabaseClient;

pub const DEFAULT_LOCK_ATTEMPTS: u32 = 3;

/// One successful acquisition. Only the lease that took a lock can extend or
/// release it; a lease whose lock expired and was retaken is inert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub token: String,
}

impl LockLease {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            token: Uuid::new_v4().to_string(),
        }
    }
}

/// Named mutual exclusion shared by every process touching a teacher's calendar.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Returns `None` when another holder owns an unexpired lock.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>>;

    /// Push the lease's expiry to `ttl` from now. `false` means the lease was
    /// already lost.
    async fn extend(&self, lease: &LockLease, ttl: Duration) -> Result<bool>;

    /// Drop the lock if `lease` still holds it.
    async fn release(&self, lease: &LockLease) -> Result<()>;
}

/// Acquire `key`, backing off `100ms * attempt` between tries.
pub async fn acquire_with_retry(
    lock: &dyn DistributedLock,
    key: &str,
    ttl: Duration,
    max_attempts: u32,
) -> Result<Option<LockLease>> {
    for attempt in 1..=max_attempts.max(1) {
        if let Some(lease) = lock.try_acquire(key, ttl).await? {
            return Ok(Some(lease));
        }

        if attempt < max_attempts {
            warn!("Lock {} busy, retrying attempt {}/{}", key, attempt, max_attempts);
            tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
        }
    }

    Ok(None)
}

/// In-process lock table for single-node runs and tests.
#[derive(Default)]
pub struct LocalLock {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>> {
        let mut held = self.held.lock().await;
        let now = Instant::now();

        match held.get(key) {
            Some((_, expires_at)) if *expires_at > now => Ok(None),
            _ => {
                let lease = LockLease::new(key);
                held.insert(key.to_string(), (lease.token.clone(), now + ttl));
                debug!("Local lock acquired: {}", key);
                Ok(Some(lease))
            }
        }
    }

    async fn extend(&self, lease: &LockLease, ttl: Duration) -> Result<bool> {
        let mut held = self.held.lock().await;
        let now = Instant::now();

        match held.get_mut(&lease.key) {
            Some((token, expires_at)) if *token == lease.token && *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<()> {
        let mut held = self.held.lock().await;

        if matches!(held.get(&lease.key), Some((token, _)) if *token == lease.token) {
            held.remove(&lease.key);
            debug!("Local lock released: {}", lease.key);
        } else {
            debug!("Local lock {} was no longer ours", lease.key);
        }
        Ok(())
    }
}

/// Lock rows in the `scheduling_locks` table; the primary key on `lock_key`
/// makes the insert the acquisition. The `owner` column carries the lease
/// token.
pub struct SupabaseLock {
    supabase: Arc<SupabaseClient>,
    owner: String,
}

impl SupabaseLock {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self {
            supabase,
            owner: format!("scheduler_{}", Uuid::new_v4().simple()),
        }
    }

    fn new_lease(&self, key: &str) -> LockLease {
        LockLease {
            key: key.to_string(),
            token: format!("{}_{}", self.owner, Uuid::new_v4().simple()),
        }
    }

    fn lock_row(lease: &LockLease, ttl: Duration) -> Result<Value> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl)?;

        Ok(json!({
            "lock_key": lease.key,
            "owner": lease.token,
            "acquired_at": now.to_rfc3339(),
            "expires_at": expires_at.to_rfc3339(),
        }))
    }

    fn lease_path(lease: &LockLease) -> String {
        format!(
            "/rest/v1/scheduling_locks?lock_key=eq.{}&owner=eq.{}",
            lease.key, lease.token,
        )
    }

    async fn purge_expired(&self, key: &str) -> Result<bool> {
        let path = format!(
            "/rest/v1/scheduling_locks?lock_key=eq.{}&expires_at=lt.{}",
            key,
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        );

        let removed: Option<Vec<Value>> = self.supabase.request_with_headers(
            Method::DELETE,
            &path,
            None,
            None,
            Some(SupabaseClient::return_representation()),
        ).await?;

        Ok(removed.map(|rows| !rows.is_empty()).unwrap_or(false))
    }
}

#[async_trait]
impl DistributedLock for SupabaseLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>> {
        let path = "/rest/v1/scheduling_locks";
        let lease = self.new_lease(key);

        if self.supabase.insert_unique(path, Self::lock_row(&lease, ttl)?).await? {
            debug!("Scheduling lock acquired: {}", key);
            return Ok(Some(lease));
        }

        // A crashed holder leaves its row behind until it expires.
        if self.purge_expired(key).await? {
            let acquired = self.supabase.insert_unique(path, Self::lock_row(&lease, ttl)?).await?;
            debug!("Scheduling lock {} after expiry cleanup: {}", key, acquired);
            return Ok(acquired.then_some(lease));
        }

        Ok(None)
    }

    async fn extend(&self, lease: &LockLease, ttl: Duration) -> Result<bool> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl)?;
        let updated: Option<Vec<Value>> = self.supabase.request_with_headers(
            Method::PATCH,
            &Self::lease_path(lease),
            None,
            Some(json!({ "expires_at": expires_at.to_rfc3339() })),
            Some(SupabaseClient::return_representation()),
        ).await?;

        Ok(updated.map(|rows| !rows.is_empty()).unwrap_or(false))
    }

    async fn release(&self, lease: &LockLease) -> Result<()> {
        let _: Value = self.supabase.request(Method::DELETE, &Self::lease_path(lease), None, None).await?;

        debug!("Scheduling lock released: {}", lease.key);
        Ok(())
    }
}
