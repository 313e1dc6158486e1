use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::Script;
use tracing::{debug, info};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::locks::{DistributedLock, LockLease};

use crate::SchedulerError;

/// Deletes the key only while it still carries the lease token; an expired
/// lease cannot release the next holder's lock.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Lock table shared by every scheduler process through Redis.
pub struct RedisLock {
    pool: Pool,
    owner: String,
}

impl RedisLock {
    pub async fn new(config: &AppConfig) -> Result<Self, SchedulerError> {
        let redis_url = config
            .redis_url
            .clone()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| SchedulerError::Pool(format!("Failed to create Redis pool: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| SchedulerError::Pool(format!("Failed to connect to Redis: {}", e)))?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis scheduling lock initialized");

        Ok(Self {
            pool,
            owner: Uuid::new_v4().simple().to_string(),
        })
    }

    async fn connection(&self) -> Result<Connection> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>> {
        let mut conn = self.connection().await?;
        let lease = LockLease {
            key: key.to_string(),
            token: format!("{}:{}", self.owner, Uuid::new_v4().simple()),
        };

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        debug!("Redis lock {} acquired: {}", key, reply.is_some());
        Ok(reply.map(|_| lease))
    }

    async fn extend(&self, lease: &LockLease, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;

        let extended: i32 = Script::new(EXTEND_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok(extended == 1)
    }

    async fn release(&self, lease: &LockLease) -> Result<()> {
        let mut conn = self.connection().await?;

        let removed: i32 = Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            debug!("Redis lock {} was no longer ours", lease.key);
        }
        Ok(())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}
