//! Redis-backed lock registry.
//!
//! Each reservation is a single key with a TTL:
//!
//! - `{prefix}:queued:{fingerprint}` - held between submission and pickup
//! - `{prefix}:running:{fingerprint}` - held between pickup and terminal outcome
//!
//! Reservations use `SET NX PX` (one atomic test-and-set command), queries
//! use `EXISTS`, releases use `DEL`. Expiry is Redis's own TTL handling, so
//! a crashed worker's reservations clear themselves.

use std::sync::Arc;
use std::time::Duration;

use tallyforge_coordination::{Fingerprint, LockError, LockRegistry};

/// Default key prefix for lock entries.
const DEFAULT_KEY_PREFIX: &str = "tallyforge:jobs";

#[derive(Debug, Clone)]
pub struct RedisLockRegistry {
    client: Arc<redis::Client>,
    key_prefix: String,
}

impl RedisLockRegistry {
    /// Create a new Redis lock registry.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `key_prefix` - Key namespace (default: "tallyforge:jobs")
    pub fn new(
        redis_url: impl AsRef<str>,
        key_prefix: Option<String>,
    ) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            key_prefix: key_prefix.unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
        })
    }

    fn connection(&self) -> Result<redis::Connection, LockError> {
        self.client
            .get_connection()
            .map_err(|e| LockError::Unavailable(e.to_string()))
    }

    fn queued_key(&self, fingerprint: &Fingerprint) -> String {
        format!("{}:queued:{}", self.key_prefix, fingerprint)
    }

    fn running_key(&self, fingerprint: &Fingerprint) -> String {
        format!("{}:running:{}", self.key_prefix, fingerprint)
    }

    fn try_set(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection()?;

        // SET key 1 NX PX <ttl>: reserved only if the key was absent.
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query(&mut conn)
            .map_err(|e| LockError::Unavailable(format!("SET failed: {}", e)))?;

        Ok(reply.is_some())
    }

    fn delete(&self, key: &str) -> Result<(), LockError> {
        let mut conn = self.connection()?;

        let _: u64 = redis::cmd("DEL")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| LockError::Unavailable(format!("DEL failed: {}", e)))?;

        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.connection()?;

        let count: u64 = redis::cmd("EXISTS")
            .arg(key)
            .query(&mut conn)
            .map_err(|e| LockError::Unavailable(format!("EXISTS failed: {}", e)))?;

        Ok(count > 0)
    }
}

impl LockRegistry for RedisLockRegistry {
    fn try_reserve_queued(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        self.try_set(&self.queued_key(fingerprint), ttl)
    }

    fn release_queued(&self, fingerprint: &Fingerprint) -> Result<(), LockError> {
        self.delete(&self.queued_key(fingerprint))
    }

    fn try_mark_running(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        self.try_set(&self.running_key(fingerprint), ttl)
    }

    fn release_running(&self, fingerprint: &Fingerprint) -> Result<(), LockError> {
        self.delete(&self.running_key(fingerprint))
    }

    fn is_queued(&self, fingerprint: &Fingerprint) -> Result<bool, LockError> {
        self.exists(&self.queued_key(fingerprint))
    }

    fn is_running(&self, fingerprint: &Fingerprint) -> Result<bool, LockError> {
        self.exists(&self.running_key(fingerprint))
    }
}
