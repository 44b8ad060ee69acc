//! Infrastructure layer: Redis locks/queue, Postgres status store, config.
//!
//! The coordination core in `tallyforge-coordination` is storage-agnostic;
//! this crate provides the production adapters behind its trait seams.

pub mod config;
pub mod postgres_status;
#[cfg(feature = "redis")]
pub mod redis_lock;
#[cfg(feature = "redis")]
pub mod redis_queue;

pub use config::InfraConfig;
pub use postgres_status::PostgresStatusStore;
#[cfg(feature = "redis")]
pub use redis_lock::RedisLockRegistry;
#[cfg(feature = "redis")]
pub use redis_queue::RedisStreamsQueue;
