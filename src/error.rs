//! Typed error boundary for library call sites.
//!
//! Internal call chains use `anyhow::Result` with `.context(...)` (see
//! `job_store.rs`, `fleet_registry.rs`); this enum is what crosses module
//! boundaries where callers need to match on failure kind (e.g. the broker
//! gateway deciding ack vs. nack-with-requeue).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job store error: {0}")]
    JobStore(#[from] sqlx::Error),

    #[error("aggregation store error: {0}")]
    AggregationStore(#[from] redis::RedisError),

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("fleet registry error: {0}")]
    FleetRegistry(#[from] bollard::errors::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
