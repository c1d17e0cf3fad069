//! The conditional key-value surface leases live in.

use async_trait::async_trait;
use data_types::{Lease, ShardId};
use thiserror::Error;

/// Failures talking to the coordination store. Renewal failures are
/// fatal to the affected shard only; an outage outlasting the
/// steal-after window leads to graceful shard abandonment.
#[derive(Debug, Error)]
pub enum LeaseStoreError {
    #[error("lease store unavailable: {message}")]
    Unavailable { message: String },
}

impl LeaseStoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Result of a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Written,
    /// The stored counter did not match; somebody else wrote first.
    Conflict,
}

/// A conditional key-value store holding one row per shard lease.
///
/// Implementations are scoped to one lease table (the application's
/// namespace); `scan` returns every lease in it.
#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug + 'static {
    async fn get(&self, shard_id: &ShardId) -> Result<Option<Lease>, LeaseStoreError>;

    /// Inserts the lease if no row exists for its shard. Returns whether
    /// the insert happened.
    async fn put_if_absent(&self, lease: &Lease) -> Result<bool, LeaseStoreError>;

    /// Replaces the stored lease if its counter equals
    /// `expected_counter`. The caller supplies the new row with the
    /// counter already incremented.
    async fn update_if(
        &self,
        lease: &Lease,
        expected_counter: u64,
    ) -> Result<UpdateOutcome, LeaseStoreError>;

    /// Deletes the lease if its counter equals `expected_counter`.
    /// Returns whether the delete happened.
    async fn delete_if(
        &self,
        shard_id: &ShardId,
        expected_counter: u64,
    ) -> Result<bool, LeaseStoreError>;

    async fn scan(&self) -> Result<Vec<Lease>, LeaseStoreError>;
}
