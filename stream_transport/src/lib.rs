//! The abstract CDC stream transport.
//!
//! The consumer never talks to a concrete streams service; it goes
//! through [`StreamTransport`], which models the minimal surface the
//! coordinator and processor need: stream enumeration, shard listing
//! with parent/child relationships, and ordered iteration with an
//! end-of-shard marker. [`mock::MockTransport`] implements the whole
//! surface in memory for tests.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod mock;

use async_trait::async_trait;
use data_types::{ChangeRecord, Checkpoint, Shard, ShardId, StreamId};
use thiserror::Error;

/// Transport failures, split into the transient set (retry with
/// backoff) and everything else (fail fast).
#[derive(Debug, Error)]
pub enum TransportError {
    /// Throttling, temporary unavailability, timeouts. Retryable.
    #[error("transient transport error: {message}")]
    Transient { message: String },

    /// Anything the caller should not retry.
    #[error("transport error: {message}")]
    Permanent { message: String },

    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// One enumerable stream: the table it captures plus an optional label
/// distinguishing successive stream generations of the same table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_id: StreamId,
    pub keyspace: String,
    pub table: String,
    pub label: Option<String>,
}

/// A position handle within one shard. The token is transport-opaque;
/// callers only thread it back into [`StreamTransport::next`].
#[derive(Debug, Clone)]
pub struct ShardIterator {
    pub shard_id: ShardId,
    token: String,
}

impl ShardIterator {
    pub fn new(shard_id: ShardId, token: impl Into<String>) -> Self {
        Self {
            shard_id,
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = token.into();
    }
}

/// One fetch result: an ordered run of records, the position the
/// iterator has advanced to, and whether the shard is fully drained.
#[derive(Debug, Clone)]
pub struct FetchedBatch {
    pub records: Vec<ChangeRecord>,
    /// The position covering everything consumed so far; used for
    /// opportunistic checkpoints on empty fetches.
    pub next_checkpoint: Checkpoint,
    /// True once the shard has ended *and* all its records have been
    /// consumed. Child shards become processable afterwards.
    pub end_of_shard: bool,
}

/// The external streams service, reduced to what the consumer needs.
#[async_trait]
pub trait StreamTransport: Send + Sync + std::fmt::Debug + 'static {
    /// Enumerate streams, for resolving `(keyspace, table, label)` to a
    /// stream id.
    async fn list_streams(&self) -> Result<Vec<StreamInfo>, TransportError>;

    /// Enumerate the stream's current shards with parent/child
    /// relationships and hash ranges. Ended shards disappear from this
    /// listing once their retention lapses.
    async fn list_shards(&self, stream_id: &StreamId) -> Result<Vec<Shard>, TransportError>;

    /// Open an iterator positioned after `position` (i.e. the first
    /// record returned is the first one not yet covered by it).
    async fn open_iterator(
        &self,
        stream_id: &StreamId,
        shard_id: &ShardId,
        position: &Checkpoint,
    ) -> Result<ShardIterator, TransportError>;

    /// Fetch the next run of records, at most `max_records` of them,
    /// advancing the iterator.
    async fn next(
        &self,
        stream_id: &StreamId,
        iterator: &mut ShardIterator,
        max_records: usize,
    ) -> Result<FetchedBatch, TransportError>;
}
