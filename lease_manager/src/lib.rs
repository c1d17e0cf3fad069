//! Shard-lease coordination.
//!
//! Each shard of the stream is processed by exactly one worker at a
//! time. That exclusivity is enforced through lease rows in a
//! conditional key-value store ([`LeaseStore`]): every mutation is a
//! compare-and-swap on the lease's `counter`, so two workers racing for
//! the same shard produce exactly one winner.
//!
//! [`LeaseCoordinator`] drives the full lifecycle for one worker:
//! discovering shards and creating their leases, claiming unowned or
//! stale leases (respecting parent-before-child succession), renewing
//! held leases, advancing checkpoints, releasing on shutdown, and
//! garbage-collecting leases whose shards have aged out of the stream.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod coordinator;
pub mod mem;
mod store;

pub use coordinator::{
    CheckpointError, CoordinatorConfig, CoordinatorError, CoordinatorMetrics, LeaseCoordinator,
};
pub use store::{LeaseStore, LeaseStoreError, UpdateOutcome};
