//! The stream consumer: one [`handler::ConsumerHandler`] per worker
//! process drives lease coordination in the background and runs one
//! [`processor::ShardProcessor`] task per owned shard.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod handler;
pub mod metrics;
pub mod processor;

pub use handler::{ConsumerConfig, ConsumerHandler, HandlerError};
pub use metrics::ProcessorMetrics;
pub use processor::{ProcessorConfig, ProcessorError, ShardOutcome, ShardProcessor};
