//! The target-mapper contract and the built-in sinks.
//!
//! A [`TargetMapper`] turns batches of decoded change records into
//! writes against a sink. Mappers are resolved by name through the
//! compile-time [`MapperRegistry`] and constructed from the parsed
//! config document plus a [`ClientRegistry`] of injected transport
//! clients; nothing here reaches for global singletons.
//!
//! Shared machinery lives beside the contract: [`FilterWiring`] applies
//! an optional compiled filter expression, [`BatchBuilder`] enforces
//! joint count/byte caps, and the `backoff` crate supplies the bounded
//! retry harness every sink uses for its transport calls.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod batch;
mod columnar;
mod encode;
mod error;
mod filter;
pub mod log_sink;
mod mapper;
pub mod object_store_sink;
pub mod queue_sink;
pub mod table_sink;
pub mod vector_sink;

pub use batch::BatchBuilder;
pub use encode::{image_to_json, record_envelope_json, record_row_json};
pub use error::{summarize_messages, MapperError};
pub use filter::{FilterWiring, RecordContext};
pub use mapper::{ClientRegistry, MapperFactory, MapperRegistry, TargetMapper};
