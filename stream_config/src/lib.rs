//! Configuration loading.
//!
//! Options live in a TOML document rooted at the `keyspaces-cdc-streams`
//! table. Every option can be overridden by an environment variable
//! whose name is the option path minus the root namespace, with `.` and
//! `-` replaced by `_` and upper-cased:
//! `keyspaces-cdc-streams.connector.bucket` → `CONNECTOR_BUCKET`.
//!
//! [`ConfigDocument`] is the raw document with typed accessors; sink
//! mappers read their own options straight from it.
//! [`ServiceConfig`] is the parsed, validated view of the `stream`,
//! `coordinator`, `lease-management` and `processor` sections.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod document;
mod sections;

pub use document::{ConfigDocument, ConfigError, ROOT_NAMESPACE};
pub use sections::{
    resolve_stream_id, CoordinatorSection, LeaseSection, ProcessorSection, ServiceConfig,
    StreamSection,
};
