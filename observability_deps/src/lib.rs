//! This crate exists to pin the version of `tracing` used throughout the
//! workspace and to provide a single place to swap the telemetry stack.
//! Crates should depend on this and use `observability_deps::tracing`
//! rather than importing `tracing` directly.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]

pub use tracing;
