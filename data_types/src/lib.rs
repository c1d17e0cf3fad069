//! Data types shared across the CDC stream consumer: change records and
//! their typed cells, the operation classifier, shards, leases and
//! checkpoints.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod cell;
pub mod lease;
pub mod record;
pub mod sequence;
pub mod shard;

pub use cell::{CdcCell, CellDecodeError, CellPayload, CellTag, CellValue};
pub use lease::{Lease, WorkerId};
pub use record::{
    decode_record, ChangeRecord, DecodedRecord, DecodedRow, OperationType, OriginType, RowImage,
};
pub use sequence::{Checkpoint, SequenceNumber};
pub use shard::{HashRange, Shard, ShardId, StreamId};
