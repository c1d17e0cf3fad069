//! Change records and the operation-type classifier.

use crate::cell::{CdcCell, CellDecodeError, CellValue};
use crate::sequence::SequenceNumber;
use clock::Time;
use std::collections::BTreeMap;
use std::fmt;

/// Who caused a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginType {
    User,
    Replication,
    Ttl,
}

impl OriginType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Replication => "REPLICATION",
            Self::Ttl => "TTL",
        }
    }
}

impl fmt::Display for OriginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw row state: column name to wire cell.
pub type RowImage = BTreeMap<String, CdcCell>;

/// One change event as fetched from a shard.
///
/// Invariant (from the transport): at least one of `new_image` /
/// `old_image` is present; TTL-origin records have no `new_image`.
/// Records violating this classify as [`OperationType::Unknown`] and are
/// rejected by the processor.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub sequence_number: SequenceNumber,
    pub arrival_time: Time,
    pub origin: OriginType,
    pub new_image: Option<RowImage>,
    pub old_image: Option<RowImage>,
}

impl ChangeRecord {
    pub fn operation(&self) -> OperationType {
        OperationType::classify(
            self.origin,
            self.new_image.is_some(),
            self.old_image.is_some(),
        )
    }
}

/// The kind of change a record describes, derived from its origin and
/// which images are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    ReplicatedInsert,
    ReplicatedUpdate,
    ReplicatedDelete,
    Ttl,
    /// Neither image present with a non-TTL origin; rejected upstream.
    Unknown,
}

impl OperationType {
    /// Classification table:
    ///
    /// | origin | new | old | operation |
    /// |---|---|---|---|
    /// | TTL | any | any | TTL |
    /// | USER | ✓ | ✗ | INSERT |
    /// | USER | ✗ | ✓ | DELETE |
    /// | USER | ✓ | ✓ | UPDATE |
    /// | REPLICATION | ✓ | ✗ | REPLICATED_INSERT |
    /// | REPLICATION | ✗ | ✓ | REPLICATED_DELETE |
    /// | REPLICATION | ✓ | ✓ | REPLICATED_UPDATE |
    /// | any | ✗ | ✗ | UNKNOWN |
    pub fn classify(origin: OriginType, has_new: bool, has_old: bool) -> Self {
        match (origin, has_new, has_old) {
            (OriginType::Ttl, _, _) => Self::Ttl,
            (_, false, false) => Self::Unknown,
            (OriginType::User, true, false) => Self::Insert,
            (OriginType::User, false, true) => Self::Delete,
            (OriginType::User, true, true) => Self::Update,
            (OriginType::Replication, true, false) => Self::ReplicatedInsert,
            (OriginType::Replication, false, true) => Self::ReplicatedDelete,
            (OriginType::Replication, true, true) => Self::ReplicatedUpdate,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::ReplicatedInsert => "REPLICATED_INSERT",
            Self::ReplicatedUpdate => "REPLICATED_UPDATE",
            Self::ReplicatedDelete => "REPLICATED_DELETE",
            Self::Ttl => "TTL",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Operations sinks treat as row removal (keys taken from the old
    /// image).
    pub fn is_delete_like(&self) -> bool {
        matches!(self, Self::Delete | Self::ReplicatedDelete | Self::Ttl)
    }

    /// Operations sinks treat as row upsert (values taken from the new
    /// image).
    pub fn is_upsert_like(&self) -> bool {
        matches!(
            self,
            Self::Insert | Self::Update | Self::ReplicatedInsert | Self::ReplicatedUpdate
        )
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded row state: column name to native value.
pub type DecodedRow = BTreeMap<String, CellValue>;

/// A change record after cell decoding and operation classification,
/// ready to hand to a target mapper.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    pub sequence_number: SequenceNumber,
    pub arrival_time: Time,
    pub operation: OperationType,
    pub new_image: Option<DecodedRow>,
    pub old_image: Option<DecodedRow>,
}

impl DecodedRecord {
    /// The image sinks should read for this record's operation: the old
    /// image for delete-like operations, the new image otherwise.
    pub fn image_for_operation(&self) -> Option<&DecodedRow> {
        if self.operation.is_delete_like() {
            self.old_image.as_ref()
        } else {
            self.new_image.as_ref()
        }
    }
}

/// Decodes every cell of a record. A single malformed or unsupported
/// cell fails the whole record; the processor treats that as batch-fatal
/// without advancing the checkpoint.
pub fn decode_record(record: &ChangeRecord) -> Result<DecodedRecord, CellDecodeError> {
    let decode_image = |image: &Option<RowImage>| -> Result<Option<DecodedRow>, CellDecodeError> {
        image
            .as_ref()
            .map(|cells| {
                cells
                    .iter()
                    .map(|(name, cell)| Ok((name.clone(), cell.decode()?)))
                    .collect::<Result<DecodedRow, CellDecodeError>>()
            })
            .transpose()
    };

    Ok(DecodedRecord {
        sequence_number: record.sequence_number.clone(),
        arrival_time: record.arrival_time,
        operation: record.operation(),
        new_image: decode_image(&record.new_image)?,
        old_image: decode_image(&record.old_image)?,
    })
}
