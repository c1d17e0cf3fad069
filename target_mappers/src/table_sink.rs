//! The materialized secondary-table sink.
//!
//! Upsert-like operations write the configured `include-fields` from
//! the new image; delete-like operations delete by the configured
//! partition and clustering keys taken from the old image.

use crate::error::MapperError;
use crate::filter::FilterWiring;
use crate::mapper::{ClientRegistry, TargetMapper};
use async_trait::async_trait;
use data_types::{CellValue, DecodedRecord, OperationType};
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use stream_config::ConfigDocument;
use thiserror::Error;

/// A failure from the tabular database driver.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TabularStoreError {
    pub message: String,
    pub transient: bool,
}

impl TabularStoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// A parameterized tabular database: inserts and deletes by named bind
/// variables.
#[async_trait]
pub trait TabularStore: Send + Sync + std::fmt::Debug {
    async fn upsert(
        &self,
        table: &str,
        row: &[(String, CellValue)],
    ) -> Result<(), TabularStoreError>;

    async fn delete(
        &self,
        table: &str,
        key: &[(String, CellValue)],
    ) -> Result<(), TabularStoreError>;
}

/// One statement executed against a [`MemTabularStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum TabularOp {
    Upsert {
        table: String,
        row: Vec<(String, CellValue)>,
    },
    Delete {
        table: String,
        key: Vec<(String, CellValue)>,
    },
}

/// An in-memory [`TabularStore`] recording every statement, for tests
/// and local smoke runs.
#[derive(Debug, Clone, Default)]
pub struct MemTabularStore {
    ops: Arc<Mutex<Vec<TabularOp>>>,
    failures: Arc<Mutex<Vec<TabularStoreError>>>,
}

impl MemTabularStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operations(&self) -> Vec<TabularOp> {
        self.ops.lock().clone()
    }

    /// Queues an error returned by the next statement.
    pub fn inject_failure(&self, error: TabularStoreError) {
        self.failures.lock().push(error);
    }

    fn take_failure(&self) -> Option<TabularStoreError> {
        let mut failures = self.failures.lock();
        if failures.is_empty() {
            None
        } else {
            Some(failures.remove(0))
        }
    }
}

#[async_trait]
impl TabularStore for MemTabularStore {
    async fn upsert(
        &self,
        table: &str,
        row: &[(String, CellValue)],
    ) -> Result<(), TabularStoreError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        self.ops.lock().push(TabularOp::Upsert {
            table: table.to_string(),
            row: row.to_vec(),
        });
        Ok(())
    }

    async fn delete(
        &self,
        table: &str,
        key: &[(String, CellValue)],
    ) -> Result<(), TabularStoreError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        self.ops.lock().push(TabularOp::Delete {
            table: table.to_string(),
            key: key.to_vec(),
        });
        Ok(())
    }
}

/// Base delay of the linear per-write backoff (`delay = base * attempt`).
const RETRY_BASE: Duration = Duration::from_millis(10);

/// Maintains a queryable copy of the source table.
#[derive(Debug)]
pub struct TableMapper {
    filter: FilterWiring,
    store: Arc<dyn TabularStore>,
    target_table: String,
    include_fields: Vec<String>,
    partition_keys: Vec<String>,
    clustering_keys: Vec<String>,
    max_retries: usize,
    shutdown: tokio_util::sync::CancellationToken,
}

impl TableMapper {
    pub fn from_config(
        config: &ConfigDocument,
        clients: &ClientRegistry,
    ) -> Result<Arc<dyn TargetMapper>, MapperError> {
        Ok(Arc::new(Self {
            filter: FilterWiring::from_config(config)?,
            store: clients.require_tabular_store()?,
            target_table: config.require_string("keyspaces-cdc-streams.connector.target-table")?,
            include_fields: config.require_list("keyspaces-cdc-streams.connector.include-fields")?,
            partition_keys: config.require_list("keyspaces-cdc-streams.connector.partition-keys")?,
            clustering_keys: config
                .require_list("keyspaces-cdc-streams.connector.clustering-keys")?,
            max_retries: config
                .usize_or("keyspaces-cdc-streams.connector.max-retries", 3)?
                .max(1),
            shutdown: clients.shutdown.clone(),
        }))
    }

    /// The bind values for a delete: partition keys then clustering
    /// keys, all taken from the old image. A missing key column is a
    /// config-invariant violation (the row cannot be addressed).
    fn delete_key(&self, record: &DecodedRecord) -> Result<Vec<(String, CellValue)>, MapperError> {
        let image = record.old_image.as_ref().ok_or_else(|| {
            MapperError::fatal(format!(
                "{} record {} has no old image",
                record.operation, record.sequence_number
            ))
        })?;

        self.partition_keys
            .iter()
            .chain(self.clustering_keys.iter())
            .map(|key| match image.get(key) {
                Some(value) => Ok((key.clone(), value.clone())),
                None => Err(MapperError::config(format!(
                    "delete key column {key:?} absent from old image"
                ))),
            })
            .collect()
    }

    /// The bind values for an upsert: the configured `include-fields`
    /// present in the new image.
    fn upsert_row(&self, record: &DecodedRecord) -> Result<Vec<(String, CellValue)>, MapperError> {
        let image = record.new_image.as_ref().ok_or_else(|| {
            MapperError::fatal(format!(
                "{} record {} has no new image",
                record.operation, record.sequence_number
            ))
        })?;

        Ok(self
            .include_fields
            .iter()
            .filter_map(|field| {
                image
                    .get(field)
                    .map(|value| (field.clone(), value.clone()))
            })
            .collect())
    }

    async fn execute_with_retries(
        &self,
        record: &DecodedRecord,
        op: TabularOp,
    ) -> Result<(), MapperError> {
        for attempt in 1..=self.max_retries {
            let result = match &op {
                TabularOp::Upsert { table, row } => self.store.upsert(table, row).await,
                TabularOp::Delete { table, key } => self.store.delete(table, key).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt == self.max_retries || self.shutdown.is_cancelled() => {
                    return Err(if e.transient {
                        MapperError::transient(
                            "table write",
                            format!("{e} (after {attempt} attempts)"),
                        )
                    } else {
                        MapperError::fatal(format!("table write failed: {e}"))
                    });
                }
                Err(e) => {
                    warn!(
                        sequence_number = %record.sequence_number,
                        attempt,
                        error = %e,
                        "table write failed, retrying",
                    );
                    tokio::time::sleep(RETRY_BASE * attempt as u32).await;
                }
            }
        }
        unreachable!("retry loop always returns")
    }
}

#[async_trait]
impl TargetMapper for TableMapper {
    fn name(&self) -> &'static str {
        "TableMapper"
    }

    async fn initialize(&self) -> Result<(), MapperError> {
        info!(
            target_table = %self.target_table,
            include_fields = ?self.include_fields,
            "initialized table mapper",
        );
        Ok(())
    }

    fn filter_records(&self, records: Vec<DecodedRecord>) -> Vec<DecodedRecord> {
        self.filter.apply(records)
    }

    async fn handle_records(&self, records: &[DecodedRecord]) -> Result<(), MapperError> {
        for record in records {
            let op = match record.operation {
                op if op.is_upsert_like() => TabularOp::Upsert {
                    table: self.target_table.clone(),
                    row: self.upsert_row(record)?,
                },
                op if op.is_delete_like() => TabularOp::Delete {
                    table: self.target_table.clone(),
                    key: self.delete_key(record)?,
                },
                OperationType::Unknown => {
                    return Err(MapperError::fatal(format!(
                        "unsupported operation type for record {}",
                        record.sequence_number
                    )));
                }
                op => {
                    return Err(MapperError::fatal(format!(
                        "unhandled operation type {op} for record {}",
                        record.sequence_number
                    )));
                }
            };
            self.execute_with_retries(record, op).await?;
            debug!(
                sequence_number = %record.sequence_number,
                operation = %record.operation,
                "applied record to table",
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::Time;
    use data_types::{DecodedRow, SequenceNumber};

    fn mapper_with_store() -> (Arc<dyn TargetMapper>, MemTabularStore) {
        let store = MemTabularStore::new();
        let clients = ClientRegistry::new().with_tabular_store(Arc::new(store.clone()) as _);
        let config = ConfigDocument::from_toml_str(
            r#"
            ["keyspaces-cdc-streams".connector]
            target-table = "movies_by_id"
            include-fields = ["id", "v"]
            partition-keys = ["id"]
            clustering-keys = []
            "#,
        )
        .unwrap();
        let mapper = TableMapper::from_config(&config, &clients).unwrap();
        (mapper, store)
    }

    fn record(
        operation: OperationType,
        new_image: Option<DecodedRow>,
        old_image: Option<DecodedRow>,
    ) -> DecodedRecord {
        DecodedRecord {
            sequence_number: SequenceNumber::from("1"),
            arrival_time: Time::from_timestamp_millis(0),
            operation,
            new_image,
            old_image,
        }
    }

    fn image(id: &str, v: i32) -> DecodedRow {
        DecodedRow::from([
            ("id".to_string(), CellValue::Text(id.into())),
            ("v".to_string(), CellValue::Int(v)),
            ("extra".to_string(), CellValue::Boolean(true)),
        ])
    }

    #[tokio::test]
    async fn test_insert_upserts_included_fields() {
        let (mapper, store) = mapper_with_store();
        mapper
            .handle_records(&[record(OperationType::Insert, Some(image("k", 1)), None)])
            .await
            .unwrap();

        assert_eq!(
            store.operations(),
            vec![TabularOp::Upsert {
                table: "movies_by_id".to_string(),
                row: vec![
                    ("id".to_string(), CellValue::Text("k".into())),
                    ("v".to_string(), CellValue::Int(1)),
                ],
            }]
        );
    }

    #[tokio::test]
    async fn test_ttl_routes_to_delete_by_key() {
        let (mapper, store) = mapper_with_store();
        mapper
            .handle_records(&[record(OperationType::Ttl, None, Some(image("k", 1)))])
            .await
            .unwrap();

        assert_eq!(
            store.operations(),
            vec![TabularOp::Delete {
                table: "movies_by_id".to_string(),
                key: vec![("id".to_string(), CellValue::Text("k".into()))],
            }]
        );
    }

    #[tokio::test]
    async fn test_replicated_operations_route_like_user_ones() {
        let (mapper, store) = mapper_with_store();
        mapper
            .handle_records(&[
                record(OperationType::ReplicatedUpdate, Some(image("a", 2)), Some(image("a", 1))),
                record(OperationType::ReplicatedDelete, None, Some(image("a", 2))),
            ])
            .await
            .unwrap();

        let ops = store.operations();
        assert!(matches!(ops[0], TabularOp::Upsert { .. }));
        assert!(matches!(ops[1], TabularOp::Delete { .. }));
    }

    #[tokio::test]
    async fn test_missing_delete_key_is_config_error() {
        let (mapper, _) = mapper_with_store();
        let no_id = DecodedRow::from([("v".to_string(), CellValue::Int(1))]);
        let err = mapper
            .handle_records(&[record(OperationType::Delete, None, Some(no_id))])
            .await
            .unwrap_err();
        assert!(matches!(err, MapperError::Config { .. }));
    }

    #[tokio::test]
    async fn test_unknown_operation_is_fatal() {
        let (mapper, _) = mapper_with_store();
        let err = mapper
            .handle_records(&[record(OperationType::Unknown, None, None)])
            .await
            .unwrap_err();
        assert!(matches!(err, MapperError::Fatal { .. }));
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_succeed() {
        let (mapper, store) = mapper_with_store();
        store.inject_failure(TabularStoreError::transient("timeout"));
        store.inject_failure(TabularStoreError::transient("timeout"));

        mapper
            .handle_records(&[record(OperationType::Insert, Some(image("k", 1)), None)])
            .await
            .unwrap();
        assert_eq!(store.operations().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_escalate_transient() {
        let (mapper, store) = mapper_with_store();
        for _ in 0..3 {
            store.inject_failure(TabularStoreError::transient("timeout"));
        }

        let err = mapper
            .handle_records(&[record(OperationType::Insert, Some(image("k", 1)), None)])
            .await
            .unwrap_err();
        assert!(matches!(err, MapperError::Transient { .. }));
        assert!(store.operations().is_empty());
    }
}
