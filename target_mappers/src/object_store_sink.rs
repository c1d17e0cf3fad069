//! The row-oriented object-store sink.
//!
//! Each batch becomes one object. The key is
//! `<prefix>/<partition>/<firstSeq>-<lastSeq>-<epochMillis>.<ext>`,
//! where the partition path derives from the first record's arrival
//! time at the configured granularity: each finer granularity prepends
//! a segment, so `hours` yields `YYYY/MM/DD/HH/`.

use crate::encode::record_row_json;
use crate::error::MapperError;
use crate::filter::FilterWiring;
use crate::mapper::{ClientRegistry, TargetMapper};
use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig, RetryError};
use bytes::Bytes;
use clock::Time;
use data_types::DecodedRecord;
use object_store::{path::Path as ObjectPath, ObjectStore};
use observability_deps::tracing::{debug, info};
use serde_json::json;
use std::sync::Arc;
use stream_config::ConfigDocument;

/// Output encoding of one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFormat {
    Json,
    Columnar,
}

impl ObjectFormat {
    fn parse(value: &str) -> Result<Self, MapperError> {
        match value {
            "json" => Ok(Self::Json),
            "columnar" => Ok(Self::Columnar),
            other => Err(MapperError::config(format!(
                "invalid object format {other:?}; expected \"json\" or \"columnar\""
            ))),
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Columnar => "parquet",
        }
    }
}

/// Time-partitioning granularity of object keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PartitionGranularity {
    None,
    Years,
    Months,
    Days,
    Hours,
    Minutes,
    Seconds,
}

impl PartitionGranularity {
    fn parse(value: &str) -> Result<Self, MapperError> {
        match value {
            "none" => Ok(Self::None),
            "years" => Ok(Self::Years),
            "months" => Ok(Self::Months),
            "days" => Ok(Self::Days),
            "hours" => Ok(Self::Hours),
            "minutes" => Ok(Self::Minutes),
            "seconds" => Ok(Self::Seconds),
            other => Err(MapperError::config(format!(
                "invalid timestamp partition {other:?}"
            ))),
        }
    }

    /// The partition path for `time`, coarsest segment first, with a
    /// trailing slash; empty for [`Self::None`].
    pub fn path(&self, time: Time) -> String {
        let mut path = String::new();
        if *self >= Self::Years {
            path.push_str(&format!("{:04}/", time.year()));
        }
        if *self >= Self::Months {
            path.push_str(&format!("{:02}/", time.month()));
        }
        if *self >= Self::Days {
            path.push_str(&format!("{:02}/", time.day()));
        }
        if *self >= Self::Hours {
            path.push_str(&format!("{:02}/", time.hour()));
        }
        if *self >= Self::Minutes {
            path.push_str(&format!("{:02}/", time.minute()));
        }
        if *self >= Self::Seconds {
            path.push_str(&format!("{:02}/", time.second()));
        }
        path
    }
}

/// Writes batches of records as JSON or Parquet objects.
#[derive(Debug)]
pub struct ObjectStoreMapper {
    filter: FilterWiring,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    format: ObjectFormat,
    partition: PartitionGranularity,
    max_retries: usize,
    backoff_config: BackoffConfig,
    shutdown: tokio_util::sync::CancellationToken,
}

impl ObjectStoreMapper {
    pub fn from_config(
        config: &ConfigDocument,
        clients: &ClientRegistry,
    ) -> Result<Arc<dyn TargetMapper>, MapperError> {
        let format =
            ObjectFormat::parse(&config.string_or("keyspaces-cdc-streams.connector.format", "json")?)?;
        let partition = PartitionGranularity::parse(&config.string_or(
            "keyspaces-cdc-streams.connector.timestamp-partition",
            "hours",
        )?)?;
        Ok(Arc::new(Self {
            filter: FilterWiring::from_config(config)?,
            store: clients.require_object_store()?,
            bucket: config.require_string("keyspaces-cdc-streams.connector.bucket")?,
            prefix: config.require_string("keyspaces-cdc-streams.connector.prefix")?,
            format,
            partition,
            max_retries: config.usize_or("keyspaces-cdc-streams.connector.max-retries", 3)?,
            backoff_config: BackoffConfig::default(),
            shutdown: clients.shutdown.clone(),
        }))
    }

    fn object_key(&self, records: &[DecodedRecord]) -> String {
        let first = &records[0];
        let last = &records[records.len() - 1];
        let filename = format!(
            "{}-{}-{}.{}",
            first.sequence_number,
            last.sequence_number,
            first.arrival_time.timestamp_millis(),
            self.format.extension(),
        );
        let partition = self.partition.path(first.arrival_time);
        [self.prefix.as_str(), partition.as_str(), filename.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .map(|part| part.trim_matches('/'))
            .collect::<Vec<_>>()
            .join("/")
    }

    fn encode(&self, records: &[DecodedRecord]) -> Result<Bytes, MapperError> {
        match self.format {
            ObjectFormat::Json => {
                let body = json!({
                    "records": records.iter().map(record_row_json).collect::<Vec<_>>(),
                });
                Ok(Bytes::from(body.to_string()))
            }
            ObjectFormat::Columnar => crate::columnar::records_to_parquet(records).map(Bytes::from),
        }
    }
}

/// Errors worth another attempt: everything except the definitive
/// client-side failures.
fn is_transient_store_error(error: &object_store::Error) -> bool {
    use object_store::Error;
    !matches!(
        error,
        Error::NotFound { .. }
            | Error::InvalidPath { .. }
            | Error::AlreadyExists { .. }
            | Error::NotSupported { .. }
            | Error::NotImplemented
            | Error::PermissionDenied { .. }
            | Error::Unauthenticated { .. }
            | Error::UnknownConfigurationKey { .. }
            | Error::Precondition { .. }
    )
}

#[async_trait]
impl TargetMapper for ObjectStoreMapper {
    fn name(&self) -> &'static str {
        "ObjectStoreMapper"
    }

    async fn initialize(&self) -> Result<(), MapperError> {
        info!(
            bucket = %self.bucket,
            prefix = %self.prefix,
            format = ?self.format,
            partition = ?self.partition,
            "initialized object-store mapper",
        );
        Ok(())
    }

    fn filter_records(&self, records: Vec<DecodedRecord>) -> Vec<DecodedRecord> {
        self.filter.apply(records)
    }

    async fn handle_records(&self, records: &[DecodedRecord]) -> Result<(), MapperError> {
        if records.is_empty() {
            debug!("no records to write");
            return Ok(());
        }

        let key = self.object_key(records);
        let path = ObjectPath::from(key.as_str());
        let data = self.encode(records)?;

        Backoff::new(&self.backoff_config)
            .retry_with_cancel(
                "object store put",
                self.max_retries,
                is_transient_store_error,
                || self.shutdown.is_cancelled(),
                || {
                    let data = data.clone();
                    let path = path.clone();
                    async move { self.store.put(&path, data.into()).await }
                },
            )
            .await
            .map_err(|e| match e {
                RetryError::Permanent { source, .. } => {
                    MapperError::fatal(format!("object store put failed: {source}"))
                }
                RetryError::RetriesExceeded {
                    attempts, source, ..
                } => MapperError::transient(
                    "object store put",
                    format!("{source} (after {attempts} attempts)"),
                ),
            })?;

        info!(
            records = records.len(),
            bucket = %self.bucket,
            key = %key,
            bytes = data.len(),
            "wrote object",
        );
        Ok(())
    }
}
