//! The queue-publisher sink.
//!
//! Each record becomes one logical message in the configured format.
//! Logical messages pack into payloads capped by the smaller of
//! 1 000 000 bytes and the client's per-message limit; payloads group
//! into transport batches of at most ten. Per-item failures surface as
//! partial or total batch failures, which leave the checkpoint
//! untouched.

use crate::batch::BatchBuilder;
use crate::encode::image_to_json;
use crate::error::MapperError;
use crate::filter::FilterWiring;
use crate::mapper::{ClientRegistry, TargetMapper};
use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig, RetryError};
use data_types::DecodedRecord;
use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use stream_config::ConfigDocument;
use thiserror::Error;

/// Stay safely under the 1 MiB transport ceiling.
const PAYLOAD_BYTE_CAP: usize = 1_000_000;

/// Transport limit on entries per batch send.
const MAX_ENTRIES_PER_BATCH: usize = 10;

/// A whole-call failure from the queue transport (as opposed to
/// per-item failures, which arrive in [`QueueSendOutcome`]).
#[derive(Debug, Error)]
#[error("{message}")]
pub struct QueueError {
    pub message: String,
    pub transient: bool,
}

impl QueueError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }
}

/// One message of a batch send.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: String,
    pub body: String,
    pub delay_seconds: u32,
}

/// One rejected message.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSendFailure {
    pub id: String,
    pub code: String,
    pub message: String,
}

/// Per-item results of a batch send.
#[derive(Debug, Clone, Default)]
pub struct QueueSendOutcome {
    pub successful: Vec<String>,
    pub failed: Vec<QueueSendFailure>,
}

/// The external queue service.
#[async_trait]
pub trait QueueClient: Send + Sync + std::fmt::Debug {
    async fn send_batch(
        &self,
        queue_address: &str,
        entries: Vec<QueueMessage>,
    ) -> Result<QueueSendOutcome, QueueError>;

    /// The transport's per-message byte limit.
    fn max_message_bytes(&self) -> usize {
        1 << 20
    }
}

/// An in-memory [`QueueClient`] recording every delivered message.
/// Failures can be scripted per id substring.
#[derive(Debug, Clone)]
pub struct MockQueueClient {
    delivered: Arc<Mutex<Vec<QueueMessage>>>,
    fail_id_containing: Arc<Mutex<Vec<(String, String, String)>>>,
    call_failures: Arc<Mutex<Vec<QueueError>>>,
    max_message_bytes: usize,
}

impl Default for MockQueueClient {
    fn default() -> Self {
        Self {
            delivered: Default::default(),
            fail_id_containing: Default::default(),
            call_failures: Default::default(),
            max_message_bytes: 1 << 20,
        }
    }
}

impl MockQueueClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client with a tiny per-message limit, forcing one payload per
    /// record.
    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    /// Rejects every message whose id contains `fragment`.
    pub fn fail_id_containing(
        &self,
        fragment: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.fail_id_containing
            .lock()
            .push((fragment.into(), code.into(), message.into()));
    }

    /// Queues a whole-call error for the next send.
    pub fn inject_failure(&self, error: QueueError) {
        self.call_failures.lock().push(error);
    }

    pub fn delivered(&self) -> Vec<QueueMessage> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl QueueClient for MockQueueClient {
    async fn send_batch(
        &self,
        _queue_address: &str,
        entries: Vec<QueueMessage>,
    ) -> Result<QueueSendOutcome, QueueError> {
        let failure = {
            let mut failures = self.call_failures.lock();
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        };
        if let Some(e) = failure {
            return Err(e);
        }

        let rules = self.fail_id_containing.lock().clone();
        let mut outcome = QueueSendOutcome::default();
        for entry in entries {
            match rules.iter().find(|(fragment, _, _)| entry.id.contains(fragment)) {
                Some((_, code, message)) => outcome.failed.push(QueueSendFailure {
                    id: entry.id.clone(),
                    code: code.clone(),
                    message: message.clone(),
                }),
                None => {
                    outcome.successful.push(entry.id.clone());
                    self.delivered.lock().push(entry);
                }
            }
        }
        Ok(outcome)
    }

    fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }
}

/// Which parts of the record each logical message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFormat {
    Full,
    NewImage,
    OldImage,
}

impl MessageFormat {
    fn parse(value: &str) -> Result<Self, MapperError> {
        match value {
            "full" => Ok(Self::Full),
            "new-image" => Ok(Self::NewImage),
            "old-image" => Ok(Self::OldImage),
            other => Err(MapperError::config(format!(
                "invalid message format {other:?}; expected \"full\", \"new-image\" or \"old-image\""
            ))),
        }
    }
}

/// Publishes records to a message queue.
#[derive(Debug)]
pub struct QueueMapper {
    filter: FilterWiring,
    client: Arc<dyn QueueClient>,
    queue_address: String,
    message_format: MessageFormat,
    include_fields: Vec<String>,
    include_metadata: bool,
    delay_seconds: u32,
    max_retries: usize,
    keyspace: String,
    table: String,
    backoff_config: BackoffConfig,
    shutdown: tokio_util::sync::CancellationToken,
}

impl QueueMapper {
    pub fn from_config(
        config: &ConfigDocument,
        clients: &ClientRegistry,
    ) -> Result<Arc<dyn TargetMapper>, MapperError> {
        let message_format = MessageFormat::parse(
            &config.string_or("keyspaces-cdc-streams.connector.message-format", "full")?,
        )?;
        let delay = config.i64_or("keyspaces-cdc-streams.connector.delay", 0)?;
        let delay_seconds = u32::try_from(delay)
            .map_err(|_| MapperError::config(format!("invalid delay: {delay}")))?;
        Ok(Arc::new(Self {
            filter: FilterWiring::from_config(config)?,
            client: clients.require_queue()?,
            queue_address: config.require_string("keyspaces-cdc-streams.connector.queue-address")?,
            message_format,
            include_fields: config
                .list_or("keyspaces-cdc-streams.connector.include-fields", vec![])?,
            include_metadata: config
                .bool_or("keyspaces-cdc-streams.connector.include-metadata", true)?,
            delay_seconds,
            max_retries: config.usize_or("keyspaces-cdc-streams.connector.max-retries", 3)?,
            keyspace: config.string_or("keyspaces-cdc-streams.stream.keyspace-name", "")?,
            table: config.string_or("keyspaces-cdc-streams.stream.table-name", "")?,
            backoff_config: BackoffConfig::default(),
            shutdown: clients.shutdown.clone(),
        }))
    }

    /// One record's logical message.
    fn message_body(&self, record: &DecodedRecord) -> Value {
        let mut body = serde_json::Map::new();
        if self.include_metadata {
            body.insert(
                "metadata".to_string(),
                json!({
                    "keyspace": self.keyspace,
                    "table": self.table,
                    "operation": record.operation.as_str(),
                    "timestamp": record.arrival_time.timestamp_millis(),
                    "sequenceNumber": record.sequence_number.get(),
                }),
            );
        }
        match self.message_format {
            MessageFormat::Full => {
                body.insert(
                    "newImage".to_string(),
                    image_to_json(record.new_image.as_ref(), &self.include_fields),
                );
                body.insert(
                    "oldImage".to_string(),
                    image_to_json(record.old_image.as_ref(), &self.include_fields),
                );
            }
            MessageFormat::NewImage => {
                body.insert(
                    "newImage".to_string(),
                    image_to_json(record.new_image.as_ref(), &self.include_fields),
                );
            }
            MessageFormat::OldImage => {
                body.insert(
                    "oldImage".to_string(),
                    image_to_json(record.old_image.as_ref(), &self.include_fields),
                );
            }
        }
        Value::Object(body)
    }

    /// Packs records into payload messages under the byte cap.
    fn build_payloads(&self, records: &[DecodedRecord]) -> Vec<QueueMessage> {
        let payload_cap = PAYLOAD_BYTE_CAP.min(self.client.max_message_bytes());
        let mut builder = BatchBuilder::new(usize::MAX, payload_cap);
        for record in records {
            let body = self.message_body(record);
            // Estimated encoded size: the serialized logical message
            // plus a separator, avoiding a second serialization of the
            // whole payload.
            let encoded_bytes = body.to_string().len() + 1;
            builder.push((record.sequence_number.clone(), body), encoded_bytes);
        }

        builder
            .finish()
            .into_iter()
            .map(|group| {
                let count = group.len();
                let last_sequence = group[count - 1].0.clone();
                let bodies: Vec<Value> = group.into_iter().map(|(_, body)| body).collect();
                QueueMessage {
                    id: format!("{last_sequence}-{count}"),
                    body: json!({ "records": bodies }).to_string(),
                    delay_seconds: self.delay_seconds,
                }
            })
            .collect()
    }

    async fn send_transport_batch(&self, entries: Vec<QueueMessage>) -> Result<(), MapperError> {
        let total = entries.len();
        let outcome = Backoff::new(&self.backoff_config)
            .retry_with_cancel(
                "queue batch send",
                self.max_retries,
                |e: &QueueError| e.transient,
                || self.shutdown.is_cancelled(),
                || self.client.send_batch(&self.queue_address, entries.clone()),
            )
            .await
            .map_err(|e| match e {
                RetryError::Permanent { source, .. } => {
                    MapperError::fatal(format!("queue send failed: {source}"))
                }
                RetryError::RetriesExceeded {
                    attempts, source, ..
                } => MapperError::transient(
                    "queue batch send",
                    format!("{source} (after {attempts} attempts)"),
                ),
            })?;

        if outcome.failed.is_empty() {
            debug!(messages = total, "queue batch fully delivered");
            return Ok(());
        }
        let messages = outcome
            .failed
            .iter()
            .map(|f| format!("message {}: {}: {}", f.id, f.code, f.message))
            .collect();
        Err(MapperError::batch_failure(total, messages))
    }
}

#[async_trait]
impl TargetMapper for QueueMapper {
    fn name(&self) -> &'static str {
        "QueueMapper"
    }

    async fn initialize(&self) -> Result<(), MapperError> {
        info!(
            queue_address = %self.queue_address,
            format = ?self.message_format,
            "initialized queue mapper",
        );
        Ok(())
    }

    fn filter_records(&self, records: Vec<DecodedRecord>) -> Vec<DecodedRecord> {
        self.filter.apply(records)
    }

    async fn handle_records(&self, records: &[DecodedRecord]) -> Result<(), MapperError> {
        if records.is_empty() {
            return Ok(());
        }

        let payloads = self.build_payloads(records);
        let mut grouper = BatchBuilder::new(MAX_ENTRIES_PER_BATCH, usize::MAX);
        for payload in payloads {
            grouper.push(payload, 1);
        }

        for transport_batch in grouper.finish() {
            self.send_transport_batch(transport_batch).await?;
        }
        info!(
            records = records.len(),
            queue_address = %self.queue_address,
            "published records",
        );
        Ok(())
    }
}
