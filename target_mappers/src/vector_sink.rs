//! The vector-index sink.
//!
//! Each upserted record becomes one vector: the embedding text comes
//! from `embedding-field` (falling back to `key-field` with a warning),
//! the vector from the external embedding model, and the metadata from
//! `metadata-fields` coerced to string/number/boolean.

use crate::error::MapperError;
use crate::filter::FilterWiring;
use crate::mapper::{ClientRegistry, TargetMapper};
use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig, RetryError};
use bigdecimal::ToPrimitive;
use data_types::{CellValue, DecodedRecord, DecodedRow};
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use stream_config::ConfigDocument;
use thiserror::Error;

/// The model used when `embedding-model` is not configured.
pub const DEFAULT_EMBEDDING_MODEL: &str = "amazon.titan-embed-text-v2:0";

/// A failure from the embedding model service.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct EmbeddingError {
    pub message: String,
    /// Throttling, service unavailable, internal error, timeout,
    /// HTTP 502/503/504.
    pub transient: bool,
}

impl EmbeddingError {
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

/// The external embedding model.
#[async_trait]
pub trait EmbeddingModel: Send + Sync + std::fmt::Debug {
    /// Embeds `text` into a vector of exactly `dimensions` floats.
    async fn embed(
        &self,
        model_id: &str,
        text: &str,
        dimensions: usize,
    ) -> Result<Vec<f32>, EmbeddingError>;
}

/// A failure from the vector index.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct VectorStoreError {
    pub message: String,
    pub transient: bool,
}

impl VectorStoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }
}

/// Metadata attached to a stored vector.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Str(String),
    Num(f64),
    Bool(bool),
}

/// One vector to store.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub key: String,
    pub vector: Vec<f32>,
    pub metadata: BTreeMap<String, MetadataValue>,
}

/// The external vector index.
#[async_trait]
pub trait VectorIndexStore: Send + Sync + std::fmt::Debug {
    async fn put_vectors(
        &self,
        bucket: &str,
        index: &str,
        vectors: Vec<VectorRecord>,
    ) -> Result<(), VectorStoreError>;
}

/// A deterministic in-memory [`EmbeddingModel`]: the vector is a simple
/// function of the text bytes, so tests can assert on it.
#[derive(Debug, Clone, Default)]
pub struct MockEmbeddingModel {
    calls: Arc<Mutex<Vec<String>>>,
    failures: Arc<Mutex<Vec<EmbeddingError>>>,
}

impl MockEmbeddingModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn embedded_texts(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn inject_failure(&self, error: EmbeddingError) {
        self.failures.lock().push(error);
    }

    pub fn expected_vector(text: &str, dimensions: usize) -> Vec<f32> {
        let sum: u32 = text.bytes().map(u32::from).sum();
        (0..dimensions)
            .map(|i| ((sum + i as u32) % 101) as f32 / 101.0)
            .collect()
    }
}

#[async_trait]
impl EmbeddingModel for MockEmbeddingModel {
    async fn embed(
        &self,
        _model_id: &str,
        text: &str,
        dimensions: usize,
    ) -> Result<Vec<f32>, EmbeddingError> {
        let failure = {
            let mut failures = self.failures.lock();
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        };
        if let Some(e) = failure {
            return Err(e);
        }
        self.calls.lock().push(text.to_string());
        Ok(Self::expected_vector(text, dimensions))
    }
}

/// An in-memory [`VectorIndexStore`] keyed by vector key.
#[derive(Debug, Clone, Default)]
pub struct MemVectorIndexStore {
    vectors: Arc<Mutex<BTreeMap<String, VectorRecord>>>,
    failures: Arc<Mutex<Vec<VectorStoreError>>>,
}

impl MemVectorIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<VectorRecord> {
        self.vectors.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.vectors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.lock().is_empty()
    }

    pub fn inject_failure(&self, error: VectorStoreError) {
        self.failures.lock().push(error);
    }
}

#[async_trait]
impl VectorIndexStore for MemVectorIndexStore {
    async fn put_vectors(
        &self,
        _bucket: &str,
        _index: &str,
        vectors: Vec<VectorRecord>,
    ) -> Result<(), VectorStoreError> {
        let failure = {
            let mut failures = self.failures.lock();
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        };
        if let Some(e) = failure {
            return Err(e);
        }
        let mut stored = self.vectors.lock();
        for vector in vectors {
            stored.insert(vector.key.clone(), vector);
        }
        Ok(())
    }
}

/// Writes record embeddings into a vector index.
#[derive(Debug)]
pub struct VectorMapper {
    filter: FilterWiring,
    model: Arc<dyn EmbeddingModel>,
    index_store: Arc<dyn VectorIndexStore>,
    bucket: String,
    index_name: String,
    embedding_field: String,
    key_field: String,
    metadata_fields: Vec<String>,
    dimensions: usize,
    model_id: String,
    max_retries: usize,
    backoff_config: BackoffConfig,
    shutdown: tokio_util::sync::CancellationToken,
}

impl VectorMapper {
    pub fn from_config(
        config: &ConfigDocument,
        clients: &ClientRegistry,
    ) -> Result<Arc<dyn TargetMapper>, MapperError> {
        Ok(Arc::new(Self {
            filter: FilterWiring::from_config(config)?,
            model: clients.require_embedding_model()?,
            index_store: clients.require_vector_index()?,
            bucket: config.require_string("keyspaces-cdc-streams.connector.bucket")?,
            index_name: config.require_string("keyspaces-cdc-streams.connector.index-name")?,
            embedding_field: config
                .require_string("keyspaces-cdc-streams.connector.embedding-field")?,
            key_field: config.require_string("keyspaces-cdc-streams.connector.key-field")?,
            metadata_fields: config
                .list_or("keyspaces-cdc-streams.connector.metadata-fields", vec![])?,
            dimensions: config.usize_or("keyspaces-cdc-streams.connector.dimensions", 256)?,
            model_id: config.string_or(
                "keyspaces-cdc-streams.connector.embedding-model",
                DEFAULT_EMBEDDING_MODEL,
            )?,
            max_retries: config.usize_or("keyspaces-cdc-streams.connector.max-retries", 3)?,
            backoff_config: BackoffConfig::default(),
            shutdown: clients.shutdown.clone(),
        }))
    }

    fn text_field<'a>(
        &self,
        image: &'a DecodedRow,
        field: &str,
        context: &str,
    ) -> Result<Option<&'a str>, MapperError> {
        match image.get(field) {
            None => Ok(None),
            Some(CellValue::Text(s)) if s.is_empty() => Ok(None),
            Some(CellValue::Text(s)) => Ok(Some(s)),
            Some(other) => Err(MapperError::unsupported(other.kind(), context.to_string())),
        }
    }

    /// The text to embed: `embedding-field`, falling back to
    /// `key-field`. Both absent is a configuration-invariant violation.
    fn embedding_text(
        &self,
        record: &DecodedRecord,
        image: &DecodedRow,
        key: &str,
    ) -> Result<String, MapperError> {
        match self.text_field(image, &self.embedding_field, "vector index embedding")? {
            Some(text) => Ok(text.to_string()),
            None => {
                warn!(
                    sequence_number = %record.sequence_number,
                    embedding_field = %self.embedding_field,
                    key_field = %self.key_field,
                    "embedding field empty; falling back to key field",
                );
                Ok(key.to_string())
            }
        }
    }

    fn metadata(
        &self,
        image: &DecodedRow,
    ) -> Result<BTreeMap<String, MetadataValue>, MapperError> {
        let mut metadata = BTreeMap::new();
        for field in &self.metadata_fields {
            let Some(value) = image.get(field) else {
                continue;
            };
            let coerced = match value {
                CellValue::Text(s) => MetadataValue::Str(s.clone()),
                CellValue::Date(d) => MetadataValue::Str(d.to_string()),
                CellValue::Int(v) => MetadataValue::Num(f64::from(*v)),
                CellValue::BigInt(v) => MetadataValue::Num(*v as f64),
                CellValue::Float(v) => MetadataValue::Num(f64::from(*v)),
                CellValue::Double(v) => MetadataValue::Num(*v),
                CellValue::Timestamp(v) => MetadataValue::Num(*v as f64),
                CellValue::Decimal(v) => MetadataValue::Num(v.to_f64().ok_or_else(|| {
                    MapperError::unsupported("decimal", format!("metadata field {field:?}"))
                })?),
                CellValue::Boolean(b) => MetadataValue::Bool(*b),
                CellValue::Blob(_) => {
                    return Err(MapperError::unsupported(
                        "blob",
                        format!("metadata field {field:?}"),
                    ));
                }
            };
            metadata.insert(field.clone(), coerced);
        }
        Ok(metadata)
    }

    async fn embed_with_retries(&self, text: &str) -> Result<Vec<f32>, MapperError> {
        let vector = Backoff::new(&self.backoff_config)
            .retry_with_cancel(
                "embedding model invoke",
                self.max_retries,
                |e: &EmbeddingError| e.transient,
                || self.shutdown.is_cancelled(),
                || self.model.embed(&self.model_id, text, self.dimensions),
            )
            .await
            .map_err(|e| match e {
                RetryError::Permanent { source, .. } => {
                    MapperError::fatal(format!("embedding model failed: {source}"))
                }
                RetryError::RetriesExceeded {
                    attempts, source, ..
                } => MapperError::transient(
                    "embedding model invoke",
                    format!("{source} (after {attempts} attempts)"),
                ),
            })?;

        if vector.len() != self.dimensions {
            return Err(MapperError::fatal(format!(
                "embedding model returned {} dimensions, expected {}",
                vector.len(),
                self.dimensions
            )));
        }
        Ok(vector)
    }
}

#[async_trait]
impl TargetMapper for VectorMapper {
    fn name(&self) -> &'static str {
        "VectorMapper"
    }

    async fn initialize(&self) -> Result<(), MapperError> {
        info!(
            bucket = %self.bucket,
            index_name = %self.index_name,
            model_id = %self.model_id,
            dimensions = self.dimensions,
            "initialized vector mapper",
        );
        Ok(())
    }

    fn filter_records(&self, records: Vec<DecodedRecord>) -> Vec<DecodedRecord> {
        self.filter.apply(records)
    }

    async fn handle_records(&self, records: &[DecodedRecord]) -> Result<(), MapperError> {
        let mut vectors = Vec::new();
        for record in records {
            let Some(image) = record.new_image.as_ref() else {
                // Delete-like records have no vector representation.
                debug!(
                    sequence_number = %record.sequence_number,
                    operation = %record.operation,
                    "skipping record without new image",
                );
                continue;
            };

            let key = self
                .text_field(image, &self.key_field, "vector index key")?
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    MapperError::config(format!(
                        "record {} has neither embedding text nor key field {:?}",
                        record.sequence_number, self.key_field
                    ))
                })?;
            let text = self.embedding_text(record, image, &key)?;
            let vector = self.embed_with_retries(&text).await?;

            vectors.push(VectorRecord {
                key,
                vector,
                metadata: self.metadata(image)?,
            });
        }

        if vectors.is_empty() {
            return Ok(());
        }

        let count = vectors.len();
        Backoff::new(&self.backoff_config)
            .retry_with_cancel(
                "vector index put",
                self.max_retries,
                |e: &VectorStoreError| e.transient,
                || self.shutdown.is_cancelled(),
                || {
                    let vectors = vectors.clone();
                    async move {
                        self.index_store
                            .put_vectors(&self.bucket, &self.index_name, vectors)
                            .await
                    }
                },
            )
            .await
            .map_err(|e| match e {
                RetryError::Permanent { source, .. } => {
                    MapperError::fatal(format!("vector index put failed: {source}"))
                }
                RetryError::RetriesExceeded {
                    attempts, source, ..
                } => MapperError::transient(
                    "vector index put",
                    format!("{source} (after {attempts} attempts)"),
                ),
            })?;

        info!(
            vectors = count,
            index_name = %self.index_name,
            "wrote vectors",
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::Time;
    use data_types::{OperationType, SequenceNumber};

    struct Harness {
        mapper: Arc<dyn TargetMapper>,
        model: MockEmbeddingModel,
        index: MemVectorIndexStore,
    }

    fn harness() -> Harness {
        let model = MockEmbeddingModel::new();
        let index = MemVectorIndexStore::new();
        let clients = ClientRegistry::new()
            .with_embedding_model(Arc::new(model.clone()) as _)
            .with_vector_index(Arc::new(index.clone()) as _);
        let config = ConfigDocument::from_toml_str(
            r#"
            ["keyspaces-cdc-streams".connector]
            bucket = "vectors"
            index-name = "movies"
            embedding-field = "description"
            key-field = "id"
            metadata-fields = ["year", "title"]
            dimensions = 8
            max-retries = 2
            "#,
        )
        .unwrap();
        let mapper = VectorMapper::from_config(&config, &clients).unwrap();
        Harness {
            mapper,
            model,
            index,
        }
    }

    fn record(image: DecodedRow) -> DecodedRecord {
        DecodedRecord {
            sequence_number: SequenceNumber::from("1"),
            arrival_time: Time::from_timestamp_millis(0),
            operation: OperationType::Insert,
            new_image: Some(image),
            old_image: None,
        }
    }

    fn full_image() -> DecodedRow {
        DecodedRow::from([
            ("id".to_string(), CellValue::Text("movie-1".into())),
            (
                "description".to_string(),
                CellValue::Text("a heist in space".into()),
            ),
            ("title".to_string(), CellValue::Text("Orbit".into())),
            ("year".to_string(), CellValue::Int(2024)),
        ])
    }

    #[tokio::test]
    async fn test_embeds_and_stores_with_metadata() {
        let h = harness();
        h.mapper.handle_records(&[record(full_image())]).await.unwrap();

        let stored = h.index.get("movie-1").expect("vector stored under key");
        assert_eq!(
            stored.vector,
            MockEmbeddingModel::expected_vector("a heist in space", 8)
        );
        assert_eq!(
            stored.metadata,
            BTreeMap::from([
                ("title".to_string(), MetadataValue::Str("Orbit".into())),
                ("year".to_string(), MetadataValue::Num(2024.0)),
            ])
        );
    }

    #[tokio::test]
    async fn test_falls_back_to_key_field() {
        let h = harness();
        let mut image = full_image();
        image.insert("description".to_string(), CellValue::Text(String::new()));

        h.mapper.handle_records(&[record(image)]).await.unwrap();
        assert_eq!(h.model.embedded_texts(), vec!["movie-1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_key_and_embedding_is_config_error() {
        let h = harness();
        let image = DecodedRow::from([("year".to_string(), CellValue::Int(1999))]);
        let err = h.mapper.handle_records(&[record(image)]).await.unwrap_err();
        assert!(matches!(err, MapperError::Config { .. }));
    }

    #[tokio::test]
    async fn test_non_text_embedding_field_is_unsupported() {
        let h = harness();
        let mut image = full_image();
        image.insert("description".to_string(), CellValue::Int(5));
        let err = h.mapper.handle_records(&[record(image)]).await.unwrap_err();
        assert!(matches!(err, MapperError::UnsupportedType { .. }));
    }

    #[tokio::test]
    async fn test_blob_metadata_is_unsupported() {
        let h = harness();
        let mut image = full_image();
        image.insert("title".to_string(), CellValue::Blob(vec![1]));
        let err = h.mapper.handle_records(&[record(image)]).await.unwrap_err();
        assert!(matches!(err, MapperError::UnsupportedType { .. }));
    }

    #[tokio::test]
    async fn test_delete_records_are_skipped() {
        let h = harness();
        let delete = DecodedRecord {
            operation: OperationType::Delete,
            new_image: None,
            old_image: Some(full_image()),
            ..record(full_image())
        };
        h.mapper.handle_records(&[delete]).await.unwrap();
        assert!(h.index.is_empty());
    }

    #[tokio::test]
    async fn test_transient_model_failure_retries() {
        let h = harness();
        h.model.inject_failure(EmbeddingError::transient("503"));

        h.mapper.handle_records(&[record(full_image())]).await.unwrap();
        assert_eq!(h.index.len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_model_failure_is_fatal() {
        let h = harness();
        h.model
            .inject_failure(EmbeddingError::permanent("validation"));

        let err = h
            .mapper
            .handle_records(&[record(full_image())])
            .await
            .unwrap_err();
        assert!(matches!(err, MapperError::Fatal { .. }));
    }

    #[tokio::test]
    async fn test_index_retry_budget_exhaustion_is_transient() {
        let h = harness();
        for _ in 0..3 {
            h.index.inject_failure(VectorStoreError::transient("500"));
        }

        let err = h
            .mapper
            .handle_records(&[record(full_image())])
            .await
            .unwrap_err();
        assert!(matches!(err, MapperError::Transient { .. }));
    }
}
