//! The mapper contract, the injected-client registry and the
//! compile-time mapper registry.

use crate::error::MapperError;
use crate::queue_sink::QueueClient;
use crate::table_sink::TabularStore;
use crate::vector_sink::{EmbeddingModel, VectorIndexStore};
use async_trait::async_trait;
use data_types::DecodedRecord;
use object_store::ObjectStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use stream_config::ConfigDocument;
use tokio_util::sync::CancellationToken;

/// A sink adapter. One instance serves every shard of the worker;
/// implementations share long-lived clients internally and keep no
/// per-shard state.
#[async_trait]
pub trait TargetMapper: Send + Sync + std::fmt::Debug {
    /// The mapper's registered name, for logs and metrics.
    fn name(&self) -> &'static str;

    /// Performed once before the first batch. Idempotent: the scheduler
    /// may call it again after partial startup.
    async fn initialize(&self) -> Result<(), MapperError>;

    /// Applies the configured filter expression, if any. The default
    /// wiring lives in [`crate::FilterWiring`]; mappers delegate to it.
    fn filter_records(&self, records: Vec<DecodedRecord>) -> Vec<DecodedRecord>;

    /// Delivers one batch. Batch-granular failures surface as
    /// [`MapperError::PartialFailure`] / [`MapperError::TotalFailure`];
    /// both leave the checkpoint untouched so the batch is redelivered
    /// (sinks must tolerate duplicates).
    async fn handle_records(&self, records: &[DecodedRecord]) -> Result<(), MapperError>;
}

/// The transport clients a worker owns and lends to its mappers.
///
/// Built once by the scheduler and passed to every factory; mappers
/// take `Arc` clones of what they need, so all shards share one client
/// per transport.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub tabular_store: Option<Arc<dyn TabularStore>>,
    pub vector_index: Option<Arc<dyn VectorIndexStore>>,
    pub embedding_model: Option<Arc<dyn EmbeddingModel>>,
    pub queue: Option<Arc<dyn QueueClient>>,
    /// The worker's shutdown token. Sinks consult it between retry
    /// attempts: the in-flight transport call completes, but no fresh
    /// retry starts after cancellation.
    pub shutdown: CancellationToken,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shutdown_token(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    pub fn with_tabular_store(mut self, store: Arc<dyn TabularStore>) -> Self {
        self.tabular_store = Some(store);
        self
    }

    pub fn with_vector_index(mut self, index: Arc<dyn VectorIndexStore>) -> Self {
        self.vector_index = Some(index);
        self
    }

    pub fn with_embedding_model(mut self, model: Arc<dyn EmbeddingModel>) -> Self {
        self.embedding_model = Some(model);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn QueueClient>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn require_object_store(&self) -> Result<Arc<dyn ObjectStore>, MapperError> {
        self.object_store
            .clone()
            .ok_or_else(|| MapperError::config("no object-store client registered"))
    }

    pub fn require_tabular_store(&self) -> Result<Arc<dyn TabularStore>, MapperError> {
        self.tabular_store
            .clone()
            .ok_or_else(|| MapperError::config("no tabular-store client registered"))
    }

    pub fn require_vector_index(&self) -> Result<Arc<dyn VectorIndexStore>, MapperError> {
        self.vector_index
            .clone()
            .ok_or_else(|| MapperError::config("no vector-index client registered"))
    }

    pub fn require_embedding_model(&self) -> Result<Arc<dyn EmbeddingModel>, MapperError> {
        self.embedding_model
            .clone()
            .ok_or_else(|| MapperError::config("no embedding-model client registered"))
    }

    pub fn require_queue(&self) -> Result<Arc<dyn QueueClient>, MapperError> {
        self.queue
            .clone()
            .ok_or_else(|| MapperError::config("no queue client registered"))
    }
}

/// Constructs a mapper from the config document and the worker's
/// clients.
pub type MapperFactory =
    fn(&ConfigDocument, &ClientRegistry) -> Result<Arc<dyn TargetMapper>, MapperError>;

/// Module prefixes unqualified mapper names resolve against, in order.
const DEFAULT_NAME_PREFIXES: &[&str] = &[
    "target_mappers::object_store_sink",
    "target_mappers::table_sink",
    "target_mappers::vector_sink",
    "target_mappers::queue_sink",
    "target_mappers::log_sink",
];

/// Mapper factories keyed by fully-qualified name. A qualified
/// configured name (`a::b::Mapper`) is looked up verbatim; an
/// unqualified one (`Mapper`) is tried against the default prefixes.
#[derive(Debug, Default)]
pub struct MapperRegistry {
    factories: BTreeMap<String, MapperFactory>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in sink registered.
    pub fn with_builtin_mappers() -> Self {
        let mut registry = Self::new();
        registry.register(
            "target_mappers::object_store_sink::ObjectStoreMapper",
            crate::object_store_sink::ObjectStoreMapper::from_config,
        );
        registry.register(
            "target_mappers::table_sink::TableMapper",
            crate::table_sink::TableMapper::from_config,
        );
        registry.register(
            "target_mappers::vector_sink::VectorMapper",
            crate::vector_sink::VectorMapper::from_config,
        );
        registry.register(
            "target_mappers::queue_sink::QueueMapper",
            crate::queue_sink::QueueMapper::from_config,
        );
        registry.register(
            "target_mappers::log_sink::LogMapper",
            crate::log_sink::LogMapper::from_config,
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: MapperFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Resolves a configured mapper name to its factory.
    pub fn resolve(&self, name: &str) -> Option<MapperFactory> {
        if name.contains("::") {
            return self.factories.get(name).copied();
        }
        DEFAULT_NAME_PREFIXES
            .iter()
            .find_map(|prefix| self.factories.get(&format!("{prefix}::{name}")).copied())
    }

    /// Resolves and constructs the mapper.
    pub fn instantiate(
        &self,
        name: &str,
        config: &ConfigDocument,
        clients: &ClientRegistry,
    ) -> Result<Arc<dyn TargetMapper>, MapperError> {
        let factory = self.resolve(name).ok_or_else(|| {
            MapperError::config(format!("unknown target mapper {name:?}"))
        })?;
        factory(config, clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_clients() -> (MapperRegistry, ClientRegistry) {
        let clients = ClientRegistry::new()
            .with_object_store(Arc::new(object_store::memory::InMemory::new()));
        (MapperRegistry::with_builtin_mappers(), clients)
    }

    #[test]
    fn test_unqualified_name_resolves_through_prefixes() {
        let (registry, _) = registry_with_clients();
        assert!(registry.resolve("ObjectStoreMapper").is_some());
        assert!(registry.resolve("LogMapper").is_some());
        assert!(registry.resolve("NoSuchMapper").is_none());
    }

    #[test]
    fn test_qualified_name_is_used_verbatim() {
        let (registry, _) = registry_with_clients();
        assert!(registry
            .resolve("target_mappers::queue_sink::QueueMapper")
            .is_some());
        assert!(registry.resolve("elsewhere::QueueMapper").is_none());
    }

    #[test]
    fn test_instantiate_builds_configured_mapper() {
        let (registry, clients) = registry_with_clients();
        let config = ConfigDocument::from_toml_str(
            r#"
            ["keyspaces-cdc-streams".connector]
            bucket = "b"
            prefix = "p"
            "#,
        )
        .unwrap();

        let mapper = registry
            .instantiate("ObjectStoreMapper", &config, &clients)
            .unwrap();
        assert_eq!(mapper.name(), "ObjectStoreMapper");
    }

    #[test]
    fn test_instantiate_unknown_mapper_is_config_error() {
        let (registry, clients) = registry_with_clients();
        let err = registry
            .instantiate("Missing", &ConfigDocument::empty(), &clients)
            .unwrap_err();
        assert!(matches!(err, MapperError::Config { .. }));
    }

    #[test]
    fn test_factory_propagates_missing_required_option() {
        let (registry, clients) = registry_with_clients();
        // No bucket/prefix configured.
        let err = registry
            .instantiate("ObjectStoreMapper", &ConfigDocument::empty(), &clients)
            .unwrap_err();
        assert!(matches!(err, MapperError::Config { .. }));
    }
}
