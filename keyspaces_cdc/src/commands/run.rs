//! The `run` command: load config, wire clients, start the consumer,
//! wait for a shutdown signal.

use clock::SystemProvider;
use consumer::{ConsumerConfig, ConsumerHandler, HandlerError, ProcessorConfig};
use data_types::{HashRange, Shard, WorkerId};
use lease_manager::{mem::MemLeaseStore, CoordinatorConfig, CoordinatorMetrics, LeaseCoordinator};
use object_store::{local::LocalFileSystem, memory::InMemory, ObjectStore};
use observability_deps::tracing::info;
use snafu::{ResultExt, Snafu};
use std::path::PathBuf;
use std::sync::Arc;
use stream_config::{resolve_stream_id, ConfigError, ServiceConfig};
use stream_transport::{mock::MockTransport, StreamTransport};
use target_mappers::{
    queue_sink::MockQueueClient, table_sink::MemTabularStore, vector_sink::MemVectorIndexStore,
    vector_sink::MockEmbeddingModel, ClientRegistry, MapperError, MapperRegistry,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("mapper construction failed: {source}"))]
    Mapper { source: MapperError },

    #[snafu(display("consumer startup failed: {source}"))]
    Startup { source: HandlerError },

    #[snafu(display("object store setup failed: {source}"))]
    ObjectStoreSetup { source: object_store::Error },
}

#[derive(Debug, clap::Parser)]
pub struct Config {
    /// Path to the TOML configuration file.
    #[clap(long = "config", env = "KEYSPACES_CDC_CONFIG")]
    config_path: PathBuf,
}

pub async fn command(config: Config) -> Result<(), Error> {
    let service_config = ServiceConfig::load(&config.config_path).context(ConfigSnafu)?;

    let transport = build_transport(&service_config).context(ConfigSnafu)?;
    let stream_id = resolve_stream_id(&service_config.stream, transport.as_ref())
        .await
        .context(ConfigSnafu)?;

    let shutdown = tokio_util::sync::CancellationToken::new();
    let clients = build_clients(&service_config, shutdown.clone()).await?;
    let mapper_name = service_config.target_mapper_name().context(ConfigSnafu)?;
    let mapper = MapperRegistry::with_builtin_mappers()
        .instantiate(&mapper_name, &service_config.document, &clients)
        .context(MapperSnafu)?;

    let metric_registry = Arc::new(metric::Registry::new());
    let time_provider = Arc::new(SystemProvider::new());
    let worker_id = WorkerId::generate(&service_config.stream.application_name);

    // The coordination store is an external collaborator; this binary
    // ships the in-memory one, which is only meaningful for
    // single-process runs. Embedders supply a durable `LeaseStore`
    // through the library API.
    let lease_store = Arc::new(MemLeaseStore::new());
    info!(
        lease_table = %service_config.stream.lease_table_name(),
        worker_id = %worker_id,
        "using in-memory lease store",
    );

    let coordinator = Arc::new(LeaseCoordinator::new(
        stream_id.clone(),
        worker_id,
        lease_store,
        Arc::clone(&transport),
        Arc::clone(&time_provider) as _,
        CoordinatorConfig {
            shard_sync_interval: service_config.lease.shard_sync_interval,
            lease_assignment_interval: service_config.lease.lease_assignment_interval,
            lease_renewal_interval: service_config.lease.lease_renewal_interval,
            lease_steal_after: service_config.lease.lease_steal_after,
            auditor_interval: service_config.lease.auditor_interval,
            auditor_confidence_threshold: service_config.lease.auditor_confidence_threshold,
        },
        CoordinatorMetrics::new(&metric_registry),
    ));

    let handler = ConsumerHandler::new(
        stream_id,
        transport,
        mapper,
        coordinator,
        time_provider,
        metric_registry,
        ConsumerConfig {
            processor: ProcessorConfig {
                checkpoint_interval: service_config.processor.checkpoint_interval,
                invoke_on_empty_batches: service_config
                    .processor
                    .call_process_records_even_for_empty_record_list,
                max_records_per_fetch: service_config.processor.max_records_per_fetch,
                ..Default::default()
            },
            skip_initial_sync_if_leases_exist: service_config
                .coordinator
                .skip_shard_sync_if_leases_exist,
            shutdown_timeout: service_config.coordinator.graceful_shutdown_timeout,
        },
        shutdown,
    )
    .await
    .context(StartupSnafu)?;

    tokio::select! {
        _ = wait_for_signal() => {
            info!("shutdown signal received");
            handler.shutdown();
        }
        _ = handler.join() => {}
    }
    handler.join().await;
    info!("graceful shutdown complete");
    Ok(())
}

/// The CDC transport is an external collaborator. This binary ships the
/// in-memory transport for smoke runs (`stream.transport = "memory"`);
/// a real deployment embeds the consumer library with its own
/// `StreamTransport` implementation.
fn build_transport(config: &ServiceConfig) -> Result<Arc<dyn StreamTransport>, ConfigError> {
    let kind = config
        .document
        .string_or("keyspaces-cdc-streams.stream.transport", "memory")?;
    match kind.as_str() {
        "memory" => {
            let transport = MockTransport::new();
            let stream_id = transport.add_stream(
                config.stream.keyspace_name.as_deref().unwrap_or("smoke"),
                config.stream.table_name.as_deref().unwrap_or("smoke"),
                config.stream.stream_label.as_deref(),
            );
            transport.add_shard(
                &stream_id,
                Shard::root("shard-0000", HashRange::new(0, u128::MAX)),
            );
            Ok(Arc::new(transport))
        }
        other => Err(ConfigError::invalid(
            "keyspaces-cdc-streams.stream.transport",
            format!("no transport implementation named {other:?} is compiled in"),
        )),
    }
}

/// Builds the client registry handed to the mapper factory. Only the
/// object store is configurable (`memory` or `file`); the remaining
/// sink clients default to in-memory implementations and are replaced
/// through the library API in real deployments.
async fn build_clients(
    config: &ServiceConfig,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<ClientRegistry, Error> {
    let store_kind = config
        .document
        .string_or("keyspaces-cdc-streams.connector.object-store", "memory")
        .context(ConfigSnafu)?;
    let object_store: Arc<dyn ObjectStore> = match store_kind.as_str() {
        "memory" => Arc::new(InMemory::new()),
        "file" => {
            let root = config
                .document
                .require_string("keyspaces-cdc-streams.connector.object-store-root")
                .context(ConfigSnafu)?;
            Arc::new(
                LocalFileSystem::new_with_prefix(root).context(ObjectStoreSetupSnafu)?,
            )
        }
        other => {
            return Err(Error::Config {
                source: ConfigError::invalid(
                    "keyspaces-cdc-streams.connector.object-store",
                    format!("expected \"memory\" or \"file\", found {other:?}"),
                ),
            })
        }
    };

    Ok(ClientRegistry::new()
        .with_shutdown_token(shutdown)
        .with_object_store(object_store)
        .with_tabular_store(Arc::new(MemTabularStore::new()))
        .with_vector_index(Arc::new(MemVectorIndexStore::new()))
        .with_embedding_model(Arc::new(MockEmbeddingModel::new()))
        .with_queue(Arc::new(MockQueueClient::new())))
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
