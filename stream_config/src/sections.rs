//! The parsed, validated view of the standard config sections, plus
//! stream identification.

use crate::document::{ConfigDocument, ConfigError};
use data_types::StreamId;
use observability_deps::tracing::info;
use std::path::Path;
use std::time::Duration;
use stream_transport::StreamTransport;

/// The `stream` section: which table's CDC stream to consume and the
/// application identity namespacing its leases.
#[derive(Debug, Clone)]
pub struct StreamSection {
    pub keyspace_name: Option<String>,
    pub table_name: Option<String>,
    /// The stream label (`stream-name`), distinguishing stream
    /// generations of the same table.
    pub stream_label: Option<String>,
    /// An explicit stream id; when set, no enumeration is needed.
    pub stream_id: Option<String>,
    pub region: Option<String>,
    pub application_name: String,
}

impl StreamSection {
    fn from_document(doc: &ConfigDocument) -> Result<Self, ConfigError> {
        Ok(Self {
            keyspace_name: doc.get_string("keyspaces-cdc-streams.stream.keyspace-name")?,
            table_name: doc.get_string("keyspaces-cdc-streams.stream.table-name")?,
            stream_label: doc.get_string("keyspaces-cdc-streams.stream.stream-name")?,
            stream_id: doc.get_string("keyspaces-cdc-streams.stream.stream-id")?,
            region: doc.get_string("keyspaces-cdc-streams.stream.region")?,
            application_name: doc
                .string_or("keyspaces-cdc-streams.stream.application-name", "my-stream-app")?,
        })
    }

    /// The lease namespace for this application.
    pub fn lease_table_name(&self) -> String {
        format!("{}-lease-table", self.application_name)
    }
}

/// The `coordinator` section.
#[derive(Debug, Clone)]
pub struct CoordinatorSection {
    /// Skip the initial shard sync when the lease table is already
    /// populated (fast worker restarts).
    pub skip_shard_sync_if_leases_exist: bool,
    /// Hard deadline for graceful shutdown.
    pub graceful_shutdown_timeout: Duration,
}

impl CoordinatorSection {
    fn from_document(doc: &ConfigDocument) -> Result<Self, ConfigError> {
        Ok(Self {
            skip_shard_sync_if_leases_exist: doc.bool_or(
                "keyspaces-cdc-streams.coordinator.skip-shard-sync-at-worker-initialization-if-leases-exist",
                true,
            )?,
            graceful_shutdown_timeout: doc.millis_or(
                "keyspaces-cdc-streams.coordinator.graceful-shutdown-timeout-millis",
                Duration::from_secs(30),
            )?,
        })
    }
}

/// The `lease-management` section.
#[derive(Debug, Clone)]
pub struct LeaseSection {
    pub shard_sync_interval: Duration,
    pub lease_assignment_interval: Duration,
    pub lease_renewal_interval: Duration,
    pub lease_steal_after: Duration,
    pub auditor_interval: Duration,
    pub auditor_confidence_threshold: usize,
}

impl LeaseSection {
    fn from_document(doc: &ConfigDocument) -> Result<Self, ConfigError> {
        let section = Self {
            shard_sync_interval: doc.millis_or(
                "keyspaces-cdc-streams.lease-management.shard-sync-interval-millis",
                Duration::from_secs(60),
            )?,
            lease_assignment_interval: doc.millis_or(
                "keyspaces-cdc-streams.lease-management.lease-assignment-interval-millis",
                Duration::from_secs(1),
            )?,
            lease_renewal_interval: doc.millis_or(
                "keyspaces-cdc-streams.lease-management.lease-renewal-interval-millis",
                Duration::from_secs(10),
            )?,
            lease_steal_after: doc.millis_or(
                "keyspaces-cdc-streams.lease-management.lease-steal-after-millis",
                Duration::from_secs(30),
            )?,
            auditor_interval: doc.millis_or(
                "keyspaces-cdc-streams.lease-management.leases-recovery-auditor-execution-frequency-millis",
                Duration::from_secs(5),
            )?,
            auditor_confidence_threshold: doc.usize_or(
                "keyspaces-cdc-streams.lease-management.leases-recovery-auditor-inconsistency-confidence-threshold",
                3,
            )?,
        };

        if section.lease_renewal_interval >= section.lease_steal_after {
            return Err(ConfigError::invalid(
                "keyspaces-cdc-streams.lease-management.lease-renewal-interval-millis",
                format!(
                    "renewal interval {:?} must be below the steal-after threshold {:?}",
                    section.lease_renewal_interval, section.lease_steal_after
                ),
            ));
        }
        Ok(section)
    }
}

/// The `processor` section.
#[derive(Debug, Clone)]
pub struct ProcessorSection {
    /// Invoke the pipeline even for empty fetches, to refresh iterators
    /// and checkpoint opportunistically.
    pub call_process_records_even_for_empty_record_list: bool,
    /// Minimum spacing of opportunistic checkpoints on empty fetches.
    pub checkpoint_interval: Duration,
    /// Fetch size requested from the shard iterator.
    pub max_records_per_fetch: usize,
}

impl ProcessorSection {
    fn from_document(doc: &ConfigDocument) -> Result<Self, ConfigError> {
        Ok(Self {
            call_process_records_even_for_empty_record_list: doc.bool_or(
                "keyspaces-cdc-streams.processor.call-process-records-even-for-empty-record-list",
                true,
            )?,
            checkpoint_interval: doc.millis_or(
                "keyspaces-cdc-streams.processor.checkpoint-interval-millis",
                Duration::from_secs(60),
            )?,
            max_records_per_fetch: doc.usize_or(
                "keyspaces-cdc-streams.processor.max-records-per-fetch",
                1000,
            )?,
        })
    }
}

/// Everything the scheduler needs, parsed and validated once at
/// startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub document: ConfigDocument,
    pub stream: StreamSection,
    pub coordinator: CoordinatorSection,
    pub lease: LeaseSection,
    pub processor: ProcessorSection,
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_document(ConfigDocument::from_path(path)?)
    }

    pub fn from_document(document: ConfigDocument) -> Result<Self, ConfigError> {
        Ok(Self {
            stream: StreamSection::from_document(&document)?,
            coordinator: CoordinatorSection::from_document(&document)?,
            lease: LeaseSection::from_document(&document)?,
            processor: ProcessorSection::from_document(&document)?,
            document,
        })
    }

    /// The configured mapper name; the log mapper when none is set.
    pub fn target_mapper_name(&self) -> Result<String, ConfigError> {
        self.document
            .string_or("keyspaces-cdc-streams.connector.target-mapper", "LogMapper")
    }
}

/// Resolves the stream to consume: an explicit id wins, otherwise the
/// `(keyspace, table)` pair (plus label, when set) is matched against
/// the transport's enumeration.
pub async fn resolve_stream_id(
    stream: &StreamSection,
    transport: &dyn StreamTransport,
) -> Result<StreamId, ConfigError> {
    if let Some(id) = &stream.stream_id {
        return Ok(StreamId::new(id.clone()));
    }

    let (keyspace, table) = match (&stream.keyspace_name, &stream.table_name) {
        (Some(k), Some(t)) => (k, t),
        _ => {
            return Err(ConfigError::StreamResolution {
                message: "either stream.stream-id or both stream.keyspace-name and \
                          stream.table-name must be configured"
                    .to_string(),
            })
        }
    };

    let streams = transport
        .list_streams()
        .await
        .map_err(|e| ConfigError::StreamResolution {
            message: format!("stream enumeration failed: {e}"),
        })?;

    let matched = streams.into_iter().find(|s| {
        s.keyspace.eq_ignore_ascii_case(keyspace)
            && s.table.eq_ignore_ascii_case(table)
            && match &stream.stream_label {
                Some(label) => s
                    .label
                    .as_deref()
                    .is_some_and(|l| l.eq_ignore_ascii_case(label)),
                None => true,
            }
    });

    match matched {
        Some(s) => {
            info!(stream_id = %s.stream_id, keyspace, table, "resolved stream");
            Ok(s.stream_id)
        }
        None => Err(ConfigError::StreamResolution {
            message: format!(
                "no stream found for keyspace {keyspace:?} table {table:?} label {:?}",
                stream.stream_label
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stream_transport::mock::MockTransport;

    fn sample_config() -> ServiceConfig {
        let doc = ConfigDocument::from_toml_str(
            r#"
            ["keyspaces-cdc-streams".stream]
            keyspace-name = "media"
            table-name = "movies"
            application-name = "movies-app"

            ["keyspaces-cdc-streams".lease-management]
            lease-steal-after-millis = 45000
            "#,
        )
        .unwrap();
        ServiceConfig::from_document(doc).unwrap()
    }

    #[test]
    fn test_defaults_and_overrides() {
        let config = sample_config();

        assert_eq!(config.stream.application_name, "movies-app");
        assert_eq!(config.stream.lease_table_name(), "movies-app-lease-table");
        assert!(config.coordinator.skip_shard_sync_if_leases_exist);
        assert_eq!(
            config.coordinator.graceful_shutdown_timeout,
            Duration::from_secs(30)
        );
        assert_eq!(config.lease.shard_sync_interval, Duration::from_secs(60));
        assert_eq!(config.lease.lease_steal_after, Duration::from_secs(45));
        assert_eq!(config.lease.auditor_confidence_threshold, 3);
        assert_eq!(
            config.processor.checkpoint_interval,
            Duration::from_secs(60)
        );
        assert!(config.processor.call_process_records_even_for_empty_record_list);
        assert_eq!(config.target_mapper_name().unwrap(), "LogMapper");
    }

    #[test]
    fn test_renewal_must_stay_below_steal_after() {
        let doc = ConfigDocument::from_toml_str(
            r#"
            ["keyspaces-cdc-streams".lease-management]
            lease-renewal-interval-millis = 30000
            lease-steal-after-millis = 30000
            "#,
        )
        .unwrap();
        assert!(matches!(
            ServiceConfig::from_document(doc).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[tokio::test]
    async fn test_resolve_explicit_stream_id() {
        let mut section = sample_config().stream;
        section.stream_id = Some("stream/explicit".to_string());
        let transport = MockTransport::new();

        let resolved = resolve_stream_id(&section, &transport).await.unwrap();
        assert_eq!(resolved, StreamId::from("stream/explicit"));
    }

    #[tokio::test]
    async fn test_resolve_by_keyspace_and_table() {
        let transport = MockTransport::new();
        transport.add_stream("other", "tbl", None);
        let expected = transport.add_stream("media", "movies", None);

        let resolved = resolve_stream_id(&sample_config().stream, &transport)
            .await
            .unwrap();
        assert_eq!(resolved, expected);
    }

    #[tokio::test]
    async fn test_resolve_honors_label() {
        let transport = MockTransport::new();
        transport.add_stream("media", "movies", Some("2024"));
        let expected = transport.add_stream("media", "movies", Some("2025"));

        let mut section = sample_config().stream;
        section.stream_label = Some("2025".to_string());
        let resolved = resolve_stream_id(&section, &transport).await.unwrap();
        assert_eq!(resolved, expected);
    }

    #[tokio::test]
    async fn test_resolve_no_match() {
        let transport = MockTransport::new();
        transport.add_stream("media", "books", None);

        let err = resolve_stream_id(&sample_config().stream, &transport)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::StreamResolution { .. }));
    }

    #[tokio::test]
    async fn test_resolve_requires_identification() {
        let mut section = sample_config().stream;
        section.keyspace_name = None;
        let err = resolve_stream_id(&section, &MockTransport::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::StreamResolution { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        std::fs::write(
            &path,
            r#"
            ["keyspaces-cdc-streams".stream]
            stream-id = "stream/abc"
            "#,
        )
        .unwrap();

        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.stream.stream_id.as_deref(), Some("stream/abc"));

        let err = ServiceConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
