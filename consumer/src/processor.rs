//! The per-shard record processor: fetch → decode → filter → deliver →
//! checkpoint, repeated until the shard ends, the lease is lost, or
//! shutdown is requested.

use crate::metrics::ProcessorMetrics;
use clock::{Time, TimeProvider};
use data_types::{decode_record, Checkpoint, DecodedRecord, OperationType, ShardId, StreamId};
use lease_manager::{CheckpointError, LeaseCoordinator};
use observability_deps::tracing::{debug, error, info, warn};
use snafu::{ResultExt, Snafu};
use std::sync::Arc;
use std::time::Duration;
use stream_transport::{FetchedBatch, ShardIterator, StreamTransport, TransportError};
use target_mappers::{MapperError, TargetMapper};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
pub enum ProcessorError {
    #[snafu(display("failed to open iterator for shard {shard_id}: {source}"))]
    OpenIterator {
        shard_id: ShardId,
        source: TransportError,
    },

    #[snafu(display("fetch from shard {shard_id} failed permanently: {source}"))]
    Fetch {
        shard_id: ShardId,
        source: TransportError,
    },

    #[snafu(display("mapper failed fatally on shard {shard_id}: {source}"))]
    Mapper {
        shard_id: ShardId,
        source: MapperError,
    },

    #[snafu(display("checkpoint failed on shard {shard_id}: {source}"))]
    Checkpoint {
        shard_id: ShardId,
        source: CheckpointError,
    },
}

/// How a processor run concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardOutcome {
    /// End-of-shard observed and the final checkpoint written; child
    /// shards may now be processed (once the auditor clears the lease).
    Ended,
    /// Another worker took the lease; resources released, nothing
    /// checkpointed.
    LeaseLost,
    /// Shutdown requested; a final checkpoint was attempted.
    Quiesced,
}

/// Processor tuning knobs.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Minimum spacing of opportunistic checkpoints on empty fetches.
    pub checkpoint_interval: Duration,
    /// Whether the mapper is invoked for empty fetches.
    pub invoke_on_empty_batches: bool,
    /// Fetch size requested from the shard iterator.
    pub max_records_per_fetch: usize,
    /// Pause between fetches when the shard is idle or a batch failed.
    pub idle_fetch_delay: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(60),
            invoke_on_empty_batches: true,
            max_records_per_fetch: 1000,
            idle_fetch_delay: Duration::from_millis(500),
        }
    }
}

/// Processes one shard sequentially. Records are delivered to the
/// mapper in stream order and the checkpoint advances monotonically;
/// delivery failures re-fetch from the last durable checkpoint, so
/// duplicates are possible (at-least-once) but gaps are not.
#[derive(Debug)]
pub struct ShardProcessor {
    stream_id: StreamId,
    shard_id: ShardId,
    transport: Arc<dyn StreamTransport>,
    mapper: Arc<dyn TargetMapper>,
    coordinator: Arc<LeaseCoordinator>,
    time_provider: Arc<dyn TimeProvider>,
    metrics: ProcessorMetrics,
    config: ProcessorConfig,
}

/// What one loop iteration decided.
enum Step {
    Continue,
    /// Delivery or decode failed: re-open the iterator at the durable
    /// checkpoint and try again.
    Refetch,
    Done(ShardOutcome),
}

impl ShardProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream_id: StreamId,
        shard_id: ShardId,
        transport: Arc<dyn StreamTransport>,
        mapper: Arc<dyn TargetMapper>,
        coordinator: Arc<LeaseCoordinator>,
        time_provider: Arc<dyn TimeProvider>,
        metrics: ProcessorMetrics,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            stream_id,
            shard_id,
            transport,
            mapper,
            coordinator,
            time_provider,
            metrics,
            config,
        }
    }

    /// Runs until the shard ends, the lease is lost, shutdown is
    /// requested, or a fatal error occurs.
    pub async fn run(
        self,
        from: Checkpoint,
        shutdown: CancellationToken,
    ) -> Result<ShardOutcome, ProcessorError> {
        info!(
            worker_id = %self.coordinator.worker_id(),
            shard_id = %self.shard_id,
            checkpoint = %from,
            mapper = self.mapper.name(),
            "shard processor running",
        );

        let mut position = from;
        let mut iterator = self.open_iterator(&position).await?;
        let mut last_checkpoint_write = self.time_provider.now();

        loop {
            let fetched = tokio::select! {
                _ = shutdown.cancelled() => {
                    return self.quiesce(position).await;
                }
                fetched = self.transport.next(
                    &self.stream_id,
                    &mut iterator,
                    self.config.max_records_per_fetch,
                ) => fetched,
            };

            let batch = match fetched {
                Ok(batch) => batch,
                Err(e) if e.is_transient() => {
                    warn!(
                        shard_id = %self.shard_id,
                        error = %e,
                        "transient fetch failure",
                    );
                    if self.pause(&shutdown).await {
                        return self.quiesce(position).await;
                    }
                    continue;
                }
                Err(e) => {
                    return Err(e).context(FetchSnafu {
                        shard_id: self.shard_id.clone(),
                    });
                }
            };

            match self
                .process_batch(batch, &mut position, &mut last_checkpoint_write)
                .await?
            {
                Step::Continue => {}
                Step::Refetch => {
                    if self.pause(&shutdown).await {
                        return self.quiesce(position).await;
                    }
                    iterator = self.open_iterator(&position).await?;
                }
                Step::Done(outcome) => return Ok(outcome),
            }
        }
    }

    /// One fetched batch through the pipeline. Advances `position` on
    /// successful delivery.
    async fn process_batch(
        &self,
        batch: FetchedBatch,
        position: &mut Checkpoint,
        last_checkpoint_write: &mut Time,
    ) -> Result<Step, ProcessorError> {
        if batch.records.is_empty() {
            return self
                .process_empty_batch(batch.end_of_shard, position, last_checkpoint_write)
                .await;
        }

        self.metrics.records_in.inc(batch.records.len() as u64);
        let last_sequence = batch.records[batch.records.len() - 1]
            .sequence_number
            .clone();

        let mut decoded: Vec<DecodedRecord> = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            if record.operation() == OperationType::Unknown {
                self.metrics.records_rejected_unknown_op.inc(1);
                warn!(
                    shard_id = %self.shard_id,
                    sequence_number = %record.sequence_number,
                    origin = %record.origin,
                    "rejecting record with unclassifiable operation",
                );
                continue;
            }
            match decode_record(record) {
                Ok(decoded_record) => decoded.push(decoded_record),
                Err(e) => {
                    error!(
                        shard_id = %self.shard_id,
                        sequence_number = %record.sequence_number,
                        error = %e,
                        "record decode failed; batch will be refetched",
                    );
                    self.metrics.batch_retries.inc(1);
                    return Ok(Step::Refetch);
                }
            }
        }

        let decoded_count = decoded.len();
        let filtered = self.mapper.filter_records(decoded);
        self.metrics
            .records_filtered
            .inc((decoded_count - filtered.len()) as u64);

        if !filtered.is_empty() {
            if let Err(e) = self.mapper.handle_records(&filtered).await {
                return self.handle_delivery_failure(e);
            }
            self.metrics.records_delivered.inc(filtered.len() as u64);
        }

        // The checkpoint covers the whole fetched batch, including
        // records that were filtered out or rejected.
        let checkpoint = Checkpoint::At(last_sequence);
        match self.advance(checkpoint.clone()).await? {
            Some(outcome) => return Ok(Step::Done(outcome)),
            None => {
                *position = checkpoint;
                *last_checkpoint_write = self.time_provider.now();
            }
        }

        if batch.end_of_shard {
            return self.finish_shard().await;
        }
        Ok(Step::Continue)
    }

    async fn process_empty_batch(
        &self,
        end_of_shard: bool,
        position: &mut Checkpoint,
        last_checkpoint_write: &mut Time,
    ) -> Result<Step, ProcessorError> {
        if end_of_shard {
            return self.finish_shard().await;
        }

        if self.config.invoke_on_empty_batches {
            let filtered = self.mapper.filter_records(vec![]);
            if let Err(e) = self.mapper.handle_records(&filtered).await {
                return self.handle_delivery_failure(e);
            }

            let elapsed = self
                .time_provider
                .now()
                .checked_duration_since(*last_checkpoint_write)
                .unwrap_or_default();
            if elapsed >= self.config.checkpoint_interval {
                debug!(shard_id = %self.shard_id, checkpoint = %position, "idle checkpoint");
                if let Some(outcome) = self.advance(position.clone()).await? {
                    return Ok(Step::Done(outcome));
                }
                *last_checkpoint_write = self.time_provider.now();
            }
        }
        Ok(Step::Refetch)
    }

    fn handle_delivery_failure(&self, e: MapperError) -> Result<Step, ProcessorError> {
        match &e {
            MapperError::PartialFailure { .. } => self.metrics.batch_partial_failures.inc(1),
            MapperError::TotalFailure { .. } => self.metrics.batch_total_failures.inc(1),
            _ => {}
        }
        if e.is_batch_retryable() {
            self.metrics.batch_retries.inc(1);
            warn!(
                shard_id = %self.shard_id,
                mapper = self.mapper.name(),
                error = %e,
                "batch delivery failed; checkpoint unchanged, batch will be refetched",
            );
            return Ok(Step::Refetch);
        }
        Err(ProcessorError::Mapper {
            shard_id: self.shard_id.clone(),
            source: e,
        })
    }

    /// Writes the checkpoint; `Some(outcome)` means the shard is over
    /// (lease lost).
    async fn advance(
        &self,
        checkpoint: Checkpoint,
    ) -> Result<Option<ShardOutcome>, ProcessorError> {
        match self
            .coordinator
            .advance_checkpoint(&self.shard_id, checkpoint)
            .await
        {
            Ok(()) => Ok(None),
            Err(CheckpointError::LeaseLost { new_owner, .. }) => {
                warn!(
                    shard_id = %self.shard_id,
                    worker_id = %self.coordinator.worker_id(),
                    ?new_owner,
                    "lease lost; abandoning shard",
                );
                Ok(Some(ShardOutcome::LeaseLost))
            }
            Err(e) => Err(ProcessorError::Checkpoint {
                shard_id: self.shard_id.clone(),
                source: e,
            }),
        }
    }

    /// End-of-shard: write the terminal checkpoint.
    async fn finish_shard(&self) -> Result<Step, ProcessorError> {
        info!(shard_id = %self.shard_id, "shard ended; writing final checkpoint");
        match self.advance(Checkpoint::ShardEnd).await? {
            Some(outcome) => Ok(Step::Done(outcome)),
            None => Ok(Step::Done(ShardOutcome::Ended)),
        }
    }

    /// Shutdown requested: attempt a final checkpoint, then terminate.
    async fn quiesce(&self, position: Checkpoint) -> Result<ShardOutcome, ProcessorError> {
        info!(shard_id = %self.shard_id, checkpoint = %position, "quiescing");
        match self.advance(position).await? {
            Some(ShardOutcome::LeaseLost) => Ok(ShardOutcome::LeaseLost),
            _ => Ok(ShardOutcome::Quiesced),
        }
    }

    async fn open_iterator(&self, position: &Checkpoint) -> Result<ShardIterator, ProcessorError> {
        self.transport
            .open_iterator(&self.stream_id, &self.shard_id, position)
            .await
            .context(OpenIteratorSnafu {
                shard_id: self.shard_id.clone(),
            })
    }

    /// Sleeps the idle delay; returns true if shutdown fired first.
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.config.idle_fetch_delay) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use clock::MockProvider;
    use data_types::{
        CdcCell, CellTag, ChangeRecord, HashRange, Lease, OriginType, RowImage, SequenceNumber,
        Shard, WorkerId,
    };
    use lease_manager::{
        CoordinatorConfig, CoordinatorMetrics, LeaseStore, UpdateOutcome,
    };
    use metric::Registry;
    use parking_lot::Mutex;
    use stream_transport::mock::MockTransport;

    /// A mapper that records delivered sequence numbers and can fail on
    /// demand.
    #[derive(Debug, Default)]
    struct RecordingMapper {
        handled: Mutex<Vec<Vec<SequenceNumber>>>,
        failures: Mutex<Vec<MapperError>>,
        filter: target_mappers::FilterWiring,
    }

    impl RecordingMapper {
        fn with_filter(expression: &str) -> Self {
            let toml = format!(
                "[\"keyspaces-cdc-streams\".connector]\nfilter-expression = {expression:?}\n"
            );
            let config = stream_config::ConfigDocument::from_toml_str(&toml).unwrap();
            Self {
                filter: target_mappers::FilterWiring::from_config(&config).unwrap(),
                ..Default::default()
            }
        }

        fn fail_next(&self, error: MapperError) {
            self.failures.lock().push(error);
        }

        fn delivered(&self) -> Vec<Vec<SequenceNumber>> {
            self.handled
                .lock()
                .iter()
                .filter(|batch| !batch.is_empty())
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl TargetMapper for RecordingMapper {
        fn name(&self) -> &'static str {
            "RecordingMapper"
        }

        async fn initialize(&self) -> Result<(), MapperError> {
            Ok(())
        }

        fn filter_records(&self, records: Vec<DecodedRecord>) -> Vec<DecodedRecord> {
            self.filter.apply(records)
        }

        async fn handle_records(&self, records: &[DecodedRecord]) -> Result<(), MapperError> {
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
            self.handled
                .lock()
                .push(records.iter().map(|r| r.sequence_number.clone()).collect());
            Ok(())
        }
    }

    struct Fixture {
        transport: MockTransport,
        store: lease_manager::mem::MemLeaseStore,
        coordinator: Arc<LeaseCoordinator>,
        time_provider: Arc<MockProvider>,
        registry: Arc<Registry>,
        stream_id: StreamId,
        shard_id: ShardId,
    }

    impl Fixture {
        async fn new() -> Self {
            let transport = MockTransport::new();
            let stream_id = transport.add_stream("ks", "tbl", None);
            let shard_id = ShardId::from("s-0");
            transport.add_shard(&stream_id, Shard::root("s-0", HashRange::new(0, u128::MAX)));

            let store = lease_manager::mem::MemLeaseStore::new();
            let time_provider = Arc::new(MockProvider::new(clock::Time::from_timestamp_millis(0)));
            let registry = Arc::new(Registry::new());
            let coordinator = Arc::new(LeaseCoordinator::new(
                stream_id.clone(),
                WorkerId::from("w1"),
                Arc::new(store.clone()),
                Arc::new(transport.clone()),
                Arc::clone(&time_provider) as _,
                CoordinatorConfig::default(),
                CoordinatorMetrics::new(&registry),
            ));
            coordinator.sync_shards().await.unwrap();
            coordinator.acquire_leases().await.unwrap();

            Self {
                transport,
                store,
                coordinator,
                time_provider,
                registry,
                stream_id,
                shard_id,
            }
        }

        fn processor(&self, mapper: Arc<dyn TargetMapper>) -> ShardProcessor {
            ShardProcessor::new(
                self.stream_id.clone(),
                self.shard_id.clone(),
                Arc::new(self.transport.clone()),
                mapper,
                Arc::clone(&self.coordinator),
                Arc::clone(&self.time_provider) as _,
                ProcessorMetrics::new(&self.registry, &self.shard_id),
                ProcessorConfig {
                    idle_fetch_delay: Duration::from_millis(5),
                    ..Default::default()
                },
            )
        }

        fn push_insert(&self, seq: &str, n: i32) {
            self.push(seq, OriginType::User, Some(n), None)
        }

        fn push(&self, seq: &str, origin: OriginType, new_n: Option<i32>, old_n: Option<i32>) {
            let image = |n: i32| {
                RowImage::from([
                    ("id".to_string(), CdcCell::text(CellTag::Text, seq)),
                    ("n".to_string(), CdcCell::text(CellTag::Int, n.to_string())),
                ])
            };
            self.transport.push_record(
                &self.stream_id,
                &self.shard_id,
                ChangeRecord {
                    sequence_number: SequenceNumber::from(seq),
                    arrival_time: clock::Time::from_timestamp_millis(0),
                    origin,
                    new_image: new_n.map(image),
                    old_image: old_n.map(image),
                },
            );
        }

        async fn checkpoint(&self) -> Checkpoint {
            self.store
                .get(&self.shard_id)
                .await
                .unwrap()
                .unwrap()
                .checkpoint
        }

        fn counter(&self, name: &'static str) -> u64 {
            self.registry
                .get_instrument::<metric::Metric<metric::U64Counter>>(name)
                .map(|m| {
                    m.get_observer(&metric::Attributes::from([(
                        "shard_id",
                        self.shard_id.to_string(),
                    )]))
                    .map(|o| o.fetch())
                    .unwrap_or(0)
                })
                .unwrap_or(0)
        }
    }

    #[tokio::test]
    async fn test_processes_to_shard_end() {
        let fixture = Fixture::new().await;
        let mapper = Arc::new(RecordingMapper::default());

        fixture.push_insert("100", 1);
        fixture.push_insert("101", 2);
        fixture.transport.end_shard(&fixture.stream_id, &fixture.shard_id);

        let outcome = fixture
            .processor(Arc::clone(&mapper) as _)
            .run(Checkpoint::TrimHorizon, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ShardOutcome::Ended);
        assert_eq!(fixture.checkpoint().await, Checkpoint::ShardEnd);
        assert_eq!(
            mapper.delivered(),
            vec![vec![SequenceNumber::from("100"), SequenceNumber::from("101")]]
        );
        assert_eq!(fixture.counter("records_in"), 2);
        assert_eq!(fixture.counter("records_delivered"), 2);
    }

    #[tokio::test]
    async fn test_resumes_from_checkpoint() {
        let fixture = Fixture::new().await;
        let mapper = Arc::new(RecordingMapper::default());

        for seq in ["100", "101", "102"] {
            fixture.push_insert(seq, 1);
        }
        fixture.transport.end_shard(&fixture.stream_id, &fixture.shard_id);

        fixture
            .processor(Arc::clone(&mapper) as _)
            .run(
                Checkpoint::At(SequenceNumber::from("101")),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(mapper.delivered(), vec![vec![SequenceNumber::from("102")]]);
    }

    #[tokio::test]
    async fn test_filter_excludes_records_but_checkpoint_covers_them() {
        let fixture = Fixture::new().await;
        let mapper = Arc::new(RecordingMapper::with_filter(
            "metadata.operation == 'INSERT' && newImage.n > 5",
        ));

        fixture.push("10", OriginType::User, Some(10), None);
        fixture.push("11", OriginType::User, Some(3), None);
        fixture.push("12", OriginType::User, None, Some(10));
        fixture.transport.end_shard(&fixture.stream_id, &fixture.shard_id);

        let outcome = fixture
            .processor(Arc::clone(&mapper) as _)
            .run(Checkpoint::TrimHorizon, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ShardOutcome::Ended);
        assert_eq!(mapper.delivered(), vec![vec![SequenceNumber::from("10")]]);
        assert_eq!(fixture.counter("records_filtered"), 2);
        assert_eq!(fixture.counter("records_delivered"), 1);
        // The final checkpoint still covers every fetched record.
        assert_eq!(fixture.checkpoint().await, Checkpoint::ShardEnd);
    }

    #[tokio::test]
    async fn test_unknown_operation_rejected_and_checkpoint_advances() {
        let fixture = Fixture::new().await;
        let mapper = Arc::new(RecordingMapper::default());

        fixture.push_insert("100", 1);
        // Neither image: classifies as UNKNOWN.
        fixture.push("101", OriginType::User, None, None);
        fixture.transport.end_shard(&fixture.stream_id, &fixture.shard_id);

        let outcome = fixture
            .processor(Arc::clone(&mapper) as _)
            .run(Checkpoint::TrimHorizon, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ShardOutcome::Ended);
        assert_eq!(fixture.counter("records_rejected_unknown_op"), 1);
        assert_eq!(mapper.delivered(), vec![vec![SequenceNumber::from("100")]]);
        assert_eq!(fixture.checkpoint().await, Checkpoint::ShardEnd);
    }

    #[tokio::test]
    async fn test_failed_batch_is_redelivered_without_checkpoint_gap() {
        let fixture = Fixture::new().await;
        let mapper = Arc::new(RecordingMapper::default());
        mapper.fail_next(MapperError::batch_failure(
            2,
            vec!["message 101: InvalidParameter: bad".to_string()],
        ));

        fixture.push_insert("100", 1);
        fixture.push_insert("101", 2);
        fixture.transport.end_shard(&fixture.stream_id, &fixture.shard_id);

        let outcome = fixture
            .processor(Arc::clone(&mapper) as _)
            .run(Checkpoint::TrimHorizon, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ShardOutcome::Ended);
        // The whole batch was delivered again after the partial failure.
        assert_eq!(
            mapper.delivered(),
            vec![vec![SequenceNumber::from("100"), SequenceNumber::from("101")]]
        );
        assert_eq!(fixture.counter("batch_partial_failures"), 1);
        assert_eq!(fixture.counter("batch_retries"), 1);
        assert_eq!(fixture.checkpoint().await, Checkpoint::ShardEnd);
    }

    #[tokio::test]
    async fn test_partial_failure_leaves_checkpoint_unchanged() {
        let fixture = Fixture::new().await;
        let mapper = Arc::new(RecordingMapper::default());
        // Fail forever: the checkpoint must never move.
        for _ in 0..64 {
            mapper.fail_next(MapperError::batch_failure(1, vec!["nope".to_string()]));
        }

        fixture.push_insert("100", 1);

        let shutdown = CancellationToken::new();
        let processor = fixture.processor(Arc::clone(&mapper) as _);
        let handle = tokio::spawn(processor.run(Checkpoint::TrimHorizon, shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let before_shutdown = fixture.checkpoint().await;
        assert_eq!(before_shutdown, Checkpoint::TrimHorizon);

        shutdown.cancel();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, ShardOutcome::Quiesced);
        assert_eq!(fixture.checkpoint().await, Checkpoint::TrimHorizon);
    }

    #[tokio::test]
    async fn test_fatal_mapper_error_kills_the_shard() {
        let fixture = Fixture::new().await;
        let mapper = Arc::new(RecordingMapper::default());
        mapper.fail_next(MapperError::fatal("serialization bug"));

        fixture.push_insert("100", 1);

        let err = fixture
            .processor(Arc::clone(&mapper) as _)
            .run(Checkpoint::TrimHorizon, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Mapper { .. }));
    }

    #[tokio::test]
    async fn test_quiesce_writes_final_checkpoint() {
        let fixture = Fixture::new().await;
        let mapper = Arc::new(RecordingMapper::default());

        fixture.push_insert("100", 1);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            fixture
                .processor(Arc::clone(&mapper) as _)
                .run(Checkpoint::TrimHorizon, shutdown.clone()),
        );

        // Wait for the record to be processed, then request shutdown.
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if fixture.checkpoint().await == Checkpoint::At(SequenceNumber::from("100")) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("checkpoint reached");

        let counter_before = fixture
            .store
            .get(&fixture.shard_id)
            .await
            .unwrap()
            .unwrap()
            .counter;
        shutdown.cancel();
        let outcome = handle.await.unwrap().unwrap();

        assert_eq!(outcome, ShardOutcome::Quiesced);
        let lease = fixture.store.get(&fixture.shard_id).await.unwrap().unwrap();
        assert_eq!(lease.checkpoint, Checkpoint::At(SequenceNumber::from("100")));
        assert!(lease.counter > counter_before, "final checkpoint was written");
    }

    #[tokio::test]
    async fn test_lease_lost_abandons_without_checkpoint() {
        let fixture = Fixture::new().await;
        let mapper = Arc::new(RecordingMapper::default());

        // Another worker takes the lease behind our back.
        let mut stolen: Lease = fixture.store.get(&fixture.shard_id).await.unwrap().unwrap();
        let expected = stolen.counter;
        stolen.owner = Some(WorkerId::from("w2"));
        stolen.counter += 1;
        assert_eq!(
            fixture.store.update_if(&stolen, expected).await.unwrap(),
            UpdateOutcome::Written
        );

        fixture.push_insert("100", 1);

        let outcome = fixture
            .processor(Arc::clone(&mapper) as _)
            .run(Checkpoint::TrimHorizon, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ShardOutcome::LeaseLost);
        let lease = fixture.store.get(&fixture.shard_id).await.unwrap().unwrap();
        assert_eq!(lease.owner, Some(WorkerId::from("w2")));
        assert_eq!(lease.checkpoint, Checkpoint::TrimHorizon);
    }

    #[tokio::test]
    async fn test_idle_shard_checkpoints_opportunistically() {
        let fixture = Fixture::new().await;
        let mapper = Arc::new(RecordingMapper::default());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            fixture
                .processor(Arc::clone(&mapper) as _)
                .run(Checkpoint::TrimHorizon, shutdown.clone()),
        );

        async fn counter_at(fixture: &Fixture) -> u64 {
            fixture
                .store
                .get(&fixture.shard_id)
                .await
                .unwrap()
                .unwrap()
                .counter
        }

        // Within the interval: no opportunistic checkpoint.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let early = counter_at(&fixture).await;

        // Step the mock clock past the interval; the next empty fetch
        // writes a heartbeat checkpoint.
        fixture.time_provider.inc(Duration::from_secs(61));
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if counter_at(&fixture).await > early {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("opportunistic checkpoint");

        assert_eq!(fixture.checkpoint().await, Checkpoint::TrimHorizon);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
