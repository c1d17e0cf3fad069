//! The top-level consumer handler: one per worker process.
//!
//! On construction it initializes the mapper, optionally performs the
//! initial shard sync, and spawns the background tasks: shard sync,
//! lease assignment (which owns the per-shard processor tasks), lease
//! renewal and the garbage-lease auditor. Shutdown propagates a
//! cancellation token; processors quiesce with a final checkpoint and
//! leases are released, all under a hard deadline.

use crate::metrics::ProcessorMetrics;
use crate::processor::{ProcessorConfig, ShardOutcome, ShardProcessor};
use clock::TimeProvider;
use data_types::{ShardId, StreamId};
use futures::{
    future::{BoxFuture, Shared},
    stream::FuturesUnordered,
    FutureExt, StreamExt, TryFutureExt,
};
use lease_manager::LeaseCoordinator;
use metric::Registry;
use observability_deps::tracing::{debug, error, info, warn};
use snafu::{ResultExt, Snafu};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stream_transport::StreamTransport;
use target_mappers::{MapperError, TargetMapper};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
pub enum HandlerError {
    #[snafu(display("failed to initialize mapper: {source}"))]
    MapperInit { source: MapperError },
}

/// Consumer-level configuration assembled from the config sections.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub processor: ProcessorConfig,
    /// Skip the initial shard sync when leases already exist.
    pub skip_initial_sync_if_leases_exist: bool,
    /// Hard deadline for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            skip_initial_sync_if_leases_exist: true,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// A [`JoinHandle`] that can be cloned.
type SharedJoinHandle = Shared<BoxFuture<'static, Result<(), Arc<JoinError>>>>;

/// Convert a [`JoinHandle`] into a [`SharedJoinHandle`].
fn shared_handle(handle: JoinHandle<()>) -> SharedJoinHandle {
    handle.map_err(Arc::new).boxed().shared()
}

/// Runs the whole consumer for one worker process.
#[derive(Debug)]
pub struct ConsumerHandler {
    stream_id: StreamId,
    join_handles: Vec<(String, SharedJoinHandle)>,
    shutdown: CancellationToken,
    coordinator: Arc<LeaseCoordinator>,
}

impl ConsumerHandler {
    /// Starts the consumer. `shutdown` is the worker-wide cancellation
    /// token; the same token should be handed to the mappers' client
    /// registry so sink retries stop at cancellation too.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        stream_id: StreamId,
        transport: Arc<dyn StreamTransport>,
        mapper: Arc<dyn TargetMapper>,
        coordinator: Arc<LeaseCoordinator>,
        time_provider: Arc<dyn TimeProvider>,
        metric_registry: Arc<Registry>,
        config: ConsumerConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, HandlerError> {
        mapper.initialize().await.context(MapperInitSnafu)?;

        let skip_sync = config.skip_initial_sync_if_leases_exist
            && coordinator.any_leases_exist().await.unwrap_or(false);
        if skip_sync {
            info!(stream_id = %stream_id, "leases already exist; skipping initial shard sync");
        } else if let Err(e) = coordinator.sync_shards().await {
            // The periodic sync task retries; startup is not blocked.
            warn!(stream_id = %stream_id, error = %e, "initial shard sync failed");
        }

        let mut join_handles = Vec::with_capacity(4);

        join_handles.push((
            "shard sync".to_string(),
            shared_handle(tokio::task::spawn(run_shard_sync(
                Arc::clone(&coordinator),
                shutdown.child_token(),
            ))),
        ));
        join_handles.push((
            "lease renewal".to_string(),
            shared_handle(tokio::task::spawn(run_lease_renewal(
                Arc::clone(&coordinator),
                shutdown.child_token(),
            ))),
        ));
        join_handles.push((
            "lease auditor".to_string(),
            shared_handle(tokio::task::spawn(run_auditor(
                Arc::clone(&coordinator),
                shutdown.child_token(),
            ))),
        ));
        join_handles.push((
            "lease assignment".to_string(),
            shared_handle(tokio::task::spawn(run_assignment(
                stream_id.clone(),
                transport,
                mapper,
                Arc::clone(&coordinator),
                time_provider,
                metric_registry,
                config,
                shutdown.child_token(),
            ))),
        ));

        info!(stream_id = %stream_id, worker_id = %coordinator.worker_id(), "consumer started");
        Ok(Self {
            stream_id,
            join_handles,
            shutdown,
            coordinator,
        })
    }

    pub fn coordinator(&self) -> &Arc<LeaseCoordinator> {
        &self.coordinator
    }

    /// Waits until every background worker finished after
    /// [`shutdown`](Self::shutdown).
    ///
    /// # Panics
    ///
    /// If any background worker exits before shutdown was requested.
    pub async fn join(&self) {
        // Poll handlers unordered to detect early exits of any worker.
        let mut unordered: FuturesUnordered<_> = self
            .join_handles
            .iter()
            .cloned()
            .map(|(name, handle)| async move { handle.await.map(|_| name) })
            .collect();

        while let Some(result) = unordered.next().await {
            let name = result.expect("background worker panicked");
            if !self.shutdown.is_cancelled() {
                panic!("background worker {name:?} exited early");
            }
            debug!(worker = %name, "background worker finished");
        }
        info!(stream_id = %self.stream_id, "consumer stopped");
    }

    /// Requests shutdown of all background workers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ConsumerHandler {
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() {
            warn!("ConsumerHandler dropped without calling shutdown()");
            self.shutdown.cancel();
        }

        for (worker_name, handle) in &self.join_handles {
            if handle.clone().now_or_never().is_none() {
                warn!(
                    worker_name = worker_name.as_str(),
                    "ConsumerHandler dropped without waiting for worker termination",
                );
            }
        }
    }
}

async fn run_shard_sync(coordinator: Arc<LeaseCoordinator>, shutdown: CancellationToken) {
    let interval = coordinator.config().shard_sync_interval;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = coordinator.sync_shards().await {
            warn!(error = %e, "shard sync failed; will retry");
        }
    }
}

async fn run_lease_renewal(coordinator: Arc<LeaseCoordinator>, shutdown: CancellationToken) {
    let interval = coordinator.config().lease_renewal_interval;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        let lost = coordinator.renew_leases().await;
        for shard_id in lost {
            warn!(%shard_id, "lease lost during renewal");
        }
    }
}

async fn run_auditor(coordinator: Arc<LeaseCoordinator>, shutdown: CancellationToken) {
    let interval = coordinator.config().auditor_interval;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = coordinator.audit().await {
            warn!(error = %e, "lease audit failed; will retry");
        }
    }
}

/// The assignment loop: claims leases, spawns one processor task per
/// newly-owned shard, reaps finished processors, and on shutdown drains
/// everything under the configured deadline before releasing leases.
#[allow(clippy::too_many_arguments)]
async fn run_assignment(
    stream_id: StreamId,
    transport: Arc<dyn StreamTransport>,
    mapper: Arc<dyn TargetMapper>,
    coordinator: Arc<LeaseCoordinator>,
    time_provider: Arc<dyn TimeProvider>,
    metric_registry: Arc<Registry>,
    config: ConsumerConfig,
    shutdown: CancellationToken,
) {
    let interval = coordinator.config().lease_assignment_interval;
    let mut processors: JoinSet<(ShardId, Result<ShardOutcome, crate::ProcessorError>)> =
        JoinSet::new();
    let mut task_shards: HashMap<tokio::task::Id, ShardId> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
            Some(finished) = processors.join_next_with_id(), if !processors.is_empty() => {
                reap(finished, &mut task_shards, &coordinator).await;
                continue;
            }
        }

        let acquired = match coordinator.acquire_leases().await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(error = %e, "lease acquisition failed; will retry");
                continue;
            }
        };

        for lease in acquired {
            let processor = ShardProcessor::new(
                stream_id.clone(),
                lease.shard_id.clone(),
                Arc::clone(&transport),
                Arc::clone(&mapper),
                Arc::clone(&coordinator),
                Arc::clone(&time_provider),
                ProcessorMetrics::new(&metric_registry, &lease.shard_id),
                config.processor.clone(),
            );
            let shard_id = lease.shard_id.clone();
            let child_shutdown = shutdown.child_token();
            let checkpoint = lease.checkpoint.clone();
            let handle = processors.spawn(async move {
                let outcome = processor.run(checkpoint, child_shutdown).await;
                (shard_id, outcome)
            });
            task_shards.insert(handle.id(), lease.shard_id);
        }
    }

    // Graceful shutdown: processors observe the cancelled token,
    // quiesce with a final checkpoint, and are awaited up to the hard
    // deadline. Past it the process may exit with uncheckpointed work,
    // which at-least-once semantics make safe.
    let drain = async {
        while let Some(finished) = processors.join_next_with_id().await {
            reap(finished, &mut task_shards, &coordinator).await;
        }
    };
    if tokio::time::timeout(config.shutdown_timeout, drain)
        .await
        .is_err()
    {
        warn!(
            timeout = ?config.shutdown_timeout,
            "graceful shutdown deadline exceeded; aborting remaining processors",
        );
        processors.abort_all();
    }

    coordinator.release_all().await;
}

/// Handles one finished processor task.
async fn reap(
    finished: Result<
        (tokio::task::Id, (ShardId, Result<ShardOutcome, crate::ProcessorError>)),
        JoinError,
    >,
    task_shards: &mut HashMap<tokio::task::Id, ShardId>,
    coordinator: &Arc<LeaseCoordinator>,
) {
    match finished {
        Ok((task_id, (shard_id, outcome))) => {
            task_shards.remove(&task_id);
            match outcome {
                Ok(ShardOutcome::Ended) => {
                    info!(%shard_id, "shard fully processed");
                    coordinator.abandon(&shard_id).await;
                }
                Ok(ShardOutcome::LeaseLost) => {
                    // The coordinator already dropped it from the held
                    // set; nothing further to release.
                    info!(%shard_id, "processor abandoned stolen shard");
                }
                Ok(ShardOutcome::Quiesced) => {
                    debug!(%shard_id, "processor quiesced");
                }
                Err(e) => {
                    // Fatal to the shard only: stop renewing so another
                    // worker can steal the lease and resume from the
                    // last checkpoint.
                    error!(%shard_id, error = %e, "shard processor failed");
                    coordinator.abandon(&shard_id).await;
                }
            }
        }
        Err(join_error) => {
            let shard_id = task_shards.remove(&join_error.id());
            error!(
                ?shard_id,
                error = %join_error,
                "shard processor task died",
            );
            if let Some(shard_id) = shard_id {
                coordinator.abandon(&shard_id).await;
            }
        }
    }
}
