//! The per-worker lease coordinator.

use crate::store::{LeaseStore, LeaseStoreError, UpdateOutcome};
use clock::TimeProvider;
use data_types::{Checkpoint, Lease, ShardId, StreamId, WorkerId};
use metric::{U64Counter, U64Gauge};
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use stream_transport::{StreamTransport, TransportError};
use thiserror::Error;

/// Intervals and thresholds driving the coordinator's background work.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often shards are enumerated and missing leases created.
    pub shard_sync_interval: Duration,
    /// How often unowned leases are scanned for claiming.
    pub lease_assignment_interval: Duration,
    /// How often held leases are renewed. Must stay well below
    /// `lease_steal_after`.
    pub lease_renewal_interval: Duration,
    /// Renewal age past which any worker may steal a lease.
    pub lease_steal_after: Duration,
    /// How often the garbage-lease auditor runs.
    pub auditor_interval: Duration,
    /// Consecutive garbage observations required before deletion.
    pub auditor_confidence_threshold: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            shard_sync_interval: Duration::from_secs(60),
            lease_assignment_interval: Duration::from_secs(1),
            lease_renewal_interval: Duration::from_secs(10),
            lease_steal_after: Duration::from_secs(30),
            auditor_interval: Duration::from_secs(5),
            auditor_confidence_threshold: 3,
        }
    }
}

/// Coordination counters surfaced to operators.
#[derive(Debug, Clone)]
pub struct CoordinatorMetrics {
    pub leases_held: U64Gauge,
    pub lease_steals: U64Counter,
    pub checkpoint_advance_conflicts: U64Counter,
}

impl CoordinatorMetrics {
    pub fn new(registry: &metric::Registry) -> Self {
        Self {
            leases_held: registry
                .register_metric::<U64Gauge>("leases_held", "leases currently held by this worker")
                .recorder(&[]),
            lease_steals: registry
                .register_metric::<U64Counter>(
                    "lease_steals",
                    "leases taken over from workers that stopped renewing",
                )
                .recorder(&[]),
            checkpoint_advance_conflicts: registry
                .register_metric::<U64Counter>(
                    "checkpoint_advance_conflicts",
                    "CAS conflicts observed while advancing checkpoints",
                )
                .recorder(&[]),
        }
    }
}

/// Failures of coordinator-level operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] LeaseStoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures advancing a checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Another worker owns the shard now. The processor abandons the
    /// shard without checkpointing.
    #[error("lease for shard {shard_id} lost (owner now {new_owner:?})")]
    LeaseLost {
        shard_id: ShardId,
        new_owner: Option<WorkerId>,
    },

    /// Repeated CAS conflicts against our own lease; indicates a
    /// coordination bug or a split-brain store.
    #[error("checkpoint CAS contention on shard {shard_id}")]
    Contention { shard_id: ShardId },

    #[error(transparent)]
    Store(#[from] LeaseStoreError),
}

/// Drives lease discovery, assignment, renewal, checkpointing, release
/// and garbage collection for one worker.
///
/// All store writes for held leases are serialized through the internal
/// `held` map lock, so within one process a lease row has a single
/// writer and a CAS conflict always means external interference.
#[derive(Debug)]
pub struct LeaseCoordinator {
    stream_id: StreamId,
    worker_id: WorkerId,
    store: Arc<dyn LeaseStore>,
    transport: Arc<dyn StreamTransport>,
    time_provider: Arc<dyn TimeProvider>,
    config: CoordinatorConfig,
    metrics: CoordinatorMetrics,
    held: tokio::sync::Mutex<BTreeMap<ShardId, Lease>>,
    garbage_observations: Mutex<BTreeMap<ShardId, usize>>,
}

impl LeaseCoordinator {
    pub fn new(
        stream_id: StreamId,
        worker_id: WorkerId,
        store: Arc<dyn LeaseStore>,
        transport: Arc<dyn StreamTransport>,
        time_provider: Arc<dyn TimeProvider>,
        config: CoordinatorConfig,
        metrics: CoordinatorMetrics,
    ) -> Self {
        Self {
            stream_id,
            worker_id,
            store,
            transport,
            time_provider,
            config,
            metrics,
            held: Default::default(),
            garbage_observations: Default::default(),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub async fn held_shards(&self) -> Vec<ShardId> {
        self.held.lock().await.keys().cloned().collect()
    }

    /// Whether any leases exist yet for this stream. Used to optionally
    /// skip the initial shard sync.
    pub async fn any_leases_exist(&self) -> Result<bool, CoordinatorError> {
        Ok(!self.store.scan().await?.is_empty())
    }

    /// Enumerates shards and creates a lease row for every shard that
    /// does not have one, starting at the trim horizon.
    pub async fn sync_shards(&self) -> Result<(), CoordinatorError> {
        let shards = self.transport.list_shards(&self.stream_id).await?;
        let now = self.time_provider.now();
        for shard in &shards {
            if self.store.get(&shard.shard_id).await?.is_some() {
                continue;
            }
            let lease = Lease::new_for_shard(shard, now);
            if self.store.put_if_absent(&lease).await? {
                debug!(shard_id = %shard.shard_id, "created lease");
            }
        }
        Ok(())
    }

    /// Scans for claimable leases and attempts to CAS-claim each one.
    /// Returns the leases newly held by this worker.
    ///
    /// A lease is claimable when it is unowned or its owner stopped
    /// renewing for longer than `lease_steal_after`. A shard whose
    /// parent leases still exist is never claimed: parents must be fully
    /// drained and garbage-collected first, which preserves
    /// parent-before-child delivery order.
    pub async fn acquire_leases(&self) -> Result<Vec<Lease>, CoordinatorError> {
        let leases = self.store.scan().await?;
        let present: BTreeSet<ShardId> = leases.iter().map(|l| l.shard_id.clone()).collect();
        let now = self.time_provider.now();

        let mut held = self.held.lock().await;
        let mut acquired = Vec::new();
        for lease in leases {
            if held.contains_key(&lease.shard_id) {
                continue;
            }
            let stale = lease.is_stale(now, self.config.lease_steal_after);
            if lease.owner.is_some() && !stale {
                continue;
            }
            if lease
                .parent_shard_ids
                .iter()
                .any(|parent| present.contains(parent))
            {
                debug!(
                    shard_id = %lease.shard_id,
                    "not claiming shard whose parent leases still exist",
                );
                continue;
            }

            let stolen_from = lease.owner.clone();
            let mut claimed = lease.clone();
            claimed.owner = Some(self.worker_id.clone());
            claimed.counter += 1;
            claimed.owner_switches_since_checkpoint += 1;
            claimed.last_renewal_time = now;

            match self.store.update_if(&claimed, lease.counter).await? {
                UpdateOutcome::Written => {
                    match stolen_from {
                        Some(previous_owner) => {
                            self.metrics.lease_steals.inc(1);
                            info!(
                                shard_id = %claimed.shard_id,
                                worker_id = %self.worker_id,
                                %previous_owner,
                                checkpoint = %claimed.checkpoint,
                                "stole stale lease",
                            );
                        }
                        None => info!(
                            shard_id = %claimed.shard_id,
                            worker_id = %self.worker_id,
                            checkpoint = %claimed.checkpoint,
                            "claimed lease",
                        ),
                    }
                    held.insert(claimed.shard_id.clone(), claimed.clone());
                    acquired.push(claimed);
                }
                UpdateOutcome::Conflict => {
                    debug!(shard_id = %lease.shard_id, "lost claim race");
                }
            }
        }
        self.metrics.leases_held.set(held.len() as u64);
        Ok(acquired)
    }

    /// Renews every held lease. Returns the shards whose leases were
    /// lost to another worker; their processors must abandon.
    ///
    /// Store errors are logged but do not immediately lose the lease: if
    /// the outage outlasts the steal-after window another worker takes
    /// over and the next renewal observes the loss.
    pub async fn renew_leases(&self) -> Vec<ShardId> {
        let now = self.time_provider.now();
        let mut held = self.held.lock().await;
        let mut lost = Vec::new();

        let snapshot: Vec<(ShardId, Lease)> =
            held.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (shard_id, lease) in snapshot {
            let mut renewed = lease.clone();
            renewed.counter += 1;
            renewed.last_renewal_time = now;

            match self.store.update_if(&renewed, lease.counter).await {
                Ok(UpdateOutcome::Written) => {
                    held.insert(shard_id, renewed);
                }
                Ok(UpdateOutcome::Conflict) => match self.store.get(&shard_id).await {
                    Ok(Some(current)) if current.is_owned_by(&self.worker_id) => {
                        held.insert(shard_id, current);
                    }
                    Ok(current) => {
                        warn!(
                            %shard_id,
                            worker_id = %self.worker_id,
                            new_owner = ?current.and_then(|l| l.owner),
                            "lease lost during renewal",
                        );
                        lost.push(shard_id);
                    }
                    Err(e) => {
                        warn!(%shard_id, error = %e, "lease re-read failed during renewal");
                    }
                },
                Err(e) => {
                    warn!(%shard_id, error = %e, "lease renewal failed");
                }
            }
        }

        for shard_id in &lost {
            held.remove(shard_id);
        }
        self.metrics.leases_held.set(held.len() as u64);
        lost
    }

    /// Durably advances the shard's checkpoint. Regressions are ignored
    /// (checkpoints are monotonically non-decreasing); re-writing the
    /// same value is permitted and only bumps the CAS counter.
    pub async fn advance_checkpoint(
        &self,
        shard_id: &ShardId,
        checkpoint: Checkpoint,
    ) -> Result<(), CheckpointError> {
        let now = self.time_provider.now();
        let mut held = self.held.lock().await;
        let lease = held
            .get(shard_id)
            .ok_or_else(|| CheckpointError::LeaseLost {
                shard_id: shard_id.clone(),
                new_owner: None,
            })?
            .clone();

        if checkpoint < lease.checkpoint {
            debug!(
                %shard_id,
                current = %lease.checkpoint,
                requested = %checkpoint,
                "ignoring checkpoint regression",
            );
            return Ok(());
        }

        let mut expected = lease.counter;
        let mut updated = lease;
        updated.checkpoint = checkpoint;
        updated.owner_switches_since_checkpoint = 0;
        updated.last_renewal_time = now;

        for _attempt in 0..3 {
            updated.counter = expected + 1;
            match self.store.update_if(&updated, expected).await? {
                UpdateOutcome::Written => {
                    held.insert(shard_id.clone(), updated);
                    return Ok(());
                }
                UpdateOutcome::Conflict => {
                    self.metrics.checkpoint_advance_conflicts.inc(1);
                    let current = self.store.get(shard_id).await?;
                    match current {
                        Some(current) if current.is_owned_by(&self.worker_id) => {
                            expected = current.counter;
                        }
                        current => {
                            held.remove(shard_id);
                            self.metrics.leases_held.set(held.len() as u64);
                            return Err(CheckpointError::LeaseLost {
                                shard_id: shard_id.clone(),
                                new_owner: current.and_then(|l| l.owner),
                            });
                        }
                    }
                }
            }
        }
        Err(CheckpointError::Contention {
            shard_id: shard_id.clone(),
        })
    }

    /// Forgets a held lease without touching the store. Used when a
    /// processor ends (shard drained) or dies; the lease ages out and
    /// becomes stealable, or is deleted by the auditor.
    pub async fn abandon(&self, shard_id: &ShardId) {
        let mut held = self.held.lock().await;
        if held.remove(shard_id).is_some() {
            self.metrics.leases_held.set(held.len() as u64);
        }
    }

    /// Releases every held lease (owner cleared) for graceful shutdown.
    /// Final checkpoints are the processors' responsibility and precede
    /// this.
    pub async fn release_all(&self) {
        let now = self.time_provider.now();
        let mut held = self.held.lock().await;
        for (shard_id, lease) in std::mem::take(&mut *held) {
            let mut released = lease.clone();
            released.owner = None;
            released.counter += 1;
            released.last_renewal_time = now;
            match self.store.update_if(&released, lease.counter).await {
                Ok(UpdateOutcome::Written) => {
                    info!(%shard_id, worker_id = %self.worker_id, "released lease");
                }
                Ok(UpdateOutcome::Conflict) => {
                    warn!(%shard_id, "lease changed while releasing; leaving it");
                }
                Err(e) => {
                    warn!(%shard_id, error = %e, "lease release failed");
                }
            }
        }
        self.metrics.leases_held.set(0);
    }

    /// One auditor pass: deletes leases whose shard is no longer
    /// enumerated by the transport *and* whose checkpoint is at shard
    /// end, once the condition has held for
    /// `auditor_confidence_threshold` consecutive passes. Deleting a
    /// drained parent's lease is what unlocks its children for claiming.
    pub async fn audit(&self) -> Result<(), CoordinatorError> {
        let enumerated: BTreeSet<ShardId> = self
            .transport
            .list_shards(&self.stream_id)
            .await?
            .into_iter()
            .map(|s| s.shard_id)
            .collect();
        let leases = self.store.scan().await?;

        let mut to_delete = Vec::new();
        {
            let mut observations = self.garbage_observations.lock();
            let lease_ids: BTreeSet<ShardId> =
                leases.iter().map(|l| l.shard_id.clone()).collect();
            observations.retain(|shard_id, _| lease_ids.contains(shard_id));

            for lease in &leases {
                let garbage = !enumerated.contains(&lease.shard_id)
                    && lease.checkpoint.is_shard_end();
                if !garbage {
                    observations.remove(&lease.shard_id);
                    continue;
                }
                let seen = observations.entry(lease.shard_id.clone()).or_insert(0);
                *seen += 1;
                if *seen >= self.config.auditor_confidence_threshold {
                    to_delete.push((lease.shard_id.clone(), lease.counter));
                }
            }
        }

        for (shard_id, counter) in to_delete {
            if self.store.delete_if(&shard_id, counter).await? {
                info!(%shard_id, "deleted garbage lease for drained shard");
                self.garbage_observations.lock().remove(&shard_id);
            }
        }
        Ok(())
    }
}
