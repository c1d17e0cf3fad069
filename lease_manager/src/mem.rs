//! An in-memory [`LeaseStore`] with real CAS semantics, for tests and
//! local smoke runs.

use crate::store::{LeaseStore, LeaseStoreError, UpdateOutcome};
use async_trait::async_trait;
use data_types::{Lease, ShardId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Shared-state store: clones operate on the same lease table.
#[derive(Debug, Clone, Default)]
pub struct MemLeaseStore {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    leases: BTreeMap<ShardId, Lease>,
    injected_failures: VecDeque<LeaseStoreError>,
}

impl MemLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error returned by the next store call, ahead of its
    /// normal behavior.
    pub fn inject_failure(&self, error: LeaseStoreError) {
        self.state.lock().injected_failures.push_back(error);
    }

    fn check_injected(&self) -> Result<(), LeaseStoreError> {
        match self.state.lock().injected_failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LeaseStore for MemLeaseStore {
    async fn get(&self, shard_id: &ShardId) -> Result<Option<Lease>, LeaseStoreError> {
        self.check_injected()?;
        Ok(self.state.lock().leases.get(shard_id).cloned())
    }

    async fn put_if_absent(&self, lease: &Lease) -> Result<bool, LeaseStoreError> {
        self.check_injected()?;
        let mut state = self.state.lock();
        if state.leases.contains_key(&lease.shard_id) {
            return Ok(false);
        }
        state.leases.insert(lease.shard_id.clone(), lease.clone());
        Ok(true)
    }

    async fn update_if(
        &self,
        lease: &Lease,
        expected_counter: u64,
    ) -> Result<UpdateOutcome, LeaseStoreError> {
        self.check_injected()?;
        let mut state = self.state.lock();
        match state.leases.get_mut(&lease.shard_id) {
            Some(stored) if stored.counter == expected_counter => {
                *stored = lease.clone();
                Ok(UpdateOutcome::Written)
            }
            _ => Ok(UpdateOutcome::Conflict),
        }
    }

    async fn delete_if(
        &self,
        shard_id: &ShardId,
        expected_counter: u64,
    ) -> Result<bool, LeaseStoreError> {
        self.check_injected()?;
        let mut state = self.state.lock();
        match state.leases.get(shard_id) {
            Some(stored) if stored.counter == expected_counter => {
                state.leases.remove(shard_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan(&self) -> Result<Vec<Lease>, LeaseStoreError> {
        self.check_injected()?;
        Ok(self.state.lock().leases.values().cloned().collect())
    }
}
