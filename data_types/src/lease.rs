//! Leases: the coordination record granting one worker exclusive
//! processing rights for one shard.

use crate::sequence::Checkpoint;
use crate::shard::{Shard, ShardId};
use clock::Time;
use std::fmt;

/// Identifies one worker process. Stable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives a fresh worker identity. The random suffix keeps two
    /// processes on the same host distinct.
    pub fn generate(application_name: &str) -> Self {
        Self(format!("{application_name}-{}", uuid::Uuid::new_v4()))
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The coordination record for one shard.
///
/// Invariants maintained by the lease coordinator:
///
/// * every store write increments `counter` (the CAS token)
/// * `checkpoint` is monotonically non-decreasing per shard
/// * a shard with a non-sentinel checkpoint has all parent leases either
///   deleted or checkpointed past their shard end
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub shard_id: ShardId,
    pub owner: Option<WorkerId>,
    pub counter: u64,
    pub checkpoint: Checkpoint,
    pub owner_switches_since_checkpoint: u64,
    pub parent_shard_ids: Vec<ShardId>,
    pub last_renewal_time: Time,
}

impl Lease {
    /// The initial, unowned lease for a newly discovered shard.
    pub fn new_for_shard(shard: &Shard, now: Time) -> Self {
        Self {
            shard_id: shard.shard_id.clone(),
            owner: None,
            counter: 0,
            checkpoint: Checkpoint::TrimHorizon,
            owner_switches_since_checkpoint: 0,
            parent_shard_ids: shard.parent_shard_ids.clone(),
            last_renewal_time: now,
        }
    }

    pub fn is_owned_by(&self, worker: &WorkerId) -> bool {
        self.owner.as_ref() == Some(worker)
    }

    /// Whether the owner has failed to renew within `steal_after`,
    /// making the lease eligible for theft.
    pub fn is_stale(&self, now: Time, steal_after: std::time::Duration) -> bool {
        match now.checked_duration_since(self.last_renewal_time) {
            Some(age) => age > steal_after,
            // Renewal time in the future of `now` means a freshly
            // written lease observed through clock skew; not stale.
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::HashRange;
    use std::time::Duration;

    #[test]
    fn test_new_lease_is_unowned_at_trim_horizon() {
        let shard = Shard::root("s-0", HashRange::new(0, u128::MAX));
        let lease = Lease::new_for_shard(&shard, Time::from_timestamp_millis(0));
        assert_eq!(lease.owner, None);
        assert_eq!(lease.counter, 0);
        assert!(lease.checkpoint.is_trim_horizon());
    }

    #[test]
    fn test_staleness() {
        let shard = Shard::root("s-0", HashRange::new(0, 10));
        let t0 = Time::from_timestamp_millis(0);
        let lease = Lease::new_for_shard(&shard, t0);

        let steal_after = Duration::from_secs(30);
        assert!(!lease.is_stale(t0 + Duration::from_secs(30), steal_after));
        assert!(lease.is_stale(t0 + Duration::from_secs(31), steal_after));
    }

    #[test]
    fn test_ownership() {
        let shard = Shard::root("s-0", HashRange::new(0, 10));
        let mut lease = Lease::new_for_shard(&shard, Time::from_timestamp_millis(0));
        let w1 = WorkerId::from("w1");
        assert!(!lease.is_owned_by(&w1));
        lease.owner = Some(w1.clone());
        assert!(lease.is_owned_by(&w1));
        assert!(!lease.is_owned_by(&WorkerId::from("w2")));
    }
}
