use super::{MetricObserver, Observation};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// A monotonic counter over a `u64`.
///
/// Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct U64Counter {
    state: Arc<AtomicU64>,
}

impl U64Counter {
    pub fn inc(&self, count: u64) {
        self.state.fetch_add(count, Ordering::Relaxed);
    }

    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Counter {
    fn observe(&self) -> Observation {
        Observation::U64Counter(self.fetch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = U64Counter::default();
        assert_eq!(counter.fetch(), 0);
        counter.inc(12);
        assert_eq!(counter.fetch(), 12);
        counter.inc(0);
        assert_eq!(counter.fetch(), 12);

        let cloned = counter.clone();
        cloned.inc(3);
        assert_eq!(counter.fetch(), 15);

        assert_eq!(counter.observe(), Observation::U64Counter(15));
    }
}
