use super::{MetricObserver, Observation};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// A gauge over a `u64` that can move in both directions.
///
/// Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge {
    state: Arc<AtomicU64>,
}

impl U64Gauge {
    pub fn set(&self, value: u64) {
        self.state.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self, delta: u64) {
        self.state.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn dec(&self, delta: u64) {
        self.state.fetch_sub(delta, Ordering::Relaxed);
    }

    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Gauge {
    fn observe(&self) -> Observation {
        Observation::U64Gauge(self.fetch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge() {
        let gauge = U64Gauge::default();
        gauge.set(10);
        gauge.inc(5);
        gauge.dec(3);
        assert_eq!(gauge.fetch(), 12);
        assert_eq!(gauge.observe(), Observation::U64Gauge(12));
    }
}
