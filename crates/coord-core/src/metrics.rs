use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// {Sum, Count, Min, Max, Last, P50, P95, P99} rolled up from the samples
/// recorded since the previous snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSnapshot {
    pub sum: f64,
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub last: Option<f64>,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

impl MetricSnapshot {
    fn empty() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            min: None,
            max: None,
            last: None,
            p50: None,
            p95: None,
            p99: None,
        }
    }
}

/// Records a stream of numeric samples for one metric name and produces a
/// snapshot-and-reset atomically, so concurrent recorders never double-count.
#[derive(Debug, Default)]
pub struct MetricAggregator {
    samples: Mutex<Vec<f64>>,
}

impl MetricAggregator {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, value: f64) {
        self.samples.lock().unwrap().push(value);
    }

    pub fn snapshot_and_reset(&self) -> MetricSnapshot {
        let mut samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return MetricSnapshot::empty();
        }

        let mut sorted = std::mem::take(&mut *samples);
        let last = *sorted.last().unwrap();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let count = sorted.len() as u64;
        let sum: f64 = sorted.iter().sum();
        let min = sorted.first().copied();
        let max = sorted.last().copied();

        MetricSnapshot {
            sum,
            count,
            min,
            max,
            last: Some(last),
            p50: Some(percentile(&sorted, 0.50)),
            p95: Some(percentile(&sorted, 0.95)),
            p99: Some(percentile(&sorted, 0.99)),
        }
    }
}

/// Nearest-rank percentile over an already-sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Bounded, process-global registry of named aggregators — the one other
/// piece of global state the outer spec permits, alongside the
/// [`crate::latch::StartupLatch`].
#[derive(Debug, Clone, Default)]
pub struct MetricRegistry {
    aggregators: Arc<RwLock<HashMap<String, Arc<MetricAggregator>>>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregator(&self, name: &str) -> Arc<MetricAggregator> {
        if let Some(existing) = self.aggregators.read().unwrap().get(name) {
            return existing.clone();
        }
        let mut write = self.aggregators.write().unwrap();
        write
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MetricAggregator::new()))
            .clone()
    }

    pub fn record(&self, name: &str, value: f64) {
        self.aggregator(name).record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_is_all_null() {
        let agg = MetricAggregator::new();
        let snap = agg.snapshot_and_reset();
        assert_eq!(snap.sum, 0.0);
        assert_eq!(snap.count, 0);
        assert!(snap.min.is_none());
        assert!(snap.max.is_none());
        assert!(snap.p50.is_none());
        assert!(snap.p95.is_none());
        assert!(snap.p99.is_none());
    }

    #[test]
    fn snapshot_resets_state() {
        let agg = MetricAggregator::new();
        agg.record(1.0);
        agg.record(2.0);
        agg.record(3.0);

        let snap = agg.snapshot_and_reset();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.sum, 6.0);
        assert_eq!(snap.min, Some(1.0));
        assert_eq!(snap.max, Some(3.0));
        assert_eq!(snap.last, Some(3.0));

        let second = agg.snapshot_and_reset();
        assert_eq!(second.count, 0);
    }

    #[test]
    fn concurrent_recorders_never_double_count() {
        use std::thread;

        let agg = Arc::new(MetricAggregator::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let agg = agg.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        agg.record(1.0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = agg.snapshot_and_reset();
        assert_eq!(snap.count, 1600);
    }

    #[test]
    fn registry_returns_same_aggregator_per_name() {
        let registry = MetricRegistry::new();
        registry.record("outbox.claimed", 1.0);
        registry.record("outbox.claimed", 2.0);
        let snap = registry.aggregator("outbox.claimed").snapshot_and_reset();
        assert_eq!(snap.count, 2);
    }
}
