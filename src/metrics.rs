//! Latency histograms for the translation path.
//! Each named metric keeps a fixed ring of recent samples and reports p50/p95/p99.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Measures elapsed time from creation until `finish`.
pub struct TimingSpan {
    name: &'static str,
    start: Instant,
    registry: Arc<MetricsRegistry>,
}

impl TimingSpan {
    pub fn new(name: &'static str, registry: Arc<MetricsRegistry>) -> Self {
        Self {
            name,
            start: Instant::now(),
            registry,
        }
    }

    /// Record the elapsed time in microseconds and return it.
    pub fn finish(self) -> f64 {
        let elapsed_us = self.start.elapsed().as_micros() as f64;
        self.registry.record(self.name, elapsed_us);
        elapsed_us
    }
}

/// Fixed-capacity ring buffer for histogram samples.
struct SampleRing {
    samples: Vec<f64>,
    pos: usize,
    count: usize,
    total: u64,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            pos: 0,
            count: 0,
            total: 0,
        }
    }

    fn push(&mut self, value: f64) {
        let capacity = self.samples.len();
        self.samples[self.pos] = value;
        self.pos = (self.pos + 1) % capacity;
        self.count = (self.count + 1).min(capacity);
        self.total += 1;
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples[..self.count].to_vec();
        sorted.sort_by(f64::total_cmp);
        let idx = ((p / 100.0) * (self.count as f64 - 1.0)).round() as usize;
        sorted[idx.min(self.count - 1)]
    }
}

pub struct MetricsRegistry {
    histograms: Mutex<HashMap<&'static str, SampleRing>>,
    ring_capacity: usize,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_ring_capacity(1024)
    }

    pub fn with_ring_capacity(ring_capacity: usize) -> Self {
        Self {
            histograms: Mutex::new(HashMap::new()),
            ring_capacity: ring_capacity.max(1),
        }
    }

    /// Record a sample (microseconds) for the named metric.
    pub fn record(&self, name: &'static str, value_us: f64) {
        self.histograms
            .lock()
            .entry(name)
            .or_insert_with(|| SampleRing::new(self.ring_capacity))
            .push(value_us);
        tracing::trace!(metric = name, value_us, "metric_recorded");
    }

    /// Start a timing span that records on finish.
    pub fn span(self: &Arc<Self>, name: &'static str) -> TimingSpan {
        TimingSpan::new(name, Arc::clone(self))
    }

    /// Percentile (0-100) of the named metric in microseconds; 0 when unseen.
    pub fn percentile(&self, name: &str, p: f64) -> f64 {
        self.histograms
            .lock()
            .get(name)
            .map(|ring| ring.percentile(p))
            .unwrap_or(0.0)
    }

    /// Total samples ever recorded for `name`.
    pub fn count(&self, name: &str) -> u64 {
        self.histograms
            .lock()
            .get(name)
            .map(|ring| ring.total)
            .unwrap_or(0)
    }

    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        self.histograms
            .lock()
            .iter()
            .map(|(&name, ring)| {
                (
                    name.to_string(),
                    MetricSummary {
                        p50_us: ring.percentile(50.0),
                        p95_us: ring.percentile(95.0),
                        p99_us: ring.percentile(99.0),
                        count: ring.total,
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: u64,
}

/// Well-known metric names.
pub mod metric_names {
    pub const ENGINE_LOAD: &str = "t_engine_load";
    pub const INFERENCE: &str = "t_inference";
    pub const TRANSLATE_TOTAL: &str = "t_translate_total";
    pub const QUEUE_WAIT: &str = "queue_wait_translate";
}
