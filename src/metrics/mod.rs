//! Lock-free scheduler metrics, rendered in Prometheus text exposition format.

pub mod http;

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;

/// Upper bounds (seconds) of the duration histogram buckets.
const DURATION_BUCKETS: [f64; 10] = [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0];

/// Fixed-bucket duration histogram.
pub struct DurationHistogram {
    buckets: [AtomicU64; DURATION_BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl DurationHistogram {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn record(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if let Some(idx) = DURATION_BUCKETS.iter().position(|bound| secs <= *bound) {
            self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> Duration {
        Duration::from_micros(self.sum_us.load(Ordering::Relaxed))
    }

    fn write_prometheus(&self, out: &mut String, name: &str, scope: &str) {
        let mut cumulative = 0u64;
        for (bound, bucket) in DURATION_BUCKETS.iter().zip(self.buckets.iter()) {
            cumulative += bucket.load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "{name}_bucket{{scope=\"{scope}\",le=\"{bound}\"}} {cumulative}"
            );
        }
        let count = self.count();
        let _ = writeln!(out, "{name}_bucket{{scope=\"{scope}\",le=\"+Inf\"}} {count}");
        let _ = writeln!(
            out,
            "{name}_sum{{scope=\"{scope}\"}} {}",
            self.sum().as_secs_f64()
        );
        let _ = writeln!(out, "{name}_count{{scope=\"{scope}\"}} {count}");
    }
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics of one scheduler scope (e.g. `decodingWorkScheduler`).
pub struct SchedulerMetrics {
    scope: String,
    queued_batches: AtomicI64,
    queued_events: AtomicI64,
    enqueue_calls: AtomicU64,
    dequeue_calls: AtomicU64,
    failed_batches: AtomicU64,
    processed_events: AtomicU64,
    batch_size_events: AtomicU64,
    batch_durations: DurationHistogram,
    scheduling_delays: DurationHistogram,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerMetricsSnapshot {
    pub scope: String,
    pub queued_batches: i64,
    pub queued_events: i64,
    pub enqueue_calls: u64,
    pub dequeue_calls: u64,
    pub failed_batches: u64,
    pub processed_batches: u64,
    pub processed_events: u64,
}

impl SchedulerMetrics {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            queued_batches: AtomicI64::new(0),
            queued_events: AtomicI64::new(0),
            enqueue_calls: AtomicU64::new(0),
            dequeue_calls: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            processed_events: AtomicU64::new(0),
            batch_size_events: AtomicU64::new(0),
            batch_durations: DurationHistogram::new(),
            scheduling_delays: DurationHistogram::new(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn batch_queued(&self, events: usize) {
        self.queued_batches.fetch_add(1, Ordering::Relaxed);
        self.queued_events
            .fetch_add(events as i64, Ordering::Relaxed);
    }

    pub fn batch_released(&self, events: usize) {
        self.queued_batches.fetch_sub(1, Ordering::Relaxed);
        self.queued_events
            .fetch_sub(events as i64, Ordering::Relaxed);
    }

    pub fn record_enqueue(&self) {
        self.enqueue_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeue(&self, scheduling_delay: Duration) {
        self.dequeue_calls.fetch_add(1, Ordering::Relaxed);
        self.scheduling_delays.record(scheduling_delay);
    }

    pub fn record_batch(&self, events: usize, elapsed: Duration, succeeded: bool) {
        self.batch_durations.record(elapsed);
        self.batch_size_events
            .fetch_add(events as u64, Ordering::Relaxed);
        if succeeded {
            self.processed_events
                .fetch_add(events as u64, Ordering::Relaxed);
        } else {
            self.failed_batches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn queued_batches(&self) -> i64 {
        self.queued_batches.load(Ordering::Relaxed)
    }

    pub fn queued_events(&self) -> i64 {
        self.queued_events.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SchedulerMetricsSnapshot {
        let processed = self.batch_durations.count();
        let failed = self.failed_batches.load(Ordering::Relaxed);
        SchedulerMetricsSnapshot {
            scope: self.scope.clone(),
            queued_batches: self.queued_batches(),
            queued_events: self.queued_events(),
            enqueue_calls: self.enqueue_calls.load(Ordering::Relaxed),
            dequeue_calls: self.dequeue_calls.load(Ordering::Relaxed),
            failed_batches: failed,
            processed_batches: processed.saturating_sub(failed),
            processed_events: self.processed_events.load(Ordering::Relaxed),
        }
    }
}

struct Family {
    name: &'static str,
    help: &'static str,
    kind: &'static str,
    read: fn(&SchedulerMetrics) -> f64,
}

const FAMILIES: [Family; 6] = [
    Family {
        name: "replsched_queued_batches",
        help: "Batches queued or in flight.",
        kind: "gauge",
        read: |m| m.queued_batches() as f64,
    },
    Family {
        name: "replsched_queued_events",
        help: "Events in queued or in-flight batches.",
        kind: "gauge",
        read: |m| m.queued_events() as f64,
    },
    Family {
        name: "replsched_enqueue_calls_total",
        help: "Batches handed to schedule().",
        kind: "counter",
        read: |m| m.enqueue_calls.load(Ordering::Relaxed) as f64,
    },
    Family {
        name: "replsched_dequeue_calls_total",
        help: "Batches dispatched to the worker pool.",
        kind: "counter",
        read: |m| m.dequeue_calls.load(Ordering::Relaxed) as f64,
    },
    Family {
        name: "replsched_failed_batches_total",
        help: "Batches whose processing failed.",
        kind: "counter",
        read: |m| m.failed_batches.load(Ordering::Relaxed) as f64,
    },
    Family {
        name: "replsched_processed_events_total",
        help: "Events in successfully processed batches.",
        kind: "counter",
        read: |m| m.processed_events.load(Ordering::Relaxed) as f64,
    },
];

/// Every scheduler scope of the process. Constructed once and passed to the
/// schedulers that should be exported.
#[derive(Default)]
pub struct MetricsRegistry {
    scopes: RwLock<Vec<Arc<SchedulerMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the metrics of `scope`, creating them on first use.
    pub fn scope(&self, scope: &str) -> Arc<SchedulerMetrics> {
        let mut scopes = self.scopes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = scopes.iter().find(|m| m.scope() == scope) {
            return existing.clone();
        }
        let metrics = Arc::new(SchedulerMetrics::new(scope));
        scopes.push(metrics.clone());
        metrics
    }

    pub fn snapshot(&self) -> Vec<SchedulerMetricsSnapshot> {
        self.scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|m| m.snapshot())
            .collect()
    }

    /// Export metrics in Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let scopes = self
            .scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut out = String::new();

        for family in &FAMILIES {
            let _ = writeln!(out, "# HELP {} {}", family.name, family.help);
            let _ = writeln!(out, "# TYPE {} {}", family.name, family.kind);
            for metrics in &scopes {
                let _ = writeln!(
                    out,
                    "{}{{scope=\"{}\"}} {}",
                    family.name,
                    metrics.scope(),
                    (family.read)(metrics)
                );
            }
        }

        let histograms: [(&str, &str, fn(&SchedulerMetrics) -> &DurationHistogram); 2] = [
            (
                "replsched_batch_duration_seconds",
                "Time spent processing a batch.",
                |m| &m.batch_durations,
            ),
            (
                "replsched_batch_scheduling_delay_seconds",
                "Time a batch waited in the queue before dispatch.",
                |m| &m.scheduling_delays,
            ),
        ];
        for (name, help, histogram) in histograms {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} histogram");
            for metrics in &scopes {
                histogram(metrics).write_prometheus(&mut out, name, metrics.scope());
            }
        }

        let name = "replsched_batch_size_events";
        let _ = writeln!(out, "# HELP {name} Events per processed batch.");
        let _ = writeln!(out, "# TYPE {name} summary");
        for metrics in &scopes {
            let scope = metrics.scope();
            let sum = metrics.batch_size_events.load(Ordering::Relaxed);
            let count = metrics.batch_durations.count();
            let _ = writeln!(out, "{name}_sum{{scope=\"{scope}\"}} {sum}");
            let _ = writeln!(out, "{name}_count{{scope=\"{scope}\"}} {count}");
        }

        out
    }
}

/// Kind of work a batch performed, reported to per-index sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Decoding,
    Indexing,
}

/// Per-index sink a batch reports its processing to, next to the
/// scheduler-wide metrics.
pub trait ReplicationMetricsSink: Send + Sync {
    fn record_batch(&self, kind: WorkKind, events: usize, elapsed: Duration, succeeded: bool);
}

/// Sink for callers that do not track per-index metrics.
pub struct NoopMetricsSink;

impl ReplicationMetricsSink for NoopMetricsSink {
    fn record_batch(&self, _kind: WorkKind, _events: usize, _elapsed: Duration, _succeeded: bool) {}
}

/// Replication counters of a single index.
#[derive(Default)]
pub struct IndexReplicationMetrics {
    decoded_batches: AtomicU64,
    decoded_events: AtomicU64,
    decoding_time_us: AtomicU64,
    indexed_batches: AtomicU64,
    indexed_events: AtomicU64,
    indexing_time_us: AtomicU64,
    failed_batches: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexReplicationSnapshot {
    pub decoded_batches: u64,
    pub decoded_events: u64,
    pub decoding_time_us: u64,
    pub indexed_batches: u64,
    pub indexed_events: u64,
    pub indexing_time_us: u64,
    pub failed_batches: u64,
}

impl IndexReplicationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> IndexReplicationSnapshot {
        IndexReplicationSnapshot {
            decoded_batches: self.decoded_batches.load(Ordering::Relaxed),
            decoded_events: self.decoded_events.load(Ordering::Relaxed),
            decoding_time_us: self.decoding_time_us.load(Ordering::Relaxed),
            indexed_batches: self.indexed_batches.load(Ordering::Relaxed),
            indexed_events: self.indexed_events.load(Ordering::Relaxed),
            indexing_time_us: self.indexing_time_us.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
        }
    }
}

impl ReplicationMetricsSink for IndexReplicationMetrics {
    fn record_batch(&self, kind: WorkKind, events: usize, elapsed: Duration, succeeded: bool) {
        if !succeeded {
            self.failed_batches.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let micros = elapsed.as_micros() as u64;
        let (batches, counted, time) = match kind {
            WorkKind::Decoding => (
                &self.decoded_batches,
                &self.decoded_events,
                &self.decoding_time_us,
            ),
            WorkKind::Indexing => (
                &self.indexed_batches,
                &self.indexed_events,
                &self.indexing_time_us,
            ),
        };
        batches.fetch_add(1, Ordering::Relaxed);
        counted.fetch_add(events as u64, Ordering::Relaxed);
        time.fetch_add(micros, Ordering::Relaxed);
    }
}
