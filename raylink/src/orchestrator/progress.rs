//! Progress Aggregator
//!
//! `report` only writes into a concurrent map. The first report after an
//! idle period arms a one-shot timer; when it fires it computes the single
//! worker's value (one worker) or the mean over all expected workers and
//! calls the refresh sink once. A later report arms it again.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;

pub type RefreshSink = Arc<dyn Fn(f64) + Send + Sync>;

struct ProgressInner {
    reports: DashMap<usize, f64>,
    expected: AtomicUsize,
    armed: AtomicBool,
    generation: AtomicU64,
    refreshes: AtomicU64,
    interval: Duration,
    runtime: Handle,
    sink: RefreshSink,
}

#[derive(Clone)]
pub struct ProgressAggregator {
    inner: Arc<ProgressInner>,
}

impl ProgressAggregator {
    pub fn new(interval: Duration, runtime: Handle, sink: RefreshSink) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                reports: DashMap::new(),
                expected: AtomicUsize::new(0),
                armed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                refreshes: AtomicU64::new(0),
                interval,
                runtime,
                sink,
            }),
        }
    }

    /// Start a new pass with `workers` expected reporters.
    pub fn reset(&self, workers: usize) {
        self.clear();
        self.inner.expected.store(workers, Ordering::Release);
    }

    /// Drop every report; a pending refresh for the old pass is discarded.
    pub fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.reports.clear();
        self.inner.expected.store(0, Ordering::Release);
        self.inner.armed.store(false, Ordering::Release);
    }

    pub fn report(&self, worker: usize, fraction: f64) {
        self.record(worker, fraction);
    }

    /// Number of `reset`/`clear` calls so far; reporters are bound to one.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    fn report_for(&self, generation: u64, worker: usize, fraction: f64) {
        if self.generation() != generation {
            tracing::trace!(worker, generation, "Dropping progress from a previous pass");
            return;
        }
        self.record(worker, fraction);
    }

    fn record(&self, worker: usize, fraction: f64) {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.inner.reports.insert(worker, fraction);

        if self.inner.armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        let generation = inner.generation.load(Ordering::Acquire);
        self.inner.runtime.spawn(async move {
            tokio::time::sleep(inner.interval).await;
            if inner.generation.load(Ordering::Acquire) != generation {
                return;
            }
            inner.armed.store(false, Ordering::Release);
            if let Some(value) = aggregate(&inner) {
                inner.refreshes.fetch_add(1, Ordering::AcqRel);
                (inner.sink)(value);
            }
        });
    }

    pub fn current(&self) -> Option<f64> {
        aggregate(&self.inner)
    }

    /// Number of refreshes requested so far.
    pub fn refreshes(&self) -> u64 {
        self.inner.refreshes.load(Ordering::Acquire)
    }

    pub fn reporter(&self, worker: usize) -> ProgressReporter {
        ProgressReporter {
            worker,
            generation: self.generation(),
            aggregator: self.clone(),
        }
    }
}

fn aggregate(inner: &ProgressInner) -> Option<f64> {
    if inner.reports.is_empty() {
        return None;
    }
    let expected = inner.expected.load(Ordering::Acquire).max(inner.reports.len());
    if expected == 1 {
        return inner.reports.iter().next().map(|entry| *entry.value());
    }
    let sum: f64 = inner.reports.iter().map(|entry| *entry.value()).sum();
    Some(sum / expected as f64)
}

/// Formats a fraction the way node status shows it, e.g. `42.50%`.
pub fn format_percent(fraction: f64) -> String {
    format!("{:.2}%", fraction * 100.0)
}

/// Per-worker handle to the aggregator, bound to the pass it was created in.
#[derive(Clone)]
pub struct ProgressReporter {
    worker: usize,
    generation: u64,
    aggregator: ProgressAggregator,
}

impl ProgressReporter {
    /// Ignored once the aggregator has been reset or cleared.
    pub fn report(&self, fraction: f64) {
        self.aggregator
            .report_for(self.generation, self.worker, fraction);
    }
}
