// src/metrics.rs
//
// Controller observability. Counters shared across the tick thread and
// lane workers; export via logs or the summary struct.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct ControllerMetrics {
    pub ticks: Arc<AtomicU64>,
    pub snapshots_ingested: Arc<AtomicU64>,
    pub snapshots_late: Arc<AtomicU64>,
    pub stale_substitutions: Arc<AtomicU64>,
    pub detections_dropped: Arc<AtomicU64>,
    pub phase_changes: Arc<AtomicU64>,
    pub emergency_entries: Arc<AtomicU64>,
    pub emergency_exits: Arc<AtomicU64>,
    pub lanes_degraded: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ControllerMetrics {
    pub fn new() -> Self {
        Self {
            ticks: Arc::new(AtomicU64::new(0)),
            snapshots_ingested: Arc::new(AtomicU64::new(0)),
            snapshots_late: Arc::new(AtomicU64::new(0)),
            stale_substitutions: Arc::new(AtomicU64::new(0)),
            detections_dropped: Arc::new(AtomicU64::new(0)),
            phase_changes: Arc::new(AtomicU64::new(0)),
            emergency_entries: Arc::new(AtomicU64::new(0)),
            emergency_exits: Arc::new(AtomicU64::new(0)),
            lanes_degraded: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tick_rate(&self) -> f64 {
        let ticks = self.ticks.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            ticks as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            ticks: self.ticks.load(Ordering::Relaxed),
            tick_rate: self.tick_rate(),
            snapshots_ingested: self.snapshots_ingested.load(Ordering::Relaxed),
            snapshots_late: self.snapshots_late.load(Ordering::Relaxed),
            stale_substitutions: self.stale_substitutions.load(Ordering::Relaxed),
            detections_dropped: self.detections_dropped.load(Ordering::Relaxed),
            phase_changes: self.phase_changes.load(Ordering::Relaxed),
            emergency_entries: self.emergency_entries.load(Ordering::Relaxed),
            emergency_exits: self.emergency_exits.load(Ordering::Relaxed),
            lanes_degraded: self.lanes_degraded.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub ticks: u64,
    pub tick_rate: f64,
    pub snapshots_ingested: u64,
    pub snapshots_late: u64,
    pub stale_substitutions: u64,
    pub detections_dropped: u64,
    pub phase_changes: u64,
    pub emergency_entries: u64,
    pub emergency_exits: u64,
    pub lanes_degraded: u64,
    pub elapsed_secs: f64,
}
