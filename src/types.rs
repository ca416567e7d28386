// src/types.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub timing: TimingConfig,
    pub verifier: VerifierConfig,
    pub lanes: LanesConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub min_green_secs: f64,
    pub max_green_secs: f64,
    pub base_green_secs: f64,
    pub secs_per_vehicle: f64,
    pub yellow_secs: f64,
    pub emergency_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierMode {
    /// All gates must pass. Minimizes false positives under controlled
    /// conditions (staged vehicles, fixed cameras).
    Strict,
    /// Tolerates lighting variance at the cost of more false positives.
    Lenient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    pub mode: VerifierMode,
    /// Minimum bbox area in pixels. Rejects small red objects.
    pub min_area: f32,
    /// Ambulance-like width/height range.
    pub aspect_ratio_min: f32,
    pub aspect_ratio_max: f32,
    /// Minimum fraction of alert-colored (red band) pixels in the region.
    pub alert_pixel_ratio: f32,
    /// Weaker alert fraction accepted by the lenient light+alert combination.
    pub lenient_alert_ratio: f32,
    /// Minimum fraction of light (white band) pixels for the lenient path.
    pub light_pixel_ratio: f32,
    /// Minimum number of detected line segments in the white-cross check.
    pub cross_min_segments: u32,
    /// Bare detector-confidence fallback when everything else is inconclusive.
    pub fallback_confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanesConfig {
    pub count: usize,
    /// Classes counted as vehicles (COCO-style labels).
    pub vehicle_classes: Vec<String>,
    /// Classes handed to the emergency verifier.
    pub emergency_candidates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Per-lane detection deadline. A worker missing it contributes its
    /// previous snapshot marked stale.
    pub deadline_ms: u64,
    /// Consecutive stale ticks before a lane is degraded to
    /// round-robin-only service.
    pub max_stale_ticks: u32,
    /// Target tick cadence for the runtime loop.
    pub tick_hz: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

/// Raw RGB24 frame as handed over by a FrameSource.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub timestamp: f64,
}

/// One detected object. Produced per frame by an external detector,
/// discarded after aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: [f32; 4], // [x1, y1, x2, y2] in frame coordinates
    pub confidence: f32,
    pub class_name: String,
}

impl Detection {
    pub fn width(&self) -> f32 {
        self.bbox[2] - self.bbox[0]
    }

    pub fn height(&self) -> f32 {
        self.bbox[3] - self.bbox[1]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalPhase {
    Red,
    Green,
    Yellow,
}

impl SignalPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalPhase::Red => "RED",
            SignalPhase::Green => "GREEN",
            SignalPhase::Yellow => "YELLOW",
        }
    }
}

/// Aggregated per-lane detection summary for one tick. Immutable once
/// produced; superseded by the next snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneSnapshot {
    pub lane_id: usize,
    pub vehicle_counts: HashMap<String, u32>,
    pub total_vehicles: u32,
    pub has_emergency: bool,
    pub captured_at: f64,
    /// Set when this snapshot was substituted for a worker that missed
    /// its deadline.
    pub stale: bool,
    pub tick_id: u64,
}

impl LaneSnapshot {
    /// Empty snapshot for a lane that has produced nothing yet.
    pub fn empty(lane_id: usize, tick_id: u64) -> Self {
        Self {
            lane_id,
            vehicle_counts: HashMap::new(),
            total_vehicles: 0,
            has_emergency: false,
            captured_at: 0.0,
            stale: false,
            tick_id,
        }
    }

    /// An emergency flag only counts while the snapshot is fresh.
    pub fn fresh_emergency(&self) -> bool {
        self.has_emergency && !self.stale
    }
}

/// Read-only view of one lane, embedded in ControllerState.
#[derive(Debug, Clone, Serialize)]
pub struct LaneView {
    pub id: usize,
    pub phase: SignalPhase,
    pub remaining_secs: f64,
    pub green_assigned_secs: f64,
    pub vehicle_count: u32,
    pub has_emergency: bool,
    pub stale: bool,
    pub degraded: bool,
}

/// Snapshot of the whole controller, returned by every tick.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerState {
    pub lanes: Vec<LaneView>,
    /// Meaningful only in normal mode.
    pub current_lane_index: usize,
    pub emergency_mode: bool,
    pub emergency_deadline: Option<f64>,
    pub cycle_count: u64,
    pub now: f64,
}

impl ControllerState {
    pub fn green_lanes(&self) -> Vec<usize> {
        self.lanes
            .iter()
            .filter(|l| l.phase == SignalPhase::Green)
            .map(|l| l.id)
            .collect()
    }
}
