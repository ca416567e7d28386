// src/aggregator.rs
//
// Collapses one frame's worth of detections for a lane into a LaneSnapshot.
// Malformed detections are dropped here; malformed lane ids are rejected
// here — nothing invalid ever reaches the scheduler.

use crate::metrics::ControllerMetrics;
use crate::types::{Detection, Frame, LaneSnapshot, LanesConfig, VerifierConfig};
use crate::verifier::EmergencyVerifier;
use anyhow::{bail, Result};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Pure per-lane aggregation. No shared mutable state: safe to run one
/// instance concurrently across lane workers.
#[derive(Clone)]
pub struct LaneAggregator {
    lanes: LanesConfig,
    verifier: EmergencyVerifier,
    metrics: ControllerMetrics,
}

impl LaneAggregator {
    pub fn new(lanes: LanesConfig, verifier: VerifierConfig, metrics: ControllerMetrics) -> Self {
        Self {
            lanes,
            verifier: EmergencyVerifier::new(verifier),
            metrics,
        }
    }

    pub fn aggregate(
        &self,
        lane_id: usize,
        frame: &Frame,
        detections: &[Detection],
        captured_at: f64,
        tick_id: u64,
    ) -> Result<LaneSnapshot> {
        if lane_id >= self.lanes.count {
            bail!(
                "lane id {} out of range (configured lanes: {})",
                lane_id,
                self.lanes.count
            );
        }

        let mut counts: HashMap<String, u32> = HashMap::new();
        let mut has_emergency = false;

        for det in detections {
            if !self.is_well_formed(det, frame) {
                warn!(
                    "lane {}: dropping malformed detection bbox={:?} class={}",
                    lane_id, det.bbox, det.class_name
                );
                self.metrics.inc(&self.metrics.detections_dropped);
                continue;
            }

            if self.lanes.vehicle_classes.iter().any(|c| c == &det.class_name) {
                *counts.entry(det.class_name.clone()).or_insert(0) += 1;
            }

            if !has_emergency
                && self
                    .lanes
                    .emergency_candidates
                    .iter()
                    .any(|c| c == &det.class_name)
                && self.verifier.verify(frame, det)
            {
                debug!(
                    "lane {}: emergency vehicle verified (class={}, conf={:.2})",
                    lane_id, det.class_name, det.confidence
                );
                has_emergency = true;
            }
        }

        let total_vehicles = counts.values().sum();
        Ok(LaneSnapshot {
            lane_id,
            vehicle_counts: counts,
            total_vehicles,
            has_emergency,
            captured_at,
            stale: false,
            tick_id,
        })
    }

    fn is_well_formed(&self, det: &Detection, frame: &Frame) -> bool {
        if det.width() <= 0.0 || det.height() <= 0.0 {
            return false;
        }
        // Fully outside the image
        if det.bbox[0] >= frame.width as f32
            || det.bbox[1] >= frame.height as f32
            || det.bbox[2] <= 0.0
            || det.bbox[3] <= 0.0
        {
            return false;
        }
        true
    }
}
