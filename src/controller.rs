// src/controller.rs
//
// Single-threaded facade over the scheduler. Owns the tick counter, rejects
// snapshots from closed ticks, and translates scheduler events into metrics
// and emitter calls. The runtime drives it; tests drive it directly.

use crate::aggregator::LaneAggregator;
use crate::events::SignalEvent;
use crate::interface::EmergencySignalEmitter;
use crate::metrics::ControllerMetrics;
use crate::scheduler::PhaseScheduler;
use crate::types::{Config, ControllerState, Detection, Frame, LaneSnapshot};
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

/// Everything one tick produced: the post-update state plus the events the
/// scheduler published while computing it.
pub struct TickReport {
    pub state: ControllerState,
    pub events: Vec<SignalEvent>,
}

pub struct Controller {
    scheduler: PhaseScheduler,
    aggregator: LaneAggregator,
    metrics: ControllerMetrics,
    emitter: Arc<dyn EmergencySignalEmitter>,
    tick_id: u64,
}

impl Controller {
    pub fn new(config: Config, emitter: Arc<dyn EmergencySignalEmitter>) -> Result<Self> {
        config.validate()?;

        let metrics = ControllerMetrics::new();
        let scheduler = PhaseScheduler::new(
            config.timing.clone(),
            config.lanes.count,
            config.worker.max_stale_ticks,
        );
        let aggregator = LaneAggregator::new(
            config.lanes.clone(),
            config.verifier.clone(),
            metrics.clone(),
        );

        Ok(Self {
            scheduler,
            aggregator,
            metrics,
            emitter,
            tick_id: 0,
        })
    }

    pub fn current_tick(&self) -> u64 {
        self.tick_id
    }

    pub fn metrics(&self) -> &ControllerMetrics {
        &self.metrics
    }

    /// Cheap clone for lane workers; aggregation itself is pure.
    pub fn aggregator(&self) -> LaneAggregator {
        self.aggregator.clone()
    }

    /// Aggregate raw detections for a lane and ingest the result. The
    /// in-process path used by tests and single-threaded embeddings.
    pub fn submit_detections(
        &mut self,
        lane_id: usize,
        frame: &Frame,
        detections: &[Detection],
        captured_at: f64,
    ) -> Result<()> {
        let snapshot =
            self.aggregator
                .aggregate(lane_id, frame, detections, captured_at, self.tick_id)?;
        self.submit_snapshot(snapshot);
        Ok(())
    }

    /// Ingest a pre-built snapshot. Results tagged with an older tick id
    /// arrive after their tick's barrier already resolved (the worker was
    /// substituted with a stale copy); they are counted and discarded.
    pub fn submit_snapshot(&mut self, snapshot: LaneSnapshot) {
        if snapshot.tick_id != self.tick_id {
            debug!(
                "discarding late snapshot for lane {} (tick {} vs current {})",
                snapshot.lane_id, snapshot.tick_id, self.tick_id
            );
            self.metrics.inc(&self.metrics.snapshots_late);
            return;
        }
        self.metrics.inc(&self.metrics.snapshots_ingested);
        self.scheduler.ingest(snapshot);
    }

    /// Close the current tick: advance the state machine, apply events to
    /// metrics and the emitter, and open the next tick.
    pub fn tick(&mut self, dt: f64) -> TickReport {
        self.scheduler.update(dt);
        self.metrics.inc(&self.metrics.ticks);

        let events = self.scheduler.drain_events();
        for event in &events {
            match event {
                SignalEvent::PhaseChanged { .. } => {
                    self.metrics.inc(&self.metrics.phase_changes);
                }
                SignalEvent::EmergencyEntered { .. } => {
                    self.metrics.inc(&self.metrics.emergency_entries);
                    self.emitter.emit(true);
                }
                SignalEvent::EmergencyExited => {
                    self.metrics.inc(&self.metrics.emergency_exits);
                    self.emitter.emit(false);
                }
                SignalEvent::LaneDegraded { .. } => {
                    self.metrics.inc(&self.metrics.lanes_degraded);
                }
                _ => {}
            }
        }

        self.tick_id += 1;
        TickReport {
            state: self.scheduler.state(),
            events,
        }
    }

    pub fn current_state(&self) -> ControllerState {
        self.scheduler.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::sim::{paint_emergency_vehicle, solid_frame, LoggingEmitter, ROAD_GRAY};
    use crate::types::SignalPhase;
    use std::collections::HashMap;

    fn controller() -> (Controller, Arc<LoggingEmitter>) {
        let emitter = Arc::new(LoggingEmitter::new());
        let controller = Controller::new(test_config(), emitter.clone()).unwrap();
        (controller, emitter)
    }

    fn snapshot(lane_id: usize, vehicles: u32, emergency: bool, tick_id: u64) -> LaneSnapshot {
        LaneSnapshot {
            lane_id,
            vehicle_counts: HashMap::new(),
            total_vehicles: vehicles,
            has_emergency: emergency,
            captured_at: 0.0,
            stale: false,
            tick_id,
        }
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let mut config = test_config();
        config.timing.min_green_secs = 90.0; // > max
        assert!(Controller::new(config, Arc::new(LoggingEmitter::new())).is_err());
    }

    #[test]
    fn test_late_snapshot_discarded() {
        let (mut c, _) = controller();
        c.tick(0.033); // tick 0 closes, tick 1 opens
        c.submit_snapshot(snapshot(1, 50, false, 0)); // stamped with tick 0

        assert_eq!(
            c.metrics()
                .snapshots_late
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        // The discarded count never reached lane 1
        assert_eq!(c.current_state().lanes[1].vehicle_count, 0);
    }

    #[test]
    fn test_emitter_toggled_on_emergency_edges() {
        let (mut c, emitter) = controller();
        assert!(!emitter.is_active());

        c.submit_snapshot(snapshot(2, 1, true, 0));
        c.tick(0.033);
        assert!(emitter.is_active());

        // Clear the demand and run past the 30s hold.
        let tick = c.current_tick();
        c.submit_snapshot(snapshot(2, 1, false, tick));
        c.tick(31.0);
        assert!(!emitter.is_active());
    }

    #[test]
    fn test_detections_flow_through_aggregation() {
        let (mut c, _) = controller();
        let mut frame = solid_frame(640, 360, ROAD_GRAY);
        paint_emergency_vehicle(&mut frame, 200, 220, 120, 60);
        let detections = vec![Detection {
            bbox: [200.0, 220.0, 320.0, 280.0],
            confidence: 0.9,
            class_name: "truck".to_string(),
        }];

        c.submit_detections(1, &frame, &detections, 0.5).unwrap();
        let report = c.tick(0.033);
        assert!(report.state.emergency_mode);
        assert_eq!(report.state.lanes[1].phase, SignalPhase::Green);
    }

    #[test]
    fn test_tick_counter_advances() {
        let (mut c, _) = controller();
        assert_eq!(c.current_tick(), 0);
        c.tick(0.033);
        c.tick(0.033);
        assert_eq!(c.current_tick(), 2);
        assert_eq!(
            c.metrics().ticks.load(std::sync::atomic::Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn test_phase_change_events_counted() {
        let (mut c, _) = controller();
        c.tick(15.1); // green expiry on lane 0 → yellow
        assert!(
            c.metrics()
                .phase_changes
                .load(std::sync::atomic::Ordering::Relaxed)
                >= 1
        );
    }
}
