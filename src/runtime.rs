// src/runtime.rs
//
// Async harness around the controller: one blocking worker per lane runs
// capture → detect → aggregate, a barrier with a per-worker deadline joins
// them, and the tick thread advances the scheduler with the measured Δt.
//
// A worker missing its deadline does not stall the tick: the lane's previous
// snapshot is re-submitted marked stale, and the real result (if it ever
// lands) is discarded by its tick id.

use crate::controller::{Controller, TickReport};
use crate::interface::{Detector, EmergencySignalEmitter, FrameSource};
use crate::types::{Config, ControllerState, LaneSnapshot};
use anyhow::Result;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::warn;

pub struct SignalRuntime {
    controller: Controller,
    source: Arc<dyn FrameSource>,
    detector: Arc<dyn Detector>,
    lane_count: usize,
    deadline: Duration,
    tick_hz: u32,
    previous: Vec<LaneSnapshot>,
    epoch: Instant,
}

impl SignalRuntime {
    pub fn new(
        config: Config,
        source: Arc<dyn FrameSource>,
        detector: Arc<dyn Detector>,
        emitter: Arc<dyn EmergencySignalEmitter>,
    ) -> Result<Self> {
        let lane_count = config.lanes.count;
        let deadline = Duration::from_millis(config.worker.deadline_ms);
        let tick_hz = config.worker.tick_hz;
        let controller = Controller::new(config, emitter)?;
        let previous = (0..lane_count)
            .map(|lane| LaneSnapshot::empty(lane, 0))
            .collect();

        Ok(Self {
            controller,
            source,
            detector,
            lane_count,
            deadline,
            tick_hz,
            previous,
            epoch: Instant::now(),
        })
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn current_state(&self) -> ControllerState {
        self.controller.current_state()
    }

    /// One full tick: fan out lane workers, join them at the deadline,
    /// substitute stale snapshots for the losers, advance the scheduler.
    pub async fn run_tick(&mut self, dt: f64) -> TickReport {
        let tick_id = self.controller.current_tick();
        let captured_at = self.epoch.elapsed().as_secs_f64();

        let workers: Vec<_> = (0..self.lane_count)
            .map(|lane_id| {
                let source = Arc::clone(&self.source);
                let detector = Arc::clone(&self.detector);
                let aggregator = self.controller.aggregator();
                let handle = tokio::task::spawn_blocking(move || -> Result<LaneSnapshot> {
                    let frame = source.next_frame(lane_id)?;
                    let detections = detector.detect(&frame)?;
                    aggregator.aggregate(lane_id, &frame, &detections, captured_at, tick_id)
                });
                tokio::time::timeout(self.deadline, handle)
            })
            .collect();

        let results = join_all(workers).await;

        for (lane_id, result) in results.into_iter().enumerate() {
            let snapshot = match result {
                Ok(Ok(Ok(snapshot))) => {
                    self.previous[lane_id] = snapshot.clone();
                    snapshot
                }
                Ok(Ok(Err(err))) => {
                    warn!("lane {} worker failed: {:#}", lane_id, err);
                    self.stale_substitute(lane_id, tick_id)
                }
                Ok(Err(join_err)) => {
                    warn!("lane {} worker panicked: {}", lane_id, join_err);
                    self.stale_substitute(lane_id, tick_id)
                }
                Err(_) => {
                    warn!(
                        "lane {} missed the {}ms deadline, reusing previous snapshot",
                        lane_id,
                        self.deadline.as_millis()
                    );
                    self.stale_substitute(lane_id, tick_id)
                }
            };
            self.controller.submit_snapshot(snapshot);
        }

        self.controller.tick(dt)
    }

    fn stale_substitute(&self, lane_id: usize, tick_id: u64) -> LaneSnapshot {
        let metrics = self.controller.metrics();
        metrics.inc(&metrics.stale_substitutions);

        let mut snapshot = self.previous[lane_id].clone();
        snapshot.stale = true;
        snapshot.tick_id = tick_id;
        snapshot
    }

    /// Fixed-cadence loop at `tick_hz`. Δt is measured, not assumed, so a
    /// delayed wakeup stretches the affected tick instead of losing time.
    pub async fn run<F>(&mut self, max_ticks: Option<u64>, mut on_tick: F) -> Result<()>
    where
        F: FnMut(&TickReport),
    {
        let period = Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last = Instant::now();
        let mut ticks = 0u64;
        loop {
            interval.tick().await;
            let now = Instant::now();
            let dt = (now - last).as_secs_f64();
            last = now;

            let report = self.run_tick(dt).await;
            on_tick(&report);

            ticks += 1;
            if let Some(max) = max_ticks {
                if ticks >= max {
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::sim::{LoggingEmitter, ScriptedScene, SceneDetector};
    use crate::types::{Detection, Frame, SignalPhase};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn runtime_with_scene(scene: ScriptedScene) -> (SignalRuntime, Arc<LoggingEmitter>) {
        let emitter = Arc::new(LoggingEmitter::new());
        let runtime = SignalRuntime::new(
            test_config(),
            Arc::new(scene),
            Arc::new(SceneDetector),
            emitter.clone(),
        )
        .unwrap();
        (runtime, emitter)
    }

    #[tokio::test]
    async fn test_tick_ingests_all_lanes() {
        let scene = ScriptedScene::with_emergency_window(4, 100, 2, 1000, 1000);
        let (mut runtime, _) = runtime_with_scene(scene);

        let report = runtime.run_tick(0.033).await;
        assert_eq!(report.state.lanes.len(), 4);
        for lane in &report.state.lanes {
            assert!(lane.vehicle_count >= 2, "lane {} saw no traffic", lane.id);
            assert!(!lane.stale);
        }
    }

    #[tokio::test]
    async fn test_emergency_window_drives_preemption_and_release() {
        // Emergency in lane 2 for ticks [0, 5); plenty of ticks after to
        // pass the 30s hold.
        let scene = ScriptedScene::with_emergency_window(4, 200, 2, 0, 5);
        let (mut runtime, emitter) = runtime_with_scene(scene);

        let report = runtime.run_tick(0.1).await;
        assert!(report.state.emergency_mode);
        assert_eq!(report.state.lanes[2].phase, SignalPhase::Green);
        assert!(emitter.is_active());

        // Big dt steps walk through the window and past the deadline.
        let mut cleared = false;
        for _ in 0..40 {
            let report = runtime.run_tick(1.0).await;
            if !report.state.emergency_mode {
                cleared = true;
                break;
            }
        }
        assert!(cleared, "emergency never released");
        assert!(!emitter.is_active());

        let state = runtime.current_state();
        let active = state
            .lanes
            .iter()
            .filter(|l| l.phase != SignalPhase::Red)
            .count();
        assert_eq!(active, 1);
    }

    #[tokio::test]
    async fn test_failing_worker_gets_stale_substitute() {
        struct FlakySource;
        impl FrameSource for FlakySource {
            fn next_frame(&self, lane_id: usize) -> Result<Frame> {
                if lane_id == 1 {
                    anyhow::bail!("camera 1 disconnected");
                }
                Ok(crate::sim::solid_frame(640, 360, crate::sim::ROAD_GRAY))
            }
        }

        let emitter = Arc::new(LoggingEmitter::new());
        let mut runtime = SignalRuntime::new(
            test_config(),
            Arc::new(FlakySource),
            Arc::new(SceneDetector),
            emitter,
        )
        .unwrap();

        let report = runtime.run_tick(0.033).await;
        assert!(report.state.lanes[1].stale);
        assert!(!report.state.lanes[0].stale);
        let metrics = runtime.controller().metrics();
        assert_eq!(metrics.stale_substitutions.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_slow_worker_does_not_stall_the_tick() {
        struct SlowDetector {
            calls: AtomicU64,
        }
        impl Detector for SlowDetector {
            fn detect(&self, _frame: &Frame) -> Result<Vec<Detection>> {
                self.calls.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(Duration::from_millis(500));
                Ok(Vec::new())
            }
        }

        let scene = ScriptedScene::with_emergency_window(4, 10, 0, 1000, 1000);
        let emitter = Arc::new(LoggingEmitter::new());
        let mut runtime = SignalRuntime::new(
            test_config(), // 200ms deadline
            Arc::new(scene),
            Arc::new(SlowDetector {
                calls: AtomicU64::new(0),
            }),
            emitter,
        )
        .unwrap();

        let started = Instant::now();
        let report = runtime.run_tick(0.033).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        for lane in &report.state.lanes {
            assert!(lane.stale);
            assert_eq!(lane.vehicle_count, 0);
        }
    }

    #[tokio::test]
    async fn test_run_loop_honors_tick_budget() {
        let scene = ScriptedScene::with_emergency_window(4, 50, 2, 1000, 1000);
        let (mut runtime, _) = runtime_with_scene(scene);

        let mut seen = 0u64;
        runtime.run(Some(5), |_| seen += 1).await.unwrap();
        assert_eq!(seen, 5);
        assert_eq!(runtime.controller().current_tick(), 5);
    }
}
