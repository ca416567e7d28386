// src/scheduler.rs
//
// Per-lane phase state machine with adaptive green timing and emergency
// preemption. Δt-driven: the tick loop calls update(dt) after the barrier
// has ingested every lane's snapshot for the tick.
//
// Normal mode keeps exactly one lane in GREEN or YELLOW at a time. Emergency
// mode may hold several lanes GREEN at once (overlapping emergencies) and
// skips the amber phase entirely on entry — a deliberate operational choice,
// not an oversight: preempted cross traffic is already being forced to RED
// while the emergency lane is granted immediate right-of-way.

use crate::events::{EventBus, SignalEvent};
use crate::types::{ControllerState, LaneSnapshot, LaneView, SignalPhase, TimingConfig};
use tracing::{debug, info, warn};

/// One approach to the intersection. Owned exclusively by the scheduler;
/// mutated only by scheduler transitions on the tick thread.
#[derive(Debug)]
pub struct Lane {
    pub id: usize,
    pub phase: SignalPhase,
    pub remaining: f64,
    pub green_assigned: f64,
    pub last_snapshot: Option<LaneSnapshot>,
    pub stale_ticks: u32,
    pub degraded: bool,
}

impl Lane {
    fn new(id: usize) -> Self {
        Self {
            id,
            phase: SignalPhase::Red,
            remaining: 0.0,
            green_assigned: 0.0,
            last_snapshot: None,
            stale_ticks: 0,
            degraded: false,
        }
    }

    /// Last known vehicle count. An absent snapshot means "no change",
    /// which at startup is zero.
    pub fn vehicle_count(&self) -> u32 {
        self.last_snapshot
            .as_ref()
            .map(|s| s.total_vehicles)
            .unwrap_or(0)
    }

    /// Emergency demand that is allowed to drive preemption: the latest
    /// snapshot must be fresh and the lane must not be degraded. A stale
    /// emergency flag is never privileged.
    pub fn emergency_demand(&self) -> bool {
        !self.degraded
            && self
                .last_snapshot
                .as_ref()
                .map(|s| s.fresh_emergency())
                .unwrap_or(false)
    }
}

pub struct PhaseScheduler {
    timing: TimingConfig,
    max_stale_ticks: u32,
    lanes: Vec<Lane>,
    current: usize,
    emergency_mode: bool,
    emergency_deadline: Option<f64>,
    cycle_count: u64,
    now: f64,
    events: EventBus,
}

impl PhaseScheduler {
    /// Lanes are created once and persist for the scheduler's lifetime.
    /// Lane 0 starts GREEN with the base allocation so the intersection is
    /// never dark.
    pub fn new(timing: TimingConfig, lane_count: usize, max_stale_ticks: u32) -> Self {
        let mut lanes: Vec<Lane> = (0..lane_count).map(Lane::new).collect();
        let initial_green = clamp_green(&timing, 0);
        lanes[0].phase = SignalPhase::Green;
        lanes[0].remaining = initial_green;
        lanes[0].green_assigned = initial_green;

        Self {
            timing,
            max_stale_ticks,
            lanes,
            current: 0,
            emergency_mode: false,
            emergency_deadline: None,
            cycle_count: 0,
            now: 0.0,
            events: EventBus::new(64),
        }
    }

    pub fn green_time(&self, vehicle_count: u32) -> f64 {
        clamp_green(&self.timing, vehicle_count)
    }

    pub fn emergency_mode(&self) -> bool {
        self.emergency_mode
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    pub fn drain_events(&mut self) -> Vec<SignalEvent> {
        self.events.drain()
    }

    /// Store one lane's snapshot for the upcoming update. Stale
    /// substitutions accumulate toward degradation; any fresh snapshot
    /// recovers the lane.
    pub fn ingest(&mut self, snapshot: LaneSnapshot) {
        let max_stale = self.max_stale_ticks;
        let lane = match self.lanes.get_mut(snapshot.lane_id) {
            Some(lane) => lane,
            None => {
                warn!("scheduler: snapshot for unknown lane {}", snapshot.lane_id);
                return;
            }
        };

        if snapshot.stale {
            lane.stale_ticks = lane.stale_ticks.saturating_add(1);
            if !lane.degraded && lane.stale_ticks >= max_stale {
                lane.degraded = true;
                warn!(
                    "lane {} degraded after {} stale ticks; round-robin service only",
                    lane.id, lane.stale_ticks
                );
                self.events.publish(SignalEvent::LaneDegraded {
                    lane_id: snapshot.lane_id,
                    stale_ticks: lane.stale_ticks,
                });
            }
        } else {
            if lane.degraded {
                info!("lane {} recovered with a fresh snapshot", lane.id);
                self.events
                    .publish(SignalEvent::LaneRecovered { lane_id: lane.id });
            }
            lane.stale_ticks = 0;
            lane.degraded = false;
        }

        lane.last_snapshot = Some(snapshot);
    }

    /// Advance the state machine by dt seconds. Snapshots for this tick
    /// must already be ingested.
    pub fn update(&mut self, dt: f64) {
        self.now += dt;

        if self.emergency_mode {
            self.update_emergency();
        } else if self.lanes.iter().any(|l| l.emergency_demand()) {
            self.enter_emergency();
        } else {
            self.update_normal(dt);
        }
    }

    pub fn state(&self) -> ControllerState {
        ControllerState {
            lanes: self
                .lanes
                .iter()
                .map(|l| LaneView {
                    id: l.id,
                    phase: l.phase,
                    remaining_secs: l.remaining.max(0.0),
                    green_assigned_secs: l.green_assigned,
                    vehicle_count: l.vehicle_count(),
                    has_emergency: l.emergency_demand(),
                    stale: l
                        .last_snapshot
                        .as_ref()
                        .map(|s| s.stale)
                        .unwrap_or(false),
                    degraded: l.degraded,
                })
                .collect(),
            current_lane_index: self.current,
            emergency_mode: self.emergency_mode,
            emergency_deadline: self.emergency_deadline,
            cycle_count: self.cycle_count,
            now: self.now,
        }
    }

    // ── Normal mode ──────────────────────────────────────────────────────

    fn update_normal(&mut self, dt: f64) {
        let idx = self.current;
        self.lanes[idx].remaining -= dt;
        if self.lanes[idx].remaining > 0.0 {
            return;
        }

        match self.lanes[idx].phase {
            SignalPhase::Green => {
                self.set_phase(idx, SignalPhase::Yellow);
                self.lanes[idx].remaining = self.timing.yellow_secs;
            }
            SignalPhase::Yellow => {
                self.set_phase(idx, SignalPhase::Red);
                self.lanes[idx].remaining = 0.0;
                let next = self.select_next_lane();
                self.start_green(next);
            }
            SignalPhase::Red => {
                // Recovery path (e.g. right after an emergency exit left
                // everything red): pick a lane and serve it.
                let next = self.select_next_lane();
                self.start_green(next);
            }
        }
    }

    /// Deterministic next-lane rule: largest last-known vehicle count among
    /// non-degraded lanes, ties to the lowest lane id; all-zero falls back
    /// to round-robin over every lane, which guarantees that a lane with
    /// chronically empty detections is still served eventually.
    fn select_next_lane(&self) -> usize {
        let busiest = self
            .lanes
            .iter()
            .filter(|l| !l.degraded && l.vehicle_count() > 0)
            .max_by(|a, b| {
                a.vehicle_count()
                    .cmp(&b.vehicle_count())
                    .then(b.id.cmp(&a.id)) // prefer the lower id on ties
            });

        match busiest {
            Some(lane) => lane.id,
            None => (self.current + 1) % self.lanes.len(),
        }
    }

    fn start_green(&mut self, idx: usize) {
        let count = self.lanes[idx].vehicle_count();
        let green = self.green_time(count);

        self.current = idx;
        self.set_phase(idx, SignalPhase::Green);
        self.lanes[idx].remaining = green;
        self.lanes[idx].green_assigned = green;

        if idx == 0 {
            self.cycle_count += 1;
        }

        info!(
            "lane {} GREEN for {:.1}s ({} vehicle(s))",
            idx, green, count
        );
        self.events.publish(SignalEvent::LaneServed {
            lane_id: idx,
            green_secs: green,
            vehicle_count: count,
        });
    }

    // ── Emergency mode ───────────────────────────────────────────────────

    fn enter_emergency(&mut self) {
        let deadline = self.now + self.timing.emergency_secs;
        self.emergency_mode = true;
        self.emergency_deadline = Some(deadline);

        let mut green_lanes = Vec::new();
        for idx in 0..self.lanes.len() {
            if self.lanes[idx].emergency_demand() {
                self.set_phase(idx, SignalPhase::Green);
                self.lanes[idx].remaining = self.timing.emergency_secs;
                self.lanes[idx].green_assigned = self.timing.emergency_secs;
                green_lanes.push(idx);
            } else {
                // Forced straight to RED, bypassing YELLOW.
                self.set_phase(idx, SignalPhase::Red);
                self.lanes[idx].remaining = 0.0;
            }
        }

        warn!(
            "🚨 EMERGENCY PREEMPTION: lane(s) {:?} forced GREEN until t={:.1}s \
             (amber phase bypassed)",
            green_lanes, deadline
        );
        self.events.publish(SignalEvent::EmergencyEntered {
            lanes: green_lanes,
            deadline,
        });
    }

    fn update_emergency(&mut self) {
        let deadline = self.emergency_deadline.unwrap_or(self.now);
        let any_demand = self.lanes.iter().any(|l| l.emergency_demand());

        if self.now >= deadline && !any_demand {
            self.exit_emergency();
            return;
        }

        // Re-evaluate green-set membership every tick: overlapping
        // emergencies join, cleared lanes drop to RED immediately.
        for idx in 0..self.lanes.len() {
            if self.lanes[idx].emergency_demand() {
                if self.lanes[idx].phase != SignalPhase::Green {
                    info!("lane {} joined the emergency green set", idx);
                    self.set_phase(idx, SignalPhase::Green);
                    self.events
                        .publish(SignalEvent::EmergencyExtended { lane_id: idx });
                }
                self.lanes[idx].remaining = (deadline - self.now).max(0.0);
            } else if self.lanes[idx].phase != SignalPhase::Red {
                self.set_phase(idx, SignalPhase::Red);
                self.lanes[idx].remaining = 0.0;
            }
        }
    }

    fn exit_emergency(&mut self) {
        self.emergency_mode = false;
        self.emergency_deadline = None;

        for idx in 0..self.lanes.len() {
            if self.lanes[idx].phase != SignalPhase::Red {
                self.set_phase(idx, SignalPhase::Red);
                self.lanes[idx].remaining = 0.0;
            }
        }

        info!("emergency episode over; resuming normal scheduling");
        self.events.publish(SignalEvent::EmergencyExited);

        // The interrupted lane does not resume its leftover green time;
        // scheduling restarts through the regular selection rule.
        let next = self.select_next_lane();
        self.start_green(next);
    }

    fn set_phase(&mut self, idx: usize, to: SignalPhase) {
        let from = self.lanes[idx].phase;
        if from == to {
            return;
        }
        self.lanes[idx].phase = to;
        debug!("lane {}: {} → {}", idx, from.as_str(), to.as_str());
        self.events.publish(SignalEvent::PhaseChanged {
            lane_id: idx,
            from,
            to,
        });
    }
}

fn clamp_green(timing: &TimingConfig, vehicle_count: u32) -> f64 {
    let calculated = timing.base_green_secs + vehicle_count as f64 * timing.secs_per_vehicle;
    calculated.clamp(timing.min_green_secs, timing.max_green_secs)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use std::collections::HashMap;
    use std::collections::HashSet;

    fn scheduler() -> PhaseScheduler {
        let config = test_config();
        PhaseScheduler::new(config.timing, config.lanes.count, config.worker.max_stale_ticks)
    }

    fn snapshot(lane_id: usize, vehicles: u32, emergency: bool, stale: bool) -> LaneSnapshot {
        let mut counts = HashMap::new();
        if vehicles > 0 {
            counts.insert("car".to_string(), vehicles);
        }
        LaneSnapshot {
            lane_id,
            vehicle_counts: counts,
            total_vehicles: vehicles,
            has_emergency: emergency,
            captured_at: 0.0,
            stale,
            tick_id: 0,
        }
    }

    fn green_lanes(s: &PhaseScheduler) -> Vec<usize> {
        s.lanes()
            .iter()
            .filter(|l| l.phase == SignalPhase::Green)
            .map(|l| l.id)
            .collect()
    }

    fn run_out_current_phase(s: &mut PhaseScheduler) {
        let remaining = s.lanes()[s.state().current_lane_index].remaining;
        s.update(remaining + 0.001);
    }

    // ── Green time formula ───────────────────────────────────────────────

    #[test]
    fn test_green_time_is_base_for_empty_lane() {
        assert!((scheduler().green_time(0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_green_time_ten_vehicles() {
        // base 15 + 10 * 0.5 = 20
        assert!((scheduler().green_time(10) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_green_time_clamped_at_max() {
        assert!((scheduler().green_time(1000) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_green_time_clamped_at_min() {
        let mut config = test_config();
        config.timing.base_green_secs = 2.0;
        let s = PhaseScheduler::new(config.timing, 4, 5);
        assert!((s.green_time(0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_green_time_always_within_bounds() {
        let s = scheduler();
        for count in [0u32, 1, 7, 50, 200, 10_000] {
            let g = s.green_time(count);
            assert!((10.0..=60.0).contains(&g), "green({}) = {}", count, g);
        }
    }

    // ── Normal mode ──────────────────────────────────────────────────────

    #[test]
    fn test_initial_state_single_green() {
        let s = scheduler();
        assert_eq!(green_lanes(&s), vec![0]);
        assert!((s.lanes()[0].green_assigned - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_green_expiry_enters_yellow() {
        let mut s = scheduler();
        s.update(15.1);
        assert_eq!(s.lanes()[0].phase, SignalPhase::Yellow);
        assert!((s.lanes()[0].remaining - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_yellow_expiry_selects_busiest_lane() {
        let mut s = scheduler();
        s.ingest(snapshot(1, 3, false, false));
        s.ingest(snapshot(2, 9, false, false));
        s.ingest(snapshot(3, 5, false, false));

        run_out_current_phase(&mut s); // green → yellow
        run_out_current_phase(&mut s); // yellow → red, next selection
        assert_eq!(green_lanes(&s), vec![2]);
        // 15 + 9 * 0.5 = 19.5
        assert!((s.lanes()[2].green_assigned - 19.5).abs() < 1e-9);
    }

    #[test]
    fn test_tie_break_prefers_lowest_lane_id() {
        let mut s = scheduler();
        s.ingest(snapshot(1, 6, false, false));
        s.ingest(snapshot(3, 6, false, false));
        run_out_current_phase(&mut s);
        run_out_current_phase(&mut s);
        assert_eq!(green_lanes(&s), vec![1]);
    }

    #[test]
    fn test_round_robin_when_all_counts_zero() {
        let mut s = scheduler();
        run_out_current_phase(&mut s);
        run_out_current_phase(&mut s);
        assert_eq!(green_lanes(&s), vec![1]);
    }

    #[test]
    fn test_exactly_one_active_lane_in_normal_mode() {
        let mut s = scheduler();
        s.ingest(snapshot(2, 4, false, false));
        for _ in 0..500 {
            s.update(0.5);
            let active = s
                .lanes()
                .iter()
                .filter(|l| l.phase != SignalPhase::Red)
                .count();
            assert_eq!(active, 1);
        }
    }

    #[test]
    fn test_starvation_freedom_under_zero_traffic() {
        let mut s = scheduler();
        let mut served: HashSet<usize> = HashSet::new();
        // Zero counts everywhere → pure round-robin. Three full rotations.
        for _ in 0..24 {
            run_out_current_phase(&mut s); // green → yellow
            run_out_current_phase(&mut s); // yellow → next green
            served.extend(green_lanes(&s));
        }
        assert_eq!(served.len(), 4);
    }

    #[test]
    fn test_cycle_count_increments_on_wraparound() {
        let mut s = scheduler();
        assert_eq!(s.state().cycle_count, 0);
        for _ in 0..4 {
            run_out_current_phase(&mut s);
            run_out_current_phase(&mut s);
        }
        // 1 → 2 → 3 → 0: one wrap
        assert_eq!(s.state().cycle_count, 1);
    }

    #[test]
    fn test_absent_snapshot_means_no_change() {
        let mut s = scheduler();
        s.ingest(snapshot(1, 8, false, false));
        // Lane 1 never reports again; its count persists for selection.
        run_out_current_phase(&mut s);
        run_out_current_phase(&mut s);
        assert_eq!(green_lanes(&s), vec![1]);
    }

    // ── Emergency preemption ─────────────────────────────────────────────

    #[test]
    fn test_emergency_entry_same_tick_no_yellow() {
        let mut s = scheduler();
        s.ingest(snapshot(2, 1, true, false));
        s.update(0.033);

        assert!(s.emergency_mode());
        assert_eq!(green_lanes(&s), vec![2]);
        // The previously green lane went straight to RED
        assert_eq!(s.lanes()[0].phase, SignalPhase::Red);
        assert!(s
            .lanes()
            .iter()
            .all(|l| l.phase != SignalPhase::Yellow));
    }

    #[test]
    fn test_preemption_invariant_every_tick() {
        let mut s = scheduler();
        s.ingest(snapshot(1, 2, true, false));
        for _ in 0..100 {
            s.update(0.1);
            if !s.emergency_mode() {
                break;
            }
            for lane in s.lanes() {
                if !lane.emergency_demand() {
                    assert_eq!(lane.phase, SignalPhase::Red);
                }
            }
        }
    }

    #[test]
    fn test_overlapping_emergencies_both_green() {
        let mut s = scheduler();
        s.ingest(snapshot(1, 1, true, false));
        s.update(0.033);
        s.ingest(snapshot(3, 1, true, false));
        s.update(0.033);

        assert!(s.emergency_mode());
        assert_eq!(green_lanes(&s), vec![1, 3]);
    }

    #[test]
    fn test_cleared_lane_drops_to_red_mid_episode() {
        let mut s = scheduler();
        s.ingest(snapshot(1, 1, true, false));
        s.ingest(snapshot(3, 1, true, false));
        s.update(0.033);
        assert_eq!(green_lanes(&s), vec![1, 3]);

        s.ingest(snapshot(3, 1, false, false));
        s.update(0.033);
        assert_eq!(green_lanes(&s), vec![1]);
        assert_eq!(s.lanes()[3].phase, SignalPhase::Red);
    }

    #[test]
    fn test_emergency_holds_past_deadline_while_demand_persists() {
        let mut s = scheduler();
        s.ingest(snapshot(2, 1, true, false));
        s.update(0.033);
        // Way past the 30s deadline, but the lane still reports emergency.
        for _ in 0..50 {
            s.ingest(snapshot(2, 1, true, false));
            s.update(1.0);
        }
        assert!(s.emergency_mode());
        assert_eq!(green_lanes(&s), vec![2]);
    }

    #[test]
    fn test_exit_restarts_normal_selection() {
        let mut s = scheduler();
        s.ingest(snapshot(2, 1, true, false));
        s.ingest(snapshot(1, 12, false, false));
        s.update(0.033);
        assert!(s.emergency_mode());

        // Clear the emergency and jump past the deadline.
        s.ingest(snapshot(2, 0, false, false));
        s.update(31.0);

        assert!(!s.emergency_mode());
        assert_eq!(s.state().emergency_deadline, None);
        // Fresh selection, not a resume: lane 1 has the biggest queue.
        assert_eq!(green_lanes(&s), vec![1]);
        assert!((s.lanes()[1].green_assigned - 21.0).abs() < 1e-9);
    }

    #[test]
    fn test_exit_within_one_tick_of_conditions() {
        let mut s = scheduler();
        s.ingest(snapshot(2, 1, true, false));
        s.update(0.033);
        s.ingest(snapshot(2, 1, false, false));
        s.update(30.1);
        assert!(!s.emergency_mode());
        assert_eq!(green_lanes(&s).len(), 1);
    }

    #[test]
    fn test_stale_emergency_flag_never_preempts() {
        let mut s = scheduler();
        s.ingest(snapshot(2, 1, true, true)); // stale substitution
        s.update(0.033);
        assert!(!s.emergency_mode());
        assert_eq!(green_lanes(&s), vec![0]);
    }

    // ── Degradation ──────────────────────────────────────────────────────

    #[test]
    fn test_repeated_staleness_degrades_lane() {
        let mut s = scheduler();
        for _ in 0..5 {
            s.ingest(snapshot(2, 20, false, true));
        }
        assert!(s.lanes()[2].degraded);

        // Degraded lane's big count no longer wins count-based selection.
        run_out_current_phase(&mut s);
        run_out_current_phase(&mut s);
        assert_eq!(green_lanes(&s), vec![1]);
    }

    #[test]
    fn test_degraded_lane_still_served_by_round_robin() {
        let mut s = scheduler();
        for _ in 0..5 {
            s.ingest(snapshot(1, 0, false, true));
        }
        assert!(s.lanes()[1].degraded);
        run_out_current_phase(&mut s);
        run_out_current_phase(&mut s);
        // All counts zero → round-robin, which includes degraded lanes.
        assert_eq!(green_lanes(&s), vec![1]);
    }

    #[test]
    fn test_degraded_emergency_flag_ignored_until_fresh() {
        let mut s = scheduler();
        for _ in 0..5 {
            s.ingest(snapshot(2, 1, true, true));
        }
        s.update(0.033);
        assert!(!s.emergency_mode());

        s.ingest(snapshot(2, 1, true, false));
        s.update(0.033);
        assert!(s.emergency_mode());
        assert!(!s.lanes()[2].degraded);
    }

    #[test]
    fn test_remaining_time_never_reported_negative() {
        let mut s = scheduler();
        s.update(14.9);
        s.update(5.0); // overshoot the green expiry
        let state = s.state();
        for lane in &state.lanes {
            assert!(lane.remaining_secs >= 0.0);
        }
    }
}
