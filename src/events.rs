// src/events.rs
//
// Decoupled event stream. The scheduler publishes transitions instead of
// reaching into the emitter/log/metrics directly; the controller drains
// the bus once per tick.

use crate::types::SignalPhase;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SignalEvent {
    PhaseChanged {
        lane_id: usize,
        from: SignalPhase,
        to: SignalPhase,
    },

    /// A lane was selected for normal-mode green service.
    LaneServed {
        lane_id: usize,
        green_secs: f64,
        vehicle_count: u32,
    },

    EmergencyEntered {
        lanes: Vec<usize>,
        deadline: f64,
    },

    /// An additional lane joined the green set mid-episode.
    EmergencyExtended {
        lane_id: usize,
    },

    EmergencyExited,

    /// Too many consecutive stale snapshots; lane demoted to
    /// round-robin-only service.
    LaneDegraded {
        lane_id: usize,
        stale_ticks: u32,
    },

    LaneRecovered {
        lane_id: usize,
    },
}

pub struct EventBus {
    events: VecDeque<SignalEvent>,
    max_pending: usize,
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_pending),
            max_pending,
        }
    }

    pub fn publish(&mut self, event: SignalEvent) {
        if self.events.len() >= self.max_pending {
            warn!(
                "Event bus full ({} events), dropping oldest",
                self.max_pending
            );
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<SignalEvent> {
        self.events.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.events.len()
    }
}
