// src/lib.rs
//
// Emergency-aware adaptive signal controller. Turns noisy per-frame vehicle
// detections into verified emergency signals and schedules per-lane signal
// phases with emergency preemption.

pub mod aggregator;
pub mod config;
pub mod controller;
pub mod events;
pub mod interface;
pub mod metrics;
pub mod runtime;
pub mod scheduler;
pub mod sim;
pub mod types;
pub mod verifier;

pub use aggregator::LaneAggregator;
pub use controller::{Controller, TickReport};
pub use events::SignalEvent;
pub use interface::{Detector, EmergencySignalEmitter, FrameSource};
pub use metrics::ControllerMetrics;
pub use runtime::SignalRuntime;
pub use scheduler::PhaseScheduler;
pub use types::{Config, ControllerState, Detection, Frame, LaneSnapshot, SignalPhase};
pub use verifier::EmergencyVerifier;
