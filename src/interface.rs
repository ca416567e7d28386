// src/interface.rs
//
// Capability seams for external collaborators. The controller is
// detector-agnostic: it is constructed with these trait objects and never
// loads a model, opens a camera, or drives hardware itself.

use crate::types::{Detection, Frame};
use anyhow::Result;

/// Object detector. Produces bounding boxes + class + confidence from one
/// frame; implementations typically wrap an ONNX/YOLO session.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>>;
}

/// Per-lane frame provider (camera, video file, synthetic scene).
pub trait FrameSource: Send + Sync {
    fn next_frame(&self, lane_id: usize) -> Result<Frame>;
}

/// External sink told about emergency-mode transitions (hardware relay,
/// siren, UI). Invoked on transitions, never polled.
pub trait EmergencySignalEmitter: Send + Sync {
    fn emit(&self, active: bool);
}
