// src/verifier.rs
//
// HSV-based emergency vehicle verification.
//
// A detector bbox is only a candidate; this module decides whether the
// cropped region actually looks like an emergency vehicle. Gates, in order:
//   1. Geometry (aspect ratio + minimum area), fails fast
//   2. Alert-color dominance (red band with hue wrap-around)
//   3. White-cross pattern (strict mode only)
//   4. Light-color / confidence fallback (lenient mode only)
//
// HSV-space classification handles variable lighting, wet-pavement
// reflections and camera white-balance shifts far better than RGB ratios.

use crate::types::{Detection, Frame, VerifierConfig, VerifierMode};
use tracing::debug;

/// Minimum run of boundary pixels counted as one line segment in the
/// cross check.
const MIN_SEGMENT_PX: usize = 12;

/// Pixels darker than this are skipped as shadow/underexposure.
const MIN_SAMPLE_VALUE: f32 = 40.0;

// ============================================================================
// HSV CONVERSION
// ============================================================================

/// Convert RGB to HSV.
/// Returns (H: 0-360, S: 0-100, V: 0-255).
#[inline]
pub fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let r_n = r / 255.0;
    let g_n = g / 255.0;
    let b_n = b / 255.0;

    let max = r_n.max(g_n).max(b_n);
    let min = r_n.min(g_n).min(b_n);
    let delta = max - min;

    let h = if delta < 1e-6 {
        0.0
    } else if (max - r_n).abs() < 1e-6 {
        60.0 * (((g_n - b_n) / delta) % 6.0)
    } else if (max - g_n).abs() < 1e-6 {
        60.0 * (((b_n - r_n) / delta) + 2.0)
    } else {
        60.0 * (((r_n - g_n) / delta) + 4.0)
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    let s = if max < 1e-6 { 0.0 } else { (delta / max) * 100.0 };

    let v = max * 255.0;

    (h, s, v)
}

/// Alert band: emergency red, covering the hue wrap-around
/// (OpenCV 0-10 and 160-180 doubled onto the 0-360 scale).
#[inline]
fn is_alert_pixel(h: f32, s: f32, v: f32) -> bool {
    (h <= 20.0 || h >= 320.0) && s >= 58.8 && v >= 100.0
}

/// Light band: white cross paint. Very low saturation, high brightness.
#[inline]
fn is_light_pixel(s: f32, v: f32) -> bool {
    s <= 11.8 && v >= 200.0
}

// ============================================================================
// REGION STATS
// ============================================================================

/// Clamped pixel rectangle of a bbox inside a frame.
#[derive(Debug, Clone, Copy)]
struct Region {
    x1: usize,
    y1: usize,
    x2: usize, // inclusive
    y2: usize, // inclusive
}

impl Region {
    fn from_bbox(bbox: &[f32; 4], width: usize, height: usize) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let x1 = (bbox[0].max(0.0) as usize).min(width - 1);
        let y1 = (bbox[1].max(0.0) as usize).min(height - 1);
        let x2 = (bbox[2].max(0.0) as usize).min(width - 1);
        let y2 = (bbox[3].max(0.0) as usize).min(height - 1);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Self { x1, y1, x2, y2 })
    }

    fn width(&self) -> usize {
        self.x2 - self.x1 + 1
    }

    fn height(&self) -> usize {
        self.y2 - self.y1 + 1
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ColorStats {
    alert_ratio: f32,
    light_ratio: f32,
    samples: u32,
}

/// Sampled HSV statistics over a region. Mirrors the marking classifier's
/// vote counting: every 2nd pixel, every 3rd when the region is large.
fn region_color_stats(frame: &Frame, region: Region) -> ColorStats {
    let mut alert: u32 = 0;
    let mut light: u32 = 0;
    let mut samples: u32 = 0;

    let step = if region.width() * region.height() > 2000 {
        3
    } else {
        2
    };

    for y in (region.y1..=region.y2).step_by(step) {
        for x in (region.x1..=region.x2).step_by(step) {
            let idx = (y * frame.width + x) * 3;
            if idx + 2 >= frame.data.len() {
                continue;
            }

            let r = frame.data[idx] as f32;
            let g = frame.data[idx + 1] as f32;
            let b = frame.data[idx + 2] as f32;
            let (h, s, v) = rgb_to_hsv(r, g, b);

            if v < MIN_SAMPLE_VALUE {
                continue;
            }

            samples += 1;
            if is_alert_pixel(h, s, v) {
                alert += 1;
            } else if is_light_pixel(s, v) {
                light += 1;
            }
        }
    }

    if samples == 0 {
        return ColorStats::default();
    }

    ColorStats {
        alert_ratio: alert as f32 / samples as f32,
        light_ratio: light as f32 / samples as f32,
        samples,
    }
}

// ============================================================================
// CROSS PATTERN
// ============================================================================

/// Count high-contrast line segments formed by the boundary of the light
/// (white) mask inside the region. A painted cross produces long boundary
/// runs along each bar edge, so two segments is already a strong signal.
///
/// This is the Canny + probabilistic-Hough check from the reference
/// detector, re-expressed as deterministic run detection so identical
/// inputs always yield identical counts.
fn count_cross_segments(frame: &Frame, region: Region) -> u32 {
    let rw = region.width();
    let rh = region.height();

    // Dense light mask for the region
    let mut mask = vec![false; rw * rh];
    for y in 0..rh {
        for x in 0..rw {
            let idx = ((region.y1 + y) * frame.width + (region.x1 + x)) * 3;
            if idx + 2 >= frame.data.len() {
                continue;
            }
            let (_, s, v) = rgb_to_hsv(
                frame.data[idx] as f32,
                frame.data[idx + 1] as f32,
                frame.data[idx + 2] as f32,
            );
            mask[y * rw + x] = is_light_pixel(s, v);
        }
    }

    // Boundary pixels: light with at least one non-light 4-neighbor.
    // Out-of-region neighbors count as non-light.
    let is_light = |x: isize, y: isize| -> bool {
        if x < 0 || y < 0 || x >= rw as isize || y >= rh as isize {
            return false;
        }
        mask[y as usize * rw + x as usize]
    };
    let mut edges = vec![false; rw * rh];
    for y in 0..rh as isize {
        for x in 0..rw as isize {
            if !is_light(x, y) {
                continue;
            }
            if !is_light(x - 1, y) || !is_light(x + 1, y) || !is_light(x, y - 1) || !is_light(x, y + 1)
            {
                edges[y as usize * rw + x as usize] = true;
            }
        }
    }

    let mut segments: u32 = 0;

    // Horizontal runs
    for y in 0..rh {
        let mut run = 0usize;
        for x in 0..rw {
            if edges[y * rw + x] {
                run += 1;
            } else {
                if run >= MIN_SEGMENT_PX {
                    segments += 1;
                }
                run = 0;
            }
        }
        if run >= MIN_SEGMENT_PX {
            segments += 1;
        }
    }

    // Vertical runs
    for x in 0..rw {
        let mut run = 0usize;
        for y in 0..rh {
            if edges[y * rw + x] {
                run += 1;
            } else {
                if run >= MIN_SEGMENT_PX {
                    segments += 1;
                }
                run = 0;
            }
        }
        if run >= MIN_SEGMENT_PX {
            segments += 1;
        }
    }

    segments
}

// ============================================================================
// VERIFIER
// ============================================================================

/// Decides whether a candidate detection is an emergency vehicle.
/// Pure function of (frame region, bbox, confidence, mode); no side effects.
#[derive(Debug, Clone)]
pub struct EmergencyVerifier {
    config: VerifierConfig,
}

impl EmergencyVerifier {
    pub fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    pub fn mode(&self) -> VerifierMode {
        self.config.mode
    }

    pub fn verify(&self, frame: &Frame, detection: &Detection) -> bool {
        let w = detection.width();
        let h = detection.height();

        // ── Gate 1: geometry ────────────────────────────────────────────
        if w <= 0.0 || h <= 0.0 {
            return false;
        }
        let aspect = w / h;
        if aspect < self.config.aspect_ratio_min || aspect > self.config.aspect_ratio_max {
            debug!(
                "verifier: aspect {:.2} outside [{:.2}, {:.2}], rejecting",
                aspect, self.config.aspect_ratio_min, self.config.aspect_ratio_max
            );
            return false;
        }
        if w * h < self.config.min_area {
            debug!(
                "verifier: area {:.0} below minimum {:.0}, rejecting",
                w * h,
                self.config.min_area
            );
            return false;
        }

        let region = match Region::from_bbox(&detection.bbox, frame.width, frame.height) {
            Some(r) => r,
            None => return false,
        };

        // ── Gate 2: alert-color dominance ───────────────────────────────
        let stats = region_color_stats(frame, region);
        if stats.samples == 0 {
            return false;
        }
        let dominant = stats.alert_ratio >= self.config.alert_pixel_ratio;

        match self.config.mode {
            VerifierMode::Strict => {
                if !dominant {
                    debug!(
                        "verifier[strict]: alert ratio {:.2} < {:.2}, rejecting",
                        stats.alert_ratio, self.config.alert_pixel_ratio
                    );
                    return false;
                }

                // ── Gate 3: white-cross pattern ─────────────────────────
                let segments = count_cross_segments(frame, region);
                let verified = segments >= self.config.cross_min_segments;
                debug!(
                    "verifier[strict]: alert={:.2} segments={} → {}",
                    stats.alert_ratio, segments, verified
                );
                verified
            }
            VerifierMode::Lenient => {
                if dominant {
                    return true;
                }

                // ── Gate 4: light + weaker alert, then bare confidence ──
                if stats.light_ratio >= self.config.light_pixel_ratio
                    && stats.alert_ratio >= self.config.lenient_alert_ratio
                {
                    debug!(
                        "verifier[lenient]: light={:.2} alert={:.2}, accepting",
                        stats.light_ratio, stats.alert_ratio
                    );
                    return true;
                }

                detection.confidence >= self.config.fallback_confidence
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
