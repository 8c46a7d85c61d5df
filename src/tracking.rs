//! Closing the loop between a video source, an object detector and the tracker.
//!
//! Frame capture and detection live outside this crate; they are reached
//! through [`FrameSource`] and [`Detector`]. Only the centre of the chosen
//! detection is used.

use crate::{error::Result, tracker::PanTiltTracker, types::Point};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        BoundingBox { x, y, width, height }
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2, self.y + self.height / 2)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

pub trait FrameSource {
    type Frame;

    /// Next frame, or `None` once the stream has ended.
    fn read_frame(&mut self) -> Option<Self::Frame>;

    fn fps(&self) -> u32;
}

pub trait Detector<F> {
    fn detect(&mut self, frame: &F) -> Vec<Detection>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingOptions {
    pub target_class: String,
    pub min_confidence: f32,
    pub max_frames: Option<usize>,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        TrackingOptions {
            target_class: "person".to_string(),
            min_confidence: 0.5,
            max_frames: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct TrackingSummary {
    pub frames_read: usize,
    pub frames_skipped: usize,
    pub detections_used: usize,
    pub corrections: usize,
}

/// Most confident detection of the wanted class that clears the confidence floor.
pub fn select_target<'d>(
    detections: &'d [Detection],
    options: &TrackingOptions,
) -> Option<&'d Detection> {
    detections
        .iter()
        .filter(|d| d.class == options.target_class && d.confidence >= options.min_confidence)
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

/// Runs until the source is exhausted or `max_frames` have been read.
///
/// After each correction the frames covering the estimated settle time are
/// read and dropped without detection, so a move in progress does not
/// trigger another one. Transient hardware errors are logged and tracking
/// carries on; anything else stops the loop.
pub fn track<S, D>(
    tracker: &mut PanTiltTracker<'_>,
    source: &mut S,
    detector: &mut D,
    options: &TrackingOptions,
) -> Result<TrackingSummary>
where
    S: FrameSource,
    D: Detector<S::Frame>,
{
    let fps = source.fps();
    let mut summary = TrackingSummary::default();
    let mut skip = 0u32;

    while options.max_frames.map_or(true, |max| summary.frames_read < max) {
        let Some(frame) = source.read_frame() else {
            break;
        };
        summary.frames_read += 1;

        if skip > 0 {
            skip -= 1;
            summary.frames_skipped += 1;
            continue;
        }

        let detections = detector.detect(&frame);
        let Some(target) = select_target(&detections, options) else {
            continue;
        };
        summary.detections_used += 1;

        let center = target.bbox.center();
        if tracker.calculate_correction_degrees(center).is_none() {
            continue;
        }

        match tracker.correct(center, fps) {
            Ok(settle) => {
                debug!("corrected towards {:?}, skipping {} frames", center, settle.frames_to_skip);
                summary.corrections += 1;
                skip = settle.frames_to_skip;
            }
            Err(e) if e.is_transient() => warn!("correction failed: {}", e),
            Err(e) => return Err(e),
        }
    }

    Ok(summary)
}
