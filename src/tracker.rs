use crate::{
    error::Result,
    pantilt::{PanTilt, Settle},
    types::{Point, PositionUnits, WhichServo},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Frame geometry and dead zone of a tracker.
///
/// Slack is the half-width of the dead zone as a fraction of the distance
/// from the frame edge to the centre. `center_offset` shifts the reference
/// centre by a fraction of the half frame on each axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerProperties {
    pub horizontal_slack: f64,
    pub vertical_slack: f64,
    pub center_offset: (f64, f64),
    pub frame_width: i32,
    pub frame_height: i32,
}

impl Default for TrackerProperties {
    fn default() -> Self {
        TrackerProperties {
            horizontal_slack: 0.02,
            vertical_slack: 0.02,
            center_offset: (0.0, 0.0),
            frame_width: 1600,
            frame_height: 896,
        }
    }
}

/// Keeps a tracked point near the frame centre by nudging a pan/tilt head.
pub struct PanTiltTracker<'a> {
    pan_tilt: PanTilt<'a>,
    props: TrackerProperties,
    frame_center: Point,
    horizontal_window: (i32, i32),
    vertical_window: (i32, i32),
}

impl<'a> PanTiltTracker<'a> {
    pub fn new(pan_tilt: PanTilt<'a>, props: TrackerProperties) -> Self {
        let (offset_x, offset_y) = props.center_offset;
        let half_w = props.frame_width / 2;
        let half_h = props.frame_height / 2;
        let frame_center = Point::new(
            half_w + (offset_x * f64::from(props.frame_width) / 2.0) as i32,
            half_h + (offset_y * f64::from(props.frame_height) / 2.0) as i32,
        );

        let slack_x = (f64::from(frame_center.x) * props.horizontal_slack).round() as i32;
        let slack_y = (f64::from(frame_center.y) * props.vertical_slack).round() as i32;

        PanTiltTracker {
            pan_tilt,
            props,
            frame_center,
            horizontal_window: (frame_center.x - slack_x, frame_center.x + slack_x),
            vertical_window: (frame_center.y - slack_y, frame_center.y + slack_y),
        }
    }

    pub fn properties(&self) -> &TrackerProperties {
        &self.props
    }

    pub fn frame_center(&self) -> Point {
        self.frame_center
    }

    pub fn horizontal_window(&self) -> (i32, i32) {
        self.horizontal_window
    }

    pub fn vertical_window(&self) -> (i32, i32) {
        self.vertical_window
    }

    pub fn pan_tilt(&self) -> &PanTilt<'a> {
        &self.pan_tilt
    }

    pub fn pan_tilt_mut(&mut self) -> &mut PanTilt<'a> {
        &mut self.pan_tilt
    }

    /// Degrees of pan and tilt that would bring `point` back to the centre,
    /// or `None` when it already sits inside both slack windows. An axis that
    /// is inside its window gets exactly zero.
    pub fn calculate_correction_degrees(&self, point: Point) -> Option<(f64, f64)> {
        let (h_min, h_max) = self.horizontal_window;
        let (v_min, v_max) = self.vertical_window;
        let mut needed = false;
        let mut correction = (0.0, 0.0);

        if point.x < h_min || point.x > h_max {
            let offset = f64::from(point.x - self.frame_center.x);
            correction.0 = (offset / f64::from(self.props.frame_height)).atan().to_degrees();
            needed = true;
        }

        if point.y < v_min || point.y > v_max {
            // image rows grow downwards, tilt grows upwards
            let offset = f64::from(self.frame_center.y - point.y);
            correction.1 = (offset / f64::from(self.props.frame_width)).atan().to_degrees();
            needed = true;
        }

        needed.then_some(correction)
    }

    /// Issues a relative move for whichever axes are off centre and returns
    /// how long the move should take, so the caller can skip that many frames.
    ///
    /// The previous correction is confirmed first, so a head that has arrived
    /// moves on from where it is rather than from where it started.
    pub fn correct(&mut self, point: Point, fps: u32) -> Result<Settle> {
        let Some((x_correct, y_correct)) = self.calculate_correction_degrees(point) else {
            return Ok(Settle::default());
        };

        let settle = self
            .pan_tilt
            .calculate_movement_time(x_correct as i32, y_correct as i32, fps)?;

        let (which, deltas) = if y_correct == 0.0 {
            (WhichServo::Pan, vec![x_correct as f32])
        } else if x_correct == 0.0 {
            (WhichServo::Tilt, vec![y_correct as f32])
        } else {
            (WhichServo::Both, vec![x_correct as f32, y_correct as f32])
        };
        debug!(
            "correcting {} by {:?} degrees, settle {:.3}s ({} frames)",
            which, deltas, settle.seconds, settle.frames_to_skip
        );

        self.pan_tilt.confirm_arrival(WhichServo::Both)?;

        let timeout = self.pan_tilt.controller().default_timeout();
        self.pan_tilt
            .set_relative_pos(which, &deltas, PositionUnits::Degrees, false, timeout)?;
        Ok(settle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationStore;
    use crate::controller::{ControllerSettings, ServoController};
    use crate::error::ControllerError;
    use crate::sim::{SimHandle, SimulatedMaestro};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn example_props() -> TrackerProperties {
        TrackerProperties {
            horizontal_slack: 0.03,
            vertical_slack: 0.04,
            ..Default::default()
        }
    }

    fn controller(calibration_file: Option<&Path>) -> (ServoController, SimHandle) {
        let settings = ControllerSettings {
            poll_interval: Duration::from_millis(1),
            default_timeout: Duration::from_millis(200),
            calibration_file: calibration_file.map(Path::to_path_buf),
            ..Default::default()
        };
        let (sim, handle) = SimulatedMaestro::new(settings.max_servos);
        (ServoController::with_channel(Box::new(sim), settings), handle)
    }

    /// One hundredth of a second per degree for channels 0 and 2.
    fn seeded_store(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("calibration.json");
        let store = CalibrationStore::new(&path);
        let curve: Vec<f64> = (0..46).map(|i| f64::from(i) / 100.0).collect();
        store.set(0, 0, 200, &curve).unwrap();
        store.set(2, 0, 200, &curve).unwrap();
        path
    }

    #[test]
    fn geometry_of_reference_frame() {
        let (mut controller, _handle) = controller(None);
        let pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();
        let tracker = PanTiltTracker::new(pan_tilt, example_props());

        assert_eq!(tracker.frame_center(), Point::new(800, 448));
        assert_eq!(tracker.horizontal_window(), (776, 824));
        assert_eq!(tracker.vertical_window(), (430, 466));
    }

    #[test]
    fn center_offset_moves_reference() {
        let (mut controller, _handle) = controller(None);
        let pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();
        let props = TrackerProperties {
            center_offset: (0.5, -0.5),
            ..example_props()
        };
        let tracker = PanTiltTracker::new(pan_tilt, props);
        assert_eq!(tracker.frame_center(), Point::new(1200, 224));
    }

    #[test]
    fn no_correction_inside_dead_zone() {
        let (mut controller, _handle) = controller(None);
        let pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();
        let tracker = PanTiltTracker::new(pan_tilt, example_props());

        assert_eq!(tracker.calculate_correction_degrees(Point::new(800, 448)), None);
        assert_eq!(tracker.calculate_correction_degrees(Point::new(776, 466)), None);
        assert!(tracker.calculate_correction_degrees(Point::new(775, 448)).is_some());
        assert!(tracker.calculate_correction_degrees(Point::new(800, 467)).is_some());
    }

    #[test]
    fn horizontal_only_correction() {
        let (mut controller, _handle) = controller(None);
        let pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();
        let tracker = PanTiltTracker::new(pan_tilt, example_props());

        let (h, v) = tracker.calculate_correction_degrees(Point::new(900, 448)).unwrap();
        assert!((h - 6.3683).abs() < 1e-3, "{}", h);
        assert_eq!(v, 0.0);
    }

    #[test]
    fn vertical_only_correction_has_zero_pan() {
        let (mut controller, _handle) = controller(None);
        let pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();
        let tracker = PanTiltTracker::new(pan_tilt, example_props());

        let (h, v) = tracker.calculate_correction_degrees(Point::new(800, 300)).unwrap();
        assert_eq!(h, 0.0);
        // above centre means tilt up
        assert!(v > 5.0 && v < 5.5, "{}", v);

        let (_, below) = tracker.calculate_correction_degrees(Point::new(800, 600)).unwrap();
        assert!(below < 0.0);
    }

    #[test]
    fn correct_moves_only_the_pan_axis() {
        let dir = tempdir().unwrap();
        let path = seeded_store(dir.path());
        let (mut controller, handle) = controller(Some(&path));
        let mut pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();
        assert!(pan_tilt.calibrate(WhichServo::Both, false).unwrap());
        let mut tracker = PanTiltTracker::new(pan_tilt, example_props());

        let settle = tracker.correct(Point::new(900, 448), 30).unwrap();
        assert!((settle.seconds - 0.06).abs() < 1e-9);
        assert_eq!(settle.frames_to_skip, 2);

        assert_eq!(handle.targets_for(0), vec![1550]);
        assert!(handle.targets_for(2).is_empty());
    }

    #[test]
    fn correct_moves_both_axes() {
        let dir = tempdir().unwrap();
        let path = seeded_store(dir.path());
        let (mut controller, handle) = controller(Some(&path));
        let mut pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();
        assert!(pan_tilt.calibrate(WhichServo::Both, false).unwrap());
        let mut tracker = PanTiltTracker::new(pan_tilt, example_props());

        let settle = tracker.correct(Point::new(900, 300), 30).unwrap();
        // 6 degrees pan + 5 degrees tilt
        assert!((settle.seconds - 0.11).abs() < 1e-9);
        assert_eq!(handle.targets_for(0), vec![1550]);
        assert_eq!(handle.targets_for(2), vec![1542]);
    }

    #[test]
    fn centred_point_is_left_alone() {
        let (mut controller, handle) = controller(None);
        let pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();
        let mut tracker = PanTiltTracker::new(pan_tilt, example_props());

        assert_eq!(tracker.correct(Point::new(810, 440), 30).unwrap(), Settle::default());
        assert!(handle.commands().is_empty());
    }

    #[test]
    fn uncalibrated_head_does_not_move() {
        let (mut controller, handle) = controller(None);
        let pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();
        let mut tracker = PanTiltTracker::new(pan_tilt, example_props());

        assert!(matches!(
            tracker.correct(Point::new(100, 448), 30),
            Err(ControllerError::NotCalibrated { channel: 0 })
        ));
        assert!(handle.commands().is_empty());
    }
}
