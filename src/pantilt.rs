use crate::{
    controller::ServoController,
    error::{ControllerError, Result},
    types::{PositionUnits, ServoState, WhichServo},
};
use std::time::Duration;
use tracing::error;

/// Estimated time for a move to finish, and the same span in video frames.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Settle {
    pub seconds: f64,
    pub frames_to_skip: u32,
}

impl Settle {
    pub fn from_seconds(seconds: f64, fps: u32) -> Self {
        Settle {
            seconds,
            frames_to_skip: (seconds * f64::from(fps)).ceil() as u32,
        }
    }
}

/// Two controller channels driven as a pan/tilt head.
///
/// Holds only the channel numbers; all servo state stays in the controller.
pub struct PanTilt<'a> {
    controller: &'a mut ServoController,
    pan: u8,
    tilt: u8,
}

impl<'a> PanTilt<'a> {
    pub fn new(controller: &'a mut ServoController, pan: u8, tilt: u8) -> Result<Self> {
        controller.servo(pan)?;
        controller.servo(tilt)?;
        if pan == tilt {
            return Err(ControllerError::Config(format!(
                "pan and tilt cannot share channel {}",
                pan
            )));
        }
        Ok(PanTilt { controller, pan, tilt })
    }

    pub fn pan(&self) -> u8 {
        self.pan
    }

    pub fn tilt(&self) -> u8 {
        self.tilt
    }

    pub fn controller(&self) -> &ServoController {
        &*self.controller
    }

    pub fn controller_mut(&mut self) -> &mut ServoController {
        &mut *self.controller
    }

    pub fn get_channels(&self, which: WhichServo) -> Vec<u8> {
        match which {
            WhichServo::Pan => vec![self.pan],
            WhichServo::Tilt => vec![self.tilt],
            WhichServo::Both => vec![self.pan, self.tilt],
        }
    }

    /// Replaces the state of both channels and pushes it to the controller, pan first.
    pub fn sync(&mut self, pan_props: ServoState, tilt_props: ServoState) -> Result<()> {
        self.controller
            .sync_with(&[self.pan, self.tilt], vec![pan_props, tilt_props])
    }

    /// Calibrates each selected channel in turn. `Ok(true)` only if every one
    /// succeeded; a hardware fault on one channel gives `Ok(false)` after the
    /// rest have been tried. Any other error, such as a corrupt calibration
    /// file, is returned at once.
    pub fn calibrate(&mut self, which: WhichServo, force: bool) -> Result<bool> {
        let mut all_ok = true;
        for channel in self.get_channels(which) {
            match self.controller.calibrate_servo(channel, force) {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    error!("calibration of channel {} failed: {}", channel, e);
                    all_ok = false;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(all_ok)
    }

    /// Confirms arrival of the last non-blocking move on the selected channels,
    /// pan first. See [`ServoController::confirm_arrival`].
    pub fn confirm_arrival(&mut self, which: WhichServo) -> Result<Vec<bool>> {
        self.get_channels(which)
            .into_iter()
            .map(|channel| self.controller.confirm_arrival(channel))
            .collect()
    }

    pub fn set_acceleration(&mut self, which: WhichServo, vals: &[u8]) -> Result<Vec<u8>> {
        let channels = self.checked_channels(which, vals.len())?;
        channels
            .iter()
            .zip(vals)
            .map(|(&channel, &val)| self.controller.set_acceleration(channel, val))
            .collect()
    }

    pub fn set_speed(&mut self, which: WhichServo, vals: &[u8]) -> Result<Vec<u8>> {
        let channels = self.checked_channels(which, vals.len())?;
        channels
            .iter()
            .zip(vals)
            .map(|(&channel, &val)| self.controller.set_speed(channel, val))
            .collect()
    }

    pub fn set_relative_pos(
        &mut self,
        which: WhichServo,
        deltas: &[f32],
        units: PositionUnits,
        sync: bool,
        timeout: Duration,
    ) -> Result<Vec<i32>> {
        let channels = self.get_channels(which);
        self.controller
            .set_relative_pos_multi(&channels, deltas, units, sync, timeout)
    }

    pub fn return_to_home(
        &mut self,
        which: WhichServo,
        sync: bool,
        timeout: Duration,
    ) -> Result<Vec<i32>> {
        let channels = self.get_channels(which);
        self.controller.return_to_home_multi(&channels, sync, timeout)
    }

    /// Combined settle time of a pan and a tilt move. Axes with no movement add nothing.
    pub fn calculate_movement_time(
        &self,
        pan_degrees: i32,
        tilt_degrees: i32,
        fps: u32,
    ) -> Result<Settle> {
        let mut seconds = 0.0;
        if pan_degrees != 0 {
            seconds += self.controller.calculate_movement_time(self.pan, pan_degrees)?;
        }
        if tilt_degrees != 0 {
            seconds += self.controller.calculate_movement_time(self.tilt, tilt_degrees)?;
        }
        Ok(Settle::from_seconds(seconds, fps))
    }

    fn checked_channels(&self, which: WhichServo, values: usize) -> Result<Vec<u8>> {
        let channels = self.get_channels(which);
        if channels.len() != values {
            return Err(ControllerError::ChannelArityMismatch {
                channels: channels.len(),
                values,
            });
        }
        Ok(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerSettings;
    use crate::sim::{SimHandle, SimulatedMaestro};
    use crate::transport::Command;
    use std::fs;
    use strum::IntoEnumIterator;
    use tempfile::tempdir;

    fn controller(settings: ControllerSettings) -> (ServoController, SimHandle) {
        let (sim, handle) = SimulatedMaestro::new(settings.max_servos);
        (ServoController::with_channel(Box::new(sim), settings), handle)
    }

    fn fast() -> ControllerSettings {
        ControllerSettings {
            poll_interval: Duration::from_millis(1),
            default_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn both_is_always_pan_then_tilt() {
        let (mut controller, _handle) = controller(fast());
        let pan_tilt = PanTilt::new(&mut controller, 4, 1).unwrap();
        assert_eq!(pan_tilt.get_channels(WhichServo::Pan), vec![4]);
        assert_eq!(pan_tilt.get_channels(WhichServo::Tilt), vec![1]);
        assert_eq!(pan_tilt.get_channels(WhichServo::Both), vec![4, 1]);

        let total: usize = WhichServo::iter().map(|w| pan_tilt.get_channels(w).len()).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn rejects_bad_channels() {
        let (mut controller, _handle) = controller(fast());
        assert!(PanTilt::new(&mut controller, 0, 9).is_err());
        assert!(PanTilt::new(&mut controller, 2, 2).is_err());
    }

    #[test]
    fn sync_applies_pan_before_tilt() {
        let (mut controller, handle) = controller(fast());
        let mut pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();
        pan_tilt
            .sync(
                ServoState::new(0).with_speed(15).with_acceleration(15).with_disabled(false),
                ServoState::new(2).with_speed(20).with_acceleration(10),
            )
            .unwrap();

        let channels: Vec<u8> = handle
            .commands()
            .iter()
            .filter(|c| !matches!(c, Command::GetPosition { .. }))
            .map(Command::channel)
            .collect();
        assert_eq!(channels, vec![0, 0, 0, 2, 2, 2]);

        assert!(!pan_tilt.controller().servo(0).unwrap().is_disabled());
        assert!(pan_tilt.controller().servo(2).unwrap().is_disabled());
        assert_eq!(pan_tilt.controller().active_servos(), &[0, 2]);
    }

    #[test]
    fn vectorised_setters_keep_order() {
        let (mut controller, _handle) = controller(fast());
        let mut pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();

        assert_eq!(pan_tilt.set_speed(WhichServo::Both, &[10, 20]).unwrap(), vec![10, 20]);
        assert_eq!(pan_tilt.set_acceleration(WhichServo::Tilt, &[5]).unwrap(), vec![5]);
        assert_eq!(pan_tilt.controller().servo(0).unwrap().speed(), 10);
        assert_eq!(pan_tilt.controller().servo(2).unwrap().speed(), 20);
        assert_eq!(pan_tilt.controller().servo(2).unwrap().acceleration(), 5);

        assert!(matches!(
            pan_tilt.set_speed(WhichServo::Both, &[10]),
            Err(ControllerError::ChannelArityMismatch { .. })
        ));
    }

    #[test]
    fn relative_and_home_moves_fan_out() {
        let (mut controller, handle) = controller(fast());
        let mut pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();

        let timeout = Duration::from_secs(1);
        let moved = pan_tilt
            .set_relative_pos(WhichServo::Both, &[5.0, -5.0], PositionUnits::Degrees, true, timeout)
            .unwrap();
        assert_eq!(moved, vec![1540, 1460]);

        let homes = pan_tilt.return_to_home(WhichServo::Tilt, true, timeout).unwrap();
        assert_eq!(homes, vec![1500]);
        assert_eq!(handle.position(0), Some(1540));
        assert_eq!(handle.position(2), Some(1500));
    }

    #[test]
    fn calibrate_both_channels() {
        let (mut controller, _handle) = controller(fast());
        let mut pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();
        assert!(pan_tilt.calibrate(WhichServo::Both, false).unwrap());

        let settle = pan_tilt.calculate_movement_time(10, 0, 30).unwrap();
        let pan_only = pan_tilt.controller().calculate_movement_time(0, 10).unwrap();
        assert_eq!(settle.seconds, pan_only);
        assert_eq!(settle.frames_to_skip, (pan_only * 30.0).ceil() as u32);
    }

    #[test]
    fn corrupt_calibration_file_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        fs::write(&path, "{ broken").unwrap();

        let (mut controller, handle) = controller(ControllerSettings {
            calibration_file: Some(path),
            ..fast()
        });
        let mut pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();
        assert!(matches!(
            pan_tilt.calibrate(WhichServo::Both, false),
            Err(ControllerError::CalibrationFileCorrupt { .. })
        ));
        assert_eq!(handle.target_count(), 0);
    }

    #[test]
    fn hardware_fault_fails_calibration_softly() {
        let (mut controller, handle) = controller(fast());
        handle.set_fail_writes(true);
        let mut pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();

        assert!(!pan_tilt.calibrate(WhichServo::Both, false).unwrap());
        assert!(pan_tilt.controller().servo(0).unwrap().calibration().is_empty());
        assert!(pan_tilt.controller().servo(2).unwrap().calibration().is_empty());
    }

    #[test]
    fn confirm_arrival_settles_a_finished_move() {
        let (mut controller, _handle) = controller(fast());
        let mut pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();
        let units = PositionUnits::Degrees;
        pan_tilt
            .set_relative_pos(WhichServo::Pan, &[5.0], units, false, Duration::ZERO)
            .unwrap();
        assert_eq!(pan_tilt.controller().servo(0).unwrap().pos(), 1500);

        // tilt was never commanded, so its output is still off
        assert_eq!(pan_tilt.confirm_arrival(WhichServo::Both).unwrap(), vec![true, false]);
        assert_eq!(pan_tilt.controller().servo(0).unwrap().pos(), 1540);
        assert_eq!(pan_tilt.controller().servo(2).unwrap().pos(), 1500);
    }

    #[test]
    fn settle_time_needs_calibration() {
        let (mut controller, _handle) = controller(fast());
        let pan_tilt = PanTilt::new(&mut controller, 0, 2).unwrap();
        assert_eq!(pan_tilt.calculate_movement_time(0, 0, 30).unwrap(), Settle::default());
        assert!(matches!(
            pan_tilt.calculate_movement_time(0, 4, 30),
            Err(ControllerError::NotCalibrated { channel: 2 })
        ));
    }

    #[test]
    fn frames_round_up() {
        assert_eq!(Settle::from_seconds(0.101, 30).frames_to_skip, 4);
        assert_eq!(Settle::from_seconds(0.0, 30).frames_to_skip, 0);
    }
}
