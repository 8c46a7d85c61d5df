use crate::{
    constants::*,
    controller::ControllerSettings,
    error::{ControllerError, Result},
    tracker::TrackerProperties,
    tracking::TrackingOptions,
    types::ServoState,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Limits and ramp settings for one servo, as written in the rig file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoProfile {
    pub channel: u8,
    pub min: i32,
    pub max: i32,
    pub home: i32,
    pub speed: u8,
    pub acceleration: u8,
    pub range_degrees: i32,
    pub disabled: bool,
}

impl Default for ServoProfile {
    fn default() -> Self {
        ServoProfile {
            channel: 0,
            min: DEFAULT_MIN,
            max: DEFAULT_MAX,
            home: DEFAULT_HOME,
            speed: 15,
            acceleration: 15,
            range_degrees: DEFAULT_RANGE_DEGREES,
            disabled: false,
        }
    }
}

impl ServoProfile {
    pub fn to_state(&self) -> Result<ServoState> {
        let state = ServoState::with_limits(
            self.channel,
            self.min,
            self.home,
            self.max,
            self.range_degrees,
        )?;
        Ok(state
            .with_speed(self.speed)
            .with_acceleration(self.acceleration)
            .with_disabled(self.disabled))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub port: String,
    pub baud_rate: u32,
    pub max_servos: usize,
    pub calibration_file: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub sync_timeout_secs: f32,
    pub read_timeout_ms: u64,
    pub pan: ServoProfile,
    pub tilt: ServoProfile,
    pub tracker: TrackerProperties,
    pub tracking: TrackingOptions,
}

impl Default for RigConfig {
    fn default() -> Self {
        RigConfig {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            max_servos: DEFAULT_MAX_SERVOS,
            calibration_file: Some(PathBuf::from("calibration.json")),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            sync_timeout_secs: DEFAULT_SYNC_TIMEOUT_SECS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            pan: ServoProfile::default(),
            tilt: ServoProfile {
                channel: 2,
                ..ServoProfile::default()
            },
            tracker: TrackerProperties::default(),
            tracking: TrackingOptions::default(),
        }
    }
}

impl RigConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            ControllerError::Config(format!("could not read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RigConfig =
            toml::from_str(text).map_err(|e| ControllerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_servos == 0 || self.max_servos > usize::from(u8::MAX) {
            return Err(ControllerError::Config(format!(
                "max_servos must be between 1 and 255 (got {})",
                self.max_servos
            )));
        }
        for profile in [&self.pan, &self.tilt] {
            if usize::from(profile.channel) >= self.max_servos {
                return Err(ControllerError::ChannelOutOfRange {
                    channel: profile.channel,
                    max_servos: self.max_servos,
                });
            }
            profile.to_state()?;
        }
        if self.pan.channel == self.tilt.channel {
            return Err(ControllerError::Config(format!(
                "pan and tilt both use channel {}",
                self.pan.channel
            )));
        }
        if self.tracker.frame_width <= 0 || self.tracker.frame_height <= 0 {
            return Err(ControllerError::Config("frame dimensions must be positive".to_string()));
        }
        if !(self.sync_timeout_secs.is_finite() && self.sync_timeout_secs >= 0.0) {
            return Err(ControllerError::Config(format!(
                "sync_timeout_secs must be a non-negative number (got {})",
                self.sync_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            max_servos: self.max_servos,
            calibration_file: self.calibration_file.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            default_timeout: Duration::from_secs_f32(self.sync_timeout_secs),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_bring_up_defaults() {
        let config = RigConfig::from_toml_str("").unwrap();
        assert_eq!(config, RigConfig::default());
        assert_eq!(config.tilt.channel, 2);
        assert_eq!(config.tracker.frame_width, 1600);

        let settings = config.controller_settings();
        assert_eq!(settings.max_servos, 6);
        assert_eq!(settings.poll_interval, Duration::from_millis(5));
        assert_eq!(settings.default_timeout, Duration::from_secs(3));
    }

    #[test]
    fn full_rig_file() {
        let text = r#"
            port = "COM4"
            calibration_file = "rig-calibration.json"
            sync_timeout_secs = 1.5

            [pan]
            channel = 1
            min = 1000
            max = 2000
            home = 1400
            speed = 30
            acceleration = 5
            range_degrees = 100

            [tilt]
            channel = 3
            disabled = true

            [tracker]
            horizontal_slack = 0.03
            vertical_slack = 0.04
            center_offset = [0.1, -0.2]

            [tracking]
            target_class = "face"
            min_confidence = 0.7
        "#;
        let config = RigConfig::from_toml_str(text).unwrap();
        assert_eq!(config.port, "COM4");
        assert_eq!(config.tracker.center_offset, (0.1, -0.2));
        assert_eq!(config.tracking.target_class, "face");

        let pan = config.pan.to_state().unwrap();
        assert_eq!(pan.channel(), 1);
        assert_eq!(pan.home(), 1400);
        assert_eq!(pan.microseconds_per_degree(), 10.0);
        assert!(!pan.is_disabled());
        assert!(config.tilt.to_state().unwrap().is_disabled());
        assert_eq!(config.controller_settings().default_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn rejects_inconsistent_rigs() {
        assert!(RigConfig::from_toml_str("[pan]\nhome = 3000").is_err());
        assert!(RigConfig::from_toml_str("[tilt]\nchannel = 0").is_err());
        assert!(RigConfig::from_toml_str("[pan]\nchannel = 7").is_err());
        assert!(RigConfig::from_toml_str("max_servos = 0").is_err());
        assert!(RigConfig::from_toml_str("port = 5").is_err());
    }
}
