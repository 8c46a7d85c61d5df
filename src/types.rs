use crate::constants::*;
use crate::error::{ControllerError, Result};
use std::fmt::Write as _;
use strum_macros::{Display, EnumIter, EnumString};

#[derive(Debug, EnumIter, EnumString, Display, Clone, Copy, Eq, PartialEq, Hash)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PositionUnits {
    Microseconds,
    Degrees,
}

/// Selects the pan channel, the tilt channel or both (always pan first).
#[derive(Debug, EnumIter, EnumString, Display, Clone, Copy, Eq, PartialEq, Hash)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum WhichServo {
    Pan,
    Tilt,
    Both,
}

/// Pixel coordinate in a video frame.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Point { x, y }
    }
}

/// Local copy of everything the controller knows about one output channel.
///
/// Positions are pulse widths in microseconds. `pos` is the last position the
/// hardware confirmed (or that a blocking move settled on); `target_pos` is
/// the last position written to the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ServoState {
    channel: u8,
    min: i32,
    max: i32,
    home: i32,
    pub(crate) pos: i32,
    pub(crate) target_pos: i32,
    pub(crate) speed: u8,
    pub(crate) acceleration: u8,
    pub(crate) disabled: bool,
    pub(crate) active: bool,
    range_degrees: i32,
    microseconds_per_degree: f32,
    pub(crate) calibration: Vec<f64>,
}

impl Default for ServoState {
    fn default() -> Self {
        ServoState::new(UNSET_CHANNEL)
    }
}

impl ServoState {
    pub fn new(channel: u8) -> Self {
        ServoState::with_range(channel, DEFAULT_RANGE_DEGREES)
    }

    /// Default limits where `DEFAULT_MIN..DEFAULT_MAX` spans `range_degrees`.
    pub fn with_range(channel: u8, range_degrees: i32) -> Self {
        let range_degrees = range_degrees.max(1);
        ServoState {
            channel,
            min: DEFAULT_MIN,
            max: DEFAULT_MAX,
            home: DEFAULT_HOME,
            pos: DEFAULT_HOME,
            target_pos: DEFAULT_HOME,
            speed: DEFAULT_SPEED,
            acceleration: DEFAULT_ACCELERATION,
            disabled: true,
            active: false,
            range_degrees,
            microseconds_per_degree: ((DEFAULT_MAX - DEFAULT_MIN) / range_degrees) as f32,
            calibration: Vec::new(),
        }
    }

    pub fn with_limits(
        channel: u8,
        min: i32,
        home: i32,
        max: i32,
        range_degrees: i32,
    ) -> Result<Self> {
        if !(min <= home && home <= max) {
            return Err(ControllerError::Config(format!(
                "channel {}: limits must satisfy min <= home <= max (got {} / {} / {})",
                channel, min, home, max
            )));
        }
        if min <= DISABLED_POSITION {
            return Err(ControllerError::Config(format!(
                "channel {}: min must be a positive pulse width (got {})",
                channel, min
            )));
        }
        if i64::from(max) * 4 > i64::from(MAX_PAYLOAD) {
            return Err(ControllerError::Config(format!(
                "channel {}: max {} does not fit the 14-bit target payload",
                channel, max
            )));
        }
        if range_degrees <= 0 {
            return Err(ControllerError::Config(format!(
                "channel {}: range_degrees must be positive (got {})",
                channel, range_degrees
            )));
        }

        Ok(ServoState {
            channel,
            min,
            max,
            home,
            pos: home,
            target_pos: home,
            speed: DEFAULT_SPEED,
            acceleration: DEFAULT_ACCELERATION,
            disabled: true,
            active: false,
            range_degrees,
            microseconds_per_degree: ((max - min) / range_degrees) as f32,
            calibration: Vec::new(),
        })
    }

    pub fn with_speed(mut self, speed: u8) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_acceleration(mut self, acceleration: u8) -> Self {
        self.acceleration = acceleration;
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub(crate) fn bound_to(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn min(&self) -> i32 {
        self.min
    }

    pub fn max(&self) -> i32 {
        self.max
    }

    pub fn home(&self) -> i32 {
        self.home
    }

    pub fn pos(&self) -> i32 {
        self.pos
    }

    pub fn target_pos(&self) -> i32 {
        self.target_pos
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    pub fn acceleration(&self) -> u8 {
        self.acceleration
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn range_degrees(&self) -> i32 {
        self.range_degrees
    }

    pub fn microseconds_per_degree(&self) -> f32 {
        self.microseconds_per_degree
    }

    pub fn calibration(&self) -> &[f64] {
        &self.calibration
    }

    /// Keeps a requested position inside `[min, max]`. The stop value passes through.
    pub fn clamp_position(&self, position: i32) -> i32 {
        if position == DISABLED_POSITION {
            return position;
        }
        position.clamp(self.min, self.max)
    }

    pub fn describe(&self) -> String {
        let channel = if self.channel == UNSET_CHANNEL {
            "unset".to_string()
        } else {
            self.channel.to_string()
        };

        let mut s = String::new();
        let _ = writeln!(s, "channel: {}", channel);
        let _ = writeln!(s, "min: {}", self.min);
        let _ = writeln!(s, "max: {}", self.max);
        let _ = writeln!(s, "home: {}", self.home);
        let _ = writeln!(s, "pos: {}", self.pos);
        let _ = writeln!(s, "acceleration: {}", self.acceleration);
        let _ = writeln!(s, "speed: {}", self.speed);
        let _ = writeln!(s, "disabled: {}", self.disabled);
        let _ = writeln!(s, "active: {}", self.active);
        let _ = writeln!(s, "range (degrees): {}", self.range_degrees);
        s
    }
}
