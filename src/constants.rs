// Command constants
pub const CMD_SET_TARGET: u8 = 0x84;
pub const CMD_SET_SPEED: u8 = 0x87;
pub const CMD_SET_ACCELERATION: u8 = 0x89;
pub const CMD_GET_POSITION: u8 = 0x90;

// Payloads are split into two 7-bit bytes
pub const PAYLOAD_MASK: u16 = 0x7F;
pub const MAX_PAYLOAD: u16 = 0x3FFF;

// Servo defaults (microseconds)
pub const DEFAULT_MIN: i32 = 992;
pub const DEFAULT_MAX: i32 = 2000;
pub const DEFAULT_HOME: i32 = 1500;
pub const DEFAULT_SPEED: u8 = 200;
pub const DEFAULT_ACCELERATION: u8 = 0;
pub const DEFAULT_RANGE_DEGREES: i32 = 120;

/// Position value that tells the controller to stop driving the output.
pub const DISABLED_POSITION: i32 = 0;

/// Channel number used before a servo state is bound to a channel.
pub const UNSET_CHANNEL: u8 = 99;

pub const DEFAULT_MAX_SERVOS: usize = 6;
pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5;
pub const DEFAULT_SYNC_TIMEOUT_SECS: f32 = 3.0;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

// Calibration sweep covers offsets 0..=45 degrees
pub const CALIBRATION_MAX_DEGREES: usize = 45;
pub const CALIBRATION_STEPS: usize = CALIBRATION_MAX_DEGREES + 1;
