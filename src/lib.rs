mod constants;
mod types;
mod error;
mod transport;
mod calibration;
mod controller;
mod pantilt;
mod tracker;
pub mod config;
pub mod sim;
pub mod tracking;

pub use calibration::{calibration_key, CalibrationStore};
pub use controller::{ControllerSettings, MoveOutcome, PendingMove, ServoController};
pub use error::{ControllerError, Result};
pub use pantilt::{PanTilt, Settle};
pub use tracker::{PanTiltTracker, TrackerProperties};
pub use transport::{Command, SerialChannel, SerialPortChannel};
pub use types::{Point, PositionUnits, ServoState, WhichServo};

// Re-export commonly used items
pub use constants::{
    CALIBRATION_MAX_DEGREES, CALIBRATION_STEPS, DISABLED_POSITION, MAX_PAYLOAD, UNSET_CHANNEL,
};
