//! Error types for controller, transport and calibration operations.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ControllerError>;

#[derive(Error, Debug)]
pub enum ControllerError {
    /// The serial device could not be claimed. Fatal at startup.
    #[error("Could not open port '{port}': {message}")]
    PortUnavailable { port: String, message: String },

    /// Attempt to talk to a port that was never opened or has been closed.
    #[error("Serial port is not open")]
    NotOpen,

    #[error("Error writing {command}: {message}")]
    WriteFailure { command: &'static str, message: String },

    #[error("Error reading {command}: expected {expected} bytes, {message}")]
    ReadFailure {
        command: &'static str,
        expected: usize,
        message: String,
    },

    #[error("Channel {channel} out of range: controller has {max_servos} channels")]
    ChannelOutOfRange { channel: u8, max_servos: usize },

    #[error("Mismatched data: {channels} channels but {values} values")]
    ChannelArityMismatch { channels: usize, values: usize },

    #[error("No calibration for channel {channel}")]
    NotCalibrated { channel: u8 },

    /// The calibration document exists but is not valid JSON.
    #[error("Error parsing JSON from file '{}': {source}", path.display())]
    CalibrationFileCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Calibration file '{}': {source}", path.display())]
    CalibrationIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ControllerError {
    /// Hardware faults the caller may retry; everything else is a setup or usage error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControllerError::WriteFailure { .. } | ControllerError::ReadFailure { .. }
        )
    }
}
