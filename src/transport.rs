use crate::constants::*;
use crate::error::{ControllerError, Result};
use parking_lot::Mutex;
use serialport::{DataBits, FlowControl, Parity, StopBits};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Raw byte stream to the controller.
///
/// `read` fills the whole buffer or fails; a short read is an error, never a
/// partial result. `close` must be safe to call more than once.
pub trait SerialChannel: Send {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
}

/// A virtual COM port in raw 8N1 mode with no flow control.
pub struct SerialPortChannel {
    name: String,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialPortChannel {
    pub fn open(name: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self> {
        let port = serialport::new(name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(read_timeout)
            .open()
            .map_err(|e| ControllerError::PortUnavailable {
                port: name.to_string(),
                message: e.to_string(),
            })?;

        debug!("Port {} successfully opened", name);
        Ok(SerialPortChannel {
            name: name.to_string(),
            port: Some(port),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn port_mut(&mut self) -> io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port is closed"))
    }
}

impl SerialChannel for SerialPortChannel {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = self.port_mut()?;
        port.write_all(bytes)?;
        port.flush()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.port_mut()?.read_exact(buf)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("closing port {}", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

/// One controller command frame.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Command {
    /// Target in quarter-microseconds.
    SetTarget { channel: u8, target: u16 },
    SetSpeed { channel: u8, speed: u16 },
    SetAcceleration { channel: u8, acceleration: u16 },
    GetPosition { channel: u8 },
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Command::SetTarget { .. } => CMD_SET_TARGET,
            Command::SetSpeed { .. } => CMD_SET_SPEED,
            Command::SetAcceleration { .. } => CMD_SET_ACCELERATION,
            Command::GetPosition { .. } => CMD_GET_POSITION,
        }
    }

    pub fn channel(&self) -> u8 {
        match *self {
            Command::SetTarget { channel, .. }
            | Command::SetSpeed { channel, .. }
            | Command::SetAcceleration { channel, .. }
            | Command::GetPosition { channel } => channel,
        }
    }

    fn payload(&self) -> Option<u16> {
        match *self {
            Command::SetTarget { target, .. } => Some(target),
            Command::SetSpeed { speed, .. } => Some(speed),
            Command::SetAcceleration { acceleration, .. } => Some(acceleration),
            Command::GetPosition { .. } => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Command::SetTarget { .. } => "set target",
            Command::SetSpeed { .. } => "set speed",
            Command::SetAcceleration { .. } => "set acceleration",
            Command::GetPosition { .. } => "get position",
        }
    }

    /// `[opcode, channel]` or `[opcode, channel, low7, high7]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = vec![self.opcode(), self.channel()];
        if let Some(value) = self.payload() {
            frame.push((value & PAYLOAD_MASK) as u8);
            frame.push(((value >> 7) & PAYLOAD_MASK) as u8);
        }
        frame
    }

    /// Parses one frame from the front of `bytes`, returning it with the
    /// number of bytes consumed. `None` for an unknown opcode or a truncated frame.
    pub fn decode(bytes: &[u8]) -> Option<(Command, usize)> {
        let (&opcode, rest) = bytes.split_first()?;
        let &channel = rest.first()?;

        if opcode == CMD_GET_POSITION {
            return Some((Command::GetPosition { channel }, 2));
        }

        if rest.len() < 3 {
            return None;
        }
        let value = u16::from(rest[1] & 0x7F) | (u16::from(rest[2] & 0x7F) << 7);
        let command = match opcode {
            CMD_SET_TARGET => Command::SetTarget { channel, target: value },
            CMD_SET_SPEED => Command::SetSpeed { channel, speed: value },
            CMD_SET_ACCELERATION => Command::SetAcceleration {
                channel,
                acceleration: value,
            },
            _ => return None,
        };
        Some((command, 4))
    }
}

/// Converts a two byte get-position reply into microseconds.
pub fn decode_position(response: [u8; 2]) -> i32 {
    (i32::from(response[0]) + 256 * i32::from(response[1])) / 4
}

/// Shared handle to the controller port. The mutex serialises every frame
/// written and keeps a position query and its reply together.
#[derive(Clone)]
pub struct Transport {
    port: Arc<Mutex<Box<dyn SerialChannel>>>,
}

impl Transport {
    pub fn new(channel: Box<dyn SerialChannel>) -> Self {
        Transport {
            port: Arc::new(Mutex::new(channel)),
        }
    }

    pub fn send(&self, command: &Command) -> Result<()> {
        let mut port = self.port.lock();
        write_frame(port.as_mut(), command)
    }

    pub fn query_position(&self, channel: u8) -> Result<i32> {
        let command = Command::GetPosition { channel };
        let mut port = self.port.lock();
        write_frame(port.as_mut(), &command)?;

        let mut response = [0u8; 2];
        port.read(&mut response).map_err(|e| {
            if e.kind() == io::ErrorKind::NotConnected {
                return ControllerError::NotOpen;
            }
            error!("error reading: {} ({})", command.description(), e);
            ControllerError::ReadFailure {
                command: command.description(),
                expected: response.len(),
                message: e.to_string(),
            }
        })?;

        Ok(decode_position(response))
    }

    pub fn close(&self) {
        self.port.lock().close();
    }

    pub fn is_open(&self) -> bool {
        self.port.lock().is_open()
    }
}

fn write_frame(port: &mut dyn SerialChannel, command: &Command) -> Result<()> {
    port.write(&command.encode()).map_err(|e| {
        if e.kind() == io::ErrorKind::NotConnected {
            return ControllerError::NotOpen;
        }
        error!("error writing: {} ({})", command.description(), e);
        ControllerError::WriteFailure {
            command: command.description(),
            message: e.to_string(),
        }
    })
}
