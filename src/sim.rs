//! In-process model of the servo controller.
//!
//! Speaks the same frames as the hardware so the driver can be exercised
//! without a board attached: targets are stored per channel, position queries
//! are answered from the simulated output, and every frame written is
//! recorded for inspection through a [`SimHandle`].

use crate::transport::{Command, SerialChannel};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
struct SimServo {
    /// Quarter-microseconds.
    position: u16,
    target: u16,
    speed: u16,
    acceleration: u16,
    /// Position queries left before the output reaches `target`.
    remaining_polls: u32,
}

#[derive(Debug, Default)]
struct SimState {
    servos: Vec<SimServo>,
    commands: Vec<Command>,
    pending: VecDeque<u8>,
    polls_to_settle: u32,
    frozen: bool,
    fail_writes: bool,
    fail_reads: bool,
    open: bool,
}

/// Simulated controller. Cheap to clone handles to the same state.
pub struct SimulatedMaestro {
    state: Arc<Mutex<SimState>>,
}

/// Inspection and fault-injection side of a [`SimulatedMaestro`].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedMaestro {
    pub fn new(channels: usize) -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState {
            servos: vec![SimServo::default(); channels],
            open: true,
            ..Default::default()
        }));
        (
            SimulatedMaestro {
                state: Arc::clone(&state),
            },
            SimHandle { state },
        )
    }

    fn apply(state: &mut SimState, command: Command) {
        let polls_to_settle = state.polls_to_settle;
        let frozen = state.frozen;
        state.commands.push(command);

        let Some(servo) = state.servos.get_mut(command.channel() as usize) else {
            return;
        };

        match command {
            Command::SetTarget { target, .. } => {
                servo.target = target;
                if target == 0 {
                    // output switched off, reported immediately
                    servo.position = 0;
                    servo.remaining_polls = 0;
                } else if !frozen {
                    servo.remaining_polls = polls_to_settle;
                    if polls_to_settle == 0 {
                        servo.position = target;
                    }
                }
            }
            Command::SetSpeed { speed, .. } => servo.speed = speed,
            Command::SetAcceleration { acceleration, .. } => servo.acceleration = acceleration,
            Command::GetPosition { .. } => {
                if !frozen && servo.position != servo.target {
                    if servo.remaining_polls <= 1 {
                        servo.position = servo.target;
                        servo.remaining_polls = 0;
                    } else {
                        servo.remaining_polls -= 1;
                    }
                }
                let reply = servo.position.to_le_bytes();
                state.pending.extend(reply);
            }
        }
    }
}

impl SerialChannel for SimulatedMaestro {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port is closed"));
        }
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated write fault"));
        }

        let mut offset = 0;
        while offset < bytes.len() {
            let (command, used) = Command::decode(&bytes[offset..]).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "malformed command frame")
            })?;
            Self::apply(&mut state, command);
            offset += used;
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port is closed"));
        }
        if state.fail_reads {
            state.pending.clear();
            return Err(io::Error::new(io::ErrorKind::TimedOut, "simulated read fault"));
        }
        if state.pending.len() < buf.len() {
            state.pending.clear();
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply from controller"));
        }
        for byte in buf.iter_mut() {
            *byte = state.pending.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

impl SimHandle {
    /// Number of position queries a servo needs before it reports its target.
    pub fn set_polls_to_settle(&self, polls: u32) {
        self.state.lock().polls_to_settle = polls;
    }

    /// A frozen controller accepts targets but its outputs never move.
    pub fn set_frozen(&self, frozen: bool) {
        self.state.lock().frozen = frozen;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Replies are dropped and every read times out. Writes still land.
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Every frame written so far, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    /// Targets written to `channel`, in microseconds.
    pub fn targets_for(&self, channel: u8) -> Vec<i32> {
        self.state
            .lock()
            .commands
            .iter()
            .filter_map(|c| match *c {
                Command::SetTarget { channel: ch, target } if ch == channel => {
                    Some(i32::from(target) / 4)
                }
                _ => None,
            })
            .collect()
    }

    pub fn target_count(&self) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| matches!(c, Command::SetTarget { .. }))
            .count()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Simulated output of `channel` in microseconds.
    pub fn position(&self, channel: u8) -> Option<i32> {
        self.state
            .lock()
            .servos
            .get(channel as usize)
            .map(|s| i32::from(s.position) / 4)
    }

    pub fn speed(&self, channel: u8) -> Option<u16> {
        self.state.lock().servos.get(channel as usize).map(|s| s.speed)
    }

    pub fn acceleration(&self, channel: u8) -> Option<u16> {
        self.state
            .lock()
            .servos
            .get(channel as usize)
            .map(|s| s.acceleration)
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}
