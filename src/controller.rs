use crate::{
    calibration::CalibrationStore,
    constants::*,
    error::{ControllerError, Result},
    transport::{Command, SerialChannel, SerialPortChannel, Transport},
    types::{PositionUnits, ServoState},
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Controller-wide settings fixed at construction.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub max_servos: usize,
    pub calibration_file: Option<PathBuf>,
    pub poll_interval: Duration,
    pub default_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            max_servos: DEFAULT_MAX_SERVOS,
            calibration_file: None,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            default_timeout: Duration::from_secs_f32(DEFAULT_SYNC_TIMEOUT_SECS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        }
    }
}

/// Driver for a multi-channel USB servo controller.
///
/// All servo state lives in a fixed table indexed by channel. Blocking
/// (`*_sync`) operations poll the hardware on the calling thread until the
/// output reports the commanded position or the timeout runs out; a timeout
/// is logged and the commanded position returned, it is never an error.
pub struct ServoController {
    transport: Transport,
    servos: Vec<ServoState>,
    active_servos: Vec<u8>,
    calibration: Option<CalibrationStore>,
    poll_interval: Duration,
    default_timeout: Duration,
}

impl ServoController {
    /// Opens `port` and builds the channel table. Fails if the port cannot be claimed.
    pub fn open(port: &str, baud_rate: u32, settings: ControllerSettings) -> Result<Self> {
        let channel = SerialPortChannel::open(port, baud_rate, settings.read_timeout)?;
        Ok(Self::with_channel(Box::new(channel), settings))
    }

    pub fn with_channel(channel: Box<dyn SerialChannel>, settings: ControllerSettings) -> Self {
        let max_servos = settings.max_servos.min(usize::from(u8::MAX));
        let servos = (0..max_servos)
            .map(|ch| ServoState::new(ch as u8))
            .collect();

        ServoController {
            transport: Transport::new(channel),
            servos,
            active_servos: Vec::new(),
            calibration: settings
                .calibration_file
                .filter(|p| !p.as_os_str().is_empty())
                .map(CalibrationStore::new),
            poll_interval: settings.poll_interval,
            default_timeout: settings.default_timeout,
        }
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn max_servos(&self) -> usize {
        self.servos.len()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn active_servos(&self) -> &[u8] {
        &self.active_servos
    }

    pub fn calibration_store(&self) -> Option<&CalibrationStore> {
        self.calibration.as_ref()
    }

    fn index(&self, channel: u8) -> Result<usize> {
        let idx = usize::from(channel);
        if idx < self.servos.len() {
            Ok(idx)
        } else {
            Err(ControllerError::ChannelOutOfRange {
                channel,
                max_servos: self.servos.len(),
            })
        }
    }

    fn check_channels(&self, channels: &[u8], values: usize) -> Result<()> {
        if channels.len() != values {
            error!("Mismatched data: {} channels, {} values", channels.len(), values);
            return Err(ControllerError::ChannelArityMismatch {
                channels: channels.len(),
                values,
            });
        }
        for &channel in channels {
            self.index(channel)?;
        }
        Ok(())
    }

    pub fn servo(&self, channel: u8) -> Result<&ServoState> {
        let idx = self.index(channel)?;
        Ok(&self.servos[idx])
    }

    /// Marks `channels` active and pushes their stored state to the controller.
    pub fn sync_channels(&mut self, channels: &[u8]) -> Result<()> {
        for &channel in channels {
            self.index(channel)?;
        }
        self.active_servos = channels.to_vec();

        for &channel in channels {
            self.servos[usize::from(channel)].active = true;
            self.sync_property(channel)?;
        }
        Ok(())
    }

    /// Replaces the stored state of each channel, then syncs them in order.
    pub fn sync_with(&mut self, channels: &[u8], states: Vec<ServoState>) -> Result<()> {
        self.check_channels(channels, states.len())?;
        for (&channel, state) in channels.iter().zip(&states) {
            if state.channel() != UNSET_CHANNEL && state.channel() != channel {
                return Err(ControllerError::Config(format!(
                    "state for channel {} cannot be applied to channel {}",
                    state.channel(),
                    channel
                )));
            }
        }

        self.active_servos = channels.to_vec();
        for (&channel, state) in channels.iter().zip(states) {
            let idx = usize::from(channel);
            self.servos[idx] = state.bound_to(channel);
            self.servos[idx].active = true;
            self.sync_property(channel)?;
        }
        Ok(())
    }

    /// Pushes the local state of one channel to the controller, enabling or
    /// disabling the output to match.
    pub fn sync_property(&mut self, channel: u8) -> Result<()> {
        let idx = self.index(channel)?;
        let state = &self.servos[idx];
        if state.disabled {
            let (acceleration, speed) = (state.acceleration, state.speed);
            self.set_acceleration(channel, acceleration)?;
            self.set_speed(channel, speed)?;
            self.set_disabled(channel)
        } else {
            self.set_enabled(channel)
        }
    }

    pub fn set_acceleration(&mut self, channel: u8, val: u8) -> Result<u8> {
        let idx = self.index(channel)?;
        debug!("Setting acceleration of channel {} to {}", channel, val);

        self.transport.send(&Command::SetAcceleration {
            channel,
            acceleration: u16::from(val),
        })?;
        self.servos[idx].acceleration = val;
        Ok(val)
    }

    pub fn set_speed(&mut self, channel: u8, val: u8) -> Result<u8> {
        let idx = self.index(channel)?;
        debug!("Setting speed of channel {} to {}", channel, val);

        self.transport.send(&Command::SetSpeed {
            channel,
            speed: u16::from(val),
        })?;
        self.servos[idx].speed = val;
        Ok(val)
    }

    /// Current output of `channel` as reported by the controller, in microseconds.
    pub fn get_position_from_controller(&self, channel: u8) -> Result<i32> {
        self.index(channel)?;
        self.transport.query_position(channel)
    }

    /// Writes a new target without waiting. Returns the position actually
    /// commanded: clamped into `[min, max]`, except the stop value `0`.
    pub fn set_position(&mut self, channel: u8, position: i32) -> Result<i32> {
        let idx = self.index(channel)?;
        let new_pos = self.servos[idx].clamp_position(position);
        debug!("Setting position of channel {} to {}", channel, new_pos);

        let target = u16::try_from(new_pos * 4)
            .ok()
            .filter(|t| *t <= MAX_PAYLOAD)
            .ok_or_else(|| {
                ControllerError::Config(format!(
                    "position {} on channel {} does not fit the target payload",
                    new_pos, channel
                ))
            })?;

        self.transport.send(&Command::SetTarget { channel, target })?;
        self.servos[idx].target_pos = new_pos;
        Ok(new_pos)
    }

    pub fn set_position_multi(&mut self, channels: &[u8], positions: &[i32]) -> Result<Vec<i32>> {
        self.check_channels(channels, positions.len())?;
        channels
            .iter()
            .zip(positions)
            .map(|(&channel, &position)| self.set_position(channel, position))
            .collect()
    }

    /// Writes a new target and blocks until the output reaches it or `timeout` elapses.
    pub fn set_position_sync(
        &mut self,
        channel: u8,
        position: i32,
        timeout: Duration,
    ) -> Result<i32> {
        let start = Instant::now();
        let target = self.set_position(channel, position)?;

        loop {
            if self.poll_reached(channel, target)? {
                self.record_position(channel, target);
                break;
            }
            if start.elapsed() >= timeout {
                warn!(
                    "timeout waiting for channel {} to reach {}",
                    channel, target
                );
                break;
            }
            thread::sleep(self.poll_interval);
        }

        Ok(target)
    }

    /// Writes all targets, then polls the channels round-robin until every one
    /// has arrived or the shared `timeout` elapses.
    pub fn set_position_multi_sync(
        &mut self,
        channels: &[u8],
        positions: &[i32],
        timeout: Duration,
    ) -> Result<Vec<i32>> {
        let start = Instant::now();
        let targets = self.set_position_multi(channels, positions)?;
        let mut done = vec![false; channels.len()];

        loop {
            for (i, &channel) in channels.iter().enumerate() {
                if !done[i] && self.poll_reached(channel, targets[i])? {
                    done[i] = true;
                }
            }
            if done.iter().all(|d| *d) {
                break;
            }
            if start.elapsed() >= timeout {
                let pending: Vec<u8> = channels
                    .iter()
                    .zip(&done)
                    .filter(|(_, d)| !**d)
                    .map(|(c, _)| *c)
                    .collect();
                warn!("timeout in multi-channel move, channels {:?} still moving", pending);
                break;
            }
            thread::sleep(self.poll_interval);
        }

        for (i, &channel) in channels.iter().enumerate() {
            if done[i] {
                self.record_position(channel, targets[i]);
            }
        }
        Ok(targets)
    }

    /// A failed query counts as "not there yet"; only setup errors propagate.
    fn poll_reached(&self, channel: u8, target: i32) -> Result<bool> {
        match self.transport.query_position(channel) {
            Ok(position) => Ok(position == target),
            Err(e) if e.is_transient() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Checks whether the output has reached the last commanded target and, if
    /// so, records it as the settled position. Used after a non-blocking move
    /// once the caller expects it to have finished.
    pub fn confirm_arrival(&mut self, channel: u8) -> Result<bool> {
        let target = self.servo(channel)?.target_pos();
        let arrived = self.poll_reached(channel, target)?;
        if arrived {
            self.record_position(channel, target);
        }
        Ok(arrived)
    }

    fn record_position(&mut self, channel: u8, position: i32) {
        if position != DISABLED_POSITION {
            self.servos[usize::from(channel)].pos = position;
        }
    }

    /// Absolute target for a move of `delta` from the last settled position.
    pub fn calculate_relative_position(
        &self,
        channel: u8,
        delta: f32,
        units: PositionUnits,
    ) -> Result<i32> {
        let state = self.servo(channel)?;
        let diff = match units {
            PositionUnits::Microseconds => delta as i32,
            PositionUnits::Degrees => (delta * state.microseconds_per_degree()) as i32,
        };
        Ok(state.pos + diff)
    }

    pub fn set_relative_pos(
        &mut self,
        channel: u8,
        delta: f32,
        units: PositionUnits,
        sync: bool,
    ) -> Result<i32> {
        debug!("relative move of channel {} by {}", channel, delta);

        let new_pos = self.calculate_relative_position(channel, delta, units)?;
        if sync {
            return self.set_position_sync(channel, new_pos, self.default_timeout);
        }
        self.set_position(channel, new_pos)
    }

    pub fn set_relative_pos_multi(
        &mut self,
        channels: &[u8],
        deltas: &[f32],
        units: PositionUnits,
        sync: bool,
        timeout: Duration,
    ) -> Result<Vec<i32>> {
        self.check_channels(channels, deltas.len())?;
        let positions = channels
            .iter()
            .zip(deltas)
            .map(|(&channel, &delta)| self.calculate_relative_position(channel, delta, units))
            .collect::<Result<Vec<_>>>()?;

        if sync {
            return self.set_position_multi_sync(channels, &positions, timeout);
        }
        self.set_position_multi(channels, &positions)
    }

    pub fn return_to_home(&mut self, channel: u8, sync: bool, timeout: Duration) -> Result<i32> {
        let home = self.servo(channel)?.home();
        if sync {
            return self.set_position_sync(channel, home, timeout);
        }
        self.set_position(channel, home)
    }

    pub fn return_to_home_multi(
        &mut self,
        channels: &[u8],
        sync: bool,
        timeout: Duration,
    ) -> Result<Vec<i32>> {
        let homes = channels
            .iter()
            .map(|&channel| self.servo(channel).map(ServoState::home))
            .collect::<Result<Vec<_>>>()?;

        if sync {
            return self.set_position_multi_sync(channels, &homes, timeout);
        }
        self.set_position_multi(channels, &homes)
    }

    /// Stops driving the output. `pos` is left at the last settled position
    /// rather than the stop value, so `set_enabled` drives the servo back there.
    pub fn set_disabled(&mut self, channel: u8) -> Result<()> {
        let idx = self.index(channel)?;
        debug!("disabling channel {}", channel);
        self.set_position(channel, DISABLED_POSITION)?;
        self.servos[idx].disabled = true;
        Ok(())
    }

    /// Re-applies acceleration, speed and position, blocking until the servo
    /// is back in position.
    pub fn set_enabled(&mut self, channel: u8) -> Result<()> {
        let idx = self.index(channel)?;
        info!("enabling channel {}", channel);

        let state = &self.servos[idx];
        let (acceleration, speed, pos) = (state.acceleration, state.speed, state.pos);
        self.set_acceleration(channel, acceleration)?;
        self.set_speed(channel, speed)?;
        self.set_position_sync(channel, pos, self.default_timeout)?;
        self.servos[idx].disabled = false;
        Ok(())
    }

    /// Loads or measures the movement-time curve for the channel's current
    /// acceleration and speed.
    ///
    /// Unless `force` is set, a matching curve in the calibration file is
    /// adopted without moving the servo. Otherwise the servo is homed and
    /// swept through offsets of 0..=45 degrees with alternating sign, timing
    /// each blocking move; the curve is indexed by the magnitude of the offset
    /// and written back to the calibration file.
    pub fn calibrate_servo(&mut self, channel: u8, force: bool) -> Result<Vec<f64>> {
        let idx = self.index(channel)?;
        self.servos[idx].calibration.clear();
        let (acceleration, speed) = (self.servos[idx].acceleration, self.servos[idx].speed);

        if let (Some(store), false) = (&self.calibration, force) {
            info!("Attempt to get calibration from file");
            let curve = store.get(channel, acceleration, speed)?;
            if !curve.is_empty() {
                self.servos[idx].calibration = curve.clone();
                return Ok(curve);
            }
        }

        info!("Building calibration for channel: {}", channel);
        self.return_to_home(channel, true, self.default_timeout)?;

        let mut curve = Vec::with_capacity(CALIBRATION_STEPS);
        for step in 0..CALIBRATION_STEPS {
            let start = Instant::now();
            let degrees = if step % 2 == 1 { -(step as f32) } else { step as f32 };

            self.set_relative_pos(channel, degrees, PositionUnits::Degrees, true)?;
            let seconds = start.elapsed().as_secs_f64();
            debug!("channel {} moved {} degrees in {:.4}s", channel, degrees, seconds);
            curve.push(seconds);
        }

        self.return_to_home(channel, true, self.default_timeout)?;
        self.servos[idx].calibration = curve.clone();

        if let Some(store) = &self.calibration {
            store.set(channel, acceleration, speed, &curve)?;
        }
        Ok(curve)
    }

    /// Seconds the channel needs to move `degrees`, capped at the largest calibrated offset.
    pub fn calculate_movement_time(&self, channel: u8, degrees: i32) -> Result<f64> {
        let curve = self.servo(channel)?.calibration();
        let idx = (degrees.unsigned_abs() as usize).min(CALIBRATION_MAX_DEGREES);
        curve
            .get(idx)
            .copied()
            .ok_or(ControllerError::NotCalibrated { channel })
    }

    /// Writes the targets now and watches for arrival on a blocking worker.
    ///
    /// Fails with `Config` before writing anything when called outside a Tokio
    /// runtime. No other caller may command these channels until the returned
    /// move has completed.
    pub fn set_position_background(
        &mut self,
        moves: &[(u8, i32)],
        timeout: Duration,
    ) -> Result<PendingMove> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            ControllerError::Config(format!("background move needs a Tokio runtime: {}", e))
        })?;
        for &(channel, _) in moves {
            self.index(channel)?;
        }

        let channels: Vec<u8> = moves.iter().map(|(c, _)| *c).collect();
        let mut targets = Vec::with_capacity(moves.len());
        for &(channel, position) in moves {
            targets.push(self.set_position(channel, position)?);
        }

        let done = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));
        let status = Arc::new(Mutex::new(vec![false; moves.len()]));
        let (tx, rx) = oneshot::channel();

        let poller = MovePoller {
            transport: self.transport.clone(),
            channels: channels.clone(),
            targets: targets.clone(),
            status: Arc::clone(&status),
            done: Arc::clone(&done),
            cancel: Arc::clone(&cancel),
            poll_interval: self.poll_interval,
            deadline: timeout,
        };
        runtime.spawn_blocking(move || {
            poller.run();
            let _ = tx.send(());
        });

        Ok(PendingMove {
            channels,
            targets,
            status,
            done,
            cancel,
            finished: rx,
            timeout,
        })
    }

    /// Records the settled position of every channel that arrived.
    pub fn commit_move(&mut self, outcome: &MoveOutcome) {
        for ((&channel, &position), &converged) in outcome
            .channels
            .iter()
            .zip(&outcome.positions)
            .zip(&outcome.converged)
        {
            if converged && usize::from(channel) < self.servos.len() {
                self.record_position(channel, position);
            }
        }
    }
}

impl Drop for ServoController {
    fn drop(&mut self) {
        if self.transport.is_open() {
            for channel in std::mem::take(&mut self.active_servos) {
                if let Err(e) = self.set_disabled(channel) {
                    error!("could not disable channel {} on shutdown: {}", channel, e);
                }
            }
        }
        self.close();
    }
}

struct MovePoller {
    transport: Transport,
    channels: Vec<u8>,
    targets: Vec<i32>,
    status: Arc<Mutex<Vec<bool>>>,
    done: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    poll_interval: Duration,
    deadline: Duration,
}

impl MovePoller {
    fn run(self) {
        let start = Instant::now();
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }

            let mut all_done = true;
            for (i, &channel) in self.channels.iter().enumerate() {
                if self.status.lock()[i] {
                    continue;
                }
                match self.transport.query_position(channel) {
                    Ok(position) if position == self.targets[i] => self.status.lock()[i] = true,
                    _ => all_done = false,
                }
            }

            // stops on its own if nobody waits on the move
            if all_done || start.elapsed() >= self.deadline {
                break;
            }
            thread::sleep(self.poll_interval);
        }
        self.done.store(true, Ordering::SeqCst);
    }
}

/// A move issued by [`ServoController::set_position_background`].
pub struct PendingMove {
    channels: Vec<u8>,
    targets: Vec<i32>,
    status: Arc<Mutex<Vec<bool>>>,
    done: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    finished: oneshot::Receiver<()>,
    timeout: Duration,
}

/// Final state of a background move.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveOutcome {
    pub channels: Vec<u8>,
    pub positions: Vec<i32>,
    pub converged: Vec<bool>,
}

impl MoveOutcome {
    pub fn all_converged(&self) -> bool {
        self.converged.iter().all(|c| *c)
    }
}

impl PendingMove {
    /// Non-blocking check of the completion flag.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Waits for every channel to arrive or for the timeout, whichever comes first.
    pub async fn wait(self) -> MoveOutcome {
        let PendingMove {
            channels,
            targets,
            status,
            done,
            cancel,
            finished,
            timeout,
        } = self;

        tokio::select! {
            _ = finished => {}
            _ = tokio::time::sleep(timeout) => {
                cancel.store(true, Ordering::SeqCst);
            }
        }
        done.store(true, Ordering::SeqCst);

        let converged = status.lock().clone();
        if !converged.iter().all(|c| *c) {
            warn!("timeout occurred before background move completion on channels {:?}", channels);
        }

        MoveOutcome {
            channels,
            positions: targets,
            converged,
        }
    }
}
