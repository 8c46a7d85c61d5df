use anyhow::{Context, Result};
use clap::Parser;
use servo_controller::config::RigConfig;
use servo_controller::sim::SimulatedMaestro;
use servo_controller::{
    ControllerError, PanTilt, PanTiltTracker, Point, PositionUnits, ServoController, WhichServo,
};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pantilt_tracker", about = "Drive a pan/tilt head on a USB servo controller")]
struct Args {
    /// Rig description (TOML). Defaults are used if the file does not exist.
    #[arg(short, long, default_value = "rig.toml")]
    config: PathBuf,

    /// Serial port, overriding the rig file
    #[arg(long)]
    port: Option<String>,

    /// Talk to an in-process simulated controller instead of a serial port
    #[arg(long)]
    simulate: bool,

    #[arg(long)]
    calibrate: bool,

    /// Recalibrate even if the calibration file has a matching curve
    #[arg(long)]
    force: bool,

    #[arg(long, default_value = "both")]
    which: WhichServo,

    /// Sweep each axis through +/-30 degrees
    #[arg(long)]
    scan: bool,

    /// Re-aim once towards a point, given as X,Y in frame pixels
    #[arg(long, value_parser = parse_point)]
    point: Option<Point>,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_point(s: &str) -> std::result::Result<Point, String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y but got '{}'", s))?;
    let x = x.trim().parse().map_err(|e| format!("bad x '{}': {}", x, e))?;
    let y = y.trim().parse().map_err(|e| format!("bad y '{}': {}", y, e))?;
    Ok(Point::new(x, y))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(args: &Args) -> Result<RigConfig> {
    let mut config = if args.config.exists() {
        let config = RigConfig::load(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?;
        info!("Loaded configuration from {}", args.config.display());
        config
    } else {
        warn!("Configuration file {} not found, using defaults", args.config.display());
        RigConfig::default()
    };

    if let Some(port) = &args.port {
        config.port = port.clone();
    }
    Ok(config)
}

fn scan(pan_tilt: &mut PanTilt<'_>) -> servo_controller::Result<()> {
    let timeout = pan_tilt.controller().default_timeout();
    for which in [WhichServo::Pan, WhichServo::Tilt] {
        pan_tilt.set_relative_pos(which, &[-30.0], PositionUnits::Degrees, true, timeout)?;
        for _ in 0..6 {
            pan_tilt.set_relative_pos(which, &[10.0], PositionUnits::Degrees, true, timeout)?;
        }
        pan_tilt.return_to_home(which, true, timeout)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    let config = load_config(&args)?;
    let settings = config.controller_settings();

    let mut controller = if args.simulate {
        info!("Using simulated controller");
        let (sim, _handle) = SimulatedMaestro::new(settings.max_servos);
        ServoController::with_channel(Box::new(sim), settings)
    } else {
        ServoController::open(&config.port, config.baud_rate, settings)
            .with_context(|| format!("Could not start controller on {}", config.port))?
    };

    let pan_state = config.pan.to_state()?;
    let tilt_state = config.tilt.to_state()?;

    {
        let mut pan_tilt = PanTilt::new(&mut controller, config.pan.channel, config.tilt.channel)?;
        pan_tilt.sync(pan_state, tilt_state)?;
        for channel in pan_tilt.get_channels(WhichServo::Both) {
            info!("\n{}", pan_tilt.controller().servo(channel)?.describe());
        }

        if args.calibrate && !pan_tilt.calibrate(args.which, args.force)? {
            warn!("Calibration of {} did not complete", args.which);
        }

        if args.scan {
            info!("Running scan movements...");
            scan(&mut pan_tilt)?;
        }

        if let Some(point) = args.point {
            let mut tracker = PanTiltTracker::new(pan_tilt, config.tracker);
            match tracker.correct(point, args.fps) {
                Ok(settle) => info!(
                    "Correction towards ({}, {}) settles in {:.3}s ({} frames)",
                    point.x, point.y, settle.seconds, settle.frames_to_skip
                ),
                Err(ControllerError::NotCalibrated { channel }) => {
                    warn!("Channel {} has no calibration, run with --calibrate first", channel)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let homes = [config.pan.channel, config.tilt.channel]
        .iter()
        .map(|&channel| Ok((channel, controller.servo(channel)?.home())))
        .collect::<servo_controller::Result<Vec<_>>>()?;
    let pending = controller.set_position_background(&homes, controller.default_timeout())?;
    let outcome = pending.wait().await;
    controller.commit_move(&outcome);

    for channel in [config.pan.channel, config.tilt.channel] {
        match controller.get_position_from_controller(channel) {
            Ok(position) => info!("Channel {} position: {}us", channel, position),
            Err(e) => warn!("Failed to get position for channel {}: {}", channel, e),
        }
    }

    Ok(())
}
