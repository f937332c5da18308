mod cameras;
mod console;
mod display;
mod error;
mod firmware;
mod frame_source;
mod led;
mod link;
mod logging;
mod mask;
mod motor;
mod protocol;
mod sequencer;
mod settings;

use cameras::{make_camera, CameraType};
use firmware::Toolchain;
use frame_source::FrameSource;
use led::LedRing;
use link::SerialLink;
use motor::{MockStepperMotor, SerialStepper, StepperMotor};
use protocol::MotorCommand;
use sequencer::AcquisitionPlan;
use settings::{FirmwareConfig, Settings, SettingsOverrides};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(version, about = "Turntable image acquisition rig")]
struct Cli {
    #[clap(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a full set of views around the object.
    Capture {
        #[clap(flatten)]
        rig: RigArgs,
        #[clap(flatten)]
        camera: CameraArgs,
        /// Run without the live view window.
        #[clap(long)]
        headless: bool,
    },
    /// Rotate the stage through one full travel after Enter is pressed.
    Motor {
        #[clap(flatten)]
        rig: RigArgs,
    },
    /// Drive the motor and the LED ring by hand.
    Console {
        #[clap(flatten)]
        rig: RigArgs,
    },
    /// Show the camera feed with a Take Picture button.
    Live {
        #[clap(flatten)]
        camera: CameraArgs,
    },
    /// Make background pixels transparent in captured views.
    Mask {
        #[clap(default_value = "images")]
        images_dir: PathBuf,
        /// JSON file mapping image names to polygons. Without it the left
        /// half of every image is masked into `masked_<name>.png`.
        #[clap(long)]
        polygons: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RigArgs {
    #[clap(flatten)]
    settings: SettingsOverrides,
    #[clap(long, default_value = "configs/config.json")]
    config_path: PathBuf,
    /// Read settings from `--config-path`. Flags given here still win.
    #[clap(long)]
    load_config: bool,
    /// Arduino sketch driving the stepper.
    #[clap(long, default_value = "stepper_motor")]
    sketch_path: PathBuf,
    /// Use an already flashed board on this port instead of discovering,
    /// compiling and uploading.
    #[clap(long)]
    port: Option<String>,
    /// Log motor commands instead of talking to a board.
    #[clap(long)]
    dry_run: bool,
}

impl RigArgs {
    fn settings(&self) -> Result<Settings> {
        settings::resolve(&self.settings, &self.config_path, self.load_config)
    }

    fn open_link(&self, settings: &Settings) -> Result<SerialLink> {
        let port = match &self.port {
            Some(port) => port.clone(),
            None => Toolchain::default().flash(&self.sketch_path, settings)?.port,
        };
        SerialLink::connect(&port, settings.baud_rate)
    }
}

#[derive(Args)]
struct CameraArgs {
    /// Replay images from this directory instead of a live camera.
    #[clap(long)]
    replay_dir: Option<PathBuf>,
    /// Use a generated test pattern.
    #[clap(long, conflicts_with = "replay_dir")]
    synthetic: bool,
}

impl CameraArgs {
    fn camera_type(&self) -> CameraType {
        if let Some(dir) = &self.replay_dir {
            return CameraType::DiskLoader(dir.clone());
        }
        if self.synthetic {
            return CameraType::Synthetic;
        }
        #[cfg(feature = "camera")]
        let camera_type = CameraType::RaspberryPi;
        #[cfg(not(feature = "camera"))]
        let camera_type = CameraType::Synthetic;
        camera_type
    }
}

fn make_stepper(link: SerialLink, settings: &Settings) -> Result<SerialStepper> {
    let motor = SerialStepper::new(link);
    if settings.firmware_config == FirmwareConfig::Serial {
        motor.configure(settings)?;
    }
    Ok(motor)
}

/// With `dry_run` set, the returned motor is a handle onto that mock.
fn connect_motor(
    rig: &RigArgs,
    settings: &Settings,
    dry_run: Option<&MockStepperMotor>,
) -> Result<Box<dyn StepperMotor>> {
    if let Some(mock) = dry_run {
        log::info!("Dry run, motor commands will only be logged");
        return Ok(Box::new(mock.clone()));
    }
    let link = rig.open_link(settings)?;
    Ok(Box::new(make_stepper(link, settings)?))
}

/// Net displacement in steps, forward positive.
fn net_steps(commands: &[MotorCommand]) -> i64 {
    commands
        .iter()
        .map(|command| match *command {
            MotorCommand::Forward(n) => n as i64,
            MotorCommand::Backward(n) => -(n as i64),
            _ => 0,
        })
        .sum()
}

fn report_dry_run(mock: &MockStepperMotor) {
    let commands = mock.commands();
    log::info!("Dry run issued {} motor commands", commands.len());
    match net_steps(&commands) {
        0 => log::info!("Dry run ended at the origin"),
        offset => log::warn!("Dry run ended {offset} steps away from the origin"),
    }
    if !mock.is_closed() {
        log::warn!("Dry run motor was never closed");
    }
}

fn start_source(camera: &CameraArgs) -> Result<(Arc<FrameSource>, frame_source::FrameReceiver)> {
    let device = make_camera(camera.camera_type())?;
    let (source, frames) = FrameSource::new(device);
    let source = Arc::new(source);
    source.start()?;
    Ok((source, frames))
}

fn capture(rig: RigArgs, camera: CameraArgs, headless: bool) -> Result<()> {
    let settings = rig.settings()?;
    let plan = AcquisitionPlan::new(&settings)?;

    let dry_run = rig.dry_run.then(MockStepperMotor::default);
    let mut motor = connect_motor(&rig, &settings, dry_run.as_ref())?;
    println!("Initialized {}", motor.name());
    let (source, frames) = match start_source(&camera) {
        Ok(started) => started,
        Err(e) => {
            motor.close();
            return Err(e);
        }
    };

    if headless {
        drop(frames);
        let result = sequencer::run(&plan, source.as_ref(), motor.as_mut());
        if let Some(mock) = &dry_run {
            report_dry_run(mock);
        }
        return result;
    }

    let worker_source = source.clone();
    let sequence = std::thread::Builder::new()
        .name("sequencer".to_string())
        .spawn(move || sequencer::run(&plan, worker_source.as_ref(), motor.as_mut()))?;

    let shown = display::run_live_view(frames, source.clone());
    if !sequence.is_finished() {
        log::info!("Waiting for the acquisition to finish...");
    }
    let result = sequence
        .join()
        .map_err(|_| anyhow!("sequencer thread panicked"))?;
    source.stop()?;
    if let Some(mock) = &dry_run {
        report_dry_run(mock);
    }
    shown?;
    result
}

fn rotate_once(rig: RigArgs) -> Result<()> {
    let settings = rig.settings()?;
    let dry_run = rig.dry_run.then(MockStepperMotor::default);
    let mut motor = connect_motor(&rig, &settings, dry_run.as_ref())?;
    let steps = settings.total_steps();

    println!("Press Enter to rotate {steps} steps...");
    let mut line = String::new();
    let read = std::io::stdin().lock().read_line(&mut line);
    let result = read
        .map_err(anyhow::Error::from)
        .and_then(|_| motor.rotate_forward(steps));
    motor.close();
    if let Some(mock) = &dry_run {
        report_dry_run(mock);
    }
    result
}

fn interactive(rig: RigArgs) -> Result<()> {
    let settings = rig.settings()?;
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut out = std::io::stdout();

    if rig.dry_run {
        let mut motor = MockStepperMotor::default();
        return console::run_console(
            &mut input,
            &mut out,
            &mut motor,
            None,
            console::COMMAND_PACING,
        );
    }

    let link = rig.open_link(&settings)?;
    let led = LedRing::new(link.clone());
    let mut motor = make_stepper(link.clone(), &settings)?;
    println!("Initialized {} on {}", motor.name(), link.port_name());
    let result = console::run_console(
        &mut input,
        &mut out,
        &mut motor,
        Some(&led),
        console::COMMAND_PACING,
    );
    motor.close();
    result
}

fn live(camera: CameraArgs) -> Result<()> {
    let (source, frames) = start_source(&camera)?;
    let shown = display::run_live_view(frames, source.clone());
    source.stop()?;
    shown
}

fn main() -> Result<()> {
    logging::init();
    let args = Cli::parse();

    match args.cmd {
        Commands::Capture {
            rig,
            camera,
            headless,
        } => capture(rig, camera, headless)?,
        Commands::Motor { rig } => rotate_once(rig)?,
        Commands::Console { rig } => interactive(rig)?,
        Commands::Live { camera } => live(camera)?,
        Commands::Mask {
            images_dir,
            polygons,
        } => {
            let written = match polygons {
                Some(polygons) => mask::mask_polygons_dir(&images_dir, &polygons)?,
                None => mask::mask_left_half_dir(&images_dir)?,
            };
            println!("Masked {written} images in {}", images_dir.display());
        }
    }

    Ok(())
}
