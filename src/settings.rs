use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Deserialize;

use crate::error::ScanError;

pub const VALID_MICRO_STEPPING: [u32; 5] = [1, 2, 4, 8, 16];

/// How the motor parameters reach the firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareConfig {
    /// Baked into the sketch as preprocessor macros at compile time.
    Build,
    /// Sent as `r`/`m`/`M`/`S`/`A` commands once the link is up.
    Serial,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MicroStepMotion {
    pub max_speed: u32,
    pub speed: u32,
    pub acceleration: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub steps_per_revolution_base: u32,
    pub micro_stepping: u32,
    pub motor_max_speed: u32,
    pub set_motor_speed: u32,
    pub motor_acceleration: u32,
    pub revolutions: f64,
    pub n_images: u32,
    pub images_path: PathBuf,
    pub settle_secs: f64,
    pub baud_rate: u32,
    pub firmware_config: FirmwareConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            steps_per_revolution_base: 200,
            micro_stepping: 16,
            motor_max_speed: 200,
            set_motor_speed: 50,
            motor_acceleration: 200,
            revolutions: 1.0,
            n_images: 40,
            images_path: PathBuf::from("images"),
            settle_secs: 3.0,
            baud_rate: 9600,
            firmware_config: FirmwareConfig::Build,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if !VALID_MICRO_STEPPING.contains(&self.micro_stepping) {
            return Err(ScanError::InvalidConfig(format!(
                "micro_stepping must be one of {:?}, got {}",
                VALID_MICRO_STEPPING, self.micro_stepping
            ))
            .into());
        }
        if self.steps_per_revolution_base == 0 {
            return Err(invalid("steps_per_revolution_base must be positive"));
        }
        if !(self.revolutions.is_finite() && self.revolutions > 0.0) {
            return Err(invalid("revolutions must be positive"));
        }
        if self.exact_total_steps() > u32::MAX as f64 {
            return Err(invalid(&format!(
                "a travel of {} revolutions does not fit in {} microsteps",
                self.revolutions,
                u32::MAX
            )));
        }
        self.micro_step_motion()?;
        if self.n_images == 0 {
            return Err(invalid("n_images must be at least 1"));
        }
        if !(self.settle_secs.is_finite() && self.settle_secs >= 0.0) {
            return Err(invalid("settle_secs must be zero or positive"));
        }
        if self.baud_rate == 0 {
            return Err(invalid("baud_rate must be positive"));
        }
        Ok(())
    }

    fn exact_total_steps(&self) -> f64 {
        let steps = self.micro_stepping as f64
            * self.steps_per_revolution_base as f64
            * self.revolutions;
        steps.round()
    }

    /// Microsteps for the whole requested travel. Only meaningful once
    /// `validate` has passed.
    pub fn total_steps(&self) -> u32 {
        self.exact_total_steps() as u32
    }

    /// Speeds and acceleration scaled to microsteps, as the firmware takes
    /// them.
    pub fn micro_step_motion(&self) -> Result<MicroStepMotion> {
        let micro = self.micro_stepping;
        let scale = |name: &str, value: u32| {
            value.checked_mul(micro).ok_or_else(|| {
                invalid(&format!(
                    "{name} of {value} overflows when scaled by micro_stepping {micro}"
                ))
            })
        };
        Ok(MicroStepMotion {
            max_speed: scale("motor_max_speed", self.motor_max_speed)?,
            speed: scale("set_motor_speed", self.set_motor_speed)?,
            acceleration: scale("motor_acceleration", self.motor_acceleration)?,
        })
    }

    pub fn apply(&mut self, o: &SettingsOverrides) {
        if let Some(v) = o.steps_per_revolution_base {
            self.steps_per_revolution_base = v;
        }
        if let Some(v) = o.micro_stepping {
            self.micro_stepping = v;
        }
        if let Some(v) = o.motor_max_speed {
            self.motor_max_speed = v;
        }
        if let Some(v) = o.set_motor_speed {
            self.set_motor_speed = v;
        }
        if let Some(v) = o.motor_acceleration {
            self.motor_acceleration = v;
        }
        if let Some(v) = o.revolutions {
            self.revolutions = v;
        }
        if let Some(v) = o.n_images {
            self.n_images = v;
        }
        if let Some(v) = &o.images_path {
            self.images_path = v.clone();
        }
        if let Some(v) = o.settle_secs {
            self.settle_secs = v;
        }
        if let Some(v) = o.baud_rate {
            self.baud_rate = v;
        }
        if let Some(v) = o.firmware_config {
            self.firmware_config = v;
        }
    }
}

fn invalid(msg: &str) -> anyhow::Error {
    ScanError::InvalidConfig(msg.to_string()).into()
}

/// Partial settings. Used both for the command line, where `None` means the
/// flag was not typed, and for the JSON config file.
#[derive(Clone, Debug, Default, Deserialize, clap::Args)]
pub struct SettingsOverrides {
    /// Full steps for one motor revolution.
    #[arg(long)]
    pub steps_per_revolution_base: Option<u32>,
    /// Microstepping level (1, 2, 4, 8 or 16).
    #[arg(long)]
    pub micro_stepping: Option<u32>,
    /// Maximum motor speed in steps per second.
    #[arg(long)]
    pub motor_max_speed: Option<u32>,
    /// Desired motor speed in steps per second.
    #[arg(long)]
    pub set_motor_speed: Option<u32>,
    /// Motor acceleration in steps per second squared.
    #[arg(long)]
    pub motor_acceleration: Option<u32>,
    /// Number of revolutions to travel, fractions allowed.
    #[arg(long)]
    pub revolutions: Option<f64>,
    /// Number of views to capture over the travel.
    #[arg(long)]
    pub n_images: Option<u32>,
    /// Output directory for captured views.
    #[arg(long)]
    pub images_path: Option<PathBuf>,
    /// Seconds to wait after each rotation.
    #[arg(long)]
    pub settle_secs: Option<f64>,
    #[arg(long)]
    pub baud_rate: Option<u32>,
    #[arg(long, value_enum)]
    pub firmware_config: Option<FirmwareConfig>,

    #[arg(skip)]
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

fn decorate_with_path(e: std::io::Error, path: &Path) -> std::io::Error {
    let p = path.display();
    std::io::Error::new(e.kind(), format!("{p}: {e}"))
}

pub fn load_overrides(path: &Path) -> Result<SettingsOverrides> {
    let file = std::fs::File::open(path).map_err(|e| decorate_with_path(e, path))?;
    let mut reader = std::io::BufReader::new(file);

    let mut buffer = String::new();
    reader
        .read_to_string(&mut buffer)
        .map_err(|e| decorate_with_path(e, path))?;

    let overrides: SettingsOverrides = serde_json::from_str(&buffer)
        .map_err(|e| ScanError::InvalidConfig(format!("{}: {e}", path.display())))?;
    for key in overrides.unknown.keys() {
        log::warn!("Unknown config parameter '{key}' in {}", path.display());
    }
    Ok(overrides)
}

/// Defaults, then the config file (only with `load_config`), then the flags
/// that were actually given on the command line.
pub fn resolve(cli: &SettingsOverrides, config_path: &Path, load_config: bool) -> Result<Settings> {
    let mut settings = Settings::default();
    if load_config {
        log::info!("Loading configuration from {}", config_path.display());
        let file = load_overrides(config_path)?;
        settings.apply(&file);
    }
    settings.apply(cli);
    settings.validate()?;
    Ok(settings)
}
