//! Compile and flash the rig firmware through `arduino-cli`.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ScanError;
use crate::settings::{FirmwareConfig, Settings};

const INSTALL_HINT: &str = "https://github.com/arduino/arduino-cli#installation";
const POST_UPLOAD_RESET: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Board {
    pub port: String,
    pub fqbn: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoardListOutput {
    Wrapped {
        #[serde(default)]
        detected_ports: Vec<DetectedPort>,
    },
    // arduino-cli before 0.30 printed the bare list
    Bare(Vec<DetectedPort>),
}

#[derive(Deserialize)]
struct DetectedPort {
    #[serde(default)]
    port: Option<PortInfo>,
    #[serde(default)]
    matching_boards: Vec<MatchingBoard>,
}

#[derive(Deserialize)]
struct PortInfo {
    address: Option<String>,
}

#[derive(Deserialize)]
struct MatchingBoard {
    fqbn: Option<String>,
}

/// First detected port that has a recognised board on it.
pub fn parse_board_list(json: &str) -> Result<Board> {
    let output: BoardListOutput =
        serde_json::from_str(json).context("failed to parse `arduino-cli board list` output")?;
    let ports = match output {
        BoardListOutput::Wrapped { detected_ports } => detected_ports,
        BoardListOutput::Bare(ports) => ports,
    };
    if ports.is_empty() {
        return Err(ScanError::DeviceNotFound("no boards detected".to_string()).into());
    }

    for detected in ports {
        let Some(address) = detected.port.and_then(|p| p.address) else {
            continue;
        };
        if let Some(fqbn) = detected.matching_boards.into_iter().find_map(|b| b.fqbn) {
            return Ok(Board {
                port: address,
                fqbn,
            });
        }
    }
    Err(ScanError::DeviceNotFound("no compatible board among detected ports".to_string()).into())
}

/// Motion parameters as preprocessor definitions, scaled to microsteps the
/// same way the runtime `configure` path scales them.
pub fn firmware_defines(settings: &Settings) -> Result<Vec<String>> {
    let motion = settings.micro_step_motion()?;
    Ok(vec![
        format!("STEPS_PER_REVOLUTION_BASE={}", settings.steps_per_revolution_base),
        format!("MICRO_STEPPING={}", settings.micro_stepping),
        format!("MOTOR_MAX_SPEED={}", motion.max_speed),
        format!("SET_MOTOR_SPEED={}", motion.speed),
        format!("MOTOR_ACCELERATION={}", motion.acceleration),
    ])
}

pub struct Toolchain {
    program: PathBuf,
}

impl Default for Toolchain {
    fn default() -> Self {
        Toolchain::new("arduino-cli")
    }
}

impl Toolchain {
    pub fn new(program: impl Into<PathBuf>) -> Toolchain {
        Toolchain {
            program: program.into(),
        }
    }

    fn run(&self, args: &[String]) -> Result<Output> {
        let command = format!("{} {}", self.program.display(), args.join(" "));
        log::debug!("Running {command}");
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => anyhow::Error::from(ScanError::ToolchainMissing(
                    format!(
                        "{} is not installed or not in your PATH, see {INSTALL_HINT}",
                        self.program.display()
                    ),
                )),
                _ => anyhow::Error::from(e).context(format!("failed to run {command}")),
            })?;

        if !output.status.success() {
            return Err(ScanError::Toolchain {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }

    pub fn check(&self) -> Result<()> {
        self.run(&["version".to_string()])?;
        Ok(())
    }

    pub fn find_board(&self) -> Result<Board> {
        let args = ["board", "list", "--format", "json"].map(String::from);
        let output = self.run(&args)?;
        let board = parse_board_list(&String::from_utf8_lossy(&output.stdout))?;
        log::info!("Found board on port {} with FQBN {}", board.port, board.fqbn);
        Ok(board)
    }

    pub fn compile(&self, sketch: &Path, board: &Board, defines: &[String]) -> Result<()> {
        let mut args = vec!["compile".to_string(), "--fqbn".to_string(), board.fqbn.clone()];
        if !defines.is_empty() {
            let flags: Vec<String> = defines.iter().map(|d| format!("-D{d}")).collect();
            args.push("--build-property".to_string());
            args.push(format!("compiler.cpp.extra_flags={}", flags.join(" ")));
        }
        args.push(sketch.display().to_string());

        log::info!("Compiling {}", sketch.display());
        self.run(&args)?;
        log::info!("Compilation succeeded");
        Ok(())
    }

    pub fn upload(&self, sketch: &Path, board: &Board) -> Result<()> {
        let args = vec![
            "upload".to_string(),
            "-p".to_string(),
            board.port.clone(),
            "--fqbn".to_string(),
            board.fqbn.clone(),
            sketch.display().to_string(),
        ];
        log::info!("Uploading {} to {}", sketch.display(), board.port);
        self.run(&args)?;
        log::info!("Upload succeeded");
        Ok(())
    }

    /// Finds the board, builds the sketch and uploads it, then waits for the
    /// board to come back from reset.
    pub fn flash(&self, sketch: &Path, settings: &Settings) -> Result<Board> {
        self.check()?;
        let board = self.find_board()?;
        let defines = match settings.firmware_config {
            FirmwareConfig::Build => firmware_defines(settings)?,
            FirmwareConfig::Serial => Vec::new(),
        };
        self.compile(sketch, &board, &defines)?;
        self.upload(sketch, &board)?;
        std::thread::sleep(POST_UPLOAD_RESET);
        Ok(board)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOARD_LIST: &str = r#"{
      "detected_ports": [
        { "port": { "address": "/dev/ttyS0", "protocol": "serial" } },
        {
          "matching_boards": [ { "name": "Arduino Uno", "fqbn": "arduino:avr:uno" } ],
          "port": { "address": "/dev/ttyACM0", "protocol": "serial" }
        }
      ]
    }"#;

    #[test]
    fn picks_first_port_with_matching_board() {
        let board = parse_board_list(BOARD_LIST).unwrap();
        assert_eq!(
            board,
            Board {
                port: "/dev/ttyACM0".to_string(),
                fqbn: "arduino:avr:uno".to_string()
            }
        );
    }

    #[test]
    fn accepts_legacy_bare_list() {
        let json = r#"[ { "port": { "address": "COM3" },
                          "matching_boards": [ { "fqbn": "arduino:avr:nano" } ] } ]"#;
        assert_eq!(parse_board_list(json).unwrap().port, "COM3");
    }

    #[test]
    fn no_boards_is_device_not_found() {
        for json in [r#"{ "detected_ports": [] }"#, r#"{}"#] {
            let err = parse_board_list(json).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ScanError>(),
                Some(ScanError::DeviceNotFound(_))
            ));
        }
        let unmatched = r#"{ "detected_ports": [ { "port": { "address": "/dev/ttyS0" } } ] }"#;
        assert!(parse_board_list(unmatched).is_err());
    }

    #[test]
    fn garbage_output_is_an_error() {
        assert!(parse_board_list("not json").is_err());
    }

    #[test]
    fn defines_scale_motion_parameters() {
        let settings = Settings {
            micro_stepping: 8,
            ..Settings::default()
        };
        assert_eq!(
            firmware_defines(&settings).unwrap(),
            vec![
                "STEPS_PER_REVOLUTION_BASE=200",
                "MICRO_STEPPING=8",
                "MOTOR_MAX_SPEED=1600",
                "SET_MOTOR_SPEED=400",
                "MOTOR_ACCELERATION=1600",
            ]
        );
    }

    #[test]
    fn overflowing_defines_are_refused() {
        let settings = Settings {
            motor_max_speed: 300_000_000,
            ..Settings::default()
        };
        let err = firmware_defines(&settings).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScanError>(),
            Some(ScanError::InvalidConfig(_))
        ));
    }

    #[test]
    fn missing_toolchain_is_reported() {
        let toolchain = Toolchain::new("definitely-not-arduino-cli");
        let err = toolchain.check().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScanError>(),
            Some(ScanError::ToolchainMissing(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_a_toolchain_error() {
        let toolchain = Toolchain::new("false");
        let board = Board {
            port: "/dev/null".to_string(),
            fqbn: "arduino:avr:uno".to_string(),
        };
        let err = toolchain
            .compile(Path::new("sketch"), &board, &[])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScanError>(),
            Some(ScanError::Toolchain { .. })
        ));
    }
}
