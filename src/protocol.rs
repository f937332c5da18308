//! Line framing for the motor and LED firmwares: one ASCII letter, an
//! optional decimal or hex argument, a trailing newline.

use std::fmt;

use anyhow::Result;

use crate::error::ScanError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MotorCommand {
    Forward(u32),
    Backward(u32),
    StepsPerRevolution(u32),
    MicroStepping(u32),
    MaxSpeed(u32),
    Speed(u32),
    Acceleration(u32),
}

impl MotorCommand {
    pub fn encode(&self) -> String {
        let (letter, value) = match *self {
            MotorCommand::Forward(n) => ('F', n),
            MotorCommand::Backward(n) => ('B', n),
            MotorCommand::StepsPerRevolution(n) => ('r', n),
            MotorCommand::MicroStepping(n) => ('m', n),
            MotorCommand::MaxSpeed(n) => ('M', n),
            MotorCommand::Speed(n) => ('S', n),
            MotorCommand::Acceleration(n) => ('A', n),
        };
        format!("{letter}{value}\n")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LedColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl LedColor {
    /// Accepts exactly `RRGGBB`, without a leading `#`.
    pub fn parse(hex: &str) -> Result<LedColor> {
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ScanError::InvalidInput(format!(
                "color must be RRGGBB hex, got '{hex}'"
            ))
            .into());
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16);
        Ok(LedColor {
            r: channel(0)?,
            g: channel(2)?,
            b: channel(4)?,
        })
    }
}

impl fmt::Display for LedColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LedCommand {
    Brightness(u8),
    Off,
    Color(LedColor),
    Rainbow,
}

impl LedCommand {
    pub fn encode(&self) -> String {
        match self {
            LedCommand::Brightness(level) => format!("L{level}\n"),
            LedCommand::Off => "O\n".to_string(),
            LedCommand::Color(color) => format!("C{color}\n"),
            LedCommand::Rainbow => "R\n".to_string(),
        }
    }
}
