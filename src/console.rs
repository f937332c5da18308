use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Result;

use crate::error::ScanError;
use crate::led::LedRing;
use crate::motor::StepperMotor;
use crate::protocol::LedColor;

pub const COMMAND_PACING: Duration = Duration::from_millis(500);

const PROMPT: &str = "steps (+forward/-backward), on, off, set_color RRGGBB, \
brightness 0-255, fun <secs>, q to quit > ";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Quit,
    Steps(i64),
    LedOn,
    LedOff,
    SetColor(LedColor),
    Brightness(u8),
    Rainbow { secs: u64 },
}

fn invalid(msg: String) -> anyhow::Error {
    ScanError::InvalidInput(msg).into()
}

fn parse_steps(value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .map_err(|_| invalid(format!("'{value}' is not an integer step count")))
}

pub fn parse_command(line: &str) -> Result<ConsoleCommand> {
    let line = line.trim();
    let mut words = line.split_whitespace();
    let keyword = words.next().unwrap_or("").to_ascii_lowercase();
    let argument = words.next();
    if words.next().is_some() {
        return Err(invalid(format!("too many arguments in '{line}'")));
    }

    let command = match (keyword.as_str(), argument) {
        ("q" | "quit" | "exit", None) => ConsoleCommand::Quit,
        ("on", None) => ConsoleCommand::LedOn,
        ("off", None) => ConsoleCommand::LedOff,
        ("steps", Some(value)) => ConsoleCommand::Steps(parse_steps(value)?),
        ("set_color", Some(hex)) => ConsoleCommand::SetColor(LedColor::parse(hex)?),
        ("brightness", Some(value)) => {
            let level = value
                .parse::<u8>()
                .map_err(|_| invalid("brightness must be between 0 and 255".to_string()))?;
            ConsoleCommand::Brightness(level)
        }
        ("fun", Some(value)) => {
            let secs = value
                .parse::<u64>()
                .map_err(|_| invalid(format!("'{value}' is not a number of seconds")))?;
            ConsoleCommand::Rainbow { secs }
        }
        (word, None) if !word.is_empty() => ConsoleCommand::Steps(parse_steps(word)?),
        _ => return Err(invalid(format!("unknown command '{line}'"))),
    };
    Ok(command)
}

fn step_count(steps: i64) -> Result<u32> {
    u32::try_from(steps.unsigned_abs())
        .map_err(|_| invalid(format!("{steps} steps is out of range")))
}

/// Reads commands until `q` or end of input. Bad input is reported and the
/// loop goes on; a failing device ends it.
pub fn run_console(
    input: &mut dyn BufRead,
    out: &mut dyn Write,
    motor: &mut dyn StepperMotor,
    led: Option<&LedRing>,
    pacing: Duration,
) -> Result<()> {
    let mut line = String::new();
    loop {
        write!(out, "{PROMPT}")?;
        out.flush()?;
        line.clear();
        if input.read_line(&mut line)? == 0 {
            break;
        }

        let command = match parse_command(&line).and_then(|c| {
            if let ConsoleCommand::Steps(n) = c {
                step_count(n)?;
            }
            Ok(c)
        }) {
            Ok(command) => command,
            Err(e) => {
                writeln!(out, "{e}")?;
                continue;
            }
        };

        match command {
            ConsoleCommand::Quit => {
                writeln!(out, "Exiting...")?;
                break;
            }
            ConsoleCommand::Steps(0) => {
                writeln!(out, "Zero steps entered, motor will not move.")?;
            }
            ConsoleCommand::Steps(n) if n > 0 => {
                writeln!(out, "Moving forward by {n} steps...")?;
                motor.rotate_forward(step_count(n)?)?;
            }
            ConsoleCommand::Steps(n) => {
                writeln!(out, "Moving backward by {} steps...", n.unsigned_abs())?;
                motor.rotate_backward(step_count(n)?)?;
            }
            led_command => match led {
                Some(led) => run_led(led_command, led, out)?,
                None => writeln!(out, "No LED ring attached.")?,
            },
        }

        std::thread::sleep(pacing);
    }
    Ok(())
}

fn run_led(command: ConsoleCommand, led: &LedRing, out: &mut dyn Write) -> Result<()> {
    match command {
        ConsoleCommand::LedOn => {
            writeln!(out, "Turning on the LED ring with full brightness...")?;
            led.on()?;
        }
        ConsoleCommand::LedOff => {
            writeln!(out, "Turning off the LED ring...")?;
            led.off()?;
        }
        ConsoleCommand::SetColor(color) => {
            writeln!(out, "Setting LED ring color to #{color}...")?;
            led.color(color)?;
        }
        ConsoleCommand::Brightness(level) => {
            writeln!(out, "Setting LED ring brightness to {level}...")?;
            led.brightness(level)?;
        }
        ConsoleCommand::Rainbow { secs } => {
            writeln!(out, "Activating rainbow mode for {secs} seconds...")?;
            led.rainbow()?;
            std::thread::sleep(Duration::from_secs(secs));
            led.off()?;
            writeln!(out, "Rainbow mode ended.")?;
        }
        ConsoleCommand::Quit | ConsoleCommand::Steps(_) => {}
    }
    Ok(())
}
