use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use crate::link::SerialLink;
use crate::protocol::MotorCommand;
use crate::settings::Settings;

const CONFIGURE_COMMAND_SPACING: Duration = Duration::from_millis(500);

/// Relative moves only. The firmware is the sole owner of the stage's
/// absolute position; commands return as soon as they are sent.
pub trait StepperMotor: Send {
    fn rotate_forward(&mut self, steps: u32) -> Result<()>;
    fn rotate_backward(&mut self, steps: u32) -> Result<()>;
    fn close(&mut self);
    fn name(&self) -> String;
}

pub struct SerialStepper {
    link: SerialLink,
}

impl SerialStepper {
    pub fn new(link: SerialLink) -> SerialStepper {
        SerialStepper { link }
    }

    fn send(&self, command: MotorCommand) -> Result<()> {
        self.link.send(&command.encode())
    }

    /// Pushes the motion parameters at runtime, for firmware that was not
    /// built with them. Speeds and acceleration are given in full steps and
    /// scaled to microsteps here.
    pub fn configure(&self, settings: &Settings) -> Result<()> {
        log::info!("Loading configuration setup");
        let motion = settings.micro_step_motion()?;
        let commands = [
            MotorCommand::StepsPerRevolution(settings.steps_per_revolution_base),
            MotorCommand::MicroStepping(settings.micro_stepping),
            MotorCommand::MaxSpeed(motion.max_speed),
            MotorCommand::Speed(motion.speed),
            MotorCommand::Acceleration(motion.acceleration),
        ];
        for command in commands {
            self.send(command)?;
            std::thread::sleep(CONFIGURE_COMMAND_SPACING);
        }
        Ok(())
    }
}

impl Drop for SerialStepper {
    fn drop(&mut self) {
        self.link.close();
    }
}

impl StepperMotor for SerialStepper {
    fn rotate_forward(&mut self, steps: u32) -> Result<()> {
        self.send(MotorCommand::Forward(steps))?;
        log::info!("Motor rotating forwards by {steps} steps");
        Ok(())
    }

    fn rotate_backward(&mut self, steps: u32) -> Result<()> {
        self.send(MotorCommand::Backward(steps))?;
        log::info!("Motor rotating backwards by {steps} steps");
        Ok(())
    }

    fn close(&mut self) {
        self.link.close();
    }

    fn name(&self) -> String {
        format!("stepper on {}", self.link.port_name())
    }
}

/// Keeps every issued command instead of moving anything.
#[derive(Clone, Default)]
pub struct MockStepperMotor {
    commands: Arc<Mutex<Vec<MotorCommand>>>,
    closed: Arc<Mutex<bool>>,
}

impl MockStepperMotor {
    pub fn commands(&self) -> Vec<MotorCommand> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().map(|c| *c).unwrap_or(false)
    }

    fn record(&self, command: MotorCommand) {
        log::info!("Mock motor: {}", command.encode().trim_end());
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command);
        }
    }
}

impl StepperMotor for MockStepperMotor {
    fn rotate_forward(&mut self, steps: u32) -> Result<()> {
        self.record(MotorCommand::Forward(steps));
        Ok(())
    }

    fn rotate_backward(&mut self, steps: u32) -> Result<()> {
        self.record(MotorCommand::Backward(steps));
        Ok(())
    }

    fn close(&mut self) {
        if let Ok(mut closed) = self.closed.lock() {
            *closed = true;
        }
    }

    fn name(&self) -> String {
        "Mock Motor".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testing::buffered_link;

    #[test]
    fn serial_stepper_frames_moves() {
        let (link, buffer) = buffered_link();
        let mut motor = SerialStepper::new(link);
        motor.rotate_forward(80).unwrap();
        motor.rotate_backward(3200).unwrap();
        assert_eq!(buffer.lines(), vec!["F80", "B3200"]);
    }

    #[test]
    fn configure_scales_by_micro_stepping() {
        let (link, buffer) = buffered_link();
        let motor = SerialStepper::new(link);
        let settings = Settings {
            micro_stepping: 4,
            motor_max_speed: 100,
            set_motor_speed: 20,
            motor_acceleration: 50,
            ..Settings::default()
        };
        motor.configure(&settings).unwrap();
        assert_eq!(buffer.lines(), vec!["r200", "m4", "M400", "S80", "A200"]);
    }

    #[test]
    fn configure_sends_nothing_when_scaling_overflows() {
        let (link, buffer) = buffered_link();
        let motor = SerialStepper::new(link);
        let settings = Settings {
            motor_acceleration: u32::MAX,
            ..Settings::default()
        };
        assert!(motor.configure(&settings).is_err());
        assert!(buffer.lines().is_empty());
    }

    #[test]
    fn closed_stepper_refuses_commands() {
        let (link, _buffer) = buffered_link();
        let mut motor = SerialStepper::new(link);
        motor.close();
        motor.close();
        assert!(motor.rotate_forward(1).is_err());
    }

    #[test]
    fn dropping_the_stepper_releases_the_port() {
        let (link, _buffer) = buffered_link();
        let other = link.clone();
        let motor = SerialStepper::new(link);
        std::thread::spawn(move || {
            let _motor = motor;
            panic!("sequence failed");
        })
        .join()
        .unwrap_err();
        assert!(other.send("F1\n").is_err());
    }

    #[test]
    fn mock_records_in_order() {
        let mock = MockStepperMotor::default();
        let mut motor = mock.clone();
        motor.rotate_forward(10).unwrap();
        motor.rotate_backward(10).unwrap();
        motor.close();
        assert_eq!(
            mock.commands(),
            vec![MotorCommand::Forward(10), MotorCommand::Backward(10)]
        );
        assert!(mock.is_closed());
    }
}
