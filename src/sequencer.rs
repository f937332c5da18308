use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use crate::error::ScanError;
use crate::frame_source::FrameSource;
use crate::motor::StepperMotor;
use crate::settings::Settings;

/// What the sequencer needs from the image side.
pub trait Capture {
    fn save_next_frame(&self, path: &Path);
    fn stop(&self) -> Result<()>;
}

impl Capture for FrameSource {
    fn save_next_frame(&self, path: &Path) {
        FrameSource::save_next_frame(self, path)
    }

    fn stop(&self) -> Result<()> {
        FrameSource::stop(self)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AcquisitionPlan {
    pub n_images: u32,
    pub delta_steps: u32,
    pub settle: Duration,
    pub images_path: PathBuf,
}

impl AcquisitionPlan {
    pub fn new(settings: &Settings) -> Result<AcquisitionPlan> {
        settings.validate()?;
        let total = settings.total_steps();
        let delta_steps = total / settings.n_images;
        if delta_steps == 0 {
            return Err(ScanError::InvalidConfig(format!(
                "a travel of {total} steps cannot be split into {} views",
                settings.n_images
            ))
            .into());
        }
        Ok(AcquisitionPlan {
            n_images: settings.n_images,
            delta_steps,
            settle: Duration::from_secs_f64(settings.settle_secs),
            images_path: settings.images_path.clone(),
        })
    }

    /// Sum of all forward moves, which brings the stage back to where it
    /// started.
    pub fn return_steps(&self) -> u32 {
        self.delta_steps * self.n_images
    }

    pub fn image_path(&self, index: u32) -> PathBuf {
        self.images_path.join(format!("{index}.png"))
    }
}

/// Captures every view, returns the stage to its origin and releases the
/// camera and the motor, in that order, however the sequence ended.
///
/// Nothing is acknowledged: each view relies on the settle delay being long
/// enough for both the save and the move to complete. A failure aborts the
/// remaining views and skips the return move.
pub fn run(plan: &AcquisitionPlan, capture: &dyn Capture, motor: &mut dyn StepperMotor) -> Result<()> {
    let result = capture_views(plan, capture, motor);

    let stopped = capture.stop();
    motor.close();

    result?;
    stopped
}

fn capture_views(
    plan: &AcquisitionPlan,
    capture: &dyn Capture,
    motor: &mut dyn StepperMotor,
) -> Result<()> {
    std::fs::create_dir_all(&plan.images_path)?;
    log::info!(
        "Capturing {} views, {} steps apart, into {}",
        plan.n_images,
        plan.delta_steps,
        plan.images_path.display()
    );

    for index in 0..plan.n_images {
        let path = plan.image_path(index);
        log::info!("View {}/{} -> {}", index + 1, plan.n_images, path.display());
        capture.save_next_frame(&path);
        motor.rotate_forward(plan.delta_steps)?;
        std::thread::sleep(plan.settle);
    }

    log::info!("Returning to origin");
    motor.rotate_backward(plan.return_steps())?;
    Ok(())
}
