use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;

use crate::frame_source::{Frame, FrameReceiver, FrameSource};

const REFRESH_INTERVAL: Duration = Duration::from_millis(10);
const CONTROLS_HEIGHT: f32 = 40.0;

/// Live view window. Must run on the thread that owns the event loop.
pub struct LiveView {
    frames: FrameReceiver,
    source: Arc<FrameSource>,
    texture: Option<egui::TextureHandle>,
    image_size: [usize; 2],
    exposure_us: u32,
}

impl LiveView {
    pub fn new(frames: FrameReceiver, source: Arc<FrameSource>) -> Self {
        let exposure_us = source.exposure_us();
        LiveView {
            frames,
            source,
            texture: None,
            image_size: [0, 0],
            exposure_us,
        }
    }

    /// Sends the slider value once the user lets go of it, or on every
    /// step when it is driven from the keyboard.
    fn exposure_slider(&mut self, ui: &mut egui::Ui) {
        let response = ui.add(
            egui::Slider::new(&mut self.exposure_us, self.source.exposure_range_us())
                .logarithmic(true)
                .text("Exposure Time (us)"),
        );
        if response.drag_stopped() || (response.changed() && !response.dragged()) {
            log::info!("Requesting exposure time of {} us", self.exposure_us);
            self.source.set_exposure_us(self.exposure_us);
        }
    }

    /// Takes at most one frame off the queue. Returns whether one was shown.
    fn poll(&mut self, ctx: &egui::Context) -> bool {
        match self.frames.try_recv() {
            Ok(frame) => {
                self.show(ctx, &frame);
                true
            }
            Err(_) => false,
        }
    }

    fn show(&mut self, ctx: &egui::Context, frame: &Frame) {
        let size = [frame.width() as usize, frame.height() as usize];
        let image = egui::ColorImage::from_gray(size, frame.as_raw());
        match &mut self.texture {
            Some(texture) => texture.set(image, egui::TextureOptions::LINEAR),
            None => {
                self.texture =
                    Some(ctx.load_texture("live_view", image, egui::TextureOptions::LINEAR));
            }
        }

        if size != self.image_size {
            self.image_size = size;
            ctx.send_viewport_cmd(egui::ViewportCommand::InnerSize(egui::vec2(
                size[0] as f32,
                size[1] as f32 + CONTROLS_HEIGHT,
            )));
        }
    }
}

pub fn snapshot_path() -> PathBuf {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    PathBuf::from(format!("image_{secs}.png"))
}

impl eframe::App for LiveView {
    /// Called each time the UI needs repainting, which may be many times per second.
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll(ctx);

        egui::TopBottomPanel::bottom("controls").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if ui.button("Take Picture").clicked() {
                    let path = snapshot_path();
                    log::info!("Taking picture to {}", path.display());
                    self.source.save_next_frame(&path);
                }
                ui.separator();
                self.exposure_slider(ui);
                ui.separator();
                let stats = self.source.stats();
                ui.label(format!(
                    "{:?} | {} frames, {} dropped",
                    self.source.state(),
                    stats.produced,
                    stats.dropped
                ));
            });
        });

        egui::CentralPanel::default()
            .frame(egui::Frame::none())
            .show(ctx, |ui| match &self.texture {
                Some(texture) => {
                    ui.image((texture.id(), texture.size_vec2()));
                }
                None => {
                    ui.centered_and_justified(|ui| ui.label("Waiting for frames..."));
                }
            });

        ctx.request_repaint_after(REFRESH_INTERVAL);
    }
}

pub fn run_live_view(frames: FrameReceiver, source: Arc<FrameSource>) -> Result<()> {
    let title = source.camera_name().to_string();
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(title.clone())
            .with_inner_size([800.0, 600.0]),
        ..Default::default()
    };
    log::info!("Starting live view...");
    eframe::run_native(
        &title,
        options,
        Box::new(move |_cc| Ok(Box::new(LiveView::new(frames, source)))),
    )
    .map_err(|e| anyhow::anyhow!("live view failed: {e}"))?;
    log::info!("Live view closed");
    Ok(())
}
