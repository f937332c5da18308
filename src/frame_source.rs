//! Background acquisition: polls the camera, feeds the live view queue and
//! services one-shot save requests.

use std::path::{Path, PathBuf};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::cameras::{CameraDevice, RawFrame};

pub type Frame = image::GrayImage;
pub type FrameSender = mpsc::SyncSender<Frame>;
pub type FrameReceiver = mpsc::Receiver<Frame>;

pub const FRAME_QUEUE_CAPACITY: usize = 2;
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Live view prefers recent frames over complete ones: the producer never
/// waits on this queue.
pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    mpsc::sync_channel(FRAME_QUEUE_CAPACITY)
}

/// Scales a raw frame down to 8 bits per pixel.
pub fn to_frame(raw: RawFrame) -> Result<Frame> {
    let shift = raw.bit_depth.saturating_sub(8).min(8);
    let data: Vec<u8> = raw
        .pixels
        .iter()
        .map(|&p| (p >> shift).min(u8::MAX as u16) as u8)
        .collect();
    image::GrayImage::from_raw(raw.width, raw.height, data).ok_or_else(|| {
        anyhow!(
            "frame of {} pixels does not fit {}x{}",
            raw.pixels.len(),
            raw.width,
            raw.height
        )
    })
}

fn save_frame(frame: &Frame, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    frame
        .save(path)
        .map_err(|e| anyhow!("{}: {e}", path.display()))?;
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Running,
    Stopped,
}

/// Single-slot mailbox. A newer request replaces one that has not been
/// serviced yet.
struct Mailbox<T>(Mutex<Option<T>>);

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Mailbox(Mutex::new(None))
    }
}

impl<T> Mailbox<T> {
    fn set(&self, value: T) -> Option<T> {
        match self.0.lock() {
            Ok(mut slot) => slot.replace(value),
            Err(poisoned) => poisoned.into_inner().replace(value),
        }
    }

    fn take(&self) -> Option<T> {
        match self.0.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

struct Shared {
    state: Mutex<SourceState>,
    stop: AtomicBool,
    save: Mailbox<PathBuf>,
    exposure: Mailbox<u32>,
    exposure_us: AtomicU32,
    produced: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: SourceState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub produced: u64,
    pub dropped: u64,
}

pub struct FrameSource {
    name: String,
    exposure_range_us: RangeInclusive<u32>,
    shared: Arc<Shared>,
    idle: Mutex<Option<(Box<dyn CameraDevice>, FrameSender)>>,
    handle: Mutex<Option<JoinHandle<Box<dyn CameraDevice>>>>,
}

impl FrameSource {
    pub fn new(camera: Box<dyn CameraDevice>) -> (FrameSource, FrameReceiver) {
        let (sender, receiver) = frame_channel();
        let source = FrameSource {
            name: camera.name(),
            exposure_range_us: camera.exposure_range_us(),
            shared: Arc::new(Shared {
                state: Mutex::new(SourceState::Idle),
                stop: AtomicBool::new(false),
                save: Mailbox::default(),
                exposure: Mailbox::default(),
                exposure_us: AtomicU32::new(camera.exposure_us()),
                produced: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            idle: Mutex::new(Some((camera, sender))),
            handle: Mutex::new(None),
        };
        (source, receiver)
    }

    pub fn camera_name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SourceState {
        self.shared
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(SourceState::Stopped)
    }

    pub fn stats(&self) -> SourceStats {
        SourceStats {
            produced: self.shared.produced.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn start(&self) -> Result<()> {
        let (camera, sender) = self
            .idle
            .lock()
            .map_err(|_| anyhow!("frame source lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("frame source already started ({:?})", self.state()))?;

        self.shared.set_state(SourceState::Running);
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("frame-source".to_string())
            .spawn(move || acquisition_loop(camera, sender, shared))?;
        if let Ok(mut slot) = self.handle.lock() {
            *slot = Some(handle);
        }
        log::info!("Image acquisition started on {}", self.name);
        Ok(())
    }

    /// Returns at once. The next frame that arrives is written to `path`.
    pub fn save_next_frame(&self, path: &Path) {
        if let Some(previous) = self.shared.save.set(path.to_path_buf()) {
            log::debug!(
                "Save request for {} replaced before it was serviced",
                previous.display()
            );
        }
    }

    pub fn exposure_range_us(&self) -> RangeInclusive<u32> {
        self.exposure_range_us.clone()
    }

    /// Last exposure the camera accepted.
    pub fn exposure_us(&self) -> u32 {
        self.shared.exposure_us.load(Ordering::Relaxed)
    }

    /// Returns at once. The acquisition loop applies the value, clamped to
    /// the camera's range, before its next poll.
    pub fn set_exposure_us(&self, exposure_us: u32) {
        let clamped = exposure_us.clamp(
            *self.exposure_range_us.start(),
            *self.exposure_range_us.end(),
        );
        self.shared.exposure.set(clamped);
    }

    /// Lets the loop finish its iteration, joins it and releases the camera.
    /// Safe before `start` and on repeated calls.
    pub fn stop(&self) -> Result<()> {
        self.shared.stop.store(true, Ordering::Release);

        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        let camera = match handle {
            Some(handle) => Some(
                handle
                    .join()
                    .map_err(|_| anyhow!("frame source thread panicked"))?,
            ),
            None => self
                .idle
                .lock()
                .ok()
                .and_then(|mut idle| idle.take())
                .map(|(camera, _)| camera),
        };
        self.shared.set_state(SourceState::Stopped);

        if let Some(mut camera) = camera {
            camera.shutdown()?;
            log::info!("Camera {} released", self.name);
        }
        Ok(())
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Failed to stop frame source: {e:#}");
        }
    }
}

fn acquisition_loop(
    mut camera: Box<dyn CameraDevice>,
    sender: FrameSender,
    shared: Arc<Shared>,
) -> Box<dyn CameraDevice> {
    while !shared.stop.load(Ordering::Acquire) {
        if let Some(exposure_us) = shared.exposure.take() {
            apply_exposure(camera.as_mut(), exposure_us, &shared);
        }
        match poll_once(camera.as_mut(), &sender, &shared) {
            Ok(true) => {}
            Ok(false) => std::thread::sleep(IDLE_POLL_INTERVAL),
            Err(e) => {
                log::error!("Encountered error: {e:#}, image acquisition will stop.");
                break;
            }
        }
    }
    shared.set_state(SourceState::Stopped);
    log::info!("Image acquisition has stopped");
    camera
}

/// A rejected value is retried once with the camera disarmed. Failure is
/// logged and acquisition goes on with the previous exposure.
fn apply_exposure(camera: &mut dyn CameraDevice, exposure_us: u32, shared: &Shared) {
    let result = camera.set_exposure_us(exposure_us).or_else(|e| {
        log::warn!("Failed to set exposure time: {e:#}, re-arming the camera");
        camera.disarm()?;
        let retried = camera.set_exposure_us(exposure_us);
        camera.arm()?;
        retried
    });
    match result {
        Ok(()) => {
            shared.exposure_us.store(exposure_us, Ordering::Relaxed);
            log::info!("Exposure time set to {exposure_us} us");
        }
        Err(e) => log::error!("Failed to set exposure time after re-arming: {e:#}"),
    }
}

fn poll_once(camera: &mut dyn CameraDevice, sender: &FrameSender, shared: &Shared) -> Result<bool> {
    let Some(raw) = camera.poll_frame()? else {
        return Ok(false);
    };
    let frame = to_frame(raw)?;
    shared.produced.fetch_add(1, Ordering::Relaxed);

    if let Some(path) = shared.save.take() {
        save_frame(&frame, &path)?;
        log::info!("Image saved to {}", path.display());
    }

    match sender.try_send(frame) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
            shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
    Ok(true)
}


#[cfg(test)]
mod tests {
    use super::testing::{wait_until, FakeCamera};
    use super::*;
    use std::time::Instant;

    #[test]
    fn twelve_bit_frames_are_scaled_to_eight() {
        let raw = RawFrame {
            width: 2,
            height: 1,
            bit_depth: 12,
            pixels: vec![4095, 16],
        };
        let frame = to_frame(raw).unwrap();
        assert_eq!(frame.as_raw(), &vec![255u8, 1]);
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        let raw = RawFrame {
            width: 3,
            height: 3,
            bit_depth: 8,
            pixels: vec![0; 4],
        };
        assert!(to_frame(raw).is_err());
    }

    #[test]
    fn queue_is_bounded_and_producer_keeps_running() {
        let camera = FakeCamera::streaming();
        let (source, receiver) = FrameSource::new(Box::new(camera.clone()));
        source.start().unwrap();

        // nobody drains the queue while the producer runs ahead
        assert!(wait_until(Duration::from_secs(2), || source.stats().dropped >= 10));
        source.stop().unwrap();

        let queued = receiver.try_iter().count();
        assert_eq!(queued, FRAME_QUEUE_CAPACITY);
        let stats = source.stats();
        assert_eq!(stats.produced - stats.dropped, FRAME_QUEUE_CAPACITY as u64);
    }

    #[test]
    fn latest_save_request_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.png");
        let second = dir.path().join("second.png");

        let camera = FakeCamera::default();
        let (source, _receiver) = FrameSource::new(Box::new(camera.clone()));
        source.start().unwrap();
        source.save_next_frame(&first);
        source.save_next_frame(&second);
        camera.open.store(true, Ordering::SeqCst);

        assert!(wait_until(Duration::from_secs(2), || second.exists()));
        source.stop().unwrap();

        assert!(!first.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        let saved = image::open(&second).unwrap().into_luma8();
        assert_eq!(saved.as_raw(), &vec![0u8, 64, 128, 255]);
    }

    #[test]
    fn save_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("0.png");
        let (source, _receiver) = FrameSource::new(Box::new(FakeCamera::streaming()));
        source.save_next_frame(&path);
        source.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || path.exists()));
        source.stop().unwrap();
    }

    #[test]
    fn stop_before_start_is_safe() {
        let camera = FakeCamera::default();
        let (source, _receiver) = FrameSource::new(Box::new(camera.clone()));
        assert_eq!(source.state(), SourceState::Idle);
        source.stop().unwrap();
        source.stop().unwrap();
        assert_eq!(source.state(), SourceState::Stopped);
        assert!(camera.shut_down.load(Ordering::SeqCst));
        assert!(source.start().is_err());
    }

    #[test]
    fn stop_joins_within_a_poll_interval() {
        let camera = FakeCamera::default();
        let (source, _receiver) = FrameSource::new(Box::new(camera.clone()));
        source.start().unwrap();
        assert_eq!(source.state(), SourceState::Running);
        assert!(wait_until(Duration::from_secs(1), || {
            camera.polls.load(Ordering::SeqCst) > 0
        }));

        let started = Instant::now();
        source.stop().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(source.state(), SourceState::Stopped);
        assert!(camera.shut_down.load(Ordering::SeqCst));
        assert!(source.start().is_err());
    }

    #[test]
    fn exposure_requests_reach_the_camera_clamped() {
        let camera = FakeCamera::default();
        camera.exposure.store(100, Ordering::SeqCst);
        let (source, _receiver) = FrameSource::new(Box::new(camera.clone()));
        assert_eq!(source.exposure_us(), 100);
        assert_eq!(source.exposure_range_us(), testing::FAKE_EXPOSURE_RANGE_US);

        source.start().unwrap();
        source.set_exposure_us(250);
        assert!(wait_until(Duration::from_secs(2), || source.exposure_us() == 250));
        assert_eq!(camera.exposure.load(Ordering::SeqCst), 250);

        source.set_exposure_us(5_000_000);
        assert!(wait_until(Duration::from_secs(2), || source.exposure_us() == 1_000));
        source.stop().unwrap();
        assert_eq!(camera.rearms.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn refused_exposure_is_retried_with_the_camera_disarmed() {
        let camera = FakeCamera::streaming();
        camera.exposure.store(100, Ordering::SeqCst);
        camera.exposure_refusals.store(1, Ordering::SeqCst);
        let (source, _receiver) = FrameSource::new(Box::new(camera.clone()));
        source.set_exposure_us(400);
        source.start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || source.exposure_us() == 400));
        assert_eq!(camera.rearms.load(Ordering::SeqCst), 1);
        assert!(!camera.disarmed.load(Ordering::SeqCst));
        assert_eq!(source.state(), SourceState::Running);
        source.stop().unwrap();
    }

    #[test]
    fn exposure_refused_twice_keeps_acquiring_at_the_old_value() {
        let camera = FakeCamera::streaming();
        camera.exposure.store(100, Ordering::SeqCst);
        camera.exposure_refusals.store(2, Ordering::SeqCst);
        let (source, _receiver) = FrameSource::new(Box::new(camera.clone()));
        source.set_exposure_us(400);
        source.start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            camera.rearms.load(Ordering::SeqCst) == 1
        }));
        let polled = camera.polls.load(Ordering::SeqCst);
        assert!(wait_until(Duration::from_secs(2), || {
            camera.polls.load(Ordering::SeqCst) > polled
        }));
        assert_eq!(source.exposure_us(), 100);
        assert_eq!(source.state(), SourceState::Running);
        source.stop().unwrap();
    }

    #[test]
    fn device_error_ends_the_run() {
        let camera = FakeCamera::streaming();
        let (source, _receiver) = FrameSource::new(Box::new(camera.clone()));
        source.start().unwrap();
        camera.fail.store(true, Ordering::SeqCst);

        assert!(wait_until(Duration::from_secs(2), || {
            source.state() == SourceState::Stopped
        }));
        source.stop().unwrap();
        assert!(camera.shut_down.load(Ordering::SeqCst));
    }
}
