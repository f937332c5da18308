use crate::error::ScanError;
use anyhow::Result;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use std::vec::IntoIter;

/// One exposure as delivered by the device, before conversion for display.
#[derive(Clone, Debug, PartialEq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub pixels: Vec<u16>,
}

pub enum CameraType {
    DiskLoader(PathBuf),
    Synthetic,
    #[cfg(feature = "camera")]
    RaspberryPi,
}

pub trait CameraDevice: Send {
    fn name(&self) -> String;
    /// Never blocks. `Ok(None)` means no frame is pending yet.
    fn poll_frame(&mut self) -> Result<Option<RawFrame>>;

    fn exposure_range_us(&self) -> RangeInclusive<u32>;
    fn exposure_us(&self) -> u32;
    /// Some sensors only accept a new exposure while disarmed.
    fn set_exposure_us(&mut self, exposure_us: u32) -> Result<()>;

    /// Stops triggering without releasing the device.
    fn disarm(&mut self) -> Result<()> {
        Ok(())
    }
    /// Resumes triggering after `disarm`.
    fn arm(&mut self) -> Result<()> {
        Ok(())
    }

    /// Disarms the device and releases it.
    fn shutdown(&mut self) -> Result<()>;
}

/// Exposure limits of the simulated devices, and the exposure at which the
/// synthetic pattern has unit gain.
pub const SIMULATED_EXPOSURE_RANGE_US: RangeInclusive<u32> = 100..=50_000;
pub const DEFAULT_EXPOSURE_US: u32 = 10_000;

fn check_exposure(range: &RangeInclusive<u32>, exposure_us: u32) -> Result<()> {
    if !range.contains(&exposure_us) {
        return Err(ScanError::InvalidInput(format!(
            "exposure of {exposure_us} us is outside {}..={} us",
            range.start(),
            range.end()
        ))
        .into());
    }
    Ok(())
}

pub fn make_camera(camera_type: CameraType) -> Result<Box<dyn CameraDevice>> {
    match camera_type {
        CameraType::DiskLoader(path) => Ok(Box::new(DiskCamera::from_directory(&path)?)),
        CameraType::Synthetic => Ok(Box::new(SyntheticCamera::new(640, 480))),
        #[cfg(feature = "camera")]
        CameraType::RaspberryPi => Ok(Box::new(real_camera::PiCamera::open()?)),
    }
}

const DISK_FRAME_INTERVAL: Duration = Duration::from_millis(100);
const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "tif", "tiff"];

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Replays a directory of images in name order, starting over at the end.
pub struct DiskCamera {
    dir: PathBuf,
    images: Vec<PathBuf>,
    iter: IntoIter<PathBuf>,
    interval: Duration,
    last_frame: Option<Instant>,
    exposure_us: u32,
    armed: bool,
}

impl DiskCamera {
    pub fn from_directory(path: &Path) -> Result<DiskCamera> {
        let mut images: Vec<PathBuf> = path
            .read_dir()
            .map_err(|e| ScanError::DeviceNotFound(format!("{}: {e}", path.display())))?
            .filter_map(|f| match f {
                Ok(entry) => Some(entry.path()),
                Err(_) => None,
            })
            .filter(|p| is_image_file(p))
            .collect();
        if images.is_empty() {
            return Err(ScanError::DeviceNotFound(format!(
                "no images to replay in {}",
                path.display()
            ))
            .into());
        }
        images.sort();
        Ok(DiskCamera {
            dir: path.to_path_buf(),
            iter: images.clone().into_iter(),
            images,
            interval: DISK_FRAME_INTERVAL,
            last_frame: None,
            exposure_us: DEFAULT_EXPOSURE_US,
            armed: true,
        })
    }

    #[cfg(test)]
    pub fn with_interval(mut self, interval: Duration) -> DiskCamera {
        self.interval = interval;
        self
    }

    fn next_path(&mut self) -> PathBuf {
        match self.iter.next() {
            Some(path) => path,
            None => {
                self.iter = self.images.clone().into_iter();
                // from_directory guarantees at least one image
                self.iter.next().unwrap_or_default()
            }
        }
    }
}

impl CameraDevice for DiskCamera {
    fn name(&self) -> String {
        format!("disk replay of {}", self.dir.display())
    }

    fn poll_frame(&mut self) -> Result<Option<RawFrame>> {
        if !self.armed {
            return Ok(None);
        }
        if let Some(last) = self.last_frame {
            if last.elapsed() < self.interval {
                return Ok(None);
            }
        }
        self.last_frame = Some(Instant::now());

        let path = self.next_path();
        let image = image::open(&path)
            .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?
            .into_luma16();
        Ok(Some(RawFrame {
            width: image.width(),
            height: image.height(),
            bit_depth: 16,
            pixels: image.into_raw(),
        }))
    }

    fn exposure_range_us(&self) -> RangeInclusive<u32> {
        SIMULATED_EXPOSURE_RANGE_US
    }

    fn exposure_us(&self) -> u32 {
        self.exposure_us
    }

    /// Recorded images are replayed unchanged; the value is only kept.
    fn set_exposure_us(&mut self, exposure_us: u32) -> Result<()> {
        check_exposure(&self.exposure_range_us(), exposure_us)?;
        self.exposure_us = exposure_us;
        Ok(())
    }

    fn disarm(&mut self) -> Result<()> {
        self.armed = false;
        Ok(())
    }

    fn arm(&mut self) -> Result<()> {
        self.armed = true;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.armed = false;
        Ok(())
    }
}

const SYNTHETIC_FRAME_INTERVAL: Duration = Duration::from_millis(33);
const SYNTHETIC_BIT_DEPTH: u8 = 12;

/// Moving diagonal gradient, 12 bits per pixel, about 30 frames a second.
/// Brightness follows the exposure time, clipping at full scale.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    frame_index: u32,
    last_frame: Option<Instant>,
    exposure_us: u32,
    armed: bool,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> SyntheticCamera {
        SyntheticCamera {
            width,
            height,
            frame_index: 0,
            last_frame: None,
            exposure_us: DEFAULT_EXPOSURE_US,
            armed: true,
        }
    }
}

impl CameraDevice for SyntheticCamera {
    fn name(&self) -> String {
        "Synthetic camera".to_string()
    }

    fn poll_frame(&mut self) -> Result<Option<RawFrame>> {
        if !self.armed {
            return Ok(None);
        }
        if let Some(last) = self.last_frame {
            if last.elapsed() < SYNTHETIC_FRAME_INTERVAL {
                return Ok(None);
            }
        }
        self.last_frame = Some(Instant::now());

        let max = (1u32 << SYNTHETIC_BIT_DEPTH) - 1;
        let span = (self.width + self.height).max(1);
        let offset = self.frame_index.wrapping_mul(4);
        let mut pixels = Vec::with_capacity((self.width * self.height) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let value = ((x + y).wrapping_add(offset) % span) * max / span;
                let exposed = (value * self.exposure_us / DEFAULT_EXPOSURE_US).min(max);
                pixels.push(exposed as u16);
            }
        }
        self.frame_index = self.frame_index.wrapping_add(1);
        Ok(Some(RawFrame {
            width: self.width,
            height: self.height,
            bit_depth: SYNTHETIC_BIT_DEPTH,
            pixels,
        }))
    }

    fn exposure_range_us(&self) -> RangeInclusive<u32> {
        SIMULATED_EXPOSURE_RANGE_US
    }

    fn exposure_us(&self) -> u32 {
        self.exposure_us
    }

    fn set_exposure_us(&mut self, exposure_us: u32) -> Result<()> {
        check_exposure(&self.exposure_range_us(), exposure_us)?;
        self.exposure_us = exposure_us;
        Ok(())
    }

    fn disarm(&mut self) -> Result<()> {
        self.armed = false;
        Ok(())
    }

    fn arm(&mut self) -> Result<()> {
        self.armed = true;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.armed = false;
        Ok(())
    }
}

#[cfg(feature = "camera")]
pub mod real_camera {
    use super::*;
    use drm_fourcc::DrmFourcc;
    use libcamera::{
        camera::CameraConfigurationStatus,
        camera_manager::CameraManager,
        controls,
        framebuffer::AsFrameBuffer,
        framebuffer_allocator::{FrameBuffer, FrameBufferAllocator},
        framebuffer_map::MemoryMappedFrameBuffer,
        pixel_format::PixelFormat,
        properties,
        request::ReuseFlag,
        stream::StreamRole,
    };
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
    use std::sync::Arc;
    use std::thread::JoinHandle;

    // grayscale is the first plane of YUV420
    const YUV420: PixelFormat = PixelFormat::new(DrmFourcc::Yuv420 as u32, 0);
    const PI_EXPOSURE_RANGE_US: RangeInclusive<u32> = 1..=50_000;
    // 0 leaves exposure to the sensor's auto exposure
    const AUTO_EXPOSURE: u32 = 0;

    /// libcamera ties the active camera to the manager's lifetime, so both
    /// live on a streaming thread that hands frames over a small channel.
    pub struct PiCamera {
        model: String,
        frames: Receiver<RawFrame>,
        stop: Arc<AtomicBool>,
        exposure: Arc<AtomicU32>,
        exposure_us: u32,
        handle: Option<JoinHandle<Result<()>>>,
    }

    impl PiCamera {
        pub fn open() -> Result<PiCamera> {
            let (frame_tx, frames) = mpsc::sync_channel(2);
            let (ready_tx, ready_rx) = mpsc::channel();
            let stop = Arc::new(AtomicBool::new(false));
            let exposure = Arc::new(AtomicU32::new(AUTO_EXPOSURE));
            let thread_stop = stop.clone();
            let thread_exposure = exposure.clone();
            let handle = std::thread::Builder::new()
                .name("libcamera".to_string())
                .spawn(move || stream(frame_tx, ready_tx, thread_stop, thread_exposure))?;

            match ready_rx.recv() {
                Ok(Ok(model)) => Ok(PiCamera {
                    model,
                    frames,
                    stop,
                    exposure,
                    exposure_us: DEFAULT_EXPOSURE_US,
                    handle: Some(handle),
                }),
                Ok(Err(e)) => {
                    let _ = handle.join();
                    Err(e)
                }
                Err(_) => match handle.join() {
                    Ok(Err(e)) => Err(e),
                    _ => Err(anyhow::anyhow!("libcamera thread exited during setup")),
                },
            }
        }
    }

    fn stream(
        frame_tx: SyncSender<RawFrame>,
        ready_tx: mpsc::Sender<Result<String>>,
        stop: Arc<AtomicBool>,
        exposure: Arc<AtomicU32>,
    ) -> Result<()> {
        let mngr = CameraManager::new()?;
        let cameras = mngr.cameras();
        let Some(cam) = cameras.get(0) else {
            let _ = ready_tx.send(Err(
                ScanError::DeviceNotFound("no libcamera devices".to_string()).into(),
            ));
            return Ok(());
        };

        let camera_model = cam.properties().get::<properties::Model>()?;
        log::info!("Using camera: {}", *camera_model);

        let mut cam = cam.acquire()?;

        let mut cfgs = cam
            .generate_configuration(&[StreamRole::ViewFinder])
            .ok_or_else(|| anyhow::anyhow!("no default configuration for view finder"))?;
        {
            let mut cfg = cfgs
                .get_mut(0)
                .ok_or_else(|| anyhow::anyhow!("empty camera configuration"))?;
            cfg.set_pixel_format(YUV420);
        }

        match cfgs.validate() {
            CameraConfigurationStatus::Valid => log::info!("Camera configuration valid!"),
            CameraConfigurationStatus::Adjusted => {
                log::warn!("Camera configuration was adjusted: {:#?}", cfgs)
            }
            CameraConfigurationStatus::Invalid => {
                anyhow::bail!("Error validating camera configuration")
            }
        }

        cam.configure(&mut cfgs)?;

        let mut alloc = FrameBufferAllocator::new(&cam);
        let cfg = cfgs
            .get(0)
            .ok_or_else(|| anyhow::anyhow!("empty camera configuration"))?;
        let frame_size = cfg.get_size();
        let stream = cfg
            .stream()
            .ok_or_else(|| anyhow::anyhow!("configuration has no stream"))?;
        let buffers = alloc.alloc(&stream)?;
        log::debug!("Allocated {} buffers", buffers.len());

        let buffers = buffers
            .into_iter()
            .map(MemoryMappedFrameBuffer::new)
            .collect::<Result<Vec<_>, _>>()?;

        let mut reqs = Vec::with_capacity(buffers.len());
        for buf in buffers {
            let mut req = cam
                .create_request(None)
                .ok_or_else(|| anyhow::anyhow!("failed to create capture request"))?;
            req.add_buffer(&stream, buf)?;
            reqs.push(req);
        }

        let (req_tx, req_rx) = mpsc::channel();
        cam.on_request_completed(move |req| {
            let _ = req_tx.send(req);
        });

        cam.start(None)?;
        for req in reqs {
            cam.queue_request(req)?;
        }
        let _ = ready_tx.send(Ok(camera_model.to_string()));

        let mut applied_exposure = AUTO_EXPOSURE;

        while !stop.load(Ordering::Relaxed) {
            let mut req = match req_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(req) => req,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let framebuffer: &MemoryMappedFrameBuffer<FrameBuffer> = req
                .buffer(&stream)
                .ok_or_else(|| anyhow::anyhow!("completed request without buffer"))?;
            let planes = framebuffer.data();
            let bytes_used = framebuffer
                .metadata()
                .and_then(|m| m.planes().get(0).map(|p| p.bytes_used as usize))
                .unwrap_or(0);
            let width = frame_size.width;
            let height = frame_size.height;
            let luma_len = (width * height) as usize;
            if let Some(plane) = planes.get(0) {
                if bytes_used >= luma_len && plane.len() >= luma_len {
                    let pixels = plane[..luma_len].iter().map(|&p| p as u16).collect();
                    // live view drops frames when the consumer lags
                    let _ = frame_tx.try_send(RawFrame {
                        width,
                        height,
                        bit_depth: 8,
                        pixels,
                    });
                }
            }

            req.reuse(ReuseFlag::REUSE_BUFFERS);
            let wanted = exposure.load(Ordering::Relaxed);
            if wanted != AUTO_EXPOSURE && wanted != applied_exposure {
                let exposure_time = i32::try_from(wanted).unwrap_or(i32::MAX);
                let list = req.controls_mut();
                match list
                    .set(controls::AeEnable(false))
                    .and_then(|_| list.set(controls::ExposureTime(exposure_time)))
                {
                    Ok(()) => applied_exposure = wanted,
                    Err(e) => log::warn!("Failed to set exposure time: {e:?}"),
                }
            }
            cam.queue_request(req)?;
        }

        cam.stop()?;
        Ok(())
    }

    impl CameraDevice for PiCamera {
        fn name(&self) -> String {
            self.model.clone()
        }

        fn poll_frame(&mut self) -> Result<Option<RawFrame>> {
            match self.frames.try_recv() {
                Ok(frame) => Ok(Some(frame)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => {
                    Err(anyhow::anyhow!("libcamera stream ended unexpectedly"))
                }
            }
        }

        fn exposure_range_us(&self) -> RangeInclusive<u32> {
            PI_EXPOSURE_RANGE_US
        }

        fn exposure_us(&self) -> u32 {
            self.exposure_us
        }

        /// Takes effect on the next request queued by the streaming thread.
        fn set_exposure_us(&mut self, exposure_us: u32) -> Result<()> {
            check_exposure(&self.exposure_range_us(), exposure_us)?;
            if self.handle.as_ref().map_or(true, |h| h.is_finished()) {
                anyhow::bail!("libcamera stream is not running");
            }
            self.exposure.store(exposure_us, Ordering::Relaxed);
            self.exposure_us = exposure_us;
            Ok(())
        }

        fn shutdown(&mut self) -> Result<()> {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(handle) = self.handle.take() {
                match handle.join() {
                    Ok(result) => result?,
                    Err(_) => anyhow::bail!("libcamera thread panicked"),
                }
            }
            log::info!("Camera {} released", self.model);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_gray(path: &Path, value: u8) {
        image::GrayImage::from_pixel(4, 3, image::Luma([value]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn disk_camera_replays_in_name_order_and_loops() {
        let dir = tempfile::tempdir().unwrap();
        write_gray(&dir.path().join("b.png"), 20);
        write_gray(&dir.path().join("a.png"), 10);
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let mut camera = DiskCamera::from_directory(dir.path())
            .unwrap()
            .with_interval(Duration::ZERO);
        let first = camera.poll_frame().unwrap().unwrap();
        let second = camera.poll_frame().unwrap().unwrap();
        let third = camera.poll_frame().unwrap().unwrap();

        assert_eq!((first.width, first.height, first.bit_depth), (4, 3, 16));
        assert_eq!(first.pixels[0] >> 8, 10);
        assert_eq!(second.pixels[0] >> 8, 20);
        assert_eq!(third.pixels[0] >> 8, 10);
    }

    #[test]
    fn disk_camera_paces_frames() {
        let dir = tempfile::tempdir().unwrap();
        write_gray(&dir.path().join("0.png"), 1);
        let mut camera = DiskCamera::from_directory(dir.path())
            .unwrap()
            .with_interval(Duration::from_secs(60));
        assert!(camera.poll_frame().unwrap().is_some());
        assert!(camera.poll_frame().unwrap().is_none());
    }

    #[test]
    fn empty_directory_is_no_device() {
        let dir = tempfile::tempdir().unwrap();
        let err = make_camera(CameraType::DiskLoader(dir.path().to_path_buf()))
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<ScanError>(),
            Some(ScanError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn longer_exposure_brightens_the_synthetic_pattern() {
        let mut camera = SyntheticCamera::new(16, 8);
        assert_eq!(camera.exposure_us(), DEFAULT_EXPOSURE_US);
        let base = camera.poll_frame().unwrap().unwrap();

        let mut bright = SyntheticCamera::new(16, 8);
        bright.set_exposure_us(2 * DEFAULT_EXPOSURE_US).unwrap();
        let doubled = bright.poll_frame().unwrap().unwrap();

        for (b, d) in base.pixels.iter().zip(&doubled.pixels) {
            assert_eq!(*d, (*b * 2).min(4095));
        }
    }

    #[test]
    fn exposure_outside_the_range_is_refused() {
        let mut camera = SyntheticCamera::new(4, 4);
        let err = camera.set_exposure_us(60_000).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScanError>(),
            Some(ScanError::InvalidInput(_))
        ));
        assert_eq!(camera.exposure_us(), DEFAULT_EXPOSURE_US);
    }

    #[test]
    fn disarmed_devices_produce_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_gray(&dir.path().join("0.png"), 1);
        let mut disk = DiskCamera::from_directory(dir.path())
            .unwrap()
            .with_interval(Duration::ZERO);
        disk.disarm().unwrap();
        assert!(disk.poll_frame().unwrap().is_none());
        disk.set_exposure_us(500).unwrap();
        disk.arm().unwrap();
        assert_eq!(disk.exposure_us(), 500);
        assert!(disk.poll_frame().unwrap().is_some());

        let mut synthetic = SyntheticCamera::new(4, 4);
        synthetic.disarm().unwrap();
        assert!(synthetic.poll_frame().unwrap().is_none());
    }

    #[test]
    fn synthetic_frames_stay_within_bit_depth() {
        let mut camera = SyntheticCamera::new(16, 8);
        let frame = camera.poll_frame().unwrap().unwrap();
        assert_eq!(frame.pixels.len(), 16 * 8);
        assert!(frame.pixels.iter().all(|&p| p < 1 << 12));
        assert!(camera.poll_frame().unwrap().is_none());
    }
}
