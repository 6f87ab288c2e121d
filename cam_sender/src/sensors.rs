//! Sensors module.
//!
use std::path::Path;

use image::RgbImage;
use rscam::{Camera, Config};
use simple_error::simple_error;

use crate::Error;

/// Source of the live video frames.
pub trait FrameSource {
    /// Current frame of the video, `None` if no frame is available (yet).
    fn capture(&mut self) -> Option<RgbImage>;
}

/// V4L2 camera streaming MJPG frames.
pub struct CameraSource {
    cam: Camera,
}

impl CameraSource {
    /// Open a video device on a Linux machine.
    ///
    /// Resolution and frame rate default to the highest ones the device supports for `MJPG`.
    pub fn open(
        device_name: &str,
        resolution: Option<(u32, u32)>,
        frame_rate: Option<(u32, u32)>,
    ) -> Result<Self, Error> {
        let format = "MJPG";
        let mut cam = Camera::new(device_name)?;
        log_supported_formats(&cam, format);
        let format = format.as_bytes();

        log::info!("Using camera {}", device_name);

        let resolution = resolution
            .map(Ok)
            .unwrap_or_else(|| get_max_resolution(&cam, format))?;

        let frame_rate = frame_rate
            .map(Ok)
            .unwrap_or_else(|| get_max_frame_rate(&cam, format, resolution))?;

        cam.start(&Config {
            interval: frame_rate,
            resolution,
            format,
            ..Default::default()
        })?;

        Ok(Self { cam })
    }
}

impl FrameSource for CameraSource {
    fn capture(&mut self) -> Option<RgbImage> {
        let frame = match self.cam.capture() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Error capturing frame: {}", e);
                return None;
            }
        };

        match turbojpeg::decompress_image(&frame[..]) {
            Ok(image) => Some(image),
            Err(e) => {
                log::warn!("Dropping undecodable camera frame: {}", e);
                None
            }
        }
    }
}

/// Plays back the same image forever.
#[derive(Clone, Debug)]
pub struct StillImageSource {
    image: RgbImage,
}

impl StillImageSource {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        Ok(Self::new(image::open(path)?.to_rgb8()))
    }
}

impl FrameSource for StillImageSource {
    fn capture(&mut self) -> Option<RgbImage> {
        Some(self.image.clone())
    }
}

/// Get the maximum supported resolution for the given format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32), Error> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Highest resolution in terms of number of pixels
            .max_by_key(|res| res.0 * res.1)
            .copied(),
        rscam::ResolutionInfo::Stepwise { max, .. } => Some(max),
    }
    .ok_or_else(|| simple_error!("No resolution found").into())
}

/// Get the maximum supported frame rate for the given format and resolution.
fn get_max_frame_rate(
    cam: &Camera,
    format: &[u8],
    resolution: (u32, u32),
) -> Result<(u32, u32), Error> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        // Intervals are (numerator, denominator) in seconds, the shortest one is the fastest
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .iter()
            .min_by(|a, b| (a.0 as f64 / a.1 as f64).total_cmp(&(b.0 as f64 / b.1 as f64)))
            .copied(),
        rscam::IntervalInfo::Stepwise { min, .. } => Some(min),
    }
    .ok_or_else(|| simple_error!("No frame rate found").into())
}

fn log_supported_formats(cam: &Camera, format: &str) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        format
    );
}
