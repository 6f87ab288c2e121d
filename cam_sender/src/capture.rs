//! Sampling of the live video into encoded frames.
//!
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use common::protocol::Frame;
use image::RgbImage;

/// Timing and geometry of the capture loop.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureConfig {
    /// Time between two sampled frames.
    pub interval: Duration,
    /// JPEG quality in percent.
    pub jpeg_quality: i32,
    /// Size of the live video preview.
    pub video_size: (u32, u32),
    /// Size of the surface frames are drawn on before encoding.
    pub canvas_size: (u32, u32),
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(300),
            jpeg_quality: quality_percent(0.8),
            video_size: (420, 320),
            canvas_size: (680, 480),
        }
    }
}

/// Convert a quality factor in `0..=1` to a JPEG quality in percent.
pub fn quality_percent(factor: f32) -> i32 {
    (factor.clamp(0.0, 1.0) * 100.0).round() as i32
}

/// Draw a video frame at the origin of an empty canvas, cropping what does not fit.
pub fn draw_on_canvas(frame: &RgbImage, (width, height): (u32, u32)) -> RgbImage {
    let mut canvas = RgbImage::new(width, height);
    image::imageops::replace(&mut canvas, frame, 0, 0);
    canvas
}

/// Turns video frames into sequenced, encoded frames.
pub struct Sampler {
    config: CaptureConfig,
    next_seq: u64,
}

impl Sampler {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            next_seq: 1,
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Draw the frame on the canvas, encode it and assign the next sequence id.
    pub fn sample(&mut self, video_frame: &RgbImage) -> Result<Frame> {
        let canvas = draw_on_canvas(video_frame, self.config.canvas_size);
        let buf = turbojpeg::compress_image(
            &canvas,
            self.config.jpeg_quality,
            turbojpeg::Subsamp::Sub2x2,
        )?;

        let seq = self.next_seq;
        self.next_seq += 1;

        Ok(Frame::new(seq, Bytes::copy_from_slice(&buf)))
    }
}
