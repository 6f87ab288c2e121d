//! Rendering of detections on top of the live video.
//!
use std::path::Path;

use common::{detection::Detection, protocol::PredictionsMsg};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use rusttype::{Font, Scale};
use simple_error::simple_error;

use crate::{capture::draw_on_canvas, Error};

/// Boxes closer to the top edge get their label at [`FALLBACK_LABEL_Y`].
pub const LABEL_TOP_MARGIN: f32 = 10.0;
/// Distance between a label's baseline and the top of its box.
pub const LABEL_OFFSET: f32 = 5.0;
pub const FALLBACK_LABEL_Y: f32 = 10.0;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const FONT_SIZE: f32 = 14.0;
/// Boxes reaching past the canvas are cut this many pixels outside of it.
const CLIP_MARGIN: f32 = 2.0;

/// Position of the label baseline for a `[x, y, width, height]` bounding box.
pub fn label_position(bbox: [f32; 4]) -> (f32, f32) {
    let [x, y, _, _] = bbox;
    if y > LABEL_TOP_MARGIN {
        (x, y - LABEL_OFFSET)
    } else {
        (x, FALLBACK_LABEL_Y)
    }
}

/// Pixel rectangle of a `[x, y, width, height]` box, cut to a small margin around the canvas.
///
/// Boxes without any part on the canvas, or with non-finite coordinates, yield `None`.
fn clip_to_canvas(bbox: [f32; 4], canvas_size: (u32, u32)) -> Option<(i32, i32, u32, u32)> {
    if bbox.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let (canvas_w, canvas_h) = (canvas_size.0 as f32, canvas_size.1 as f32);
    let [x, y, w, h] = bbox;
    let (x1, y1) = (x.min(x + w), y.min(y + h));
    let (x2, y2) = (x.max(x + w), y.max(y + h));
    if x2 < 0.0 || y2 < 0.0 || x1 >= canvas_w || y1 >= canvas_h {
        return None;
    }

    let clip = |v: f32, max: f32| v.clamp(-CLIP_MARGIN, max + CLIP_MARGIN).round();
    let (x1, y1) = (clip(x1, canvas_w), clip(y1, canvas_h));
    let (x2, y2) = (clip(x2, canvas_w), clip(y2, canvas_h));

    Some((
        x1 as i32,
        y1 as i32,
        (x2 - x1).max(1.0) as u32,
        (y2 - y1).max(1.0) as u32,
    ))
}

/// Load a TrueType font for the labels.
pub fn load_font(path: impl AsRef<Path>) -> Result<Font<'static>, Error> {
    let font_data = std::fs::read(path)?;
    Font::try_from_vec(font_data).ok_or_else(|| simple_error!("invalid font file").into())
}

/// Most recent detection set and the surface it is drawn on.
pub struct Overlay {
    canvas_size: (u32, u32),
    detections: Vec<Detection>,
    last_seq: u64,
    font: Option<Font<'static>>,
}

impl Overlay {
    pub fn new(canvas_size: (u32, u32)) -> Self {
        Self {
            canvas_size,
            detections: Vec::new(),
            last_seq: 0,
            font: None,
        }
    }

    /// Draw labels with the given font. Without a font only boxes are drawn.
    pub fn with_font(mut self, font: Font<'static>) -> Self {
        self.font = Some(font);
        self
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Replace the displayed detections.
    ///
    /// Results for frames older than the last applied one are discarded and `false` is returned.
    /// Results without a sequence id (`seq == 0`) are always applied.
    pub fn apply(&mut self, predictions: PredictionsMsg) -> bool {
        if predictions.seq != 0 {
            if predictions.seq < self.last_seq {
                return false;
            }
            self.last_seq = predictions.seq;
        }
        self.detections = predictions.detections;
        true
    }

    /// Draw the current video frame with one box and label per detection.
    pub fn render(&self, video_frame: &RgbImage) -> RgbImage {
        let mut canvas = draw_on_canvas(video_frame, self.canvas_size);

        for detection in self.detections.iter() {
            let Some((x, y, w, h)) = clip_to_canvas(detection.bbox, self.canvas_size) else {
                continue;
            };

            // Two pixel wide stroke centered on the box outline
            draw_hollow_rect_mut(&mut canvas, Rect::at(x, y).of_size(w, h), BOX_COLOR);
            draw_hollow_rect_mut(
                &mut canvas,
                Rect::at(x - 1, y - 1).of_size(w + 2, h + 2),
                BOX_COLOR,
            );

            if let Some(font) = self.font.as_ref() {
                let scale = Scale::uniform(FONT_SIZE);
                let ascent = font.v_metrics(scale).ascent;
                let (label_x, label_y) = label_position([x as f32, y as f32, w as f32, h as f32]);
                draw_text_mut(
                    &mut canvas,
                    BOX_COLOR,
                    label_x.round() as i32,
                    (label_y - ascent).round() as i32,
                    scale,
                    font,
                    detection.label(),
                );
            }
        }

        canvas
    }
}

#[cfg(test)]
mod test {

    use super::*;

    fn predictions(seq: u64, class: &str) -> PredictionsMsg {
        PredictionsMsg {
            seq,
            detections: vec![Detection::new(class, [5.0, 50.0, 40.0, 20.0], 0.8)],
        }
    }

    #[test]
    fn test_label_position() {
        // Too close to the top edge
        assert_eq!(label_position([5.0, 3.0, 40.0, 20.0]), (5.0, FALLBACK_LABEL_Y));
        assert_eq!(label_position([5.0, 10.0, 40.0, 20.0]), (5.0, FALLBACK_LABEL_Y));
        // Five pixels above the box
        assert_eq!(label_position([5.0, 50.0, 40.0, 20.0]), (5.0, 45.0));
    }

    #[test]
    fn test_stale_predictions_are_discarded() {
        let mut overlay = Overlay::new((680, 480));

        assert!(overlay.apply(predictions(2, "cat")));
        assert!(!overlay.apply(predictions(1, "dog")));
        assert_eq!(overlay.detections()[0].label(), "cat");

        assert!(overlay.apply(predictions(5, "cup")));
        assert_eq!(overlay.last_seq(), 5);
        assert_eq!(overlay.detections()[0].label(), "cup");
    }

    #[test]
    fn test_unsequenced_predictions_replace_everything() {
        let mut overlay = Overlay::new((680, 480));
        overlay.apply(predictions(3, "cat"));

        assert!(overlay.apply(PredictionsMsg::default()));
        assert!(overlay.detections().is_empty());
        assert_eq!(overlay.last_seq(), 3);
    }

    #[test]
    fn test_render_draws_boxes_over_current_frame() {
        let mut overlay = Overlay::new((680, 480));
        overlay.apply(predictions(1, "cat"));

        let frame = RgbImage::from_pixel(640, 480, Rgb([0, 0, 255]));
        let canvas = overlay.render(&frame);

        assert_eq!(canvas.dimensions(), (680, 480));
        // Corners of the box are stroked, its inside shows the video
        assert_eq!(canvas[(5, 50)], BOX_COLOR);
        assert_eq!(canvas[(4, 49)], BOX_COLOR);
        assert_eq!(canvas[(44, 69)], BOX_COLOR);
        assert_eq!(canvas[(20, 60)], Rgb([0, 0, 255]));
        // Outside of the video the canvas is cleared
        assert_eq!(canvas[(670, 10)], Rgb([0, 0, 0]));
    }

    #[test]
    fn test_render_clips_boxes_at_the_edges() {
        let mut overlay = Overlay::new((100, 100));
        overlay.apply(PredictionsMsg {
            seq: 1,
            detections: vec![Detection::new("wall", [-20.0, 0.0, 500.0, 0.0], 0.9)],
        });

        let canvas = overlay.render(&RgbImage::new(100, 100));
        assert_eq!(canvas[(0, 0)], BOX_COLOR);
    }

    #[test]
    fn test_render_survives_out_of_range_boxes() {
        let mut overlay = Overlay::new((100, 100));
        overlay.apply(PredictionsMsg {
            seq: 1,
            detections: vec![
                Detection::new("far left", [-3e9, 0.0, 10.0, 10.0], 0.9),
                Detection::new("far right", [3e9, 0.0, 10.0, 10.0], 0.9),
                Detection::new("huge", [0.0, 0.0, 1e10, 10.0], 0.9),
                Detection::new("tall", [50.0, -1e12, 10.0, 2e12], 0.9),
                Detection::new("broken", [f32::NAN, 0.0, f32::INFINITY, 10.0], 0.9),
            ],
        });

        let canvas = overlay.render(&RgbImage::new(100, 100));

        // The huge box runs along the top edge, the tall one down the middle
        assert_eq!(canvas[(99, 0)], BOX_COLOR);
        assert_eq!(canvas[(50, 99)], BOX_COLOR);
        assert_eq!(canvas[(20, 50)], Rgb([0, 0, 0]));
    }

    #[test]
    fn test_clip_to_canvas() {
        assert_eq!(clip_to_canvas([5.0, 50.0, 40.0, 20.0], (680, 480)), Some((5, 50, 40, 20)));
        assert_eq!(clip_to_canvas([-3e9, 0.0, 10.0, 10.0], (100, 100)), None);
        assert_eq!(clip_to_canvas([0.0, 0.0, 1e10, 10.0], (100, 100)), Some((0, 0, 102, 10)));
        assert_eq!(clip_to_canvas([0.0, f32::NAN, 1.0, 1.0], (100, 100)), None);
    }
}
