use std::path::Path;

use anyhow::{bail, Result};
use common::detection::Detection;
use image::RgbImage;
use ndarray::{s, Axis, Ix2};
use tract_onnx::prelude::*;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Class names of the COCO dataset in the order of the model outputs.
pub const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

/// A pretrained object detector.
///
/// Implementations return at most `max_detections` results, none of them with a score below
/// `min_confidence`.
pub trait DetectModel: Send + Sync {
    fn detect(
        &self,
        input: &RgbImage,
        max_detections: usize,
        min_confidence: f32,
    ) -> Result<Vec<Detection>>;
}

/// YOLO detector trained on COCO, loaded from an ONNX export.
///
/// Expects a single `[1, 3, size, size]` input with RGB values in `0..1` and a single
/// `[1, 4 + 80, anchors]` output where every anchor holds `cx, cy, w, h` followed by the class
/// scores.
pub struct YoloModel {
    model: NnModel,
    size: u32,
    max_iou: f32,
}

impl YoloModel {
    pub fn load(path: impl AsRef<Path>, size: u32, max_iou: f32) -> Result<Self> {
        let input_fact = InferenceFact::dt_shape(
            f32::datum_type(),
            tvec!(1, 3, size as usize, size as usize),
        );
        let model = tract_onnx::onnx()
            .model_for_path(path)?
            .with_input_fact(0, input_fact)?
            .into_optimized()?
            .into_runnable()?;

        Ok(Self {
            model,
            size,
            max_iou,
        })
    }

    fn preproc(&self, input: &RgbImage) -> Tensor {
        let resized: RgbImage = image::imageops::resize(
            input,
            self.size,
            self.size,
            image::imageops::FilterType::Triangle,
        );

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.size as usize, self.size as usize),
            |(_, c, y, x)| resized[(x as _, y as _)][c] as f32 / 255.0,
        )
        .into()
    }
}

impl DetectModel for YoloModel {
    fn detect(
        &self,
        input: &RgbImage,
        max_detections: usize,
        min_confidence: f32,
    ) -> Result<Vec<Detection>> {
        let scale_x = input.width() as f32 / self.size as f32;
        let scale_y = input.height() as f32 / self.size as f32;

        let raw_nn_out = self.model.run(tvec!(self.preproc(input).into()))?;
        let output = raw_nn_out[0]
            .to_array_view::<f32>()?
            .index_axis_move(Axis(0), 0)
            .into_dimensionality::<Ix2>()?;

        if output.nrows() != 4 + COCO_CLASSES.len() {
            bail!("unexpected model output shape {:?}", output.shape());
        }

        let mut candidates = Vec::new();
        for anchor in output.axis_iter(Axis(1)) {
            let (class_idx, confidence) = anchor
                .slice(s![4..])
                .iter()
                .cloned()
                .enumerate()
                .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

            if confidence < min_confidence {
                continue;
            }

            // Corner points in the coordinates of the input image
            let (cx, cy, w, h) = (anchor[0], anchor[1], anchor[2], anchor[3]);
            let bbox = [
                (cx - w / 2.0) * scale_x,
                (cy - h / 2.0) * scale_y,
                (cx + w / 2.0) * scale_x,
                (cy + h / 2.0) * scale_y,
            ];
            candidates.push(Candidate {
                class_idx,
                confidence,
                bbox,
            });
        }

        candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

        let selected = non_maximum_suppression(candidates, self.max_iou, max_detections);

        Ok(selected
            .into_iter()
            .map(|c| {
                let [x_tl, y_tl, x_br, y_br] = c.bbox;
                Detection::new(
                    COCO_CLASSES[c.class_idx],
                    [x_tl, y_tl, x_br - x_tl, y_br - y_tl],
                    c.confidence,
                )
            })
            .collect())
    }
}

/// Detection candidate with its bounding box as `[x_tl, y_tl, x_br, y_br]`.
#[derive(Clone, Debug, PartialEq)]
struct Candidate {
    class_idx: usize,
    confidence: f32,
    bbox: [f32; 4],
}

/// Run non-maximum-suppression on candidate bounding boxes.
///
/// Start with the most confident bounding box and iterate over all other bounding boxes in the
/// order of sinking confidence. Grow the vector of selected bounding boxes by adding only those
/// candidates which do not overlap by more than `max_iou` with an already chosen box of the same
/// class. Stop once `max_selected` boxes are chosen.
fn non_maximum_suppression(
    mut sorted_candidates: Vec<Candidate>,
    max_iou: f32,
    max_selected: usize,
) -> Vec<Candidate> {
    let mut selected: Vec<Candidate> = vec![];
    'candidates: while selected.len() < max_selected {
        // Get next most confident bbox from the back of ascending-sorted vector.
        match sorted_candidates.pop() {
            Some(candidate) => {
                for chosen in selected.iter() {
                    if chosen.class_idx == candidate.class_idx
                        && iou(&candidate.bbox, &chosen.bbox) > max_iou
                    {
                        continue 'candidates;
                    }
                }

                selected.push(candidate)
            }
            None => break 'candidates,
        }
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &[f32; 4], bbox_b: &[f32; 4]) -> f32 {
    // If the boxes do not overlap, the corner-points will be ill defined, i.e. the top left
    // corner point will be below and to the right of the bottom right corner point. In this case,
    // the area will be zero.
    let overlap_box: [f32; 4] = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    // Avoid division-by-zero with `EPS`
    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Calculate the area enclosed by a bounding box.
///
/// The bounding box is passed as four-element array defining two points:
/// `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`
/// If the bounding box is ill-defined by having the bottom-right point above/to the left of the
/// top-left point, the area is zero.
fn bbox_area(bbox: &[f32; 4]) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}

#[cfg(test)]
mod test {

    use super::*;

    fn candidate(class_idx: usize, confidence: f32, bbox: [f32; 4]) -> Candidate {
        Candidate {
            class_idx,
            confidence,
            bbox,
        }
    }

    #[test]
    fn test_iou() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-5);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);

        // Half of `a` overlaps with a box of the same size
        let shifted = [5.0, 0.0, 15.0, 10.0];
        assert!((iou(&a, &shifted) - 50.0 / 150.0).abs() < 1e-5);
    }

    #[test]
    fn test_bbox_area_of_inverted_box() {
        assert_eq!(bbox_area(&[10.0, 10.0, 0.0, 0.0]), 0.0);
        assert_eq!(bbox_area(&[0.0, 0.0, 4.0, 2.0]), 8.0);
    }

    #[test]
    fn test_nms_suppresses_same_class_overlap() {
        let sorted = vec![
            candidate(0, 0.6, [1.0, 1.0, 11.0, 11.0]),
            candidate(16, 0.7, [0.0, 0.0, 10.0, 10.0]),
            candidate(0, 0.9, [0.0, 0.0, 10.0, 10.0]),
        ];

        let selected = non_maximum_suppression(sorted, 0.5, 20);

        // The second person box is swallowed, the dog on top of the person survives
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].confidence, 0.9);
        assert_eq!(selected[1].class_idx, 16);
    }

    #[test]
    fn test_nms_respects_maximum() {
        let sorted: Vec<_> = (0..10)
            .map(|i| {
                let x = i as f32 * 20.0;
                candidate(0, 0.5 + i as f32 * 0.01, [x, 0.0, x + 10.0, 10.0])
            })
            .collect();

        let selected = non_maximum_suppression(sorted, 0.5, 3);

        assert_eq!(selected.len(), 3);
        assert!(selected[0].confidence > selected[2].confidence);
    }
}
