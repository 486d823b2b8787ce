// Detection post-processing: raw model output -> deduplicated person
// detections in original-frame pixel coordinates. Everything here is pure
// and deterministic; the ONNX session lives in `detector`.

use crate::types::{Detection, DetectionConfig};
use tracing::debug;

/// Gray fill used for letterbox padding.
pub const PAD_FILL: u8 = 114;

const SIGMOID_CLAMP: f32 = 30.0;

/// Letterbox transform: fit the frame into a square model input while
/// preserving aspect ratio, padding the remainder symmetrically.
#[derive(Debug, Clone, Copy)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    pub fn fit(src_w: usize, src_h: usize, target: usize) -> Self {
        let scale = (target as f32 / src_w as f32).min(target as f32 / src_h as f32);
        let scaled_w = (src_w as f32 * scale) as usize;
        let scaled_h = (src_h as f32 * scale) as usize;
        Self {
            scale,
            pad_x: (target - scaled_w) as f32 / 2.0,
            pad_y: (target - scaled_h) as f32 / 2.0,
        }
    }
}

/// The two raw output layouts the decoder recognizes, selected by shape
/// inspection rather than exception-driven fallback.
#[derive(Debug)]
pub enum RawOutput<'a> {
    /// Rows of [x1, y1, x2, y2, confidence, class_id], model-input coords.
    Boxes { data: &'a [f32], rows: usize },
    /// Attribute-major grid: [4+nc] or [5+nc] attributes x N predictions
    /// (cx, cy, w, h, [objectness], class scores...).
    Grid {
        data: &'a [f32],
        attrs: usize,
        preds: usize,
        has_objectness: bool,
    },
}

impl<'a> RawOutput<'a> {
    /// Classify the tensor by shape. Returns `None` for anything
    /// unrecognized; the caller degrades that to zero detections.
    pub fn classify(shape: &[i64], data: &'a [f32], num_classes: usize) -> Option<Self> {
        // Strip leading batch dimensions of 1.
        let mut dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        while dims.len() > 2 && dims[0] == 1 {
            dims.remove(0);
        }
        if dims.len() != 2 {
            return None;
        }
        let (d0, d1) = (dims[0], dims[1]);
        if d0.checked_mul(d1)? != data.len() {
            return None;
        }
        if d0 == 4 + num_classes || d0 == 5 + num_classes {
            return Some(RawOutput::Grid {
                data,
                attrs: d0,
                preds: d1,
                has_objectness: d0 == 5 + num_classes,
            });
        }
        if d1 == 6 {
            return Some(RawOutput::Boxes { data, rows: d0 });
        }
        None
    }
}

/// Full post-processing pass: decode, filter to the target class, NMS,
/// inverse-map into original frame coordinates.
pub fn decode_detections(
    shape: &[i64],
    data: &[f32],
    letterbox: Letterbox,
    frame_w: usize,
    frame_h: usize,
    cfg: &DetectionConfig,
) -> Vec<Detection> {
    let Some(raw) = RawOutput::classify(shape, data, cfg.num_classes) else {
        debug!("unrecognized model output shape {:?}, treating as empty", shape);
        return Vec::new();
    };

    let candidates = match raw {
        RawOutput::Boxes { data, rows } => decode_box_rows(data, rows, cfg),
        RawOutput::Grid {
            data,
            attrs,
            preds,
            has_objectness,
        } => decode_grid(data, attrs, preds, has_objectness, cfg),
    };

    let kept = nms(candidates, cfg.iou_threshold);

    kept.into_iter()
        .map(|mut det| {
            // Reverse the letterbox transform and clip to frame bounds.
            for i in [0, 2] {
                det.bbox[i] =
                    ((det.bbox[i] - letterbox.pad_x) / letterbox.scale).clamp(0.0, frame_w as f32);
            }
            for i in [1, 3] {
                det.bbox[i] =
                    ((det.bbox[i] - letterbox.pad_y) / letterbox.scale).clamp(0.0, frame_h as f32);
            }
            det
        })
        .collect()
}

fn decode_box_rows(data: &[f32], rows: usize, cfg: &DetectionConfig) -> Vec<Detection> {
    let mut detections = Vec::new();
    for row in 0..rows {
        let r = &data[row * 6..row * 6 + 6];
        let confidence = squash(r[4]);
        let class_id = r[5].round().max(0.0) as usize;
        if class_id != cfg.target_class_id || confidence < cfg.confidence_threshold {
            continue;
        }
        detections.push(Detection {
            bbox: [r[0], r[1], r[2], r[3]],
            confidence,
            class_id,
        });
    }
    detections
}

fn decode_grid(
    data: &[f32],
    attrs: usize,
    preds: usize,
    has_objectness: bool,
    cfg: &DetectionConfig,
) -> Vec<Detection> {
    let class_base = if has_objectness { 5 } else { 4 };
    let class_row = class_base + cfg.target_class_id;
    if class_row >= attrs {
        return Vec::new();
    }

    let mut detections = Vec::new();
    for i in 0..preds {
        let mut confidence = squash(data[class_row * preds + i]);
        if has_objectness {
            confidence *= squash(data[4 * preds + i]);
        }
        if confidence < cfg.confidence_threshold {
            continue;
        }

        // Center form -> corner form.
        let cx = data[i];
        let cy = data[preds + i];
        let w = data[2 * preds + i];
        let h = data[3 * preds + i];
        detections.push(Detection {
            bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            confidence,
            class_id: cfg.target_class_id,
        });
    }
    detections
}

/// Scores already in [0,1] pass through untouched; raw logits get a
/// clamped logistic so thresholds stay meaningful.
fn squash(score: f32) -> f32 {
    if (0.0..=1.0).contains(&score) {
        score
    } else {
        let x = score.clamp(-SIGMOID_CLAMP, SIGMOID_CLAMP);
        1.0 / (1.0 + (-x).exp())
    }
}

/// Greedy non-max suppression. Sort is stable, so equal confidences keep
/// first-seen order.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return detections;
    }

    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    while !detections.is_empty() {
        let current = detections.remove(0);
        detections.retain(|det| iou(&current.bbox, &det.bbox) < iou_threshold);
        keep.push(current);
    }
    keep
}

pub fn iou(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
    let x1 = box1[0].max(box2[0]);
    let y1 = box1[1].max(box2[1]);
    let x2 = box1[2].min(box2[2]);
    let y2 = box1[3].min(box2[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area1 = (box1[2] - box1[0]) * (box1[3] - box1[1]);
    let area2 = (box2[2] - box2[0]) * (box2[3] - box2[1]);
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
