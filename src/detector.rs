// ONNX person detection: letterbox preprocessing, session run, and the
// blocking-pool analyzer the worker loops call into.

use crate::postprocess::{decode_detections, Letterbox, PAD_FILL};
use crate::types::{Detection, DetectionConfig, FrameObservation, ModelConfig};
use crate::worker::{FrameAnalyzer, PollError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{imageops, Rgb, RgbImage};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

pub struct YoloDetector {
    session: Session,
    model: ModelConfig,
    detection: DetectionConfig,
}

impl YoloDetector {
    pub fn new(model: &ModelConfig, detection: &DetectionConfig) -> Result<Self> {
        info!("Loading detection model: {}", model.path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(model.num_threads)?
            .commit_from_file(&model.path)
            .context("failed to load ONNX model")?;

        info!("✓ Detection model ready");
        Ok(Self {
            session,
            model: model.clone(),
            detection: detection.clone(),
        })
    }

    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, PollError> {
        let frame_w = frame.width() as usize;
        let frame_h = frame.height() as usize;
        let size = self.model.input_size;
        let letterbox = Letterbox::fit(frame_w, frame_h, size);
        let input = preprocess(frame, letterbox, size);

        let shape = [1, 3, size, size];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))
                .map_err(|e| PollError::Inference(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs!["images" => input_value])
            .map_err(|e| PollError::Inference(e.to_string()))?;
        let (out_shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| PollError::Inference(e.to_string()))?;

        let detections =
            decode_detections(out_shape, data, letterbox, frame_w, frame_h, &self.detection);
        debug!("{} person(s) after post-processing", detections.len());
        Ok(detections)
    }
}

/// Letterbox into a gray square canvas, then HWC u8 -> CHW f32 in [0, 1].
fn preprocess(frame: &RgbImage, letterbox: Letterbox, target: usize) -> Vec<f32> {
    let scaled_w = ((frame.width() as f32 * letterbox.scale) as u32).max(1);
    let scaled_h = ((frame.height() as f32 * letterbox.scale) as u32).max(1);
    let resized = imageops::resize(frame, scaled_w, scaled_h, imageops::FilterType::Triangle);

    let mut canvas = RgbImage::from_pixel(target as u32, target as u32, Rgb([PAD_FILL; 3]));
    imageops::replace(
        &mut canvas,
        &resized,
        letterbox.pad_x as i64,
        letterbox.pad_y as i64,
    );

    let mut input = vec![0.0f32; 3 * target * target];
    for (x, y, pixel) in canvas.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            input[c * target * target + y * target + x] = pixel[c] as f32 / 255.0;
        }
    }
    input
}

/// Production `FrameAnalyzer`: image decode plus ONNX inference, both
/// CPU-bound, offloaded to the blocking pool so worker loops never stall
/// the scheduler.
pub struct OnnxAnalyzer {
    detector: Arc<Mutex<YoloDetector>>,
}

impl OnnxAnalyzer {
    pub fn new(detector: YoloDetector) -> Self {
        Self {
            detector: Arc::new(Mutex::new(detector)),
        }
    }
}

#[async_trait]
impl FrameAnalyzer for OnnxAnalyzer {
    async fn analyze(&self, image_bytes: Vec<u8>) -> Result<FrameObservation, PollError> {
        let detector = Arc::clone(&self.detector);
        tokio::task::spawn_blocking(move || {
            let frame = image::load_from_memory(&image_bytes)
                .map_err(|e| PollError::Decode(e.to_string()))?
                .to_rgb8();
            let mut detector = detector
                .lock()
                .map_err(|_| PollError::Inference("model session lock poisoned".to_string()))?;
            let detections = detector.detect(&frame)?;
            Ok(FrameObservation::from_detections(&detections))
        })
        .await
        .map_err(|e| PollError::Inference(format!("inference task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_pads_with_neutral_gray() {
        // 2:1 frame in a square input: top and bottom rows are padding.
        let frame = RgbImage::from_pixel(8, 4, Rgb([255, 0, 0]));
        let letterbox = Letterbox::fit(8, 4, 8);
        let input = preprocess(&frame, letterbox, 8);
        assert_eq!(input.len(), 3 * 8 * 8);

        let expected_pad = PAD_FILL as f32 / 255.0;
        // Corner pixel (0,0) sits in the padding band.
        assert!((input[0] - expected_pad).abs() < 1e-6);
        // Center pixel (4,4) is image content: pure red.
        let center = 4 * 8 + 4;
        assert!((input[center] - 1.0).abs() < 1e-6); // R plane
        assert!(input[8 * 8 + center].abs() < 1e-6); // G plane
    }

    #[test]
    fn preprocess_values_stay_normalized() {
        let frame = RgbImage::from_pixel(3, 5, Rgb([17, 200, 255]));
        let letterbox = Letterbox::fit(3, 5, 16);
        let input = preprocess(&frame, letterbox, 16);
        assert!(input.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }
}
