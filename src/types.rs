use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub detection: DetectionConfig,
    pub stability: StabilityConfig,
    pub stream: StreamConfig,
    pub fetch: FetchConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: String,
    pub input_size: usize,
    pub num_threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: "models/yolo11n.onnx".to_string(),
            input_size: 640,
            num_threads: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub confidence_threshold: f32,
    /// Confidence needed to open occupancy on a single frame. Must not
    /// exceed `confidence_threshold`.
    pub fast_open_threshold: f32,
    pub iou_threshold: f32,
    pub target_class_id: usize,
    pub num_classes: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.35,
            fast_open_threshold: 0.30,
            iou_threshold: 0.45,
            target_class_id: 0, // COCO person
            num_classes: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Sliding window of raw per-frame counts.
    pub window_size: usize,
    /// Consecutive zero frames required to close occupancy. Clamped to
    /// `window_size` at load time.
    pub close_zero_run: usize,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            window_size: 8,
            close_zero_run: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub heartbeat_sec: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { heartbeat_sec: 15 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_sec: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { timeout_sec: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "subs.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: [f32; 4], // [x1, y1, x2, y2] in original image coordinates
    pub confidence: f32,
    pub class_id: usize,
}

/// What one polled frame contributes to the stability filter.
#[derive(Debug, Clone)]
pub struct FrameObservation {
    pub raw_count: u32,
    pub max_confidence: f32,
    pub confidences: Vec<f32>,
}

impl FrameObservation {
    pub fn from_detections(detections: &[Detection]) -> Self {
        let confidences: Vec<f32> = detections.iter().map(|d| d.confidence).collect();
        let max_confidence = confidences.iter().cloned().fold(0.0f32, f32::max);
        Self {
            raw_count: detections.len() as u32,
            max_confidence,
            confidences,
        }
    }
}
