pub mod doctor;
pub mod eim;
pub mod features;
pub mod service;

use image::{ImageReader, RgbImage};
use pill_proto::{DetectionBox, InputGrid};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use eim::{EimFactory, EimRunner};
pub use service::{InferenceService, Lifecycle};

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("model artifact: {0}")]
    Model(String),
    #[error("runner did not start: {0}")]
    Start(String),
    #[error("runner i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("runner json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("runner protocol: {0}")]
    Protocol(String),
    #[error("runner reported: {0}")]
    Remote(String),
    #[error("detector already stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResizeMode {
    #[default]
    FitShortest,
    FitLongest,
    Squash,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParameters {
    pub image_input_width: u32,
    pub image_input_height: u32,
    #[serde(default = "default_channels")]
    pub image_channel_count: u32,
    #[serde(default)]
    pub image_resize_mode: ResizeMode,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub threshold: Option<f64>,
}

fn default_channels() -> u32 { 3 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: Option<String>,
    pub owner: Option<String>,
    pub id: Option<u64>,
    pub deploy_version: Option<u64>,
}

/// Metadata returned by the runner on hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_parameters: ModelParameters,
    #[serde(default)]
    pub project: ProjectInfo,
}

impl ModelInfo {
    pub fn grid(&self) -> InputGrid {
        InputGrid {
            width: self.model_parameters.image_input_width,
            height: self.model_parameters.image_input_height,
        }
    }
}

/// Packed pixels, one value per input grid cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FeatureVector(pub Vec<u32>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    #[serde(default)]
    pub label: String,
    pub value: f64,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionResult {
    #[serde(default)]
    pub bounding_boxes: Vec<BoundingBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<serde_json::Value>,
}

pub trait Detector: Send {
    fn model_info(&self) -> &ModelInfo;

    fn extract_features(&self, img: &RgbImage) -> FeatureVector {
        features::extract(img, &self.model_info().model_parameters)
    }

    fn classify(&mut self, features: &FeatureVector) -> Result<DetectionResult, VisionError>;

    /// Releases the model. Safe to call more than once.
    fn stop(&mut self) -> Result<(), VisionError>;
}

pub trait DetectorFactory: Send + Sync {
    fn start(&self) -> Result<Box<dyn Detector>, VisionError>;
}

/// Keeps boxes scoring strictly above `threshold`, in runner order.
pub fn filter_boxes(result: &DetectionResult, threshold: f64) -> Vec<DetectionBox> {
    result
        .bounding_boxes
        .iter()
        .filter(|b| b.value > threshold)
        .map(|b| DetectionBox { x: b.x, y: b.y, w: b.width, h: b.height, score: b.value })
        .collect()
}

/// Decodes by content, not by extension.
pub fn load_rgb(path: &Path) -> Result<RgbImage, image::ImageError> {
    Ok(ImageReader::open(path)?.with_guessed_format()?.decode()?.to_rgb8())
}
