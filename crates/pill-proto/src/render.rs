use serde::{Deserialize, Serialize};

/// One surviving detection, in model input grid units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub score: f64,
}

/// Model input size; the overlay script scales boxes against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputGrid {
    pub width: u32,
    pub height: u32,
}

impl Default for InputGrid {
    fn default() -> Self {
        Self { width: 96, height: 96 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderModel {
    pub count: usize,
    pub image_path: String,
    pub boxes: Vec<DetectionBox>,
}

impl RenderModel {
    pub fn new(image_path: impl Into<String>, boxes: Vec<DetectionBox>) -> Self {
        Self { count: boxes.len(), image_path: image_path.into(), boxes }
    }
}
