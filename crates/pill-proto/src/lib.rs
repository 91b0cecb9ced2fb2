pub mod render;

pub use render::{DetectionBox, InputGrid, RenderModel};
