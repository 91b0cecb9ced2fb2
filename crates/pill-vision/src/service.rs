use image::RgbImage;
use pill_proto::InputGrid;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::{DetectionResult, Detector, DetectorFactory, ModelInfo, VisionError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    /// One detector for the whole process, serialized behind a mutex.
    #[default]
    Shared,
    /// A fresh detector per request, stopped when the request is done.
    PerRequest,
}

/// Owns detector lifecycle. Calls block; run them on a blocking worker.
pub struct InferenceService {
    factory: Arc<dyn DetectorFactory>,
    lifecycle: Lifecycle,
    info: ModelInfo,
    shared: Mutex<Option<Box<dyn Detector>>>,
}

impl InferenceService {
    /// Starts a detector once to read model metadata. With `Shared` it is kept.
    pub fn start(factory: Arc<dyn DetectorFactory>, lifecycle: Lifecycle) -> Result<Self, VisionError> {
        let mut det = factory.start()?;
        let info = det.model_info().clone();

        let shared = match lifecycle {
            Lifecycle::Shared => Some(det),
            Lifecycle::PerRequest => {
                det.stop()?;
                None
            }
        };
        info!("vision: detector ready (lifecycle={:?})", lifecycle);

        Ok(Self { factory, lifecycle, info, shared: Mutex::new(shared) })
    }

    pub fn model_info(&self) -> &ModelInfo {
        &self.info
    }

    pub fn grid(&self) -> InputGrid {
        self.info.grid()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn detect(&self, img: &RgbImage) -> Result<DetectionResult, VisionError> {
        match self.lifecycle {
            Lifecycle::PerRequest => {
                let mut det = self.factory.start()?;
                let out = run(det.as_mut(), img);
                if let Err(e) = det.stop() {
                    warn!("vision: detector stop failed: {}", e);
                }
                out
            }
            Lifecycle::Shared => {
                let mut slot = self.shared.lock().unwrap_or_else(|e| e.into_inner());
                let mut det = match slot.take() {
                    Some(d) => d,
                    None => {
                        info!("vision: starting replacement detector");
                        self.factory.start()?
                    }
                };
                match run(det.as_mut(), img) {
                    Ok(res) => {
                        *slot = Some(det);
                        Ok(res)
                    }
                    Err(e) => {
                        // the instance may be wedged; the next request gets a new one
                        if let Err(se) = det.stop() {
                            warn!("vision: detector stop failed: {}", se);
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let mut slot = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut det) = slot.take() {
            match det.stop() {
                Ok(()) => info!("vision: detector stopped"),
                Err(e) => warn!("vision: detector stop failed: {}", e),
            }
        }
    }
}

fn run(det: &mut dyn Detector, img: &RgbImage) -> Result<DetectionResult, VisionError> {
    let features = det.extract_features(img);
    debug!("vision: extracted {} features", features.0.len());
    det.classify(&features)
}
