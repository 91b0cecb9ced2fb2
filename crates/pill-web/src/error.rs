use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use pill_vision::VisionError;
use tracing::{error, warn};

pub const MISSING_UPLOAD: &str = "No image uploaded";
pub const INTERNAL: &str = "Internal Server Error";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("no image field in request")]
    MissingUpload,
    #[error("multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("upload store: {0}")]
    Storage(#[from] std::io::Error),
    #[error("decode upload: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector: {0}")]
    Collaborator(#[from] VisionError),
    #[error("blocking worker: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::MissingUpload => (StatusCode::BAD_REQUEST, MISSING_UPLOAD).into_response(),
            AppError::Multipart(e) => {
                warn!("predict: rejected multipart body: {}", e);
                (e.status(), e.body_text()).into_response()
            }
            AppError::Storage(e) => {
                error!(kind = "storage", "predict: {}", e);
                internal()
            }
            AppError::Decode(e) => {
                error!(kind = "decode", "predict: upload is not a readable image: {}", e);
                internal()
            }
            AppError::Collaborator(e) => {
                error!(kind = "collaborator", "predict: {}", e);
                internal()
            }
            AppError::Worker(e) => {
                error!(kind = "worker", "predict: {}", e);
                internal()
            }
        }
    }
}

fn internal() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL).into_response()
}
