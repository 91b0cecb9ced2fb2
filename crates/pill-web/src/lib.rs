pub mod doctor;
pub mod error;
pub mod page;
pub mod store;

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::Html,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use pill_proto::{InputGrid, RenderModel};
use pill_vision::{filter_boxes, DetectionResult, InferenceService, Lifecycle, ModelInfo};
use serde::Serialize;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tracing::{debug, info};

pub use error::AppError;
pub use store::{spawn_retention, RetentionPolicy, StoredUpload, UploadStore};

/// Multipart field carrying the photo.
pub const IMAGE_FIELD: &str = "image";

pub struct AppState {
    pub inference: Arc<InferenceService>,
    pub store: UploadStore,
    pub threshold: f64,
}

#[derive(Debug, Serialize)]
struct PredictResponse {
    #[serde(flatten)]
    model: RenderModel,
    grid: InputGrid,
}

#[derive(Debug, Serialize)]
struct InfoResponse {
    model: ModelInfo,
    grid: InputGrid,
    threshold: f64,
    lifecycle: Lifecycle,
}

pub fn router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    let uploads = ServeDir::new(state.store.dir());

    Router::new()
        .route("/", get(index))
        .route("/predict", post(predict_page))
        .route("/api/predict", post(predict_json))
        .route("/info", get(model_info))
        .route("/health", get(health))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .nest_service("/uploads", uploads)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(page::render_page(None, state.inference.grid()))
}

async fn predict_page(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Html<String>, AppError> {
    let model = predict(&state, multipart).await?;
    Ok(Html(page::render_page(Some(&model), state.inference.grid())))
}

async fn predict_json(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, AppError> {
    let model = predict(&state, multipart).await?;
    Ok(Json(PredictResponse { model, grid: state.inference.grid() }))
}

async fn model_info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        model: state.inference.model_info().clone(),
        grid: state.inference.grid(),
        threshold: state.threshold,
        lifecycle: state.inference.lifecycle(),
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Save, decode, detect, filter. Decode and inference block, so they run off the reactor.
async fn predict(
    state: &Arc<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<RenderModel, AppError> {
    let mut multipart = multipart.map_err(|rej| {
        debug!("predict: not a multipart body: {}", rej);
        AppError::MissingUpload
    })?;
    let bytes = image_field(&mut multipart).await?;

    let upload = state.store.save(&bytes).await?;
    info!("predict: stored {} ({} bytes)", upload.name, bytes.len());

    let inference = state.inference.clone();
    let path = upload.path.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<DetectionResult, AppError> {
        let img = pill_vision::load_rgb(&path)?;
        Ok(inference.detect(&img)?)
    })
    .await??;

    let boxes = filter_boxes(&result, state.threshold);
    info!(
        "predict: {} of {} boxes above {}",
        boxes.len(),
        result.bounding_boxes.len(),
        state.threshold
    );
    Ok(RenderModel::new(format!("uploads/{}", upload.name), boxes))
}

async fn image_field(multipart: &mut Multipart) -> Result<Bytes, AppError> {
    while let Some(field) = multipart.next_field().await? {
        // only file parts count; a text field named `image` is not an upload
        if field.name() != Some(IMAGE_FIELD) || field.file_name().is_none() {
            continue;
        }
        let bytes = field.bytes().await?;
        // a browser sends an empty part when no file was picked
        if bytes.is_empty() {
            return Err(AppError::MissingUpload);
        }
        return Ok(bytes);
    }
    Err(AppError::MissingUpload)
}
