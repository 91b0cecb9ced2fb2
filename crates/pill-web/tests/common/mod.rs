#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Request, Response, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use pill_vision::{
    BoundingBox, DetectionResult, Detector, DetectorFactory, FeatureVector, InferenceService,
    Lifecycle, ModelInfo, ModelParameters, ProjectInfo, ResizeMode, VisionError,
};
use pill_web::{AppState, UploadStore};
use std::{
    io::Cursor,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tower::ServiceExt;

pub const BOUNDARY: &str = "pillcount-test-boundary";
const DEFAULT_LIMIT: usize = 32 * 1024 * 1024;

/// What the fake runner answers, adjustable between requests.
#[derive(Default)]
pub struct Script {
    pub scores: Vec<f64>,
    pub fail: bool,
}

pub struct Fake {
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub classified: AtomicUsize,
    pub script: Mutex<Script>,
    pub grid: (u32, u32),
}

impl Fake {
    pub fn new(scores: &[f64]) -> Arc<Self> {
        Self::with_grid(scores, 96, 96)
    }

    pub fn with_grid(scores: &[f64], w: u32, h: u32) -> Arc<Self> {
        Arc::new(Self {
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            classified: AtomicUsize::new(0),
            script: Mutex::new(Script { scores: scores.to_vec(), fail: false }),
            grid: (w, h),
        })
    }

    pub fn set_fail(&self, fail: bool) {
        self.script.lock().unwrap().fail = fail;
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

struct FakeFactory(Arc<Fake>);

struct FakeDetector {
    fake: Arc<Fake>,
    info: ModelInfo,
    stopped: bool,
}

impl DetectorFactory for FakeFactory {
    fn start(&self) -> Result<Box<dyn Detector>, VisionError> {
        self.0.started.fetch_add(1, Ordering::SeqCst);
        let (w, h) = self.0.grid;
        Ok(Box::new(FakeDetector {
            fake: self.0.clone(),
            info: ModelInfo {
                model_parameters: ModelParameters {
                    image_input_width: w,
                    image_input_height: h,
                    image_channel_count: 3,
                    image_resize_mode: ResizeMode::FitShortest,
                    labels: vec!["pill".into()],
                    model_type: Some("constrained_object_detection".into()),
                    threshold: Some(0.5),
                },
                project: ProjectInfo::default(),
            },
            stopped: false,
        }))
    }
}

impl Detector for FakeDetector {
    fn model_info(&self) -> &ModelInfo {
        &self.info
    }

    fn classify(&mut self, features: &FeatureVector) -> Result<DetectionResult, VisionError> {
        let (w, h) = self.fake.grid;
        assert_eq!(features.0.len(), (w * h) as usize);
        self.fake.classified.fetch_add(1, Ordering::SeqCst);

        let script = self.fake.script.lock().unwrap();
        if script.fail {
            return Err(VisionError::Remote("classifier crashed".into()));
        }
        let bounding_boxes = script
            .scores
            .iter()
            .enumerate()
            .map(|(i, &value)| BoundingBox {
                label: "pill".into(),
                value,
                x: 8.0 * i as f32,
                y: 16.0,
                width: 8.0,
                height: 8.0,
            })
            .collect();
        Ok(DetectionResult { bounding_boxes, timing: None })
    }

    fn stop(&mut self) -> Result<(), VisionError> {
        if !self.stopped {
            self.stopped = true;
            self.fake.stopped.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub fake: Arc<Fake>,
    pub store: UploadStore,
    pub tmp: tempfile::TempDir,
}

impl TestApp {
    pub async fn new(fake: Arc<Fake>, lifecycle: Lifecycle) -> Self {
        Self::build(fake, lifecycle, DEFAULT_LIMIT, 0.6).await
    }

    pub async fn with_limit(fake: Arc<Fake>, lifecycle: Lifecycle, max_upload_bytes: usize) -> Self {
        Self::build(fake, lifecycle, max_upload_bytes, 0.6).await
    }

    pub async fn with_threshold(fake: Arc<Fake>, threshold: f64) -> Self {
        Self::build(fake, Lifecycle::Shared, DEFAULT_LIMIT, threshold).await
    }

    async fn build(fake: Arc<Fake>, lifecycle: Lifecycle, max_upload_bytes: usize, threshold: f64) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let store = UploadStore::open(tmp.path().join("uploads")).await.unwrap();
        let inference = InferenceService::start(Arc::new(FakeFactory(fake.clone())), lifecycle).unwrap();
        let state = Arc::new(AppState { inference: Arc::new(inference), store: store.clone(), threshold });
        let router = pill_web::router(state, max_upload_bytes);
        Self { router, fake, store, tmp }
    }

    pub async fn send(&self, req: Request<Body>) -> (StatusCode, Vec<u8>, Response<Body>) {
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let (parts, body) = resp.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes().to_vec();
        (status, bytes, Response::from_parts(parts, Body::empty()))
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>, Response<Body>) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn upload(&self, uri: &str, field: &str, bytes: &[u8]) -> (StatusCode, String) {
        let (status, body, _) = self.send(multipart_request(uri, field, bytes)).await;
        (status, String::from_utf8(body).unwrap())
    }
}

pub fn multipart_request(uri: &str, field: &str, bytes: &[u8]) -> Request<Body> {
    let headers = format!(
        "Content-Disposition: form-data; name=\"{}\"; filename=\"photo.png\"\r\nContent-Type: image/png\r\n\r\n",
        field
    );
    multipart_with_headers(uri, &headers, bytes)
}

/// A plain form field: no filename, no content type.
pub fn text_field_request(uri: &str, field: &str, value: &str) -> Request<Body> {
    let headers = format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", field);
    multipart_with_headers(uri, &headers, value.as_bytes())
}

fn multipart_with_headers(uri: &str, part_headers: &str, bytes: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(part_headers.as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    Request::post(uri)
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
        .body(Body::from(body))
        .unwrap()
}

pub fn png(w: u32, h: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(w, h, |x, y| image::Rgb([(x * 7) as u8, (y * 5) as u8, 90]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}
