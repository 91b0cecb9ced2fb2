use serde::{Deserialize, Serialize};
use std::{
    io::{BufRead, BufReader, Read, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::{DetectionResult, Detector, DetectorFactory, FeatureVector, ModelInfo, VisionError};

const SOCKET_POLL: Duration = Duration::from_millis(100);

#[derive(Serialize)]
struct HelloMsg {
    hello: u8,
    id: u64,
}

#[derive(Serialize)]
struct ClassifyMsg<'a> {
    classify: &'a [u32],
    id: u64,
}

#[derive(Deserialize)]
struct ClassifyResp {
    result: DetectionResult,
    #[serde(default)]
    timing: Option<serde_json::Value>,
}

/// Request/response client for the runner socket.
/// Requests are bare JSON objects; responses are JSON terminated by a NUL byte.
pub struct EimClient<S: Read + Write> {
    stream: BufReader<S>,
    next_id: u64,
}

impl<S: Read + Write> EimClient<S> {
    pub fn new(stream: S) -> Self {
        Self { stream: BufReader::new(stream), next_id: 0 }
    }

    pub fn hello(&mut self) -> Result<ModelInfo, VisionError> {
        let id = self.alloc_id();
        let resp = self.request(&HelloMsg { hello: 1, id }, id)?;
        Ok(serde_json::from_value(resp)?)
    }

    pub fn classify(&mut self, features: &FeatureVector) -> Result<DetectionResult, VisionError> {
        let id = self.alloc_id();
        let resp = self.request(&ClassifyMsg { classify: &features.0, id }, id)?;
        let ClassifyResp { mut result, timing } = serde_json::from_value(resp)?;
        result.timing = timing;
        Ok(result)
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn request<T: Serialize>(&mut self, msg: &T, id: u64) -> Result<serde_json::Value, VisionError> {
        let payload = serde_json::to_vec(msg)?;
        let s = self.stream.get_mut();
        s.write_all(&payload)?;
        s.flush()?;

        let mut buf = Vec::new();
        self.stream.read_until(0, &mut buf)?;
        if buf.pop() != Some(0) {
            return Err(VisionError::Protocol("runner closed the socket mid-response".into()));
        }

        let resp: serde_json::Value = serde_json::from_slice(&buf)?;
        if let Some(rid) = resp.get("id").and_then(|v| v.as_u64()) {
            if rid != id {
                return Err(VisionError::Protocol(format!("response id {} for request {}", rid, id)));
            }
        }
        if !resp.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
            let msg = resp.get("error").and_then(|v| v.as_str()).unwrap_or("no error message");
            return Err(VisionError::Remote(msg.to_string()));
        }
        Ok(resp)
    }
}

/// A running `.eim` model: the child process, its socket and the tempdir holding it.
pub struct EimRunner {
    client: Option<EimClient<UnixStream>>,
    child: Option<Child>,
    sock_dir: Option<TempDir>,
    info: ModelInfo,
}

impl EimRunner {
    pub fn start(model_path: &Path, start_timeout: Duration) -> Result<Self, VisionError> {
        crate::doctor::check_model(model_path).map_err(|e| VisionError::Model(format!("{:#}", e)))?;

        let sock_dir = tempfile::Builder::new().prefix("pillcount-eim").tempdir()?;
        let sock = sock_dir.path().join("runner.sock");

        debug!("eim: spawning {} {}", model_path.display(), sock.display());
        let mut child = Command::new(model_path)
            .arg(&sock)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;

        let (client, info) = match connect(&mut child, &sock, start_timeout) {
            Ok(v) => v,
            Err(e) => {
                reap(&mut child);
                return Err(e);
            }
        };

        info!(
            "eim: model loaded: {} ({}x{}x{}, labels={:?})",
            info.project.name.as_deref().unwrap_or("unnamed"),
            info.model_parameters.image_input_width,
            info.model_parameters.image_input_height,
            info.model_parameters.image_channel_count,
            info.model_parameters.labels,
        );

        Ok(Self { client: Some(client), child: Some(child), sock_dir: Some(sock_dir), info })
    }
}

fn connect(
    child: &mut Child,
    sock: &Path,
    start_timeout: Duration,
) -> Result<(EimClient<UnixStream>, ModelInfo), VisionError> {
    let began = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(VisionError::Start(format!("runner exited early ({})", status)));
        }
        if sock.exists() { break; }
        if began.elapsed() >= start_timeout {
            return Err(VisionError::Start(format!(
                "socket {} not ready after {:?}",
                sock.display(),
                start_timeout
            )));
        }
        std::thread::sleep(SOCKET_POLL);
    }

    let mut client = EimClient::new(UnixStream::connect(sock)?);
    let info = client.hello()?;
    Ok((client, info))
}

fn reap(child: &mut Child) {
    if let Ok(None) = child.try_wait() {
        let _ = child.kill();
    }
    let _ = child.wait();
}

impl Detector for EimRunner {
    fn model_info(&self) -> &ModelInfo {
        &self.info
    }

    fn classify(&mut self, features: &FeatureVector) -> Result<DetectionResult, VisionError> {
        let client = self.client.as_mut().ok_or(VisionError::Stopped)?;
        let started = Instant::now();
        let res = client.classify(features)?;
        debug!(
            "eim: classify {} features -> {} boxes in {:.2?}",
            features.0.len(),
            res.bounding_boxes.len(),
            started.elapsed()
        );
        Ok(res)
    }

    fn stop(&mut self) -> Result<(), VisionError> {
        // dropping the client closes the socket
        self.client = None;
        if let Some(mut child) = self.child.take() {
            if child.try_wait()?.is_none() {
                child.kill()?;
            }
            let status = child.wait()?;
            debug!("eim: runner stopped ({})", status);
        }
        if let Some(dir) = self.sock_dir.take() {
            dir.close()?;
        }
        Ok(())
    }
}

impl Drop for EimRunner {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("eim: stop failed: {}", e);
        }
    }
}

#[derive(Debug, Clone)]
pub struct EimFactory {
    pub model_path: PathBuf,
    pub start_timeout: Duration,
}

impl EimFactory {
    pub fn new(model_path: impl Into<PathBuf>, start_timeout: Duration) -> Self {
        Self { model_path: model_path.into(), start_timeout }
    }
}

impl DetectorFactory for EimFactory {
    fn start(&self) -> Result<Box<dyn Detector>, VisionError> {
        Ok(Box::new(EimRunner::start(&self.model_path, self.start_timeout)?))
    }
}
