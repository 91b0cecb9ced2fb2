use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};

use pill_proto::RenderModel;
use pill_vision::{doctor as vision_doctor, filter_boxes, Detector, EimFactory, EimRunner, InferenceService, Lifecycle};
use pill_web::{doctor as web_doctor, spawn_retention, AppState, RetentionPolicy, UploadStore};

const DEFAULT_BIND: &str = "0.0.0.0:5000";
const DEFAULT_MAX_UPLOAD_MB: u64 = 32;
const DEFAULT_THRESHOLD: f64 = 0.6;
const DEFAULT_START_TIMEOUT_S: u64 = 30;
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_SWEEP_INTERVAL_S: u64 = 300;

#[derive(Debug, Parser)]
#[command(name = "pillcount", version, about = "pillcount - photo pill counter over an Edge Impulse model")]
struct Cli {
    #[arg(long, default_value = "pillcount.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the upload form and detection endpoints.
    Serve,
    Doctor,
    Model { #[command(subcommand)] cmd: ModelCmd },
    /// Detect pills in one image file and print the surviving boxes as JSON.
    Classify { image: PathBuf },
}

#[derive(Debug, Subcommand)]
enum ModelCmd { Inspect }

#[derive(Debug, serde::Deserialize)]
struct Config {
    #[serde(default)]
    server: ServerCfg,
    model: ModelCfg,
    #[serde(default)]
    uploads: UploadsCfg,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ServerCfg {
    bind: Option<String>,
    max_upload_mb: Option<u64>,
}

#[derive(Debug, serde::Deserialize)]
struct ModelCfg {
    path: PathBuf,
    threshold: Option<f64>,
    lifecycle: Option<Lifecycle>,
    start_timeout_s: Option<u64>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct UploadsCfg {
    dir: Option<PathBuf>,
    max_age_s: Option<u64>,
    max_total_mb: Option<u64>,
    sweep_interval_s: Option<u64>,
}

impl Config {
    fn bind(&self) -> &str {
        self.server.bind.as_deref().unwrap_or(DEFAULT_BIND)
    }

    fn max_upload_mb(&self) -> u64 {
        self.server.max_upload_mb.unwrap_or(DEFAULT_MAX_UPLOAD_MB)
    }

    fn threshold(&self) -> f64 {
        self.model.threshold.unwrap_or(DEFAULT_THRESHOLD)
    }

    fn lifecycle(&self) -> Lifecycle {
        self.model.lifecycle.unwrap_or_default()
    }

    fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.model.start_timeout_s.unwrap_or(DEFAULT_START_TIMEOUT_S))
    }

    fn upload_dir(&self) -> PathBuf {
        self.uploads.dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR))
    }

    fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age: self.uploads.max_age_s.map(Duration::from_secs),
            max_total_bytes: self.uploads.max_total_mb.map(|mb| mb * 1024 * 1024),
            ..Default::default()
        }
    }

    fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.uploads.sweep_interval_s.unwrap_or(DEFAULT_SWEEP_INTERVAL_S))
    }
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Serve => serve(&cfg).await?,
        Command::Doctor => doctor(&cfg)?,
        Command::Model { cmd } => model_cmd(&cfg, cmd)?,
        Command::Classify { image } => classify(&cfg, &image)?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    vision_doctor::check_model(&cfg.model.path)?;
    vision_doctor::check_threshold(cfg.threshold())?;
    anyhow::ensure!(cfg.start_timeout() > Duration::ZERO, "model.start_timeout_s must be > 0");

    web_doctor::check_bind(cfg.bind())?;
    web_doctor::check_max_upload(cfg.max_upload_mb())?;
    web_doctor::check_upload_dir(&cfg.upload_dir())?;

    let policy = cfg.retention();
    if policy.is_unbounded() {
        warn!("doctor: no uploads.max_age_s or uploads.max_total_mb; uploads are never removed");
    } else {
        anyhow::ensure!(cfg.sweep_interval() > Duration::ZERO, "uploads.sweep_interval_s must be > 0");
    }

    info!("doctor: lifecycle={:?} threshold={}", cfg.lifecycle(), cfg.threshold());
    info!("doctor: OK");
    Ok(())
}

fn model_cmd(cfg: &Config, cmd: ModelCmd) -> Result<()> {
    match cmd {
        ModelCmd::Inspect => {
            let mut runner = EimRunner::start(&cfg.model.path, cfg.start_timeout()).context("start model runner")?;
            let info = runner.model_info();
            let p = &info.model_parameters;

            println!("project: {}", info.project.name.as_deref().unwrap_or("-"));
            println!("owner: {}", info.project.owner.as_deref().unwrap_or("-"));
            println!("deploy_version: {}", info.project.deploy_version.map(|v| v.to_string()).unwrap_or_else(|| "-".into()));
            println!("model_type: {}", p.model_type.as_deref().unwrap_or("-"));
            println!("input: {}x{}x{} resize={:?}", p.image_input_width, p.image_input_height, p.image_channel_count, p.image_resize_mode);
            println!("labels: {}", p.labels.join(", "));
            if let Some(t) = p.threshold {
                println!("model threshold: {} (serving uses {})", t, cfg.threshold());
            }

            runner.stop().context("stop model runner")?;
            Ok(())
        }
    }
}

fn classify(cfg: &Config, image: &std::path::Path) -> Result<()> {
    let img = pill_vision::load_rgb(image).with_context(|| format!("decode {}", image.display()))?;

    let mut runner = EimRunner::start(&cfg.model.path, cfg.start_timeout()).context("start model runner")?;
    let features = runner.extract_features(&img);
    let result = runner.classify(&features);
    if let Err(e) = runner.stop() {
        warn!("classify: runner stop failed: {}", e);
    }
    let result = result.context("classify")?;

    let boxes = filter_boxes(&result, cfg.threshold());
    info!("classify: {} of {} boxes above {}", boxes.len(), result.bounding_boxes.len(), cfg.threshold());

    let out = RenderModel::new(image.display().to_string(), boxes);
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn serve(cfg: &Config) -> Result<()> {
    info!("serve: starting");

    let addr = web_doctor::check_bind(cfg.bind())?;
    vision_doctor::check_threshold(cfg.threshold())?;
    let threshold = cfg.threshold();

    let store = UploadStore::open(cfg.upload_dir())
        .await
        .with_context(|| format!("create upload dir {}", cfg.upload_dir().display()))?;

    // model boot spawns a process and waits on its socket
    let factory = Arc::new(EimFactory::new(cfg.model.path.clone(), cfg.start_timeout()));
    let lifecycle = cfg.lifecycle();
    let inference = tokio::task::spawn_blocking(move || InferenceService::start(factory, lifecycle))
        .await?
        .context("start detector")?;
    let inference = Arc::new(inference);
    let grid = inference.grid();
    info!("serve: model input {}x{}, threshold {}", grid.width, grid.height, threshold);

    let retention = spawn_retention(store.clone(), cfg.retention(), cfg.sweep_interval());

    let state = Arc::new(AppState { inference: inference.clone(), store, threshold });
    let max_upload_bytes = usize::try_from(cfg.max_upload_mb() * 1024 * 1024).context("server.max_upload_mb")?;
    let app = pill_web::router(state, max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!("serve: listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    if let Some(h) = retention {
        h.abort();
    }
    tokio::task::spawn_blocking(move || inference.shutdown()).await?;
    info!("serve: stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("serve: ctrl-c, shutting down"),
        Err(e) => warn!("serve: cannot listen for ctrl-c: {}", e),
    }
}
