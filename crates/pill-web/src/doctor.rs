use anyhow::{Context, Result};
use std::{net::SocketAddr, path::Path};

pub fn check_bind(bind: &str) -> Result<SocketAddr> {
    bind.parse::<SocketAddr>()
        .with_context(|| format!("server.bind is not host:port: {}", bind))
}

pub fn check_max_upload(max_mb: u64) -> Result<()> {
    anyhow::ensure!(max_mb >= 1, "server.max_upload_mb must be >= 1");
    anyhow::ensure!(max_mb <= 1024, "server.max_upload_mb too large; set <= 1024");
    Ok(())
}

pub fn check_upload_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        anyhow::ensure!(dir.is_dir(), "uploads.dir is not a dir: {}", dir.display());
        let meta = std::fs::metadata(dir)?;
        anyhow::ensure!(!meta.permissions().readonly(), "uploads.dir is read-only: {}", dir.display());
    }
    Ok(())
}
