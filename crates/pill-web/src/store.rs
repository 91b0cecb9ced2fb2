use std::{
    io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};

const UPLOAD_EXT: &str = "jpg";
const MAX_NAME_ATTEMPTS: u32 = 1000;
/// Uploads younger than this are never swept; a request may still be decoding them.
pub const DEFAULT_SWEEP_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_total_bytes: Option<u64>,
    pub grace: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { max_age: None, max_total_bytes: None, grace: DEFAULT_SWEEP_GRACE }
    }
}

impl RetentionPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.max_age.is_none() && self.max_total_bytes.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

impl UploadStore {
    pub async fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `bytes` as `<unix-ms>.jpg`, whatever the actual format.
    /// Uploads landing within the same millisecond get `-1`, `-2`, ... suffixes.
    pub async fn save(&self, bytes: &[u8]) -> io::Result<StoredUpload> {
        let ms = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        for n in 0..MAX_NAME_ATTEMPTS {
            let name = if n == 0 {
                format!("{}.{}", ms, UPLOAD_EXT)
            } else {
                format!("{}-{}.{}", ms, n, UPLOAD_EXT)
            };
            let path = self.dir.join(&name);
            let mut f = match fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            };
            f.write_all(bytes).await?;
            f.flush().await?;
            debug!("uploads: wrote {} ({} bytes)", path.display(), bytes.len());
            return Ok(StoredUpload { name, path });
        }
        Err(io::Error::new(io::ErrorKind::AlreadyExists, format!("no free upload name for {}", ms)))
    }

    /// Drops expired files, then the oldest ones until the directory fits the size cap.
    /// Files inside the grace window are kept even if that leaves the directory over the cap.
    pub async fn sweep(&self, policy: &RetentionPolicy) -> io::Result<SweepReport> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(ent) = entries.next_entry().await? {
            let Some(meta) = vanished_ok(ent.metadata().await)? else { continue; };
            if !meta.is_file() { continue; }
            files.push((ent.path(), meta.modified()?, meta.len()));
        }
        files.sort_by_key(|(_, modified, _)| *modified);

        let now = SystemTime::now();
        let mut report = SweepReport { remaining_bytes: files.iter().map(|f| f.2).sum(), ..Default::default() };

        for (path, modified, len) in files {
            let age = now.duration_since(modified).unwrap_or_default();
            if age < policy.grace { break; }

            let expired = match policy.max_age {
                Some(max) => age > max,
                None => false,
            };
            let oversize = policy.max_total_bytes.map(|max| report.remaining_bytes > max).unwrap_or(false);
            // oldest first: once this file survives, every newer one does too
            if !expired && !oversize { break; }

            match vanished_ok(fs::remove_file(&path).await) {
                Ok(Some(())) => {
                    report.removed += 1;
                    report.freed_bytes += len;
                    report.remaining_bytes -= len;
                }
                Ok(None) => report.remaining_bytes -= len,
                Err(e) => warn!("uploads: could not remove {}: {}", path.display(), e),
            }
        }
        Ok(report)
    }
}

// entries can disappear between listing and use (operator, overlapping sweep)
fn vanished_ok<T>(res: io::Result<T>) -> io::Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Periodic sweep; `None` when the policy keeps everything.
pub fn spawn_retention(
    store: UploadStore,
    policy: RetentionPolicy,
    every: Duration,
) -> Option<tokio::task::JoinHandle<()>> {
    if policy.is_unbounded() {
        info!("uploads: no retention policy, files in {} accumulate", store.dir().display());
        return None;
    }

    Some(tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tick.tick().await;
            match store.sweep(&policy).await {
                Ok(r) if r.removed > 0 => info!(
                    "uploads: swept {} files ({} bytes), {} bytes kept",
                    r.removed, r.freed_bytes, r.remaining_bytes
                ),
                Ok(_) => {}
                Err(e) => warn!("uploads: sweep failed: {}", e),
            }
        }
    }))
}
