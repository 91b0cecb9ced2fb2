use anyhow::Result;
use std::path::Path;

pub fn check_model(path: &Path) -> Result<()> {
    anyhow::ensure!(path.exists(), "model.path does not exist: {}", path.display());
    let meta = std::fs::metadata(path)?;
    anyhow::ensure!(meta.is_file(), "model.path is not a file: {}", path.display());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        anyhow::ensure!(
            meta.permissions().mode() & 0o111 != 0,
            "model.path is not executable; run `chmod +x {}`",
            path.display()
        );
    }
    Ok(())
}

pub fn check_threshold(threshold: f64) -> Result<()> {
    anyhow::ensure!((0.0..=1.0).contains(&threshold), "model.threshold must be within 0.0..=1.0");
    Ok(())
}
