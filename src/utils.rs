use std::path::Path;

use anyhow::{Result, anyhow};
use log::{debug, error, info};
use tokio::fs;

/// Creates `path` and its parents when missing. Idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        if let Err(e) = fs::create_dir_all(path).await {
            error!("Failed to create directory at {:?}: {}", path, e);
            return Err(e.into());
        }
        info!("Created directory at: {:?}", path);
    }
    Ok(())
}

/// Writes `contents` next to `path` and renames it into place, so a crash
/// mid-write never leaves a truncated file behind.
pub async fn write_file_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("{:?} has no parent directory", path))?;
    ensure_directory_exists(parent).await?;

    let mut tmp_name = path
        .file_name()
        .ok_or_else(|| anyhow!("{:?} has no file name", path))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);

    fs::write(&tmp_path, contents).await?;
    fs::rename(&tmp_path, path).await?;
    debug!("Wrote {} bytes to {:?}", contents.len(), path);
    Ok(())
}
