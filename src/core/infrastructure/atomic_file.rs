//! Whole-file replacement that never leaves a half-written target behind.

use crate::PveKubeResult;
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};

/// Writes `bytes` to a sibling temp file, then renames it over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> PveKubeResult<()> {
    replace(path, bytes, 0o666).await
}

/// Like [`write_atomic`], but the file is readable by its owner only from
/// the moment it is created.
pub(crate) async fn write_private(path: &Path, bytes: &[u8]) -> PveKubeResult<()> {
    replace(path, bytes, 0o600).await
}

async fn replace(path: &Path, bytes: &[u8], mode: u32) -> PveKubeResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let temp = temp_path(path);
    // left behind by an interrupted run of this process id
    remove_if_exists(&temp).await?;

    let written = async {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;
        let mut file = options.open(&temp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        fs::rename(&temp, path).await
    }
    .await;
    if let Err(error) = written {
        let _ = fs::remove_file(&temp).await;
        return Err(error.into());
    }
    Ok(())
}

/// Reads a file, mapping "not found" to `None`.
pub(crate) async fn read_optional(path: &Path) -> PveKubeResult<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error.into()),
    }
}

/// Removes a file; a missing file is fine.
pub(crate) async fn remove_if_exists(path: &Path) -> PveKubeResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp-{}", std::process::id()));
    path.with_file_name(name)
}
