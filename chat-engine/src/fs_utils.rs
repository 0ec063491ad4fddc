//! File System Utilities
//!
//! Directory creation and crash-safe file replacement for the state file.

use crate::{ChatError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Ensure parent directory exists, creating it if necessary
///
/// # Errors
///
/// Returns `Persistence` if the directory cannot be created.
pub async fn ensure_parent_dir(file_path: impl AsRef<Path>) -> Result<()> {
    let file_path = file_path.as_ref();

    if let Some(parent) = file_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            debug!("Creating parent directory: {}", parent.display());

            fs::create_dir_all(parent).await.map_err(|e| {
                ChatError::from_io_error(e, &format!("creating directory {}", parent.display()))
            })?;
        }
    }

    Ok(())
}

/// Sibling path used while writing `path`
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` with `data`
///
/// The data goes to a temporary sibling first and is renamed over the target, so readers see
/// either the old or the new contents.
pub async fn write_atomic(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    ensure_parent_dir(path).await?;

    let temp_path = temp_path_for(path);
    let result = write_and_sync(&temp_path, data).await;
    if let Err(e) = result {
        cleanup_partial_file(&temp_path).await;
        return Err(e);
    }

    if let Err(e) = fs::rename(&temp_path, path).await {
        cleanup_partial_file(&temp_path).await;
        return Err(ChatError::from_io_error(
            e,
            &format!("replacing {}", path.display()),
        ));
    }

    debug!("Wrote {} bytes to {}", data.len(), path.display());
    Ok(())
}

async fn write_and_sync(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| ChatError::from_io_error(e, &format!("creating file {}", path.display())))?;
    file.write_all(data)
        .await
        .map_err(|e| ChatError::from_io_error(e, &format!("writing {}", path.display())))?;
    file.sync_all()
        .await
        .map_err(|e| ChatError::from_io_error(e, &format!("syncing {}", path.display())))?;
    Ok(())
}

/// Read a file, mapping "not found" to `None`
pub async fn read_if_exists(path: impl AsRef<Path>) -> Result<Option<Vec<u8>>> {
    let path = path.as_ref();
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ChatError::from_io_error(
            e,
            &format!("reading {}", path.display()),
        )),
    }
}

/// Clean up partial file on error
///
/// Logs errors but doesn't fail.
pub async fn cleanup_partial_file(path: impl AsRef<Path>) {
    let path = path.as_ref();

    if path.exists() {
        if let Err(e) = fs::remove_file(path).await {
            warn!("Failed to clean up partial file {}: {}", path.display(), e);
        } else {
            debug!("Cleaned up partial file: {}", path.display());
        }
    }
}
