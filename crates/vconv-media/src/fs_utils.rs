//! Filesystem helpers for pipeline artifacts.

use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;

use crate::error::{MediaError, MediaResult};

/// Remove a file, treating "already gone" as success.
///
/// Returns `true` if a file was removed.
pub async fn remove_file_if_exists(path: impl AsRef<Path>) -> MediaResult<bool> {
    match fs::remove_file(path.as_ref()).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(MediaError::from(e)),
    }
}

/// Recreate `dir` empty, removing anything a previous attempt left behind.
pub async fn reset_dir(dir: impl AsRef<Path>) -> MediaResult<()> {
    let dir = dir.as_ref();
    let output_err = |source| MediaError::OutputDir {
        path: dir.to_path_buf(),
        source,
    };

    match fs::remove_dir_all(dir).await {
        Ok(()) => {
            tracing::debug!("Cleared previous output in {}", dir.display());
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(output_err(e)),
    }

    fs::create_dir_all(dir).await.map_err(output_err)
}
