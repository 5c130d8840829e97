//! Crash-safe file replacement.
//!
//! A write goes to `<file>.tmp`, is fsynced, then renamed over the canonical
//! file. Readers see either the old or the new contents, never a mix.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

/// Path of the temporary sibling used while writing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to a temporary file, then atomically promote it to `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    sync_parent(path).await;
    Ok(())
}

/// Remove a stray temporary file left by an interrupted write.
///
/// Returns true if one was found.
pub async fn discard_stray_temp(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(temp_path(path)).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Make the rename durable. Best effort: a failed directory sync leaves the
/// rename in place, only its durability across power loss is weaker.
#[cfg(unix)]
async fn sync_parent(path: &Path) {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return;
    };
    if let Ok(dir) = tokio::fs::File::open(parent).await {
        let _ = dir.sync_all().await;
    }
}

#[cfg(not(unix))]
async fn sync_parent(_path: &Path) {}
