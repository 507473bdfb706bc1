//! Filesystem boundary of the store: reads and atomic replacement.

use crate::errors::StoreError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Sibling path used for the replacement while it is being written.
///
/// `token` keeps writers that target the same path off each other's temp file.
fn tmp_path(path: &Path, token: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".");
    name.push(token);
    name.push(".tmp");
    PathBuf::from(name)
}

/// A fresh temp sibling of `path`.
pub fn unique_tmp_path(path: &Path) -> PathBuf {
    tmp_path(path, &Uuid::new_v4().simple().to_string())
}

/// Contents of `path`, or `None` when it does not exist.
pub(crate) async fn read_if_exists(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes the full replacement to `temp`, syncs it, then renames it over `path`.
///
/// On failure the temp file is removed and `path` is left as it was.
pub(crate) async fn write_atomic(path: &Path, temp: &Path, content: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| StoreError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    if let Err(source) = write_and_sync(temp, content).await {
        discard(temp).await;
        return Err(StoreError::Write {
            path: temp.to_path_buf(),
            source,
        });
    }

    if let Err(source) = fs::rename(temp, path).await {
        discard(temp).await;
        return Err(StoreError::Write {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

async fn write_and_sync(temp: &Path, content: &str) -> std::io::Result<()> {
    let mut file = fs::File::create(temp).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await
}

async fn discard(temp: &Path) {
    if fs::metadata(temp).await.is_ok_and(|m| m.is_file()) {
        let _ = fs::remove_file(temp).await;
    }
}
