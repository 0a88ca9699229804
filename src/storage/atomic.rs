//! Crash-consistent file replacement.

use rand::Rng;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Temp path next to `path`, unique per writer so concurrent writers never share one.
fn temp_path_for(path: &Path) -> PathBuf {
    let suffix: u32 = rand::rng().random();
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{:08x}.tmp", suffix));
    path.with_file_name(name)
}

/// Write `contents` to a temp file, fsync it, then rename over `path`.
///
/// Readers observe either the previous document or the new one, never a
/// partial write. The temp file is removed if any step fails.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = temp_path_for(path);
    let result = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

/// Serialize `value` as pretty JSON and replace `path` atomically.
pub async fn write_json_atomic<T: serde::Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), super::PersistenceError> {
    let serialized = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &serialized).await?;
    Ok(())
}
