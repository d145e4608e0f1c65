//! Content-addressed archive of fetched pages, plus the atomic write helper
//! shared by the file-backed store and run reports.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
///
/// Returns `false` when `overwrite` is off and the target already exists.
pub async fn write_atomic(path: &Path, bytes: &[u8], overwrite: bool) -> anyhow::Result<bool> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    if !overwrite
        && fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(false);
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(true)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub byte_size: usize,
    /// An identical page was already archived for this source and day.
    pub deduplicated: bool,
}

/// Raw pages stored as `<root>/<YYYYMMDD>/<source>/<sha256>.<ext>`.
#[derive(Debug, Clone)]
pub struct RawPageArchive {
    root: PathBuf,
}

impl RawPageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "html" } else { ext };
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, source_id, &content_hash, extension);
        let written = write_atomic(&self.root.join(&relative_path), bytes, false).await?;

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            byte_size: bytes.len(),
            deduplicated: !written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn page_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_pages_are_stored_once() {
        let dir = tempdir().expect("tempdir");
        let archive = RawPageArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_page(fetched_at, "bizbuysell", "html", b"<html>listing</html>")
            .await
            .expect("first store");
        let second = archive
            .store_page(fetched_at, "bizbuysell", ".html", b"<html>listing</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20260301/bizbuysell"));
        assert!(dir.path().join(&first.relative_path).exists());
    }

    #[tokio::test]
    async fn overwrite_replaces_existing_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("state.json");

        assert!(write_atomic(&path, b"one", true).await.expect("write one"));
        assert!(!write_atomic(&path, b"two", false).await.expect("skip"));
        assert!(write_atomic(&path, b"three", true).await.expect("write three"));
        assert_eq!(tokio::fs::read(&path).await.expect("read"), b"three");
    }
}
