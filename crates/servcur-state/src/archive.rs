//! Finished-job archive on disk.
//!
//! Writes go through a temp file and a rename on the blocking pool, so a
//! crash never leaves a half-written record and the runtime workers never
//! block on disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::schema::{ArchivedJob, JobId};
use crate::storage_traits::{JobArchive, StorageResult};

/// Write `body` to `path` atomically: temp file in `dir`, then rename.
/// Runs on the blocking pool.
pub(crate) async fn write_atomic(dir: PathBuf, path: PathBuf, body: Vec<u8>) -> StorageResult<()> {
    tokio::task::spawn_blocking(move || -> StorageResult<()> {
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&body)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Filesystem-backed job archive.
///
/// Layout: `<root>/builds/<io_id>.json`, one file per finished job.
pub struct FsJobArchive {
    builds_dir: PathBuf,
}

impl FsJobArchive {
    /// Create a new archive rooted at `root`. Creates `root/builds/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let builds_dir = root.as_ref().join("builds");
        fs::create_dir_all(&builds_dir)?;
        Ok(Self { builds_dir })
    }

    fn job_path(&self, io_id: &JobId) -> Option<PathBuf> {
        // io_ids come from request paths; only plain tokens map to files.
        let id = io_id.as_str();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return None;
        }
        Some(self.builds_dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl JobArchive for FsJobArchive {
    async fn store(&self, job: &ArchivedJob) -> StorageResult<()> {
        let Some(path) = self.job_path(&job.record.io_id) else {
            tracing::warn!(io_id = %job.record.io_id, "refusing to archive job with unsafe id");
            return Ok(());
        };
        let body = serde_json::to_vec_pretty(job)?;
        write_atomic(self.builds_dir.clone(), path, body).await
    }

    async fn load(&self, io_id: &JobId) -> StorageResult<Option<ArchivedJob>> {
        let Some(path) = self.job_path(io_id) else {
            return Ok(None);
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
