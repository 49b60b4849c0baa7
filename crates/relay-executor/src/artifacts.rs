//! Artifact filesystem storage (spec.md §4.4 step 5).
//!
//! The Worker Pool writes the three fixed output blobs here and records
//! their `ArtifactMeta` (digest, size, uri) through `relay_storage::Store`
//! directly — this crate owns only the byte-writing side.

use async_trait::async_trait;
use relay_core::{sha256_hex, JobId};
use relay_error::{ErrorCode, RelayError, Result};
use std::path::PathBuf;
use tokio::fs;

/// Outcome of writing one artifact blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Hex-encoded SHA-256 of the written bytes.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
}

/// Byte-level artifact storage, keyed by `(job_id, file_name)`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write `bytes` under `job_id`/`file_name`, returning its digest and size.
    async fn write(&self, job_id: &JobId, file_name: &str, bytes: &[u8]) -> Result<WriteOutcome>;

    /// The storage URI a written artifact would be served from.
    fn uri(&self, job_id: &JobId, file_name: &str) -> String;
}

/// Default [`ArtifactStore`]: one file per `(job_id, file_name)` under a
/// configured root directory.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Build a store rooted at `root`, created lazily on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, job_id: &JobId, file_name: &str) -> PathBuf {
        self.root.join(job_id.as_str()).join(file_name)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn write(&self, job_id: &JobId, file_name: &str, bytes: &[u8]) -> Result<WriteOutcome> {
        let path = self.path_for(job_id, file_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                RelayError::new(ErrorCode::StorageFailure, "failed to create artifact directory").with_source(e)
            })?;
        }
        fs::write(&path, bytes).await.map_err(|e| {
            RelayError::new(ErrorCode::StorageFailure, "failed to write artifact").with_source(e)
        })?;
        Ok(WriteOutcome {
            digest: sha256_hex(bytes),
            size: bytes.len() as u64,
        })
    }

    fn uri(&self, job_id: &JobId, file_name: &str) -> String {
        format!("file://{}", self.path_for(job_id, file_name).display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_uri_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let job_id = JobId::new("job_1");
        let outcome = store.write(&job_id, "patch.diff", b"hello").await.unwrap();
        assert_eq!(outcome.size, 5);
        assert_eq!(outcome.digest, sha256_hex(b"hello"));
        let uri = store.uri(&job_id, "patch.diff");
        assert!(uri.starts_with("file://"));
        assert!(uri.ends_with("job_1/patch.diff"));
    }
}
