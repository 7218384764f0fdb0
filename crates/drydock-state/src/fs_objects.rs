//! Filesystem-backed artifact store with git-style 2-char sharding.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::store::{ArtifactDigest, ObjectStore, StorageResult};

/// Content-addressed artifact storage on local disk.
///
/// Layout: `<root>/artifacts/<first 2 hex chars>/<remaining hex chars>`.
/// URIs are `file://` paths into that layout.
pub struct FsObjectStore {
    artifacts_dir: PathBuf,
}

impl FsObjectStore {
    /// Create a store rooted at `root`. Creates `root/artifacts/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let artifacts_dir = root.as_ref().join("artifacts");
        fs::create_dir_all(&artifacts_dir).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { artifacts_dir })
    }

    fn blob_path(&self, digest: &ArtifactDigest) -> PathBuf {
        let hex = digest.as_str();
        self.artifacts_dir.join(&hex[..2]).join(&hex[2..])
    }

    fn uri_for(&self, digest: &ArtifactDigest) -> String {
        format!("file://{}", self.blob_path(digest).display())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_artifact(&self, data: &[u8]) -> StorageResult<(String, ArtifactDigest)> {
        let digest = ArtifactDigest::from_bytes(data);
        let path = self.blob_path(&digest);
        let uri = self.uri_for(&digest);

        if path.exists() {
            return Ok((uri, digest));
        }

        let shard_dir = path
            .parent()
            .ok_or_else(|| StorageError::Backend("blob path has no parent".to_string()))?;
        fs::create_dir_all(shard_dir).map_err(|e| StorageError::Backend(e.to_string()))?;

        // Atomic write: write to temp file in the same directory, then rename.
        let mut tmp =
            NamedTempFile::new_in(shard_dir).map_err(|e| StorageError::Backend(e.to_string()))?;
        tmp.write_all(data)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        tmp.persist(&path)
            .map_err(|e| StorageError::Backend(e.error.to_string()))?;

        Ok((uri, digest))
    }

    async fn get_artifact(&self, uri: &str) -> StorageResult<Vec<u8>> {
        let path = uri
            .strip_prefix("file://")
            .ok_or_else(|| StorageError::ArtifactNotFound {
                uri: uri.to_string(),
            })?;
        fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::ArtifactNotFound {
                    uri: uri.to_string(),
                }
            } else {
                StorageError::Backend(e.to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn artifact_roundtrip() {
        let (_dir, store) = make_store();
        let data = b"serialized model weights";
        let (uri, digest) = store.put_artifact(data).await.unwrap();
        assert!(uri.starts_with("file://"));
        assert_eq!(digest, ArtifactDigest::from_bytes(data));
        assert_eq!(store.get_artifact(&uri).await.unwrap(), data);
    }

    #[tokio::test]
    async fn put_is_idempotent_on_disk() {
        let (dir, store) = make_store();
        let data = b"duplicate me";
        let (uri1, d1) = store.put_artifact(data).await.unwrap();
        let (uri2, d2) = store.put_artifact(data).await.unwrap();
        assert_eq!(uri1, uri2);
        assert_eq!(d1, d2);

        // Verify single file on disk.
        let hex = d1.as_str();
        let shard = dir.path().join("artifacts").join(&hex[..2]);
        let entries: Vec<_> = std::fs::read_dir(shard).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn empty_artifact() {
        let (_dir, store) = make_store();
        let (uri, _) = store.put_artifact(b"").await.unwrap();
        assert_eq!(store.get_artifact(&uri).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found() {
        let (dir, store) = make_store();
        let uri = format!("file://{}/artifacts/ab/sent", dir.path().display());
        match store.get_artifact(&uri).await {
            Err(StorageError::ArtifactNotFound { uri: u }) => assert_eq!(u, uri),
            other => panic!("expected ArtifactNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_file_uri_is_not_found() {
        let (_dir, store) = make_store();
        assert!(matches!(
            store.get_artifact("s3://bucket/key").await,
            Err(StorageError::ArtifactNotFound { .. })
        ));
    }
}
