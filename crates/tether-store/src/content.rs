//! File-backed content store for asset blobs.
//!
//! Blobs are keyed by digest and live at
//! `assets/<last two hex chars>/<digest>.asset`. Incoming byte streams
//! accumulate under `staging/` and are moved into place by rename only
//! after the recomputed digest matches the announced one, so a committed
//! blob is never partially present.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use tether_core::{Digest, DigestHasher};

use crate::error::{Result, StoreError};

/// Staging files get a process-unique suffix so a retried stream never
/// collides with a dying predecessor.
static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Content-addressed blob storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct ContentStore {
    assets_dir: PathBuf,
    staging_dir: PathBuf,
}

impl ContentStore {
    /// Open (creating if needed) a content store under `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let assets_dir = root.join("assets");
        let staging_dir = root.join("staging");
        fs::create_dir_all(&assets_dir).await?;
        fs::create_dir_all(&staging_dir).await?;
        Ok(Self {
            assets_dir,
            staging_dir,
        })
    }

    /// Final path for a committed blob, sharded by the digest's last two
    /// hex characters to keep directory fanout flat.
    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.assets_dir
            .join(&hex[hex.len() - 2..])
            .join(format!("{}.asset", hex))
    }

    fn staging_path(&self, tag: &str) -> PathBuf {
        let n = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        self.staging_dir.join(format!("{}.{}.part", tag, n))
    }

    /// Whether the blob for `digest` has been committed.
    pub async fn contains(&self, digest: &Digest) -> bool {
        fs::try_exists(self.blob_path(digest)).await.unwrap_or(false)
    }

    /// Read a committed blob in full.
    pub async fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        match fs::read(self.blob_path(digest)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::AssetNotPresent(digest.to_hex()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Open a committed blob for streaming reads.
    pub async fn open_reader(&self, digest: &Digest) -> Result<fs::File> {
        match fs::File::open(self.blob_path(digest)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::AssetNotPresent(digest.to_hex()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Verify `bytes` against `expected` and commit them in one step. Used
    /// for inline asset payloads and locally authored assets.
    pub async fn put(&self, expected: &Digest, bytes: &[u8]) -> Result<()> {
        let computed = Digest::of(bytes);
        if computed != *expected {
            return Err(StoreError::AssetIntegrity {
                expected: expected.to_hex(),
                computed: computed.to_hex(),
            });
        }

        let tmp = self.staging_path(&expected.to_hex());
        fs::write(&tmp, bytes).await?;
        self.promote(&tmp, expected).await
    }

    /// Begin staging an incoming byte stream.
    pub async fn begin(&self, stream_id: &str) -> Result<StagedAsset> {
        let path = self.staging_path(stream_id);
        let file = fs::File::create(&path).await?;
        Ok(StagedAsset {
            path,
            file,
            hasher: DigestHasher::new(),
        })
    }

    /// Commit a fully staged stream: verify the accumulated digest against
    /// `expected` and move the file into place. On mismatch the staged
    /// bytes are deleted and nothing becomes present.
    pub async fn commit(&self, staged: StagedAsset, expected: &Digest) -> Result<()> {
        let StagedAsset {
            path,
            mut file,
            hasher,
        } = staged;
        file.flush().await?;
        drop(file);

        let computed = hasher.finalize();
        if computed != *expected {
            let _ = fs::remove_file(&path).await;
            return Err(StoreError::AssetIntegrity {
                expected: expected.to_hex(),
                computed: computed.to_hex(),
            });
        }

        self.promote(&path, expected).await
    }

    /// Move a verified staging file into its final sharded location.
    async fn promote(&self, from: &Path, digest: &Digest) -> Result<()> {
        let dest = self.blob_path(digest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(from, &dest).await?;
        Ok(())
    }
}

/// An in-flight asset stream: bytes appended so far, hashed incrementally.
pub struct StagedAsset {
    path: PathBuf,
    file: fs::File,
    hasher: DigestHasher,
}

impl StagedAsset {
    /// Append a chunk to the staged stream.
    pub async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes).await?;
        self.hasher.update(bytes);
        Ok(())
    }

    /// Drop the staged stream without committing it.
    pub async fn discard(self) -> Result<()> {
        drop(self.file);
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, ContentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    fn staging_entries(dir: &tempfile::TempDir) -> usize {
        std::fs::read_dir(dir.path().join("staging")).unwrap().count()
    }

    #[tokio::test]
    async fn test_put_then_read_round_trip() {
        let (_dir, store) = store().await;
        let bytes = b"asset bytes".to_vec();
        let digest = Digest::of(&bytes);

        assert!(!store.contains(&digest).await);
        store.put(&digest, &bytes).await.unwrap();
        assert!(store.contains(&digest).await);
        assert_eq!(store.read(&digest).await.unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_put_rejects_wrong_digest() {
        let (_dir, store) = store().await;
        let wrong = Digest::of(b"something else");

        let err = store.put(&wrong, b"asset bytes").await.unwrap_err();
        assert!(matches!(err, StoreError::AssetIntegrity { .. }));
        assert!(!store.contains(&wrong).await);
    }

    #[tokio::test]
    async fn test_read_missing_blob() {
        let (_dir, store) = store().await;
        let err = store.read(&Digest::of(b"nowhere")).await.unwrap_err();
        assert!(matches!(err, StoreError::AssetNotPresent(_)));
    }

    #[tokio::test]
    async fn test_staged_stream_commits_by_rename() {
        let (dir, store) = store().await;
        let full = b"first halfsecond half".to_vec();
        let digest = Digest::of(&full);

        let mut staged = store.begin("stream-a").await.unwrap();
        staged.append(b"first half").await.unwrap();
        staged.append(b"second half").await.unwrap();
        store.commit(staged, &digest).await.unwrap();

        assert_eq!(store.read(&digest).await.unwrap(), full);
        assert_eq!(staging_entries(&dir), 0);
    }

    #[tokio::test]
    async fn test_staged_mismatch_leaves_nothing() {
        let (dir, store) = store().await;
        let announced = Digest::of(b"what was promised");

        let mut staged = store.begin("stream-b").await.unwrap();
        staged.append(b"what actually arrived").await.unwrap();
        let err = store.commit(staged, &announced).await.unwrap_err();

        assert!(matches!(err, StoreError::AssetIntegrity { .. }));
        assert!(!store.contains(&announced).await);
        assert_eq!(staging_entries(&dir), 0);
    }

    #[tokio::test]
    async fn test_failed_retry_does_not_disturb_committed_blob() {
        let (_dir, store) = store().await;
        let good = b"verified content".to_vec();
        let digest = Digest::of(&good);

        let mut staged = store.begin("stream-c").await.unwrap();
        staged.append(&good).await.unwrap();
        store.commit(staged, &digest).await.unwrap();

        // A second stream under the same id that fails verification must
        // not replace or remove the committed blob.
        let mut retry = store.begin("stream-c").await.unwrap();
        retry.append(b"corrupted").await.unwrap();
        assert!(store.commit(retry, &digest).await.is_err());

        assert_eq!(store.read(&digest).await.unwrap(), good);
    }

    #[tokio::test]
    async fn test_discard_cleans_staging() {
        let (dir, store) = store().await;

        let mut staged = store.begin("stream-d").await.unwrap();
        staged.append(b"abandoned").await.unwrap();
        assert_eq!(staging_entries(&dir), 1);

        staged.discard().await.unwrap();
        assert_eq!(staging_entries(&dir), 0);
    }
}
