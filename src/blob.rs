use crate::types::*;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

// Attachment bytes never go into sqlite. They live in a content-addressed
// store keyed by their md5 digest, with a separate temp namespace for
// uploads still in flight. Completion promotes the temp object to its
// canonical key with a rename, so a half-written blob is never visible
// under a canonical key.

/// Narrow interface the sync core uses for attachment bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a complete object under its canonical key.
    async fn put(&self, key: &str, bytes: &[u8]) -> SyncResult<()>;
    /// Size of a stored object, or None if absent.
    async fn size(&self, key: &str) -> SyncResult<Option<u64>>;
    /// Read `len` bytes at `offset`. Short reads happen only at EOF.
    async fn read_range(&self, key: &str, offset: u64, len: usize) -> SyncResult<Vec<u8>>;
    async fn delete(&self, key: &str) -> SyncResult<()>;

    /// Create an empty temp object for an upload session.
    async fn temp_create(&self, handle: &str) -> SyncResult<()>;
    /// Write bytes at `offset` in a temp object. Idempotent per offset.
    async fn temp_write_at(&self, handle: &str, offset: u64, bytes: &[u8]) -> SyncResult<()>;
    /// 32-hex digest of the whole temp object.
    async fn temp_digest(&self, handle: &str) -> SyncResult<String>;
    /// Atomically move a temp object to its canonical key.
    async fn temp_promote(&self, handle: &str, key: &str) -> SyncResult<()>;
    async fn temp_remove(&self, handle: &str) -> SyncResult<()>;
}

/// Blob store over a local directory: `objects/<aa>/<key>` for committed
/// blobs (sharded on the first two hex chars), `tmp/<handle>` for
/// in-flight uploads.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: &Path) -> SyncResult<LocalBlobStore> {
        std::fs::create_dir_all(root.join("objects"))?;
        std::fs::create_dir_all(root.join("tmp"))?;
        Ok(LocalBlobStore {
            root: root.to_path_buf(),
        })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let shard = if key.len() >= 2 { &key[..2] } else { "xx" };
        self.root.join("objects").join(shard).join(key)
    }

    fn temp_path(&self, handle: &str) -> PathBuf {
        self.root.join("tmp").join(handle)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> SyncResult<()> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Write next to the target then rename, so readers never see a
        // partial object.
        let staging = self.temp_path(&format!("put-{}", key));
        fs::write(&staging, bytes).await?;
        fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn size(&self, key: &str) -> SyncResult<Option<u64>> {
        match fs::metadata(self.object_path(key)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_range(&self, key: &str, offset: u64, len: usize) -> SyncResult<Vec<u8>> {
        let mut file = fs::File::open(self.object_path(key)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        match fs::remove_file(self.object_path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn temp_create(&self, handle: &str) -> SyncResult<()> {
        fs::File::create(self.temp_path(handle)).await?;
        Ok(())
    }

    async fn temp_write_at(&self, handle: &str, offset: u64, bytes: &[u8]) -> SyncResult<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(self.temp_path(handle))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    async fn temp_digest(&self, handle: &str) -> SyncResult<String> {
        let mut file = fs::File::open(self.temp_path(handle)).await?;
        let mut context = md5::Context::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            context.consume(&buf[..n]);
        }
        Ok(format!("{:x}", context.compute()))
    }

    async fn temp_promote(&self, handle: &str, key: &str) -> SyncResult<()> {
        let target = self.object_path(key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(self.temp_path(handle), target).await?;
        Ok(())
    }

    async fn temp_remove(&self, handle: &str) -> SyncResult<()> {
        match fs::remove_file(self.temp_path(handle)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> (tempfile::TempDir, LocalBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_size_read_delete() {
        let (_dir, store) = open_store().await;
        let key = content_hash(b"hello world");
        store.put(&key, b"hello world").await.unwrap();
        assert_eq!(store.size(&key).await.unwrap(), Some(11));
        assert_eq!(store.read_range(&key, 6, 5).await.unwrap(), b"world");
        // Reading past EOF returns the short tail.
        assert_eq!(store.read_range(&key, 6, 100).await.unwrap(), b"world");
        store.delete(&key).await.unwrap();
        assert_eq!(store.size(&key).await.unwrap(), None);
        // Deleting twice is fine.
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn temp_object_assembles_out_of_order() {
        let (_dir, store) = open_store().await;
        store.temp_create("session-1").await.unwrap();
        // Chunks land in whatever order the network delivers them.
        store.temp_write_at("session-1", 6, b"world").await.unwrap();
        store.temp_write_at("session-1", 0, b"hello ").await.unwrap();
        assert_eq!(
            store.temp_digest("session-1").await.unwrap(),
            content_hash(b"hello world")
        );

        let key = content_hash(b"hello world");
        store.temp_promote("session-1", &key).await.unwrap();
        assert_eq!(store.size(&key).await.unwrap(), Some(11));
        // The temp object is gone after promotion.
        assert!(store.temp_digest("session-1").await.is_err());
    }

    #[tokio::test]
    async fn overlapping_temp_writes_are_idempotent() {
        let (_dir, store) = open_store().await;
        store.temp_create("session-2").await.unwrap();
        store.temp_write_at("session-2", 0, b"abc").await.unwrap();
        store.temp_write_at("session-2", 0, b"abc").await.unwrap();
        assert_eq!(store.temp_digest("session-2").await.unwrap(), content_hash(b"abc"));
        store.temp_remove("session-2").await.unwrap();
    }
}
