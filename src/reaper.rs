use crate::blob::BlobStore;
use crate::database::Database;
use crate::types::*;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

/// Background sweeper that hardens soft deletes once they age past the
/// retention window, and drops attachment blobs no row references
/// anymore.
pub struct Reaper {
    db: Arc<Database>,
    blobs: Arc<dyn BlobStore>,
    retention: Duration,
}

impl Reaper {
    pub fn new(db: Arc<Database>, blobs: Arc<dyn BlobStore>, retention: Duration) -> Reaper {
        Reaper {
            db,
            blobs,
            retention,
        }
    }

    /// Run the sweep loop forever. One failed pass is logged and the
    /// next interval tries again.
    pub async fn run(self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(err) = self.run_once().await {
                error!("reaper pass failed: {}", err);
            }
        }
    }

    pub async fn run_once(&self) -> SyncResult<()> {
        let cutoff = now_millis() - self.retention.as_millis() as EpochMillis;
        let notes = self.db.purge_notes_before(cutoff)?;
        let folders = self.db.purge_folders_before(cutoff)?;
        let settings = self.db.purge_settings_before(cutoff)?;
        let blob_keys = self.db.purge_files_before(cutoff)?;
        let files = blob_keys.len();

        let mut blobs_removed = 0;
        for key in blob_keys {
            // Content-addressed blobs can back several paths; only
            // orphans go away.
            if self.db.count_files_with_blob(&key)? == 0 {
                match self.blobs.delete(&key).await {
                    Ok(()) => blobs_removed += 1,
                    Err(err) => error!("blob gc for {} failed: {}", key, err),
                }
            }
        }

        if notes + folders + settings + files > 0 {
            info!(
                "reaped {} note(s), {} folder(s), {} setting(s), {} file(s), {} blob(s)",
                notes, folders, settings, files, blobs_removed
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalBlobStore;

    #[tokio::test]
    async fn reaps_expired_rows_and_orphan_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::new(&dir.path().join("test.db")).unwrap());
        let blobs: Arc<dyn BlobStore> =
            Arc::new(LocalBlobStore::new(&dir.path().join("blobs")).unwrap());

        let key = content_hash(b"bytes");
        blobs.put(&key, b"bytes").await.unwrap();
        db.insert_file(&FileRecord {
            id: 0,
            uid: 7,
            vault_id: 1,
            path: "img.png".to_string(),
            path_hash: path_hash("img.png"),
            blob_key: key.clone(),
            size: 5,
            mime_type: "image/png".to_string(),
            content_hash: key.clone(),
            version: 1,
            ctime: 0,
            mtime: 0,
            // Soft-deleted long ago.
            updated_at: 0,
            action: RowAction::Delete,
            client_name: String::new(),
            client_version: String::new(),
        })
        .unwrap();

        let reaper = Reaper::new(Arc::clone(&db), Arc::clone(&blobs), Duration::from_secs(0));
        reaper.run_once().await.unwrap();

        assert!(db.get_file(7, 1, &path_hash("img.png")).unwrap().is_none());
        assert_eq!(blobs.size(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn shared_blob_survives_one_purge() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::new(&dir.path().join("test.db")).unwrap());
        let blobs: Arc<dyn BlobStore> =
            Arc::new(LocalBlobStore::new(&dir.path().join("blobs")).unwrap());

        let key = content_hash(b"bytes");
        blobs.put(&key, b"bytes").await.unwrap();
        let mut file = FileRecord {
            id: 0,
            uid: 7,
            vault_id: 1,
            path: "a.png".to_string(),
            path_hash: path_hash("a.png"),
            blob_key: key.clone(),
            size: 5,
            mime_type: "image/png".to_string(),
            content_hash: key.clone(),
            version: 1,
            ctime: 0,
            mtime: 0,
            updated_at: 0,
            action: RowAction::Delete,
            client_name: String::new(),
            client_version: String::new(),
        };
        db.insert_file(&file).unwrap();
        // A live copy of the same content under another path.
        file.path = "b.png".to_string();
        file.path_hash = path_hash("b.png");
        file.action = RowAction::Live;
        file.updated_at = now_millis();
        db.insert_file(&file).unwrap();

        let reaper = Reaper::new(Arc::clone(&db), Arc::clone(&blobs), Duration::from_secs(0));
        reaper.run_once().await.unwrap();

        // The deleted row is gone but the blob is still referenced.
        assert!(db.get_file(7, 1, &path_hash("a.png")).unwrap().is_none());
        assert_eq!(blobs.size(&key).await.unwrap(), Some(5));
    }
}
