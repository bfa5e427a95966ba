use crate::blob::BlobStore;
use crate::resolver::FileCommit;
use crate::types::*;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

// Attachments arrive as raw binary chunks, possibly out of order and
// possibly from more than one connection of the same user. Each upload
// session tracks which chunk indexes have landed in its temp blob; when
// the bitmap fills up, the digest decides whether the temp blob is
// promoted under its content hash or thrown away.

pub struct UploadSession {
    pub id: Uuid,
    pub uid: Uid,
    pub vault: String,
    pub path: String,
    pub expected_size: u64,
    pub expected_hash: String,
    pub chunk_size: u32,
    received: Vec<bool>,
    pub received_bytes: u64,
    pub created_at: EpochMillis,
    pub last_active: Instant,
    pub ctime: Option<EpochMillis>,
    pub mtime: Option<EpochMillis>,
    pub client_name: String,
    pub client_version: String,
}

impl UploadSession {
    fn chunk_count(&self) -> u32 {
        self.received.len() as u32
    }

    fn received_indexes(&self) -> Vec<u32> {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, got)| **got)
            .map(|(index, _)| index as u32)
            .collect()
    }

    fn is_complete(&self) -> bool {
        self.received.iter().all(|got| *got)
    }

    /// Expected byte length of one chunk; only the tail may be short.
    fn expected_len(&self, index: u32) -> u64 {
        let start = index as u64 * self.chunk_size as u64;
        (self.expected_size - start).min(self.chunk_size as u64)
    }

    fn temp_handle(&self) -> String {
        self.id.to_string()
    }
}

/// What CheckOrStart concluded. `AlreadyComplete` is decided by the hub
/// from the file row; the manager only reports session state.
#[derive(Debug)]
pub enum CheckOutcome {
    Resumed { session_id: Uuid, received: Vec<u32>, chunk_size: u32 },
    Started { session_id: Uuid, chunk_size: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAccepted {
    pub chunk_index: u32,
    /// True once every chunk has landed; the caller should try to
    /// complete the session.
    pub complete: bool,
}

pub struct UploadManager {
    sessions: DashMap<Uuid, Arc<Mutex<UploadSession>>>,
    by_user: DashMap<Uid, HashSet<Uuid>>,
    blobs: Arc<dyn BlobStore>,
    timeout: Duration,
}

impl UploadManager {
    pub fn new(blobs: Arc<dyn BlobStore>, timeout: Duration) -> Arc<UploadManager> {
        Arc::new(UploadManager {
            sessions: DashMap::new(),
            by_user: DashMap::new(),
            blobs,
            timeout,
        })
    }

    /// Resume the unexpired session for (uid, path, expected-hash) if one
    /// exists, otherwise open a fresh one with an empty bitmap.
    pub async fn check_or_start(
        &self,
        uid: Uid,
        vault: &str,
        path: &str,
        expected_size: u64,
        expected_hash: &str,
        chunk_size: u32,
        ctime: Option<EpochMillis>,
        mtime: Option<EpochMillis>,
        client_name: &str,
        client_version: &str,
    ) -> SyncResult<CheckOutcome> {
        if expected_size == 0 {
            return Err(SyncError::InvalidParams("upload size must be positive".to_string()));
        }
        if chunk_size == 0 {
            return Err(SyncError::InvalidParams("chunk size must be positive".to_string()));
        }

        if let Some(existing) = self.find_session(uid, path, expected_hash).await {
            let session = existing.lock().await;
            debug!(
                "upload resume uid={} path={} session={} ({}/{} chunks)",
                uid,
                path,
                session.id,
                session.received_indexes().len(),
                session.chunk_count()
            );
            return Ok(CheckOutcome::Resumed {
                session_id: session.id,
                received: session.received_indexes(),
                chunk_size: session.chunk_size,
            });
        }

        let id = Uuid::new_v4();
        let chunk_count = expected_size.div_ceil(chunk_size as u64) as usize;
        let session = UploadSession {
            id,
            uid,
            vault: vault.to_string(),
            path: path.to_string(),
            expected_size,
            expected_hash: expected_hash.to_string(),
            chunk_size,
            received: vec![false; chunk_count],
            received_bytes: 0,
            created_at: now_millis(),
            last_active: Instant::now(),
            ctime,
            mtime,
            client_name: client_name.to_string(),
            client_version: client_version.to_string(),
        };
        self.blobs.temp_create(&session.temp_handle()).await?;
        self.sessions.insert(id, Arc::new(Mutex::new(session)));
        self.by_user.entry(uid).or_default().insert(id);
        info!(
            "upload start uid={} path={} session={} ({} chunk(s) of {} bytes)",
            uid, path, id, chunk_count, chunk_size
        );
        Ok(CheckOutcome::Started {
            session_id: id,
            chunk_size,
        })
    }

    /// Write one chunk into the session's temp blob. Chunk writes are
    /// idempotent per index, so duplicate delivery is harmless.
    pub async fn accept_chunk(
        &self,
        uid: Uid,
        session_id: Uuid,
        chunk_index: u32,
        bytes: &[u8],
    ) -> SyncResult<ChunkAccepted> {
        let session = self.get_session(session_id)?;
        let mut session = session.lock().await;
        if session.uid != uid {
            return Err(SyncError::Unauthorized);
        }
        if chunk_index >= session.chunk_count() {
            return Err(SyncError::BadChunk(format!(
                "chunk index {} out of range (0..{})",
                chunk_index,
                session.chunk_count()
            )));
        }
        let expected_len = session.expected_len(chunk_index);
        if bytes.len() as u64 != expected_len {
            return Err(SyncError::BadChunk(format!(
                "chunk {} is {} bytes, expected {}",
                chunk_index,
                bytes.len(),
                expected_len
            )));
        }

        let offset = chunk_index as u64 * session.chunk_size as u64;
        self.blobs
            .temp_write_at(&session.temp_handle(), offset, bytes)
            .await?;
        if !session.received[chunk_index as usize] {
            session.received[chunk_index as usize] = true;
            session.received_bytes += bytes.len() as u64;
        }
        session.last_active = Instant::now();
        Ok(ChunkAccepted {
            chunk_index,
            complete: session.is_complete(),
        })
    }

    /// If every chunk has landed, verify the digest and promote. Returns
    /// the commit parameters for the resolver on success, `None` while
    /// chunks are still missing. A digest mismatch destroys the session
    /// so the client restarts from nothing.
    pub async fn complete_if_done(
        &self,
        uid: Uid,
        session_id: Uuid,
    ) -> SyncResult<Option<FileCommit>> {
        let handle = self.get_session(session_id)?;
        let session = handle.lock().await;
        if session.uid != uid {
            return Err(SyncError::Unauthorized);
        }
        if !session.is_complete() {
            return Ok(None);
        }

        let digest = self.blobs.temp_digest(&session.temp_handle()).await?;
        if digest != session.expected_hash {
            let expected = session.expected_hash.clone();
            let temp = session.temp_handle();
            drop(session);
            self.destroy(session_id).await;
            warn!(
                "upload session {} checksum mismatch, discarding temp blob {}",
                session_id, temp
            );
            return Err(SyncError::ChecksumFailed(expected, digest));
        }

        self.blobs
            .temp_promote(&session.temp_handle(), &session.expected_hash)
            .await?;
        let commit = FileCommit {
            vault: session.vault.clone(),
            path: session.path.clone(),
            blob_key: session.expected_hash.clone(),
            size: session.expected_size as i64,
            mime_type: mime_guess::from_path(&session.path)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
            content_hash: session.expected_hash.clone(),
            ctime: session.ctime,
            mtime: session.mtime,
            client_name: session.client_name.clone(),
            client_version: session.client_version.clone(),
        };
        drop(session);
        self.remove_entry(session_id).await;
        info!("upload complete uid={} session={} -> {}", uid, session_id, commit.blob_key);
        Ok(Some(commit))
    }

    /// Serve one chunk of a committed attachment by offset.
    pub async fn download_chunk(
        &self,
        file: &FileRecord,
        chunk_index: u32,
        chunk_size: u32,
    ) -> SyncResult<(Vec<u8>, bool)> {
        let offset = chunk_index as u64 * chunk_size as u64;
        if offset >= file.size as u64 {
            return Err(SyncError::BadChunk(format!(
                "chunk index {} past end of {} byte file",
                chunk_index, file.size
            )));
        }
        let bytes = self
            .blobs
            .read_range(&file.blob_key, offset, chunk_size as usize)
            .await?;
        let is_last = offset + bytes.len() as u64 >= file.size as u64;
        Ok((bytes, is_last))
    }

    /// Destroy sessions idle past the cutoff and release their temp
    /// blobs.
    pub async fn expire_once(&self) {
        let handles: Vec<(Uuid, Arc<Mutex<UploadSession>>)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        for (id, handle) in handles {
            let idle = handle.lock().await.last_active.elapsed();
            if idle > self.timeout {
                info!("expiring idle upload session {}", id);
                self.destroy(id).await;
            }
        }
    }

    /// Sweep loop, typically spawned at startup.
    pub async fn run_expiry(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.expire_once().await;
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    async fn destroy(&self, session_id: Uuid) {
        if let Some((_, handle)) = self.sessions.remove(&session_id) {
            let session = handle.lock().await;
            if let Err(err) = self.blobs.temp_remove(&session.temp_handle()).await {
                warn!("failed to remove temp blob for session {}: {}", session_id, err);
            }
            if let Some(mut set) = self.by_user.get_mut(&session.uid) {
                set.remove(&session_id);
            }
        }
    }

    async fn remove_entry(&self, session_id: Uuid) {
        if let Some((_, handle)) = self.sessions.remove(&session_id) {
            let session = handle.lock().await;
            if let Some(mut set) = self.by_user.get_mut(&session.uid) {
                set.remove(&session_id);
            }
        }
    }

    fn get_session(&self, session_id: Uuid) -> SyncResult<Arc<Mutex<UploadSession>>> {
        self.sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SyncError::UploadSessionNotFound(session_id.to_string()))
    }

    async fn find_session(
        &self,
        uid: Uid,
        path: &str,
        expected_hash: &str,
    ) -> Option<Arc<Mutex<UploadSession>>> {
        // Snapshot the candidate ids first; holding a map guard across an
        // await point invites deadlock.
        let ids: Vec<Uuid> = self
            .by_user
            .get(&uid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            let Some(handle) = self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
            else {
                continue;
            };
            let matches = {
                let session = handle.lock().await;
                session.path == path && session.expected_hash == expected_hash
            };
            if matches {
                return Some(handle);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalBlobStore;

    fn manager(timeout_ms: u64) -> (tempfile::TempDir, Arc<UploadManager>) {
        let dir = tempfile::tempdir().unwrap();
        let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(dir.path()).unwrap());
        let manager = UploadManager::new(blobs, Duration::from_millis(timeout_ms));
        (dir, manager)
    }

    async fn start(manager: &UploadManager, payload: &[u8], chunk_size: u32) -> Uuid {
        let hash = content_hash(payload);
        match manager
            .check_or_start(7, "v1", "img.png", payload.len() as u64, &hash, chunk_size, None, None, "test", "0")
            .await
            .unwrap()
        {
            CheckOutcome::Started { session_id, .. } => session_id,
            CheckOutcome::Resumed { .. } => panic!("expected a fresh session"),
        }
    }

    #[tokio::test]
    async fn chunked_upload_commits_with_matching_digest() {
        let (_dir, manager) = manager(60_000);
        let payload = b"0123456789".to_vec();
        let session = start(&manager, &payload, 4).await;

        // Tail chunk is short on purpose.
        for (index, chunk) in [&payload[0..4], &payload[4..8], &payload[8..10]]
            .iter()
            .enumerate()
        {
            let accepted = manager.accept_chunk(7, session, index as u32, chunk).await.unwrap();
            assert_eq!(accepted.complete, index == 2);
        }

        let commit = manager.complete_if_done(7, session).await.unwrap().unwrap();
        assert_eq!(commit.blob_key, content_hash(&payload));
        assert_eq!(commit.size, 10);
        assert_eq!(commit.mime_type, "image/png");
        assert_eq!(manager.session_count(), 0);

        // The promoted blob serves downloads.
        let file = FileRecord {
            id: 1,
            uid: 7,
            vault_id: 1,
            path: "img.png".to_string(),
            path_hash: path_hash("img.png"),
            blob_key: commit.blob_key.clone(),
            size: 10,
            mime_type: commit.mime_type.clone(),
            content_hash: commit.content_hash.clone(),
            version: 1,
            ctime: 0,
            mtime: 0,
            updated_at: 0,
            action: RowAction::Live,
            client_name: String::new(),
            client_version: String::new(),
        };
        let (bytes, is_last) = manager.download_chunk(&file, 0, 4).await.unwrap();
        assert_eq!(bytes, b"0123");
        assert!(!is_last);
        let (bytes, is_last) = manager.download_chunk(&file, 2, 4).await.unwrap();
        assert_eq!(bytes, b"89");
        assert!(is_last);
        assert!(manager.download_chunk(&file, 3, 4).await.is_err());
    }

    #[tokio::test]
    async fn interrupted_upload_resumes_with_bitmap() {
        let (_dir, manager) = manager(60_000);
        let payload = b"abcdefgh".to_vec();
        let hash = content_hash(&payload);
        let session = start(&manager, &payload, 4).await;

        manager.accept_chunk(7, session, 0, &payload[0..4]).await.unwrap();

        // The client reconnects and asks again.
        let outcome = manager
            .check_or_start(7, "v1", "img.png", 8, &hash, 4, None, None, "test", "0")
            .await
            .unwrap();
        let CheckOutcome::Resumed { session_id, received, .. } = outcome else {
            panic!("expected resume")
        };
        assert_eq!(session_id, session);
        assert_eq!(received, vec![0]);

        manager.accept_chunk(7, session, 1, &payload[4..8]).await.unwrap();
        let commit = manager.complete_if_done(7, session).await.unwrap().unwrap();
        // Same digest a single-shot upload would have produced.
        assert_eq!(commit.content_hash, hash);
    }

    #[tokio::test]
    async fn duplicate_chunks_are_idempotent() {
        let (_dir, manager) = manager(60_000);
        let payload = b"abcdefgh".to_vec();
        let session = start(&manager, &payload, 4).await;

        manager.accept_chunk(7, session, 0, &payload[0..4]).await.unwrap();
        let again = manager.accept_chunk(7, session, 0, &payload[0..4]).await.unwrap();
        assert!(!again.complete);

        manager.accept_chunk(7, session, 1, &payload[4..8]).await.unwrap();
        let commit = manager.complete_if_done(7, session).await.unwrap().unwrap();
        assert_eq!(commit.content_hash, content_hash(&payload));
    }

    #[tokio::test]
    async fn wrong_length_chunk_is_rejected() {
        let (_dir, manager) = manager(60_000);
        let payload = b"abcdefgh".to_vec();
        let session = start(&manager, &payload, 4).await;

        let short = manager.accept_chunk(7, session, 0, &payload[0..3]).await;
        assert!(matches!(short, Err(SyncError::BadChunk(_))));
        let out_of_range = manager.accept_chunk(7, session, 9, &payload[0..4]).await;
        assert!(matches!(out_of_range, Err(SyncError::BadChunk(_))));
        // The session survives bad chunks.
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test]
    async fn corrupted_payload_fails_checksum_and_destroys_session() {
        let (_dir, manager) = manager(60_000);
        let payload = b"abcdefgh".to_vec();
        let session = start(&manager, &payload, 4).await;

        manager.accept_chunk(7, session, 0, &payload[0..4]).await.unwrap();
        let accepted = manager.accept_chunk(7, session, 1, b"XXXX").await.unwrap();
        assert!(accepted.complete);

        let result = manager.complete_if_done(7, session).await;
        assert!(matches!(result, Err(SyncError::ChecksumFailed(_, _))));
        assert_eq!(manager.session_count(), 0);
        // A retry starts over from an empty bitmap.
        let hash = content_hash(&payload);
        let outcome = manager
            .check_or_start(7, "v1", "img.png", 8, &hash, 4, None, None, "test", "0")
            .await
            .unwrap();
        assert!(matches!(outcome, CheckOutcome::Started { .. }));
    }

    #[tokio::test]
    async fn another_user_cannot_touch_the_session() {
        let (_dir, manager) = manager(60_000);
        let payload = b"abcdefgh".to_vec();
        let session = start(&manager, &payload, 4).await;
        let result = manager.accept_chunk(8, session, 0, &payload[0..4]).await;
        assert!(matches!(result, Err(SyncError::Unauthorized)));
    }

    #[tokio::test]
    async fn idle_sessions_expire() {
        let (_dir, manager) = manager(50);
        let payload = b"abcdefgh".to_vec();
        let _session = start(&manager, &payload, 4).await;
        assert_eq!(manager.session_count(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        manager.expire_once().await;
        assert_eq!(manager.session_count(), 0);
    }
}
