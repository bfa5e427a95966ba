use crate::database::Database;
use crate::history::HistoryKeeper;
use crate::message::*;
use crate::types::*;
use crate::write_queue::WriteQueue;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// The resolver owns every mutation decision: create, update, revive,
// delete, restore, rename, or reject as stale. Writes re-read the current
// row inside the per-user write slot, so the decision can never race with
// another write of the same user. Reads (checks, syncs, repush) go
// straight to the database; clients reconcile with the updated_at cursor
// anyway.

/// What a non-mutating NoteCheck concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    OkCreate,
    OkUpdate,
    ConflictStale,
    ConflictRenameTargetExists,
    TargetInTrash,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::OkCreate => "ok-create",
            Verdict::OkUpdate => "ok-update",
            Verdict::ConflictStale => "conflict-stale",
            Verdict::ConflictRenameTargetExists => "conflict-rename-target-exists",
            Verdict::TargetInTrash => "target-in-trash",
        }
    }
}

#[derive(Debug)]
pub struct CheckResult {
    pub is_new: bool,
    pub existing: Option<NoteRecord>,
    pub verdict: Verdict,
}

#[derive(Debug)]
pub enum NoteOutcome {
    Created(NoteRecord),
    Updated(NoteRecord),
    /// Same content-hash as the stored row; nothing changed, not even
    /// updated_at.
    Unchanged(NoteRecord),
    Deleted(NoteRecord),
    Restored(NoteRecord),
    Renamed { src: NoteRecord, dst: NoteRecord },
}

impl NoteOutcome {
    pub fn record(&self) -> &NoteRecord {
        match self {
            NoteOutcome::Created(note)
            | NoteOutcome::Updated(note)
            | NoteOutcome::Unchanged(note)
            | NoteOutcome::Deleted(note)
            | NoteOutcome::Restored(note) => note,
            NoteOutcome::Renamed { dst, .. } => dst,
        }
    }
}

#[derive(Debug)]
pub enum FileOutcome {
    Created(FileRecord),
    Updated(FileRecord),
    Unchanged(FileRecord),
    Deleted(FileRecord),
    Renamed { src: FileRecord, dst: FileRecord },
}

impl FileOutcome {
    pub fn record(&self) -> &FileRecord {
        match self {
            FileOutcome::Created(file)
            | FileOutcome::Updated(file)
            | FileOutcome::Unchanged(file)
            | FileOutcome::Deleted(file) => file,
            FileOutcome::Renamed { dst, .. } => dst,
        }
    }
}

#[derive(Debug)]
pub enum FolderOutcome {
    Created(FolderRecord),
    Updated(FolderRecord),
    Deleted(FolderRecord),
    Renamed {
        src: FolderRecord,
        dst: FolderRecord,
        /// Children carried along, (old row, new row) each.
        notes: Vec<(NoteRecord, NoteRecord)>,
        files: Vec<(FileRecord, FileRecord)>,
    },
}

/// Parameters for committing a completed attachment upload as a row.
#[derive(Debug, Clone)]
pub struct FileCommit {
    pub vault: String,
    pub path: String,
    pub blob_key: String,
    pub size: i64,
    pub mime_type: String,
    pub content_hash: String,
    pub ctime: Option<EpochMillis>,
    pub mtime: Option<EpochMillis>,
    pub client_name: String,
    pub client_version: String,
}

pub struct Resolver {
    db: Arc<Database>,
    queue: Arc<WriteQueue>,
    history: Arc<HistoryKeeper>,
}

impl Resolver {
    pub fn new(db: Arc<Database>, queue: Arc<WriteQueue>, history: Arc<HistoryKeeper>) -> Resolver {
        Resolver { db, queue, history }
    }

    pub fn history(&self) -> &Arc<HistoryKeeper> {
        &self.history
    }

    // ---------- notes ----------

    /// Probe what a NoteModify with these parameters would do, without
    /// mutating anything.
    pub fn note_check(&self, uid: Uid, params: &NoteCheckParams) -> SyncResult<CheckResult> {
        let vault = self.db.get_or_create_vault(uid, &params.vault)?;
        let phash = match &params.path_hash {
            Some(hash) => hash.clone(),
            None => path_hash(&params.path),
        };
        let existing = self.db.get_note(uid, vault.id, &phash)?;
        let verdict = match &existing {
            None => Verdict::OkCreate,
            Some(note) if note.action == RowAction::Delete => Verdict::TargetInTrash,
            Some(note) => {
                let stale = match params.mtime {
                    Some(client_mtime) => {
                        note.mtime > client_mtime && note.content_hash != params.content_hash
                    }
                    None => false,
                };
                if stale {
                    Verdict::ConflictStale
                } else {
                    Verdict::OkUpdate
                }
            }
        };
        Ok(CheckResult {
            is_new: existing.is_none(),
            existing,
            verdict,
        })
    }

    /// The note write path. Decides create / revive / update / no-op
    /// under the per-user write slot.
    pub async fn note_modify(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: NoteModifyParams,
    ) -> SyncResult<NoteOutcome> {
        if params.path.is_empty() {
            return Err(SyncError::InvalidParams("path must not be empty".to_string()));
        }
        let db = Arc::clone(&self.db);
        let history = Arc::clone(&self.history);
        self.queue
            .execute(uid, cancel, move || {
                with_retry(|| {
                    let vault = db.get_or_create_vault(uid, &params.vault)?;
                    let phash = path_hash(&params.path);
                    let new_hash = match &params.content_hash {
                        Some(hash) => hash.clone(),
                        None => content_hash(params.content.as_bytes()),
                    };
                    let now = now_millis();

                    let existing = db.get_note(uid, vault.id, &phash)?;
                    match existing {
                        None => {
                            let mut note = NoteRecord {
                                id: 0,
                                uid,
                                vault_id: vault.id,
                                path: params.path.clone(),
                                path_hash: phash,
                                content: params.content.clone(),
                                content_hash: new_hash,
                                version: 1,
                                ctime: params.ctime.unwrap_or(now),
                                mtime: params.mtime.unwrap_or(now),
                                updated_at: now,
                                action: RowAction::Live,
                                client_name: params.client_name.clone(),
                                client_version: params.client_version.clone(),
                            };
                            note.id = db.insert_note(&note)?;
                            debug!("note create uid={} path={} v1", uid, note.path);
                            Ok(NoteOutcome::Created(note))
                        }
                        Some(prev) if prev.action == RowAction::Delete => {
                            // Revive: the tombstone row is reused and its
                            // last content goes to history.
                            history.record(&prev);
                            let mut note = prev.clone();
                            note.action = RowAction::Live;
                            note.version = prev.version + 1;
                            note.content = params.content.clone();
                            note.content_hash = new_hash;
                            note.mtime = params.mtime.unwrap_or(now).max(prev.mtime + 1);
                            note.updated_at = next_stamp(prev.updated_at);
                            note.client_name = params.client_name.clone();
                            note.client_version = params.client_version.clone();
                            db.update_note(&note)?;
                            debug!("note revive uid={} path={} v{}", uid, note.path, note.version);
                            Ok(NoteOutcome::Updated(note))
                        }
                        Some(prev) if prev.content_hash == new_hash => {
                            // Idempotent no-op: updated_at stays put so
                            // catch-up cursors do not churn.
                            Ok(NoteOutcome::Unchanged(prev))
                        }
                        Some(prev) => {
                            if !params.force {
                                if let Some(client_mtime) = params.mtime {
                                    if prev.mtime > client_mtime {
                                        return Err(SyncError::StaleConflict(prev.path.clone()));
                                    }
                                }
                            }
                            history.record(&prev);
                            let mut note = prev.clone();
                            note.version = prev.version + 1;
                            note.content = params.content.clone();
                            note.content_hash = new_hash;
                            note.mtime = params.mtime.unwrap_or(now).max(prev.mtime + 1);
                            note.updated_at = next_stamp(prev.updated_at);
                            note.client_name = params.client_name.clone();
                            note.client_version = params.client_version.clone();
                            db.update_note(&note)?;
                            debug!("note update uid={} path={} v{}", uid, note.path, note.version);
                            Ok(NoteOutcome::Updated(note))
                        }
                    }
                })
            })
            .await
    }

    pub async fn note_delete(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: NoteDeleteParams,
    ) -> SyncResult<NoteOutcome> {
        let phash = resolve_path_hash(params.path.as_deref(), params.path_hash.as_deref())?;
        let db = Arc::clone(&self.db);
        let history = Arc::clone(&self.history);
        let vault_name = params.vault;
        self.queue
            .execute(uid, cancel, move || {
                with_retry(|| {
                    let vault = db.get_or_create_vault(uid, &vault_name)?;
                    let note = db
                        .get_note(uid, vault.id, &phash)?
                        .ok_or_else(|| SyncError::NoteNotFound(phash.clone()))?;
                    if note.action == RowAction::Delete {
                        return Err(SyncError::AlreadyDeleted(note.path.clone()));
                    }
                    // A burst still in its debounce window loses its tail
                    // otherwise.
                    history.flush(uid, note.id);
                    let mut deleted = note.clone();
                    deleted.action = RowAction::Delete;
                    deleted.updated_at = next_stamp(note.updated_at);
                    db.update_note(&deleted)?;
                    info!("note delete uid={} path={}", uid, deleted.path);
                    Ok(NoteOutcome::Deleted(deleted))
                })
            })
            .await
    }

    pub async fn note_restore(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: NoteRestoreParams,
    ) -> SyncResult<NoteOutcome> {
        let db = Arc::clone(&self.db);
        self.queue
            .execute(uid, cancel, move || {
                with_retry(|| {
                    let vault = db.get_or_create_vault(uid, &params.vault)?;
                    let phash = path_hash(&params.path);
                    let note = db
                        .get_note(uid, vault.id, &phash)?
                        .ok_or_else(|| SyncError::NoteNotFound(params.path.clone()))?;
                    if note.action == RowAction::Live {
                        return Err(SyncError::InvalidParams(format!(
                            "note is not deleted: {}",
                            note.path
                        )));
                    }
                    let mut restored = note.clone();
                    restored.action = RowAction::Live;
                    restored.version = note.version + 1;
                    restored.updated_at = next_stamp(note.updated_at);
                    db.update_note(&restored)?;
                    info!("note restore uid={} path={}", uid, restored.path);
                    Ok(NoteOutcome::Restored(restored))
                })
            })
            .await
    }

    /// Atomic within one write slot: src becomes a tombstone, dst takes
    /// over the content (reviving a tombstone at dst if one is there).
    pub async fn note_rename(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: NoteRenameParams,
    ) -> SyncResult<NoteOutcome> {
        if params.src_path == params.dst_path {
            return Err(SyncError::InvalidParams("rename to the same path".to_string()));
        }
        let db = Arc::clone(&self.db);
        let history = Arc::clone(&self.history);
        self.queue
            .execute(uid, cancel, move || {
                with_retry(|| {
                    let vault = db.get_or_create_vault(uid, &params.vault)?;
                    rename_note_row(
                        &db,
                        &history,
                        uid,
                        vault.id,
                        &params.src_path,
                        &params.dst_path,
                    )
                })
            })
            .await
    }

    pub fn note_sync(
        &self,
        uid: Uid,
        vault_name: &str,
        cursor: EpochMillis,
    ) -> SyncResult<Vec<NoteRecord>> {
        let vault = self.db.get_or_create_vault(uid, vault_name)?;
        self.db.notes_since(uid, vault.id, cursor)
    }

    pub fn note_get(&self, uid: Uid, vault_name: &str, path: &str) -> SyncResult<NoteRecord> {
        let vault = self.db.get_or_create_vault(uid, vault_name)?;
        self.db
            .get_note(uid, vault.id, &path_hash(path))?
            .ok_or_else(|| SyncError::NoteNotFound(path.to_string()))
    }

    pub fn note_history(&self, uid: Uid, note_id: NoteId) -> SyncResult<Vec<HistoryRecord>> {
        self.db.history_for_note(uid, note_id)
    }

    // ---------- note text mutations ----------
    // Read-modify-write wrappers; the per-user write slot inside
    // note_modify re-reads, so a lost update needs a same-user race the
    // queue has already serialized.

    pub async fn note_append(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: NoteAppendParams,
    ) -> SyncResult<NoteOutcome> {
        let base = self.read_live_content(uid, &params.vault, &params.path)?;
        let content = format!("{}{}", base.unwrap_or_default(), params.content);
        self.note_modify(uid, cancel, rewrite_params(&params.vault, &params.path, content))
            .await
    }

    pub async fn note_prepend(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: NoteAppendParams,
    ) -> SyncResult<NoteOutcome> {
        let base = self.read_live_content(uid, &params.vault, &params.path)?;
        let content = format!("{}{}", params.content, base.unwrap_or_default());
        self.note_modify(uid, cancel, rewrite_params(&params.vault, &params.path, content))
            .await
    }

    pub async fn note_replace(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: NoteReplaceParams,
    ) -> SyncResult<NoteOutcome> {
        let base = self
            .read_live_content(uid, &params.vault, &params.path)?
            .ok_or_else(|| SyncError::NoteNotFound(params.path.clone()))?;
        let content = base.replace(&params.search, &params.replace);
        self.note_modify(uid, cancel, rewrite_params(&params.vault, &params.path, content))
            .await
    }

    pub async fn note_patch_frontmatter(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: NotePatchFrontmatterParams,
    ) -> SyncResult<NoteOutcome> {
        let base = self
            .read_live_content(uid, &params.vault, &params.path)?
            .ok_or_else(|| SyncError::NoteNotFound(params.path.clone()))?;
        let content = patch_frontmatter(&base, &params.key, &params.value);
        self.note_modify(uid, cancel, rewrite_params(&params.vault, &params.path, content))
            .await
    }

    /// Move is rename with wrapper clothing: same content, new path.
    pub async fn note_move(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: NoteMoveParams,
    ) -> SyncResult<NoteOutcome> {
        self.note_rename(
            uid,
            cancel,
            NoteRenameParams {
                vault: params.vault,
                src_path: params.src_path,
                dst_path: params.dst_path,
            },
        )
        .await
    }

    fn read_live_content(
        &self,
        uid: Uid,
        vault_name: &str,
        path: &str,
    ) -> SyncResult<Option<String>> {
        let vault = self.db.get_or_create_vault(uid, vault_name)?;
        match self.db.get_note(uid, vault.id, &path_hash(path))? {
            Some(note) if note.action == RowAction::Live => Ok(Some(note.content)),
            _ => Ok(None),
        }
    }

    // ---------- files ----------

    /// Write or update the row for a committed attachment. Mirrors the
    /// note decision tree minus history (files keep no history).
    pub async fn file_commit(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        commit: FileCommit,
    ) -> SyncResult<FileOutcome> {
        let db = Arc::clone(&self.db);
        self.queue
            .execute(uid, cancel, move || {
                with_retry(|| {
                    let vault = db.get_or_create_vault(uid, &commit.vault)?;
                    let phash = path_hash(&commit.path);
                    let now = now_millis();
                    match db.get_file(uid, vault.id, &phash)? {
                        None => {
                            let mut file = FileRecord {
                                id: 0,
                                uid,
                                vault_id: vault.id,
                                path: commit.path.clone(),
                                path_hash: phash,
                                blob_key: commit.blob_key.clone(),
                                size: commit.size,
                                mime_type: commit.mime_type.clone(),
                                content_hash: commit.content_hash.clone(),
                                version: 1,
                                ctime: commit.ctime.unwrap_or(now),
                                mtime: commit.mtime.unwrap_or(now),
                                updated_at: now,
                                action: RowAction::Live,
                                client_name: commit.client_name.clone(),
                                client_version: commit.client_version.clone(),
                            };
                            file.id = db.insert_file(&file)?;
                            info!("file create uid={} path={}", uid, file.path);
                            Ok(FileOutcome::Created(file))
                        }
                        Some(prev)
                            if prev.action == RowAction::Live
                                && prev.content_hash == commit.content_hash =>
                        {
                            Ok(FileOutcome::Unchanged(prev))
                        }
                        Some(prev) => {
                            let revived = prev.action == RowAction::Delete;
                            let mut file = prev.clone();
                            file.action = RowAction::Live;
                            file.version = prev.version + 1;
                            file.blob_key = commit.blob_key.clone();
                            file.size = commit.size;
                            file.mime_type = commit.mime_type.clone();
                            file.content_hash = commit.content_hash.clone();
                            file.mtime = commit.mtime.unwrap_or(now).max(prev.mtime + 1);
                            file.updated_at = next_stamp(prev.updated_at);
                            file.client_name = commit.client_name.clone();
                            file.client_version = commit.client_version.clone();
                            db.update_file(&file)?;
                            info!(
                                "file {} uid={} path={} v{}",
                                if revived { "revive" } else { "update" },
                                uid,
                                file.path,
                                file.version
                            );
                            Ok(FileOutcome::Updated(file))
                        }
                    }
                })
            })
            .await
    }

    pub async fn file_delete(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: FileDeleteParams,
    ) -> SyncResult<FileOutcome> {
        let phash = resolve_path_hash(params.path.as_deref(), params.path_hash.as_deref())?;
        let db = Arc::clone(&self.db);
        let vault_name = params.vault;
        self.queue
            .execute(uid, cancel, move || {
                with_retry(|| {
                    let vault = db.get_or_create_vault(uid, &vault_name)?;
                    let file = db
                        .get_file(uid, vault.id, &phash)?
                        .ok_or_else(|| SyncError::FileNotFound(phash.clone()))?;
                    if file.action == RowAction::Delete {
                        return Err(SyncError::AlreadyDeleted(file.path.clone()));
                    }
                    let mut deleted = file.clone();
                    deleted.action = RowAction::Delete;
                    deleted.updated_at = next_stamp(file.updated_at);
                    db.update_file(&deleted)?;
                    // The blob itself is garbage-collected by the reaper
                    // once retention runs out.
                    info!("file delete uid={} path={}", uid, deleted.path);
                    Ok(FileOutcome::Deleted(deleted))
                })
            })
            .await
    }

    pub async fn file_rename(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: FileRenameParams,
    ) -> SyncResult<FileOutcome> {
        if params.src_path == params.dst_path {
            return Err(SyncError::InvalidParams("rename to the same path".to_string()));
        }
        let db = Arc::clone(&self.db);
        self.queue
            .execute(uid, cancel, move || {
                with_retry(|| {
                    let vault = db.get_or_create_vault(uid, &params.vault)?;
                    rename_file_row(&db, uid, vault.id, &params.src_path, &params.dst_path)
                })
            })
            .await
    }

    pub fn file_sync(
        &self,
        uid: Uid,
        vault_name: &str,
        cursor: EpochMillis,
    ) -> SyncResult<Vec<FileRecord>> {
        let vault = self.db.get_or_create_vault(uid, vault_name)?;
        self.db.files_since(uid, vault.id, cursor)
    }

    pub fn file_get(&self, uid: Uid, vault_name: &str, path: &str) -> SyncResult<FileRecord> {
        let vault = self.db.get_or_create_vault(uid, vault_name)?;
        self.db
            .get_file(uid, vault.id, &path_hash(path))?
            .ok_or_else(|| SyncError::FileNotFound(path.to_string()))
    }

    // ---------- folders ----------

    pub async fn folder_modify(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: FolderModifyParams,
    ) -> SyncResult<FolderOutcome> {
        let db = Arc::clone(&self.db);
        self.queue
            .execute(uid, cancel, move || {
                with_retry(|| {
                    let vault = db.get_or_create_vault(uid, &params.vault)?;
                    let phash = path_hash(&params.path);
                    let now = now_millis();
                    match db.get_folder(uid, vault.id, &phash)? {
                        None => {
                            let mut folder = FolderRecord {
                                id: 0,
                                uid,
                                vault_id: vault.id,
                                path: params.path.clone(),
                                path_hash: phash,
                                mtime: params.mtime.unwrap_or(now),
                                updated_at: now,
                                action: RowAction::Live,
                            };
                            folder.id = db.insert_folder(&folder)?;
                            Ok(FolderOutcome::Created(folder))
                        }
                        Some(prev) => {
                            let mut folder = prev.clone();
                            folder.action = RowAction::Live;
                            folder.mtime = params.mtime.unwrap_or(now);
                            folder.updated_at = next_stamp(prev.updated_at);
                            db.update_folder(&folder)?;
                            Ok(FolderOutcome::Updated(folder))
                        }
                    }
                })
            })
            .await
    }

    pub async fn folder_delete(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: FolderDeleteParams,
    ) -> SyncResult<FolderOutcome> {
        let db = Arc::clone(&self.db);
        self.queue
            .execute(uid, cancel, move || {
                with_retry(|| {
                    let vault = db.get_or_create_vault(uid, &params.vault)?;
                    let phash = path_hash(&params.path);
                    let folder = db
                        .get_folder(uid, vault.id, &phash)?
                        .ok_or_else(|| SyncError::NoteNotFound(params.path.clone()))?;
                    if folder.action == RowAction::Delete {
                        return Err(SyncError::AlreadyDeleted(folder.path.clone()));
                    }
                    let mut deleted = folder.clone();
                    deleted.action = RowAction::Delete;
                    deleted.updated_at = next_stamp(folder.updated_at);
                    db.update_folder(&deleted)?;
                    Ok(FolderOutcome::Deleted(deleted))
                })
            })
            .await
    }

    /// Rename the folder row and carry every live child note and file
    /// with it, all inside one write slot.
    pub async fn folder_rename(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: FolderRenameParams,
    ) -> SyncResult<FolderOutcome> {
        if params.src_path == params.dst_path {
            return Err(SyncError::InvalidParams("rename to the same path".to_string()));
        }
        let db = Arc::clone(&self.db);
        let history = Arc::clone(&self.history);
        self.queue
            .execute(uid, cancel, move || {
                with_retry(|| {
                    let vault = db.get_or_create_vault(uid, &params.vault)?;
                    let src_hash = path_hash(&params.src_path);
                    let dst_hash = path_hash(&params.dst_path);
                    let now = now_millis();

                    let folder = db
                        .get_folder(uid, vault.id, &src_hash)?
                        .ok_or_else(|| SyncError::NoteNotFound(params.src_path.clone()))?;
                    if folder.action == RowAction::Delete {
                        return Err(SyncError::AlreadyDeleted(folder.path.clone()));
                    }
                    if let Some(target) = db.get_folder(uid, vault.id, &dst_hash)? {
                        if target.action == RowAction::Live {
                            return Err(SyncError::RenameTargetExists(params.dst_path.clone()));
                        }
                    }

                    let src_prefix = format!("{}/", params.src_path.trim_end_matches('/'));
                    let dst_prefix = format!("{}/", params.dst_path.trim_end_matches('/'));

                    // Tombstone the src folder, then write the dst row.
                    let mut src_folder = folder.clone();
                    src_folder.action = RowAction::Delete;
                    src_folder.updated_at = next_stamp(folder.updated_at);
                    db.update_folder(&src_folder)?;

                    let dst_folder = match db.get_folder(uid, vault.id, &dst_hash)? {
                        Some(tombstone) => {
                            let mut revived = tombstone.clone();
                            revived.action = RowAction::Live;
                            revived.mtime = now;
                            revived.updated_at = next_stamp(tombstone.updated_at);
                            db.update_folder(&revived)?;
                            revived
                        }
                        None => {
                            let mut created = FolderRecord {
                                id: 0,
                                uid,
                                vault_id: vault.id,
                                path: params.dst_path.clone(),
                                path_hash: dst_hash,
                                mtime: now,
                                updated_at: now,
                                action: RowAction::Live,
                            };
                            created.id = db.insert_folder(&created)?;
                            created
                        }
                    };

                    let mut notes = vec![];
                    for note in db.notes_under(uid, vault.id, &src_prefix)? {
                        let moved_path = format!(
                            "{}{}",
                            dst_prefix,
                            &note.path[src_prefix.len()..]
                        );
                        let outcome = rename_note_row(
                            &db,
                            &history,
                            uid,
                            vault.id,
                            &note.path,
                            &moved_path,
                        )?;
                        if let NoteOutcome::Renamed { src, dst } = outcome {
                            notes.push((src, dst));
                        }
                    }

                    let mut files = vec![];
                    for file in db.files_under(uid, vault.id, &src_prefix)? {
                        let moved_path = format!(
                            "{}{}",
                            dst_prefix,
                            &file.path[src_prefix.len()..]
                        );
                        let outcome =
                            rename_file_row(&db, uid, vault.id, &file.path, &moved_path)?;
                        if let FileOutcome::Renamed { src, dst } = outcome {
                            files.push((src, dst));
                        }
                    }

                    info!(
                        "folder rename uid={} {} -> {} ({} note(s), {} file(s))",
                        uid,
                        params.src_path,
                        params.dst_path,
                        notes.len(),
                        files.len()
                    );
                    Ok(FolderOutcome::Renamed {
                        src: src_folder,
                        dst: dst_folder,
                        notes,
                        files,
                    })
                })
            })
            .await
    }

    pub fn folder_sync(
        &self,
        uid: Uid,
        vault_name: &str,
        cursor: EpochMillis,
    ) -> SyncResult<Vec<FolderRecord>> {
        let vault = self.db.get_or_create_vault(uid, vault_name)?;
        self.db.folders_since(uid, vault.id, cursor)
    }

    // ---------- shares ----------
    // Share tokens grant read-only access to specific rows outside a
    // channel session. The row is re-checked on every verify so a revoke
    // takes effect immediately.

    pub fn share_create(
        &self,
        uid: Uid,
        resources: std::collections::HashMap<String, Vec<i64>>,
        expires_at: EpochMillis,
        codec: &dyn crate::token::TokenCodec,
    ) -> SyncResult<(ShareRecord, String)> {
        let mut share = ShareRecord {
            id: 0,
            share_id: uuid::Uuid::new_v4().to_string(),
            uid,
            resources,
            expires_at,
            revoked: false,
        };
        share.id = self.db.insert_share(&share)?;
        let token = codec.issue(&crate::token::TokenClaims::Share(crate::token::ShareClaims {
            share_id: share.share_id.clone(),
            uid,
            resources: share.resources.clone(),
            expires_at,
        }))?;
        info!("share create uid={} share={}", uid, share.share_id);
        Ok((share, token))
    }

    pub fn share_verify(
        &self,
        token: &str,
        codec: &dyn crate::token::TokenCodec,
    ) -> SyncResult<ShareRecord> {
        let claims = match codec.verify(token)? {
            crate::token::TokenClaims::Share(claims) => claims,
            crate::token::TokenClaims::User(_) => {
                return Err(SyncError::UnauthorizedToken(
                    "user tokens carry no share grant".to_string(),
                ))
            }
        };
        let share = self
            .db
            .get_share(&claims.share_id)?
            .ok_or_else(|| SyncError::ShareNotFound(claims.share_id.clone()))?;
        if share.revoked {
            return Err(SyncError::UnauthorizedToken("share revoked".to_string()));
        }
        if share.expires_at < now_millis() {
            return Err(SyncError::UnauthorizedToken("share expired".to_string()));
        }
        Ok(share)
    }

    pub fn share_revoke(&self, uid: Uid, share_id: &str) -> SyncResult<()> {
        self.db.revoke_share(uid, share_id)?;
        info!("share revoke uid={} share={}", uid, share_id);
        Ok(())
    }

    // ---------- settings ----------

    pub async fn setting_modify(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: SettingModifyParams,
    ) -> SyncResult<SettingRecord> {
        let db = Arc::clone(&self.db);
        self.queue
            .execute(uid, cancel, move || {
                with_retry(|| {
                    let prev_stamp = db
                        .get_setting(uid, &params.key)?
                        .map(|setting| setting.updated_at)
                        .unwrap_or(0);
                    let setting = SettingRecord {
                        uid,
                        key: params.key.clone(),
                        value: params.value.clone(),
                        updated_at: next_stamp(prev_stamp),
                        action: RowAction::Live,
                    };
                    db.upsert_setting(&setting)?;
                    Ok(setting)
                })
            })
            .await
    }

    pub async fn setting_delete(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        params: SettingDeleteParams,
    ) -> SyncResult<SettingRecord> {
        let db = Arc::clone(&self.db);
        self.queue
            .execute(uid, cancel, move || {
                with_retry(|| {
                    let setting = db
                        .get_setting(uid, &params.key)?
                        .ok_or_else(|| SyncError::NoteNotFound(params.key.clone()))?;
                    if setting.action == RowAction::Delete {
                        return Err(SyncError::AlreadyDeleted(setting.key.clone()));
                    }
                    let mut deleted = setting.clone();
                    deleted.action = RowAction::Delete;
                    deleted.updated_at = next_stamp(setting.updated_at);
                    db.upsert_setting(&deleted)?;
                    Ok(deleted)
                })
            })
            .await
    }

    pub async fn setting_clear(&self, uid: Uid, cancel: &CancellationToken) -> SyncResult<usize> {
        let db = Arc::clone(&self.db);
        self.queue
            .execute(uid, cancel, move || {
                with_retry(|| db.clear_settings(uid, now_millis()))
            })
            .await
    }

    pub fn setting_check(&self, uid: Uid, key: &str) -> SyncResult<Option<SettingRecord>> {
        self.db.get_setting(uid, key)
    }

    pub fn setting_sync(&self, uid: Uid, cursor: EpochMillis) -> SyncResult<Vec<SettingRecord>> {
        self.db.settings_since(uid, cursor)
    }
}

/// Server stamps never go backwards for a row, even if the wall clock
/// does.
fn next_stamp(prev: EpochMillis) -> EpochMillis {
    now_millis().max(prev + 1)
}

fn resolve_path_hash(path: Option<&str>, hash: Option<&str>) -> SyncResult<String> {
    match (path, hash) {
        (_, Some(hash)) => Ok(hash.to_string()),
        (Some(path), None) => Ok(path_hash(path)),
        (None, None) => Err(SyncError::InvalidParams(
            "either path or pathHash is required".to_string(),
        )),
    }
}

fn rewrite_params(vault: &str, path: &str, content: String) -> NoteModifyParams {
    NoteModifyParams {
        vault: vault.to_string(),
        path: path.to_string(),
        content,
        content_hash: None,
        ctime: None,
        mtime: None,
        force: true,
        client_name: String::new(),
        client_version: String::new(),
    }
}

/// Shared by note_rename and folder_rename. Must run inside a write slot.
fn rename_note_row(
    db: &Database,
    history: &Arc<HistoryKeeper>,
    uid: Uid,
    vault_id: VaultId,
    src_path: &str,
    dst_path: &str,
) -> SyncResult<NoteOutcome> {
    let src_hash = path_hash(src_path);
    let dst_hash = path_hash(dst_path);

    let src = db
        .get_note(uid, vault_id, &src_hash)?
        .ok_or_else(|| SyncError::NoteNotFound(src_path.to_string()))?;
    if src.action == RowAction::Delete {
        return Err(SyncError::AlreadyDeleted(src.path.clone()));
    }
    let dst_existing = db.get_note(uid, vault_id, &dst_hash)?;
    if let Some(target) = &dst_existing {
        if target.action == RowAction::Live {
            return Err(SyncError::RenameTargetExists(dst_path.to_string()));
        }
    }

    // A pending debounce window for src refers to content that is about
    // to live under another id.
    history.flush(uid, src.id);

    let mut src_tombstone = src.clone();
    src_tombstone.action = RowAction::Delete;
    src_tombstone.updated_at = next_stamp(src.updated_at);
    db.update_note(&src_tombstone)?;

    let dst = match dst_existing {
        Some(tombstone) => {
            let mut revived = tombstone.clone();
            revived.action = RowAction::Live;
            revived.version = tombstone.version + 1;
            revived.content = src.content.clone();
            revived.content_hash = src.content_hash.clone();
            revived.ctime = src.ctime;
            revived.mtime = next_stamp(src.mtime);
            revived.updated_at = next_stamp(tombstone.updated_at);
            revived.client_name = src.client_name.clone();
            revived.client_version = src.client_version.clone();
            db.update_note(&revived)?;
            revived
        }
        None => {
            let mut moved = NoteRecord {
                id: 0,
                uid,
                vault_id,
                path: dst_path.to_string(),
                path_hash: dst_hash,
                content: src.content.clone(),
                content_hash: src.content_hash.clone(),
                version: src.version + 1,
                ctime: src.ctime,
                mtime: next_stamp(src.mtime),
                updated_at: now_millis(),
                action: RowAction::Live,
                client_name: src.client_name.clone(),
                client_version: src.client_version.clone(),
            };
            moved.id = db.insert_note(&moved)?;
            moved
        }
    };
    info!("note rename uid={} {} -> {}", uid, src_path, dst_path);
    Ok(NoteOutcome::Renamed {
        src: src_tombstone,
        dst,
    })
}

fn rename_file_row(
    db: &Database,
    uid: Uid,
    vault_id: VaultId,
    src_path: &str,
    dst_path: &str,
) -> SyncResult<FileOutcome> {
    let src_hash = path_hash(src_path);
    let dst_hash = path_hash(dst_path);

    let src = db
        .get_file(uid, vault_id, &src_hash)?
        .ok_or_else(|| SyncError::FileNotFound(src_path.to_string()))?;
    if src.action == RowAction::Delete {
        return Err(SyncError::AlreadyDeleted(src.path.clone()));
    }
    let dst_existing = db.get_file(uid, vault_id, &dst_hash)?;
    if let Some(target) = &dst_existing {
        if target.action == RowAction::Live {
            return Err(SyncError::RenameTargetExists(dst_path.to_string()));
        }
    }

    let mut src_tombstone = src.clone();
    src_tombstone.action = RowAction::Delete;
    src_tombstone.updated_at = next_stamp(src.updated_at);
    db.update_file(&src_tombstone)?;

    let dst = match dst_existing {
        Some(tombstone) => {
            let mut revived = tombstone.clone();
            revived.action = RowAction::Live;
            revived.version = tombstone.version + 1;
            revived.blob_key = src.blob_key.clone();
            revived.size = src.size;
            revived.mime_type = src.mime_type.clone();
            revived.content_hash = src.content_hash.clone();
            revived.ctime = src.ctime;
            revived.mtime = next_stamp(src.mtime);
            revived.updated_at = next_stamp(tombstone.updated_at);
            db.update_file(&revived)?;
            revived
        }
        None => {
            let mut moved = FileRecord {
                id: 0,
                uid,
                vault_id,
                path: dst_path.to_string(),
                path_hash: dst_hash,
                blob_key: src.blob_key.clone(),
                size: src.size,
                mime_type: mime_guess::from_path(dst_path)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string(),
                content_hash: src.content_hash.clone(),
                version: src.version + 1,
                ctime: src.ctime,
                mtime: next_stamp(src.mtime),
                updated_at: now_millis(),
                action: RowAction::Live,
                client_name: src.client_name.clone(),
                client_version: src.client_version.clone(),
            };
            moved.id = db.insert_file(&moved)?;
            moved
        }
    };
    info!("file rename uid={} {} -> {}", uid, src_path, dst_path);
    Ok(FileOutcome::Renamed {
        src: src_tombstone,
        dst,
    })
}

/// Set or replace one key in the YAML frontmatter block, creating the
/// block when the note has none.
fn patch_frontmatter(content: &str, key: &str, value: &str) -> String {
    let Some(rest) = content.strip_prefix("---\n") else {
        return format!("---\n{}: {}\n---\n{}", key, value, content);
    };
    let Some(end) = rest.find("\n---") else {
        return format!("---\n{}: {}\n---\n{}", key, value, content);
    };
    let (block, tail) = rest.split_at(end);
    let mut lines: Vec<String> = block.lines().map(|line| line.to_string()).collect();
    let prefix = format!("{}:", key);
    match lines.iter_mut().find(|line| line.starts_with(&prefix)) {
        Some(line) => *line = format!("{}: {}", key, value),
        None => lines.push(format!("{}: {}", key, value)),
    }
    format!("---\n{}{}", lines.join("\n"), tail)
}

/// Retry a storage closure on transient sqlite failures (busy/locked)
/// with bounded backoff. Anything else propagates immediately.
fn with_retry<T>(mut work: impl FnMut() -> SyncResult<T>) -> SyncResult<T> {
    let mut delay = Duration::from_millis(10);
    let mut attempt = 0;
    loop {
        match work() {
            Err(SyncError::SqliteError(err)) if is_transient(&err) && attempt < 3 => {
                attempt += 1;
                std::thread::sleep(delay);
                delay *= 2;
            }
            other => return other,
        }
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}
