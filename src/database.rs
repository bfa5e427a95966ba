use crate::types::*;
use log::debug;
use rusqlite::params;
use rusqlite::OptionalExtension;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// All sync state lives in one sqlite file. Rows are keyed by
// (uid, vault_id, path_hash) so a logical path maps to exactly one row
// whether it is live or soft-deleted. Writers are serialized per user by
// the write queue, so the connection mutex here is only contended by
// cross-user traffic and reads.

/// Repository over the relational store: users, vaults, notes, files,
/// folders, note_history, shares, settings.
pub struct Database {
    db: Mutex<rusqlite::Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(db_path: &Path) -> SyncResult<Database> {
        let connection = rusqlite::Connection::open(db_path)?;
        connection.execute_batch(
            "create table if not exists users (
uid integer primary key autoincrement,
name text not null unique,
nickname text not null,
password_hash text not null,
is_admin int not null default 0,
credentials_version int not null default 1
);
create table if not exists vaults (
id integer primary key autoincrement,
uid int not null,
name text not null,
unique (uid, name)
);
create table if not exists notes (
id integer primary key autoincrement,
uid int not null,
vault_id int not null,
path text not null,
path_hash char(32) not null,
content text not null,
content_hash char(32) not null,
version int not null,
ctime int not null,
mtime int not null,
updated_at int not null,
action int not null,
client_name text not null default '',
client_version text not null default '',
unique (uid, vault_id, path_hash)
);
create table if not exists files (
id integer primary key autoincrement,
uid int not null,
vault_id int not null,
path text not null,
path_hash char(32) not null,
blob_key char(32) not null,
size int not null,
mime_type text not null,
content_hash char(32) not null,
version int not null,
ctime int not null,
mtime int not null,
updated_at int not null,
action int not null,
client_name text not null default '',
client_version text not null default '',
unique (uid, vault_id, path_hash)
);
create table if not exists folders (
id integer primary key autoincrement,
uid int not null,
vault_id int not null,
path text not null,
path_hash char(32) not null,
mtime int not null,
updated_at int not null,
action int not null,
unique (uid, vault_id, path_hash)
);
create table if not exists note_history (
id integer primary key autoincrement,
note_id int not null,
uid int not null,
content text not null,
content_hash char(32) not null,
version int not null,
captured_at int not null,
client_name text not null default ''
);
create index if not exists note_history_note on note_history (note_id);
create table if not exists shares (
id integer primary key autoincrement,
share_id text not null unique,
uid int not null,
resources text not null,
expires_at int not null,
revoked int not null default 0
);
create table if not exists settings (
uid int not null,
key text not null,
value text not null,
updated_at int not null,
action int not null,
primary key (uid, key)
);",
        )?;
        Ok(Database {
            db: Mutex::new(connection),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.db_path.clone()
    }

    // ---------- users ----------

    pub fn create_user(
        &self,
        name: &str,
        nickname: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> SyncResult<UserRecord> {
        let db = self.db.lock().unwrap();
        db.execute(
            "insert into users (name, nickname, password_hash, is_admin) values (?, ?, ?, ?)",
            params![name, nickname, password_hash, is_admin as i64],
        )?;
        let uid = db.last_insert_rowid();
        Ok(UserRecord {
            uid,
            name: name.to_string(),
            nickname: nickname.to_string(),
            password_hash: password_hash.to_string(),
            is_admin,
            credentials_version: 1,
        })
    }

    pub fn get_user_by_name(&self, name: &str) -> SyncResult<Option<UserRecord>> {
        let db = self.db.lock().unwrap();
        let user = db
            .query_row(
                &format!("select {} from users where name=?", USER_COLS),
                [name],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user(&self, uid: Uid) -> SyncResult<Option<UserRecord>> {
        let db = self.db.lock().unwrap();
        let user = db
            .query_row(
                &format!("select {} from users where uid=?", USER_COLS),
                [uid],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// A password change also bumps the credentials version, which
    /// invalidates every token minted against the old one.
    pub fn update_password(&self, uid: Uid, password_hash: &str) -> SyncResult<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "update users set password_hash=?, credentials_version=credentials_version+1
where uid=?",
            params![password_hash, uid],
        )?;
        if changed == 0 {
            return Err(SyncError::Unauthorized);
        }
        Ok(())
    }

    // ---------- vaults ----------

    pub fn get_or_create_vault(&self, uid: Uid, name: &str) -> SyncResult<VaultRecord> {
        let db = self.db.lock().unwrap();
        let existing = db
            .query_row(
                "select id from vaults where uid=? and name=?",
                params![uid, name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        let id = match existing {
            Some(id) => id,
            None => {
                // Two sessions of one user can race here; the unique
                // constraint makes the second insert a no-op.
                db.execute(
                    "insert or ignore into vaults (uid, name) values (?, ?)",
                    params![uid, name],
                )?;
                db.query_row(
                    "select id from vaults where uid=? and name=?",
                    params![uid, name],
                    |row| row.get(0),
                )?
            }
        };
        Ok(VaultRecord {
            id,
            uid,
            name: name.to_string(),
        })
    }

    /// Deleting a vault cascades to every entity it contains.
    pub fn delete_vault(&self, uid: Uid, vault_id: VaultId) -> SyncResult<()> {
        let mut db = self.db.lock().unwrap();
        let transaction = db.transaction()?;
        transaction.execute(
            "delete from note_history where note_id in
(select id from notes where uid=? and vault_id=?)",
            params![uid, vault_id],
        )?;
        transaction.execute(
            "delete from notes where uid=? and vault_id=?",
            params![uid, vault_id],
        )?;
        transaction.execute(
            "delete from files where uid=? and vault_id=?",
            params![uid, vault_id],
        )?;
        transaction.execute(
            "delete from folders where uid=? and vault_id=?",
            params![uid, vault_id],
        )?;
        transaction.execute(
            "delete from vaults where uid=? and id=?",
            params![uid, vault_id],
        )?;
        transaction.commit()?;
        Ok(())
    }

    // ---------- notes ----------

    pub fn get_note(
        &self,
        uid: Uid,
        vault_id: VaultId,
        path_hash: &str,
    ) -> SyncResult<Option<NoteRecord>> {
        let db = self.db.lock().unwrap();
        let note = db
            .query_row(
                &format!("select {} from notes where uid=? and vault_id=? and path_hash=?", NOTE_COLS),
                params![uid, vault_id, path_hash],
                note_from_row,
            )
            .optional()?;
        Ok(note)
    }

    pub fn get_note_by_id(&self, uid: Uid, id: NoteId) -> SyncResult<Option<NoteRecord>> {
        let db = self.db.lock().unwrap();
        let note = db
            .query_row(
                &format!("select {} from notes where uid=? and id=?", NOTE_COLS),
                params![uid, id],
                note_from_row,
            )
            .optional()?;
        Ok(note)
    }

    pub fn insert_note(&self, note: &NoteRecord) -> SyncResult<NoteId> {
        let db = self.db.lock().unwrap();
        db.execute(
            "insert into notes (uid, vault_id, path, path_hash, content, content_hash,
version, ctime, mtime, updated_at, action, client_name, client_version)
values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                note.uid,
                note.vault_id,
                note.path,
                note.path_hash,
                note.content,
                note.content_hash,
                note.version,
                note.ctime,
                note.mtime,
                note.updated_at,
                note.action.to_i64(),
                note.client_name,
                note.client_version,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Overwrite the row identified by `note.id` with the new image.
    pub fn update_note(&self, note: &NoteRecord) -> SyncResult<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "update notes set path=?, path_hash=?, content=?, content_hash=?, version=?,
ctime=?, mtime=?, updated_at=?, action=?, client_name=?, client_version=?
where id=?",
            params![
                note.path,
                note.path_hash,
                note.content,
                note.content_hash,
                note.version,
                note.ctime,
                note.mtime,
                note.updated_at,
                note.action.to_i64(),
                note.client_name,
                note.client_version,
                note.id,
            ],
        )?;
        Ok(())
    }

    /// Incremental pull: every row (deleted ones included) the client has
    /// not seen yet, ordered by cursor.
    pub fn notes_since(
        &self,
        uid: Uid,
        vault_id: VaultId,
        cursor: EpochMillis,
    ) -> SyncResult<Vec<NoteRecord>> {
        let db = self.db.lock().unwrap();
        let mut statement = db.prepare(&format!(
            "select {} from notes where uid=? and vault_id=? and updated_at>? order by updated_at",
            NOTE_COLS
        ))?;
        let mut rows = statement.query(params![uid, vault_id, cursor])?;
        let mut notes = vec![];
        while let Some(row) = rows.next()? {
            notes.push(note_from_row(row)?);
        }
        Ok(notes)
    }

    /// Live notes whose path starts with `prefix`, for folder renames.
    pub fn notes_under(
        &self,
        uid: Uid,
        vault_id: VaultId,
        prefix: &str,
    ) -> SyncResult<Vec<NoteRecord>> {
        let db = self.db.lock().unwrap();
        let mut statement = db.prepare(&format!(
            "select {} from notes where uid=? and vault_id=? and action=0 and path like ? escape '\\'",
            NOTE_COLS
        ))?;
        let pattern = format!("{}%", like_escape(prefix));
        let mut rows = statement.query(params![uid, vault_id, pattern])?;
        let mut notes = vec![];
        while let Some(row) = rows.next()? {
            notes.push(note_from_row(row)?);
        }
        Ok(notes)
    }

    /// Hard-delete soft-deleted notes past retention. Returns how many
    /// rows went away.
    pub fn purge_notes_before(&self, cutoff: EpochMillis) -> SyncResult<usize> {
        let mut db = self.db.lock().unwrap();
        let transaction = db.transaction()?;
        transaction.execute(
            "delete from note_history where note_id in
(select id from notes where action=1 and updated_at<?)",
            [cutoff],
        )?;
        let purged = transaction.execute(
            "delete from notes where action=1 and updated_at<?",
            [cutoff],
        )?;
        transaction.commit()?;
        Ok(purged)
    }

    // ---------- files ----------

    pub fn get_file(
        &self,
        uid: Uid,
        vault_id: VaultId,
        path_hash: &str,
    ) -> SyncResult<Option<FileRecord>> {
        let db = self.db.lock().unwrap();
        let file = db
            .query_row(
                &format!("select {} from files where uid=? and vault_id=? and path_hash=?", FILE_COLS),
                params![uid, vault_id, path_hash],
                file_from_row,
            )
            .optional()?;
        Ok(file)
    }

    pub fn get_file_by_id(&self, uid: Uid, id: FileId) -> SyncResult<Option<FileRecord>> {
        let db = self.db.lock().unwrap();
        let file = db
            .query_row(
                &format!("select {} from files where uid=? and id=?", FILE_COLS),
                params![uid, id],
                file_from_row,
            )
            .optional()?;
        Ok(file)
    }

    pub fn insert_file(&self, file: &FileRecord) -> SyncResult<FileId> {
        let db = self.db.lock().unwrap();
        db.execute(
            "insert into files (uid, vault_id, path, path_hash, blob_key, size, mime_type,
content_hash, version, ctime, mtime, updated_at, action, client_name, client_version)
values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                file.uid,
                file.vault_id,
                file.path,
                file.path_hash,
                file.blob_key,
                file.size,
                file.mime_type,
                file.content_hash,
                file.version,
                file.ctime,
                file.mtime,
                file.updated_at,
                file.action.to_i64(),
                file.client_name,
                file.client_version,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn update_file(&self, file: &FileRecord) -> SyncResult<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "update files set path=?, path_hash=?, blob_key=?, size=?, mime_type=?,
content_hash=?, version=?, ctime=?, mtime=?, updated_at=?, action=?,
client_name=?, client_version=? where id=?",
            params![
                file.path,
                file.path_hash,
                file.blob_key,
                file.size,
                file.mime_type,
                file.content_hash,
                file.version,
                file.ctime,
                file.mtime,
                file.updated_at,
                file.action.to_i64(),
                file.client_name,
                file.client_version,
                file.id,
            ],
        )?;
        Ok(())
    }

    pub fn files_since(
        &self,
        uid: Uid,
        vault_id: VaultId,
        cursor: EpochMillis,
    ) -> SyncResult<Vec<FileRecord>> {
        let db = self.db.lock().unwrap();
        let mut statement = db.prepare(&format!(
            "select {} from files where uid=? and vault_id=? and updated_at>? order by updated_at",
            FILE_COLS
        ))?;
        let mut rows = statement.query(params![uid, vault_id, cursor])?;
        let mut files = vec![];
        while let Some(row) = rows.next()? {
            files.push(file_from_row(row)?);
        }
        Ok(files)
    }

    pub fn files_under(
        &self,
        uid: Uid,
        vault_id: VaultId,
        prefix: &str,
    ) -> SyncResult<Vec<FileRecord>> {
        let db = self.db.lock().unwrap();
        let mut statement = db.prepare(&format!(
            "select {} from files where uid=? and vault_id=? and action=0 and path like ? escape '\\'",
            FILE_COLS
        ))?;
        let pattern = format!("{}%", like_escape(prefix));
        let mut rows = statement.query(params![uid, vault_id, pattern])?;
        let mut files = vec![];
        while let Some(row) = rows.next()? {
            files.push(file_from_row(row)?);
        }
        Ok(files)
    }

    /// How many file rows (live or deleted) still reference a blob.
    /// Blobs are content-addressed, so several paths can share one.
    pub fn count_files_with_blob(&self, blob_key: &str) -> SyncResult<i64> {
        let db = self.db.lock().unwrap();
        let count = db.query_row(
            "select count(*) from files where blob_key=?",
            [blob_key],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Hard-delete soft-deleted files past retention. Returns the blob
    /// keys of the purged rows so the caller can garbage-collect.
    pub fn purge_files_before(&self, cutoff: EpochMillis) -> SyncResult<Vec<String>> {
        let mut db = self.db.lock().unwrap();
        let transaction = db.transaction()?;
        let keys = {
            let mut statement = transaction
                .prepare("select blob_key from files where action=1 and updated_at<?")?;
            let mut rows = statement.query([cutoff])?;
            let mut keys = vec![];
            while let Some(row) = rows.next()? {
                keys.push(row.get(0)?);
            }
            keys
        };
        transaction.execute("delete from files where action=1 and updated_at<?", [cutoff])?;
        transaction.commit()?;
        Ok(keys)
    }

    // ---------- folders ----------

    pub fn get_folder(
        &self,
        uid: Uid,
        vault_id: VaultId,
        path_hash: &str,
    ) -> SyncResult<Option<FolderRecord>> {
        let db = self.db.lock().unwrap();
        let folder = db
            .query_row(
                &format!(
                    "select {} from folders where uid=? and vault_id=? and path_hash=?",
                    FOLDER_COLS
                ),
                params![uid, vault_id, path_hash],
                folder_from_row,
            )
            .optional()?;
        Ok(folder)
    }

    pub fn insert_folder(&self, folder: &FolderRecord) -> SyncResult<FolderId> {
        let db = self.db.lock().unwrap();
        db.execute(
            "insert into folders (uid, vault_id, path, path_hash, mtime, updated_at, action)
values (?, ?, ?, ?, ?, ?, ?)",
            params![
                folder.uid,
                folder.vault_id,
                folder.path,
                folder.path_hash,
                folder.mtime,
                folder.updated_at,
                folder.action.to_i64(),
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn update_folder(&self, folder: &FolderRecord) -> SyncResult<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "update folders set path=?, path_hash=?, mtime=?, updated_at=?, action=? where id=?",
            params![
                folder.path,
                folder.path_hash,
                folder.mtime,
                folder.updated_at,
                folder.action.to_i64(),
                folder.id,
            ],
        )?;
        Ok(())
    }

    pub fn folders_since(
        &self,
        uid: Uid,
        vault_id: VaultId,
        cursor: EpochMillis,
    ) -> SyncResult<Vec<FolderRecord>> {
        let db = self.db.lock().unwrap();
        let mut statement = db.prepare(&format!(
            "select {} from folders where uid=? and vault_id=? and updated_at>? order by updated_at",
            FOLDER_COLS
        ))?;
        let mut rows = statement.query(params![uid, vault_id, cursor])?;
        let mut folders = vec![];
        while let Some(row) = rows.next()? {
            folders.push(folder_from_row(row)?);
        }
        Ok(folders)
    }

    pub fn purge_folders_before(&self, cutoff: EpochMillis) -> SyncResult<usize> {
        let db = self.db.lock().unwrap();
        let purged = db.execute("delete from folders where action=1 and updated_at<?", [cutoff])?;
        Ok(purged)
    }

    // ---------- note history ----------

    pub fn insert_history(&self, entry: &HistoryRecord) -> SyncResult<i64> {
        let db = self.db.lock().unwrap();
        db.execute(
            "insert into note_history (note_id, uid, content, content_hash, version,
captured_at, client_name) values (?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.note_id,
                entry.uid,
                entry.content,
                entry.content_hash,
                entry.version,
                entry.captured_at,
                entry.client_name,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Evict the oldest rows beyond the per-note cap.
    pub fn trim_history(&self, note_id: NoteId, keep: u32) -> SyncResult<usize> {
        let db = self.db.lock().unwrap();
        let trimmed = db.execute(
            "delete from note_history where note_id=?1 and id not in
(select id from note_history where note_id=?1 order by id desc limit ?2)",
            params![note_id, keep as i64],
        )?;
        Ok(trimmed)
    }

    pub fn history_for_note(&self, uid: Uid, note_id: NoteId) -> SyncResult<Vec<HistoryRecord>> {
        let db = self.db.lock().unwrap();
        let mut statement = db.prepare(
            "select id, note_id, uid, content, content_hash, version, captured_at, client_name
from note_history where uid=? and note_id=? order by id desc",
        )?;
        let mut rows = statement.query(params![uid, note_id])?;
        let mut entries = vec![];
        while let Some(row) = rows.next()? {
            entries.push(HistoryRecord {
                id: row.get(0)?,
                note_id: row.get(1)?,
                uid: row.get(2)?,
                content: row.get(3)?,
                content_hash: row.get(4)?,
                version: row.get(5)?,
                captured_at: row.get(6)?,
                client_name: row.get(7)?,
            });
        }
        Ok(entries)
    }

    // ---------- shares ----------

    pub fn insert_share(&self, share: &ShareRecord) -> SyncResult<i64> {
        let db = self.db.lock().unwrap();
        let resources = serde_json::to_string(&share.resources)?;
        db.execute(
            "insert into shares (share_id, uid, resources, expires_at, revoked)
values (?, ?, ?, ?, ?)",
            params![
                share.share_id,
                share.uid,
                resources,
                share.expires_at,
                share.revoked as i64,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    pub fn get_share(&self, share_id: &str) -> SyncResult<Option<ShareRecord>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                "select id, share_id, uid, resources, expires_at, revoked from shares where share_id=?",
                [share_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Uid>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, EpochMillis>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((id, share_id, uid, resources, expires_at, revoked)) => {
                let resources: HashMap<String, Vec<i64>> = serde_json::from_str(&resources)?;
                Ok(Some(ShareRecord {
                    id,
                    share_id,
                    uid,
                    resources,
                    expires_at,
                    revoked: revoked != 0,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn revoke_share(&self, uid: Uid, share_id: &str) -> SyncResult<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "update shares set revoked=1 where uid=? and share_id=?",
            params![uid, share_id],
        )?;
        if changed == 0 {
            return Err(SyncError::ShareNotFound(share_id.to_string()));
        }
        Ok(())
    }

    // ---------- settings ----------

    pub fn get_setting(&self, uid: Uid, key: &str) -> SyncResult<Option<SettingRecord>> {
        let db = self.db.lock().unwrap();
        let setting = db
            .query_row(
                "select uid, key, value, updated_at, action from settings where uid=? and key=?",
                params![uid, key],
                setting_from_row,
            )
            .optional()?;
        Ok(setting)
    }

    pub fn upsert_setting(&self, setting: &SettingRecord) -> SyncResult<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "insert into settings (uid, key, value, updated_at, action) values (?, ?, ?, ?, ?)
on conflict (uid, key) do update set value=excluded.value,
updated_at=excluded.updated_at, action=excluded.action",
            params![
                setting.uid,
                setting.key,
                setting.value,
                setting.updated_at,
                setting.action.to_i64(),
            ],
        )?;
        Ok(())
    }

    pub fn settings_since(&self, uid: Uid, cursor: EpochMillis) -> SyncResult<Vec<SettingRecord>> {
        let db = self.db.lock().unwrap();
        let mut statement = db.prepare(
            "select uid, key, value, updated_at, action from settings
where uid=? and updated_at>? order by updated_at",
        )?;
        let mut rows = statement.query(params![uid, cursor])?;
        let mut settings = vec![];
        while let Some(row) = rows.next()? {
            settings.push(setting_from_row(row)?);
        }
        Ok(settings)
    }

    /// Soft-delete every setting of a user in one sweep.
    pub fn clear_settings(&self, uid: Uid, updated_at: EpochMillis) -> SyncResult<usize> {
        let db = self.db.lock().unwrap();
        let cleared = db.execute(
            "update settings set action=1, updated_at=? where uid=? and action=0",
            params![updated_at, uid],
        )?;
        debug!("clear_settings(uid={}) => {} rows", uid, cleared);
        Ok(cleared)
    }

    pub fn purge_settings_before(&self, cutoff: EpochMillis) -> SyncResult<usize> {
        let db = self.db.lock().unwrap();
        let purged = db.execute("delete from settings where action=1 and updated_at<?", [cutoff])?;
        Ok(purged)
    }
}

const USER_COLS: &str = "uid, name, nickname, password_hash, is_admin, credentials_version";

const NOTE_COLS: &str = "id, uid, vault_id, path, path_hash, content, content_hash, version,
ctime, mtime, updated_at, action, client_name, client_version";

const FILE_COLS: &str = "id, uid, vault_id, path, path_hash, blob_key, size, mime_type,
content_hash, version, ctime, mtime, updated_at, action, client_name, client_version";

const FOLDER_COLS: &str = "id, uid, vault_id, path, path_hash, mtime, updated_at, action";

fn user_from_row(row: &rusqlite::Row) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        uid: row.get(0)?,
        name: row.get(1)?,
        nickname: row.get(2)?,
        password_hash: row.get(3)?,
        is_admin: row.get::<_, i64>(4)? != 0,
        credentials_version: row.get(5)?,
    })
}

fn note_from_row(row: &rusqlite::Row) -> rusqlite::Result<NoteRecord> {
    Ok(NoteRecord {
        id: row.get(0)?,
        uid: row.get(1)?,
        vault_id: row.get(2)?,
        path: row.get(3)?,
        path_hash: row.get(4)?,
        content: row.get(5)?,
        content_hash: row.get(6)?,
        version: row.get(7)?,
        ctime: row.get(8)?,
        mtime: row.get(9)?,
        updated_at: row.get(10)?,
        action: RowAction::from_i64(row.get(11)?),
        client_name: row.get(12)?,
        client_version: row.get(13)?,
    })
}

fn file_from_row(row: &rusqlite::Row) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        uid: row.get(1)?,
        vault_id: row.get(2)?,
        path: row.get(3)?,
        path_hash: row.get(4)?,
        blob_key: row.get(5)?,
        size: row.get(6)?,
        mime_type: row.get(7)?,
        content_hash: row.get(8)?,
        version: row.get(9)?,
        ctime: row.get(10)?,
        mtime: row.get(11)?,
        updated_at: row.get(12)?,
        action: RowAction::from_i64(row.get(13)?),
        client_name: row.get(14)?,
        client_version: row.get(15)?,
    })
}

fn folder_from_row(row: &rusqlite::Row) -> rusqlite::Result<FolderRecord> {
    Ok(FolderRecord {
        id: row.get(0)?,
        uid: row.get(1)?,
        vault_id: row.get(2)?,
        path: row.get(3)?,
        path_hash: row.get(4)?,
        mtime: row.get(5)?,
        updated_at: row.get(6)?,
        action: RowAction::from_i64(row.get(7)?),
    })
}

fn setting_from_row(row: &rusqlite::Row) -> rusqlite::Result<SettingRecord> {
    Ok(SettingRecord {
        uid: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        updated_at: row.get(3)?,
        action: RowAction::from_i64(row.get(4)?),
    })
}

/// Escape LIKE metacharacters so a path prefix matches literally.
fn like_escape(prefix: &str) -> String {
    prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
