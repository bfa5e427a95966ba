use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub type Uid = i64;
pub type VaultId = i64;
pub type NoteId = i64;
pub type FileId = i64;
pub type FolderId = i64;
/// Server-side epoch milliseconds.
pub type EpochMillis = i64;
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Default preferred chunk size for attachment transfer. The client may
/// ask for a different one in FileUploadCheck.
pub const DEFAULT_CHUNK_SIZE: u32 = 512 * 1024;

/// Largest frame we accept or produce on the wire.
pub const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// The address the sync endpoint listens on.
    pub listen_address: String,
    /// Path to the directory that stores the database.
    pub db_path: String,
    /// Path to the directory that stores attachment blobs.
    pub blob_path: String,
    /// Server secret used for token signing. Salted with `machine_id`.
    pub secret: String,
    /// Stable machine identifier mixed into the token signing key.
    pub machine_id: String,
    /// User-token validity in seconds.
    pub token_expiry: u64,
    /// Share-token validity in seconds.
    pub share_token_expiry: u64,
    /// Grace period before hard-reaping soft-deleted rows, in seconds.
    pub soft_delete_retention_time: u64,
    /// Max history rows kept per note. Values below 100 are rejected.
    pub history_keep_versions: u32,
    /// History debounce window in seconds. Values below 10 are rejected.
    pub history_save_delay: u64,
    /// Idle cutoff for chunked upload sessions, in seconds.
    pub upload_session_timeout: u64,
    /// Preferred attachment chunk size in bytes.
    pub file_chunk_size: u32,
    /// Per-user write queue depth.
    pub write_queue_capacity: usize,
    /// Max wait for a queued write, in seconds.
    pub write_queue_timeout: u64,
    /// Reclaim interval for empty write queues, in seconds.
    pub write_queue_idle_time: u64,
    /// Frame cap for inbound messages.
    pub ws_read_max_payload_size: usize,
    /// Frame cap for outbound messages.
    pub ws_write_max_payload_size: usize,
    /// If true, send a reply envelope even for pure successes.
    pub send_success_replies: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen_address: "127.0.0.1:4800".to_string(),
            db_path: "./data".to_string(),
            blob_path: "./blobs".to_string(),
            secret: String::new(),
            machine_id: String::new(),
            token_expiry: 365 * 24 * 3600,
            share_token_expiry: 30 * 24 * 3600,
            soft_delete_retention_time: 7 * 24 * 3600,
            history_keep_versions: 100,
            history_save_delay: 10,
            upload_session_timeout: 24 * 3600,
            file_chunk_size: DEFAULT_CHUNK_SIZE,
            write_queue_capacity: 100,
            write_queue_timeout: 30,
            write_queue_idle_time: 600,
            ws_read_max_payload_size: MAX_FRAME_SIZE,
            ws_write_max_payload_size: MAX_FRAME_SIZE,
            send_success_replies: false,
        }
    }
}

impl Config {
    /// Reject configurations that would break protocol assumptions.
    pub fn validate(&self) -> SyncResult<()> {
        if self.secret.is_empty() {
            return Err(SyncError::InvalidParams("secret must not be empty".to_string()));
        }
        if self.history_save_delay < 10 {
            return Err(SyncError::InvalidParams(
                "history_save_delay must be at least 10 seconds".to_string(),
            ));
        }
        if self.history_keep_versions < 100 {
            return Err(SyncError::InvalidParams(
                "history_keep_versions must be at least 100".to_string(),
            ));
        }
        if self.file_chunk_size == 0 {
            return Err(SyncError::InvalidParams("file_chunk_size must be positive".to_string()));
        }
        if self.write_queue_capacity == 0 {
            return Err(SyncError::InvalidParams(
                "write_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Soft-delete state of a row. Deleted rows stay around until the reaper
/// hardens the delete after the retention window.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RowAction {
    Live,
    Delete,
}

impl RowAction {
    pub fn to_i64(self) -> i64 {
        match self {
            RowAction::Live => 0,
            RowAction::Delete => 1,
        }
    }

    pub fn from_i64(val: i64) -> RowAction {
        if val == 0 {
            RowAction::Live
        } else {
            RowAction::Delete
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NoteRecord {
    pub id: NoteId,
    #[serde(skip_serializing, default)]
    pub uid: Uid,
    pub vault_id: VaultId,
    pub path: String,
    pub path_hash: String,
    pub content: String,
    pub content_hash: String,
    pub version: i64,
    pub ctime: EpochMillis,
    pub mtime: EpochMillis,
    pub updated_at: EpochMillis,
    pub action: RowAction,
    pub client_name: String,
    pub client_version: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: FileId,
    #[serde(skip_serializing, default)]
    pub uid: Uid,
    pub vault_id: VaultId,
    pub path: String,
    pub path_hash: String,
    pub blob_key: String,
    pub size: i64,
    pub mime_type: String,
    pub content_hash: String,
    pub version: i64,
    pub ctime: EpochMillis,
    pub mtime: EpochMillis,
    pub updated_at: EpochMillis,
    pub action: RowAction,
    pub client_name: String,
    pub client_version: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FolderRecord {
    pub id: FolderId,
    #[serde(skip_serializing, default)]
    pub uid: Uid,
    pub vault_id: VaultId,
    pub path: String,
    pub path_hash: String,
    pub mtime: EpochMillis,
    pub updated_at: EpochMillis,
    pub action: RowAction,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: i64,
    pub note_id: NoteId,
    #[serde(skip_serializing, default)]
    pub uid: Uid,
    pub content: String,
    pub content_hash: String,
    pub version: i64,
    pub captured_at: EpochMillis,
    pub client_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SettingRecord {
    #[serde(skip_serializing, default)]
    pub uid: Uid,
    pub key: String,
    pub value: String,
    pub updated_at: EpochMillis,
    pub action: RowAction,
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub uid: Uid,
    pub name: String,
    pub nickname: String,
    /// Salted digest of the password, not the password itself.
    pub password_hash: String,
    pub is_admin: bool,
    /// Bumped on every password change; tokens carry the value they
    /// were minted against.
    pub credentials_version: i64,
}

#[derive(Debug, Clone)]
pub struct VaultRecord {
    pub id: VaultId,
    pub uid: Uid,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ShareRecord {
    pub id: i64,
    pub share_id: String,
    pub uid: Uid,
    /// Map of resource kind ("note" | "file") to granted row ids.
    pub resources: std::collections::HashMap<String, Vec<i64>>,
    pub expires_at: EpochMillis,
    pub revoked: bool,
}

#[derive(Debug)]
pub enum SyncError {
    // Errors the client caused and can act on.
    InvalidParams(String),
    Unauthorized,
    UnauthorizedToken(String),
    NoteNotFound(String),
    FileNotFound(String),
    VaultNotFound(String),
    ShareNotFound(String),
    AlreadyDeleted(String),
    RenameTargetExists(String),
    StaleConflict(String),
    QuotaExceeded(String),
    // Write queue backpressure, both surface as TooManyRequests.
    QueueFull,
    QueueTimeout,
    QueueClosed,
    Cancelled,
    // Attachment transport.
    UploadSessionNotFound(String),
    BadChunk(String),
    ChecksumFailed(String, String),
    // Everything below is an internal fault.
    Internal(String),
    SqliteError(rusqlite::Error),
    IoError(std::io::Error),
    JsonError(serde_json::Error),
    WsError(tokio_tungstenite::tungstenite::Error),
}

impl SyncError {
    /// Stable machine-readable wire code. 200 is success and never
    /// produced by an error.
    pub fn code(&self) -> i64 {
        match self {
            SyncError::InvalidParams(_) => 400,
            SyncError::Unauthorized => 401,
            SyncError::UnauthorizedToken(_) => 401,
            SyncError::NoteNotFound(_) => 404,
            SyncError::FileNotFound(_) => 404,
            SyncError::VaultNotFound(_) => 404,
            SyncError::ShareNotFound(_) => 404,
            SyncError::AlreadyDeleted(_) => 410,
            SyncError::RenameTargetExists(_) => 409,
            SyncError::StaleConflict(_) => 412,
            SyncError::QuotaExceeded(_) => 413,
            SyncError::QueueFull => 429,
            SyncError::QueueTimeout => 429,
            SyncError::QueueClosed => 503,
            SyncError::Cancelled => 499,
            SyncError::UploadSessionNotFound(_) => 404,
            SyncError::BadChunk(_) => 422,
            SyncError::ChecksumFailed(_, _) => 423,
            SyncError::Internal(_)
            | SyncError::SqliteError(_)
            | SyncError::IoError(_)
            | SyncError::JsonError(_)
            | SyncError::WsError(_) => 500,
        }
    }

    /// Human-readable message for the reply envelope.
    pub fn message(&self) -> String {
        match self {
            SyncError::InvalidParams(detail) => format!("invalid parameters: {}", detail),
            SyncError::Unauthorized => "not authorized".to_string(),
            SyncError::UnauthorizedToken(reason) => format!("invalid token: {}", reason),
            SyncError::NoteNotFound(path) => format!("note not found: {}", path),
            SyncError::FileNotFound(path) => format!("file not found: {}", path),
            SyncError::VaultNotFound(name) => format!("vault not found: {}", name),
            SyncError::ShareNotFound(id) => format!("share not found: {}", id),
            SyncError::AlreadyDeleted(path) => format!("already deleted: {}", path),
            SyncError::RenameTargetExists(path) => format!("rename target exists: {}", path),
            SyncError::StaleConflict(path) => format!("stale content for: {}", path),
            SyncError::QuotaExceeded(detail) => format!("quota exceeded: {}", detail),
            SyncError::QueueFull => "too many pending writes".to_string(),
            SyncError::QueueTimeout => "write timed out in queue".to_string(),
            SyncError::QueueClosed => "server is shutting down".to_string(),
            SyncError::Cancelled => "request cancelled".to_string(),
            SyncError::UploadSessionNotFound(id) => format!("upload session not found: {}", id),
            SyncError::BadChunk(detail) => format!("bad chunk: {}", detail),
            SyncError::ChecksumFailed(expected, actual) => {
                format!("checksum mismatch: expected {}, got {}", expected, actual)
            }
            SyncError::Internal(_)
            | SyncError::SqliteError(_)
            | SyncError::IoError(_)
            | SyncError::JsonError(_)
            | SyncError::WsError(_) => "internal error".to_string(),
        }
    }

    /// Free-form diagnostic text for the `details` envelope field.
    pub fn details(&self) -> Option<String> {
        match self {
            SyncError::Internal(detail) => Some(detail.clone()),
            SyncError::SqliteError(err) => Some(format!("{}", err)),
            SyncError::IoError(err) => Some(format!("{}", err)),
            SyncError::JsonError(err) => Some(format!("{}", err)),
            SyncError::WsError(err) => Some(format!("{}", err)),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.details() {
            Some(detail) => write!(f, "{} ({})", self.message(), detail),
            None => write!(f, "{}", self.message()),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::SqliteError(err)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::IoError(err)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::JsonError(err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::WsError(err)
    }
}

/// Current server time in epoch milliseconds.
pub fn now_millis() -> EpochMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as EpochMillis)
        .unwrap_or(0)
}

/// 32-hex digest of a logical path, used as an indexable equality key.
pub fn path_hash(path: &str) -> String {
    format!("{:x}", md5::compute(path.as_bytes()))
}

/// 32-hex digest of content bytes, used for idempotence and as blob key.
pub fn content_hash(content: &[u8]) -> String {
    format!("{:x}", md5::compute(content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_pure() {
        assert_eq!(content_hash(b"hi"), content_hash(b"hi"));
        assert_ne!(content_hash(b"hi"), content_hash(b"ho"));
        assert_eq!(content_hash(b"hi").len(), 32);
    }

    #[test]
    fn config_validator_enforces_minima() {
        let mut config = Config::default();
        config.secret = "s3cret".to_string();
        assert!(config.validate().is_ok());

        config.history_save_delay = 9;
        assert!(config.validate().is_err());
        config.history_save_delay = 10;

        config.history_keep_versions = 99;
        assert!(config.validate().is_err());
        config.history_keep_versions = 100;

        config.secret = String::new();
        assert!(config.validate().is_err());
    }
}
