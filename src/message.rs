use crate::types::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// Wire format. Text frames are `TYPE|JSON-PAYLOAD`; the one exception is
// Authorization, whose payload is the bare token. Binary frames carry a
// fixed header (message-type byte, upload session id, chunk index, length
// prefix) followed by raw bytes.

/// Message-type byte for attachment chunks. The only binary type today.
pub const BINARY_VAULT_FILE_CHUNK: u8 = 0x01;

const BINARY_HEADER_LEN: usize = 1 + 16 + 4 + 4;

/// Split an inbound text frame into `(TYPE, payload)`.
pub fn parse_frame(frame: &str) -> SyncResult<(&str, &str)> {
    let (kind, payload) = frame
        .split_once('|')
        .ok_or_else(|| SyncError::InvalidParams("frame has no type separator".to_string()))?;
    if kind.is_empty() {
        return Err(SyncError::InvalidParams("frame has an empty type".to_string()));
    }
    Ok((kind, payload))
}

pub fn encode_frame(action: &str, payload: &str) -> String {
    format!("{}|{}", action, payload)
}

/// One attachment chunk on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFrame {
    pub session_id: Uuid,
    pub chunk_index: u32,
    pub bytes: Vec<u8>,
}

impl ChunkFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BINARY_HEADER_LEN + self.bytes.len());
        out.push(BINARY_VAULT_FILE_CHUNK);
        out.extend_from_slice(self.session_id.as_bytes());
        out.extend_from_slice(&self.chunk_index.to_be_bytes());
        out.extend_from_slice(&(self.bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.bytes);
        out
    }

    pub fn decode(frame: &[u8]) -> SyncResult<ChunkFrame> {
        if frame.len() < BINARY_HEADER_LEN {
            return Err(SyncError::BadChunk(format!(
                "binary frame too short: {} bytes",
                frame.len()
            )));
        }
        if frame[0] != BINARY_VAULT_FILE_CHUNK {
            return Err(SyncError::BadChunk(format!(
                "unknown binary message type {:#04x}",
                frame[0]
            )));
        }
        let session_id = Uuid::from_slice(&frame[1..17])
            .map_err(|_| SyncError::BadChunk("bad session id".to_string()))?;
        let chunk_index = u32::from_be_bytes(frame[17..21].try_into().unwrap());
        let len = u32::from_be_bytes(frame[21..25].try_into().unwrap()) as usize;
        let bytes = &frame[BINARY_HEADER_LEN..];
        if bytes.len() != len {
            return Err(SyncError::BadChunk(format!(
                "length prefix {} does not match payload {}",
                len,
                bytes.len()
            )));
        }
        Ok(ChunkFrame {
            session_id,
            chunk_index,
            bytes: bytes.to_vec(),
        })
    }
}

/// Reply envelope. Every synchronous reply and error uses this shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i64,
    pub status: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault: Option<String>,
}

impl Envelope {
    pub fn ok(data: Option<Value>) -> Envelope {
        Envelope {
            code: 200,
            status: true,
            message: "ok".to_string(),
            data,
            details: None,
            vault: None,
        }
    }

    pub fn from_error(err: &SyncError) -> Envelope {
        Envelope {
            code: err.code(),
            status: false,
            message: err.message(),
            data: None,
            details: err.details(),
            vault: None,
        }
    }

    pub fn with_vault(mut self, vault: &str) -> Envelope {
        self.vault = Some(vault.to_string());
        self
    }

    /// Pure successes are suppressed unless the server is configured to
    /// echo them, there is data to carry, or details to report.
    pub fn should_send(&self, send_success_replies: bool) -> bool {
        !self.status || self.data.is_some() || self.details.is_some() || send_success_replies
    }
}

// ---------- inbound payloads ----------

fn default_force() -> bool {
    false
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteModifyParams {
    pub vault: String,
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub ctime: Option<EpochMillis>,
    #[serde(default)]
    pub mtime: Option<EpochMillis>,
    #[serde(default = "default_force")]
    pub force: bool,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub client_version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteCheckParams {
    pub vault: String,
    pub path: String,
    #[serde(default)]
    pub path_hash: Option<String>,
    pub content_hash: String,
    #[serde(default)]
    pub ctime: Option<EpochMillis>,
    #[serde(default)]
    pub mtime: Option<EpochMillis>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteDeleteParams {
    pub vault: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub path_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRestoreParams {
    pub vault: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRenameParams {
    pub vault: String,
    pub src_path: String,
    pub dst_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteSyncParams {
    pub vault: String,
    #[serde(default)]
    pub cursor: EpochMillis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteRePushParams {
    pub vault: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteAppendParams {
    pub vault: String,
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteReplaceParams {
    pub vault: String,
    pub path: String,
    pub search: String,
    pub replace: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotePatchFrontmatterParams {
    pub vault: String,
    pub path: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteMoveParams {
    pub vault: String,
    pub src_path: String,
    pub dst_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderModifyParams {
    pub vault: String,
    pub path: String,
    #[serde(default)]
    pub mtime: Option<EpochMillis>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderDeleteParams {
    pub vault: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderRenameParams {
    pub vault: String,
    pub src_path: String,
    pub dst_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderSyncParams {
    pub vault: String,
    #[serde(default)]
    pub cursor: EpochMillis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingModifyParams {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingDeleteParams {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingCheckParams {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingSyncParams {
    #[serde(default)]
    pub cursor: EpochMillis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadCheckParams {
    pub vault: String,
    pub path: String,
    pub size: u64,
    pub content_hash: String,
    #[serde(default)]
    pub chunk_size: Option<u32>,
    /// "upload" opens a session; anything else just probes.
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub ctime: Option<EpochMillis>,
    #[serde(default)]
    pub mtime: Option<EpochMillis>,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub client_version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDeleteParams {
    pub vault: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub path_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRenameParams {
    pub vault: String,
    pub src_path: String,
    pub dst_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSyncParams {
    pub vault: String,
    #[serde(default)]
    pub cursor: EpochMillis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRePushParams {
    pub vault: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunkDownloadParams {
    pub vault: String,
    pub path: String,
    pub chunk_index: u32,
    /// Client-chosen id echoed in the binary reply frames.
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareCreateParams {
    /// Resource kind ("note" | "file") to granted row ids.
    #[serde(default)]
    pub resources: std::collections::HashMap<String, Vec<i64>>,
    /// Absent means the server default share lifetime.
    #[serde(default)]
    pub expires_at: Option<EpochMillis>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRevokeParams {
    pub share_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResultParams {
    pub vault: String,
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub mtime: Option<EpochMillis>,
}

// ---------- outbound payloads ----------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCheckReply {
    pub already_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub received_chunks: Vec<u32>,
    pub chunk_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRecord>,
}
