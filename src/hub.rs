use crate::database::Database;
use crate::message::*;
use crate::resolver::*;
use crate::token::{TokenClaims, TokenCodec};
use crate::types::*;
use crate::upload::{CheckOutcome, UploadManager};
use futures_util::stream::SplitSink;
use futures_util::{FutureExt, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// The hub owns every live connection: it authenticates the first frame,
// routes typed messages to handlers, serializes writes to each socket,
// and fans accepted mutations out to the user's other sessions. Handlers
// run on the connection's read task; anything that writes rows goes
// through the resolver and its per-user write queue, so the read loop
// itself never blocks on storage.

pub const PING_INTERVAL: Duration = Duration::from_secs(25);
pub const PING_WAIT: Duration = Duration::from_secs(40);

/// Grace between a rejected Authorization reply and the close frame.
const AUTH_CLOSE_GRACE: Duration = Duration::from_secs(2);

type Writer = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Paths the server has asked this client to three-way-merge, each
/// consumed atomically by the merge response or swept on timeout.
pub struct MergeTracker {
    entries: Mutex<HashMap<String, Instant>>,
}

impl MergeTracker {
    pub fn new() -> MergeTracker {
        MergeTracker {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, path: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(path.to_string(), Instant::now());
    }

    /// Check-and-delete in one critical section: exactly one caller wins.
    pub fn take(&self, path: &str) -> bool {
        self.entries.lock().unwrap().remove(path).is_some()
    }

    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, created| created.elapsed() <= max_age);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Default for MergeTracker {
    fn default() -> Self {
        MergeTracker::new()
    }
}

pub struct Connection {
    pub id: u64,
    uid: Mutex<Option<Uid>>,
    writer: tokio::sync::Mutex<Writer>,
    max_write: usize,
    pub cancel: CancellationToken,
    pub merges: MergeTracker,
    last_pong: Mutex<Instant>,
}

impl Connection {
    fn new(id: u64, writer: Writer, max_write: usize, parent: &CancellationToken) -> Arc<Connection> {
        Arc::new(Connection {
            id,
            uid: Mutex::new(None),
            writer: tokio::sync::Mutex::new(writer),
            max_write,
            cancel: parent.child_token(),
            merges: MergeTracker::new(),
            last_pong: Mutex::new(Instant::now()),
        })
    }

    pub fn uid(&self) -> Option<Uid> {
        *self.uid.lock().unwrap()
    }

    fn bind_uid(&self, uid: Uid) {
        *self.uid.lock().unwrap() = Some(uid);
    }

    fn touch_pong(&self) {
        *self.last_pong.lock().unwrap() = Instant::now();
    }

    fn pong_age(&self) -> Duration {
        self.last_pong.lock().unwrap().elapsed()
    }

    /// Send one frame. The writer mutex keeps per-connection output
    /// strictly ordered across handler and broadcast tasks.
    async fn send(&self, message: Message) -> SyncResult<()> {
        if message.len() > self.max_write {
            return Err(SyncError::Internal(format!(
                "outbound frame of {} bytes exceeds the write cap",
                message.len()
            )));
        }
        let mut writer = self.writer.lock().await;
        writer.send(message).await?;
        Ok(())
    }

    async fn send_frame(&self, action: &str, payload: &str) -> SyncResult<()> {
        self.send(Message::Text(encode_frame(action, payload))).await
    }
}

pub struct Hub {
    config: Config,
    db: Arc<Database>,
    resolver: Arc<Resolver>,
    uploads: Arc<UploadManager>,
    tokens: Arc<dyn TokenCodec>,
    users: RwLock<HashMap<Uid, HashMap<u64, Arc<Connection>>>>,
    next_conn_id: AtomicU64,
    pub shutdown: CancellationToken,
}

impl Hub {
    pub fn new(
        config: Config,
        db: Arc<Database>,
        resolver: Arc<Resolver>,
        uploads: Arc<UploadManager>,
        tokens: Arc<dyn TokenCodec>,
    ) -> Arc<Hub> {
        Arc::new(Hub {
            config,
            db,
            resolver,
            uploads,
            tokens,
            users: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Accept loop. Returns when the shutdown token fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        info!("sync hub listening on {}", self.config.listen_address);

        // Stale merge invitations are swept at half their lifetime.
        let sweeper = Arc::clone(&self);
        tokio::spawn(async move {
            let max_age = Duration::from_secs(sweeper.config.history_save_delay);
            let mut ticker = tokio::time::interval(max_age / 2);
            loop {
                tokio::select! {
                    _ = sweeper.shutdown.cancelled() => return,
                    _ = ticker.tick() => sweeper.sweep_merges(max_age),
                }
            }
        });

        let mut incoming = TcpListenerStream::new(listener);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                stream = incoming.next() => match stream {
                    Some(Ok(stream)) => {
                        let hub = Arc::clone(&self);
                        tokio::spawn(async move { hub.handle_connection(stream).await });
                    }
                    Some(Err(err)) => warn!("accept failed: {}", err),
                    None => break,
                },
            }
        }
        info!("sync hub stopped accepting connections");
    }

    fn sweep_merges(&self, max_age: Duration) {
        let users = self.users.read().unwrap();
        for connections in users.values() {
            for conn in connections.values() {
                let swept = conn.merges.sweep(max_age);
                if swept > 0 {
                    debug!("swept {} stale merge entries on conn {}", swept, conn.id);
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "?".to_string());
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.ws_read_max_payload_size);
        ws_config.max_frame_size = Some(self.config.ws_read_max_payload_size);
        let socket = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await
        {
            Ok(socket) => socket,
            Err(err) => {
                warn!("websocket handshake with {} failed: {}", peer, err);
                return;
            }
        };
        let (writer, mut reader) = socket.split();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn = Connection::new(
            conn_id,
            writer,
            self.config.ws_write_max_payload_size,
            &self.shutdown,
        );
        info!("conn {} opened from {}", conn_id, peer);

        // Heartbeat: ping on an interval, close when pongs stop coming.
        let heartbeat_conn = Arc::clone(&conn);
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = heartbeat_conn.cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if heartbeat_conn.pong_age() > PING_WAIT {
                            info!("conn {} timed out waiting for pong", heartbeat_conn.id);
                            heartbeat_conn.cancel.cancel();
                            return;
                        }
                        if heartbeat_conn.send(Message::Ping(vec![])).await.is_err() {
                            heartbeat_conn.cancel.cancel();
                            return;
                        }
                    }
                }
            }
        });

        loop {
            let message = tokio::select! {
                _ = conn.cancel.cancelled() => break,
                message = reader.next() => message,
            };
            match message {
                Some(Ok(Message::Text(text))) => self.handle_text(&conn, &text).await,
                Some(Ok(Message::Binary(bytes))) => self.handle_binary(&conn, &bytes).await,
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => conn.touch_pong(),
                Some(Ok(Message::Close(_))) => {
                    debug!("conn {} sent close", conn.id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!("conn {} read error: {}", conn.id, err);
                    break;
                }
                None => break,
            }
        }

        heartbeat.abort();
        conn.cancel.cancel();
        self.unregister(&conn);
        let mut writer = conn.writer.lock().await;
        let _ = writer.close().await;
        info!("conn {} closed", conn.id);
    }

    async fn handle_text(self: &Arc<Self>, conn: &Arc<Connection>, text: &str) {
        let (kind, payload) = match parse_frame(text) {
            Ok(parts) => parts,
            Err(err) => {
                error!("conn {}: unparseable frame: {}", conn.id, err);
                return;
            }
        };

        if kind == "Authorization" {
            self.handle_authorization(conn, payload).await;
            return;
        }
        let Some(uid) = conn.uid() else {
            // Everything but Authorization is rejected until the session
            // is bound to a user.
            self.reply(conn, kind, Err(SyncError::Unauthorized)).await;
            return;
        };

        let dispatched = AssertUnwindSafe(self.dispatch(conn, uid, kind, payload))
            .catch_unwind()
            .await;
        match dispatched {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!("conn {} {}: {}", conn.id, kind, err);
                self.reply(conn, kind, Err(err)).await;
            }
            Err(panic) => {
                // A broken handler must not take the connection down.
                error!("conn {} handler {} panicked: {:?}", conn.id, kind, panic_text(&panic));
                self.reply(conn, kind, Err(SyncError::Internal("handler panicked".to_string())))
                    .await;
            }
        }
    }

    async fn handle_authorization(self: &Arc<Self>, conn: &Arc<Connection>, token: &str) {
        if conn.uid().is_some() {
            self.reply(
                conn,
                "Authorization",
                Err(SyncError::InvalidParams("connection is already authorized".to_string())),
            )
            .await;
            return;
        }
        match self.tokens.verify(token.trim()) {
            Ok(TokenClaims::User(claims)) => {
                // The signature only proves who minted the token; the
                // user row decides whether it is still good.
                let user = match self.db.get_user(claims.uid) {
                    Ok(Some(user)) => user,
                    Ok(None) => {
                        self.reject_authorization(
                            conn,
                            SyncError::UnauthorizedToken("unknown user".to_string()),
                        )
                        .await;
                        return;
                    }
                    Err(err) => {
                        self.reply(conn, "Authorization", Err(err)).await;
                        return;
                    }
                };
                if user.credentials_version != claims.credentials_version {
                    self.reject_authorization(
                        conn,
                        SyncError::UnauthorizedToken("credentials changed".to_string()),
                    )
                    .await;
                    return;
                }
                conn.bind_uid(claims.uid);
                self.register(claims.uid, conn);
                info!("conn {} authorized as uid {}", conn.id, claims.uid);
                let data = json!({ "uid": claims.uid, "nickname": claims.nickname });
                self.reply(conn, "Authorization", Ok(Some(data))).await;
            }
            Ok(TokenClaims::Share(_)) => {
                self.reject_authorization(
                    conn,
                    SyncError::UnauthorizedToken("share tokens cannot open a sync channel".to_string()),
                )
                .await;
            }
            Err(err) => self.reject_authorization(conn, err).await,
        }
    }

    async fn reject_authorization(&self, conn: &Arc<Connection>, err: SyncError) {
        warn!("conn {} failed authorization: {}", conn.id, err);
        self.reply(conn, "Authorization", Err(err)).await;
        tokio::time::sleep(AUTH_CLOSE_GRACE).await;
        conn.cancel.cancel();
    }

    async fn handle_binary(self: &Arc<Self>, conn: &Arc<Connection>, bytes: &[u8]) {
        let Some(uid) = conn.uid() else {
            self.reply(conn, "VaultFileChunk", Err(SyncError::Unauthorized)).await;
            return;
        };
        let result = AssertUnwindSafe(self.accept_upload_chunk(conn, uid, bytes))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!("conn {} chunk rejected: {}", conn.id, err);
                self.reply(conn, "VaultFileChunk", Err(err)).await;
            }
            Err(panic) => {
                error!("conn {} chunk handler panicked: {:?}", conn.id, panic_text(&panic));
                self.reply(
                    conn,
                    "VaultFileChunk",
                    Err(SyncError::Internal("handler panicked".to_string())),
                )
                .await;
            }
        }
    }

    async fn accept_upload_chunk(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        bytes: &[u8],
    ) -> SyncResult<()> {
        let frame = ChunkFrame::decode(bytes)?;
        let accepted = self
            .uploads
            .accept_chunk(uid, frame.session_id, frame.chunk_index, &frame.bytes)
            .await?;
        if !accepted.complete {
            return Ok(());
        }
        let Some(commit) = self.uploads.complete_if_done(uid, frame.session_id).await? else {
            return Ok(());
        };
        let outcome = self.resolver.file_commit(uid, &conn.cancel, commit).await?;
        let record = outcome.record();
        let payload = serde_json::to_string(record)?;
        // The committed row goes to every session of the user, uploader
        // included, so all replicas converge on the same metadata.
        let action = match &outcome {
            FileOutcome::Updated(_) => "FileSyncUpdate",
            _ => "FileSyncModify",
        };
        self.broadcast_to_user(uid, action, &payload, None).await;
        Ok(())
    }

    async fn dispatch(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        kind: &str,
        payload: &str,
    ) -> SyncResult<()> {
        match kind {
            "NoteModify" => self.on_note_modify(conn, uid, parse(payload)?).await,
            "NoteMergeResult" => self.on_note_merge_result(conn, uid, parse(payload)?).await,
            "NoteDelete" => self.on_note_delete(conn, uid, parse(payload)?).await,
            "NoteRestore" => self.on_note_restore(conn, uid, parse(payload)?).await,
            "NoteRename" => self.on_note_rename(conn, uid, parse(payload)?).await,
            "NoteCheck" => self.on_note_check(conn, uid, parse(payload)?).await,
            "NoteSync" => self.on_note_sync(conn, uid, parse(payload)?).await,
            "NoteRePush" => self.on_note_repush(conn, uid, parse(payload)?).await,
            "NoteAppend" => {
                let params: NoteAppendParams = parse(payload)?;
                let outcome = self.resolver.note_append(uid, &conn.cancel, params).await?;
                self.finish_note_write(conn, uid, "NoteAppend", outcome).await
            }
            "NotePrepend" => {
                let params: NoteAppendParams = parse(payload)?;
                let outcome = self.resolver.note_prepend(uid, &conn.cancel, params).await?;
                self.finish_note_write(conn, uid, "NotePrepend", outcome).await
            }
            "NoteReplace" => {
                let params: NoteReplaceParams = parse(payload)?;
                let outcome = self.resolver.note_replace(uid, &conn.cancel, params).await?;
                self.finish_note_write(conn, uid, "NoteReplace", outcome).await
            }
            "NotePatchFrontmatter" => {
                let params: NotePatchFrontmatterParams = parse(payload)?;
                let outcome = self
                    .resolver
                    .note_patch_frontmatter(uid, &conn.cancel, params)
                    .await?;
                self.finish_note_write(conn, uid, "NotePatchFrontmatter", outcome).await
            }
            "NoteMove" => {
                let params: NoteMoveParams = parse(payload)?;
                let outcome = self.resolver.note_move(uid, &conn.cancel, params).await?;
                self.finish_note_write(conn, uid, "NoteMove", outcome).await
            }
            "FolderModify" => self.on_folder_modify(conn, uid, parse(payload)?).await,
            "FolderDelete" => self.on_folder_delete(conn, uid, parse(payload)?).await,
            "FolderRename" => self.on_folder_rename(conn, uid, parse(payload)?).await,
            "FolderSync" => self.on_folder_sync(conn, uid, parse(payload)?).await,
            "SettingModify" => self.on_setting_modify(conn, uid, parse(payload)?).await,
            "SettingDelete" => self.on_setting_delete(conn, uid, parse(payload)?).await,
            "SettingCheck" => self.on_setting_check(conn, uid, parse(payload)?).await,
            "SettingSync" => self.on_setting_sync(conn, uid, parse(payload)?).await,
            "SettingClear" => self.on_setting_clear(conn, uid).await,
            "FileSync" => self.on_file_sync(conn, uid, parse(payload)?).await,
            "FileUploadCheck" => self.on_file_upload_check(conn, uid, parse(payload)?).await,
            "FileRename" => self.on_file_rename(conn, uid, parse(payload)?).await,
            "FileDelete" => self.on_file_delete(conn, uid, parse(payload)?).await,
            "FileChunkDownload" => self.on_file_chunk_download(conn, uid, parse(payload)?).await,
            "FileRePush" => self.on_file_repush(conn, uid, parse(payload)?).await,
            "ShareCreate" => self.on_share_create(conn, uid, parse(payload)?).await,
            "ShareRevoke" => self.on_share_revoke(conn, uid, parse(payload)?).await,
            _ => {
                // Unknown types are a client/server version skew, not a
                // reason to drop the connection.
                error!("conn {}: unknown message type {:?}", conn.id, kind);
                Ok(())
            }
        }
    }

    // ---------- note handlers ----------

    async fn on_note_modify(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: NoteModifyParams,
    ) -> SyncResult<()> {
        let path = params.path.clone();
        match self.resolver.note_modify(uid, &conn.cancel, params).await {
            Ok(outcome) => self.finish_note_write(conn, uid, "NoteModify", outcome).await,
            Err(SyncError::StaleConflict(stale_path)) => {
                // Invite the client to a three-way merge and remember the
                // invitation until it answers or the window lapses.
                conn.merges.register(&path);
                self.reply(conn, "NoteModify", Err(SyncError::StaleConflict(stale_path)))
                    .await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn on_note_merge_result(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: MergeResultParams,
    ) -> SyncResult<()> {
        if !conn.merges.take(&params.path) {
            // Swept or never issued; the merge is based on a stale view.
            return Err(SyncError::InvalidParams(format!(
                "no pending merge for {}",
                params.path
            )));
        }
        let outcome = self
            .resolver
            .note_modify(
                uid,
                &conn.cancel,
                NoteModifyParams {
                    vault: params.vault,
                    path: params.path,
                    content: params.content,
                    content_hash: None,
                    ctime: None,
                    mtime: params.mtime,
                    force: true,
                    client_name: String::new(),
                    client_version: String::new(),
                },
            )
            .await?;
        self.finish_note_write(conn, uid, "NoteMergeResult", outcome).await
    }

    /// Reply to the caller and fan the accepted write out to the user's
    /// other connections.
    async fn finish_note_write(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        action: &str,
        outcome: NoteOutcome,
    ) -> SyncResult<()> {
        let record = outcome.record().clone();
        self.reply(conn, action, Ok(Some(serde_json::to_value(&record)?))).await;
        match outcome {
            NoteOutcome::Created(note) | NoteOutcome::Updated(note) => {
                self.broadcast_record(uid, "NoteSyncModify", &note, Some(conn.id)).await;
            }
            NoteOutcome::Restored(note) => {
                self.broadcast_record(uid, "NoteSyncRestore", &note, Some(conn.id)).await;
            }
            NoteOutcome::Deleted(note) => {
                self.broadcast_record(uid, "NoteSyncDelete", &note, Some(conn.id)).await;
            }
            NoteOutcome::Renamed { src, dst } => {
                self.broadcast_record(uid, "NoteSyncDelete", &src, Some(conn.id)).await;
                self.broadcast_record(uid, "NoteSyncModify", &dst, Some(conn.id)).await;
            }
            // Nothing changed, nothing to fan out.
            NoteOutcome::Unchanged(_) => {}
        }
        Ok(())
    }

    async fn on_note_delete(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: NoteDeleteParams,
    ) -> SyncResult<()> {
        let outcome = self.resolver.note_delete(uid, &conn.cancel, params).await?;
        self.finish_note_write(conn, uid, "NoteDelete", outcome).await
    }

    async fn on_note_restore(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: NoteRestoreParams,
    ) -> SyncResult<()> {
        let outcome = self.resolver.note_restore(uid, &conn.cancel, params).await?;
        self.finish_note_write(conn, uid, "NoteRestore", outcome).await
    }

    async fn on_note_rename(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: NoteRenameParams,
    ) -> SyncResult<()> {
        let outcome = self.resolver.note_rename(uid, &conn.cancel, params).await?;
        self.finish_note_write(conn, uid, "NoteRename", outcome).await
    }

    async fn on_note_check(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: NoteCheckParams,
    ) -> SyncResult<()> {
        let result = self.resolver.note_check(uid, &params)?;
        let data = json!({
            "isNew": result.is_new,
            "verdict": result.verdict.as_str(),
            "existing": result.existing,
        });
        self.reply(conn, "NoteCheck", Ok(Some(data))).await;
        Ok(())
    }

    async fn on_note_sync(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: NoteSyncParams,
    ) -> SyncResult<()> {
        let notes = self.resolver.note_sync(uid, &params.vault, params.cursor)?;
        let data = json!({ "notes": notes, "cursor": now_millis() });
        self.reply(conn, "NoteSync", Ok(Some(data))).await;
        Ok(())
    }

    async fn on_note_repush(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: NoteRePushParams,
    ) -> SyncResult<()> {
        let note = self.resolver.note_get(uid, &params.vault, &params.path)?;
        // The asker already has the row; only its other sessions need it.
        self.broadcast_record(uid, "NoteSyncModify", &note, Some(conn.id)).await;
        Ok(())
    }

    // ---------- folder handlers ----------

    async fn on_folder_modify(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: FolderModifyParams,
    ) -> SyncResult<()> {
        let outcome = self.resolver.folder_modify(uid, &conn.cancel, params).await?;
        let (FolderOutcome::Created(folder) | FolderOutcome::Updated(folder)) = outcome else {
            return Err(SyncError::Internal("unexpected folder outcome".to_string()));
        };
        self.reply(conn, "FolderModify", Ok(Some(serde_json::to_value(&folder)?))).await;
        self.broadcast_record(uid, "FolderSyncModify", &folder, Some(conn.id)).await;
        Ok(())
    }

    async fn on_folder_delete(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: FolderDeleteParams,
    ) -> SyncResult<()> {
        let outcome = self.resolver.folder_delete(uid, &conn.cancel, params).await?;
        let FolderOutcome::Deleted(folder) = outcome else {
            return Err(SyncError::Internal("unexpected folder outcome".to_string()));
        };
        self.reply(conn, "FolderDelete", Ok(Some(serde_json::to_value(&folder)?))).await;
        self.broadcast_record(uid, "FolderSyncDelete", &folder, Some(conn.id)).await;
        Ok(())
    }

    async fn on_folder_rename(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: FolderRenameParams,
    ) -> SyncResult<()> {
        let outcome = self.resolver.folder_rename(uid, &conn.cancel, params).await?;
        let FolderOutcome::Renamed { src, dst, notes, files } = outcome else {
            return Err(SyncError::Internal("unexpected folder outcome".to_string()));
        };
        self.reply(conn, "FolderRename", Ok(Some(serde_json::to_value(&dst)?))).await;
        self.broadcast_record(uid, "FolderSyncDelete", &src, Some(conn.id)).await;
        self.broadcast_record(uid, "FolderSyncModify", &dst, Some(conn.id)).await;
        // Children move as delete+modify pairs, same as a direct rename.
        for (old, new) in notes {
            self.broadcast_record(uid, "NoteSyncDelete", &old, Some(conn.id)).await;
            self.broadcast_record(uid, "NoteSyncModify", &new, Some(conn.id)).await;
        }
        for (old, new) in files {
            self.broadcast_record(uid, "FileSyncDelete", &old, Some(conn.id)).await;
            self.broadcast_record(uid, "FileSyncModify", &new, Some(conn.id)).await;
        }
        Ok(())
    }

    async fn on_folder_sync(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: FolderSyncParams,
    ) -> SyncResult<()> {
        let folders = self.resolver.folder_sync(uid, &params.vault, params.cursor)?;
        let data = json!({ "folders": folders, "cursor": now_millis() });
        self.reply(conn, "FolderSync", Ok(Some(data))).await;
        Ok(())
    }

    // ---------- setting handlers ----------

    async fn on_setting_modify(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: SettingModifyParams,
    ) -> SyncResult<()> {
        let setting = self.resolver.setting_modify(uid, &conn.cancel, params).await?;
        self.reply(conn, "SettingModify", Ok(Some(serde_json::to_value(&setting)?))).await;
        self.broadcast_record(uid, "SettingSyncModify", &setting, Some(conn.id)).await;
        Ok(())
    }

    async fn on_setting_delete(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: SettingDeleteParams,
    ) -> SyncResult<()> {
        let setting = self.resolver.setting_delete(uid, &conn.cancel, params).await?;
        self.reply(conn, "SettingDelete", Ok(Some(serde_json::to_value(&setting)?))).await;
        self.broadcast_record(uid, "SettingSyncDelete", &setting, Some(conn.id)).await;
        Ok(())
    }

    async fn on_setting_check(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: SettingCheckParams,
    ) -> SyncResult<()> {
        let setting = self.resolver.setting_check(uid, &params.key)?;
        self.reply(conn, "SettingCheck", Ok(Some(json!({ "setting": setting })))).await;
        Ok(())
    }

    async fn on_setting_sync(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: SettingSyncParams,
    ) -> SyncResult<()> {
        let settings = self.resolver.setting_sync(uid, params.cursor)?;
        let data = json!({ "settings": settings, "cursor": now_millis() });
        self.reply(conn, "SettingSync", Ok(Some(data))).await;
        Ok(())
    }

    async fn on_setting_clear(self: &Arc<Self>, conn: &Arc<Connection>, uid: Uid) -> SyncResult<()> {
        let cleared = self.resolver.setting_clear(uid, &conn.cancel).await?;
        self.reply(conn, "SettingClear", Ok(Some(json!({ "cleared": cleared })))).await;
        self.broadcast_to_user(uid, "SettingSyncClear", "{}", Some(conn.id)).await;
        Ok(())
    }

    // ---------- file handlers ----------

    async fn on_file_sync(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: FileSyncParams,
    ) -> SyncResult<()> {
        let files = self.resolver.file_sync(uid, &params.vault, params.cursor)?;
        let data = json!({ "files": files, "cursor": now_millis() });
        self.reply(conn, "FileSync", Ok(Some(data))).await;
        Ok(())
    }

    async fn on_file_upload_check(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: FileUploadCheckParams,
    ) -> SyncResult<()> {
        // The same bytes under the same path need no second upload.
        let existing = match self.resolver.file_get(uid, &params.vault, &params.path) {
            Ok(file) => Some(file),
            Err(SyncError::FileNotFound(_)) => None,
            Err(err) => return Err(err),
        };
        if let Some(file) = existing {
            if file.action == RowAction::Live && file.content_hash == params.content_hash {
                let reply = UploadCheckReply {
                    already_complete: true,
                    session_id: None,
                    received_chunks: vec![],
                    chunk_size: 0,
                    file: Some(file),
                };
                self.reply(conn, "FileUploadCheck", Ok(Some(serde_json::to_value(&reply)?)))
                    .await;
                return Ok(());
            }
        }

        if params.action.as_deref() != Some("upload") {
            // Pure probe: the client only wanted to know whether the
            // server has these bytes.
            let reply = UploadCheckReply {
                already_complete: false,
                session_id: None,
                received_chunks: vec![],
                chunk_size: params.chunk_size.unwrap_or(self.config.file_chunk_size),
                file: None,
            };
            self.reply(conn, "FileUploadCheck", Ok(Some(serde_json::to_value(&reply)?))).await;
            return Ok(());
        }

        let chunk_size = params.chunk_size.unwrap_or(self.config.file_chunk_size);
        let outcome = self
            .uploads
            .check_or_start(
                uid,
                &params.vault,
                &params.path,
                params.size,
                &params.content_hash,
                chunk_size,
                params.ctime,
                params.mtime,
                &params.client_name,
                &params.client_version,
            )
            .await?;
        let reply = match outcome {
            CheckOutcome::Started { session_id, chunk_size } => UploadCheckReply {
                already_complete: false,
                session_id: Some(session_id),
                received_chunks: vec![],
                chunk_size,
                file: None,
            },
            CheckOutcome::Resumed { session_id, received, chunk_size } => UploadCheckReply {
                already_complete: false,
                session_id: Some(session_id),
                received_chunks: received,
                chunk_size,
                file: None,
            },
        };
        self.reply(conn, "FileUploadCheck", Ok(Some(serde_json::to_value(&reply)?))).await;
        Ok(())
    }

    async fn on_file_rename(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: FileRenameParams,
    ) -> SyncResult<()> {
        let outcome = self.resolver.file_rename(uid, &conn.cancel, params).await?;
        let FileOutcome::Renamed { src, dst } = outcome else {
            return Err(SyncError::Internal("unexpected file outcome".to_string()));
        };
        self.reply(conn, "FileRename", Ok(Some(serde_json::to_value(&dst)?))).await;
        self.broadcast_record(uid, "FileSyncDelete", &src, Some(conn.id)).await;
        self.broadcast_record(uid, "FileSyncModify", &dst, Some(conn.id)).await;
        Ok(())
    }

    async fn on_file_delete(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: FileDeleteParams,
    ) -> SyncResult<()> {
        let outcome = self.resolver.file_delete(uid, &conn.cancel, params).await?;
        let FileOutcome::Deleted(file) = outcome else {
            return Err(SyncError::Internal("unexpected file outcome".to_string()));
        };
        self.reply(conn, "FileDelete", Ok(Some(serde_json::to_value(&file)?))).await;
        self.broadcast_record(uid, "FileSyncDelete", &file, Some(conn.id)).await;
        Ok(())
    }

    async fn on_file_chunk_download(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: FileChunkDownloadParams,
    ) -> SyncResult<()> {
        let file = self.resolver.file_get(uid, &params.vault, &params.path)?;
        if file.action == RowAction::Delete {
            return Err(SyncError::AlreadyDeleted(file.path.clone()));
        }
        let chunk_size = self.config.file_chunk_size;
        let (bytes, is_last) = self
            .uploads
            .download_chunk(&file, params.chunk_index, chunk_size)
            .await?;
        let frame = ChunkFrame {
            session_id: params.session_id.unwrap_or_else(Uuid::nil),
            chunk_index: params.chunk_index,
            bytes,
        };
        conn.send(Message::Binary(frame.encode())).await?;
        let data = json!({
            "chunkIndex": params.chunk_index,
            "isLast": is_last,
            "size": file.size,
        });
        self.reply(conn, "FileChunkDownload", Ok(Some(data))).await;
        Ok(())
    }

    async fn on_file_repush(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: FileRePushParams,
    ) -> SyncResult<()> {
        let file = self.resolver.file_get(uid, &params.vault, &params.path)?;
        self.broadcast_record(uid, "FileSyncModify", &file, Some(conn.id)).await;
        Ok(())
    }

    // ---------- share handlers ----------

    async fn on_share_create(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: ShareCreateParams,
    ) -> SyncResult<()> {
        let expires_at = params.expires_at.unwrap_or_else(|| {
            now_millis() + self.config.share_token_expiry as EpochMillis * 1000
        });
        let (share, token) =
            self.resolver
                .share_create(uid, params.resources, expires_at, &*self.tokens)?;
        let data = json!({
            "shareId": share.share_id,
            "token": token,
            "expiresAt": share.expires_at,
        });
        self.reply(conn, "ShareCreate", Ok(Some(data))).await;
        Ok(())
    }

    async fn on_share_revoke(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        uid: Uid,
        params: ShareRevokeParams,
    ) -> SyncResult<()> {
        self.resolver.share_revoke(uid, &params.share_id)?;
        self.reply(conn, "ShareRevoke", Ok(Some(json!({ "shareId": params.share_id }))))
            .await;
        Ok(())
    }

    // ---------- plumbing ----------

    fn register(&self, uid: Uid, conn: &Arc<Connection>) {
        let mut users = self.users.write().unwrap();
        users.entry(uid).or_default().insert(conn.id, Arc::clone(conn));
    }

    fn unregister(&self, conn: &Arc<Connection>) {
        let Some(uid) = conn.uid() else { return };
        let mut users = self.users.write().unwrap();
        if let Some(connections) = users.get_mut(&uid) {
            connections.remove(&conn.id);
            if connections.is_empty() {
                users.remove(&uid);
            }
        }
    }

    /// Connections of one user, optionally minus the originator.
    fn fanout_targets(&self, uid: Uid, exclude: Option<u64>) -> Vec<Arc<Connection>> {
        let users = self.users.read().unwrap();
        match users.get(&uid) {
            Some(connections) => connections
                .values()
                .filter(|conn| Some(conn.id) != exclude)
                .cloned()
                .collect(),
            None => vec![],
        }
    }

    async fn broadcast_record<T: serde::Serialize>(
        &self,
        uid: Uid,
        action: &str,
        record: &T,
        exclude: Option<u64>,
    ) {
        match serde_json::to_string(record) {
            Ok(payload) => self.broadcast_to_user(uid, action, &payload, exclude).await,
            Err(err) => error!("broadcast serialization failed: {}", err),
        }
    }

    /// Best-effort at-most-once fan-out. A connection that cannot be
    /// written to is closed; the broadcast goes on for the rest.
    pub async fn broadcast_to_user(&self, uid: Uid, action: &str, payload: &str, exclude: Option<u64>) {
        for conn in self.fanout_targets(uid, exclude) {
            if let Err(err) = conn.send_frame(action, payload).await {
                warn!("broadcast to conn {} failed, closing it: {}", conn.id, err);
                conn.cancel.cancel();
            }
        }
    }

    async fn reply(&self, conn: &Arc<Connection>, action: &str, result: SyncResult<Option<serde_json::Value>>) {
        let envelope = match &result {
            Ok(data) => Envelope::ok(data.clone()),
            Err(err) => Envelope::from_error(err),
        };
        if !envelope.should_send(self.config.send_success_replies) {
            return;
        }
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                error!("reply serialization failed: {}", err);
                return;
            }
        };
        if let Err(err) = conn.send_frame(action, &payload).await {
            debug!("reply to conn {} failed: {}", conn.id, err);
            conn.cancel.cancel();
        }
    }

    pub fn connection_count(&self, uid: Uid) -> usize {
        self.users
            .read()
            .unwrap()
            .get(&uid)
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}

fn parse<T: DeserializeOwned>(payload: &str) -> SyncResult<T> {
    serde_json::from_str(payload).map_err(|err| SyncError::InvalidParams(format!("{}", err)))
}

fn panic_text(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn merge_check_and_delete_has_one_winner() {
        let tracker = Arc::new(MergeTracker::new());
        tracker.register("a.md");

        let mut tasks = vec![];
        for _ in 0..16 {
            let tracker = Arc::clone(&tracker);
            tasks.push(tokio::spawn(async move { tracker.take("a.md") }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn merge_sweep_removes_only_stale_entries() {
        let tracker = MergeTracker::new();
        tracker.register("old.md");
        std::thread::sleep(Duration::from_millis(30));
        tracker.register("new.md");

        assert_eq!(tracker.sweep(Duration::from_millis(20)), 1);
        assert!(!tracker.take("old.md"));
        assert!(tracker.take("new.md"));
    }

    #[test]
    fn consumed_merge_cannot_be_consumed_again() {
        let tracker = MergeTracker::new();
        tracker.register("a.md");
        assert!(tracker.take("a.md"));
        assert!(!tracker.take("a.md"));
    }
}
