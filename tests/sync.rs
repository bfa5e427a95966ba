// End-to-end exercises over a real listener and real websocket clients:
// authorization handshake, note modify echo and fan-out, and the chunked
// attachment upload path.

use futures_util::{SinkExt, StreamExt};
use notesync::blob::{BlobStore, LocalBlobStore};
use notesync::database::Database;
use notesync::history::HistoryKeeper;
use notesync::hub::Hub;
use notesync::message::ChunkFrame;
use notesync::resolver::Resolver;
use notesync::token::{SignedTokenCodec, TokenClaims, TokenCodec, UserClaims};
use notesync::types::*;
use notesync::upload::UploadManager;
use notesync::write_queue::WriteQueue;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    _dir: tempfile::TempDir,
    addr: String,
    tokens: SignedTokenCodec,
    hub: Arc<Hub>,
    db: Arc<Database>,
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.secret = "integration-secret".to_string();
    config.machine_id = "test-machine".to_string();
    config.db_path = dir.path().join("data").to_string_lossy().to_string();
    config.blob_path = dir.path().join("blobs").to_string_lossy().to_string();

    std::fs::create_dir_all(&config.db_path).unwrap();
    std::fs::create_dir_all(&config.blob_path).unwrap();

    let database = Arc::new(
        Database::new(&std::path::Path::new(&config.db_path).join("notesync.db")).unwrap(),
    );
    let blobs: Arc<dyn BlobStore> =
        Arc::new(LocalBlobStore::new(std::path::Path::new(&config.blob_path)).unwrap());
    let queue = WriteQueue::new(
        config.write_queue_capacity,
        Duration::from_secs(config.write_queue_timeout),
        Duration::from_secs(config.write_queue_idle_time),
    );
    let history = HistoryKeeper::new(
        Arc::clone(&database),
        Duration::from_secs(config.history_save_delay),
        config.history_keep_versions,
    );
    let resolver = Arc::new(Resolver::new(
        Arc::clone(&database),
        Arc::clone(&queue),
        Arc::clone(&history),
    ));
    let uploads = UploadManager::new(
        Arc::clone(&blobs),
        Duration::from_secs(config.upload_session_timeout),
    );
    let tokens = SignedTokenCodec::new(&config.secret, &config.machine_id);
    let codec: Arc<dyn TokenCodec> =
        Arc::new(SignedTokenCodec::new(&config.secret, &config.machine_id));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let hub = Hub::new(config, Arc::clone(&database), resolver, uploads, codec);
    tokio::spawn(Arc::clone(&hub).serve(listener));

    TestServer {
        _dir: dir,
        addr,
        tokens,
        hub,
        db: database,
    }
}

fn register(server: &TestServer, name: &str) -> UserRecord {
    server.db.create_user(name, name, "digest", false).unwrap()
}

fn token_for(server: &TestServer, user: &UserRecord) -> String {
    server
        .tokens
        .issue(&TokenClaims::User(UserClaims {
            uid: user.uid,
            nickname: user.nickname.clone(),
            client_ip: "127.0.0.1".to_string(),
            issued_at: now_millis(),
            expires_at: now_millis() + 60_000,
            credentials_version: user.credentials_version,
        }))
        .unwrap()
}

async fn connect(server: &TestServer) -> Client {
    let (client, _) = connect_async(format!("ws://{}/", server.addr)).await.unwrap();
    client
}

/// Read frames until a text one arrives, skipping protocol chatter.
async fn next_frame(client: &mut Client) -> (String, Value) {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("read error");
        match message {
            Message::Text(text) => {
                let (action, payload) = text.split_once('|').expect("frame without separator");
                return (
                    action.to_string(),
                    serde_json::from_str(payload).expect("frame payload is not json"),
                );
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn next_binary(client: &mut Client) -> ChunkFrame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a binary frame")
            .expect("connection closed")
            .expect("read error");
        match message {
            Message::Binary(bytes) => return ChunkFrame::decode(&bytes).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn expect_silence(client: &mut Client, window: Duration) {
    let result = tokio::time::timeout(window, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => return other,
            }
        }
    })
    .await;
    assert!(result.is_err(), "expected no frame, got {:?}", result);
}

async fn authorize(client: &mut Client, token: &str) -> Value {
    client
        .send(Message::Text(format!("Authorization|{}", token)))
        .await
        .unwrap();
    let (action, envelope) = next_frame(client).await;
    assert_eq!(action, "Authorization");
    envelope
}

async fn send(client: &mut Client, action: &str, payload: Value) {
    client
        .send(Message::Text(format!("{}|{}", action, payload)))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn authorize_then_create_note() {
    let server = start_server().await;
    let user = register(&server, "kay");
    let mut client = connect(&server).await;

    let envelope = authorize(&mut client, &token_for(&server, &user)).await;
    assert_eq!(envelope["code"], 200);
    assert_eq!(envelope["status"], true);

    send(
        &mut client,
        "NoteModify",
        serde_json::json!({"vault": "v1", "path": "a.md", "content": "hi"}),
    )
    .await;
    let (action, envelope) = next_frame(&mut client).await;
    assert_eq!(action, "NoteModify");
    assert_eq!(envelope["code"], 200);
    assert_eq!(envelope["data"]["version"], 1);
    assert_eq!(envelope["data"]["content"], "hi");
    assert_eq!(envelope["data"]["contentHash"], content_hash(b"hi"));

    // Single connection: the write is echoed, not broadcast back.
    expect_silence(&mut client, Duration::from_millis(300)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fanout_reaches_other_connection_exactly_once() {
    let server = start_server().await;
    let user = register(&server, "kay");
    let token = token_for(&server, &user);
    let mut writer = connect(&server).await;
    let mut observer = connect(&server).await;
    authorize(&mut writer, &token).await;
    authorize(&mut observer, &token).await;
    assert_eq!(server.hub.connection_count(user.uid), 2);

    send(
        &mut writer,
        "NoteModify",
        serde_json::json!({"vault": "v1", "path": "a.md", "content": "x"}),
    )
    .await;

    // The writer gets its reply and nothing else.
    let (action, envelope) = next_frame(&mut writer).await;
    assert_eq!(action, "NoteModify");
    assert_eq!(envelope["data"]["version"], 1);
    expect_silence(&mut writer, Duration::from_millis(300)).await;

    // The other session receives the broadcast record, once.
    let (action, record) = next_frame(&mut observer).await;
    assert_eq!(action, "NoteSyncModify");
    assert_eq!(record["path"], "a.md");
    assert_eq!(record["content"], "x");
    assert_eq!(record["version"], 1);
    expect_silence(&mut observer, Duration::from_millis(300)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn other_users_never_see_the_broadcast() {
    let server = start_server().await;
    let kay = register(&server, "kay");
    let sam = register(&server, "sam");
    let mut writer = connect(&server).await;
    let mut stranger = connect(&server).await;
    authorize(&mut writer, &token_for(&server, &kay)).await;
    authorize(&mut stranger, &token_for(&server, &sam)).await;

    send(
        &mut writer,
        "NoteModify",
        serde_json::json!({"vault": "v1", "path": "a.md", "content": "x"}),
    )
    .await;
    next_frame(&mut writer).await;
    expect_silence(&mut stranger, Duration::from_millis(300)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unauthenticated_messages_are_rejected_but_survive() {
    let server = start_server().await;
    let user = register(&server, "kay");
    let mut client = connect(&server).await;

    send(
        &mut client,
        "NoteModify",
        serde_json::json!({"vault": "v1", "path": "a.md", "content": "hi"}),
    )
    .await;
    let (action, envelope) = next_frame(&mut client).await;
    assert_eq!(action, "NoteModify");
    assert_eq!(envelope["code"], 401);

    // The connection is still usable for a proper handshake.
    let envelope = authorize(&mut client, &token_for(&server, &user)).await;
    assert_eq!(envelope["code"], 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_token_gets_reply_then_close() {
    let server = start_server().await;
    let mut client = connect(&server).await;

    let envelope = authorize(&mut client, "garbage-token").await;
    assert_eq!(envelope["code"], 401);
    assert_eq!(envelope["status"], false);

    // After the grace period the server closes the channel.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
                _ => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server never closed the channel");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunked_upload_commits_and_republishes() {
    let server = start_server().await;
    let user = register(&server, "kay");
    let mut client = connect(&server).await;
    authorize(&mut client, &token_for(&server, &user)).await;

    let payload: Vec<u8> = (0..1024u32).flat_map(|n| n.to_be_bytes()).collect();
    let hash = content_hash(&payload);
    send(
        &mut client,
        "FileUploadCheck",
        serde_json::json!({
            "vault": "v1",
            "path": "img.png",
            "size": payload.len(),
            "contentHash": hash,
            "chunkSize": 1024,
            "action": "upload",
        }),
    )
    .await;
    let (action, envelope) = next_frame(&mut client).await;
    assert_eq!(action, "FileUploadCheck");
    assert_eq!(envelope["data"]["alreadyComplete"], false);
    let session_id: Uuid = envelope["data"]["sessionId"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    for (index, chunk) in payload.chunks(1024).enumerate() {
        let frame = ChunkFrame {
            session_id,
            chunk_index: index as u32,
            bytes: chunk.to_vec(),
        };
        client.send(Message::Binary(frame.encode())).await.unwrap();
    }

    // The committed row comes back to the uploader as well.
    let (action, record) = next_frame(&mut client).await;
    assert_eq!(action, "FileSyncModify");
    assert_eq!(record["path"], "img.png");
    assert_eq!(record["contentHash"], hash);
    assert_eq!(record["size"], payload.len());
    assert_eq!(record["version"], 1);

    // Asking again finds the file already complete, no session.
    send(
        &mut client,
        "FileUploadCheck",
        serde_json::json!({
            "vault": "v1",
            "path": "img.png",
            "size": payload.len(),
            "contentHash": hash,
            "chunkSize": 1024,
            "action": "upload",
        }),
    )
    .await;
    let (_, envelope) = next_frame(&mut client).await;
    assert_eq!(envelope["data"]["alreadyComplete"], true);
    assert_eq!(envelope["data"]["file"]["contentHash"], hash);

    // And the bytes stream back down chunk by chunk.
    send(
        &mut client,
        "FileChunkDownload",
        serde_json::json!({"vault": "v1", "path": "img.png", "chunkIndex": 0}),
    )
    .await;
    let chunk = next_binary(&mut client).await;
    assert_eq!(chunk.chunk_index, 0);
    assert_eq!(chunk.bytes.len() as u64, 4096.min(payload.len() as u64));
    assert_eq!(&chunk.bytes[..], &payload[..chunk.bytes.len()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupted_upload_fails_checksum_and_leaves_no_row() {
    let server = start_server().await;
    let user = register(&server, "kay");
    let mut client = connect(&server).await;
    authorize(&mut client, &token_for(&server, &user)).await;

    let payload = vec![7u8; 2048];
    let hash = content_hash(&payload);
    send(
        &mut client,
        "FileUploadCheck",
        serde_json::json!({
            "vault": "v1",
            "path": "img.png",
            "size": payload.len(),
            "contentHash": hash,
            "chunkSize": 1024,
            "action": "upload",
        }),
    )
    .await;
    let (_, envelope) = next_frame(&mut client).await;
    let session_id: Uuid = envelope["data"]["sessionId"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    let good = ChunkFrame {
        session_id,
        chunk_index: 0,
        bytes: payload[..1024].to_vec(),
    };
    client.send(Message::Binary(good.encode())).await.unwrap();
    // Right length, wrong bytes.
    let corrupted = ChunkFrame {
        session_id,
        chunk_index: 1,
        bytes: vec![9u8; 1024],
    };
    client.send(Message::Binary(corrupted.encode())).await.unwrap();

    let (action, envelope) = next_frame(&mut client).await;
    assert_eq!(action, "VaultFileChunk");
    assert_eq!(envelope["code"], 423);
    assert_eq!(envelope["status"], false);

    // No file row was written; a new check starts from scratch.
    send(
        &mut client,
        "FileUploadCheck",
        serde_json::json!({
            "vault": "v1",
            "path": "img.png",
            "size": payload.len(),
            "contentHash": hash,
            "chunkSize": 1024,
            "action": "upload",
        }),
    )
    .await;
    let (_, envelope) = next_frame(&mut client).await;
    assert_eq!(envelope["data"]["alreadyComplete"], false);
    assert_eq!(
        envelope["data"]["receivedChunks"],
        serde_json::json!([])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rename_broadcasts_delete_and_modify() {
    let server = start_server().await;
    let user = register(&server, "kay");
    let token = token_for(&server, &user);
    let mut writer = connect(&server).await;
    let mut observer = connect(&server).await;
    authorize(&mut writer, &token).await;
    authorize(&mut observer, &token).await;

    send(
        &mut writer,
        "NoteModify",
        serde_json::json!({"vault": "v1", "path": "a.md", "content": "x"}),
    )
    .await;
    next_frame(&mut writer).await;
    next_frame(&mut observer).await;

    send(
        &mut writer,
        "NoteRename",
        serde_json::json!({"vault": "v1", "srcPath": "a.md", "dstPath": "b.md"}),
    )
    .await;
    let (action, envelope) = next_frame(&mut writer).await;
    assert_eq!(action, "NoteRename");
    assert_eq!(envelope["data"]["path"], "b.md");

    let (action, record) = next_frame(&mut observer).await;
    assert_eq!(action, "NoteSyncDelete");
    assert_eq!(record["path"], "a.md");
    let (action, record) = next_frame(&mut observer).await;
    assert_eq!(action, "NoteSyncModify");
    assert_eq!(record["path"], "b.md");
    assert_eq!(record["content"], "x");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repush_reaches_only_the_other_connections() {
    let server = start_server().await;
    let user = register(&server, "kay");
    let token = token_for(&server, &user);
    let mut asker = connect(&server).await;
    let mut other = connect(&server).await;
    authorize(&mut asker, &token).await;
    authorize(&mut other, &token).await;

    // Seed a note and drain the create traffic from both sessions.
    send(
        &mut asker,
        "NoteModify",
        serde_json::json!({"vault": "v1", "path": "a.md", "content": "x"}),
    )
    .await;
    next_frame(&mut asker).await;
    next_frame(&mut other).await;

    send(
        &mut asker,
        "NoteRePush",
        serde_json::json!({"vault": "v1", "path": "a.md"}),
    )
    .await;
    // Exactly one rebroadcast, and not to the asker.
    let (action, record) = next_frame(&mut other).await;
    assert_eq!(action, "NoteSyncModify");
    assert_eq!(record["path"], "a.md");
    expect_silence(&mut other, Duration::from_millis(300)).await;
    expect_silence(&mut asker, Duration::from_millis(300)).await;

    // Same scope for attachments.
    let payload = vec![5u8; 1024];
    let hash = content_hash(&payload);
    send(
        &mut asker,
        "FileUploadCheck",
        serde_json::json!({
            "vault": "v1",
            "path": "img.png",
            "size": payload.len(),
            "contentHash": hash,
            "chunkSize": 1024,
            "action": "upload",
        }),
    )
    .await;
    let (_, envelope) = next_frame(&mut asker).await;
    let session_id: Uuid = envelope["data"]["sessionId"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();
    let frame = ChunkFrame {
        session_id,
        chunk_index: 0,
        bytes: payload.clone(),
    };
    asker.send(Message::Binary(frame.encode())).await.unwrap();
    // The commit broadcast goes to every session; drain it from both.
    next_frame(&mut asker).await;
    next_frame(&mut other).await;

    send(
        &mut asker,
        "FileRePush",
        serde_json::json!({"vault": "v1", "path": "img.png"}),
    )
    .await;
    let (action, record) = next_frame(&mut other).await;
    assert_eq!(action, "FileSyncModify");
    assert_eq!(record["path"], "img.png");
    expect_silence(&mut other, Duration::from_millis(300)).await;
    expect_silence(&mut asker, Duration::from_millis(300)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn password_change_invalidates_outstanding_tokens() {
    let server = start_server().await;
    let user = register(&server, "kay");
    let old_token = token_for(&server, &user);

    // The old token works until the password changes...
    let mut client = connect(&server).await;
    let envelope = authorize(&mut client, &old_token).await;
    assert_eq!(envelope["code"], 200);

    server.db.update_password(user.uid, "new-digest").unwrap();

    // ...after which it is refused even though it has not expired.
    let mut client = connect(&server).await;
    let envelope = authorize(&mut client, &old_token).await;
    assert_eq!(envelope["code"], 401);
    assert_eq!(envelope["status"], false);

    // A token minted against the new credentials version is accepted.
    let user = server.db.get_user(user.uid).unwrap().unwrap();
    let mut client = connect(&server).await;
    let envelope = authorize(&mut client, &token_for(&server, &user)).await;
    assert_eq!(envelope["code"], 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn share_create_and_revoke_over_the_wire() {
    let server = start_server().await;
    let user = register(&server, "kay");
    let mut client = connect(&server).await;
    authorize(&mut client, &token_for(&server, &user)).await;

    send(
        &mut client,
        "ShareCreate",
        serde_json::json!({"resources": {"note": [1, 2]}}),
    )
    .await;
    let (action, envelope) = next_frame(&mut client).await;
    assert_eq!(action, "ShareCreate");
    assert_eq!(envelope["code"], 200);
    let share_id = envelope["data"]["shareId"].as_str().unwrap().to_string();
    assert!(envelope["data"]["token"].as_str().unwrap().contains('.'));
    // Default lifetime comes from the server config.
    assert!(envelope["data"]["expiresAt"].as_i64().unwrap() > now_millis());

    send(
        &mut client,
        "ShareRevoke",
        serde_json::json!({"shareId": share_id}),
    )
    .await;
    let (action, envelope) = next_frame(&mut client).await;
    assert_eq!(action, "ShareRevoke");
    assert_eq!(envelope["code"], 200);

    // A share that never existed cannot be revoked.
    send(
        &mut client,
        "ShareRevoke",
        serde_json::json!({"shareId": "no-such-share"}),
    )
    .await;
    let (_, envelope) = next_frame(&mut client).await;
    assert_eq!(envelope["code"], 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn settings_roundtrip_over_the_wire() {
    let server = start_server().await;
    let user = register(&server, "kay");
    let mut client = connect(&server).await;
    authorize(&mut client, &token_for(&server, &user)).await;

    send(
        &mut client,
        "SettingModify",
        serde_json::json!({"key": "theme", "value": "dark"}),
    )
    .await;
    let (action, envelope) = next_frame(&mut client).await;
    assert_eq!(action, "SettingModify");
    assert_eq!(envelope["data"]["value"], "dark");

    send(&mut client, "SettingSync", serde_json::json!({"cursor": 0})).await;
    let (action, envelope) = next_frame(&mut client).await;
    assert_eq!(action, "SettingSync");
    assert_eq!(envelope["data"]["settings"][0]["key"], "theme");
}
