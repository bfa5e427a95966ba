use clap::{Arg, Command};
use log::info;
use notesync::blob::LocalBlobStore;
use notesync::database::Database;
use notesync::history::HistoryKeeper;
use notesync::hub::Hub;
use notesync::reaper::Reaper;
use notesync::resolver::Resolver;
use notesync::token::{password_hash, SignedTokenCodec, TokenClaims, TokenCodec, UserClaims};
use notesync::types::*;
use notesync::upload::UploadManager;
use notesync::write_queue::WriteQueue;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::init();
    let matches = Command::new("notesync")
        .version("0.1.0")
        .about("Note and attachment sync service")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .takes_value(true)
                .help("configuration file path")
                .required(true),
        )
        .arg(
            Arg::new("register")
                .long("register")
                .takes_value(true)
                .number_of_values(2)
                .value_names(&["NAME", "PASSWORD"])
                .help("create a user, print its uid, and exit"),
        )
        .arg(
            Arg::new("issue-token")
                .long("issue-token")
                .takes_value(true)
                .value_name("NAME")
                .help("print a bearer token for an existing user and exit"),
        )
        .get_matches();

    let config_path = matches.value_of("config").unwrap();
    let config: Config = serde_json::from_str(
        &fs::read_to_string(config_path).expect("Cannot read configuration file"),
    )
    .expect("Cannot parse configuration file");
    if let Err(err) = config.validate() {
        panic!("Invalid configuration: {}", err);
    }

    let db_dir = Path::new(&config.db_path);
    if !db_dir.exists() {
        fs::create_dir_all(db_dir).expect("Cannot create directory for database");
    }
    let database = Arc::new(
        Database::new(&db_dir.join("notesync.db")).expect("Cannot open database"),
    );
    let tokens: Arc<dyn TokenCodec> =
        Arc::new(SignedTokenCodec::new(&config.secret, &config.machine_id));

    // Administrative one-shots, no server start.
    if let Some(mut values) = matches.values_of("register") {
        let name = values.next().unwrap();
        let password = values.next().unwrap();
        let user = database
            .create_user(name, name, &password_hash(&config.secret, password), false)
            .expect("Cannot create user");
        println!("{}", user.uid);
        return;
    }
    if let Some(name) = matches.value_of("issue-token") {
        let user = database
            .get_user_by_name(name)
            .expect("Cannot query user")
            .expect("No such user");
        let claims = TokenClaims::User(UserClaims {
            uid: user.uid,
            nickname: user.nickname,
            client_ip: String::new(),
            issued_at: now_millis(),
            expires_at: now_millis() + config.token_expiry as EpochMillis * 1000,
            credentials_version: user.credentials_version,
        });
        println!("{}", tokens.issue(&claims).expect("Cannot issue token"));
        return;
    }

    let blob_dir = Path::new(&config.blob_path);
    if !blob_dir.exists() {
        fs::create_dir_all(blob_dir).expect("Cannot create directory for blobs");
    }
    let blobs: Arc<dyn notesync::blob::BlobStore> =
        Arc::new(LocalBlobStore::new(blob_dir).expect("Cannot open blob store"));

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

    let reaper = Reaper::new(
        Arc::clone(&database),
        Arc::clone(&blobs),
        Duration::from_secs(config.soft_delete_retention_time),
    );
    tokio::spawn(reaper.run(Duration::from_secs(3600)));
    tokio::spawn(Arc::clone(&uploads).run_expiry(Duration::from_secs(
        (config.upload_session_timeout / 2).max(1),
    )));

    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .expect("Cannot bind listen address");
    let hub = Hub::new(config, database, resolver, uploads, tokens);

    let serving = tokio::spawn(Arc::clone(&hub).serve(listener));
    tokio::signal::ctrl_c().await.expect("Cannot listen for ctrl-c");
    info!("shutting down");
    hub.shutdown.cancel();
    queue.shutdown(Duration::from_secs(5)).await;
    history.flush_all();
    let _ = serving.await;
}
