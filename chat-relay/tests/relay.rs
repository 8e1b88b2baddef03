use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, ensure};
use argon2::Params;
use chat_relay::{
    auth::MemoryCredentials,
    client::render,
    config::RelayConfig,
    directory::Directory,
    envelope::{
        AuthAction, Body, Envelope, SERVER_SENDER, read_envelope, write_envelope,
    },
    history::MemoryHistory,
    rooms::RoomHub,
    router::{EVICTION_NOTICE, Router},
    server::Relay,
    session::{CloseReason, Session, run_writer},
    storage::DiskFileStore,
    transfer::{self, PendingTransfers, Progress},
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);
const PASSWORD: &str = "hunter2";

struct TestRelay {
    addr: SocketAddr,
    router: Arc<Router>,
    uploads: TempDir,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestRelay {
    async fn start() -> Result<Self> {
        Self::start_with(RelayConfig::default()).await
    }

    async fn start_with(config: RelayConfig) -> Result<Self> {
        let uploads = tempfile::tempdir()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let relay = Relay::new(listener, test_router(&uploads)?, config);
        let router = Arc::clone(relay.router());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = relay.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            router,
            uploads,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    async fn stop(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        timeout(READ_TIMEOUT, self.task).await??;
        Ok(())
    }
}

fn test_router(uploads: &TempDir) -> Result<Router> {
    let params = Params::new(256, 1, 1, None).map_err(|err| anyhow!("argon2 params: {err}"))?;
    Ok(Router::new(
        Arc::new(RoomHub::default()),
        Arc::new(Directory::default()),
        Arc::new(MemoryCredentials::with_params(params)),
        Arc::new(MemoryHistory::default()),
        Arc::new(DiskFileStore::new(uploads.path())),
    ))
}

fn auth(action: AuthAction, username: &str) -> Envelope {
    Envelope::new(Body::Auth {
        action,
        username: username.to_string(),
        password: PASSWORD.to_string(),
    })
}

fn text(content: &str) -> Envelope {
    Envelope::new(Body::Text {
        content: content.to_string(),
    })
}

fn is_server_reply(envelope: &Envelope) -> bool {
    envelope.sender == SERVER_SENDER && matches!(envelope.body, Body::Command { .. })
}

fn is_event(envelope: &Envelope) -> bool {
    envelope.sender == SERVER_SENDER && matches!(envelope.body, Body::Text { .. })
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn register(addr: SocketAddr, username: &str) -> Result<Self> {
        let mut client = Self::connect(addr).await?;
        client.send(auth(AuthAction::Register, username)).await?;
        let reply = client.reply().await?;
        ensure!(
            reply == "SUCCESS: Registered and logged in successfully",
            "{username} failed to register: {reply}"
        );
        Ok(client)
    }

    async fn send(&mut self, envelope: Envelope) -> Result<()> {
        write_envelope(&mut self.writer, &envelope).await?;
        Ok(())
    }

    async fn send_raw(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Envelope> {
        timeout(READ_TIMEOUT, read_envelope(&mut self.reader))
            .await
            .context("timed out waiting for envelope")??
            .context("connection closed")
    }

    async fn recv_until(&mut self, matches: impl Fn(&Envelope) -> bool) -> Result<Envelope> {
        loop {
            let envelope = self.recv().await?;
            if matches(&envelope) {
                return Ok(envelope);
            }
        }
    }

    /// Next `command` reply from the relay, skipping room traffic.
    async fn reply(&mut self) -> Result<String> {
        let envelope = self.recv_until(is_server_reply).await?;
        Ok(envelope.content().unwrap_or_default().to_string())
    }

    /// Next lifecycle event text, skipping everything else.
    async fn event(&mut self) -> Result<String> {
        let envelope = self.recv_until(is_event).await?;
        Ok(envelope.content().unwrap_or_default().to_string())
    }

    async fn command(&mut self, content: &str) -> Result<String> {
        self.send(Envelope::command(content)).await?;
        self.reply().await
    }

    async fn room_command(&mut self, content: &str, room: &str) -> Result<String> {
        self.send(Envelope::room_command(content, room)).await?;
        self.reply().await
    }

    async fn expect_closed(&mut self) -> Result<()> {
        loop {
            match timeout(READ_TIMEOUT, read_envelope(&mut self.reader))
                .await
                .context("connection was not closed")?
            {
                Ok(None) => return Ok(()),
                Ok(Some(_)) => continue,
                Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[tokio::test]
async fn room_members_see_joins_and_messages() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut alice = TestClient::register(relay.addr, "alice").await?;
    assert_eq!(
        alice.room_command("create", "r1").await?,
        "SUCCESS: Room created and joined: r1"
    );

    let mut bob = TestClient::register(relay.addr, "bob").await?;
    assert_eq!(bob.room_command("join", "r1").await?, "SUCCESS: Joined room: r1");

    assert_eq!(alice.event().await?, "bob has joined the room");

    alice.send(text("Hello everyone!")).await?;
    let heard = bob
        .recv_until(|envelope| envelope.sender == "alice")
        .await?;
    assert_eq!(heard.room, "r1");
    assert_eq!(render(&heard).as_deref(), Some("[r1] alice: Hello everyone!"));

    let rooms = alice.command("rooms").await?;
    let rooms: Vec<String> = serde_json::from_str(&rooms)?;
    assert_eq!(rooms, vec!["general", "r1"]);

    assert_eq!(alice.command("status away").await?, "SUCCESS: Status updated to: away");
    assert_eq!(bob.event().await?, "alice is now away");

    relay.stop().await
}

#[tokio::test]
async fn unauthenticated_requests_are_refused() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut client = TestClient::connect(relay.addr).await?;

    assert_eq!(client.command("rooms").await?, "ERROR: Not authenticated");
    client.send(text("anyone there?")).await?;
    assert_eq!(client.reply().await?, "ERROR: Not authenticated");

    client.send(auth(AuthAction::Login, "ghost")).await?;
    assert_eq!(client.reply().await?, "ERROR: Invalid credentials");

    relay.stop().await
}

#[tokio::test]
async fn malformed_lines_keep_the_connection_open() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = TestClient::register(relay.addr, "alice").await?;

    alice.send_raw("this is not json").await?;
    alice.send_raw(r#"{"type":"teleport","content":"x"}"#).await?;
    alice.send_raw("").await?;

    let rooms = alice.command("rooms").await?;
    assert_eq!(rooms, r#"["general"]"#);

    relay.stop().await
}

#[tokio::test]
async fn duplicate_registration_and_commands_outside_rooms_fail() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = TestClient::register(relay.addr, "alice").await?;

    let mut imposter = TestClient::connect(relay.addr).await?;
    imposter.send(auth(AuthAction::Register, "alice")).await?;
    assert_eq!(imposter.reply().await?, "ERROR: Username already exists");

    alice.send(text("hello?")).await?;
    assert_eq!(
        alice.reply().await?,
        "ERROR: You are not in a room. Join a room first."
    );
    assert_eq!(alice.command("leave").await?, "ERROR: You are not in a room. Join a room first.");
    assert_eq!(alice.room_command("join", "nowhere").await?, "ERROR: Room not found: nowhere");
    assert_eq!(alice.command("dance").await?, "ERROR: Unknown command: dance");

    relay.stop().await
}

#[tokio::test]
async fn direct_message_to_absent_user_is_an_error() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = TestClient::register(relay.addr, "alice").await?;

    alice
        .send(Envelope::new(Body::Direct {
            recipient: "carol".into(),
            content: "are you there?".into(),
        }))
        .await?;
    assert_eq!(alice.reply().await?, "ERROR: User not found: carol");
    assert_eq!(alice.command("msg carol hi").await?, "ERROR: User not found: carol");
    assert_eq!(
        alice.command("history carol").await?,
        "SUCCESS: No message history with user: carol"
    );

    relay.stop().await
}

#[tokio::test]
async fn direct_and_encrypted_messages_reach_only_the_pair() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = TestClient::register(relay.addr, "alice").await?;
    let mut bob = TestClient::register(relay.addr, "bob").await?;

    alice.send(Envelope::command("msg bob lunch?")).await?;
    let received = bob.recv_until(|envelope| envelope.sender == "alice").await?;
    assert_eq!(
        received.body,
        Body::Direct {
            recipient: "bob".into(),
            content: "lunch?".into()
        }
    );
    let echo = alice.recv_until(|envelope| envelope.sender == "alice").await?;
    assert_eq!(echo.content(), Some("lunch?"));

    alice.send(Envelope::command("encrypt bob c2VjcmV0")).await?;
    let sealed = bob.recv_until(|envelope| envelope.sender == "alice").await?;
    assert!(sealed.encrypted);
    assert_eq!(sealed.content(), Some("c2VjcmV0"));

    // Alice's requests are handled in order, so this reply means both
    // messages have been recorded.
    alice.command("rooms").await?;

    bob.send(Envelope::command("history alice")).await?;
    assert_eq!(bob.reply().await?, "Message history with alice:");
    let first = bob.recv().await?;
    let second = bob.recv().await?;
    assert_eq!(first.content(), Some("lunch?"));
    assert_eq!(second.content(), Some("[Encrypted message]"));

    relay.stop().await
}

#[tokio::test]
async fn switching_rooms_leaves_exactly_once() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut watcher_a = TestClient::register(relay.addr, "wa").await?;
    watcher_a.room_command("create", "a").await?;
    let mut watcher_b = TestClient::register(relay.addr, "wb").await?;
    watcher_b.room_command("create", "b").await?;

    let mut alice = TestClient::register(relay.addr, "alice").await?;
    assert_eq!(alice.room_command("join", "a").await?, "SUCCESS: Joined room: a");
    assert_eq!(watcher_a.event().await?, "alice has joined the room");

    assert_eq!(alice.room_command("join", "b").await?, "SUCCESS: Joined room: b");
    assert_eq!(
        alice.room_command("join", "b").await?,
        "SUCCESS: Already in room: b"
    );

    assert_eq!(watcher_b.event().await?, "alice has joined the room");

    // Count everything room a sees up to a marker of its own.
    watcher_a.send(text("marker")).await?;
    let mut departures = 0;
    loop {
        let envelope = watcher_a.recv().await?;
        if envelope.content() == Some("marker") {
            break;
        }
        if is_event(&envelope) && envelope.content() == Some("alice has left the room") {
            departures += 1;
        }
    }
    assert_eq!(departures, 1);

    let hub = relay.router.hub();
    let room_a = hub.get("a").await.context("room a")?;
    let room_b = hub.get("b").await.context("room b")?;
    assert_eq!(room_a.member_names().await, vec!["wa"]);
    assert_eq!(room_b.member_names().await, vec!["alice", "wb"]);

    relay.stop().await
}

#[tokio::test]
async fn broadcasts_arrive_in_order() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = TestClient::register(relay.addr, "alice").await?;
    alice.room_command("create", "r1").await?;
    let mut bob = TestClient::register(relay.addr, "bob").await?;
    bob.room_command("join", "r1").await?;

    for i in 0..50 {
        alice.send(text(&format!("m{i}"))).await?;
    }

    for reader in [&mut bob, &mut alice] {
        for i in 0..50 {
            let envelope = reader.recv_until(|envelope| envelope.sender == "alice").await?;
            assert_eq!(envelope.content(), Some(format!("m{i}").as_str()));
        }
    }

    relay.stop().await
}

#[tokio::test]
async fn joining_replays_recent_room_history() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = TestClient::register(relay.addr, "alice").await?;
    alice.room_command("create", "r1").await?;

    for i in 0..12 {
        alice.send(text(&format!("m{i}"))).await?;
    }
    assert_eq!(alice.command("history").await?, "Message history for room r1:");
    for i in 0..12 {
        let envelope = alice.recv().await?;
        assert_eq!(envelope.content(), Some(format!("m{i}").as_str()));
    }

    let mut bob = TestClient::register(relay.addr, "bob").await?;
    bob.send(Envelope::room_command("join", "r1")).await?;
    assert_eq!(bob.reply().await?, "Recent messages:");
    for i in 2..12 {
        let envelope = bob.recv().await?;
        assert_eq!(envelope.sender, "alice");
        assert_eq!(envelope.content(), Some(format!("m{i}").as_str()));
    }
    assert_eq!(bob.reply().await?, "SUCCESS: Joined room: r1");

    relay.stop().await
}

#[tokio::test]
async fn out_of_order_chunks_reassemble_byte_identical() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = TestClient::register(relay.addr, "alice").await?;
    alice.room_command("create", "r1").await?;
    let mut bob = TestClient::register(relay.addr, "bob").await?;
    bob.room_command("join", "r1").await?;

    let original: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    let chunks = transfer::split("data.bin", &original, 8192)?;
    let sizes: Vec<usize> = chunks.iter().map(|chunk| chunk.data.len()).collect();
    assert_eq!(sizes, vec![8192, 8192, 3616]);

    // Chunk 0 arrives twice; only its first copy is announced.
    for index in [1, 0, 0, 2] {
        alice
            .send(Envelope::new(Body::File(chunks[index].clone())))
            .await?;
    }

    // Bob gets every chunk forwarded, then the upload notice.
    let mut incoming = PendingTransfers::default();
    let mut downloaded = None;
    let mut sending_notices = 0;
    loop {
        let envelope = bob.recv().await?;
        match &envelope.body {
            Body::File(chunk) => {
                if let Progress::Complete(file) = incoming.accept(&envelope.sender, chunk)? {
                    downloaded = Some(file.bytes);
                }
            }
            _ if envelope.content() == Some("alice is sending file: data.bin") => {
                assert!(is_event(&envelope));
                sending_notices += 1;
            }
            _ if envelope.content() == Some("File data.bin uploaded by alice is available") => {
                break;
            }
            _ => {}
        }
    }
    assert_eq!(downloaded.as_deref(), Some(original.as_slice()));
    assert_eq!(sending_notices, 1);

    let stored = tokio::fs::read(relay.uploads.path().join("r1").join("data.bin")).await?;
    assert_eq!(stored, original);

    let room = relay.router.hub().get("r1").await.context("room r1")?;
    assert_eq!(room.pending_transfers().await, 0);

    relay.stop().await
}

#[tokio::test]
async fn inconsistent_chunk_is_rejected_and_not_forwarded() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = TestClient::register(relay.addr, "alice").await?;
    alice.room_command("create", "r1").await?;

    let mut chunks = transfer::split("notes.txt", &[7u8; 100], 40)?;
    chunks[1].chunk_id = 9;
    alice.send(Envelope::new(Body::File(chunks[1].clone()))).await?;

    let reply = alice.reply().await?;
    assert!(reply.starts_with("ERROR: Rejected file chunk:"), "{reply}");

    relay.stop().await
}

#[tokio::test]
async fn second_login_evicts_the_first_connection() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut first = TestClient::register(relay.addr, "alice").await?;
    first.room_command("join", "general").await?;

    let mut second = TestClient::connect(relay.addr).await?;
    second.send(auth(AuthAction::Login, "alice")).await?;
    assert_eq!(second.reply().await?, "SUCCESS: Logged in successfully");

    assert_eq!(first.reply().await?, EVICTION_NOTICE);
    first.expect_closed().await?;

    let general = relay.router.hub().get("general").await.context("general")?;
    assert!(general.member_names().await.is_empty());
    assert_eq!(relay.router.directory().online().await, vec!["alice"]);

    // The surviving connection is fully usable.
    assert_eq!(
        second.room_command("join", "general").await?,
        "SUCCESS: Joined room: general"
    );
    assert_eq!(second.command("status away").await?, "SUCCESS: Status updated to: away");

    relay.stop().await
}

#[tokio::test]
async fn quit_and_idle_connections_are_closed() -> Result<()> {
    let config = RelayConfig {
        idle_timeout: Duration::from_millis(300),
        ..RelayConfig::default()
    };
    let relay = TestRelay::start_with(config).await?;

    let mut quitter = TestClient::register(relay.addr, "alice").await?;
    assert_eq!(quitter.command("quit").await?, "SUCCESS: Goodbye");
    quitter.expect_closed().await?;

    let mut idle = TestClient::connect(relay.addr).await?;
    idle.expect_closed().await?;

    relay.stop().await
}

#[tokio::test]
async fn shutdown_notifies_connected_clients() -> Result<()> {
    let relay = TestRelay::start().await?;
    let mut alice = TestClient::register(relay.addr, "alice").await?;

    relay.stop().await?;

    assert_eq!(alice.reply().await?, "ERROR: server shutting down");
    alice.expect_closed().await
}

#[tokio::test]
async fn flooded_member_is_disconnected_alone() -> Result<()> {
    let uploads = tempfile::tempdir()?;
    let router = test_router(&uploads)?;

    // The slow member's queue is never drained: four slots hold its auth
    // reply, its own join notice, the join reply and alice's join notice.
    let (slow, _slow_outbox) = Session::new(1, None, 4);
    router.connect(&slow).await;
    router.route(&slow, auth(AuthAction::Register, "slow")).await;
    router
        .route(&slow, Envelope::room_command("join", "general"))
        .await;

    let (alice, alice_outbox) = Session::new(2, None, 256);
    router.connect(&alice).await;
    let (alice_end, relay_end) = tokio::io::duplex(1 << 20);
    let writer = tokio::spawn(run_writer(relay_end, alice_outbox, Arc::clone(&alice)));
    router.route(&alice, auth(AuthAction::Register, "alice")).await;
    router
        .route(&alice, Envelope::room_command("join", "general"))
        .await;
    assert!(!slow.is_closed());

    for i in 0..10 {
        router.route(&alice, text(&format!("m{i}"))).await;
    }
    assert_eq!(slow.close_reason(), Some(CloseReason::Overflow));
    assert!(!alice.is_closed());

    router.disconnect(&slow, CloseReason::Overflow).await;
    router.disconnect(&alice, CloseReason::Quit).await;
    timeout(READ_TIMEOUT, writer).await???;

    let mut reader = BufReader::new(alice_end);
    let mut messages = Vec::new();
    let mut events = Vec::new();
    while let Some(envelope) = read_envelope(&mut reader).await? {
        if envelope.sender == "alice" {
            messages.push(envelope.content().unwrap_or_default().to_string());
        } else if is_event(&envelope) {
            events.push(envelope.content().unwrap_or_default().to_string());
        }
    }

    let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
    assert_eq!(messages, expected);
    assert_eq!(
        events,
        vec!["alice has joined the room", "slow has disconnected from the server"]
    );
    Ok(())
}

#[tokio::test]
async fn unfinished_upload_is_dropped_when_the_sender_disconnects() -> Result<()> {
    let uploads = tempfile::tempdir()?;
    let router = test_router(&uploads)?;

    let (alice, _alice_outbox) = Session::new(1, None, 64);
    router.connect(&alice).await;
    router.route(&alice, auth(AuthAction::Register, "alice")).await;
    router
        .route(&alice, Envelope::room_command("join", "general"))
        .await;

    let chunks = transfer::split("big.bin", &[3u8; 100], 10)?;
    assert_eq!(chunks.len(), 10);
    router
        .route(&alice, Envelope::new(Body::File(chunks[0].clone())))
        .await;

    let general = router.hub().get("general").await.context("general")?;
    assert_eq!(general.pending_transfers().await, 1);

    router.disconnect(&alice, CloseReason::PeerClosed).await;
    assert_eq!(general.pending_transfers().await, 0);
    Ok(())
}

#[tokio::test]
async fn evicted_session_cannot_rejoin_a_room() -> Result<()> {
    let uploads = tempfile::tempdir()?;
    let router = test_router(&uploads)?;

    let (first, _first_outbox) = Session::new(1, None, 64);
    router.connect(&first).await;
    router.route(&first, auth(AuthAction::Register, "alice")).await;
    router
        .route(&first, Envelope::room_command("join", "general"))
        .await;

    let (second, _second_outbox) = Session::new(2, None, 64);
    router.connect(&second).await;
    router.route(&second, auth(AuthAction::Login, "alice")).await;
    assert_eq!(first.close_reason(), Some(CloseReason::Evicted));

    // A join the old connection already had in flight goes nowhere.
    router
        .route(&first, Envelope::room_command("join", "general"))
        .await;

    let general = router.hub().get("general").await.context("general")?;
    assert!(general.member_names().await.is_empty());
    assert!(first.state().await.current_room.is_none());
    assert!(second.state().await.authenticated);
    Ok(())
}
