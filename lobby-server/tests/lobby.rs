// End-to-end tests for the lobby server.
//
// Each test starts a real server on an ephemeral port and drives it with
// real TCP clients speaking the wire protocol. These are the scenarios the
// server exists for: handshakes with every rejection reason, the game
// directory with its broadcasts, session transfer into games, admission
// limits and the deferred teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time;

use lobby_server::callback::TracingCallback;
use lobby_server::config::ServerConfig;
use lobby_server::lobby::MAX_SESSIONS;
use lobby_server::server::Server;
use protocol::{
    CreateGameData, ErrorCode, GameData, GameListMode, InitData, JoinGameData, NET_VERSION_MAJOR,
    NET_VERSION_MINOR, Packet, PlayerType, RetrievePlayerInfoData,
};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Short grace period so teardown tests stay fast.
const TEST_CLOSE_DELAY_SECS: u64 = 1;

async fn start_server(password: &str) -> Server {
    let config = ServerConfig {
        port: 0,
        server_password: password.into(),
        close_session_delay_secs: TEST_CLOSE_DELAY_SECS,
        ..ServerConfig::default()
    };
    Server::start(config, Arc::new(TracingCallback))
        .await
        .expect("server should start")
}

/// Loopback address of a server bound to the wildcard address.
fn loopback(server: &Server) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()))
}

struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    async fn connect(server: &Server) -> TestClient {
        let stream = TcpStream::connect(loopback(server))
            .await
            .expect("connect to server");
        TestClient { stream }
    }

    async fn send(&mut self, packet: Packet) {
        protocol::write_packet(&mut self.stream, &packet)
            .await
            .expect("send packet");
    }

    async fn recv(&mut self) -> Packet {
        time::timeout(STEP_TIMEOUT, protocol::read_packet(&mut self.stream))
            .await
            .expect("timed out waiting for a packet")
            .expect("read packet")
    }

    async fn recv_error(&mut self) -> ErrorCode {
        match self.recv().await {
            Packet::Error(data) => data.error_code,
            other => panic!("expected an error packet, got {:?}", other),
        }
    }

    /// Asserts that nothing arrives within the window.
    async fn expect_silence(&mut self, window: Duration) {
        let result = time::timeout(window, protocol::read_packet(&mut self.stream)).await;
        assert!(result.is_err(), "expected silence, got {:?}", result);
    }

    /// Asserts that the server eventually closes this connection.
    async fn expect_closed(&mut self) {
        let result = time::timeout(STEP_TIMEOUT, protocol::read_packet(&mut self.stream))
            .await
            .expect("timed out waiting for the connection to close");
        assert!(result.is_err(), "expected EOF, got {:?}", result);
    }

    fn init_packet(name: &str, password: &str) -> Packet {
        Packet::Init(InitData {
            version_major: NET_VERSION_MAJOR,
            version_minor: NET_VERSION_MINOR,
            password: password.into(),
            player_name: name.into(),
        })
    }

    /// Connects and completes the handshake; returns the client and its
    /// player id. Game-list packets that follow the ack stay unread.
    async fn handshake(server: &Server, name: &str, password: &str) -> (TestClient, u32) {
        let mut client = TestClient::connect(server).await;
        client.send(Self::init_packet(name, password)).await;
        match client.recv().await {
            Packet::InitAck(ack) => {
                assert_ne!(ack.session_id, 0, "live sessions never get id 0");
                (client, ack.player_id)
            }
            other => panic!("expected InitAck, got {:?}", other),
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// A valid handshake yields an ack and, with an empty directory, nothing
/// else.
#[tokio::test]
async fn valid_handshake_establishes_session() {
    let server = start_server("secret").await;
    let (mut alice, player_id) = TestClient::handshake(&server, "Alice", "secret").await;
    assert!(player_id > 0);
    alice.expect_silence(Duration::from_millis(300)).await;
    server.shutdown().await;
}

#[tokio::test]
async fn wrong_password_is_rejected_and_closed() {
    let server = start_server("secret").await;
    let mut client = TestClient::connect(&server).await;
    client.send(TestClient::init_packet("Alice", "bad")).await;
    assert_eq!(client.recv_error().await, ErrorCode::InvalidPassword);
    // After the grace period the socket goes away.
    client.expect_closed().await;
}

#[tokio::test]
async fn version_mismatch_is_rejected() {
    let server = start_server("").await;
    let mut client = TestClient::connect(&server).await;
    client
        .send(Packet::Init(InitData {
            version_major: NET_VERSION_MAJOR + 1,
            version_minor: NET_VERSION_MINOR,
            password: String::new(),
            player_name: "Alice".into(),
        }))
        .await;
    assert_eq!(client.recv_error().await, ErrorCode::VersionNotSupported);
}

#[tokio::test]
async fn reserved_and_malformed_names_are_rejected() {
    let server = start_server("").await;
    for name in ["ComputerX", "#alice", ""] {
        let mut client = TestClient::connect(&server).await;
        client.send(TestClient::init_packet(name, "")).await;
        assert_eq!(
            client.recv_error().await,
            ErrorCode::InvalidPlayerName,
            "name {:?} should be invalid",
            name
        );
    }
}

#[tokio::test]
async fn duplicate_name_is_rejected() {
    let server = start_server("").await;
    let (_alice, _) = TestClient::handshake(&server, "Alice", "").await;
    let mut imposter = TestClient::connect(&server).await;
    imposter.send(TestClient::init_packet("Alice", "")).await;
    assert_eq!(imposter.recv_error().await, ErrorCode::PlayerNameInUse);
}

#[tokio::test]
async fn packet_before_handshake_is_an_invalid_state() {
    let server = start_server("").await;
    let mut client = TestClient::connect(&server).await;
    client
        .send(Packet::RetrievePlayerInfo(RetrievePlayerInfoData {
            player_id: 1,
        }))
        .await;
    assert_eq!(client.recv_error().await, ErrorCode::InvalidState);
}

#[tokio::test]
async fn second_init_is_an_invalid_state() {
    let server = start_server("").await;
    let (mut alice, _) = TestClient::handshake(&server, "Alice", "").await;
    alice.send(TestClient::init_packet("Alice2", "")).await;
    assert_eq!(alice.recv_error().await, ErrorCode::InvalidState);
}

// ---------------------------------------------------------------------------
// Game directory
// ---------------------------------------------------------------------------

fn create_game(name: &str, password: &str, payload: &[u8]) -> Packet {
    Packet::CreateGame(CreateGameData {
        game_name: name.into(),
        password: password.into(),
        game_data: GameData(payload.to_vec()),
    })
}

/// Alice creates a game, Bob joins it: the lobby broadcasts the new game
/// to bystanders, hands the list to late handshakes and announces the
/// join to the sessions still in the lobby.
#[tokio::test]
async fn create_then_join_updates_the_lobby() {
    let server = start_server("").await;
    let (mut alice, alice_id) = TestClient::handshake(&server, "Alice", "").await;
    let (mut carol, _) = TestClient::handshake(&server, "Carol", "").await;

    alice.send(create_game("g1", "", &[1, 2, 3])).await;

    let game_id = match carol.recv().await {
        Packet::GameListNew(data) => {
            assert_eq!(data.game_info.mode, GameListMode::Created);
            assert_eq!(data.game_info.name, "g1");
            assert_eq!(data.game_info.data, GameData(vec![1, 2, 3]));
            assert_eq!(data.game_info.players, vec![alice_id]);
            data.game_id
        }
        other => panic!("expected GameListNew, got {:?}", other),
    };

    // A handshake after the creation receives the directory.
    let (mut bob, bob_id) = TestClient::handshake(&server, "Bob", "").await;
    match bob.recv().await {
        Packet::GameListNew(data) => assert_eq!(data.game_id, game_id),
        other => panic!("expected GameListNew, got {:?}", other),
    }

    bob.send(Packet::JoinGame(JoinGameData {
        game_id,
        password: String::new(),
    }))
    .await;

    match carol.recv().await {
        Packet::GameListPlayerJoined(data) => {
            assert_eq!(data.game_id, game_id);
            assert_eq!(data.player_id, bob_id);
        }
        other => panic!("expected GameListPlayerJoined, got {:?}", other),
    }

    // Alice owns the game session now; lobby broadcasts must not reach
    // her.
    alice.expect_silence(Duration::from_millis(300)).await;
    server.shutdown().await;
}

#[tokio::test]
async fn joining_an_unknown_game_keeps_the_session() {
    let server = start_server("").await;
    let (mut bob, _) = TestClient::handshake(&server, "Bob", "").await;
    bob.send(Packet::JoinGame(JoinGameData {
        game_id: 9999,
        password: String::new(),
    }))
    .await;
    assert_eq!(bob.recv_error().await, ErrorCode::UnknownGame);

    // Bob is still established: directory broadcasts keep arriving.
    let (mut alice, _) = TestClient::handshake(&server, "Alice", "").await;
    alice.send(create_game("g1", "", &[])).await;
    match bob.recv().await {
        Packet::GameListNew(data) => assert_eq!(data.game_info.name, "g1"),
        other => panic!("expected GameListNew, got {:?}", other),
    }
}

#[tokio::test]
async fn joining_with_a_wrong_password_keeps_the_session() {
    let server = start_server("").await;
    let (mut alice, _) = TestClient::handshake(&server, "Alice", "").await;
    let (mut bob, _) = TestClient::handshake(&server, "Bob", "").await;

    alice.send(create_game("locked", "pw", &[])).await;
    let game_id = match bob.recv().await {
        Packet::GameListNew(data) => data.game_id,
        other => panic!("expected GameListNew, got {:?}", other),
    };

    bob.send(Packet::JoinGame(JoinGameData {
        game_id,
        password: "bad".into(),
    }))
    .await;
    assert_eq!(bob.recv_error().await, ErrorCode::InvalidPassword);

    // Still in the lobby.
    let (mut carol, _) = TestClient::handshake(&server, "Carol", "").await;
    match carol.recv().await {
        Packet::GameListNew(_) => {}
        other => panic!("expected GameListNew, got {:?}", other),
    }
    carol.send(create_game("open", "", &[])).await;
    match bob.recv().await {
        Packet::GameListNew(data) => assert_eq!(data.game_info.name, "open"),
        other => panic!("expected GameListNew, got {:?}", other),
    }
}

/// Game ids are handed out in creation order, and each lobby session sees
/// the announcements in that order.
#[tokio::test]
async fn game_announcements_arrive_in_creation_order() {
    let server = start_server("").await;
    let (mut alice, _) = TestClient::handshake(&server, "Alice", "").await;
    let (mut bob, _) = TestClient::handshake(&server, "Bob", "").await;
    let (mut carol, _) = TestClient::handshake(&server, "Carol", "").await;

    alice.send(create_game("first", "", &[])).await;
    let first_id = match carol.recv().await {
        Packet::GameListNew(data) => data.game_id,
        other => panic!("expected GameListNew, got {:?}", other),
    };
    match bob.recv().await {
        Packet::GameListNew(data) => assert_eq!(data.game_id, first_id),
        other => panic!("expected GameListNew, got {:?}", other),
    }

    bob.send(create_game("second", "", &[])).await;
    match carol.recv().await {
        Packet::GameListNew(data) => {
            assert!(data.game_id > first_id, "game ids must increase");
            assert_eq!(data.game_info.name, "second");
        }
        other => panic!("expected GameListNew, got {:?}", other),
    }
}

/// Player ids increase strictly over the lifetime of the server.
#[tokio::test]
async fn player_ids_increase_strictly() {
    let server = start_server("").await;
    let (_a, id_a) = TestClient::handshake(&server, "Alice", "").await;
    let (_b, id_b) = TestClient::handshake(&server, "Bob", "").await;
    let (_c, id_c) = TestClient::handshake(&server, "Carol", "").await;
    assert!(id_a < id_b && id_b < id_c);
}

// ---------------------------------------------------------------------------
// Player info
// ---------------------------------------------------------------------------

#[tokio::test]
async fn player_info_is_resolved_in_lobby_and_games() {
    let server = start_server("").await;
    let (mut alice, alice_id) = TestClient::handshake(&server, "Alice", "").await;
    let (mut bob, _) = TestClient::handshake(&server, "Bob", "").await;

    // Alice is in the lobby.
    bob.send(Packet::RetrievePlayerInfo(RetrievePlayerInfoData {
        player_id: alice_id,
    }))
    .await;
    match bob.recv().await {
        Packet::PlayerInfo(data) => {
            assert_eq!(data.player_id, alice_id);
            assert_eq!(data.player_name, "Alice");
            assert_eq!(data.player_type, PlayerType::Human);
        }
        other => panic!("expected PlayerInfo, got {:?}", other),
    }

    // Alice moves into a game; the lookup still finds her there.
    alice.send(create_game("g1", "", &[])).await;
    match bob.recv().await {
        Packet::GameListNew(_) => {}
        other => panic!("expected GameListNew, got {:?}", other),
    }
    bob.send(Packet::RetrievePlayerInfo(RetrievePlayerInfoData {
        player_id: alice_id,
    }))
    .await;
    match bob.recv().await {
        Packet::PlayerInfo(data) => assert_eq!(data.player_name, "Alice"),
        other => panic!("expected PlayerInfo, got {:?}", other),
    }

    // An unknown id produces no reply at all.
    bob.send(Packet::RetrievePlayerInfo(RetrievePlayerInfoData {
        player_id: 424_242,
    }))
    .await;
    bob.expect_silence(Duration::from_millis(300)).await;
}

// ---------------------------------------------------------------------------
// Game teardown
// ---------------------------------------------------------------------------

/// When the last player leaves a game, the lobby reaps it and tells the
/// remaining lobby sessions.
#[tokio::test]
async fn empty_game_is_reaped_and_announced() {
    let server = start_server("").await;
    let (mut alice, alice_id) = TestClient::handshake(&server, "Alice", "").await;
    let (mut carol, _) = TestClient::handshake(&server, "Carol", "").await;

    alice.send(create_game("doomed", "", &[])).await;
    let game_id = match carol.recv().await {
        Packet::GameListNew(data) => data.game_id,
        other => panic!("expected GameListNew, got {:?}", other),
    };

    // Alice disconnects; her game is now empty.
    drop(alice);

    match carol.recv().await {
        Packet::GameListPlayerLeft(data) => {
            assert_eq!(data.game_id, game_id);
            assert_eq!(data.player_id, alice_id);
        }
        other => panic!("expected GameListPlayerLeft, got {:?}", other),
    }
    match carol.recv().await {
        Packet::GameListUpdate(data) => {
            assert_eq!(data.game_id, game_id);
            assert_eq!(data.mode, GameListMode::Closed);
        }
        other => panic!("expected GameListUpdate, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// The 65th connection is turned away with one error packet while the
/// existing sessions stay usable.
#[tokio::test]
async fn server_full_rejects_the_next_connection() {
    let server = start_server("").await;

    let mut residents = Vec::new();
    for _ in 0..MAX_SESSIONS {
        residents.push(TestClient::connect(&server).await);
    }
    // Registration happens one connection per lobby iteration; give the
    // loop time to work through the queue.
    time::sleep(Duration::from_secs(3)).await;

    let mut rejected = TestClient::connect(&server).await;
    assert_eq!(rejected.recv_error().await, ErrorCode::ServerFull);
    rejected.expect_closed().await;

    // A resident can still complete its handshake.
    let resident = residents.first_mut().expect("residents exist");
    resident.send(TestClient::init_packet("Alice", "")).await;
    match resident.recv().await {
        Packet::InitAck(_) => {}
        other => panic!("expected InitAck, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_closes_sessions_and_listener() {
    let server = start_server("").await;
    let addr = loopback(&server);
    let (mut alice, _) = TestClient::handshake(&server, "Alice", "").await;

    server.shutdown().await;

    alice.expect_closed().await;
    assert!(
        TcpStream::connect(addr).await.is_err(),
        "the listener should be gone"
    );
}
