//! Integration tests for natbridge-relay over loopback UDP
//!
//! These tests verify:
//! - PeerInfo exchange once streamer and viewer have announced both ports
//! - Idempotent PeerInfo replies to re-announcements
//! - Relaying of payload datagrams between matched peers and spectators
//! - Unknown sessions and malformed datagrams are dropped
//! - Address changes and sessions displaced by a re-keyed pair

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use k9::assert_equal;
use natbridge_proto::{decode, Body, Message, PortType, Role};
use natbridge_relay::{PeerInfoMode, PeerRegistry, RelayConfig, RelayServer};
use natbridge_store::MemorySessionStore;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

struct TestRelay {
    addr: SocketAddr,
    registry: Arc<PeerRegistry>,
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestRelay {
    async fn start(config: RelayConfig) -> Self {
        Self::start_with(config, &["abc"]).await
    }

    async fn start_with(config: RelayConfig, session_ids: &[&str]) -> Self {
        let store = Arc::new(MemorySessionStore::with_ids(session_ids.iter().copied()));
        let server = RelayServer::bind(config, store).await.unwrap();
        let addr = server.local_addr();
        let registry = server.registry();
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(stop_rx));
        Self {
            addr,
            registry,
            stop,
            handle,
        }
    }

    async fn shutdown(self) {
        self.stop.send(true).unwrap();
        timeout(WAIT, self.handle).await.unwrap().unwrap().unwrap();
    }
}

async fn socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn announce(sock: &UdpSocket, relay: SocketAddr, role: Role, port_type: PortType) {
    announce_session(sock, relay, "abc", role, port_type).await;
}

async fn announce_session(
    sock: &UdpSocket,
    relay: SocketAddr,
    session_id: &str,
    role: Role,
    port_type: PortType,
) {
    let bytes = Message::announcement(role, session_id, port_type)
        .to_bytes()
        .unwrap();
    sock.send_to(&bytes, relay).await.unwrap();
}

async fn recv_message(sock: &UdpSocket) -> Message {
    let mut buf = [0u8; 2048];
    let (len, _) = timeout(WAIT, sock.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();
    decode(&buf[..len]).unwrap()
}

async fn recv_raw(sock: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 2048];
    let (len, _) = timeout(WAIT, sock.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a datagram")
        .unwrap();
    buf[..len].to_vec()
}

async fn assert_silent(sock: &UdpSocket) {
    let mut buf = [0u8; 2048];
    assert!(
        timeout(QUIET, sock.recv_from(&mut buf)).await.is_err(),
        "unexpected datagram"
    );
}

fn peer_info(msg: &Message) -> (String, u16, u16) {
    match &msg.body {
        Body::PeerInfo {
            ip,
            video_port,
            control_port,
        } => (ip.clone(), *video_port, *control_port),
        other => panic!("expected PeerInfo, got {:?}", other),
    }
}

struct Peer {
    video: UdpSocket,
    control: UdpSocket,
}

impl Peer {
    async fn new() -> Self {
        Self {
            video: socket().await,
            control: socket().await,
        }
    }

    fn ports(&self) -> (u16, u16) {
        (
            self.video.local_addr().unwrap().port(),
            self.control.local_addr().unwrap().port(),
        )
    }
}

#[tokio::test]
async fn test_peer_info_exchange_in_direct_mode() {
    let relay = TestRelay::start(RelayConfig::local()).await;
    let streamer = Peer::new().await;
    let viewer = Peer::new().await;

    announce(&streamer.video, relay.addr, Role::Streamer, PortType::Video).await;
    announce(&streamer.control, relay.addr, Role::Streamer, PortType::Control).await;
    announce(&viewer.video, relay.addr, Role::Viewer, PortType::Video).await;
    assert_silent(&streamer.video).await;

    announce(&viewer.control, relay.addr, Role::Viewer, PortType::Control).await;

    let (sv, sc) = streamer.ports();
    let (vv, vc) = viewer.ports();
    for sock in [&streamer.video, &streamer.control] {
        assert_equal!(peer_info(&recv_message(sock).await), ("127.0.0.1".to_string(), vv, vc));
    }
    for sock in [&viewer.video, &viewer.control] {
        assert_equal!(peer_info(&recv_message(sock).await), ("127.0.0.1".to_string(), sv, sc));
    }

    // exactly one exchange
    assert_silent(&streamer.video).await;

    // re-announcing gets a reply on that socket only
    announce(&viewer.video, relay.addr, Role::Viewer, PortType::Video).await;
    assert_equal!(peer_info(&recv_message(&viewer.video).await), ("127.0.0.1".to_string(), sv, sc));
    assert_silent(&streamer.video).await;
    assert_silent(&viewer.control).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn test_relay_mode_forwards_payload() {
    let relay = TestRelay::start(RelayConfig {
        peer_info_mode: PeerInfoMode::Relay,
        ..RelayConfig::local()
    })
    .await;
    let streamer = Peer::new().await;
    let viewer = Peer::new().await;

    announce(&streamer.video, relay.addr, Role::Streamer, PortType::Video).await;
    announce(&streamer.control, relay.addr, Role::Streamer, PortType::Control).await;
    announce(&viewer.video, relay.addr, Role::Viewer, PortType::Video).await;
    announce(&viewer.control, relay.addr, Role::Viewer, PortType::Control).await;

    let expected = ("127.0.0.1".to_string(), relay.addr.port(), relay.addr.port());
    for sock in [&streamer.video, &streamer.control, &viewer.video, &viewer.control] {
        assert_equal!(peer_info(&recv_message(sock).await), expected.clone());
    }

    // payload is relayed verbatim, per port class
    streamer.video.send_to(b"frame-1", relay.addr).await.unwrap();
    assert_equal!(recv_raw(&viewer.video).await, b"frame-1".to_vec());

    let heartbeat = Message::new(Body::Heartbeat).to_bytes().unwrap();
    viewer.control.send_to(&heartbeat, relay.addr).await.unwrap();
    assert_equal!(recv_raw(&streamer.control).await, heartbeat);

    assert_silent(&viewer.control).await;
    assert_silent(&streamer.video).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn test_spectator_receives_streamer_traffic() {
    let relay = TestRelay::start(RelayConfig::local()).await;
    let streamer = Peer::new().await;
    let viewer = Peer::new().await;
    let spectator = Peer::new().await;

    announce(&streamer.video, relay.addr, Role::Streamer, PortType::Video).await;
    announce(&streamer.control, relay.addr, Role::Streamer, PortType::Control).await;
    announce(&viewer.video, relay.addr, Role::Viewer, PortType::Video).await;
    announce(&viewer.control, relay.addr, Role::Viewer, PortType::Control).await;
    for sock in [&streamer.video, &streamer.control, &viewer.video, &viewer.control] {
        recv_message(sock).await;
    }

    announce(&spectator.video, relay.addr, Role::Spectator, PortType::Video).await;
    assert_equal!(
        peer_info(&recv_message(&spectator.video).await),
        ("127.0.0.1".to_string(), relay.addr.port(), relay.addr.port())
    );
    announce(&spectator.control, relay.addr, Role::Spectator, PortType::Control).await;
    recv_message(&spectator.control).await;

    streamer.video.send_to(b"frame-2", relay.addr).await.unwrap();
    assert_equal!(recv_raw(&viewer.video).await, b"frame-2".to_vec());
    assert_equal!(recv_raw(&spectator.video).await, b"frame-2".to_vec());

    spectator.control.send_to(b"hello", relay.addr).await.unwrap();
    assert_equal!(recv_raw(&streamer.control).await, b"hello".to_vec());

    relay.shutdown().await;
}

#[tokio::test]
async fn test_unknown_session_and_garbage_are_dropped() {
    let relay = TestRelay::start(RelayConfig::local()).await;
    let sock = socket().await;

    let bytes = Message::announcement(Role::Streamer, "nope", PortType::Video)
        .to_bytes()
        .unwrap();
    sock.send_to(&bytes, relay.addr).await.unwrap();
    sock.send_to(b"\xc1\xc1garbage", relay.addr).await.unwrap();
    sock.send_to(b"unrouted payload", relay.addr).await.unwrap();
    assert_silent(&sock).await;

    // the relay is still serving
    announce(&sock, relay.addr, Role::Viewer, PortType::Video).await;
    assert_silent(&sock).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn test_unknown_session_reply_when_enabled() {
    let relay = TestRelay::start(RelayConfig {
        reply_unknown_session: true,
        ..RelayConfig::local()
    })
    .await;
    let sock = socket().await;

    let bytes = Message::announcement(Role::Viewer, "nope", PortType::Control)
        .to_bytes()
        .unwrap();
    sock.send_to(&bytes, relay.addr).await.unwrap();

    match recv_message(&sock).await.body {
        Body::Error { error } => {
            assert_equal!(error, "403".to_string());
        }
        other => panic!("expected Error, got {:?}", other),
    }

    relay.shutdown().await;
}

#[tokio::test]
async fn test_idle_sessions_are_swept() {
    let relay = TestRelay::start(RelayConfig {
        idle_timeout: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(20),
        peer_info_mode: PeerInfoMode::Relay,
        ..RelayConfig::local()
    })
    .await;
    let streamer = Peer::new().await;
    let viewer = Peer::new().await;

    announce(&streamer.video, relay.addr, Role::Streamer, PortType::Video).await;
    announce(&streamer.control, relay.addr, Role::Streamer, PortType::Control).await;
    announce(&viewer.video, relay.addr, Role::Viewer, PortType::Video).await;
    announce(&viewer.control, relay.addr, Role::Viewer, PortType::Control).await;
    for sock in [&streamer.video, &streamer.control, &viewer.video, &viewer.control] {
        recv_message(sock).await;
    }

    tokio::time::sleep(Duration::from_millis(400)).await;

    // routes are gone with the session
    streamer.video.send_to(b"late", relay.addr).await.unwrap();
    assert_silent(&viewer.video).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn test_address_change_resends_peer_info_and_reroutes() {
    let relay = TestRelay::start(RelayConfig::local()).await;
    let streamer = Peer::new().await;
    let viewer = Peer::new().await;

    announce(&streamer.video, relay.addr, Role::Streamer, PortType::Video).await;
    announce(&streamer.control, relay.addr, Role::Streamer, PortType::Control).await;
    announce(&viewer.video, relay.addr, Role::Viewer, PortType::Video).await;
    announce(&viewer.control, relay.addr, Role::Viewer, PortType::Control).await;
    for sock in [&streamer.video, &streamer.control, &viewer.video, &viewer.control] {
        recv_message(sock).await;
    }

    // the viewer's video mapping moves to a new port
    let moved = socket().await;
    announce(&moved, relay.addr, Role::Viewer, PortType::Video).await;

    let (sv, sc) = streamer.ports();
    let moved_port = moved.local_addr().unwrap().port();
    let (_, vc) = viewer.ports();
    for sock in [&streamer.video, &streamer.control] {
        assert_equal!(
            peer_info(&recv_message(sock).await),
            ("127.0.0.1".to_string(), moved_port, vc)
        );
    }
    for sock in [&moved, &viewer.control] {
        assert_equal!(peer_info(&recv_message(sock).await), ("127.0.0.1".to_string(), sv, sc));
    }
    assert_silent(&viewer.video).await;

    // traffic follows the new address
    streamer.video.send_to(b"frame-3", relay.addr).await.unwrap();
    assert_equal!(recv_raw(&moved).await, b"frame-3".to_vec());
    assert_silent(&viewer.video).await;

    relay.shutdown().await;
}

#[tokio::test]
async fn test_rekeyed_pair_displaces_old_session() {
    let relay = TestRelay::start_with(RelayConfig::local(), &["abc", "def"]).await;
    let streamer = Peer::new().await;
    let viewer = Peer::new().await;
    let members = [
        (&streamer.video, Role::Streamer, PortType::Video),
        (&streamer.control, Role::Streamer, PortType::Control),
        (&viewer.video, Role::Viewer, PortType::Video),
        (&viewer.control, Role::Viewer, PortType::Control),
    ];

    for (sock, role, port_type) in members {
        announce_session(sock, relay.addr, "abc", role, port_type).await;
    }
    for (sock, _, _) in members {
        recv_message(sock).await;
    }
    assert!(relay.registry.get_session("abc").is_some());

    // same sockets, new session id
    for (sock, role, port_type) in members {
        announce_session(sock, relay.addr, "def", role, port_type).await;
    }
    for (sock, _, _) in members {
        recv_message(sock).await;
    }

    assert!(relay.registry.get_session("abc").is_none());
    assert!(relay.registry.get_session("def").is_some());
    assert_equal!(relay.registry.len(), 1);

    streamer.control.send_to(b"cmd", relay.addr).await.unwrap();
    assert_equal!(recv_raw(&viewer.control).await, b"cmd".to_vec());

    relay.shutdown().await;
}
