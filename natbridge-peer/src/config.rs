use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use natbridge_proto::Role;

pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_DIRECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RECV_BUFFER: usize = 2048;

/// Floor for timer intervals; a zero interval would spin.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Application datagrams buffered per socket before new ones are dropped.
pub const INCOMING_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub relay: SocketAddr,
    pub session_id: String,
    pub role: Role,
    pub bind_ip: IpAddr,
    /// Local video port; 0 picks an ephemeral one.
    pub video_port: u16,
    pub control_port: u16,
    pub announce_interval: Duration,
    /// Give up announcing after this long. Announces forever when `None`.
    pub announce_timeout: Option<Duration>,
    pub probe_interval: Duration,
    /// Without a probe arriving straight from the counterpart within this
    /// window the path is considered relayed.
    pub direct_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub recv_buffer: usize,
    pub incoming_capacity: usize,
}

impl PeerConfig {
    pub fn new(relay: SocketAddr, session_id: impl Into<String>, role: Role) -> Self {
        Self {
            relay,
            session_id: session_id.into(),
            role,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            video_port: 0,
            control_port: 0,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            announce_timeout: None,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            direct_timeout: DEFAULT_DIRECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            recv_buffer: DEFAULT_RECV_BUFFER,
            incoming_capacity: INCOMING_BUFFER_SIZE,
        }
    }
}
