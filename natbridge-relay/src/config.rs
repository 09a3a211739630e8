use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default UDP port the relay listens on.
pub const DEFAULT_PORT: u16 = 8888;

/// Sessions without announcements or forwarded traffic for this long are swept.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(450);

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Datagrams larger than this are truncated by the kernel.
pub const DEFAULT_RECV_BUFFER: usize = 2048;

/// Floor for timer intervals; a zero interval would spin.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub const DEFAULT_CONTROL_SOCKET: &str = "/tmp/natbridge_relay.sock";

/// What a `PeerInfo` reply tells a streamer or viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PeerInfoMode {
    /// The counterpart's public address, so peers can punch through directly.
    #[default]
    Direct,
    /// The relay's own address for both ports; all traffic goes through the relay.
    Relay,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    /// Address advertised in `PeerInfo` replies pointing at the relay.
    /// Falls back to the bound address when unset.
    pub public_ip: Option<IpAddr>,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub recv_buffer: usize,
    /// Unix socket answering `stats`. Disabled when `None`.
    pub control_socket: Option<PathBuf>,
    pub peer_info_mode: PeerInfoMode,
    /// Answer announcements for unknown sessions with `Error("403")`
    /// instead of dropping them.
    pub reply_unknown_session: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            public_ip: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            recv_buffer: DEFAULT_RECV_BUFFER,
            control_socket: Some(PathBuf::from(DEFAULT_CONTROL_SOCKET)),
            peer_info_mode: PeerInfoMode::Direct,
            reply_unknown_session: false,
        }
    }
}

impl RelayConfig {
    /// Loopback config with an ephemeral port and no control socket.
    pub fn local() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            control_socket: None,
            ..Self::default()
        }
    }
}
