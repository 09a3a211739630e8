use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use natbridge_relay::config::{
    DEFAULT_CONTROL_SOCKET, DEFAULT_IDLE_TIMEOUT, DEFAULT_PORT, DEFAULT_RECV_BUFFER,
    DEFAULT_SWEEP_INTERVAL,
};
use natbridge_relay::{PeerInfoMode, RelayConfig, RelayServer};
use natbridge_store::SqliteSessionStore;
use tokio::sync::watch;

#[derive(Debug, Parser)]
#[command(about = "UDP rendezvous and relay for NAT hole punching")]
struct Opts {
    /// IP address to bind to
    #[arg(env = "NATBRIDGE_RELAY_BIND", default_value = "0.0.0.0")]
    ip: IpAddr,

    /// UDP port to bind to
    #[arg(long, env = "NATBRIDGE_RELAY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Public IP advertised to peers when they are told to use the relay
    #[arg(long, env = "NATBRIDGE_RELAY_PUBLIC_IP")]
    public_ip: Option<IpAddr>,

    /// Path to the session store
    #[arg(long = "db", env = "NATBRIDGE_RELAY_DB", default_value = "relay.db")]
    db_path: PathBuf,

    /// Control socket path; pass an empty string to disable
    #[arg(long, env = "NATBRIDGE_RELAY_CONTROL_SOCKET", default_value = DEFAULT_CONTROL_SOCKET)]
    control_socket: String,

    /// Seconds without announcements or traffic before a session is removed
    #[arg(long, env = "NATBRIDGE_RELAY_IDLE_TIMEOUT", default_value_t = DEFAULT_IDLE_TIMEOUT.as_secs())]
    idle_timeout: u64,

    /// Milliseconds between expiry sweeps
    #[arg(long, env = "NATBRIDGE_RELAY_SWEEP_INTERVAL_MS", default_value_t = DEFAULT_SWEEP_INTERVAL.as_millis() as u64)]
    sweep_interval_ms: u64,

    #[arg(long, env = "NATBRIDGE_RELAY_RECV_BUFFER", default_value_t = DEFAULT_RECV_BUFFER)]
    recv_buffer: usize,

    /// What PeerInfo replies advertise to streamer and viewer
    #[arg(long, value_enum, env = "NATBRIDGE_RELAY_PEER_INFO", default_value = "direct")]
    peer_info: PeerInfoMode,

    /// Reply to announcements for unknown sessions with an error
    #[arg(long, env = "NATBRIDGE_RELAY_REPLY_UNKNOWN")]
    reply_unknown_session: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "NATBRIDGE_RELAY_LOG", default_value = "error")]
    log: String,
}

impl Opts {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            bind: SocketAddr::new(self.ip, self.port),
            public_ip: self.public_ip,
            idle_timeout: Duration::from_secs(self.idle_timeout),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            recv_buffer: self.recv_buffer,
            control_socket: (!self.control_socket.is_empty())
                .then(|| PathBuf::from(&self.control_socket)),
            peer_info_mode: self.peer_info,
            reply_unknown_session: self.reply_unknown_session,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&opts.log)).init();

    let store = Arc::new(SqliteSessionStore::open(&opts.db_path)?);
    let server = RelayServer::bind(opts.relay_config(), store).await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        log::info!("Shutting down natbridge-relay...");
        let _ = stop_tx.send(true);
    });

    server.run(stop_rx).await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            log::warn!("cannot listen for SIGTERM: {}", err);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
