use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use natbridge_peer::{PathState, PeerConfig, PunchPeer};
use natbridge_proto::{PortType, Role};

#[derive(Debug, Parser)]
#[command(about = "Register with a natbridge relay and punch a path to the counterpart")]
struct Opts {
    /// Relay host name or IP
    relay: String,

    /// Session id issued by the relay operator
    session_id: String,

    #[arg(long, default_value_t = 8888)]
    port: u16,

    /// streamer, viewer or spectator
    #[arg(long, default_value = "viewer", value_parser = parse_role)]
    role: Role,

    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    #[arg(long, default_value_t = 0)]
    port_video: u16,

    #[arg(long, default_value_t = 0)]
    port_control: u16,

    /// Stop announcing after this many seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Keep probing after registration and log path changes
    #[arg(long)]
    probe: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log: String,
}

fn parse_role(s: &str) -> Result<Role, String> {
    Role::parse(s).ok_or_else(|| format!("unknown role '{s}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&opts.log)).init();

    let relay = tokio::net::lookup_host((opts.relay.as_str(), opts.port))
        .await
        .with_context(|| format!("resolving {}", opts.relay))?
        .find(|addr| addr.is_ipv4() == opts.bind.is_ipv4())
        .ok_or_else(|| anyhow!("{} has no usable address", opts.relay))?;

    let mut config = PeerConfig::new(relay, opts.session_id.clone(), opts.role);
    config.bind_ip = opts.bind;
    config.video_port = opts.port_video;
    config.control_port = opts.port_control;
    config.announce_timeout = opts.timeout.map(Duration::from_secs);

    let peer = PunchPeer::new(config);
    let rendezvous = peer.setup().await?;
    let info = rendezvous
        .peer_info()
        .ok_or_else(|| anyhow!("no PeerInfo for the video socket"))?;
    println!("{}", serde_json::to_string_pretty(&info)?);

    if !opts.probe {
        return Ok(());
    }

    let probes = rendezvous.probe(peer.config());
    for (port_type, probe) in &probes {
        let mut state = probe.watch_state();
        let port_type: PortType = *port_type;
        tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let current: PathState = *state.borrow_and_update();
                log::info!("{} path is now {:?}", port_type, current);
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    log::info!("stopping probes");
    drop(probes);
    Ok(())
}
