use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use natbridge_proto::{decode, Body, Message, PortType};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use crate::config::{PeerConfig, MIN_INTERVAL};
use crate::probe::{ProbeConfig, ProbeHandle};

/// Where the relay told us to send traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub ip: IpAddr,
    pub video_port: u16,
    pub control_port: u16,
}

impl PeerInfo {
    fn from_body(body: &Body) -> Option<Result<Self>> {
        let Body::PeerInfo {
            ip,
            video_port,
            control_port,
        } = body
        else {
            return None;
        };
        Some(
            ip.parse()
                .map(|ip| PeerInfo {
                    ip,
                    video_port: *video_port,
                    control_port: *control_port,
                })
                .map_err(|_| anyhow!("PeerInfo carries an invalid ip {:?}", ip)),
        )
    }

    pub fn addr(&self, port_type: PortType) -> SocketAddr {
        match port_type {
            PortType::Video => SocketAddr::new(self.ip, self.video_port),
            PortType::Control => SocketAddr::new(self.ip, self.control_port),
        }
    }
}

/// Bound sockets plus what the relay answered on each of them.
pub struct Rendezvous {
    pub relay: SocketAddr,
    pub sockets: HashMap<PortType, Arc<UdpSocket>>,
    pub peer_info: HashMap<PortType, PeerInfo>,
}

impl Rendezvous {
    /// The answer received on the video socket.
    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.peer_info.get(&PortType::Video).copied()
    }

    /// Starts probing the counterpart from every socket.
    pub fn probe(&self, config: &PeerConfig) -> HashMap<PortType, ProbeHandle> {
        let probe_config = ProbeConfig::from(config);
        self.sockets
            .iter()
            .filter_map(|(port_type, socket)| {
                let info = self.peer_info.get(port_type)?;
                let handle = ProbeHandle::spawn(
                    *port_type,
                    Arc::clone(socket),
                    info.addr(*port_type),
                    self.relay,
                    probe_config.clone(),
                );
                Some((*port_type, handle))
            })
            .collect()
    }
}

pub struct PunchPeer {
    config: PeerConfig,
}

impl PunchPeer {
    pub fn new(config: PeerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Binds one socket per port class.
    pub async fn bind(&self) -> Result<HashMap<PortType, Arc<UdpSocket>>> {
        let mut sockets = HashMap::new();
        for (port_type, port) in [
            (PortType::Video, self.config.video_port),
            (PortType::Control, self.config.control_port),
        ] {
            let addr = SocketAddr::new(self.config.bind_ip, port);
            let socket = UdpSocket::bind(addr)
                .await
                .with_context(|| format!("binding {} socket on {}", port_type, addr))?;
            log::info!("Bound {} socket to {}", port_type, socket.local_addr()?);
            sockets.insert(port_type, Arc::new(socket));
        }
        Ok(sockets)
    }

    /// Announces `port_type` on `socket` until the relay answers with
    /// `PeerInfo`.
    pub async fn announce(&self, socket: &UdpSocket, port_type: PortType) -> Result<PeerInfo> {
        let announcement = Message::announcement(self.config.role, &self.config.session_id, port_type)
            .to_bytes()?;
        // an unrepresentable deadline means announcing without limit
        let deadline = self
            .config
            .announce_timeout
            .and_then(|t| Instant::now().checked_add(t));
        let round = self.config.announce_interval.max(MIN_INTERVAL);
        let mut buf = vec![0u8; self.config.recv_buffer];

        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                bail!(
                    "no PeerInfo from {} for {} socket of session {}",
                    self.config.relay,
                    port_type,
                    self.config.session_id
                );
            }

            if let Err(err) = socket.send_to(&announcement, self.config.relay).await {
                log::warn!("announcing {} to {} failed: {}", port_type, self.config.relay, err);
            } else {
                log::debug!("Sent PeerAnnouncement for {} to {}", port_type, self.config.relay);
            }

            let round_end = Instant::now().checked_add(round);
            loop {
                let received = match round_end {
                    Some(end) => timeout_at(end, socket.recv_from(&mut buf)).await,
                    None => Ok(socket.recv_from(&mut buf).await),
                };
                let (len, src) = match received {
                    Err(_) => break,
                    Ok(Err(err)) => {
                        log::debug!("{} socket receive failed: {}", port_type, err);
                        continue;
                    }
                    Ok(Ok(received)) => received,
                };
                if let Some(info) = self.handle_reply(&buf[..len], src, port_type) {
                    return Ok(info);
                }
            }
        }
    }

    fn handle_reply(&self, data: &[u8], src: SocketAddr, port_type: PortType) -> Option<PeerInfo> {
        // a relay bound to a wildcard address may answer from another of
        // its host's addresses, so only the port has to match
        if src.port() != self.config.relay.port() {
            log::trace!("ignoring datagram from {} while announcing {}", src, port_type);
            return None;
        }
        if src.ip() != self.config.relay.ip() {
            log::debug!("relay {} answered from {}", self.config.relay, src);
        }
        let message = match decode(data) {
            Ok(message) => message,
            Err(err) => {
                log::debug!("unreadable reply from relay: {}", err);
                return None;
            }
        };
        if let Body::Error { error } = &message.body {
            log::warn!(
                "relay rejected {} announcement for session {}: {}",
                port_type,
                self.config.session_id,
                error
            );
            return None;
        }
        match PeerInfo::from_body(&message.body)? {
            Ok(info) => {
                log::info!("Got peer info on {} socket: {:?}", port_type, info);
                Some(info)
            }
            Err(err) => {
                log::warn!("{:#}", err);
                None
            }
        }
    }

    /// Announces every socket concurrently.
    pub async fn register_all(
        &self,
        sockets: &HashMap<PortType, Arc<UdpSocket>>,
    ) -> Result<HashMap<PortType, PeerInfo>> {
        let socket = |port_type: PortType| {
            sockets
                .get(&port_type)
                .ok_or_else(|| anyhow!("no {} socket bound", port_type))
        };
        let video = socket(PortType::Video)?;
        let control = socket(PortType::Control)?;

        let (video_info, control_info) = tokio::try_join!(
            self.announce(video, PortType::Video),
            self.announce(control, PortType::Control),
        )?;
        Ok(HashMap::from([
            (PortType::Video, video_info),
            (PortType::Control, control_info),
        ]))
    }

    /// Bind, announce, and wait until the relay answered on every socket.
    pub async fn setup(&self) -> Result<Rendezvous> {
        let sockets = self.bind().await?;
        let peer_info = self.register_all(&sockets).await?;
        Ok(Rendezvous {
            relay: self.config.relay,
            sockets,
            peer_info,
        })
    }
}
