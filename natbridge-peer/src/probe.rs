//! Hole punching on one socket.
//!
//! The send loop keeps hitting the counterpart with `Syn` until a handshake
//! message arrives straight from it, then switches to `Heartbeat` so the NAT
//! mapping stays open. The receive loop answers the handshake and hands all
//! other datagrams to the application. Anything arriving from the relay
//! address never counts as a direct path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use natbridge_proto::{peek_type, Body, Message, MessageType, PortType};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::config::{PeerConfig, MIN_INTERVAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    /// Probing the counterpart, no direct traffic seen yet.
    Probing,
    /// Handshake traffic arrived straight from the counterpart.
    Direct,
    /// The direct timeout passed without direct traffic; the relay carries
    /// the data while probing continues.
    Relayed,
}

/// A datagram for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub from: SocketAddr,
}

#[derive(Debug, Clone)]
pub(crate) struct ProbeConfig {
    probe_interval: Duration,
    direct_timeout: Duration,
    heartbeat_interval: Duration,
    recv_buffer: usize,
    incoming_capacity: usize,
}

impl ProbeConfig {
    #[cfg(test)]
    pub(crate) fn probe_interval(&self) -> Duration {
        self.probe_interval
    }
}

impl From<&PeerConfig> for ProbeConfig {
    fn from(config: &PeerConfig) -> Self {
        Self {
            probe_interval: config.probe_interval.max(MIN_INTERVAL),
            direct_timeout: config.direct_timeout,
            heartbeat_interval: config.heartbeat_interval,
            recv_buffer: config.recv_buffer,
            incoming_capacity: config.incoming_capacity.max(1),
        }
    }
}

struct Shared {
    port_type: PortType,
    relay: SocketAddr,
    state: watch::Sender<PathState>,
    /// Counterpart address. Only a source on the same host may replace it,
    /// and only before the path is direct.
    target: Mutex<SocketAddr>,
}

impl Shared {
    fn state(&self) -> PathState {
        *self.state.borrow()
    }

    /// Counts a handshake from `src` towards the direct path. While probing
    /// the counterpart may show up on another port of the same host; once
    /// direct the target is fixed.
    fn mark_direct(&self, src: SocketAddr) {
        if src == self.relay {
            return;
        }
        {
            let mut target = self.target.lock();
            if *target != src {
                if self.state() == PathState::Direct || target.ip() != src.ip() {
                    log::debug!("{}: ignoring handshake from {}, counterpart is {}", self.port_type, src, *target);
                    return;
                }
                log::debug!("{}: counterpart answered from {} instead of {}", self.port_type, src, *target);
                *target = src;
            }
        }
        if self.state() != PathState::Direct {
            log::info!("{}: direct path to {} established", self.port_type, src);
            self.state.send_replace(PathState::Direct);
        }
    }

    fn fall_back(&self) {
        if self.state() == PathState::Probing {
            log::info!("{}: no direct path, relaying through {}", self.port_type, self.relay);
            self.state.send_replace(PathState::Relayed);
        }
    }
}

/// Running probe on one socket. Dropping it stops probing.
pub struct ProbeHandle {
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    state: watch::Receiver<PathState>,
    incoming: mpsc::Receiver<Datagram>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProbeHandle {
    pub(crate) fn spawn(
        port_type: PortType,
        socket: Arc<UdpSocket>,
        counterpart: SocketAddr,
        relay: SocketAddr,
        config: ProbeConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(PathState::Probing);
        let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_capacity);
        let shared = Arc::new(Shared {
            port_type,
            relay,
            state: state_tx,
            target: Mutex::new(counterpart),
        });

        log::info!("{}: probing {} from {:?}", port_type, counterpart, socket.local_addr().ok());
        let tasks = vec![
            tokio::spawn(send_loop(Arc::clone(&socket), Arc::clone(&shared), counterpart, config.clone())),
            tokio::spawn(recv_loop(Arc::clone(&socket), Arc::clone(&shared), incoming_tx, config)),
        ];

        Self {
            socket,
            shared,
            state: state_rx,
            incoming: incoming_rx,
            tasks,
        }
    }

    pub fn state(&self) -> PathState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PathState> {
        self.state.clone()
    }

    /// Waits until probing settled on direct or relayed.
    pub async fn settled(&mut self) -> PathState {
        let settled = self
            .state
            .wait_for(|state| *state != PathState::Probing)
            .await
            .map(|state| *state);
        settled.unwrap_or_else(|_| self.state())
    }

    /// Where application traffic should go: the counterpart once the path
    /// is direct, the relay otherwise.
    pub fn target(&self) -> SocketAddr {
        match self.state() {
            PathState::Direct => *self.shared.target.lock(),
            PathState::Probing | PathState::Relayed => self.shared.relay,
        }
    }

    pub async fn send(&self, data: &[u8]) -> std::io::Result<usize> {
        self.socket.send_to(data, self.target()).await
    }

    /// Next application datagram. `None` once probing stopped.
    pub async fn recv(&mut self) -> Option<Datagram> {
        self.incoming.recv().await
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn stop(self) {}
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    counterpart: SocketAddr,
    config: ProbeConfig,
) {
    let syn = encode(Body::Syn);
    let heartbeat = encode(Body::Heartbeat);
    let (Some(syn), Some(heartbeat)) = (syn, heartbeat) else {
        return;
    };

    let started = Instant::now();
    let mut last_heartbeat: Option<Instant> = None;
    let mut ticker = interval(config.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if shared.state() == PathState::Probing && started.elapsed() >= config.direct_timeout {
            shared.fall_back();
        }

        let heartbeat_due = last_heartbeat.map_or(true, |at| at.elapsed() >= config.heartbeat_interval);
        let (probe, keepalive) = match shared.state() {
            PathState::Probing => (Some(counterpart), None),
            PathState::Relayed => (Some(counterpart), Some(shared.relay)),
            PathState::Direct => (None, Some(*shared.target.lock())),
        };

        if let Some(dest) = probe {
            if let Err(err) = socket.send_to(&syn, dest).await {
                log::debug!("{}: Syn to {} failed: {}", shared.port_type, dest, err);
            }
        }
        if let Some(dest) = keepalive.filter(|_| heartbeat_due) {
            if let Err(err) = socket.send_to(&heartbeat, dest).await {
                log::debug!("{}: Heartbeat to {} failed: {}", shared.port_type, dest, err);
            }
            last_heartbeat = Some(Instant::now());
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    incoming: mpsc::Sender<Datagram>,
    config: ProbeConfig,
) {
    let (Some(syn_ack), Some(ack)) = (encode(Body::SynAck), encode(Body::Ack)) else {
        return;
    };
    let mut buf = vec![0u8; config.recv_buffer];

    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                log::debug!("{}: receive failed: {}", shared.port_type, err);
                continue;
            }
        };
        let data = &buf[..len];

        let tag = peek_type(data).ok().and_then(|tag| MessageType::from_tag(&tag));
        match tag {
            Some(MessageType::Syn) => {
                reply(&socket, &shared, &syn_ack, src).await;
                shared.mark_direct(src);
            }
            Some(MessageType::SynAck) => {
                reply(&socket, &shared, &ack, src).await;
                shared.mark_direct(src);
            }
            Some(MessageType::Ack) => shared.mark_direct(src),
            Some(MessageType::Heartbeat) => {}
            Some(MessageType::PeerInfo) => {
                log::trace!("{}: late PeerInfo from {}", shared.port_type, src);
            }
            _ => {
                let datagram = Datagram {
                    data: data.to_vec(),
                    from: src,
                };
                if incoming.try_send(datagram).is_err() {
                    if incoming.is_closed() {
                        return;
                    }
                    log::trace!("{}: application not keeping up, dropped datagram", shared.port_type);
                }
            }
        }
    }
}

async fn reply(socket: &UdpSocket, shared: &Shared, bytes: &[u8], dest: SocketAddr) {
    if let Err(err) = socket.send_to(bytes, dest).await {
        log::debug!("{}: handshake reply to {} failed: {}", shared.port_type, dest, err);
    }
}

fn encode(body: Body) -> Option<Vec<u8>> {
    match Message::new(body).to_bytes() {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            log::error!("{}", err);
            None
        }
    }
}
