use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use natbridge_proto::{decode, peek_type, Body, Message, MessageType, PortType, Role};
use natbridge_store::SessionStore;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::config::{PeerInfoMode, RelayConfig, MIN_INTERVAL};
use crate::registry::{PeerRegistry, Registration, RegistrationError};
use crate::relay::RouteTable;
use crate::session::Session;

/// Error text sent back for announcements naming an unknown session.
pub const UNKNOWN_SESSION_ERROR: &str = "403";

pub struct RelayServer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: RelayConfig,
    registry: Arc<PeerRegistry>,
    routes: Arc<RouteTable>,
}

impl RelayServer {
    pub async fn bind(config: RelayConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind)
            .await
            .with_context(|| format!("binding relay socket on {}", config.bind))?;
        let local_addr = socket.local_addr()?;

        if config.public_ip.is_none() && local_addr.ip().is_unspecified() {
            log::warn!(
                "no public ip configured; PeerInfo replies pointing at the relay will advertise {}",
                local_addr.ip()
            );
        }

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            config,
            registry: Arc::new(PeerRegistry::new(store)),
            routes: Arc::new(RouteTable::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        Arc::clone(&self.routes)
    }

    /// Receives datagrams until `shutdown` flips to `true`. The sweep task
    /// and the control listener run alongside and stop with it.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        log::info!("natbridge-relay listening on {}", self.local_addr);

        let sweeper = tokio::spawn(sweep_loop(
            self.registry(),
            self.routes(),
            self.config.sweep_interval,
            self.config.idle_timeout,
            shutdown.clone(),
        ));

        let control = self.spawn_control(shutdown.clone());

        let mut buf = vec![0u8; self.config.recv_buffer];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, src)) => self.handle_datagram(&buf[..len], src).await,
                    Err(err) => log::error!("recv_from failed: {}", err),
                }
            }
        }

        log::info!("natbridge-relay shutting down");
        let _ = sweeper.await;
        if let Some(control) = control {
            let _ = control.await;
        }
        Ok(())
    }

    #[cfg(unix)]
    fn spawn_control(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let path = self.config.control_socket.clone()?;
        let registry = self.registry();
        let routes = self.routes();
        Some(tokio::spawn(async move {
            if let Err(err) = crate::control::serve(path, registry, routes, shutdown).await {
                log::error!("control socket failed: {:#}", err);
            }
        }))
    }

    #[cfg(not(unix))]
    fn spawn_control(&self, _shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if self.config.control_socket.is_some() {
            log::warn!("control socket is only supported on unix");
        }
        None
    }

    async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        match peek_type(data) {
            Ok(tag) if tag == MessageType::PeerAnnouncement.as_str() => {
                self.handle_announcement(data, src).await
            }
            _ => self.forward(data, src).await,
        }
    }

    async fn handle_announcement(&self, data: &[u8], src: SocketAddr) {
        let message = match decode(data) {
            Ok(message) => message,
            Err(err) => {
                log::debug!("dropping malformed announcement from {}: {}", src, err);
                return;
            }
        };
        let Body::PeerAnnouncement {
            role,
            session_id,
            port_type,
        } = message.body
        else {
            return;
        };
        let (Some(role), Some(port_type)) = (Role::parse(&role), PortType::parse(&port_type)) else {
            log::debug!(
                "invalid announcement from {}: role={} port_type={}",
                src,
                role,
                port_type
            );
            return;
        };

        let registration = match self.registry.register_peer(&session_id, role, port_type, src) {
            Ok(registration) => registration,
            Err(RegistrationError::SessionNotFound(_)) => {
                log::info!("Ignoring announcement for unknown session '{}' from {}", session_id, src);
                if self.config.reply_unknown_session {
                    self.send(&Message::error(UNKNOWN_SESSION_ERROR), src).await;
                }
                return;
            }
        };

        if registration.is_new_peer {
            log::info!("{}: Registered {}:{} from {}", session_id, role, port_type, src);
        } else if registration.address_changed {
            log::info!("{}: {}:{} moved to {}", session_id, role, port_type, src);
        }

        if !registration.session_ready {
            if role == Role::Spectator {
                log::info!("{}: Spectator {} waiting for session to be ready", session_id, src);
            }
            return;
        }

        let Some(session) = self.registry.get_session(&session_id) else {
            return;
        };
        self.announce_ready(&session, role, registration, src).await;
    }

    async fn announce_ready(
        &self,
        session: &Session,
        role: Role,
        registration: Registration,
        src: SocketAddr,
    ) {
        if role == Role::Spectator {
            self.install_routes(&session.id);
            self.send(&self.relay_peer_info(), src).await;
            log::info!("{}: Spectator {} joined ready session", session.id, src);
            return;
        }

        if !(registration.is_new_peer || registration.address_changed) {
            if let Some(info) = self.peer_info_for(session, role) {
                self.send(&info, src).await;
            }
            return;
        }

        self.install_routes(&session.id);
        for role in Role::PEERS {
            let Some(info) = self.peer_info_for(session, role) else {
                continue;
            };
            for port_type in PortType::ALL {
                if let Some(peer) = session.peer(role, port_type) {
                    self.send(&info, peer.addr).await;
                }
            }
        }
        log::info!("{}: Session ready, peer info exchanged", session.id);
    }

    fn install_routes(&self, session_id: &str) {
        let displaced = self
            .registry
            .with_session(session_id, |session| self.routes.install_session(session, Instant::now()));
        match displaced {
            None => log::debug!("{}: expired before its routes were installed", session_id),
            Some(displaced) if !displaced.is_empty() => self.registry.remove_displaced_sessions(&displaced),
            Some(_) => {}
        }
    }

    /// `PeerInfo` for a member of `role` in a ready session.
    fn peer_info_for(&self, session: &Session, role: Role) -> Option<Message> {
        match (self.config.peer_info_mode, role.counterpart()) {
            (PeerInfoMode::Direct, Some(counterpart)) => {
                let video = session.peer(counterpart, PortType::Video)?;
                let control = session.peer(counterpart, PortType::Control)?;
                Some(Message::peer_info(
                    video.addr.ip().to_string(),
                    video.addr.port(),
                    control.addr.port(),
                ))
            }
            _ => Some(self.relay_peer_info()),
        }
    }

    fn relay_peer_info(&self) -> Message {
        Message::peer_info(
            self.advertised_ip().to_string(),
            self.local_addr.port(),
            self.local_addr.port(),
        )
    }

    fn advertised_ip(&self) -> IpAddr {
        self.config.public_ip.unwrap_or(self.local_addr.ip())
    }

    async fn forward(&self, data: &[u8], src: SocketAddr) {
        let Some(targets) = self.routes.targets_for(src, Instant::now()) else {
            log::trace!("dropping unrouted datagram ({} bytes) from {}", data.len(), src);
            return;
        };
        for target in targets {
            if let Err(err) = self.socket.send_to(data, target).await {
                log::warn!("forwarding {} -> {} failed: {}", src, target, err);
            }
        }
    }

    async fn send(&self, message: &Message, dest: SocketAddr) {
        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                log::error!("{}", err);
                return;
            }
        };
        if let Err(err) = self.socket.send_to(&bytes, dest).await {
            log::error!("sending {} to {} failed: {}", message.message_type().as_str(), dest, err);
        }
    }
}

/// Sessions whose latest activity (announcement or forwarded datagram) is
/// older than `timeout`.
pub fn collect_expired(
    announcements: &[(String, Instant)],
    route_activity: &HashMap<String, Instant>,
    now: Instant,
    timeout: Duration,
) -> HashSet<String> {
    announcements
        .iter()
        .filter(|(id, announced)| {
            let active = route_activity
                .get(id)
                .map_or(*announced, |forwarded| (*forwarded).max(*announced));
            now.saturating_duration_since(active) > timeout
        })
        .map(|(id, _)| id.clone())
        .collect()
}

/// One sweep pass. Returns the ids that were removed.
pub fn sweep(
    registry: &PeerRegistry,
    routes: &RouteTable,
    now: Instant,
    timeout: Duration,
) -> HashSet<String> {
    let Some(cutoff) = now.checked_sub(timeout) else {
        return HashSet::new();
    };
    let candidates = collect_expired(
        &registry.last_announcements(),
        &routes.last_activity(),
        now,
        timeout,
    );
    if candidates.is_empty() {
        return candidates;
    }
    let expired = registry.remove_sessions_idle_since(&candidates, cutoff);
    routes.remove_sessions(&expired);
    expired
}

async fn sweep_loop(
    registry: Arc<PeerRegistry>,
    routes: Arc<RouteTable>,
    every: Duration,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every.max(MIN_INTERVAL));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep(&registry, &routes, Instant::now(), timeout);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
