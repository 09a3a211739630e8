//! Per-session bookkeeping: which address announced which role and port.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use chrono::{DateTime, Utc};
use natbridge_proto::{PortType, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

impl PeerEntry {
    pub fn new(addr: SocketAddr, now: Instant) -> Self {
        Self {
            addr,
            last_seen: now,
        }
    }
}

/// The sockets of one spectator, grouped by the host they announce from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpectatorEntry {
    pub ip: IpAddr,
    pub ports: HashMap<PortType, PeerEntry>,
}

impl SpectatorEntry {
    fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            ports: HashMap::new(),
        }
    }

    /// Every port class has been announced.
    pub fn is_complete(&self) -> bool {
        PortType::ALL.iter().all(|pt| self.ports.contains_key(pt))
    }

    pub fn addresses(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.ports.values().map(|peer| peer.addr)
    }
}

/// Outcome of recording one announcement on a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announced {
    /// The role/port slot was empty before.
    pub is_new_peer: bool,
    /// The slot was filled with a different address before.
    pub address_changed: bool,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    /// Streamer and viewer sockets. Spectators live in `spectators`.
    pub roles: HashMap<Role, HashMap<PortType, PeerEntry>>,
    pub spectators: Vec<SpectatorEntry>,
    /// Every address that announced for this session.
    pub addresses: HashSet<SocketAddr>,
    pub created_at: DateTime<Utc>,
    pub last_announcement_at: Instant,
}

impl Session {
    pub fn new(id: impl Into<String>, now: Instant) -> Self {
        Self {
            id: id.into(),
            roles: Role::PEERS
                .into_iter()
                .map(|role| (role, HashMap::new()))
                .collect(),
            spectators: Vec::new(),
            addresses: HashSet::new(),
            created_at: Utc::now(),
            last_announcement_at: now,
        }
    }

    pub fn register(
        &mut self,
        role: Role,
        port_type: PortType,
        addr: SocketAddr,
        now: Instant,
    ) -> Announced {
        let previous = match role {
            Role::Spectator => {
                let idx = match self.spectators.iter().position(|s| s.ip == addr.ip()) {
                    Some(idx) => idx,
                    None => {
                        self.spectators.push(SpectatorEntry::new(addr.ip()));
                        self.spectators.len() - 1
                    }
                };
                self.spectators[idx]
                    .ports
                    .insert(port_type, PeerEntry::new(addr, now))
            }
            role => self
                .roles
                .entry(role)
                .or_default()
                .insert(port_type, PeerEntry::new(addr, now)),
        };

        self.addresses.insert(addr);
        self.last_announcement_at = now;

        Announced {
            is_new_peer: previous.is_none(),
            address_changed: previous.is_some_and(|prev| prev.addr != addr),
        }
    }

    pub fn is_role_ready(&self, role: Role) -> bool {
        self.roles
            .get(&role)
            .is_some_and(|ports| PortType::ALL.iter().all(|pt| ports.contains_key(pt)))
    }

    /// Both streamer and viewer have announced every port class.
    pub fn is_ready(&self) -> bool {
        Role::PEERS.into_iter().all(|role| self.is_role_ready(role))
    }

    pub fn peer(&self, role: Role, port_type: PortType) -> Option<&PeerEntry> {
        self.roles.get(&role)?.get(&port_type)
    }

    pub fn complete_spectators(&self) -> impl Iterator<Item = &SpectatorEntry> {
        self.spectators.iter().filter(|s| s.is_complete())
    }

    pub fn peer_count(&self) -> usize {
        self.roles.values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn readiness_requires_both_ports_of_both_roles() {
        let now = Instant::now();
        let mut session = Session::new("abc", now);

        session.register(Role::Streamer, PortType::Video, addr("10.0.0.1:5000"), now);
        session.register(Role::Streamer, PortType::Control, addr("10.0.0.1:5001"), now);
        assert!(session.is_role_ready(Role::Streamer));
        assert!(!session.is_ready());

        session.register(Role::Viewer, PortType::Video, addr("10.0.0.2:6000"), now);
        assert!(!session.is_ready());
        session.register(Role::Viewer, PortType::Control, addr("10.0.0.2:6001"), now);
        assert!(session.is_ready());
    }

    #[test]
    fn reannouncement_is_not_new() {
        let now = Instant::now();
        let mut session = Session::new("abc", now);

        let first = session.register(Role::Viewer, PortType::Video, addr("10.0.0.2:6000"), now);
        assert!(first.is_new_peer);
        assert!(!first.address_changed);

        let same = session.register(Role::Viewer, PortType::Video, addr("10.0.0.2:6000"), now);
        assert!(!same.is_new_peer);
        assert!(!same.address_changed);

        let moved = session.register(Role::Viewer, PortType::Video, addr("10.0.0.2:7000"), now);
        assert!(!moved.is_new_peer);
        assert!(moved.address_changed);
        assert_eq!(
            session.peer(Role::Viewer, PortType::Video).unwrap().addr,
            addr("10.0.0.2:7000")
        );
    }

    #[test]
    fn spectators_are_grouped_by_host() {
        let now = Instant::now();
        let mut session = Session::new("abc", now);

        session.register(Role::Spectator, PortType::Video, addr("10.0.0.3:7000"), now);
        session.register(Role::Spectator, PortType::Control, addr("10.0.0.3:7001"), now);
        assert_eq!(session.spectators.len(), 1);
        assert!(session.spectators[0].is_complete());

        session.register(Role::Spectator, PortType::Video, addr("10.0.0.4:7000"), now);
        assert_eq!(session.spectators.len(), 2);
        assert!(!session.spectators[1].is_complete());
        assert_eq!(session.complete_spectators().count(), 1);

        // spectators never make a session ready
        assert!(!session.is_ready());
        assert_eq!(session.peer_count(), 0);
    }
}
