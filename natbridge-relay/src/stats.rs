use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::PeerRegistry;
use crate::relay::RouteTable;

/// Snapshot returned by the `stats` control command.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub sessions: usize,
    pub ready_sessions: usize,
    pub peers: usize,
    pub spectators: usize,
    pub routes: usize,
    pub session_details: Vec<SessionStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub id: String,
    pub ready: bool,
    pub peers: usize,
    pub spectators: usize,
    pub routes: usize,
    pub addresses: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Seconds since the last announcement for this session.
    pub idle_secs: u64,
}

pub fn snapshot(registry: &PeerRegistry, routes: &RouteTable) -> RelayStats {
    let now = Instant::now();
    let route_counts = routes.route_counts();

    let mut session_details: Vec<SessionStats> = registry
        .sessions()
        .into_iter()
        .map(|session| {
            let mut addresses: Vec<String> =
                session.addresses.iter().map(|a| a.to_string()).collect();
            addresses.sort();
            SessionStats {
                ready: session.is_ready(),
                peers: session.peer_count(),
                spectators: session.spectators.len(),
                routes: route_counts.get(&session.id).copied().unwrap_or_default(),
                addresses,
                created_at: session.created_at,
                idle_secs: now
                    .saturating_duration_since(session.last_announcement_at)
                    .as_secs(),
                id: session.id,
            }
        })
        .collect();
    session_details.sort_by(|a, b| a.id.cmp(&b.id));

    RelayStats {
        sessions: session_details.len(),
        ready_sessions: session_details.iter().filter(|s| s.ready).count(),
        peers: session_details.iter().map(|s| s.peers).sum(),
        spectators: session_details.iter().map(|s| s.spectators).sum(),
        routes: routes.len(),
        session_details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use natbridge_proto::{PortType, Role};
    use natbridge_store::MemorySessionStore;
    use std::sync::Arc;

    #[test]
    fn counts_sessions_peers_and_routes() {
        let registry = PeerRegistry::new(Arc::new(MemorySessionStore::with_ids(["abc", "def"])));
        let routes = RouteTable::new();

        for (role, port_type, addr) in [
            (Role::Streamer, PortType::Video, "10.0.0.1:5000"),
            (Role::Streamer, PortType::Control, "10.0.0.1:5001"),
            (Role::Viewer, PortType::Video, "10.0.0.2:6000"),
            (Role::Viewer, PortType::Control, "10.0.0.2:6001"),
            (Role::Spectator, PortType::Video, "10.0.0.3:7000"),
        ] {
            registry
                .register_peer("abc", role, port_type, addr.parse().unwrap())
                .unwrap();
        }
        registry
            .register_peer("def", Role::Viewer, PortType::Video, "10.0.1.2:6000".parse().unwrap())
            .unwrap();
        let session = registry.get_session("abc").unwrap();
        routes.install_session(&session, Instant::now());

        let stats = snapshot(&registry, &routes);
        assert_eq!(stats.sessions, 2);
        assert_eq!(stats.ready_sessions, 1);
        assert_eq!(stats.peers, 5);
        assert_eq!(stats.spectators, 1);
        assert_eq!(stats.routes, 4);
        assert_eq!(stats.session_details[0].id, "abc");
        assert_eq!(stats.session_details[0].addresses.len(), 5);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["ready_sessions"], 1);
    }
}
