//! Forwarding table for ready sessions.
//!
//! Routes are keyed by source address so the hot path is a single map
//! lookup. The table has its own lock, separate from the registry.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use natbridge_proto::{PortType, Role};
use parking_lot::Mutex;

use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub session_id: String,
    pub targets: Vec<SocketAddr>,
    pub last_active: Instant,
}

#[derive(Default)]
pub struct RouteTable {
    routes: Mutex<HashMap<SocketAddr, Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every route of `session` with routes built from its current
    /// members, per port class:
    /// streamer -> viewer + complete spectators, viewer -> streamer,
    /// spectator -> streamer.
    ///
    /// Returns the ids of other sessions that were routing any of these
    /// addresses; their routes are dropped as well.
    pub fn install_session(&self, session: &Session, now: Instant) -> HashSet<String> {
        let fresh = build_routes(session, now);

        let mut routes = self.routes.lock();
        let displaced: HashSet<String> = session
            .addresses
            .iter()
            .chain(fresh.keys())
            .filter_map(|addr| routes.get(addr))
            .filter(|route| route.session_id != session.id)
            .map(|route| route.session_id.clone())
            .collect();

        routes.retain(|_, route| route.session_id != session.id && !displaced.contains(&route.session_id));
        routes.extend(fresh);
        displaced
    }

    /// Targets for a datagram from `src`, marking the route as active.
    pub fn targets_for(&self, src: SocketAddr, now: Instant) -> Option<Vec<SocketAddr>> {
        let mut routes = self.routes.lock();
        let route = routes.get_mut(&src)?;
        route.last_active = now;
        Some(route.targets.clone())
    }

    pub fn route(&self, src: SocketAddr) -> Option<Route> {
        self.routes.lock().get(&src).cloned()
    }

    pub fn remove_sessions(&self, session_ids: &HashSet<String>) {
        self.routes
            .lock()
            .retain(|_, route| !session_ids.contains(&route.session_id));
    }

    /// Most recent forwarding activity per session.
    pub fn last_activity(&self) -> HashMap<String, Instant> {
        let routes = self.routes.lock();
        let mut activity: HashMap<String, Instant> = HashMap::new();
        for route in routes.values() {
            activity
                .entry(route.session_id.clone())
                .and_modify(|last| *last = (*last).max(route.last_active))
                .or_insert(route.last_active);
        }
        activity
    }

    pub fn route_counts(&self) -> HashMap<String, usize> {
        let routes = self.routes.lock();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for route in routes.values() {
            *counts.entry(route.session_id.clone()).or_default() += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_routes(session: &Session, now: Instant) -> HashMap<SocketAddr, Route> {
    let mut routes = HashMap::new();
    if !session.is_ready() {
        return routes;
    }

    let route = |targets: Vec<SocketAddr>| Route {
        session_id: session.id.clone(),
        targets,
        last_active: now,
    };

    for port_type in PortType::ALL {
        let (Some(streamer), Some(viewer)) = (
            session.peer(Role::Streamer, port_type),
            session.peer(Role::Viewer, port_type),
        ) else {
            continue;
        };

        let mut downstream = vec![viewer.addr];
        for spectator in session.complete_spectators() {
            if let Some(peer) = spectator.ports.get(&port_type) {
                downstream.push(peer.addr);
                routes.insert(peer.addr, route(vec![streamer.addr]));
            }
        }

        routes.insert(viewer.addr, route(vec![streamer.addr]));
        routes.insert(streamer.addr, route(downstream));
    }
    routes
}
