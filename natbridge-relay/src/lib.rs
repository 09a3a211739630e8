//! NAT traversal rendezvous and UDP relay.
//!
//! Peers announce each of their sockets with a session id issued by the
//! session store. Once a streamer and a viewer have announced both their
//! video and control sockets the relay tells each side where to send its
//! traffic, and keeps forwarding datagrams for peers that never manage a
//! direct path.

pub mod config;
#[cfg(unix)]
pub mod control;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod stats;

pub use config::{PeerInfoMode, RelayConfig};
pub use registry::{PeerRegistry, Registration, RegistrationError};
pub use relay::{Route, RouteTable};
pub use server::RelayServer;
pub use session::{PeerEntry, Session, SpectatorEntry};
