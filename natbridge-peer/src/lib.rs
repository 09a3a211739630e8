//! Peer side of the rendezvous: announce to the relay, learn the
//! counterpart's address, then punch a direct path or fall back to relaying.

pub mod config;
pub mod probe;
pub mod punch;

pub use config::PeerConfig;
pub use probe::{Datagram, PathState, ProbeHandle};
pub use punch::{PeerInfo, PunchPeer, Rendezvous};
