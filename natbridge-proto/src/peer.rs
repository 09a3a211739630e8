use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of a session an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Streamer,
    Viewer,
    /// Passive receiver of the streamer's traffic, always served through the relay.
    Spectator,
}

impl Role {
    /// The two roles that have to be present for a session to become ready.
    pub const PEERS: [Role; 2] = [Role::Streamer, Role::Viewer];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "streamer" => Some(Role::Streamer),
            "viewer" => Some(Role::Viewer),
            "spectator" => Some(Role::Spectator),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Streamer => "streamer",
            Role::Viewer => "viewer",
            Role::Spectator => "spectator",
        }
    }

    /// The role a peer exchanges addresses with. Spectators have none.
    pub fn counterpart(self) -> Option<Role> {
        match self {
            Role::Streamer => Some(Role::Viewer),
            Role::Viewer => Some(Role::Streamer),
            Role::Spectator => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical channel carried by one UDP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    Video,
    Control,
}

impl PortType {
    pub const ALL: [PortType; 2] = [PortType::Video, PortType::Control];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "video" => Some(PortType::Video),
            "control" => Some(PortType::Control),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortType::Video => "video",
            PortType::Control => "control",
        }
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_strings_roundtrip() {
        for role in [Role::Streamer, Role::Viewer, Role::Spectator] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("client"), None);
    }

    #[test]
    fn port_type_strings_roundtrip() {
        for port_type in PortType::ALL {
            assert_eq!(PortType::parse(port_type.as_str()), Some(port_type));
        }
        assert_eq!(PortType::parse("audio"), None);
    }

    #[test]
    fn counterparts_are_symmetric() {
        assert_eq!(Role::Streamer.counterpart(), Some(Role::Viewer));
        assert_eq!(Role::Viewer.counterpart(), Some(Role::Streamer));
        assert_eq!(Role::Spectator.counterpart(), None);
    }
}
