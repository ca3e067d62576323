//! Common types for the environment abstraction.

use serde::{Deserialize, Serialize};

/// Unique identifier for a peer within one topology.
///
/// A small integer label; serialized as a bare number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

impl PeerId {
    /// Creates a PeerId from its numeric label.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the numeric label.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for PeerId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("peer-").unwrap_or(s);
        digits
            .parse::<u32>()
            .map(PeerId)
            .map_err(|_| format!("Invalid peer id: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display_and_parse() {
        let id = PeerId::new(3);
        assert_eq!(id.to_string(), "peer-3");
        assert_eq!("peer-3".parse::<PeerId>().unwrap(), id);
        assert_eq!("3".parse::<PeerId>().unwrap(), id);
        assert!("peer-x".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_peer_id_serializes_as_number() {
        let json = serde_json::to_string(&PeerId::new(7)).unwrap();
        assert_eq!(json, "7");
        let back: PeerId = serde_json::from_str("7").unwrap();
        assert_eq!(back, PeerId::new(7));
    }
}
