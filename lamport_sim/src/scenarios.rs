//! Deterministic scenarios for the simulation harness.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// Slow sender, fast silent receiver
    Simplex,

    /// Fast sender, slow silent receiver
    SlowReceiver,

    /// Three peers, one receiver never reads one neighbor
    DeafNeighbor,

    /// Garbage bytes on a peer's inbound path
    MalformedFrame,

    /// Three peers at random speeds, all-to-all
    FullMesh,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Simplex,
            ScenarioId::SlowReceiver,
            ScenarioId::DeafNeighbor,
            ScenarioId::MalformedFrame,
            ScenarioId::FullMesh,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Simplex => "simplex",
            ScenarioId::SlowReceiver => "slow_receiver",
            ScenarioId::DeafNeighbor => "deaf_neighbor",
            ScenarioId::MalformedFrame => "malformed_frame",
            ScenarioId::FullMesh => "full_mesh",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Simplex => {
                "A sends at 1 tick/s, B never sends at 6 ticks/s; B's clock overtakes A's"
            }
            ScenarioId::SlowReceiver => {
                "A sends at 6 ticks/s, B drains at 1 tick/s; B's backlog keeps growing"
            }
            ScenarioId::DeafNeighbor => {
                "3 peers all-to-all, C ignores A; the A->C backlog grows without bound"
            }
            ScenarioId::MalformedFrame => {
                "Garbage injected into a peer's inbound path; diagnostics only, queue untouched"
            }
            ScenarioId::FullMesh => {
                "3 peers at random speeds; causal order and exactly-once delivery hold"
            }
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl serde::Serialize for ScenarioId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "simplex" => Ok(ScenarioId::Simplex),
            "slow_receiver" | "backlog" => Ok(ScenarioId::SlowReceiver),
            "deaf_neighbor" | "offline_peer" => Ok(ScenarioId::DeafNeighbor),
            "malformed_frame" | "malformed" => Ok(ScenarioId::MalformedFrame),
            "full_mesh" | "mesh" => Ok(ScenarioId::FullMesh),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
        assert_eq!("Slow-Receiver".parse::<ScenarioId>(), Ok(ScenarioId::SlowReceiver));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
