// Consensus mode selection for mediator nodes.
//
// The mode is fixed by node configuration and decides which gate answers
// "may this node mediate right now": the rotation schedule, the authority
// set, both, or neither.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Consensus modes a mediator node can run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusMode {
    /// Any node may mediate at any time
    Permissionless,

    /// Delegated proof of stake: only the holder of the current slot mediates
    Dpos,

    /// Proof of authority: only allow-listed nodes mediate
    Poa,

    /// Active-set membership plus authority-set membership
    Hybrid,
}

impl ConsensusMode {
    /// Return a human-readable name for logging and diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusMode::Permissionless => "permissionless",
            ConsensusMode::Dpos => "dpos",
            ConsensusMode::Poa => "poa",
            ConsensusMode::Hybrid => "hybrid",
        }
    }

    /// Whether the rotation scheduler participates in gating under this mode.
    pub fn uses_rotation(&self) -> bool {
        matches!(self, ConsensusMode::Dpos | ConsensusMode::Hybrid)
    }

    /// Whether the authority set participates in gating under this mode.
    pub fn uses_authority_set(&self) -> bool {
        matches!(self, ConsensusMode::Poa | ConsensusMode::Hybrid)
    }
}

impl Default for ConsensusMode {
    fn default() -> Self {
        ConsensusMode::Permissionless
    }
}

impl fmt::Display for ConsensusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsensusMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "permissionless" => Ok(ConsensusMode::Permissionless),
            "dpos" => Ok(ConsensusMode::Dpos),
            "poa" => Ok(ConsensusMode::Poa),
            "hybrid" => Ok(ConsensusMode::Hybrid),
            other => Err(format!("unknown consensus mode: {}", other)),
        }
    }
}
