//! Replicated store statistics as exchanged over the `stats` command

use crate::effects::crdt::StoreStats;
use crate::errors::{Result, StrataError};
use serde::{Deserialize, Serialize};

/// Statistics kind reported by CRDT-backed databases
pub const CRDT_STATS_KIND: &str = "crdt";

/// Decoded database statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStats {
    /// Statistics kind, e.g. `"crdt"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Current DAG heads of the replica
    #[serde(default)]
    pub heads: Vec<String>,
}

impl DatabaseStats {
    /// Build CRDT statistics from a store snapshot
    pub fn from_store(stats: &StoreStats) -> Self {
        Self {
            kind: CRDT_STATS_KIND.to_string(),
            heads: stats.heads.clone(),
        }
    }

    /// Number of heads
    pub fn head_count(&self) -> usize {
        self.heads.len()
    }

    /// Encode for the wire
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the wire
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| StrataError::malformed(format!("invalid database stats: {e}")))
    }
}
