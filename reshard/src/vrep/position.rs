use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque replication position.
///
/// Positions are produced by source primaries and consumed by the
/// catch-up wait RPC; the control plane never interprets them, it only
/// carries them around. An empty position means "from the beginning".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position(pub String);

impl Position {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Position {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
