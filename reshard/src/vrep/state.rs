use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a VReplication stream. Deletion is implicit: the row
/// is removed from `_vt.vreplication`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    Init,
    Running,
    Stopped,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Init => write!(f, "Init"),
            StreamState::Running => write!(f, "Running"),
            StreamState::Stopped => write!(f, "Stopped"),
        }
    }
}

impl FromStr for StreamState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Init" => Ok(StreamState::Init),
            "Running" => Ok(StreamState::Running),
            "Stopped" => Ok(StreamState::Stopped),
            other => Err(format!("unknown stream state: {}", other)),
        }
    }
}
