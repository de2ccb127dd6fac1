//! Tablet identities and the tablet-management RPC client.

pub mod local;
pub mod manager;

pub use local::LocalTablets;
pub use manager::{Error, QueryResult, TabletManager};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role a tablet plays within its shard.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum TabletType {
    #[default]
    Primary,
    Replica,
    Rdonly,
}

impl TabletType {
    /// All types that serve queries.
    pub fn all() -> [TabletType; 3] {
        [TabletType::Primary, TabletType::Replica, TabletType::Rdonly]
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, TabletType::Primary)
    }
}

impl fmt::Display for TabletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TabletType::Primary => write!(f, "PRIMARY"),
            TabletType::Replica => write!(f, "REPLICA"),
            TabletType::Rdonly => write!(f, "RDONLY"),
        }
    }
}

impl FromStr for TabletType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PRIMARY" | "MASTER" => Ok(TabletType::Primary),
            "REPLICA" => Ok(TabletType::Replica),
            "RDONLY" => Ok(TabletType::Rdonly),
            other => Err(Error::UnknownTabletType(other.to_string())),
        }
    }
}

/// Globally unique tablet identity: the cell it runs in and a numeric uid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl TabletAlias {
    pub fn new(cell: &str, uid: u32) -> Self {
        Self {
            cell: cell.to_string(),
            uid,
        }
    }
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.cell, self.uid)
    }
}

impl FromStr for TabletAlias {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cell, uid) = s
            .rsplit_once('-')
            .ok_or_else(|| Error::InvalidAlias(s.to_string()))?;
        let uid = uid
            .parse()
            .map_err(|_| Error::InvalidAlias(s.to_string()))?;
        Ok(Self {
            cell: cell.to_string(),
            uid,
        })
    }
}
