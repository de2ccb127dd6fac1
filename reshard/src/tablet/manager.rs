//! RPC surface of the tablet manager.
//!
//! The control plane never talks to a database directly. Everything goes
//! through this client: state refreshes, replication positions, and the
//! SQL-shaped VReplication control statements executed against the
//! `_vt.vreplication` table on a primary.

use async_trait::async_trait;
use thiserror::Error;

use super::TabletAlias;
use crate::vrep::Position;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tablet {0} not found")]
    NotFound(String),

    #[error("tablet {0} unreachable")]
    Unreachable(String),

    #[error("no vreplication stream {uid} on tablet {alias}")]
    StreamNotFound { alias: String, uid: u32 },

    #[error("unknown tablet type: {0}")]
    UnknownTabletType(String),

    #[error("invalid tablet alias: {0}")]
    InvalidAlias(String),

    #[error("malformed vreplication statement: {0}")]
    MalformedStatement(String),

    #[error("{0}")]
    Failed(String),
}

/// Result of a VReplication control statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub fields: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub rows_affected: u64,
    /// Id assigned to the stream for insert statements.
    pub insert_id: u64,
}

/// Client for tablet-management RPCs.
///
/// Production deployments inject their RPC transport here; [`super::LocalTablets`]
/// is the in-process implementation used by tests and local mode.
#[async_trait]
pub trait TabletManager: Send + Sync {
    /// Check the tablet is alive.
    async fn ping(&self, alias: &TabletAlias) -> Result<(), Error>;

    /// Tell the tablet to re-read its shard record and apply serving changes.
    async fn refresh_state(&self, alias: &TabletAlias) -> Result<(), Error>;

    /// Current replication position of a primary.
    async fn primary_position(&self, alias: &TabletAlias) -> Result<Position, Error>;

    /// Execute a VReplication control statement on the tablet's `_vt.vreplication` table.
    async fn vreplication_exec(&self, alias: &TabletAlias, query: &str)
        -> Result<QueryResult, Error>;

    /// Block until the stream identified by `uid` has applied up to `position`.
    async fn vreplication_wait_for_pos(
        &self,
        alias: &TabletAlias,
        uid: u32,
        position: &Position,
    ) -> Result<(), Error>;
}
