use thiserror::Error;

use crate::{healthcheck, tablet, topo};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Topo(#[from] topo::Error),

    #[error("{0}")]
    Tablet(#[from] tablet::Error),

    #[error("{0}")]
    Health(#[from] healthcheck::Error),

    #[error("shard {0}/{1} is not involved in any overlapping shards")]
    NoOverlappingShards(String, String),

    #[error("no source shards on either side, was a clone ever run?")]
    NoCloneRun,

    #[error("destination shard {0} already has source shards, was a clone already run?")]
    CloneAlreadyRun(String),

    #[error("migrate the following types first: {0}")]
    MigrateNonPrimaryFirst(String),

    #[error("timed out waiting for filtered replication to catch up")]
    CatchupTimeout,

    #[error("unexpected concurrent access: {0}")]
    Concurrent(String),

    #[error("reverse replication streams left orphaned, clean up manually: {0}")]
    OrphanStreams(String),

    #[error("tablets not drained: {0}")]
    NotDrained(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Precondition(String),
}

impl Error {
    pub fn precondition(message: impl Into<String>) -> Self {
        Error::Precondition(message.into())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::CatchupTimeout
    }
}
