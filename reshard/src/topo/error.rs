use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("keyspace {0} not found")]
    KeyspaceNotFound(String),

    #[error("shard {0}/{1} not found")]
    ShardNotFound(String, String),

    #[error("node already exists: {0}")]
    AlreadyExists(String),

    #[error("version mismatch on {0}")]
    VersionMismatch(String),

    #[error("keyspace {0} is locked for another operation: {1}")]
    Locked(String, String),

    #[error("invalid shard name: {0}")]
    InvalidShardName(String),

    #[error("{0}")]
    Condition(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Precondition failure raised by a record mutator; surfaced
    /// without writing the record.
    pub fn condition(message: impl Into<String>) -> Self {
        Error::Condition(message.into())
    }
}
