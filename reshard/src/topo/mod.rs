//! Topology store: the cluster's source of truth.
//!
//! Keyspace, shard and tablet records plus the per-cell serving
//! directory live in a strongly-consistent key-value service behind the
//! [`TopoServer`] trait. Records are versioned; every write is a
//! compare-and-swap against the version that was read.

pub mod error;
pub mod file;
pub mod key_range;
pub mod keyspace;
pub mod memory;
pub mod shard;
pub mod srv_keyspace;

pub use error::Error;
pub use file::FileTopo;
pub use key_range::KeyRange;
pub use keyspace::{Keyspace, KeyspaceIdType, ServedFrom};
pub use memory::MemoryTopo;
pub use shard::{Shard, SourceShard, TabletControl};
pub use srv_keyspace::{
    migrate_served_type, rebuild_keyspace, ShardReference, SrvKeyspace, SrvKeyspacePartition,
};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::tablet::{TabletAlias, TabletType};

/// A record together with the store version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub record: T,
}

/// Registration of a running tablet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletRecord {
    pub alias: TabletAlias,
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: TabletType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
}

/// Held for the duration of a keyspace-wide operation. Acquisition fails
/// immediately when another operation holds the lock; release happens on
/// drop, on every exit path.
pub struct KeyspaceLock {
    keyspace: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl KeyspaceLock {
    pub fn new(keyspace: &str, release: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            release: Some(release),
        }
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }
}

impl Drop for KeyspaceLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for KeyspaceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyspaceLock")
            .field("keyspace", &self.keyspace)
            .finish()
    }
}

#[async_trait]
pub trait TopoServer: Send + Sync {
    /// All cells known to the cluster.
    async fn cells(&self) -> Result<Vec<String>, Error>;

    async fn get_keyspace(&self, keyspace: &str) -> Result<Versioned<Keyspace>, Error>;
    async fn create_keyspace(&self, keyspace: &Keyspace) -> Result<(), Error>;
    /// Compare-and-swap write; fails with [`Error::VersionMismatch`] when
    /// the record moved underneath the caller.
    async fn update_keyspace(&self, version: u64, keyspace: &Keyspace) -> Result<u64, Error>;

    async fn list_shards(&self, keyspace: &str) -> Result<Vec<String>, Error>;
    async fn get_shard(&self, keyspace: &str, shard: &str) -> Result<Versioned<Shard>, Error>;
    async fn create_shard(&self, shard: &Shard) -> Result<(), Error>;
    async fn update_shard(&self, version: u64, shard: &Shard) -> Result<u64, Error>;

    async fn list_tablets(&self, keyspace: &str, shard: &str) -> Result<Vec<TabletRecord>, Error>;
    async fn upsert_tablet(&self, tablet: &TabletRecord) -> Result<(), Error>;

    async fn get_srv_keyspace(&self, cell: &str, keyspace: &str) -> Result<SrvKeyspace, Error>;
    async fn update_srv_keyspace(
        &self,
        cell: &str,
        keyspace: &str,
        srv: &SrvKeyspace,
    ) -> Result<(), Error>;

    async fn lock_keyspace(&self, keyspace: &str, action: &str) -> Result<KeyspaceLock, Error>;
}

/// Read-modify-write a shard record. The mutator runs on the freshly
/// read record; a version conflict on the write retries from the read.
/// A mutator error is propagated without writing.
pub async fn update_shard_fields<F>(
    topo: &dyn TopoServer,
    keyspace: &str,
    shard: &str,
    mut mutate: F,
) -> Result<Shard, Error>
where
    F: FnMut(&mut Shard) -> Result<(), Error> + Send,
{
    loop {
        let Versioned {
            version,
            mut record,
        } = topo.get_shard(keyspace, shard).await?;
        mutate(&mut record)?;

        match topo.update_shard(version, &record).await {
            Ok(_) => return Ok(record),
            Err(Error::VersionMismatch(_)) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Same contract as [`update_shard_fields`], for the keyspace record.
pub async fn update_keyspace_fields<F>(
    topo: &dyn TopoServer,
    keyspace: &str,
    mut mutate: F,
) -> Result<Keyspace, Error>
where
    F: FnMut(&mut Keyspace) -> Result<(), Error> + Send,
{
    loop {
        let Versioned {
            version,
            mut record,
        } = topo.get_keyspace(keyspace).await?;
        mutate(&mut record)?;

        match topo.update_keyspace(version, &record).await {
            Ok(_) => return Ok(record),
            Err(Error::VersionMismatch(_)) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Load a set of shard records by name.
pub async fn get_shards(
    topo: &dyn TopoServer,
    keyspace: &str,
    names: &[String],
) -> Result<Vec<Shard>, Error> {
    let mut shards = Vec::with_capacity(names.len());
    for name in names {
        shards.push(topo.get_shard(keyspace, name).await?.record);
    }
    Ok(shards)
}
