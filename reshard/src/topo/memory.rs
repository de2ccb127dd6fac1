//! In-memory topology store, used by tests and available for embedding.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    Error, Keyspace, KeyspaceLock, Shard, SrvKeyspace, TabletRecord, TopoServer, Versioned,
};

#[derive(Default)]
struct State {
    keyspaces: BTreeMap<String, Versioned<Keyspace>>,
    shards: BTreeMap<(String, String), Versioned<Shard>>,
    tablets: BTreeMap<String, TabletRecord>,
    srv_keyspaces: BTreeMap<(String, String), SrvKeyspace>,
    locks: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct MemoryTopo {
    cells: Vec<String>,
    state: Arc<Mutex<State>>,
}

impl MemoryTopo {
    pub fn new(cells: &[&str]) -> Self {
        Self {
            cells: cells.iter().map(|c| c.to_string()).collect(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }
}

#[async_trait]
impl TopoServer for MemoryTopo {
    async fn cells(&self) -> Result<Vec<String>, Error> {
        Ok(self.cells.clone())
    }

    async fn get_keyspace(&self, keyspace: &str) -> Result<Versioned<Keyspace>, Error> {
        self.state
            .lock()
            .keyspaces
            .get(keyspace)
            .cloned()
            .ok_or_else(|| Error::KeyspaceNotFound(keyspace.to_string()))
    }

    async fn create_keyspace(&self, keyspace: &Keyspace) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.keyspaces.contains_key(&keyspace.name) {
            return Err(Error::AlreadyExists(keyspace.name.clone()));
        }
        state.keyspaces.insert(
            keyspace.name.clone(),
            Versioned {
                version: 1,
                record: keyspace.clone(),
            },
        );
        Ok(())
    }

    async fn update_keyspace(&self, version: u64, keyspace: &Keyspace) -> Result<u64, Error> {
        let mut state = self.state.lock();
        let entry = state
            .keyspaces
            .get_mut(&keyspace.name)
            .ok_or_else(|| Error::KeyspaceNotFound(keyspace.name.clone()))?;
        if entry.version != version {
            return Err(Error::VersionMismatch(keyspace.name.clone()));
        }
        entry.version += 1;
        entry.record = keyspace.clone();
        Ok(entry.version)
    }

    async fn list_shards(&self, keyspace: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .state
            .lock()
            .shards
            .keys()
            .filter(|(ks, _)| ks == keyspace)
            .map(|(_, shard)| shard.clone())
            .collect())
    }

    async fn get_shard(&self, keyspace: &str, shard: &str) -> Result<Versioned<Shard>, Error> {
        self.state
            .lock()
            .shards
            .get(&(keyspace.to_string(), shard.to_string()))
            .cloned()
            .ok_or_else(|| Error::ShardNotFound(keyspace.to_string(), shard.to_string()))
    }

    async fn create_shard(&self, shard: &Shard) -> Result<(), Error> {
        let mut state = self.state.lock();
        let key = (shard.keyspace.clone(), shard.name.clone());
        if state.shards.contains_key(&key) {
            return Err(Error::AlreadyExists(shard.id()));
        }
        state.shards.insert(
            key,
            Versioned {
                version: 1,
                record: shard.clone(),
            },
        );
        Ok(())
    }

    async fn update_shard(&self, version: u64, shard: &Shard) -> Result<u64, Error> {
        let mut state = self.state.lock();
        let entry = state
            .shards
            .get_mut(&(shard.keyspace.clone(), shard.name.clone()))
            .ok_or_else(|| Error::ShardNotFound(shard.keyspace.clone(), shard.name.clone()))?;
        if entry.version != version {
            return Err(Error::VersionMismatch(shard.id()));
        }
        entry.version += 1;
        entry.record = shard.clone();
        Ok(entry.version)
    }

    async fn list_tablets(&self, keyspace: &str, shard: &str) -> Result<Vec<TabletRecord>, Error> {
        Ok(self
            .state
            .lock()
            .tablets
            .values()
            .filter(|t| t.keyspace == keyspace && t.shard == shard)
            .cloned()
            .collect())
    }

    async fn upsert_tablet(&self, tablet: &TabletRecord) -> Result<(), Error> {
        self.state
            .lock()
            .tablets
            .insert(tablet.alias.to_string(), tablet.clone());
        Ok(())
    }

    async fn get_srv_keyspace(&self, cell: &str, keyspace: &str) -> Result<SrvKeyspace, Error> {
        Ok(self
            .state
            .lock()
            .srv_keyspaces
            .get(&(cell.to_string(), keyspace.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn update_srv_keyspace(
        &self,
        cell: &str,
        keyspace: &str,
        srv: &SrvKeyspace,
    ) -> Result<(), Error> {
        self.state
            .lock()
            .srv_keyspaces
            .insert((cell.to_string(), keyspace.to_string()), srv.clone());
        Ok(())
    }

    async fn lock_keyspace(&self, keyspace: &str, action: &str) -> Result<KeyspaceLock, Error> {
        {
            let mut state = self.state.lock();
            if let Some(holder) = state.locks.get(keyspace) {
                return Err(Error::Locked(keyspace.to_string(), holder.clone()));
            }
            state.locks.insert(keyspace.to_string(), action.to_string());
        }

        let state = self.state.clone();
        let name = keyspace.to_string();
        Ok(KeyspaceLock::new(
            keyspace,
            Box::new(move || {
                state.lock().locks.remove(&name);
            }),
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::topo::update_shard_fields;

    #[tokio::test]
    async fn test_shard_cas() {
        let topo = MemoryTopo::new(&["z1"]);
        let shard = Shard::new("ks", "-80").unwrap();
        topo.create_shard(&shard).await.unwrap();

        let read = topo.get_shard("ks", "-80").await.unwrap();
        topo.update_shard(read.version, &read.record).await.unwrap();

        // The first read's version is now stale.
        let stale = topo.update_shard(read.version, &read.record).await;
        assert!(matches!(stale, Err(Error::VersionMismatch(_))));

        // The retrying updater goes through regardless.
        let updated = update_shard_fields(&topo, "ks", "-80", |shard| {
            shard.is_primary_serving = true;
            Ok(())
        })
        .await
        .unwrap();
        assert!(updated.is_primary_serving);
    }

    #[tokio::test]
    async fn test_mutator_error_writes_nothing() {
        let topo = MemoryTopo::new(&["z1"]);
        topo.create_shard(&Shard::new("ks", "0").unwrap())
            .await
            .unwrap();
        let before = topo.get_shard("ks", "0").await.unwrap();

        let result = update_shard_fields(&topo, "ks", "0", |shard| {
            shard.is_primary_serving = true;
            Err(Error::condition("nope"))
        })
        .await;
        assert!(result.is_err());

        let after = topo.get_shard("ks", "0").await.unwrap();
        assert_eq!(after.version, before.version);
        assert!(!after.record.is_primary_serving);
    }

    #[tokio::test]
    async fn test_lock_exclusive() {
        let topo = MemoryTopo::new(&["z1"]);
        let guard = topo.lock_keyspace("ks", "migrate").await.unwrap();

        let second = topo.lock_keyspace("ks", "cancel").await;
        assert!(matches!(second, Err(Error::Locked(_, _))));

        drop(guard);
        topo.lock_keyspace("ks", "cancel").await.unwrap();
    }
}
