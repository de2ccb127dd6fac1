//! File-backed topology store.
//!
//! Keeps every record as a pretty-printed JSON file under a root
//! directory, so control-plane state survives between CLI invocations.
//! Good enough for local mode and development; production clusters point
//! the [`TopoServer`] trait at a real consistent store.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    Error, Keyspace, KeyspaceLock, Shard, SrvKeyspace, TabletRecord, TopoServer, Versioned,
};

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u64,
    record: T,
}

#[derive(Clone)]
pub struct FileTopo {
    root: PathBuf,
}

impl FileTopo {
    /// Open (and lay out, if needed) a store at `root`. The cell list is
    /// written on first open and read back afterwards.
    pub fn open(root: &Path, cells: &[String]) -> Result<Self, Error> {
        let topo = Self {
            root: root.to_path_buf(),
        };
        for dir in ["keyspaces", "cells", "tablets", "locks"] {
            fs::create_dir_all(root.join(dir))?;
        }
        let cells_path = topo.root.join("cells.json");
        if !cells_path.exists() {
            fs::write(&cells_path, serde_json::to_string_pretty(&cells.to_vec())?)?;
        }
        Ok(topo)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn keyspace_path(&self, keyspace: &str) -> PathBuf {
        self.root
            .join("keyspaces")
            .join(keyspace)
            .join("Keyspace.json")
    }

    fn shard_path(&self, keyspace: &str, shard: &str) -> PathBuf {
        self.root
            .join("keyspaces")
            .join(keyspace)
            .join("shards")
            .join(format!("{}.json", shard))
    }

    fn srv_path(&self, cell: &str, keyspace: &str) -> PathBuf {
        self.root
            .join("cells")
            .join(cell)
            .join(keyspace)
            .join("SrvKeyspace.json")
    }

    fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<Envelope<T>>, Error> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write<T: Serialize>(path: &Path, envelope: &Envelope<T>) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(envelope)?)?;
        Ok(())
    }
}

#[async_trait]
impl TopoServer for FileTopo {
    async fn cells(&self) -> Result<Vec<String>, Error> {
        let contents = fs::read_to_string(self.root.join("cells.json"))?;
        Ok(serde_json::from_str(&contents)?)
    }

    async fn get_keyspace(&self, keyspace: &str) -> Result<Versioned<Keyspace>, Error> {
        let envelope: Envelope<Keyspace> = Self::read(&self.keyspace_path(keyspace))?
            .ok_or_else(|| Error::KeyspaceNotFound(keyspace.to_string()))?;
        Ok(Versioned {
            version: envelope.version,
            record: envelope.record,
        })
    }

    async fn create_keyspace(&self, keyspace: &Keyspace) -> Result<(), Error> {
        let path = self.keyspace_path(&keyspace.name);
        if path.exists() {
            return Err(Error::AlreadyExists(keyspace.name.clone()));
        }
        Self::write(
            &path,
            &Envelope {
                version: 1,
                record: keyspace.clone(),
            },
        )
    }

    async fn update_keyspace(&self, version: u64, keyspace: &Keyspace) -> Result<u64, Error> {
        let path = self.keyspace_path(&keyspace.name);
        let current: Envelope<Keyspace> = Self::read(&path)?
            .ok_or_else(|| Error::KeyspaceNotFound(keyspace.name.clone()))?;
        if current.version != version {
            return Err(Error::VersionMismatch(keyspace.name.clone()));
        }
        Self::write(
            &path,
            &Envelope {
                version: version + 1,
                record: keyspace.clone(),
            },
        )?;
        Ok(version + 1)
    }

    async fn list_shards(&self, keyspace: &str) -> Result<Vec<String>, Error> {
        let dir = self.root.join("keyspaces").join(keyspace).join("shards");
        let mut names = vec![];
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(shard) = name.strip_suffix(".json") {
                names.push(shard.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn get_shard(&self, keyspace: &str, shard: &str) -> Result<Versioned<Shard>, Error> {
        let envelope: Envelope<Shard> = Self::read(&self.shard_path(keyspace, shard))?
            .ok_or_else(|| Error::ShardNotFound(keyspace.to_string(), shard.to_string()))?;
        Ok(Versioned {
            version: envelope.version,
            record: envelope.record,
        })
    }

    async fn create_shard(&self, shard: &Shard) -> Result<(), Error> {
        let path = self.shard_path(&shard.keyspace, &shard.name);
        if path.exists() {
            return Err(Error::AlreadyExists(shard.id()));
        }
        Self::write(
            &path,
            &Envelope {
                version: 1,
                record: shard.clone(),
            },
        )
    }

    async fn update_shard(&self, version: u64, shard: &Shard) -> Result<u64, Error> {
        let path = self.shard_path(&shard.keyspace, &shard.name);
        let current: Envelope<Shard> = Self::read(&path)?
            .ok_or_else(|| Error::ShardNotFound(shard.keyspace.clone(), shard.name.clone()))?;
        if current.version != version {
            return Err(Error::VersionMismatch(shard.id()));
        }
        Self::write(
            &path,
            &Envelope {
                version: version + 1,
                record: shard.clone(),
            },
        )?;
        Ok(version + 1)
    }

    async fn list_tablets(&self, keyspace: &str, shard: &str) -> Result<Vec<TabletRecord>, Error> {
        let mut tablets = vec![];
        for entry in fs::read_dir(self.root.join("tablets"))? {
            let contents = fs::read_to_string(entry?.path())?;
            let tablet: TabletRecord = serde_json::from_str(&contents)?;
            if tablet.keyspace == keyspace && tablet.shard == shard {
                tablets.push(tablet);
            }
        }
        tablets.sort_by_key(|t| t.alias.clone());
        Ok(tablets)
    }

    async fn upsert_tablet(&self, tablet: &TabletRecord) -> Result<(), Error> {
        let path = self
            .root
            .join("tablets")
            .join(format!("{}.json", tablet.alias));
        fs::write(&path, serde_json::to_string_pretty(tablet)?)?;
        Ok(())
    }

    async fn get_srv_keyspace(&self, cell: &str, keyspace: &str) -> Result<SrvKeyspace, Error> {
        match fs::read_to_string(self.srv_path(cell, keyspace)) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(SrvKeyspace::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn update_srv_keyspace(
        &self,
        cell: &str,
        keyspace: &str,
        srv: &SrvKeyspace,
    ) -> Result<(), Error> {
        let path = self.srv_path(cell, keyspace);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(srv)?)?;
        Ok(())
    }

    async fn lock_keyspace(&self, keyspace: &str, action: &str) -> Result<KeyspaceLock, Error> {
        let path = self.root.join("locks").join(format!("{}.lock", keyspace));
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => {
                fs::write(&path, action)?;
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                return Err(Error::Locked(keyspace.to_string(), holder));
            }
            Err(err) => return Err(err.into()),
        }

        Ok(KeyspaceLock::new(
            keyspace,
            Box::new(move || {
                let _ = fs::remove_file(&path);
            }),
        ))
    }
}
