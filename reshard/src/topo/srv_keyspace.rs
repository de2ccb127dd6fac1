//! Per-cell serving directory.
//!
//! For every cell, the directory lists which shards answer queries for
//! each tablet type. Query routing reads it; the migrators and the
//! keyspace graph rebuild are the only writers.

use serde::{Deserialize, Serialize};

use super::{Error, KeyRange, Shard, TopoServer};
use crate::tablet::TabletType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_range: Option<KeyRange>,
}

impl ShardReference {
    pub fn new(shard: &Shard) -> Self {
        Self {
            name: shard.name.clone(),
            key_range: shard.key_range.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SrvKeyspacePartition {
    pub served_type: TabletType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shard_references: Vec<ShardReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SrvKeyspace {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<SrvKeyspacePartition>,
}

impl SrvKeyspace {
    pub fn partition(&self, served_type: TabletType) -> Option<&SrvKeyspacePartition> {
        self.partitions
            .iter()
            .find(|p| p.served_type == served_type)
    }

    fn partition_entry(&mut self, served_type: TabletType) -> &mut SrvKeyspacePartition {
        if let Some(position) = self
            .partitions
            .iter()
            .position(|p| p.served_type == served_type)
        {
            return &mut self.partitions[position];
        }
        self.partitions.push(SrvKeyspacePartition {
            served_type,
            ..Default::default()
        });
        self.partitions.last_mut().unwrap()
    }

    /// Shards currently serving a type.
    pub fn served_shards(&self, served_type: TabletType) -> Vec<String> {
        self.partition(served_type)
            .map(|p| p.shard_references.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Swap one tablet type's serving from `from` to `to`.
    pub fn swap_served_type(&mut self, served_type: TabletType, to: &[Shard], from: &[Shard]) {
        let partition = self.partition_entry(served_type);
        partition
            .shard_references
            .retain(|r| !from.iter().any(|s| s.name == r.name));
        for shard in to {
            if !partition.shard_references.iter().any(|r| r.name == shard.name) {
                partition.shard_references.push(ShardReference::new(shard));
            }
        }
        partition
            .shard_references
            .sort_by(|a, b| super::key_range::or_complete(&a.key_range).cmp(&super::key_range::or_complete(&b.key_range)));
    }
}

/// Commit a serving swap for one tablet type in every requested cell
/// (`None` = all cells). Per cell the swap is a single directory write,
/// which the store applies atomically.
pub async fn migrate_served_type(
    topo: &dyn TopoServer,
    keyspace: &str,
    to: &[Shard],
    from: &[Shard],
    served_type: TabletType,
    cells: Option<&[String]>,
) -> Result<(), Error> {
    let all_cells = topo.cells().await?;
    let cells = match cells {
        Some(cells) if !cells.is_empty() => cells.to_vec(),
        _ => all_cells,
    };

    for cell in &cells {
        let mut srv = topo
            .get_srv_keyspace(cell, keyspace)
            .await
            .unwrap_or_default();
        srv.swap_served_type(served_type, to, from);
        topo.update_srv_keyspace(cell, keyspace, &srv).await?;
    }

    Ok(())
}

/// Regenerate the serving directory from the shard records.
///
/// Only valid at rest: while any shard is a resharding destination the
/// directory is owned by the migrators and a rebuild would fight them.
pub async fn rebuild_keyspace(
    topo: &dyn TopoServer,
    keyspace: &str,
    cells: Option<&[String]>,
) -> Result<(), Error> {
    let mut serving = vec![];
    for name in topo.list_shards(keyspace).await? {
        let shard = topo.get_shard(keyspace, &name).await?.record;
        if shard.has_source_shards() {
            return Err(Error::condition(format!(
                "cannot rebuild keyspace {}: shard {} is a resharding destination",
                keyspace,
                shard.id()
            )));
        }
        if shard.is_primary_serving {
            serving.push(shard);
        }
    }

    let mut srv = SrvKeyspace::default();
    for served_type in TabletType::all() {
        let partition = srv.partition_entry(served_type);
        partition.shard_references = serving.iter().map(ShardReference::new).collect();
    }

    let all_cells = topo.cells().await?;
    let cells = match cells {
        Some(cells) if !cells.is_empty() => cells.to_vec(),
        _ => all_cells,
    };
    for cell in &cells {
        topo.update_srv_keyspace(cell, keyspace, &srv).await?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_swap_served_type() {
        let source = Shard::new("ks", "0").unwrap();
        let low = Shard::new("ks", "-80").unwrap();
        let high = Shard::new("ks", "80-").unwrap();

        let mut srv = SrvKeyspace::default();
        srv.swap_served_type(TabletType::Replica, &[source.clone()], &[]);
        assert_eq!(srv.served_shards(TabletType::Replica), vec!["0"]);

        srv.swap_served_type(
            TabletType::Replica,
            &[low.clone(), high.clone()],
            &[source.clone()],
        );
        assert_eq!(srv.served_shards(TabletType::Replica), vec!["-80", "80-"]);

        // Swapping back restores the original single shard.
        srv.swap_served_type(TabletType::Replica, &[source], &[low, high]);
        assert_eq!(srv.served_shards(TabletType::Replica), vec!["0"]);
    }
}
