//! The shard topology record.

use serde::{Deserialize, Serialize};

use super::{Error, KeyRange};
use crate::tablet::{TabletAlias, TabletType};

/// Binds a destination shard to one inbound VReplication stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceShard {
    /// Stream id on the destination primary's `_vt.vreplication` table.
    pub uid: u32,
    pub keyspace: String,
    pub shard: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_range: Option<KeyRange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<String>,
}

/// Per tablet type serving restrictions, optionally scoped to cells.
/// An empty cell list means all cells.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabletControl {
    pub tablet_type: TabletType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cells: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub denied_tables: Vec<String>,
    #[serde(default)]
    pub disable_query_service: bool,
    #[serde(default)]
    pub frozen: bool,
}

impl TabletControl {
    /// A control with nothing left to say can be dropped from the record.
    fn is_empty(&self) -> bool {
        !self.disable_query_service && !self.frozen && self.denied_tables.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub keyspace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_range: Option<KeyRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_alias: Option<TabletAlias>,
    #[serde(default)]
    pub is_primary_serving: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_shards: Vec<SourceShard>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tablet_controls: Vec<TabletControl>,
}

impl Shard {
    /// New shard record with the range parsed from the name.
    pub fn new(keyspace: &str, name: &str) -> Result<Self, Error> {
        Ok(Self {
            keyspace: keyspace.to_string(),
            name: name.to_string(),
            key_range: KeyRange::parse_shard_name(name)?,
            ..Default::default()
        })
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.keyspace, self.name)
    }

    /// Primary tablet, required for any migration step.
    pub fn primary(&self) -> Result<&TabletAlias, Error> {
        self.primary_alias
            .as_ref()
            .ok_or_else(|| Error::condition(format!("shard {} has no primary", self.id())))
    }

    /// This shard is a destination: it receives data over CDC.
    pub fn has_source_shards(&self) -> bool {
        !self.source_shards.is_empty()
    }

    pub fn tablet_control(&self, tablet_type: TabletType) -> Option<&TabletControl> {
        self.tablet_controls
            .iter()
            .find(|tc| tc.tablet_type == tablet_type)
    }

    fn tablet_control_entry(&mut self, tablet_type: TabletType) -> &mut TabletControl {
        if let Some(position) = self
            .tablet_controls
            .iter()
            .position(|tc| tc.tablet_type == tablet_type)
        {
            return &mut self.tablet_controls[position];
        }

        self.tablet_controls.push(TabletControl {
            tablet_type,
            ..Default::default()
        });
        self.tablet_controls.last_mut().unwrap()
    }

    /// The frozen bit on the primary control: the point of no return for
    /// primary cutover.
    pub fn is_primary_frozen(&self) -> bool {
        self.tablet_control(TabletType::Primary)
            .map(|tc| tc.frozen)
            .unwrap_or(false)
    }

    pub fn set_primary_frozen(&mut self, frozen: bool) {
        let control = self.tablet_control_entry(TabletType::Primary);
        control.frozen = frozen;
        self.prune_controls();
    }

    /// Flip query service for a tablet type, scoped to `cells` (empty =
    /// all cells). Re-enabling with a cell subset needs `all_cells` to
    /// expand a control that covered every cell.
    pub fn update_disable_query_service(
        &mut self,
        tablet_type: TabletType,
        cells: &[String],
        disable: bool,
        all_cells: &[String],
    ) {
        let control = self.tablet_control_entry(tablet_type);

        if disable {
            if !control.disable_query_service {
                control.disable_query_service = true;
                control.cells = cells.to_vec();
            } else {
                merge_cells(&mut control.cells, cells);
            }
        } else if control.disable_query_service {
            remove_cells(&mut control.cells, cells, all_cells);
            if control.cells.is_empty() && !cells.is_empty() && !all_cells.is_empty() {
                // Subtraction left nothing: the restriction is gone.
                control.disable_query_service = false;
            }
            if cells.is_empty() {
                control.disable_query_service = false;
                control.cells.clear();
            }
        }

        self.prune_controls();
    }

    /// Add or remove tables from the denied list for a tablet type.
    pub fn update_denied_tables(
        &mut self,
        tablet_type: TabletType,
        cells: &[String],
        remove: bool,
        tables: &[String],
        all_cells: &[String],
    ) {
        let control = self.tablet_control_entry(tablet_type);

        if remove {
            control.denied_tables.retain(|t| !tables.contains(t));
            remove_cells(&mut control.cells, cells, all_cells);
            if control.cells.is_empty() && !cells.is_empty() && !all_cells.is_empty() {
                control.denied_tables.clear();
            }
        } else {
            for table in tables {
                if !control.denied_tables.contains(table) {
                    control.denied_tables.push(table.clone());
                }
            }
            control.denied_tables.sort();
            merge_cells(&mut control.cells, cells);
        }

        self.prune_controls();
    }

    fn prune_controls(&mut self) {
        self.tablet_controls.retain(|tc| !tc.is_empty());
    }
}

/// Union of two cell scopes. Empty means all cells and absorbs everything.
fn merge_cells(existing: &mut Vec<String>, added: &[String]) {
    if existing.is_empty() {
        return;
    }
    if added.is_empty() {
        existing.clear();
        return;
    }
    for cell in added {
        if !existing.contains(cell) {
            existing.push(cell.clone());
        }
    }
    existing.sort();
}

/// Subtract a cell scope. A control covering all cells is first expanded
/// to `all_cells` so individual cells can be carved out.
fn remove_cells(existing: &mut Vec<String>, removed: &[String], all_cells: &[String]) {
    if removed.is_empty() {
        existing.clear();
        return;
    }
    if existing.is_empty() {
        *existing = all_cells.to_vec();
    }
    existing.retain(|cell| !removed.contains(cell));
}

#[cfg(test)]
mod test {
    use super::*;

    fn cells(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_disable_query_service_all_cells() {
        let mut shard = Shard::new("ks", "-80").unwrap();
        shard.update_disable_query_service(TabletType::Replica, &[], true, &cells(&["z1", "z2"]));

        let control = shard.tablet_control(TabletType::Replica).unwrap();
        assert!(control.disable_query_service);
        assert!(control.cells.is_empty());

        shard.update_disable_query_service(TabletType::Replica, &[], false, &cells(&["z1", "z2"]));
        assert!(shard.tablet_control(TabletType::Replica).is_none());
    }

    #[test]
    fn test_disable_query_service_cell_subset() {
        let all = cells(&["z1", "z2"]);
        let mut shard = Shard::new("ks", "-80").unwrap();

        shard.update_disable_query_service(TabletType::Rdonly, &cells(&["z1"]), true, &all);
        assert_eq!(
            shard.tablet_control(TabletType::Rdonly).unwrap().cells,
            cells(&["z1"])
        );

        // Disabling the remaining cell and then enabling one leaves the other.
        shard.update_disable_query_service(TabletType::Rdonly, &cells(&["z2"]), true, &all);
        shard.update_disable_query_service(TabletType::Rdonly, &cells(&["z1"]), false, &all);
        assert_eq!(
            shard.tablet_control(TabletType::Rdonly).unwrap().cells,
            cells(&["z2"])
        );

        shard.update_disable_query_service(TabletType::Rdonly, &cells(&["z2"]), false, &all);
        assert!(shard.tablet_control(TabletType::Rdonly).is_none());
    }

    #[test]
    fn test_frozen_keeps_control() {
        let mut shard = Shard::new("ks", "0").unwrap();
        shard.update_disable_query_service(TabletType::Primary, &[], true, &[]);
        shard.set_primary_frozen(true);

        let control = shard.tablet_control(TabletType::Primary).unwrap();
        assert!(control.frozen);
        assert!(control.disable_query_service);

        // Un-freezing with query service still disabled keeps the control.
        shard.set_primary_frozen(false);
        assert!(shard.tablet_control(TabletType::Primary).is_some());
    }

    #[test]
    fn test_denied_tables() {
        let all = cells(&["z1"]);
        let mut shard = Shard::new("ks1", "0").unwrap();
        let tables = cells(&["t1", "t2"]);

        shard.update_denied_tables(TabletType::Primary, &[], false, &tables, &all);
        assert_eq!(
            shard.tablet_control(TabletType::Primary).unwrap().denied_tables,
            tables
        );

        shard.update_denied_tables(TabletType::Primary, &[], true, &tables, &all);
        assert!(shard.tablet_control(TabletType::Primary).is_none());
    }
}
