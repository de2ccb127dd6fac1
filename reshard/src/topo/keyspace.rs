//! The keyspace topology record.

use serde::{Deserialize, Serialize};

use super::Error;
use crate::tablet::TabletType;

/// Type of the sharding column values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyspaceIdType {
    #[default]
    Unset,
    Uint64,
    Bytes,
}

impl std::str::FromStr for KeyspaceIdType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unset" | "" => Ok(KeyspaceIdType::Unset),
            "uint64" => Ok(KeyspaceIdType::Uint64),
            "bytes" => Ok(KeyspaceIdType::Bytes),
            other => Err(Error::condition(format!(
                "unknown keyspace id type: {}",
                other
            ))),
        }
    }
}

/// Serving for a tablet type is provided by another keyspace, per cell.
/// Present only while a vertical split is underway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServedFrom {
    pub tablet_type: TabletType,
    /// Cells still served from the source keyspace. Empty = all cells.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cells: Vec<String>,
    pub keyspace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Keyspace {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sharding_column_name: String,
    #[serde(default)]
    pub sharding_column_type: KeyspaceIdType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub served_froms: Vec<ServedFrom>,
}

impl Keyspace {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// The keyspace is a vertical-split target while any type is still
    /// served from elsewhere.
    pub fn is_served_from(&self) -> bool {
        !self.served_froms.is_empty()
    }

    pub fn served_from(&self, tablet_type: TabletType) -> Option<&ServedFrom> {
        self.served_froms
            .iter()
            .find(|sf| sf.tablet_type == tablet_type)
    }

    /// Move serving for a tablet type between this keyspace and the source
    /// keyspace it is split from.
    ///
    /// `remove = true` takes cells away from the source (the type starts
    /// being served locally); `remove = false` gives them back (reverse
    /// migration). PRIMARY is all-or-nothing: its entry is dropped whole.
    pub fn update_served_from(
        &mut self,
        tablet_type: TabletType,
        cells: &[String],
        source_keyspace: &str,
        remove: bool,
        all_cells: &[String],
    ) -> Result<(), Error> {
        let position = self
            .served_froms
            .iter()
            .position(|sf| sf.tablet_type == tablet_type);

        if remove {
            let Some(position) = position else {
                return Err(Error::condition(format!(
                    "keyspace {} does not serve {} from another keyspace",
                    self.name, tablet_type
                )));
            };
            let entry = &mut self.served_froms[position];
            if entry.keyspace != source_keyspace {
                return Err(Error::condition(format!(
                    "keyspace {} serves {} from {}, not {}",
                    self.name, tablet_type, entry.keyspace, source_keyspace
                )));
            }

            if tablet_type.is_primary() || cells.is_empty() {
                self.served_froms.remove(position);
                return Ok(());
            }

            if entry.cells.is_empty() {
                entry.cells = all_cells.to_vec();
            }
            entry.cells.retain(|cell| !cells.contains(cell));
            if entry.cells.is_empty() {
                self.served_froms.remove(position);
            }
            return Ok(());
        }

        match position {
            Some(position) => {
                let entry = &mut self.served_froms[position];
                if entry.keyspace != source_keyspace {
                    return Err(Error::condition(format!(
                        "keyspace {} already serves {} from {}",
                        self.name, tablet_type, entry.keyspace
                    )));
                }
                if entry.cells.is_empty() || cells.is_empty() {
                    entry.cells.clear();
                } else {
                    for cell in cells {
                        if !entry.cells.contains(cell) {
                            entry.cells.push(cell.clone());
                        }
                    }
                    entry.cells.sort();
                }
            }
            None => self.served_froms.push(ServedFrom {
                tablet_type,
                cells: cells.to_vec(),
                keyspace: source_keyspace.to_string(),
            }),
        }

        Ok(())
    }
}
