use serde::{Deserialize, Serialize};

use crate::topo::KeyRange;

/// Where a VReplication stream pulls changes from, and which subset
/// of them it applies.
///
/// Exactly one kind of filter is populated: a key range for horizontal
/// clones and reverse streams, a table list for vertical clones. The
/// `rule` holds the match-all table expression used by horizontal clones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinlogSource {
    pub keyspace: String,
    pub shard: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_range: Option<KeyRange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

impl BinlogSource {
    /// Source for a horizontal clone: all tables, rows restricted to
    /// the destination's key range.
    pub fn for_key_range(keyspace: &str, shard: &str, key_range: Option<KeyRange>) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
            key_range,
            tables: vec![],
            rule: Some("/.*".to_string()),
        }
    }

    /// Source for a vertical clone: an explicit table list.
    pub fn for_tables(keyspace: &str, shard: &str, tables: &[String]) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
            key_range: None,
            tables: tables.to_vec(),
            rule: None,
        }
    }

    /// Source for a reverse stream created at primary cutover: changes
    /// flowing destination to source, filtered to the (old) source's own
    /// key range. Unsharded sources take no range.
    pub fn for_reverse(keyspace: &str, shard: &str, key_range: Option<KeyRange>) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
            key_range,
            tables: vec![],
            rule: None,
        }
    }
}
