//! In-process tablet fleet.
//!
//! Stands in for the real tablet-management RPC transport in tests and
//! in local mode. Each simulated tablet keeps its own `_vt.vreplication`
//! rows and a monotonically advancing replication position; the control
//! statements built by [`crate::vrep::query`] are parsed back here.
//! With a persistence directory set, tablet state is written through to
//! JSON files so separate CLI invocations see each other's streams.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::manager::{Error, QueryResult};
use super::{TabletAlias, TabletManager, TabletType};
use crate::vrep::{query, BinlogSource, Position, StreamState};

static INSERT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^insert into _vt\.vreplication \(workflow, source, pos, state, db_name\) values \('([^']*)', '(.*)', '([^']*)', '([^']*)', '([^']*)'\)$",
    )
    .unwrap()
});
static UPDATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^update _vt\.vreplication set state = '(\w+)' where id = (\d+)$").unwrap()
});
static DELETE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^delete from _vt\.vreplication where id = (\d+)$").unwrap());

/// One row of a tablet's `_vt.vreplication` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRow {
    pub id: u32,
    pub workflow: String,
    pub source: BinlogSource,
    pub pos: Position,
    pub state: StreamState,
    pub db_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletState {
    pub alias: TabletAlias,
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: TabletType,
    #[serde(default)]
    clock: u64,
    #[serde(default)]
    next_stream_id: u32,
    #[serde(default)]
    streams: BTreeMap<u32, StreamRow>,
    #[serde(default)]
    refresh_count: u64,
    #[serde(skip, default = "reachable_default")]
    reachable: bool,
}

fn reachable_default() -> bool {
    true
}

#[derive(Clone, Default)]
pub struct LocalTablets {
    tablets: Arc<Mutex<BTreeMap<String, TabletState>>>,
    persist: Option<PathBuf>,
}

impl LocalTablets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fleet backed by JSON files under `dir`.
    pub fn with_persistence(dir: &Path) -> Result<Self, Error> {
        fs::create_dir_all(dir).map_err(|err| Error::Failed(err.to_string()))?;

        let mut tablets = BTreeMap::new();
        let entries = fs::read_dir(dir).map_err(|err| Error::Failed(err.to_string()))?;
        for entry in entries {
            let path = entry.map_err(|err| Error::Failed(err.to_string()))?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let contents =
                    fs::read_to_string(&path).map_err(|err| Error::Failed(err.to_string()))?;
                let state: TabletState =
                    serde_json::from_str(&contents).map_err(|err| Error::Failed(err.to_string()))?;
                tablets.insert(state.alias.to_string(), state);
            }
        }

        Ok(Self {
            tablets: Arc::new(Mutex::new(tablets)),
            persist: Some(dir.to_path_buf()),
        })
    }

    pub fn add_tablet(
        &self,
        alias: &TabletAlias,
        keyspace: &str,
        shard: &str,
        tablet_type: TabletType,
    ) {
        let mut tablets = self.tablets.lock();
        let state = tablets
            .entry(alias.to_string())
            .or_insert_with(|| TabletState {
                alias: alias.clone(),
                keyspace: keyspace.to_string(),
                shard: shard.to_string(),
                tablet_type,
                clock: 0,
                next_stream_id: 0,
                streams: BTreeMap::new(),
                refresh_count: 0,
                reachable: true,
            });
        self.persist(state);
    }

    /// Simulate a network partition towards one tablet.
    pub fn set_reachable(&self, alias: &TabletAlias, reachable: bool) {
        if let Some(state) = self.tablets.lock().get_mut(&alias.to_string()) {
            state.reachable = reachable;
        }
    }

    /// Stream rows currently on a tablet.
    pub fn streams(&self, alias: &TabletAlias) -> Vec<StreamRow> {
        self.tablets
            .lock()
            .get(&alias.to_string())
            .map(|state| state.streams.values().cloned().collect())
            .unwrap_or_default()
    }

    /// How many state refreshes a tablet has received.
    pub fn refresh_count(&self, alias: &TabletAlias) -> u64 {
        self.tablets
            .lock()
            .get(&alias.to_string())
            .map(|state| state.refresh_count)
            .unwrap_or(0)
    }

    fn persist(&self, state: &TabletState) {
        if let Some(dir) = &self.persist {
            let path = dir.join(format!("{}.json", state.alias));
            if let Ok(contents) = serde_json::to_string_pretty(state) {
                let _ = fs::write(path, contents);
            }
        }
    }

    fn with_tablet<T>(
        &self,
        alias: &TabletAlias,
        apply: impl FnOnce(&mut TabletState) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut tablets = self.tablets.lock();
        let state = tablets
            .get_mut(&alias.to_string())
            .ok_or_else(|| Error::NotFound(alias.to_string()))?;
        if !state.reachable {
            return Err(Error::Unreachable(alias.to_string()));
        }
        let result = apply(state)?;
        self.persist(state);
        Ok(result)
    }
}

#[async_trait]
impl TabletManager for LocalTablets {
    async fn ping(&self, alias: &TabletAlias) -> Result<(), Error> {
        self.with_tablet(alias, |_| Ok(()))
    }

    async fn refresh_state(&self, alias: &TabletAlias) -> Result<(), Error> {
        self.with_tablet(alias, |state| {
            state.refresh_count += 1;
            Ok(())
        })
    }

    async fn primary_position(&self, alias: &TabletAlias) -> Result<Position, Error> {
        self.with_tablet(alias, |state| {
            state.clock += 1;
            Ok(Position(format!("{}:{}", state.alias, state.clock)))
        })
    }

    async fn vreplication_exec(
        &self,
        alias: &TabletAlias,
        sql: &str,
    ) -> Result<QueryResult, Error> {
        debug!("vreplication exec on {}: {}", alias, sql);

        self.with_tablet(alias, |state| {
            if let Some(captures) = INSERT.captures(sql) {
                let source: BinlogSource =
                    serde_json::from_str(&unescape(&captures[2])).map_err(|err| {
                        Error::MalformedStatement(format!("bad source: {}", err))
                    })?;
                let stream_state = StreamState::from_str(&captures[4])
                    .map_err(Error::MalformedStatement)?;

                state.next_stream_id += 1;
                let id = state.next_stream_id;
                state.streams.insert(
                    id,
                    StreamRow {
                        id,
                        workflow: unescape(&captures[1]),
                        source,
                        pos: Position(unescape(&captures[3])),
                        state: stream_state,
                        db_name: unescape(&captures[5]),
                    },
                );

                return Ok(QueryResult {
                    rows_affected: 1,
                    insert_id: id as u64,
                    ..Default::default()
                });
            }

            if let Some(captures) = UPDATE.captures(sql) {
                let stream_state = StreamState::from_str(&captures[1])
                    .map_err(Error::MalformedStatement)?;
                let id: u32 = captures[2]
                    .parse()
                    .map_err(|_| Error::MalformedStatement(sql.to_string()))?;

                let rows_affected = match state.streams.get_mut(&id) {
                    Some(row) => {
                        row.state = stream_state;
                        1
                    }
                    None => 0,
                };
                return Ok(QueryResult {
                    rows_affected,
                    ..Default::default()
                });
            }

            if let Some(captures) = DELETE.captures(sql) {
                let id: u32 = captures[1]
                    .parse()
                    .map_err(|_| Error::MalformedStatement(sql.to_string()))?;
                let rows_affected = if state.streams.remove(&id).is_some() {
                    1
                } else {
                    0
                };
                return Ok(QueryResult {
                    rows_affected,
                    ..Default::default()
                });
            }

            if sql == query::select_streams() {
                let rows = state
                    .streams
                    .values()
                    .map(|row| {
                        vec![
                            row.id.to_string(),
                            row.workflow.clone(),
                            serde_json::to_string(&row.source).unwrap_or_default(),
                            row.pos.to_string(),
                            row.state.to_string(),
                            row.db_name.clone(),
                        ]
                    })
                    .collect::<Vec<_>>();
                return Ok(QueryResult {
                    fields: ["id", "workflow", "source", "pos", "state", "db_name"]
                        .iter()
                        .map(|f| f.to_string())
                        .collect(),
                    rows_affected: rows.len() as u64,
                    rows,
                    ..Default::default()
                });
            }

            Err(Error::MalformedStatement(sql.to_string()))
        })
    }

    async fn vreplication_wait_for_pos(
        &self,
        alias: &TabletAlias,
        uid: u32,
        position: &Position,
    ) -> Result<(), Error> {
        self.with_tablet(alias, |state| {
            let row = state
                .streams
                .get_mut(&uid)
                .ok_or_else(|| Error::StreamNotFound {
                    alias: alias.to_string(),
                    uid,
                })?;
            // The simulated stream catches up instantly.
            row.pos = position.clone();
            Ok(())
        })
    }
}

fn unescape(value: &str) -> String {
    value.replace("''", "'")
}
