//! The resharding control plane.
//!
//! An [`Orchestrator`] drives every public operation: initiating clones,
//! migrating served types between overlapping shard sets, moving tables
//! across keyspaces, inspecting and cancelling in-flight resharding, and
//! waiting for traffic to drain. It owns no data itself; all state lives
//! in the topology store and on the tablets, reached through the trait
//! seams so transports can be swapped out.

pub mod cancel;
pub mod clone;
pub mod drain;
pub mod error;
pub mod events;
pub mod overlap;
pub mod positions;
pub mod reverse;
pub mod served_from;
pub mod served_types;

pub use drain::DrainParams;
pub use error::Error;
pub use events::{Event, EventSink, LogSink, RecordingSink};

use std::future::Future;
use std::sync::Arc;

use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::healthcheck::HealthCheck;
use crate::tablet::{TabletManager, TabletType};
use crate::topo::{self, KeyspaceIdType, TopoServer};

/// Race a fallible future against cancellation. Dropping the future at
/// a suspension point aborts the underlying RPC.
pub(crate) async fn with_cancel<T, E, F>(token: &CancellationToken, future: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, E>>,
    Error: From<E>,
{
    select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = future => result.map_err(Error::from),
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    topo: Arc<dyn TopoServer>,
    tablets: Arc<dyn TabletManager>,
    health: Arc<dyn HealthCheck>,
    events: Arc<dyn EventSink>,
}

impl Orchestrator {
    pub fn new(
        topo: Arc<dyn TopoServer>,
        tablets: Arc<dyn TabletManager>,
        health: Arc<dyn HealthCheck>,
    ) -> Self {
        Self {
            topo,
            tablets,
            health,
            events: Arc::new(LogSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn topo(&self) -> &dyn TopoServer {
        self.topo.as_ref()
    }

    pub fn tablets(&self) -> &dyn TabletManager {
        self.tablets.as_ref()
    }

    pub(crate) fn emit(&self, operation: &'static str, keyspace: &str, shard: &str, status: &str) {
        self.events.dispatch(Event {
            operation,
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
            status: status.to_string(),
        });
    }

    /// Set the sharding column of a keyspace. Changing an existing value
    /// requires `force`.
    pub async fn set_keyspace_sharding_info(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        column_name: &str,
        column_type: KeyspaceIdType,
        force: bool,
    ) -> Result<(), Error> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let _lock = self
            .topo
            .lock_keyspace(keyspace, "SetKeyspaceShardingInfo")
            .await?;

        topo::update_keyspace_fields(self.topo.as_ref(), keyspace, |record| {
            let name_changes = !record.sharding_column_name.is_empty()
                && record.sharding_column_name != column_name;
            let type_changes = record.sharding_column_type != KeyspaceIdType::Unset
                && record.sharding_column_type != column_type;
            if (name_changes || type_changes) && !force {
                return Err(topo::Error::condition(format!(
                    "keyspace {} already has sharding info set, use force to override",
                    keyspace
                )));
            }
            record.sharding_column_name = column_name.to_string();
            record.sharding_column_type = column_type;
            Ok(())
        })
        .await?;

        Ok(())
    }

    /// Point (or stop pointing) a tablet type of `keyspace` at
    /// `source_keyspace`. This is how a vertical-split target is stood up
    /// before the clone, and the keyspace half of `migrate_served_from`.
    pub async fn set_keyspace_served_from(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        tablet_type: TabletType,
        cells: &[String],
        source_keyspace: &str,
        remove: bool,
    ) -> Result<(), Error> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let _lock = self
            .topo
            .lock_keyspace(keyspace, "SetKeyspaceServedFrom")
            .await?;

        let all_cells = self.topo.cells().await?;
        topo::update_keyspace_fields(self.topo.as_ref(), keyspace, |record| {
            record.update_served_from(tablet_type, cells, source_keyspace, remove, &all_cells)
        })
        .await?;

        Ok(())
    }

    /// Regenerate the per-cell serving directory from shard records.
    pub async fn rebuild_keyspace_graph(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        cells: Option<&[String]>,
    ) -> Result<(), Error> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let _lock = self
            .topo
            .lock_keyspace(keyspace, "RebuildKeyspaceGraph")
            .await?;
        topo::rebuild_keyspace(self.topo.as_ref(), keyspace, cells).await?;
        Ok(())
    }
}
