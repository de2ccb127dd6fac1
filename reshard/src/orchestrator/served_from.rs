//! Migrating a table set's serving across keyspaces (vertical split).
//!
//! The destination keyspace starts out serving every type from the
//! source keyspace (`ServedFroms`). Type by type, serving moves to the
//! destination: the keyspace record loses the entry, and the source
//! shard denies the moved tables so nothing writes them twice. PRIMARY
//! is last and also tears down the clone stream.

use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{with_cancel, Error, Orchestrator};
use crate::config::config;
use crate::tablet::TabletType;
use crate::topo::{self, Shard, SourceShard};
use crate::vrep::query;

const OPERATION: &str = "MigrateServedFrom";

impl Orchestrator {
    /// Migrate one served type of a vertical-split destination shard to
    /// be served locally. `reverse` sends a non-primary type back to the
    /// source keyspace.
    #[allow(clippy::too_many_arguments)]
    pub async fn migrate_served_from(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        shard: &str,
        served_type: TabletType,
        cells: Option<&[String]>,
        reverse: bool,
        filtered_replication_wait_time: Option<Duration>,
    ) -> Result<(), Error> {
        if served_type.is_primary() {
            if reverse {
                return Err(Error::precondition(
                    "PRIMARY migrations cannot be reversed",
                ));
            }
            if cells.map(|c| !c.is_empty()).unwrap_or(false) {
                return Err(Error::precondition(
                    "PRIMARY migrations apply to all cells at once",
                ));
            }
        }

        // Peek at the destination to learn the source keyspace, then
        // take the locks in source-then-destination order.
        let peek = self.topo().get_shard(keyspace, shard).await?.record;
        let source_keyspace = match peek.source_shards.first() {
            Some(source_shard) => source_shard.keyspace.clone(),
            None => {
                return Err(Error::precondition(format!(
                    "shard {}/{} is not a vertical-split destination",
                    keyspace, shard
                )))
            }
        };

        let _source_lock = self
            .topo()
            .lock_keyspace(&source_keyspace, OPERATION)
            .await?;
        let _destination_lock = self.topo().lock_keyspace(keyspace, OPERATION).await?;

        let destination = self.topo().get_shard(keyspace, shard).await?.record;
        let source_shard = validate_destination(&destination)?.clone();
        let source = self
            .topo()
            .get_shard(&source_shard.keyspace, &source_shard.shard)
            .await?
            .record;

        self.emit(OPERATION, keyspace, shard, "start");
        let wait = filtered_replication_wait_time
            .unwrap_or_else(|| config().general.filtered_replication_wait());

        let result = if served_type.is_primary() {
            self.primary_migrate_served_from(token, &destination, &source, &source_shard, wait)
                .await
        } else {
            self.replica_migrate_served_from(
                token,
                &destination,
                &source,
                &source_shard,
                served_type,
                cells,
                reverse,
            )
            .await
        };

        match &result {
            Ok(()) => self.emit(OPERATION, keyspace, shard, "finished"),
            Err(err) => self.emit(OPERATION, keyspace, shard, &format!("failed: {}", err)),
        }
        result
    }

    /// Non-primary vertical migration: keyspace record, denied tables,
    /// source refresh. Nothing freezes; the stream keeps flowing.
    #[allow(clippy::too_many_arguments)]
    async fn replica_migrate_served_from(
        &self,
        token: &CancellationToken,
        destination: &Shard,
        source: &Shard,
        source_shard: &SourceShard,
        served_type: TabletType,
        cells: Option<&[String]>,
        reverse: bool,
    ) -> Result<(), Error> {
        let all_cells = self.topo().cells().await?;
        let cells = cells.unwrap_or(&[]);

        topo::update_keyspace_fields(self.topo(), &destination.keyspace, |record| {
            record.update_served_from(
                served_type,
                cells,
                &source_shard.keyspace,
                !reverse,
                &all_cells,
            )
        })
        .await?;

        topo::update_shard_fields(self.topo(), &source.keyspace, &source.name, |record| {
            record.update_denied_tables(
                served_type,
                cells,
                reverse,
                &source_shard.tables,
                &all_cells,
            );
            Ok(())
        })
        .await?;

        self.refresh_tablets_by_shard(
            token,
            &source.keyspace,
            &source.name,
            Some(served_type),
            Some(cells),
        )
        .await?;

        Ok(())
    }

    /// Primary vertical cutover: deny writes at the source, catch up,
    /// tear the stream down, flip the keyspace and shard records.
    async fn primary_migrate_served_from(
        &self,
        token: &CancellationToken,
        destination: &Shard,
        source: &Shard,
        source_shard: &SourceShard,
        wait: Duration,
    ) -> Result<(), Error> {
        let all_cells = self.topo().cells().await?;
        let source_primary = source.primary()?.clone();
        let destination_primary = destination.primary()?.clone();

        topo::update_shard_fields(self.topo(), &source.keyspace, &source.name, |record| {
            record.update_denied_tables(
                TabletType::Primary,
                &[],
                false,
                &source_shard.tables,
                &all_cells,
            );
            Ok(())
        })
        .await?;

        // The source stops writing the moved tables here; everything
        // before the gathered position is all there will ever be.
        with_cancel(token, self.tablets().refresh_state(&source_primary)).await?;
        let position =
            with_cancel(token, self.tablets().primary_position(&source_primary)).await?;

        match with_cancel(
            token,
            timeout(
                wait,
                self.tablets().vreplication_wait_for_pos(
                    &destination_primary,
                    source_shard.uid,
                    &position,
                ),
            ),
        )
        .await?
        {
            Ok(()) => {}
            Err(err) => return Err(err.into()),
        }

        let delete = query::delete_stream(source_shard.uid);
        with_cancel(
            token,
            self.tablets().vreplication_exec(&destination_primary, &delete),
        )
        .await?;

        topo::update_keyspace_fields(self.topo(), &destination.keyspace, |record| {
            record.update_served_from(
                TabletType::Primary,
                &[],
                &source_shard.keyspace,
                true,
                &all_cells,
            )
        })
        .await?;

        topo::update_shard_fields(self.topo(), &destination.keyspace, &destination.name, |record| {
            if record.source_shards.len() != 1 {
                return Err(topo::Error::condition(format!(
                    "unexpected concurrent access: shard {} has {} source shards, expected 1",
                    record.id(),
                    record.source_shards.len()
                )));
            }
            record.source_shards.clear();
            Ok(())
        })
        .await?;

        with_cancel(token, self.tablets().refresh_state(&destination_primary)).await?;

        Ok(())
    }
}

/// A vertical-split destination has exactly one source shard with a
/// table list.
fn validate_destination(destination: &Shard) -> Result<&SourceShard, Error> {
    let [source_shard] = destination.source_shards.as_slice() else {
        return Err(Error::Concurrent(format!(
            "shard {} has {} source shards, expected 1",
            destination.id(),
            destination.source_shards.len()
        )));
    };
    if source_shard.tables.is_empty() {
        return Err(Error::precondition(format!(
            "source shard entry on {} has no tables, not a vertical split",
            destination.id()
        )));
    }
    Ok(source_shard)
}
