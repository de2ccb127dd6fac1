//! Inspecting and tearing down in-flight resharding.

use std::fmt::Write as _;

use chrono::Local;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::overlap::{overlapping_shards_for, resolve_migration_sides};
use super::{with_cancel, Error, Orchestrator};
use crate::topo::key_range::or_complete;
use crate::topo::{self, Shard};
use crate::util::format_time;
use crate::vrep::query;

impl Orchestrator {
    /// Human-readable report of a resharding: both sides' shard records
    /// and the active VReplication rows on each destination primary.
    pub async fn show_resharding(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        shard: &str,
    ) -> Result<String, Error> {
        let names = self.topo().list_shards(keyspace).await?;
        let shards = topo::get_shards(self.topo(), keyspace, &names).await?;
        let group = overlapping_shards_for(&shards, keyspace, shard)?;
        let sides = resolve_migration_sides(group)?;

        let mut report = String::new();
        let _ = writeln!(
            report,
            "resharding in keyspace {} as of {}",
            keyspace,
            format_time(Local::now())
        );

        let _ = writeln!(report, "source shards:");
        for source in &sides.sources {
            let _ = writeln!(report, "  {}", source.id());
            let _ = writeln!(report, "{}", indent(&record_json(source), 4));
        }

        let _ = writeln!(report, "destination shards:");
        for destination in &sides.destinations {
            let _ = writeln!(report, "  {}", destination.id());
            let _ = writeln!(report, "{}", indent(&record_json(destination), 4));

            let rows = with_cancel(
                token,
                self.tablets()
                    .vreplication_exec(destination.primary()?, query::select_streams()),
            )
            .await?;
            if rows.rows.is_empty() {
                let _ = writeln!(report, "    no vreplication streams");
            }
            for row in rows.rows {
                let _ = writeln!(report, "    vreplication: {}", row.join(" | "));
            }
        }

        Ok(report)
    }

    /// Abort a resharding that has not migrated any serving yet. Clears
    /// the destinations' source shards and tablet controls and deletes
    /// their inbound streams; sources are untouched.
    pub async fn cancel_resharding(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        shard: &str,
    ) -> Result<(), Error> {
        let record = self.topo().get_shard(keyspace, shard).await?.record;
        let vertical = record
            .source_shards
            .first()
            .map(|source_shard| source_shard.keyspace != keyspace)
            .unwrap_or(false);

        if vertical {
            self.cancel_vertical_resharding(token, &record).await
        } else {
            self.cancel_horizontal_resharding(token, keyspace, shard)
                .await
        }
    }

    async fn cancel_horizontal_resharding(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        shard: &str,
    ) -> Result<(), Error> {
        let _lock = self.topo().lock_keyspace(keyspace, "CancelResharding").await?;

        let names = self.topo().list_shards(keyspace).await?;
        let shards = topo::get_shards(self.topo(), keyspace, &names).await?;
        let group = overlapping_shards_for(&shards, keyspace, shard)?;
        let sides = resolve_migration_sides(group)?;

        self.ensure_nothing_migrated(keyspace, &sides.destinations)
            .await?;

        for destination in &sides.destinations {
            let primary = destination.primary()?;
            for source_shard in &destination.source_shards {
                let delete = query::delete_stream(source_shard.uid);
                with_cancel(token, self.tablets().vreplication_exec(primary, &delete)).await?;
            }

            topo::update_shard_fields(self.topo(), keyspace, &destination.name, |record| {
                record.source_shards.clear();
                record.tablet_controls.clear();
                Ok(())
            })
            .await?;
        }

        self.refresh_shard_primaries(token, &sides.destinations)
            .await?;

        info!(
            "cancelled resharding in {} towards [{}]",
            keyspace,
            sides
                .destinations
                .iter()
                .map(|s| s.name.clone())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(())
    }

    /// Abort a vertical split before any serving migrated: the source
    /// shard must carry no tablet controls yet.
    async fn cancel_vertical_resharding(
        &self,
        token: &CancellationToken,
        destination: &Shard,
    ) -> Result<(), Error> {
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

        let _source_lock = self
            .topo()
            .lock_keyspace(&source_shard.keyspace, "CancelResharding")
            .await?;
        let _destination_lock = self
            .topo()
            .lock_keyspace(&destination.keyspace, "CancelResharding")
            .await?;

        let source = self
            .topo()
            .get_shard(&source_shard.keyspace, &source_shard.shard)
            .await?
            .record;
        if !source.tablet_controls.is_empty() {
            return Err(Error::precondition(format!(
                "source shard {} already has tablet controls, migration has started",
                source.id()
            )));
        }

        let primary = destination.primary()?;
        let delete = query::delete_stream(source_shard.uid);
        with_cancel(token, self.tablets().vreplication_exec(primary, &delete)).await?;

        topo::update_shard_fields(
            self.topo(),
            &destination.keyspace,
            &destination.name,
            |record| {
                if record.source_shards.len() != 1 {
                    return Err(topo::Error::condition(format!(
                        "unexpected concurrent access: shard {} has {} source shards",
                        record.id(),
                        record.source_shards.len()
                    )));
                }
                record.source_shards.clear();
                Ok(())
            },
        )
        .await?;

        with_cancel(token, self.tablets().refresh_state(primary)).await?;

        Ok(())
    }

    /// Refuse the cancel if any cell's serving directory already lists a
    /// destination shard for any type.
    async fn ensure_nothing_migrated(
        &self,
        keyspace: &str,
        destinations: &[Shard],
    ) -> Result<(), Error> {
        for cell in self.topo().cells().await? {
            let srv = self.topo().get_srv_keyspace(&cell, keyspace).await?;
            for partition in &srv.partitions {
                for reference in &partition.shard_references {
                    let migrated = destinations.iter().any(|destination| {
                        or_complete(&destination.key_range) == or_complete(&reference.key_range)
                    });
                    if migrated {
                        return Err(Error::precondition(format!(
                            "cannot cancel: {} serving in cell {} already migrated to shard {}",
                            partition.served_type, cell, reference.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn record_json(shard: &Shard) -> String {
    serde_json::to_string_pretty(shard).unwrap_or_else(|_| shard.id())
}

fn indent(text: &str, spaces: usize) -> String {
    let pad = " ".repeat(spaces);
    text.lines()
        .map(|line| format!("{}{}", pad, line))
        .collect::<Vec<_>>()
        .join("\n")
}
