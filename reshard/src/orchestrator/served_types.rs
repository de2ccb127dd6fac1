//! Migrating serving responsibility between overlapping shard sets.
//!
//! REPLICA and RDONLY move first, cell by cell if desired, and can move
//! back. PRIMARY moves last, once, through a two-phase cutover: quiesce
//! the sources and let the destinations catch up, then flip the serving
//! directory. Failures before the freeze are compensated by re-enabling
//! the sources; afterwards the migration only rolls forward.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::overlap::{overlapping_shards_for, resolve_migration_sides, MigrationSides};
use super::{with_cancel, Error, Orchestrator};
use crate::config::config;
use crate::tablet::TabletType;
use crate::topo::key_range::or_complete;
use crate::topo::{self, Shard};
use crate::util::human_duration;
use crate::vrep::query;

const OPERATION: &str = "MigrateServedTypes";

impl Orchestrator {
    /// Migrate one served type between the overlapping sides of `shard`'s
    /// group.
    ///
    /// PRIMARY migrations take no cells, cannot be reversed and cannot
    /// skip the refresh; `reverse_replication` controls whether the
    /// reverse streams created at cutover are started.
    #[allow(clippy::too_many_arguments)]
    pub async fn migrate_served_types(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        shard: &str,
        cells: Option<&[String]>,
        served_type: TabletType,
        reverse: bool,
        skip_refresh_state: bool,
        filtered_replication_wait_time: Option<Duration>,
        reverse_replication: bool,
    ) -> Result<(), Error> {
        if served_type.is_primary() {
            if cells.map(|c| !c.is_empty()).unwrap_or(false) {
                return Err(Error::precondition(
                    "PRIMARY migrations apply to all cells at once",
                ));
            }
            if reverse {
                return Err(Error::precondition("PRIMARY migrations cannot be reversed"));
            }
            if skip_refresh_state {
                return Err(Error::precondition(
                    "PRIMARY migrations cannot skip the state refresh",
                ));
            }
        }

        let _lock = self.topo().lock_keyspace(keyspace, OPERATION).await?;

        let names = self.topo().list_shards(keyspace).await?;
        let shards = topo::get_shards(self.topo(), keyspace, &names).await?;
        let group = overlapping_shards_for(&shards, keyspace, shard)?;
        let sides = resolve_migration_sides(group)?;

        self.emit(OPERATION, keyspace, shard, "start");
        let wait = filtered_replication_wait_time
            .unwrap_or_else(|| config().general.filtered_replication_wait());

        let result = if served_type.is_primary() {
            self.primary_migrate_served_type(token, keyspace, shard, &sides, wait, reverse_replication)
                .await
        } else {
            self.replica_migrate_served_type(token, keyspace, &sides, cells, served_type, reverse)
                .await
        };

        if let Err(err) = result {
            self.emit(OPERATION, keyspace, shard, &format!("failed: {}", err));
            return Err(err);
        }
        self.emit(OPERATION, keyspace, shard, "finished");

        // Give in-flight queries a chance to drain off the disabled side
        // before telling its tablets to re-read the shard record.
        if !served_type.is_primary() && !skip_refresh_state {
            let sleep = config().general.drain_sleep(served_type);
            info!(
                "waiting {} for {} traffic to drain",
                human_duration(sleep),
                served_type
            );
            select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(sleep) => {}
            }

            let disabled = if reverse {
                &sides.destinations
            } else {
                &sides.sources
            };
            for shard in disabled {
                self.refresh_tablets_by_shard(
                    token,
                    keyspace,
                    &shard.name,
                    Some(served_type),
                    cells,
                )
                .await?;
            }
        }

        Ok(())
    }

    /// REPLICA/RDONLY serving swap: flip the query-service controls, then
    /// commit the serving directory.
    async fn replica_migrate_served_type(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        sides: &MigrationSides,
        cells: Option<&[String]>,
        served_type: TabletType,
        reverse: bool,
    ) -> Result<(), Error> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (from, to) = if reverse {
            (&sides.destinations, &sides.sources)
        } else {
            (&sides.sources, &sides.destinations)
        };

        let all_cells = self.topo().cells().await?;
        let cells = cells.unwrap_or(&[]);

        for shard in from {
            topo::update_shard_fields(self.topo(), keyspace, &shard.name, |record| {
                record.update_disable_query_service(served_type, cells, true, &all_cells);
                Ok(())
            })
            .await?;
        }
        for shard in to {
            topo::update_shard_fields(self.topo(), keyspace, &shard.name, |record| {
                record.update_disable_query_service(served_type, cells, false, &all_cells);
                Ok(())
            })
            .await?;
        }

        topo::migrate_served_type(self.topo(), keyspace, to, from, served_type, Some(cells)).await?;

        info!(
            "migrated {} serving from [{}] to [{}]",
            served_type,
            shard_names(from).join(", "),
            shard_names(to).join(", ")
        );

        Ok(())
    }

    /// The primary cutover state machine.
    async fn primary_migrate_served_type(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        shard: &str,
        sides: &MigrationSides,
        wait: Duration,
        reverse_replication: bool,
    ) -> Result<(), Error> {
        let MigrationSides {
            sources,
            destinations,
        } = sides;

        self.ensure_non_primary_migrated(keyspace, sources).await?;

        // Phase 1: quiesce the sources and let destinations catch up.
        // Anything that goes wrong here is compensated by re-enabling the
        // source primaries.
        if let Err(err) = self
            .quiesce_and_catch_up(token, keyspace, shard, sources, destinations, wait)
            .await
        {
            self.cancel_primary_migration(token, keyspace, sources).await;
            return Err(err);
        }

        // Phase 2: the sources are frozen; from here the migration only
        // rolls forward, except for a reverse-wiring failure which still
        // unfreezes and backs out.
        self.emit(OPERATION, keyspace, shard, "setting up reverse replication");
        let reverse_streams = match self
            .setup_reverse_replication(token, keyspace, sources, destinations)
            .await
        {
            Ok(streams) => streams,
            Err(err) => {
                for source in sources {
                    let unfrozen =
                        topo::update_shard_fields(self.topo(), keyspace, &source.name, |record| {
                            record.set_primary_frozen(false);
                            Ok(())
                        })
                        .await;
                    if let Err(unfreeze_err) = unfrozen {
                        error!("unfreezing {}/{}: {}", keyspace, source.name, unfreeze_err);
                    }
                }
                self.cancel_primary_migration(token, keyspace, sources).await;
                return Err(err);
            }
        };

        self.emit(OPERATION, keyspace, shard, "activating destination shards");
        let all_cells = self.topo().cells().await?;
        for destination in destinations {
            topo::update_shard_fields(self.topo(), keyspace, &destination.name, |record| {
                record.update_disable_query_service(TabletType::Primary, &[], false, &all_cells);
                Ok(())
            })
            .await?;
        }

        for destination in destinations {
            let primary = destination.primary()?;
            for source_shard in &destination.source_shards {
                let delete = query::delete_stream(source_shard.uid);
                with_cancel(token, self.tablets().vreplication_exec(primary, &delete)).await?;
            }
            topo::update_shard_fields(self.topo(), keyspace, &destination.name, |record| {
                record.source_shards.clear();
                record.is_primary_serving = true;
                Ok(())
            })
            .await?;
        }

        self.refresh_shard_primaries(token, destinations).await?;

        self.emit(OPERATION, keyspace, shard, "migrating serving directory");
        topo::migrate_served_type(
            self.topo(),
            keyspace,
            destinations,
            sources,
            TabletType::Primary,
            None,
        )
        .await?;

        for source in sources {
            topo::update_shard_fields(self.topo(), keyspace, &source.name, |record| {
                record.is_primary_serving = false;
                Ok(())
            })
            .await?;
        }

        if reverse_replication {
            self.emit(OPERATION, keyspace, shard, "starting reverse replication");
            self.start_reverse_replication(token, sources, &reverse_streams)
                .await?;
            for source in sources {
                topo::update_shard_fields(self.topo(), keyspace, &source.name, |record| {
                    record.set_primary_frozen(false);
                    Ok(())
                })
                .await?;
            }
        }

        self.refresh_shard_primaries(token, destinations).await?;

        Ok(())
    }

    /// Fail unless REPLICA and RDONLY serving already left every source.
    async fn ensure_non_primary_migrated(
        &self,
        keyspace: &str,
        sources: &[Shard],
    ) -> Result<(), Error> {
        let mut still_served = BTreeSet::new();
        for cell in self.topo().cells().await? {
            let srv = self.topo().get_srv_keyspace(&cell, keyspace).await?;
            for partition in &srv.partitions {
                if partition.served_type.is_primary() {
                    continue;
                }
                for reference in &partition.shard_references {
                    let matches_source = sources.iter().any(|source| {
                        or_complete(&source.key_range) == or_complete(&reference.key_range)
                    });
                    if matches_source {
                        still_served.insert(partition.served_type.to_string());
                    }
                }
            }
        }

        if still_served.is_empty() {
            return Ok(());
        }
        Err(Error::MigrateNonPrimaryFirst(
            still_served.into_iter().collect::<Vec<_>>().join(", "),
        ))
    }

    /// Phase 1 of the primary cutover, through the freeze.
    async fn quiesce_and_catch_up(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        shard: &str,
        sources: &[Shard],
        destinations: &[Shard],
        wait: Duration,
    ) -> Result<(), Error> {
        let mut all: Vec<Shard> = sources.to_vec();
        all.extend(destinations.iter().cloned());
        self.refresh_shard_primaries(token, &all).await?;

        self.emit(OPERATION, keyspace, shard, "disabling query service on source shards");
        for source in sources {
            topo::update_shard_fields(self.topo(), keyspace, &source.name, |record| {
                record.update_disable_query_service(TabletType::Primary, &[], true, &[]);
                Ok(())
            })
            .await?;
        }
        self.refresh_shard_primaries(token, sources).await?;

        self.emit(OPERATION, keyspace, shard, "waiting for destinations to catch up");
        let positions = self.gather_primary_positions(token, sources).await?;
        self.wait_for_catchup(token, &positions, destinations, wait)
            .await?;

        // Point of no return.
        for source in sources {
            topo::update_shard_fields(self.topo(), keyspace, &source.name, |record| {
                record.set_primary_frozen(true);
                Ok(())
            })
            .await?;
        }

        Ok(())
    }

    /// Compensating action for a failed phase 1: put the source primaries
    /// back in service. Best effort; errors are logged, never returned,
    /// so they cannot mask the failure that got us here.
    async fn cancel_primary_migration(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        sources: &[Shard],
    ) {
        warn!("backing out of primary migration for {}", keyspace);

        for source in sources {
            let restored =
                topo::update_shard_fields(self.topo(), keyspace, &source.name, |record| {
                    record.update_disable_query_service(TabletType::Primary, &[], false, &[]);
                    Ok(())
                })
                .await;
            if let Err(err) = restored {
                error!(
                    "re-enabling query service on {}/{}: {}",
                    keyspace, source.name, err
                );
            }
        }

        if let Err(err) = self.refresh_shard_primaries(token, sources).await {
            error!("refreshing source primaries during back-out: {}", err);
        }
    }
}

fn shard_names(shards: &[Shard]) -> Vec<String> {
    shards.iter().map(|s| s.name.clone()).collect()
}
