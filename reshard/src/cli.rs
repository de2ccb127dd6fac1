use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal::ctrl_c;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{self, Config};
use crate::healthcheck::{LocalHealthCheck, TabletStats};
use crate::orchestrator::{DrainParams, Orchestrator};
use crate::tablet::{LocalTablets, TabletAlias, TabletType};
use crate::topo::key_range::or_complete;
use crate::topo::{self, FileTopo, Keyspace, KeyspaceIdType, Shard, TabletRecord, TopoServer};

/// reshard moves serving responsibility for key ranges and tables
/// between database shards, without losing writes.
#[derive(Parser, Debug)]
#[command(name = "reshard", version)]
pub struct Cli {
    /// Path to the configuration file. Default: "reshard.toml"
    #[arg(short, long, default_value = "reshard.toml")]
    pub config: PathBuf,
    /// Subcommand.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Seed the topology from the configured local tablet fleet.
    Init,

    /// Check the configuration file.
    Configcheck,

    /// Set the sharding column of a keyspace.
    SetKeyspaceShardingInfo {
        keyspace: String,
        column_name: String,
        /// "uint64" or "bytes".
        column_type: String,
        /// Overwrite existing sharding info.
        #[arg(long)]
        force: bool,
    },

    /// Point a tablet type of a keyspace at another keyspace, or stop
    /// doing so with --remove.
    SetKeyspaceServedFrom {
        keyspace: String,
        served_type: String,
        source_keyspace: String,
        #[arg(long)]
        cells: Vec<String>,
        #[arg(long)]
        remove: bool,
    },

    /// Regenerate the per-cell serving directory of a keyspace.
    RebuildKeyspaceGraph {
        keyspace: String,
        #[arg(long)]
        cells: Vec<String>,
    },

    /// Start a horizontal clone from source shards to destination shards.
    SplitClone {
        keyspace: String,
        #[arg(long, required = true, num_args = 1..)]
        from: Vec<String>,
        #[arg(long, required = true, num_args = 1..)]
        to: Vec<String>,
    },

    /// Start a vertical clone of a table set into another keyspace.
    VerticalSplitClone {
        from_keyspace: String,
        to_keyspace: String,
        #[arg(long, required = true, num_args = 1..)]
        tables: Vec<String>,
    },

    /// Print the state of an in-flight resharding.
    ShowResharding {
        /// "keyspace/shard".
        shard: String,
    },

    /// Tear down an in-flight resharding that has not migrated serving.
    CancelResharding {
        /// "keyspace/shard".
        shard: String,
    },

    /// Migrate one served type between the overlapping sides of a shard.
    MigrateServedTypes {
        /// "keyspace/shard".
        shard: String,
        served_type: String,
        #[arg(long)]
        cells: Vec<String>,
        #[arg(long)]
        reverse: bool,
        #[arg(long)]
        skip_refresh_state: bool,
        /// Catch-up budget for the primary cutover, ms.
        #[arg(long)]
        filtered_replication_wait_time: Option<u64>,
        /// Start the reverse streams after a PRIMARY cutover.
        #[arg(long)]
        reverse_replication: bool,
    },

    /// Migrate one served type of a vertical-split destination.
    MigrateServedFrom {
        /// "keyspace/shard".
        shard: String,
        served_type: String,
        #[arg(long)]
        cells: Vec<String>,
        #[arg(long)]
        reverse: bool,
        /// Catch-up budget for the primary cutover, ms.
        #[arg(long)]
        filtered_replication_wait_time: Option<u64>,
    },

    /// Block until all healthy tablets of a type report zero QPS.
    WaitForDrain {
        /// "keyspace/shard".
        shard: String,
        served_type: String,
        #[arg(long)]
        cells: Vec<String>,
        #[arg(long)]
        retry_delay: Option<u64>,
        #[arg(long)]
        healthcheck_topology_refresh: Option<u64>,
        #[arg(long)]
        healthcheck_retry_delay: Option<u64>,
        #[arg(long)]
        healthcheck_timeout: Option<u64>,
        #[arg(long)]
        initial_wait: Option<u64>,
    },
}

/// Confirm that the configuration file is valid.
pub fn config_check(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    toml::from_str::<Config>(&contents)?;
    Ok(())
}

/// Run one subcommand against the configured topology and fleet.
pub async fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    let config = config::config();

    let topo = Arc::new(FileTopo::open(
        &config.topology.root,
        &config.topology.cells,
    )?);
    let tablets = Arc::new(LocalTablets::with_persistence(
        &config.topology.root.join("tablet-state"),
    )?);
    let health = Arc::new(LocalHealthCheck::new());
    seed_fleet(&config, &tablets, &health);

    let orchestrator = Orchestrator::new(topo.clone(), tablets, health);

    // Ctrl-c cancels outstanding RPCs and fails the operation.
    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            let _ = ctrl_c().await;
            token.cancel();
        });
    }

    match command {
        Commands::Init => init(topo.as_ref(), &orchestrator, &token, &config).await?,

        // Handled before the runtime starts; nothing to do here.
        Commands::Configcheck => {}

        Commands::SetKeyspaceShardingInfo {
            keyspace,
            column_name,
            column_type,
            force,
        } => {
            let column_type: KeyspaceIdType = column_type.parse()?;
            orchestrator
                .set_keyspace_sharding_info(&token, &keyspace, &column_name, column_type, force)
                .await?;
        }

        Commands::SetKeyspaceServedFrom {
            keyspace,
            served_type,
            source_keyspace,
            cells,
            remove,
        } => {
            let served_type: TabletType = served_type.parse()?;
            orchestrator
                .set_keyspace_served_from(
                    &token,
                    &keyspace,
                    served_type,
                    &cells,
                    &source_keyspace,
                    remove,
                )
                .await?;
        }

        Commands::RebuildKeyspaceGraph { keyspace, cells } => {
            orchestrator
                .rebuild_keyspace_graph(&token, &keyspace, cells_arg(&cells))
                .await?;
        }

        Commands::SplitClone { keyspace, from, to } => {
            orchestrator.split_clone(&token, &keyspace, &from, &to).await?;
        }

        Commands::VerticalSplitClone {
            from_keyspace,
            to_keyspace,
            tables,
        } => {
            orchestrator
                .vertical_split_clone(&token, &from_keyspace, &to_keyspace, &tables)
                .await?;
        }

        Commands::ShowResharding { shard } => {
            let (keyspace, shard) = shard_spec(&shard)?;
            let report = orchestrator.show_resharding(&token, &keyspace, &shard).await?;
            println!("{}", report);
        }

        Commands::CancelResharding { shard } => {
            let (keyspace, shard) = shard_spec(&shard)?;
            orchestrator.cancel_resharding(&token, &keyspace, &shard).await?;
        }

        Commands::MigrateServedTypes {
            shard,
            served_type,
            cells,
            reverse,
            skip_refresh_state,
            filtered_replication_wait_time,
            reverse_replication,
        } => {
            let (keyspace, shard) = shard_spec(&shard)?;
            let served_type: TabletType = served_type.parse()?;
            orchestrator
                .migrate_served_types(
                    &token,
                    &keyspace,
                    &shard,
                    cells_arg(&cells),
                    served_type,
                    reverse,
                    skip_refresh_state,
                    filtered_replication_wait_time.map(Duration::from_millis),
                    reverse_replication,
                )
                .await?;
        }

        Commands::MigrateServedFrom {
            shard,
            served_type,
            cells,
            reverse,
            filtered_replication_wait_time,
        } => {
            let (keyspace, shard) = shard_spec(&shard)?;
            let served_type: TabletType = served_type.parse()?;
            orchestrator
                .migrate_served_from(
                    &token,
                    &keyspace,
                    &shard,
                    served_type,
                    cells_arg(&cells),
                    reverse,
                    filtered_replication_wait_time.map(Duration::from_millis),
                )
                .await?;
        }

        Commands::WaitForDrain {
            shard,
            served_type,
            cells,
            retry_delay,
            healthcheck_topology_refresh,
            healthcheck_retry_delay,
            healthcheck_timeout,
            initial_wait,
        } => {
            let (keyspace, shard) = shard_spec(&shard)?;
            let served_type: TabletType = served_type.parse()?;

            let mut params = DrainParams::default();
            if let Some(ms) = retry_delay {
                params.retry_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = healthcheck_topology_refresh {
                params.healthcheck_topology_refresh = Duration::from_millis(ms);
            }
            if let Some(ms) = healthcheck_retry_delay {
                params.healthcheck_retry_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = healthcheck_timeout {
                params.healthcheck_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = initial_wait {
                params.initial_wait = Duration::from_millis(ms);
            }

            orchestrator
                .wait_for_drain(&token, cells_arg(&cells), &keyspace, &shard, served_type, params)
                .await?;
        }
    }

    Ok(())
}

/// Create keyspaces, shards and tablet records for the configured fleet.
async fn init(
    topo: &dyn TopoServer,
    orchestrator: &Orchestrator,
    token: &CancellationToken,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut keyspaces = BTreeSet::new();

    for tablet in &config.tablets {
        keyspaces.insert(tablet.keyspace.clone());

        match topo.create_keyspace(&Keyspace::new(&tablet.keyspace)).await {
            Ok(()) | Err(topo::Error::AlreadyExists(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let missing = matches!(
            topo.get_shard(&tablet.keyspace, &tablet.shard).await,
            Err(topo::Error::ShardNotFound(_, _))
        );
        if missing {
            let mut shard = Shard::new(&tablet.keyspace, &tablet.shard)?;
            // A new shard starts out serving unless an existing shard
            // already covers its range (then it's a resharding target).
            let existing = topo.list_shards(&tablet.keyspace).await?;
            let mut covered = false;
            for name in &existing {
                let other = topo.get_shard(&tablet.keyspace, name).await?.record;
                if or_complete(&other.key_range).intersects(&or_complete(&shard.key_range)) {
                    covered = true;
                    break;
                }
            }
            shard.is_primary_serving = !covered;
            topo.create_shard(&shard).await?;
        }

        let alias = TabletAlias::new(&tablet.cell, tablet.uid);
        topo.upsert_tablet(&TabletRecord {
            alias: alias.clone(),
            keyspace: tablet.keyspace.clone(),
            shard: tablet.shard.clone(),
            tablet_type: tablet.tablet_type,
            host: tablet.host.clone(),
            http_port: tablet.http_port,
        })
        .await?;

        if tablet.tablet_type.is_primary() {
            topo::update_shard_fields(topo, &tablet.keyspace, &tablet.shard, |record| {
                record.primary_alias = Some(alias.clone());
                Ok(())
            })
            .await?;
        }
    }

    for keyspace in &keyspaces {
        orchestrator
            .rebuild_keyspace_graph(token, keyspace, None)
            .await?;
        info!("initialized keyspace {}", keyspace);
    }

    Ok(())
}

/// Register the configured tablets with the in-process fleet and publish
/// idle health stats for them.
fn seed_fleet(config: &Config, tablets: &LocalTablets, health: &LocalHealthCheck) {
    let mut targets: HashMap<(String, String, String, TabletType), Vec<TabletStats>> =
        HashMap::new();

    for tablet in &config.tablets {
        let alias = TabletAlias::new(&tablet.cell, tablet.uid);
        tablets.add_tablet(&alias, &tablet.keyspace, &tablet.shard, tablet.tablet_type);

        let mut stats = TabletStats::new(&alias, 0.0);
        stats.host = tablet.host.clone();
        stats.http_port = tablet.http_port;
        targets
            .entry((
                tablet.cell.clone(),
                tablet.keyspace.clone(),
                tablet.shard.clone(),
                tablet.tablet_type,
            ))
            .or_default()
            .push(stats);
    }

    for ((cell, keyspace, shard, tablet_type), stats) in targets {
        health.set_stats(&cell, &keyspace, &shard, tablet_type, stats);
    }
}

fn cells_arg(cells: &[String]) -> Option<&[String]> {
    if cells.is_empty() {
        None
    } else {
        Some(cells)
    }
}

fn shard_spec(spec: &str) -> Result<(String, String), Box<dyn std::error::Error>> {
    match spec.split_once('/') {
        Some((keyspace, shard)) if !keyspace.is_empty() && !shard.is_empty() => {
            Ok((keyspace.to_string(), shard.to_string()))
        }
        _ => Err(format!("expected keyspace/shard, got \"{}\"", spec).into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_shard_spec() {
        assert_eq!(
            shard_spec("ks/-80").unwrap(),
            ("ks".to_string(), "-80".to_string())
        );
        assert!(shard_spec("ks").is_err());
        assert!(shard_spec("/0").is_err());
    }
}
