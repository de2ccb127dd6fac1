//! Parallel fan-outs against shard primaries: replication position
//! gathering, catch-up waits, and state refreshes.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::{with_cancel, Error, Orchestrator};
use crate::tablet::{self, TabletType};
use crate::topo::Shard;
use crate::vrep::Position;

impl Orchestrator {
    /// Current replication position of every shard's primary, keyed by
    /// shard name. All requests run in parallel; any failure fails the
    /// whole gather, with every error logged.
    pub(crate) async fn gather_primary_positions(
        &self,
        token: &CancellationToken,
        shards: &[Shard],
    ) -> Result<HashMap<String, Position>, Error> {
        let mut handles = vec![];
        for shard in shards {
            let tablets = self.tablets.clone();
            let alias = shard.primary()?.clone();
            let name = shard.name.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                let position = with_cancel(&token, tablets.primary_position(&alias)).await?;
                Ok::<_, Error>((name, position))
            }));
        }

        let mut positions = HashMap::new();
        let mut first_error = None;
        for result in join_all(handles).await {
            match result {
                Ok(Ok((name, position))) => {
                    positions.insert(name, position);
                }
                Ok(Err(err)) => {
                    error!("gathering primary position: {}", err);
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    error!("position gather task: {}", err);
                    first_error.get_or_insert(Error::Task(err.to_string()));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(positions),
        }
    }

    /// Block until every destination's inbound streams have applied up to
    /// the corresponding source position, each wait bounded by `wait`.
    ///
    /// A missing stream is treated as already caught up (or torn down)
    /// and skipped.
    pub(crate) async fn wait_for_catchup(
        &self,
        token: &CancellationToken,
        source_positions: &HashMap<String, Position>,
        destinations: &[Shard],
        wait: Duration,
    ) -> Result<(), Error> {
        let mut handles = vec![];
        for destination in destinations {
            let tablets = self.tablets.clone();
            let alias = destination.primary()?.clone();
            let destination = destination.clone();
            let positions = source_positions.clone();
            let token = token.clone();

            handles.push(tokio::spawn(async move {
                for source_shard in &destination.source_shards {
                    let Some(position) = positions.get(&source_shard.shard) else {
                        return Err(Error::precondition(format!(
                            "no position gathered for source shard {}/{}",
                            source_shard.keyspace, source_shard.shard
                        )));
                    };

                    let wait_for_pos = timeout(
                        wait,
                        tablets.vreplication_wait_for_pos(&alias, source_shard.uid, position),
                    );
                    match with_cancel(&token, wait_for_pos).await? {
                        Ok(()) => {}
                        Err(tablet::Error::StreamNotFound { alias, uid }) => {
                            warn!(
                                "stream {} on {} is gone, assuming it already caught up",
                                uid, alias
                            );
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Ok(())
            }));
        }

        join_fanout(handles).await
    }

    /// Refresh the primaries of a set of shards in parallel.
    pub(crate) async fn refresh_shard_primaries(
        &self,
        token: &CancellationToken,
        shards: &[Shard],
    ) -> Result<(), Error> {
        let mut handles = vec![];
        for shard in shards {
            let tablets = self.tablets.clone();
            let alias = shard.primary()?.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                with_cancel(&token, tablets.refresh_state(&alias)).await
            }));
        }
        join_fanout(handles).await
    }

    /// Refresh every tablet of a shard, optionally restricted to one
    /// tablet type and a cell list.
    pub(crate) async fn refresh_tablets_by_shard(
        &self,
        token: &CancellationToken,
        keyspace: &str,
        shard: &str,
        tablet_type: Option<TabletType>,
        cells: Option<&[String]>,
    ) -> Result<(), Error> {
        let tablets = self.topo.list_tablets(keyspace, shard).await?;

        let mut handles = vec![];
        for tablet in tablets {
            if let Some(tablet_type) = tablet_type {
                if tablet.tablet_type != tablet_type {
                    continue;
                }
            }
            if let Some(cells) = cells {
                if !cells.is_empty() && !cells.contains(&tablet.alias.cell) {
                    continue;
                }
            }

            let manager = self.tablets.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                with_cancel(&token, manager.refresh_state(&tablet.alias)).await
            }));
        }
        join_fanout(handles).await
    }
}

/// Join a set of fan-out tasks: log every failure, surface the first.
async fn join_fanout(
    handles: Vec<tokio::task::JoinHandle<Result<(), Error>>>,
) -> Result<(), Error> {
    let mut first_error = None;
    for result in join_all(handles).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!("fan-out call: {}", err);
                first_error.get_or_insert(err);
            }
            Err(err) => {
                error!("fan-out task: {}", err);
                first_error.get_or_insert(Error::Task(err.to_string()));
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::healthcheck::LocalHealthCheck;
    use crate::tablet::{LocalTablets, TabletAlias};
    use crate::topo::MemoryTopo;

    fn orchestrator(fleet: &LocalTablets) -> Orchestrator {
        Orchestrator::new(
            Arc::new(MemoryTopo::new(&["z1"])),
            Arc::new(fleet.clone()),
            Arc::new(LocalHealthCheck::new()),
        )
    }

    fn shard_with_primary(fleet: &LocalTablets, name: &str, uid: u32) -> Shard {
        let alias = TabletAlias::new("z1", uid);
        fleet.add_tablet(&alias, "ks", name, TabletType::Primary);
        let mut shard = Shard::new("ks", name).unwrap();
        shard.primary_alias = Some(alias);
        shard
    }

    #[tokio::test]
    async fn test_gather_positions() {
        let fleet = LocalTablets::new();
        let shards = vec![
            shard_with_primary(&fleet, "-80", 100),
            shard_with_primary(&fleet, "80-", 200),
        ];
        let orchestrator = orchestrator(&fleet);

        let positions = orchestrator
            .gather_primary_positions(&CancellationToken::new(), &shards)
            .await
            .unwrap();
        assert_eq!(positions.len(), 2);
        assert!(positions.contains_key("-80"));
        assert!(positions.contains_key("80-"));
    }

    #[tokio::test]
    async fn test_gather_fails_when_any_primary_down() {
        let fleet = LocalTablets::new();
        let shards = vec![
            shard_with_primary(&fleet, "-80", 100),
            shard_with_primary(&fleet, "80-", 200),
        ];
        fleet.set_reachable(&TabletAlias::new("z1", 200), false);
        let orchestrator = orchestrator(&fleet);

        let result = orchestrator
            .gather_primary_positions(&CancellationToken::new(), &shards)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_gather() {
        let fleet = LocalTablets::new();
        let shards = vec![shard_with_primary(&fleet, "-80", 100)];
        let orchestrator = orchestrator(&fleet);

        let token = CancellationToken::new();
        token.cancel();
        let result = orchestrator.gather_primary_positions(&token, &shards).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
