//! Waiting for query traffic to drain off a shard.
//!
//! Drain detection is advisory: QPS hitting zero is one observation, not
//! a guarantee traffic stays away. Callers still hard-quiesce (disable
//! query service and refresh) afterwards.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::select;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Error, Orchestrator};
use crate::config::config;
use crate::healthcheck::{HealthCheck, TabletStats};
use crate::tablet::TabletType;

/// Timing knobs of one drain wait. Defaults come from `[general]`.
#[derive(Debug, Clone)]
pub struct DrainParams {
    /// Delay between drain checks.
    pub retry_delay: Duration,
    /// How often to re-list tablets while waiting for the first one.
    pub healthcheck_topology_refresh: Duration,
    /// Backoff after a healthcheck error.
    pub healthcheck_retry_delay: Duration,
    /// Budget for discovering the first healthy tablet.
    pub healthcheck_timeout: Duration,
    /// Warm-up before the first drain check, so the QPS counters settle.
    pub initial_wait: Duration,
}

impl Default for DrainParams {
    fn default() -> Self {
        let general = &config().general;
        Self {
            retry_delay: Duration::from_millis(general.drain_retry_delay),
            healthcheck_topology_refresh: Duration::from_millis(general.healthcheck_topology_refresh),
            healthcheck_retry_delay: Duration::from_millis(general.healthcheck_retry_delay),
            healthcheck_timeout: Duration::from_millis(general.healthcheck_timeout),
            initial_wait: Duration::from_millis(general.drain_initial_wait),
        }
    }
}

impl Orchestrator {
    /// Block until every healthy tablet of the given type reports zero
    /// QPS in each cell (`None` = all cells), or the context ends.
    pub async fn wait_for_drain(
        &self,
        token: &CancellationToken,
        cells: Option<&[String]>,
        keyspace: &str,
        shard: &str,
        served_type: TabletType,
        params: DrainParams,
    ) -> Result<(), Error> {
        let cells = match cells {
            Some(cells) if !cells.is_empty() => cells.to_vec(),
            _ => self.topo().cells().await?,
        };

        let mut handles = vec![];
        for cell in cells {
            let health = self.health.clone();
            let token = token.clone();
            let keyspace = keyspace.to_string();
            let shard = shard.to_string();
            let params = params.clone();
            handles.push(tokio::spawn(async move {
                wait_for_drain_in_cell(health, &token, &cell, &keyspace, &shard, served_type, params)
                    .await
            }));
        }

        let mut first_error = None;
        for result in join_all(handles).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!("drain wait: {}", err);
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    error!("drain wait task: {}", err);
                    first_error.get_or_insert(Error::Task(err.to_string()));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn wait_for_drain_in_cell(
    health: Arc<dyn HealthCheck>,
    token: &CancellationToken,
    cell: &str,
    keyspace: &str,
    shard: &str,
    served_type: TabletType,
    params: DrainParams,
) -> Result<(), Error> {
    // Discovery: wait for at least one healthy tablet to show up.
    let deadline = Instant::now() + params.healthcheck_timeout;
    loop {
        match health.tablet_stats(cell, keyspace, shard, served_type).await {
            Ok(stats) if stats.iter().any(|s| s.serving) => break,
            Ok(_) => {
                if sleep_or_cancelled(token, params.healthcheck_topology_refresh).await {
                    return Err(Error::Cancelled);
                }
            }
            Err(err) => {
                warn!("healthcheck in cell {}: {}", cell, err);
                if sleep_or_cancelled(token, params.healthcheck_retry_delay).await {
                    return Err(Error::Cancelled);
                }
            }
        }
        if Instant::now() >= deadline {
            return Err(Error::precondition(format!(
                "timed out waiting for healthy {} tablets of {}/{} in cell {}",
                served_type, keyspace, shard, cell
            )));
        }
    }

    // Warm-up, so freshly started QPS counters reflect real traffic.
    if sleep_or_cancelled(token, params.initial_wait).await {
        return Err(Error::Cancelled);
    }

    loop {
        let stats = match health.tablet_stats(cell, keyspace, shard, served_type).await {
            Ok(stats) => stats,
            Err(err) => {
                warn!("healthcheck in cell {}: {}", cell, err);
                if sleep_or_cancelled(token, params.healthcheck_retry_delay).await {
                    return Err(Error::Cancelled);
                }
                continue;
            }
        };

        let healthy = stats.iter().filter(|s| s.serving).count();
        let not_drained: Vec<TabletStats> = stats
            .into_iter()
            .filter(|s| s.serving && s.qps > 0.0)
            .collect();

        if not_drained.is_empty() {
            info!(
                "all {} {} tablets of {}/{} in cell {} drained",
                healthy, served_type, keyspace, shard, cell
            );
            return Ok(());
        }

        if sleep_or_cancelled(token, params.retry_delay).await {
            return Err(Error::NotDrained(describe(&not_drained)));
        }
    }
}

async fn sleep_or_cancelled(token: &CancellationToken, duration: Duration) -> bool {
    select! {
        biased;
        _ = token.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

fn describe(not_drained: &[TabletStats]) -> String {
    not_drained
        .iter()
        .map(|stats| match stats.url() {
            Some(url) => format!("{} ({}, qps={:.1})", stats.alias, url, stats.qps),
            None => format!("{} (qps={:.1})", stats.alias, stats.qps),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
