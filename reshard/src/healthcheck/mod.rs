//! Per-cell tablet health observations.
//!
//! The drain waiter is the only consumer: it needs to know, for a
//! `(cell, keyspace, shard, tablet type)` target, which tablets are
//! healthy and how much query traffic each is still serving.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::tablet::{TabletAlias, TabletType};

#[derive(Debug, Error)]
pub enum Error {
    #[error("healthcheck unavailable in cell {0}: {1}")]
    Unavailable(String, String),
}

/// One tablet's latest health report.
#[derive(Debug, Clone)]
pub struct TabletStats {
    pub alias: TabletAlias,
    pub host: String,
    pub http_port: Option<u16>,
    pub serving: bool,
    pub qps: f64,
}

impl TabletStats {
    pub fn new(alias: &TabletAlias, qps: f64) -> Self {
        Self {
            alias: alias.clone(),
            host: String::new(),
            http_port: None,
            serving: true,
            qps,
        }
    }

    /// Debug URL of the tablet, when the port is known.
    pub fn url(&self) -> Option<String> {
        self.http_port
            .map(|port| format!("http://{}:{}/", self.host, port))
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Latest stats for every tablet matching the target. The backend
    /// refreshes its view of the topology on its own schedule.
    async fn tablet_stats(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
        tablet_type: TabletType,
    ) -> Result<Vec<TabletStats>, Error>;
}

type Target = (String, String, String, TabletType);

/// Healthcheck fed by hand: tests and local mode publish stats directly.
#[derive(Clone, Default)]
pub struct LocalHealthCheck {
    stats: Arc<Mutex<HashMap<Target, Vec<TabletStats>>>>,
}

impl LocalHealthCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stats(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
        tablet_type: TabletType,
        stats: Vec<TabletStats>,
    ) {
        self.stats.lock().insert(
            (
                cell.to_string(),
                keyspace.to_string(),
                shard.to_string(),
                tablet_type,
            ),
            stats,
        );
    }
}

#[async_trait]
impl HealthCheck for LocalHealthCheck {
    async fn tablet_stats(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
        tablet_type: TabletType,
    ) -> Result<Vec<TabletStats>, Error> {
        Ok(self
            .stats
            .lock()
            .get(&(
                cell.to_string(),
                keyspace.to_string(),
                shard.to_string(),
                tablet_type,
            ))
            .cloned()
            .unwrap_or_default())
    }
}
