//! reshard, a resharding control plane for sharded database clusters.
//!
//! The interesting work happens in [`orchestrator`]: migrating serving
//! responsibility for a key range or a table set from source shards to
//! destination shards, on top of a consistent topology store ([`topo`]),
//! a tablet-management RPC client ([`tablet`]) and a CDC control plane
//! ([`vrep`]).

pub mod cli;
pub mod config;
pub mod healthcheck;
pub mod orchestrator;
pub mod tablet;
pub mod topo;
pub mod util;
pub mod vrep;

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static LOGGER: Once = Once::new();

/// Install the tracing subscriber. Called from main and from tests;
/// only the first call does anything.
pub fn logger() {
    LOGGER.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    });
}
