//! reshard, a resharding control plane for sharded database clusters.

use clap::Parser;
use reshard::cli::{self, Cli, Commands};
use reshard::config;
use tokio::runtime::Builder;
use tracing::info;

use std::process::exit;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Cli::parse();

    reshard::logger();

    if let Commands::Configcheck = args.command {
        if let Err(err) = cli::config_check(&args.config) {
            eprintln!("Configuration error: {}", err);
            exit(1);
        }

        println!("Configuration valid");
        exit(0);
    }

    info!("reshard v{}", env!("CARGO_PKG_VERSION"));
    let config = config::load(&args.config)?;

    let runtime = match config.general.workers {
        0 => {
            let mut builder = Builder::new_current_thread();
            builder.enable_all();
            builder
        }
        workers => {
            info!("spawning {} workers", workers);
            let mut builder = Builder::new_multi_thread();
            builder.worker_threads(workers).enable_all();
            builder
        }
    }
    .build()?;

    runtime.block_on(async move { cli::run(args.command).await })?;

    Ok(())
}
