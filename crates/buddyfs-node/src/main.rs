mod config;

use std::{path::PathBuf, sync::Arc, time::Duration as StdDuration};

use buddyfs_core::{drm::PermissiveDrm, node::BuddyNode};
use clap::Parser;
use config::NodeConfig;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "buddyfs-node", about = "BuddyFS overlay node daemon")]
struct Args {
    /// Path to the node's TOML config file.
    #[arg(long, default_value = "buddyfs-node.toml")]
    config: PathBuf,
}

fn init_tracing(default_filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.unwrap_or("info")));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn main() {
    let args = Args::parse();

    let config = match NodeConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            // tracing isn't up yet; a config we can't read means we don't
            // even know the requested log filter.
            init_tracing(None);
            error!(%err, "failed to load config");
            std::process::exit(1);
        }
    };
    init_tracing(config.log_filter.as_deref());

    let seeds = match config.seed_addrs() {
        Ok(seeds) => seeds,
        Err(err) => {
            error!(%err, "invalid seed in config");
            std::process::exit(1);
        }
    };

    let snapshot_path = config.snapshot_path();
    if let Some(parent) = snapshot_path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            warn!(?err, dir = ?parent, "couldn't create snapshot directory");
        }
    }

    let mut node = match BuddyNode::new(config.listen_addr, seeds, snapshot_path.clone(), Arc::new(PermissiveDrm)) {
        Ok(node) => node,
        Err(err) => {
            error!(%err, addr = %config.listen_addr, "failed to bind listen address");
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, std::sync::atomic::Ordering::Release);
        })
        .expect("failed to install ctrlc handler");
    }

    info!(addr = %config.listen_addr, "buddyfs-node starting");
    node.start();

    while !shutdown.load(std::sync::atomic::Ordering::Acquire) {
        if !node.slice() {
            std::thread::sleep(StdDuration::from_millis(20));
        }
    }

    info!("buddyfs-node shutting down, saving snapshot");
    if let Err(err) = buddyfs_core::fs::save_local(&node.fs, &snapshot_path, &PermissiveDrm) {
        error!(?err, "final snapshot save failed");
    }
}
