#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;

use dotenv::dotenv;
use tracing::info;

use ssh_bridge::config::{BridgeDirs, resolve_config_dir};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Logging goes to stderr, which the spawner points at <configDir>/log.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let dir = args.next().map(PathBuf::from);
    let title = args.next();

    let dirs = BridgeDirs::new(resolve_config_dir(dir));
    info!(dir = %dirs.root().display(), "ssh-bridge daemon starting");

    ssh_bridge::daemon::run(dirs, title).await
}
