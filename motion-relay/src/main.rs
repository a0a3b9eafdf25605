use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use motion_relay::config::Args;
use motion_relay::context::AppContext;
use motion_relay::{app, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let _log_guard = logging::init_logging(&args.log_config()).context("initializing logging")?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting motion-relay");

    let missing = args.missing_required();
    if !missing.is_empty() {
        error!(missing = ?missing, "Required settings are missing");
    }
    let config = args.into_config().context("invalid configuration")?;

    app::run(config, AppContext::new()).await?;

    info!("motion-relay stopped");
    Ok(())
}
