//! PTP/IP Tether - Main Entry Point

use clap::Parser;
use ptpip_tether::{init_logging, run, Cli};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    info!("=== PTP/IP Tether v{} ===", env!("CARGO_PKG_VERSION"));
    run(Cli::parse()).await
}
