//! Lease Optimization Agent - Entry Point

use clap::Parser;

#[derive(Parser)]
#[command(name = "optimizer-agent")]
#[command(version)]
#[command(about = "Migrates the local node between reclaimable and fixed-price compute leases")]
struct Cli {}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let _cli = Cli::parse();
    optimizer_agent::run().await
}
