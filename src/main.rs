mod apply;
mod cli;
mod error;
mod logging;
mod model;
mod orchestrator;
mod resolver;
mod state;
mod store;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::init(args.verbose);
    cli::run(args).await
}
