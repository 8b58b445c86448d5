//! Thin binary entry point. All real logic lives in the library so the
//! integration test suite can exercise it directly.

use clap::Parser;
use modelmux::cli::{run, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let exit_code = run(cli).await?;
    std::process::exit(exit_code);
}
