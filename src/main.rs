use clap::Parser;

use cityrank_lib::cli::{execute, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cityrank_lib::init_tracing();
    let cli = Cli::parse();
    execute(cli).await?;
    Ok(())
}
