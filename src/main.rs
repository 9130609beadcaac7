use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    streamhound::logging::init().context("init logging")?;

    let cli = streamhound::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        streamhound::cli::Command::Scrape(args) => {
            streamhound::commands::scrape(args).await.context("scrape")?;
        }
        streamhound::cli::Command::Batch(args) => {
            streamhound::commands::batch(args).await.context("batch")?;
        }
        streamhound::cli::Command::Resolve(args) => {
            streamhound::commands::resolve(args).await.context("resolve")?;
        }
        streamhound::cli::Command::Check(args) => {
            streamhound::commands::check(args).await.context("check")?;
        }
    }

    Ok(())
}
