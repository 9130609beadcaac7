use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};

use crate::config::{ScraperConfig, parse_base_url};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scrape one episode and print its record.
    Scrape(ScrapeArgs),
    /// Scrape several episodes one after another.
    Batch(BatchArgs),
    /// Resolve an episode to its canonical page without rendering it.
    Resolve(ResolveArgs),
    /// Run the embedding-protection check against a stream url.
    Check(CheckArgs),
}

/// Upstream and runtime settings shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct PipelineArgs {
    /// Upstream site root (falls back to STREAMHOUND_BASE_URL).
    #[arg(long)]
    pub base_url: Option<String>,

    /// Directory for the episode catalog and job logs.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Navigation timeout per attempt.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Show the browser window.
    #[arg(long, default_value_t = false)]
    pub headful: bool,

    /// Delay between episodes of a batch.
    #[arg(long)]
    pub episode_delay_ms: Option<u64>,
}

impl PipelineArgs {
    /// Environment defaults with the flags applied on top.
    pub fn config(&self) -> anyhow::Result<ScraperConfig> {
        let mut config = match &self.base_url {
            Some(raw) => ScraperConfig::new(
                parse_base_url(raw).with_context(|| format!("invalid --base-url {raw:?}"))?,
            ),
            None => ScraperConfig::from_env()?,
        };
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout = std::time::Duration::from_millis(ms);
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(ms) = self.episode_delay_ms {
            config.episode_delay = std::time::Duration::from_millis(ms);
        }
        if self.headful {
            config.headless = false;
        }
        Ok(config)
    }
}

#[derive(Debug, Args)]
pub struct ScrapeArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    #[arg(long)]
    pub title: String,

    #[arg(long)]
    pub episode: u32,

    /// Catalog key; defaults to the slug of the title.
    #[arg(long)]
    pub anime_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct BatchArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    #[arg(long)]
    pub title: String,

    /// Comma separated episode numbers, e.g. `1,2,5`.
    #[arg(long, value_delimiter = ',', required = true)]
    pub episodes: Vec<u32>,

    #[arg(long)]
    pub anime_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    #[arg(long)]
    pub title: String,

    #[arg(long, default_value_t = 1)]
    pub episode: u32,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Stream url to inspect.
    #[arg(long)]
    pub url: String,
}
