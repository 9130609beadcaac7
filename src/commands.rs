use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::app::episode_store::LocalFsEpisodeStore;
use crate::app::job_store::LocalFsProgressStore;
use crate::app::orchestrator::{Orchestrator, Services};
use crate::browser::ChromeBrowserFactory;
use crate::cache::MemoryCache;
use crate::cli::{BatchArgs, CheckArgs, ResolveArgs, ScrapeArgs};
use crate::config::ScraperConfig;
use crate::model::{ScrapeOptions, ScrapeRequest};
use crate::resolve::slugify;

/// Wires the shipped cache, browser and stores around `config`.
pub fn default_services(config: &ScraperConfig) -> Services {
    Services {
        cache: Arc::new(MemoryCache::new()),
        browser: Arc::new(ChromeBrowserFactory::new()),
        episodes: Arc::new(LocalFsEpisodeStore::new(&config.data_dir)),
        progress: Arc::new(LocalFsProgressStore::new(&config.data_dir)),
    }
}

fn orchestrator(config: ScraperConfig) -> anyhow::Result<Orchestrator> {
    let services = default_services(&config);
    Orchestrator::new(config, services).context("build orchestrator")
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{out}");
    Ok(())
}

/// Token cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; stopping after the current episode");
            on_signal.cancel();
        }
    });
    cancel
}

pub async fn scrape(args: ScrapeArgs) -> anyhow::Result<()> {
    let orchestrator = orchestrator(args.pipeline.config()?)?;
    let anime_id = args.anime_id.unwrap_or_else(|| slugify(&args.title));
    let request = ScrapeRequest {
        title: args.title,
        episode_number: args.episode,
        options: ScrapeOptions::default(),
    };

    let record = orchestrator
        .scrape_single(&anime_id, &request, &interrupt_token())
        .await
        .with_context(|| format!("scrape {} episode {}", request.title, request.episode_number))?;
    print_json(&record)
}

pub async fn batch(args: BatchArgs) -> anyhow::Result<()> {
    let orchestrator = orchestrator(args.pipeline.config()?)?;
    let anime_id = args.anime_id.unwrap_or_else(|| slugify(&args.title));

    let report = orchestrator
        .scrape_batch(
            &args.title,
            &anime_id,
            &args.episodes,
            &ScrapeOptions::default(),
            &interrupt_token(),
        )
        .await;
    print_json(&report)?;

    if report.summary.success_count == 0 && report.summary.total_episodes > 0 {
        anyhow::bail!("no episode of {} could be scraped", args.title);
    }
    Ok(())
}

pub async fn resolve(args: ResolveArgs) -> anyhow::Result<()> {
    let orchestrator = orchestrator(args.pipeline.config()?)?;
    let resolved = orchestrator
        .resolver()
        .resolve(args.title.trim(), args.episode)
        .await
        .with_context(|| format!("resolve {} episode {}", args.title, args.episode))?;
    print_json(&resolved)
}

pub async fn check(args: CheckArgs) -> anyhow::Result<()> {
    let orchestrator = orchestrator(args.pipeline.config()?)?;
    let verdict = orchestrator.detector().check(&args.url).await;
    print_json(&verdict)
}
