use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use streamhound::api::{ApiState, router};
use streamhound::app::episode_store::LocalFsEpisodeStore;
use streamhound::app::job_store::LocalFsProgressStore;
use streamhound::app::orchestrator::{Orchestrator, Services};
use streamhound::browser::ChromeBrowserFactory;
use streamhound::cache::MemoryCache;
use streamhound::config::{ScraperConfig, parse_base_url};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct AppArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// Overrides STREAMHOUND_DATA_DIR.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Overrides STREAMHOUND_BASE_URL.
    #[arg(long)]
    base_url: Option<String>,

    /// How often expired cache entries are dropped.
    #[arg(long, default_value_t = 300)]
    cache_purge_secs: u64,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    streamhound::logging::init()?;

    let args = AppArgs::parse();
    tracing::info!(?args, "starting streamhound-app");

    let mut config = match &args.base_url {
        Some(raw) => ScraperConfig::new(parse_base_url(raw)?),
        None => ScraperConfig::from_env()?,
    };
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    tracing::info!(base_url = %config.base_url, data_dir = %config.data_dir.display(), "configured");

    let cache = Arc::new(MemoryCache::new());
    let services = Services {
        cache: cache.clone(),
        browser: Arc::new(ChromeBrowserFactory::new()),
        episodes: Arc::new(LocalFsEpisodeStore::new(&config.data_dir)),
        progress: Arc::new(LocalFsProgressStore::new(&config.data_dir)),
    };
    let orchestrator = Arc::new(Orchestrator::new(config, services)?);

    let shutdown = CancellationToken::new();
    spawn_cache_purge(cache, Duration::from_secs(args.cache_purge_secs.max(1)), shutdown.clone());

    let app = router(ApiState {
        orchestrator,
        shutdown: shutdown.clone(),
    })
    .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", args.addr))?;
    tracing::info!(addr = %args.addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_signal(shutdown))
        .await?;
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "listening for ctrl-c failed");
    }
    tracing::info!("shutting down; cancelling running scrapes");
    shutdown.cancel();
}

fn spawn_cache_purge(cache: Arc<MemoryCache>, every: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let purged = cache.purge_expired().await;
                    if purged > 0 {
                        tracing::debug!(purged, "expired cache entries dropped");
                    }
                }
            }
        }
    });
}
