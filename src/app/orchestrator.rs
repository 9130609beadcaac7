use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::app::episode_store::EpisodeStore;
use crate::app::events::{self, BatchProgressEvent, EventSender};
use crate::app::job_store::ProgressStore;
use crate::app::model::{
    BatchReport, BatchSummary, CANCELLED, EpisodeLogEntry, EpisodeOutcome, EpisodeStatus,
    JobStatus, OutcomeStatus, ProgressReport, ScrapingJob,
};
use crate::browser::{BrowserFactory, SessionOptions};
use crate::cache::{self, Cache};
use crate::config::ScraperConfig;
use crate::error::{Result, ScrapeError};
use crate::extract::Extractor;
use crate::fetch::Fetcher;
use crate::model::{
    EpisodeRecord, ExtractionResult, ProtectionVerdict, ResolvedSource, ScrapeOptions,
    ScrapeRequest,
};
use crate::protection::ProtectionDetector;
use crate::resolve::Resolver;

/// Diagnostic output of a dry run; nothing is cached or persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperTestReport {
    pub resolved: ResolvedSource,
    pub extraction: ExtractionResult,
    pub protection: ProtectionVerdict,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReport {
    pub job: ScrapingJob,
    pub chunk_number: u32,
    #[serde(flatten)]
    pub report: BatchReport,
}

/// Injected collaborators of the orchestrator.
#[derive(Clone)]
pub struct Services {
    pub cache: Arc<dyn Cache>,
    pub browser: Arc<dyn BrowserFactory>,
    pub episodes: Arc<dyn EpisodeStore>,
    pub progress: Arc<dyn ProgressStore>,
}

/// Drives resolve → extract → protection check → persist for single
/// episodes, batches and chunked large jobs.
///
/// Episodes are always processed one after another; a batch never runs two
/// browser sessions at once.
pub struct Orchestrator {
    config: ScraperConfig,
    cache: Arc<dyn Cache>,
    resolver: Resolver,
    extractor: Extractor,
    detector: ProtectionDetector,
    episodes: Arc<dyn EpisodeStore>,
    progress: Arc<dyn ProgressStore>,
    job_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(config: ScraperConfig, services: Services) -> Result<Self> {
        let fetcher = Fetcher::new(&config)?;
        Ok(Self {
            resolver: Resolver::new(&config, fetcher.clone(), Arc::clone(&services.cache)),
            extractor: Extractor::new(&config, fetcher.clone(), services.browser),
            detector: ProtectionDetector::new(&config, fetcher),
            cache: services.cache,
            episodes: services.episodes,
            progress: services.progress,
            job_locks: std::sync::Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &ScraperConfig {
        &self.config
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn detector(&self) -> &ProtectionDetector {
        &self.detector
    }

    pub fn episodes(&self) -> &Arc<dyn EpisodeStore> {
        &self.episodes
    }

    fn session_options(&self, options: &ScrapeOptions) -> SessionOptions {
        SessionOptions {
            headless: options.headless_or(&self.config),
            timeout: options.timeout_or(&self.config),
            user_agent: self.config.user_agent.clone(),
        }
    }

    /// One episode, served from the `episode:` cache when possible.
    ///
    /// Every attempt failure is retried the same way; after the last
    /// attempt the last error is returned as is.
    pub async fn scrape_single(
        &self,
        anime_id: &str,
        request: &ScrapeRequest,
        cancel: &CancellationToken,
    ) -> Result<EpisodeRecord> {
        let title = request.title.trim();
        if title.is_empty() {
            return Err(ScrapeError::InvalidInput("title is empty".to_string()));
        }
        let episode = request.episode_number;

        let key = cache::episode_key(title, episode);
        if let Some(hit) = cache::get_json::<EpisodeRecord>(self.cache.as_ref(), &key).await {
            tracing::info!(title, episode, "episode cache hit");
            return Ok(hit);
        }

        let attempts = request.options.max_retries_or(&self.config);
        let session = self.session_options(&request.options);
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(ScrapeError::Cancelled);
            }

            match self.attempt(anime_id, title, episode, &session).await {
                Ok(record) => {
                    cache::set_json(self.cache.as_ref(), &key, &record, self.config.episode_ttl)
                        .await;
                    return Ok(record);
                }
                Err(err) if attempt >= attempts => {
                    tracing::error!(title, episode, attempt, %err, "episode failed");
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        title,
                        episode,
                        attempt,
                        attempts,
                        network = err.is_network(),
                        %err,
                        "attempt failed; retrying"
                    );
                    sleep_or_cancel(self.config.retry_delay, cancel).await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        anime_id: &str,
        title: &str,
        episode: u32,
        session: &SessionOptions,
    ) -> Result<EpisodeRecord> {
        let resolved = self.resolver.resolve(title, episode).await?;
        let extraction = self.extractor.extract(&resolved, session).await?;
        let verdict = self.detector.check(&extraction.stream_url).await;

        let record = EpisodeRecord::new(anime_id, title, episode, &resolved, &extraction, &verdict);
        self.episodes
            .upsert(&record)
            .await
            .map_err(ScrapeError::persistence)?;

        tracing::info!(
            title,
            episode,
            stream = %record.stream_url,
            strategy = %extraction.strategy,
            protected = verdict.protected,
            "episode scraped"
        );
        Ok(record)
    }

    /// Dry run of the pipeline for diagnostics.
    pub async fn test_scraper(&self, title: &str, episode: u32) -> Result<ScraperTestReport> {
        let session = self.session_options(&ScrapeOptions::default());
        let resolved = self.resolver.resolve(title.trim(), episode).await?;
        let extraction = self.extractor.extract(&resolved, &session).await?;
        let protection = self.detector.check(&extraction.stream_url).await;
        Ok(ScraperTestReport {
            degraded: extraction.is_degraded(),
            resolved,
            extraction,
            protection,
        })
    }

    pub async fn scrape_batch(
        &self,
        title: &str,
        anime_id: &str,
        episodes: &[u32],
        options: &ScrapeOptions,
        cancel: &CancellationToken,
    ) -> BatchReport {
        self.run_batch(title, anime_id, episodes, options, cancel, None)
            .await
    }

    /// Same as [`Orchestrator::scrape_batch`], reporting each step on `events`.
    pub async fn scrape_batch_with_progress(
        &self,
        title: &str,
        anime_id: &str,
        episodes: &[u32],
        options: &ScrapeOptions,
        cancel: &CancellationToken,
        events: &EventSender,
    ) -> BatchReport {
        self.run_batch(title, anime_id, episodes, options, cancel, Some(events))
            .await
    }

    /// Episodes `1..=max_episodes` as one batch.
    pub async fn scrape_all(
        &self,
        title: &str,
        anime_id: &str,
        max_episodes: u32,
        options: &ScrapeOptions,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let episodes: Vec<u32> = (1..=max_episodes).collect();
        self.scrape_batch(title, anime_id, &episodes, options, cancel)
            .await
    }

    async fn run_batch(
        &self,
        title: &str,
        anime_id: &str,
        episodes: &[u32],
        options: &ScrapeOptions,
        cancel: &CancellationToken,
        events: Option<&EventSender>,
    ) -> BatchReport {
        let total = episodes.len();
        events::emit(
            events,
            BatchProgressEvent::Start {
                total,
                message: format!("scraping {total} episodes of {title}"),
            },
        )
        .await;

        let mut results: Vec<EpisodeOutcome> = Vec::with_capacity(total);
        for (idx, &episode) in episodes.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(title, done = results.len(), total, "batch cancelled");
                break;
            }
            let current = idx + 1;
            events::emit(
                events,
                BatchProgressEvent::Progress {
                    episode,
                    current,
                    total,
                    status: "scraping".to_string(),
                },
            )
            .await;

            let request = ScrapeRequest {
                title: title.to_string(),
                episode_number: episode,
                options: options.clone(),
            };
            let outcome = match self.scrape_single(anime_id, &request, cancel).await {
                Ok(record) => success_outcome(&record),
                Err(ScrapeError::Cancelled) => break,
                Err(err) => failed_outcome(episode, &err),
            };
            events::emit(events, outcome_event(&outcome, current, total)).await;
            results.push(outcome);

            if current < total && sleep_or_cancel(self.config.episode_delay, cancel).await.is_err()
            {
                break;
            }
        }

        let report = BatchReport::new(results);
        tracing::info!(
            title,
            total = report.summary.total_episodes,
            success = report.summary.success_count,
            errors = report.summary.error_count,
            "batch finished"
        );
        events::emit(
            events,
            BatchProgressEvent::Complete {
                message: completion_message(&report.summary),
                summary: report.summary.clone(),
                results: report.results.clone(),
            },
        )
        .await;
        report
    }

    /// Creates the job and its `pending` episode log.
    ///
    /// This is the only step whose failure marks a job `failed`.
    pub async fn start_large_job(
        &self,
        anime_id: &str,
        title: &str,
        total_episodes: u32,
        chunk_size: u32,
    ) -> Result<ScrapingJob> {
        if total_episodes == 0 || chunk_size == 0 {
            return Err(ScrapeError::InvalidInput(
                "totalEpisodes and chunkSize must be positive".to_string(),
            ));
        }

        let mut job = ScrapingJob::new(anime_id, title, total_episodes, chunk_size);
        let entries = job.initial_entries();
        if let Err(err) = self.progress.create(&job, &entries).await {
            tracing::error!(job_id = %job.id, ?err, "creating job failed");
            job.status = JobStatus::Failed;
            if let Err(put_err) = self.progress.put(&job).await {
                tracing::debug!(job_id = %job.id, ?put_err, "recording failed job also failed");
            }
            return Err(ScrapeError::persistence(err));
        }

        tracing::info!(
            job_id = %job.id,
            anime_id,
            total_episodes,
            total_chunks = job.total_chunks,
            "large job created"
        );
        Ok(job)
    }

    fn job_lock(&self, job_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .job_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(job_id.to_string()).or_default())
    }

    /// Scrapes the `pending`/`failed` entries of one chunk.
    ///
    /// Calls for the same job are serialized; `success` entries are never
    /// touched again, so re-running a chunk resumes it.
    pub async fn scrape_chunk(
        &self,
        job_id: &str,
        chunk_number: u32,
        options: &ScrapeOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkReport> {
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;

        let mut job = self
            .progress
            .get(job_id)
            .await
            .map_err(ScrapeError::persistence)?
            .ok_or_else(|| ScrapeError::InvalidInput(format!("job not found: {job_id}")))?;
        if chunk_number == 0 || chunk_number > job.total_chunks {
            return Err(ScrapeError::InvalidInput(format!(
                "chunk {chunk_number} out of range 1..={}",
                job.total_chunks
            )));
        }

        let mut entries = self
            .progress
            .entries(job_id)
            .await
            .map_err(ScrapeError::persistence)?;
        let mut selected: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.chunk_number == chunk_number && e.status.is_resumable())
            .map(|(idx, _)| idx)
            .collect();
        selected.sort_by_key(|&idx| entries[idx].episode_number);

        tracing::info!(job_id, chunk_number, selected = selected.len(), "chunk started");
        let rerun: Vec<u32> = selected.iter().map(|&idx| entries[idx].episode_number).collect();
        job.begin_run(&entries, &rerun);
        self.progress
            .put(&job)
            .await
            .map_err(ScrapeError::persistence)?;

        let mut results: Vec<EpisodeOutcome> = Vec::with_capacity(selected.len());
        for (pos, &idx) in selected.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let entry = &mut entries[idx];
            if entry.status == EpisodeStatus::Scraping {
                // Left behind by an interrupted run.
                if let Err(err) = self
                    .record_entry(entry, EpisodeStatus::Failed, Some("interrupted".to_string()))
                    .await
                {
                    tracing::warn!(job_id, episode = entry.episode_number, ?err, "skipping episode");
                    continue;
                }
            }
            if let Err(err) = self.record_entry(entry, EpisodeStatus::Scraping, None).await {
                tracing::warn!(job_id, episode = entry.episode_number, ?err, "skipping episode");
                continue;
            }

            let request = ScrapeRequest {
                title: job.title.clone(),
                episode_number: entry.episode_number,
                options: options.clone(),
            };
            let (next, error, outcome, stop) =
                match self.scrape_single(&job.content_id, &request, cancel).await {
                    Ok(record) => (
                        EpisodeStatus::Success,
                        None,
                        Some(success_outcome(&record)),
                        false,
                    ),
                    Err(ScrapeError::Cancelled) => {
                        (EpisodeStatus::Failed, Some(CANCELLED.to_string()), None, true)
                    }
                    Err(err) => (
                        EpisodeStatus::Failed,
                        Some(err.to_string()),
                        Some(failed_outcome(entry.episode_number, &err)),
                        false,
                    ),
                };
            if let Err(err) = self.record_entry(entry, next, error).await {
                tracing::warn!(
                    job_id,
                    episode = entry.episode_number,
                    ?err,
                    "episode outcome not recorded; it stays resumable"
                );
            }
            results.extend(outcome);
            if stop {
                break;
            }

            if pos + 1 < selected.len()
                && sleep_or_cancel(self.config.episode_delay, cancel).await.is_err()
            {
                break;
            }
        }

        job.apply_counts(&entries);
        job.current_chunk = job.current_chunk.max(chunk_number);
        self.progress
            .put(&job)
            .await
            .map_err(ScrapeError::persistence)?;

        let report = BatchReport::new(results);
        tracing::info!(
            job_id,
            chunk_number,
            completed = job.completed_count,
            failed = job.failed_count,
            total = job.total_episodes,
            "chunk finished"
        );
        Ok(ChunkReport {
            job,
            chunk_number,
            report,
        })
    }

    /// Applies a log transition and persists it.
    ///
    /// On a rejected transition or a failed write the entry keeps its
    /// previous state, so the in-memory log matches the stored one.
    async fn record_entry(
        &self,
        entry: &mut EpisodeLogEntry,
        next: EpisodeStatus,
        error: Option<String>,
    ) -> anyhow::Result<()> {
        let previous = entry.clone();
        entry.transition(next, error)?;
        if let Err(err) = self.progress.put_entry(entry).await {
            *entry = previous;
            return Err(err.context("persist episode log entry"));
        }
        Ok(())
    }

    pub async fn progress(&self, anime_id: &str) -> Result<Option<ProgressReport>> {
        let job = self
            .progress
            .latest_for_content(anime_id)
            .await
            .map_err(ScrapeError::persistence)?;
        Ok(job.map(ProgressReport::from_job))
    }

    pub async fn job(&self, job_id: &str) -> Result<Option<ScrapingJob>> {
        self.progress
            .get(job_id)
            .await
            .map_err(ScrapeError::persistence)
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    if delay.is_zero() {
        return if cancel.is_cancelled() {
            Err(ScrapeError::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(ScrapeError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

fn success_outcome(record: &EpisodeRecord) -> EpisodeOutcome {
    EpisodeOutcome {
        episode_number: record.episode_number,
        status: OutcomeStatus::Success,
        stream_url: Some(record.stream_url.clone()),
        protected: Some(record.protected),
        error: None,
    }
}

fn failed_outcome(episode: u32, err: &ScrapeError) -> EpisodeOutcome {
    EpisodeOutcome {
        episode_number: episode,
        status: OutcomeStatus::Failed,
        stream_url: None,
        protected: None,
        error: Some(err.to_string()),
    }
}

fn outcome_event(outcome: &EpisodeOutcome, current: usize, total: usize) -> BatchProgressEvent {
    match (&outcome.stream_url, &outcome.error) {
        (Some(url), _) if outcome.is_success() => BatchProgressEvent::Success {
            episode: outcome.episode_number,
            current,
            total,
            status: "success".to_string(),
            url: url.clone(),
        },
        (_, error) => BatchProgressEvent::Error {
            episode: outcome.episode_number,
            current,
            total,
            status: "failed".to_string(),
            error: error.clone().unwrap_or_default(),
        },
    }
}

fn completion_message(summary: &BatchSummary) -> String {
    format!(
        "{} of {} episodes scraped ({}%)",
        summary.success_count, summary.total_episodes, summary.success_rate
    )
}
