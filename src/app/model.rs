use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScrapingJob {
    pub id: String,
    pub content_id: String,
    pub title: String,
    pub total_episodes: u32,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub current_chunk: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScrapingJob {
    pub fn new(content_id: &str, title: &str, total_episodes: u32, chunk_size: u32) -> Self {
        let now = Utc::now();
        let chunk_size = chunk_size.max(1);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content_id: content_id.to_string(),
            title: title.to_string(),
            total_episodes,
            chunk_size,
            total_chunks: total_episodes.div_ceil(chunk_size),
            current_chunk: 0,
            completed_count: 0,
            failed_count: 0,
            status: JobStatus::Pending,
            started_at: now,
            updated_at: now,
        }
    }

    /// 1-based chunk holding `episode`.
    pub fn chunk_of(&self, episode: u32) -> u32 {
        (episode.saturating_sub(1)) / self.chunk_size + 1
    }

    pub fn processed(&self) -> u32 {
        self.completed_count + self.failed_count
    }

    /// One `pending` log entry per episode, chunked by `chunk_size`.
    pub fn initial_entries(&self) -> Vec<EpisodeLogEntry> {
        (1..=self.total_episodes)
            .map(|episode| EpisodeLogEntry {
                job_id: self.id.clone(),
                episode_number: episode,
                chunk_number: self.chunk_of(episode),
                status: EpisodeStatus::Pending,
                error_message: None,
                scraped_at: None,
            })
            .collect()
    }

    /// Recomputes the counters from the episode log and settles the status.
    pub fn apply_counts(&mut self, entries: &[EpisodeLogEntry]) {
        self.settle(entries.iter());
    }

    /// Marks the job running, with the entries about to be re-scraped taken
    /// out of the counters.
    pub fn begin_run(&mut self, entries: &[EpisodeLogEntry], rerun: &[u32]) {
        self.settle(
            entries
                .iter()
                .filter(|e| !rerun.contains(&e.episode_number)),
        );
    }

    fn settle<'a>(&mut self, entries: impl Iterator<Item = &'a EpisodeLogEntry>) {
        let (mut completed, mut failed) = (0, 0);
        for entry in entries {
            match entry.status {
                EpisodeStatus::Success => completed += 1,
                EpisodeStatus::Failed if !entry.is_cancelled() => failed += 1,
                _ => {}
            }
        }
        self.completed_count = completed;
        self.failed_count = failed;
        self.status = if self.processed() >= self.total_episodes {
            JobStatus::Completed
        } else {
            JobStatus::InProgress
        };
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Pending,
    Scraping,
    Success,
    Failed,
}

impl EpisodeStatus {
    pub fn can_transition_to(self, next: EpisodeStatus) -> bool {
        use EpisodeStatus::*;
        matches!(
            (self, next),
            (Pending, Scraping) | (Scraping, Success) | (Scraping, Failed) | (Failed, Scraping)
        )
    }

    /// Entries a chunk run picks up again.
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Pending | Self::Failed | Self::Scraping)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeLogEntry {
    pub job_id: String,
    pub episode_number: u32,
    pub chunk_number: u32,
    pub status: EpisodeStatus,
    pub error_message: Option<String>,
    pub scraped_at: Option<DateTime<Utc>>,
}

/// Error message of an entry whose run was cancelled mid-episode.
pub const CANCELLED: &str = "cancelled";

impl EpisodeLogEntry {
    /// Cancelled entries stay `failed` for resumability but are not
    /// processed yet.
    pub fn is_cancelled(&self) -> bool {
        self.status == EpisodeStatus::Failed && self.error_message.as_deref() == Some(CANCELLED)
    }

    pub fn transition(&mut self, next: EpisodeStatus, error: Option<String>) -> anyhow::Result<()> {
        if !self.status.can_transition_to(next) {
            anyhow::bail!(
                "episode {} of job {}: illegal transition {:?} -> {:?}",
                self.episode_number,
                self.job_id,
                self.status,
                next
            );
        }
        self.status = next;
        self.error_message = error;
        if matches!(next, EpisodeStatus::Success | EpisodeStatus::Failed) {
            self.scraped_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeOutcome {
    pub episode_number: u32,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EpisodeOutcome {
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total_episodes: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub success_rate: f64,
}

impl BatchSummary {
    pub fn from_outcomes(outcomes: &[EpisodeOutcome]) -> Self {
        let success_count = outcomes.iter().filter(|o| o.is_success()).count();
        let total_episodes = outcomes.len();
        Self {
            total_episodes,
            success_count,
            error_count: total_episodes - success_count,
            success_rate: success_rate(success_count, total_episodes),
        }
    }
}

/// Percentage rounded to one decimal place; 0 for an empty batch.
pub fn success_rate(success: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (success as f64 / total as f64 * 1000.0).round() / 10.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub results: Vec<EpisodeOutcome>,
    pub summary: BatchSummary,
}

impl BatchReport {
    pub fn new(results: Vec<EpisodeOutcome>) -> Self {
        let summary = BatchSummary::from_outcomes(&results);
        Self { results, summary }
    }
}

/// Persisted job plus throughput figures derived from it.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    #[serde(flatten)]
    pub job: ScrapingJob,
    pub progress_percentage: f64,
    /// Milliseconds; absent until at least one episode has been processed.
    pub estimated_time_remaining: Option<i64>,
    pub episodes_per_ms: f64,
}

impl ProgressReport {
    pub fn from_job(job: ScrapingJob) -> Self {
        let processed = job.processed();
        let progress_percentage = success_rate(processed as usize, job.total_episodes as usize);
        let elapsed_ms = (job.updated_at - job.started_at).num_milliseconds();

        let episodes_per_ms = if processed > 0 && elapsed_ms > 0 {
            f64::from(processed) / elapsed_ms as f64
        } else {
            0.0
        };
        let remaining = job.total_episodes.saturating_sub(processed);
        let estimated_time_remaining = if episodes_per_ms > 0.0 {
            Some((f64::from(remaining) / episodes_per_ms).round() as i64)
        } else {
            None
        };

        Self {
            job,
            progress_percentage,
            estimated_time_remaining,
            episodes_per_ms,
        }
    }
}
