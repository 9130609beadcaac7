use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use crate::app::model::{EpisodeLogEntry, ScrapingJob};

/// Persistence for large jobs and their per-episode log.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn create(&self, job: &ScrapingJob, entries: &[EpisodeLogEntry]) -> anyhow::Result<()>;
    async fn get(&self, job_id: &str) -> anyhow::Result<Option<ScrapingJob>>;
    async fn put(&self, job: &ScrapingJob) -> anyhow::Result<()>;
    /// Most recently started job for `content_id`.
    async fn latest_for_content(&self, content_id: &str) -> anyhow::Result<Option<ScrapingJob>>;
    async fn entries(&self, job_id: &str) -> anyhow::Result<Vec<EpisodeLogEntry>>;
    async fn put_entry(&self, entry: &EpisodeLogEntry) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub struct LocalFsProgressStore {
    base_dir: PathBuf,
    entries_lock: Mutex<()>,
}

impl LocalFsProgressStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            entries_lock: Mutex::new(()),
        }
    }

    fn jobs_dir(&self) -> PathBuf {
        self.base_dir.join("jobs")
    }

    fn job_dir(&self, job_id: &str) -> anyhow::Result<PathBuf> {
        if uuid::Uuid::parse_str(job_id.trim()).is_err() {
            anyhow::bail!("invalid job id: {job_id:?}");
        }
        Ok(self.jobs_dir().join(job_id.trim()))
    }

    fn job_json_path(&self, job_id: &str) -> anyhow::Result<PathBuf> {
        Ok(self.job_dir(job_id)?.join("job.json"))
    }

    fn entries_json_path(&self, job_id: &str) -> anyhow::Result<PathBuf> {
        Ok(self.job_dir(job_id)?.join("episodes.json"))
    }
}

#[async_trait]
impl ProgressStore for LocalFsProgressStore {
    async fn create(&self, job: &ScrapingJob, entries: &[EpisodeLogEntry]) -> anyhow::Result<()> {
        let dir = self.job_dir(&job.id)?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create job dir: {}", dir.display()))?;

        write_json_atomic(&self.entries_json_path(&job.id)?, &entries)
            .await
            .context("write episodes.json")?;
        write_json_atomic(&self.job_json_path(&job.id)?, job)
            .await
            .context("write job.json")?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> anyhow::Result<Option<ScrapingJob>> {
        let path = self.job_json_path(job_id)?;
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn put(&self, job: &ScrapingJob) -> anyhow::Result<()> {
        write_json_atomic(&self.job_json_path(&job.id)?, job)
            .await
            .context("write job.json")
    }

    async fn latest_for_content(&self, content_id: &str) -> anyhow::Result<Option<ScrapingJob>> {
        let jobs_dir = self.jobs_dir();
        let mut dir = match fs::read_dir(&jobs_dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("list: {}", jobs_dir.display()));
            }
        };

        let mut latest: Option<ScrapingJob> = None;
        while let Some(entry) = dir.next_entry().await.context("read jobs dir entry")? {
            let path = entry.path().join("job.json");
            let Some(job) = read_json::<ScrapingJob>(&path)
                .await
                .with_context(|| format!("read: {}", path.display()))?
            else {
                continue;
            };
            if job.content_id != content_id {
                continue;
            }
            if latest.as_ref().is_none_or(|l| job.started_at > l.started_at) {
                latest = Some(job);
            }
        }
        Ok(latest)
    }

    async fn entries(&self, job_id: &str) -> anyhow::Result<Vec<EpisodeLogEntry>> {
        let path = self.entries_json_path(job_id)?;
        Ok(read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?
            .unwrap_or_default())
    }

    async fn put_entry(&self, entry: &EpisodeLogEntry) -> anyhow::Result<()> {
        let _guard = self.entries_lock.lock().await;
        let path = self.entries_json_path(&entry.job_id)?;
        let mut entries: Vec<EpisodeLogEntry> = read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?
            .ok_or_else(|| anyhow::anyhow!("job not found: {}", entry.job_id))?;

        match entries
            .iter_mut()
            .find(|e| e.episode_number == entry.episode_number)
        {
            Some(existing) => *existing = entry.clone(),
            None => entries.push(entry.clone()),
        }
        write_json_atomic(&path, &entries)
            .await
            .context("write episodes.json")
    }
}

pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

pub(crate) async fn write_json_atomic<T: serde::Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
