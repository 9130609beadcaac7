use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::fs;

use crate::app::job_store::{read_json, write_json_atomic};
use crate::model::EpisodeRecord;

/// Catalog of scraped episodes, keyed by anime id and episode number.
#[async_trait]
pub trait EpisodeStore: Send + Sync {
    async fn upsert(&self, record: &EpisodeRecord) -> anyhow::Result<()>;
    async fn get(&self, anime_id: &str, episode_number: u32)
    -> anyhow::Result<Option<EpisodeRecord>>;
    async fn list(&self, anime_id: &str) -> anyhow::Result<Vec<EpisodeRecord>>;
}

#[derive(Debug, Clone)]
pub struct LocalFsEpisodeStore {
    base_dir: PathBuf,
}

impl LocalFsEpisodeStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn anime_dir(&self, anime_id: &str) -> anyhow::Result<PathBuf> {
        let key = path_key(anime_id)?;
        Ok(self.base_dir.join("episodes").join(key))
    }

    fn episode_path(&self, anime_id: &str, episode_number: u32) -> anyhow::Result<PathBuf> {
        Ok(self
            .anime_dir(anime_id)?
            .join(format!("{episode_number}.json")))
    }
}

/// Maps an anime id onto a single safe path component.
fn path_key(anime_id: &str) -> anyhow::Result<String> {
    let key: String = anime_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if key.is_empty() {
        anyhow::bail!("anime id is empty");
    }
    Ok(key)
}

#[async_trait]
impl EpisodeStore for LocalFsEpisodeStore {
    async fn upsert(&self, record: &EpisodeRecord) -> anyhow::Result<()> {
        let path = self.episode_path(&record.anime_id, record.episode_number)?;
        write_json_atomic(&path, record)
            .await
            .with_context(|| format!("write episode: {}", path.display()))
    }

    async fn get(
        &self,
        anime_id: &str,
        episode_number: u32,
    ) -> anyhow::Result<Option<EpisodeRecord>> {
        let path = self.episode_path(anime_id, episode_number)?;
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn list(&self, anime_id: &str) -> anyhow::Result<Vec<EpisodeRecord>> {
        let dir_path = self.anime_dir(anime_id)?;
        let mut dir = match fs::read_dir(&dir_path).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("list: {}", dir_path.display()));
            }
        };

        let mut out = Vec::new();
        while let Some(entry) = dir.next_entry().await.context("read episodes dir entry")? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = read_json::<EpisodeRecord>(&path)
                .await
                .with_context(|| format!("read: {}", path.display()))?
            {
                out.push(record);
            }
        }
        out.sort_by_key(|r| r.episode_number);
        Ok(out)
    }
}
