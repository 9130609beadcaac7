use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ScraperConfig;

/// Per-request knobs. Missing fields fall back to the configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeOptions {
    /// Navigation timeout in milliseconds.
    pub timeout: Option<u64>,
    pub max_retries: Option<u32>,
    pub headless: Option<bool>,
}

impl ScrapeOptions {
    pub fn timeout_or(&self, config: &ScraperConfig) -> Duration {
        self.timeout
            .map(Duration::from_millis)
            .unwrap_or(config.timeout)
    }

    pub fn max_retries_or(&self, config: &ScraperConfig) -> u32 {
        self.max_retries.unwrap_or(config.max_retries).max(1)
    }

    pub fn headless_or(&self, config: &ScraperConfig) -> bool {
        self.headless.unwrap_or(config.headless)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeRequest {
    pub title: String,
    pub episode_number: u32,
    pub options: ScrapeOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSource {
    pub canonical_url: String,
    pub content_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub stream_url: String,
    pub extracted_at: DateTime<Utc>,
    /// Embed hosts passed through before reaching `stream_url`, outermost first.
    pub host_chain: Vec<String>,
    /// Name of the strategy that produced the url.
    pub strategy: String,
}

impl ExtractionResult {
    pub fn is_degraded(&self) -> bool {
        self.strategy == crate::extract::PAGE_FALLBACK
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProtectionVerdict {
    pub protected: bool,
    pub reasons: Vec<String>,
}

impl ProtectionVerdict {
    pub fn add_reason(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
    }
}

/// One scraped episode as persisted in the episode store and the
/// `episode:` cache namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeRecord {
    pub anime_id: String,
    pub episode_number: u32,
    pub title: String,
    pub stream_url: String,
    pub source_url: String,
    pub content_id: String,
    pub host_chain: Vec<String>,
    pub protected: bool,
    pub protection_reasons: Vec<String>,
    pub scraped_at: DateTime<Utc>,
}

impl EpisodeRecord {
    pub fn new(
        anime_id: &str,
        title: &str,
        episode_number: u32,
        resolved: &ResolvedSource,
        extraction: &ExtractionResult,
        verdict: &ProtectionVerdict,
    ) -> Self {
        Self {
            anime_id: anime_id.to_string(),
            episode_number,
            title: title.to_string(),
            stream_url: extraction.stream_url.clone(),
            source_url: resolved.canonical_url.clone(),
            content_id: resolved.content_id.clone(),
            host_chain: extraction.host_chain.clone(),
            protected: verdict.protected,
            protection_reasons: verdict.reasons.clone(),
            scraped_at: Utc::now(),
        }
    }
}
