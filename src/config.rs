use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use url::Url;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36";

/// Everything the pipeline needs to know about its environment.
///
/// Built once at process start and handed to each service constructor.
#[derive(Debug, Clone)]
pub struct ScraperConfig {
    /// Upstream site root; episode pages live directly under it.
    pub base_url: Url,
    pub user_agent: String,
    /// Query parameter carrying the keyword on the upstream search page.
    pub search_param: String,

    /// Mirror whose embeds win over generic matches and whose Cloudflare
    /// challenge does not block embedding.
    pub preferred_mirror: String,
    /// Hosts whose iframes are only wrappers around another embed.
    pub aggregator_hosts: Vec<String>,

    pub timeout: Duration,
    pub max_retries: u32,
    pub headless: bool,
    pub retry_delay: Duration,
    pub episode_delay: Duration,

    pub search_ttl: Duration,
    pub episode_ttl: Duration,

    pub data_dir: PathBuf,
    pub event_buffer: usize,
}

impl ScraperConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            search_param: "s".to_string(),
            preferred_mirror: "desustream".to_string(),
            aggregator_hosts: vec!["desudrive".to_string(), "ondesu".to_string()],
            timeout: Duration::from_secs(30),
            max_retries: 3,
            headless: true,
            retry_delay: Duration::from_secs(2),
            episode_delay: Duration::from_secs(3),
            search_ttl: Duration::from_secs(60 * 60),
            episode_ttl: Duration::from_secs(24 * 60 * 60),
            data_dir: PathBuf::from("streamhound-data"),
            event_buffer: 32,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let raw = std::env::var("STREAMHOUND_BASE_URL")
            .context("STREAMHOUND_BASE_URL is required")?;
        let base_url = parse_base_url(&raw)
            .with_context(|| format!("invalid STREAMHOUND_BASE_URL={raw:?}"))?;
        let mut config = Self::new(base_url);

        if let Some(value) = env_string("STREAMHOUND_USER_AGENT") {
            config.user_agent = value;
        }
        if let Some(value) = env_string("STREAMHOUND_PREFERRED_MIRROR") {
            config.preferred_mirror = value;
        }
        if let Some(value) = env_string("STREAMHOUND_AGGREGATOR_HOSTS") {
            config.aggregator_hosts = parse_list(&value);
        }
        if let Some(value) = env_string("STREAMHOUND_TIMEOUT_MS") {
            config.timeout = parse_millis(&value).context("STREAMHOUND_TIMEOUT_MS")?;
        }
        if let Some(value) = env_string("STREAMHOUND_MAX_RETRIES") {
            config.max_retries = value
                .parse()
                .with_context(|| format!("invalid STREAMHOUND_MAX_RETRIES={value:?}"))?;
        }
        if let Some(value) = env_string("STREAMHOUND_RETRY_DELAY_MS") {
            config.retry_delay = parse_millis(&value).context("STREAMHOUND_RETRY_DELAY_MS")?;
        }
        if let Some(value) = env_string("STREAMHOUND_EPISODE_DELAY_MS") {
            config.episode_delay = parse_millis(&value).context("STREAMHOUND_EPISODE_DELAY_MS")?;
        }
        if let Some(value) = env_string("STREAMHOUND_DATA_DIR") {
            config.data_dir = PathBuf::from(value);
        }

        Ok(config)
    }
}

pub fn parse_base_url(raw: &str) -> anyhow::Result<Url> {
    let mut url = Url::parse(raw.trim()).context("parse url")?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("base url must be http/https: {url}");
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_millis(raw: &str) -> anyhow::Result<Duration> {
    let ms: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("expected milliseconds, got {raw:?}"))?;
    Ok(Duration::from_millis(ms))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_trailing_slash() {
        let url = parse_base_url("https://example.com/watch?x=1").unwrap();
        assert_eq!(url.as_str(), "https://example.com/watch/");
    }

    #[test]
    fn base_url_rejects_other_schemes() {
        let err = parse_base_url("ftp://example.com").unwrap_err().to_string();
        assert!(err.contains("http/https"));
    }

    #[test]
    fn list_parsing_trims_and_drops_empty() {
        assert_eq!(parse_list(" A, b ,,c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn millis_parsing() {
        assert_eq!(parse_millis("1500").unwrap(), Duration::from_millis(1500));
        assert!(parse_millis("soon").is_err());
    }
}
