use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ACCEPT, USER_AGENT};
use url::Url;

use crate::config::ScraperConfig;
use crate::error::{Result, ScrapeError};

const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;
const HTML_ACCEPT: &str = "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8";

/// Plain HTTP access to upstream pages, shared by the resolver, the nested
/// embed hop and the protection check.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    user_agent: String,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    /// Body, cut at the size limit.
    pub text: String,
}

impl Fetcher {
    pub fn new(config: &ScraperConfig) -> Result<Self> {
        Self::with_timeout(&config.user_agent, config.timeout)
    }

    pub fn with_timeout(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|err| ScrapeError::Network(format!("build http client: {err}")))?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
        })
    }

    /// Returns the response status without reading the body.
    pub async fn probe(&self, url: &Url) -> Result<StatusCode> {
        let resp = self
            .client
            .get(url.clone())
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, HTML_ACCEPT)
            .send()
            .await
            .map_err(|err| ScrapeError::Network(format!("GET {url}: {err}")))?;
        Ok(resp.status())
    }

    pub async fn get(&self, url: &Url) -> Result<FetchedPage> {
        let resp = self
            .client
            .get(url.clone())
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, HTML_ACCEPT)
            .send()
            .await
            .map_err(|err| ScrapeError::Network(format!("GET {url}: {err}")))?;

        let status = resp.status();
        let (text, truncated) = read_text_limited(resp, MAX_BODY_BYTES)
            .await
            .map_err(|err| ScrapeError::Network(format!("read {url}: {err}")))?;
        if truncated {
            tracing::debug!(url = %url, "response body truncated");
        }

        Ok(FetchedPage { status, text })
    }

    /// Like [`Fetcher::get`] but treats any non-2xx status as `Ok(None)`.
    pub async fn get_html(&self, url: &Url) -> Result<Option<String>> {
        let page = self.get(url).await?;
        if !page.status.is_success() {
            tracing::debug!(url = %url, status = %page.status, "non-success response");
            return Ok(None);
        }
        Ok(Some(page.text))
    }
}

async fn read_text_limited(
    mut resp: reqwest::Response,
    limit: usize,
) -> std::result::Result<(String, bool), reqwest::Error> {
    let mut out: Vec<u8> = Vec::new();
    let mut truncated = false;

    while let Some(chunk) = resp.chunk().await? {
        if out.len() + chunk.len() > limit {
            let remaining = limit.saturating_sub(out.len());
            out.extend_from_slice(&chunk[..remaining]);
            truncated = true;
            break;
        }
        out.extend_from_slice(&chunk);
    }

    Ok((String::from_utf8_lossy(&out).into_owned(), truncated))
}
