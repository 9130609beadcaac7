use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::browser::{BrowserFactory, BrowserSession, SessionOptions};
use crate::config::ScraperConfig;
use crate::error::{Result, ScrapeError};
use crate::fetch::Fetcher;
use crate::model::{ExtractionResult, ResolvedSource};

/// Strategy name reported when nothing on the page looked like a stream.
pub const PAGE_FALLBACK: &str = "page_fallback";
const PLAYER_IFRAME: &str = "player_iframe";

const PLAYER_WAIT_SELECTOR: &str = "iframe, video";

/// Player-container iframes first; the bare `iframe` is the last resort.
const IFRAME_SELECTORS: &[&str] = &[
    "#pembed iframe",
    "#player iframe",
    "#embed_holder iframe",
    ".player-embed iframe",
    ".video-content iframe",
    ".player iframe",
    r#"div[class*="player"] iframe"#,
    "iframe",
];

static MARKUP_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"["']([^"'\s]*(?:\.m3u8|embed|player)[^"'\s]*)["']"#)
        .expect("valid markup url regex")
});

static GENERIC_STREAM_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)https?://[^"'\s<>]*(?:stream|video|player)[^"'\s<>]*"#)
        .expect("valid generic stream regex")
});

/// Rendered page handed to each strategy.
struct Snapshot<'a> {
    doc: Html,
    markup: &'a str,
    page_url: &'a Url,
}

struct Strategy {
    name: &'static str,
    run: fn(&Snapshot<'_>) -> Option<Url>,
}

const STRATEGIES: &[Strategy] = &[
    Strategy {
        name: PLAYER_IFRAME,
        run: player_iframe,
    },
    Strategy {
        name: "video_src",
        run: video_src,
    },
    Strategy {
        name: "video_source",
        run: video_source,
    },
    Strategy {
        name: "markup_scan",
        run: markup_scan,
    },
];

fn first_attr(doc: &Html, selector: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    doc.select(&selector)
        .filter_map(|el| el.value().attr(attr))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

/// Accepts `http(s)://…` and protocol-relative `//…` sources only.
fn absolute_src(raw: &str, page_url: &Url) -> Option<Url> {
    let url = if raw.starts_with("//") {
        page_url.join(raw).ok()?
    } else {
        Url::parse(raw).ok()?
    };
    matches!(url.scheme(), "http" | "https").then_some(url)
}

fn player_iframe(snap: &Snapshot<'_>) -> Option<Url> {
    IFRAME_SELECTORS.iter().find_map(|selector| {
        let selector = Selector::parse(selector).ok()?;
        snap.doc
            .select(&selector)
            .filter_map(|el| el.value().attr("src"))
            .find_map(|src| absolute_src(src.trim(), snap.page_url))
    })
}

fn media_src(snap: &Snapshot<'_>, selector: &str) -> Option<Url> {
    let src = first_attr(&snap.doc, selector, "src")?;
    let url = snap.page_url.join(&src).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

fn video_src(snap: &Snapshot<'_>) -> Option<Url> {
    media_src(snap, "video[src]")
}

fn video_source(snap: &Snapshot<'_>) -> Option<Url> {
    media_src(snap, "video source[src]")
}

fn markup_scan(snap: &Snapshot<'_>) -> Option<Url> {
    MARKUP_URL
        .captures_iter(snap.markup)
        .map(|caps| caps[1].replace("\\/", "/"))
        .filter(|candidate| candidate.contains("http"))
        .find_map(|candidate| Url::parse(&candidate).ok())
}

fn run_strategies(markup: &str, page_url: &Url) -> Option<(Url, &'static str)> {
    let snap = Snapshot {
        doc: Html::parse_document(markup),
        markup,
        page_url,
    };
    STRATEGIES
        .iter()
        .find_map(|strategy| (strategy.run)(&snap).map(|url| (url, strategy.name)))
}

/// Finds the stream inside an aggregator page.
///
/// The preferred mirror wins over any generic stream/video/player url even
/// when the generic one appears first.
fn pick_nested_stream(markup: &str, preferred: &Regex) -> Option<Url> {
    let markup = markup.replace("\\/", "/");
    preferred
        .find(&markup)
        .or_else(|| GENERIC_STREAM_URL.find(&markup))
        .and_then(|m| Url::parse(m.as_str()).ok())
}

fn preferred_mirror_regex(mirror: &str) -> Regex {
    let pattern = format!(r#"(?i)https?://[^"'\s<>]*{}[^"'\s<>]*"#, regex::escape(mirror));
    Regex::new(&pattern).unwrap_or_else(|_| GENERIC_STREAM_URL.clone())
}

/// Turns a resolved episode page into a playable stream url.
pub struct Extractor {
    browser: Arc<dyn BrowserFactory>,
    fetcher: Fetcher,
    aggregator_hosts: Vec<String>,
    preferred_mirror: Regex,
}

impl Extractor {
    pub fn new(config: &ScraperConfig, fetcher: Fetcher, browser: Arc<dyn BrowserFactory>) -> Self {
        Self {
            browser,
            fetcher,
            aggregator_hosts: config
                .aggregator_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            preferred_mirror: preferred_mirror_regex(&config.preferred_mirror),
        }
    }

    pub async fn extract(
        &self,
        resolved: &ResolvedSource,
        options: &SessionOptions,
    ) -> Result<ExtractionResult> {
        let page_url = Url::parse(&resolved.canonical_url).map_err(|err| {
            ScrapeError::InvalidInput(format!("episode url {}: {err}", resolved.canonical_url))
        })?;

        let mut session = self.browser.open(options).await?;
        let rendered = render(session.as_mut(), &page_url, options).await;
        session.close().await;
        let markup = rendered?;

        if markup.trim().is_empty() {
            return Err(ScrapeError::StreamNotFound(page_url.to_string()));
        }

        let Some((found, strategy)) = run_strategies(&markup, &page_url) else {
            tracing::warn!(url = %page_url, "no stream found; falling back to page url");
            return Ok(ExtractionResult {
                stream_url: page_url.to_string(),
                extracted_at: Utc::now(),
                host_chain: Vec::new(),
                strategy: PAGE_FALLBACK.to_string(),
            });
        };
        tracing::debug!(url = %page_url, stream = %found, strategy, "strategy matched");

        if strategy == PLAYER_IFRAME && self.is_aggregator(&found) {
            return self.follow_aggregator(found).await;
        }

        Ok(ExtractionResult {
            stream_url: found.to_string(),
            extracted_at: Utc::now(),
            host_chain: Vec::new(),
            strategy: strategy.to_string(),
        })
    }

    fn is_aggregator(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.aggregator_hosts.iter().any(|h| host.contains(h.as_str()))
    }

    /// One level of nested embed: plain GET, no second browser navigation.
    async fn follow_aggregator(&self, iframe: Url) -> Result<ExtractionResult> {
        let nested = match self.fetcher.get_html(&iframe).await? {
            Some(markup) => pick_nested_stream(&markup, &self.preferred_mirror),
            None => None,
        };

        let (stream_url, strategy) = match nested {
            Some(url) => (url.to_string(), "nested_embed"),
            None => {
                tracing::debug!(iframe = %iframe, "aggregator had no stream; keeping iframe");
                (iframe.to_string(), PLAYER_IFRAME)
            }
        };

        Ok(ExtractionResult {
            stream_url,
            extracted_at: Utc::now(),
            host_chain: vec![iframe.to_string()],
            strategy: strategy.to_string(),
        })
    }
}

async fn render(
    session: &mut dyn BrowserSession,
    page_url: &Url,
    options: &SessionOptions,
) -> Result<String> {
    session.navigate(page_url).await?;
    if !session.wait_for(PLAYER_WAIT_SELECTOR, options.timeout).await? {
        tracing::debug!(url = %page_url, "no player element before timeout");
    }
    session.content().await
}
