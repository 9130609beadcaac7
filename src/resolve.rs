use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use scraper::{Html, Selector};
use url::Url;

use crate::cache::{self, Cache};
use crate::config::ScraperConfig;
use crate::error::{Result, ScrapeError};
use crate::fetch::Fetcher;
use crate::model::ResolvedSource;

/// Anchors that point at content pages on the upstream site, most specific first.
const CONTENT_LINK_SELECTORS: &[&str] = &[
    r#"a[href*="-episode-"]"#,
    r#"a[href*="-film-"]"#,
    r#"a[href*="-movie-"]"#,
    r#"a[href*="/anime/"]"#,
];

const CONTENT_MARKERS: &[&str] = &["-episode-", "-film-", "-movie-"];

static EPISODE_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-episode-(\d+)").expect("valid episode regex"));

/// Turns a free-text title into the upstream's URL slug.
///
/// `"One Piece Film: Red"` becomes `"one-piece-film-red"`.
pub fn slugify(title: &str) -> String {
    let mut cleaned = String::with_capacity(title.len());
    for ch in title.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' {
            cleaned.push(ch);
        } else if ch.is_whitespace() {
            cleaned.push(' ');
        }
    }

    let mut slug = String::with_capacity(cleaned.len());
    for ch in cleaned.split_whitespace().collect::<Vec<_>>().join("-").chars() {
        if ch == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(ch);
    }
    slug.trim_matches('-').to_string()
}

pub fn direct_episode_url(base_url: &Url, slug: &str, episode: u32) -> Result<Url> {
    base_url
        .join(&format!("{slug}-episode-{episode}/"))
        .map_err(|err| ScrapeError::InvalidInput(format!("build episode url for {slug}: {err}")))
}

/// Derives the stable content identifier from a resolved url.
///
/// Falls back to a timestamped synthetic id, so callers must not assume two
/// unresolvable urls share an id.
pub fn content_id_for(url: &Url) -> String {
    content_id_from_url(url)
        .unwrap_or_else(|| format!("unresolved-{}", chrono::Utc::now().timestamp_millis()))
}

fn content_id_from_url(url: &Url) -> Option<String> {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    for segment in segments.iter().rev() {
        for marker in CONTENT_MARKERS {
            if let Some(idx) = segment.find(marker) {
                if idx > 0 {
                    return Some(segment[..idx].to_string());
                }
            }
        }
    }

    segments
        .windows(2)
        .find(|pair| pair[0] == "anime")
        .map(|pair| pair[1].to_string())
}

/// Points a discovered content link at the requested episode.
///
/// Episode links get their number rewritten in place; series pages become the
/// constructed episode url; anything else is taken as is.
fn retarget_episode(link: &Url, base_url: &Url, episode: u32) -> Option<Url> {
    let path = link.path();
    if let Some(caps) = EPISODE_SEGMENT.captures(path) {
        if caps[1].parse::<u32>().ok() == Some(episode) {
            return Some(link.clone());
        }
        let rewritten = EPISODE_SEGMENT.replace(path, format!("-episode-{episode}").as_str());
        let mut out = link.clone();
        out.set_path(&rewritten);
        return Some(out);
    }

    let segments: Vec<&str> = link
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    if let [.., "anime", series] = segments.as_slice() {
        return direct_episode_url(base_url, series, episode).ok();
    }

    Some(link.clone())
}

#[derive(Debug, Clone)]
struct Anchor {
    href: Url,
    text: String,
}

struct SearchContext<'a> {
    base_url: &'a Url,
    slug: &'a str,
    title_tokens: Vec<String>,
    episode: u32,
}

/// One named way of picking the episode link off a search result page.
struct SearchStrategy {
    name: &'static str,
    run: fn(&SearchContext<'_>, &Html) -> Option<Url>,
}

const SEARCH_STRATEGIES: &[SearchStrategy] = &[
    SearchStrategy {
        name: "exact_selector",
        run: exact_selector,
    },
    SearchStrategy {
        name: "fuzzy_text",
        run: fuzzy_text,
    },
    SearchStrategy {
        name: "generic_selector",
        run: generic_selector,
    },
];

fn content_anchors(ctx: &SearchContext<'_>, doc: &Html) -> Vec<Anchor> {
    let mut out: Vec<Anchor> = Vec::new();
    for raw in CONTENT_LINK_SELECTORS {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        for element in doc.select(&selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let Ok(href) = ctx.base_url.join(href.trim()) else {
                continue;
            };
            if href.host_str() != ctx.base_url.host_str() {
                continue;
            }
            if out.iter().any(|a| a.href == href) {
                continue;
            }
            let text = element.text().collect::<Vec<_>>().join(" ");
            out.push(Anchor {
                href,
                text: text.split_whitespace().collect::<Vec<_>>().join(" "),
            });
        }
    }
    out
}

fn exact_selector(ctx: &SearchContext<'_>, doc: &Html) -> Option<Url> {
    let anchors = content_anchors(ctx, doc);
    let patterns = [
        format!("{}-episode-", ctx.slug),
        format!("{}-film-", ctx.slug),
        format!("{}-movie-", ctx.slug),
        format!("/anime/{}/", ctx.slug),
    ];

    for pattern in &patterns {
        let hit = anchors
            .iter()
            .find(|a| a.href.path().contains(pattern.as_str()));
        if let Some(anchor) = hit {
            return retarget_episode(&anchor.href, ctx.base_url, ctx.episode);
        }
    }
    None
}

fn fuzzy_text(ctx: &SearchContext<'_>, doc: &Html) -> Option<Url> {
    if ctx.title_tokens.is_empty() {
        return None;
    }
    let threshold = ctx.title_tokens.len().div_ceil(2).max(1);

    content_anchors(ctx, doc)
        .into_iter()
        .find(|anchor| fuzzy_score(&ctx.title_tokens, &anchor.text) >= threshold)
        .and_then(|anchor| retarget_episode(&anchor.href, ctx.base_url, ctx.episode))
}

fn generic_selector(ctx: &SearchContext<'_>, doc: &Html) -> Option<Url> {
    content_anchors(ctx, doc)
        .into_iter()
        .next()
        .and_then(|anchor| retarget_episode(&anchor.href, ctx.base_url, ctx.episode))
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

/// Counts title tokens that overlap some token of the link text.
fn fuzzy_score(title_tokens: &[String], link_text: &str) -> usize {
    let link_tokens = tokens(link_text);
    title_tokens
        .iter()
        .filter(|t| {
            link_tokens
                .iter()
                .any(|l| l.contains(t.as_str()) || t.contains(l.as_str()))
        })
        .count()
}

/// Runs the search-page strategies against one result page.
fn pick_from_search_page(
    base_url: &Url,
    slug: &str,
    title: &str,
    episode: u32,
    html: &str,
) -> Option<(Url, &'static str)> {
    let doc = Html::parse_document(html);
    let ctx = SearchContext {
        base_url,
        slug,
        title_tokens: tokens(title),
        episode,
    };
    SEARCH_STRATEGIES
        .iter()
        .find_map(|strategy| (strategy.run)(&ctx, &doc).map(|url| (url, strategy.name)))
}

/// Maps `(title, episode)` to the upstream episode page.
pub struct Resolver {
    fetcher: Fetcher,
    cache: Arc<dyn Cache>,
    base_url: Url,
    search_param: String,
    search_ttl: Duration,
}

impl Resolver {
    pub fn new(config: &ScraperConfig, fetcher: Fetcher, cache: Arc<dyn Cache>) -> Self {
        Self {
            fetcher,
            cache,
            base_url: config.base_url.clone(),
            search_param: config.search_param.clone(),
            search_ttl: config.search_ttl,
        }
    }

    pub fn search_url(&self, title: &str) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair(&self.search_param, title.trim());
        url
    }

    pub async fn resolve(&self, title: &str, episode: u32) -> Result<ResolvedSource> {
        let key = cache::search_key(title, episode);
        if let Some(hit) = cache::get_json::<ResolvedSource>(self.cache.as_ref(), &key).await {
            tracing::debug!(title, episode, url = %hit.canonical_url, "search cache hit");
            return Ok(hit);
        }

        let resolved = self.resolve_uncached(title, episode).await?;
        cache::set_json(self.cache.as_ref(), &key, &resolved, self.search_ttl).await;
        Ok(resolved)
    }

    async fn resolve_uncached(&self, title: &str, episode: u32) -> Result<ResolvedSource> {
        let slug = slugify(title);
        let not_found = || ScrapeError::NotFound {
            title: title.to_string(),
            episode,
        };
        if slug.is_empty() {
            return Err(not_found());
        }

        let direct = direct_episode_url(&self.base_url, &slug, episode)?;
        let status = self.fetcher.probe(&direct).await?;
        if status == StatusCode::OK {
            tracing::info!(title, episode, url = %direct, strategy = "direct", "resolved");
            return Ok(resolved_from(direct));
        }
        tracing::debug!(url = %direct, %status, "direct probe missed; searching");

        let search_url = self.search_url(title);
        let Some(html) = self.fetcher.get_html(&search_url).await? else {
            return Err(not_found());
        };

        match pick_from_search_page(&self.base_url, &slug, title, episode, &html) {
            Some((url, strategy)) => {
                tracing::info!(title, episode, url = %url, strategy, "resolved");
                Ok(resolved_from(url))
            }
            None => Err(not_found()),
        }
    }
}

fn resolved_from(url: Url) -> ResolvedSource {
    ResolvedSource {
        content_id: content_id_for(&url),
        canonical_url: url.to_string(),
    }
}
