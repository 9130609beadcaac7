use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::config::ScraperConfig;
use crate::fetch::Fetcher;
use crate::model::ProtectionVerdict;

struct Heuristic {
    reason: &'static str,
    pattern: &'static str,
    cloudflare: bool,
}

const HEURISTICS: &[Heuristic] = &[
    Heuristic {
        reason: "self/top window comparison",
        pattern: r"(?:window\.)?(?:self|top)\s*!==?\s*(?:window\.)?(?:top|self)",
        cloudflare: false,
    },
    Heuristic {
        reason: "top-level location access",
        pattern: r"(?:window\.)?top\.location",
        cloudflare: false,
    },
    Heuristic {
        reason: "frameElement check",
        pattern: r"frameElement",
        cloudflare: false,
    },
    Heuristic {
        reason: "cloudflare marker",
        pattern: r"(?i)cloudflare",
        cloudflare: true,
    },
    Heuristic {
        reason: "challenge-platform marker",
        pattern: r"challenge-platform",
        cloudflare: true,
    },
];

static COMPILED: LazyLock<Vec<(&'static Heuristic, Regex)>> = LazyLock::new(|| {
    HEURISTICS
        .iter()
        .map(|h| (h, Regex::new(h.pattern).expect("valid protection heuristic")))
        .collect()
});

static DATA_SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\sdata-src\s*="#).expect("valid data-src regex"));
static DIRECT_SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\ssrc\s*="#).expect("valid src regex"));

/// Classifies markup against the anti-embedding heuristics.
///
/// `exempt` marks the preferred mirror: Cloudflare markers are ignored for it
/// and its verdict is never `protected`.
pub fn analyze(markup: &str, exempt: bool) -> ProtectionVerdict {
    let mut verdict = ProtectionVerdict::default();

    for (heuristic, regex) in COMPILED.iter() {
        if exempt && heuristic.cloudflare {
            continue;
        }
        if regex.is_match(markup) {
            verdict.add_reason(heuristic.reason);
        }
    }
    if DATA_SRC.is_match(markup) && !DIRECT_SRC.is_match(markup) {
        verdict.add_reason("data-src without direct src");
    }

    verdict.protected = !verdict.reasons.is_empty() && !exempt;
    verdict
}

pub struct ProtectionDetector {
    fetcher: Fetcher,
    exempt_host: String,
}

impl ProtectionDetector {
    pub fn new(config: &ScraperConfig, fetcher: Fetcher) -> Self {
        Self {
            fetcher,
            exempt_host: config.preferred_mirror.to_ascii_lowercase(),
        }
    }

    pub fn is_exempt(&self, url: &Url) -> bool {
        !self.exempt_host.is_empty()
            && url
                .host_str()
                .is_some_and(|h| h.to_ascii_lowercase().contains(&self.exempt_host))
    }

    /// Never fails: anything that stops the check yields `protected = true`.
    pub async fn check(&self, stream_url: &str) -> ProtectionVerdict {
        let url = match Url::parse(stream_url) {
            Ok(url) => url,
            Err(err) => return failed_check(&err.to_string()),
        };

        match self.fetcher.get(&url).await {
            Ok(page) => {
                let verdict = analyze(&page.text, self.is_exempt(&url));
                tracing::debug!(url = %url, protected = verdict.protected, reasons = ?verdict.reasons, "protection check");
                verdict
            }
            Err(err) => {
                tracing::warn!(url = %url, %err, "protection check failed; assuming protected");
                failed_check(&err.to_string())
            }
        }
    }
}

fn failed_check(message: &str) -> ProtectionVerdict {
    ProtectionVerdict {
        protected: true,
        reasons: vec![format!("check failed: {message}")],
    }
}
