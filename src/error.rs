use thiserror::Error;

/// Failures of one resolve/extract/persist cycle.
///
/// The orchestrator retries every variant identically; the split exists so
/// callers and logs can tell "nothing matched" apart from "the network broke".
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("no content found for {title:?} episode {episode}")]
    NotFound { title: String, episode: u32 },

    #[error("no stream url found on {0}")]
    StreamNotFound(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cancelled")]
    Cancelled,
}

impl ScrapeError {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn persistence(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }
}

impl From<reqwest::Error> for ScrapeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

pub type Result<T, E = ScrapeError> = std::result::Result<T, E>;
