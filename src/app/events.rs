use serde::Serialize;
use tokio::sync::mpsc;

use crate::app::model::{BatchSummary, EpisodeOutcome};

/// Live status of a batch run. Never persisted.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BatchProgressEvent {
    Start {
        total: usize,
        message: String,
    },
    Progress {
        episode: u32,
        current: usize,
        total: usize,
        status: String,
    },
    Success {
        episode: u32,
        current: usize,
        total: usize,
        status: String,
        url: String,
    },
    Error {
        episode: u32,
        current: usize,
        total: usize,
        status: String,
        error: String,
    },
    Complete {
        message: String,
        summary: BatchSummary,
        results: Vec<EpisodeOutcome>,
    },
}

impl BatchProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

pub type EventSender = mpsc::Sender<BatchProgressEvent>;
pub type EventReceiver = mpsc::Receiver<BatchProgressEvent>;

pub fn channel(buffer: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(buffer.max(1))
}

/// Sends unless the consumer went away; a vanished consumer never stops the run.
pub(crate) async fn emit(events: Option<&EventSender>, event: BatchProgressEvent) {
    let Some(tx) = events else {
        return;
    };
    if tx.send(event).await.is_err() {
        tracing::debug!("progress consumer disconnected; dropping event");
    }
}
