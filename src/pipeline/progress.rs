//! Progress events for surfacing pipeline stages to a user.
//!
//! Events are advisory: a failing observer is logged and ignored, never
//! allowed to change the outcome of a run.

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{RunStatus, Stage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub run_id: Uuid,
    pub stage: Stage,
    pub status: RunStatus,
    /// Human-readable label, e.g. "Agent 1: Initial Draft...".
    pub label: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error("{0}")]
    Message(String),
}

#[async_trait::async_trait]
pub trait ProgressObserver: Send + Sync {
    async fn on_progress(&self, event: ProgressEvent) -> Result<(), ObserverError>;
}

/// Observer that forwards events into a channel.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait::async_trait]
impl ProgressObserver for ChannelProgress {
    async fn on_progress(&self, event: ProgressEvent) -> Result<(), ObserverError> {
        self.sender
            .send(event)
            .map_err(|_| ObserverError::Message("progress receiver dropped".to_string()))
    }
}

pub fn single_label() -> String {
    "Generating Response...".to_string()
}

pub fn draft_label() -> String {
    "Agent 1: Initial Draft...".to_string()
}

/// Refiners are agents 2 through `refiners + 1`.
pub fn refine_label(refiners: u32) -> String {
    if refiners == 1 {
        "Agent 2: Refining...".to_string()
    } else {
        format!("Agents 2-{}: Refining...", refiners + 1)
    }
}

pub fn synthesize_label() -> String {
    "Synthesizing Final Answer...".to_string()
}
