//! Draft → refine → synthesize answer pipeline.
//!
//! One user query becomes one answer built from several completion calls:
//! 1. **Draft**: a single agent writes a first answer
//! 2. **Refine**: N agents independently improve the draft, concurrently
//! 3. **Synthesize**: one agent merges the labeled refinements into the final answer
//!
//! Single-call modes skip the overlay entirely. An empty draft short-circuits
//! the run with the draft itself as the answer.

pub mod aggregate;
pub mod executor;
pub mod orchestrator;
pub mod progress;
pub mod trace;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigurationError;
use crate::gateway::{Citation, CompletionResponse, Part, ProviderError};

pub use aggregate::{aggregate, refined_response_header};
pub use executor::{StageError, StageExecutor, StageResult};
pub use orchestrator::{PipelineOrchestrator, PipelineRun, RunInput};
pub use progress::{ChannelProgress, ObserverError, ProgressEvent, ProgressObserver};
pub use trace::{JsonlTraceSink, StageTrace, TraceError, TraceSink, TraceWorker};

/// Which call of the pipeline a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Direct call used by single-call modes.
    Single,
    Draft,
    Refine,
    Synthesize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Single => "single",
            Stage::Draft => "draft",
            Stage::Refine => "refine",
            Stage::Synthesize => "synthesize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a [`PipelineRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Drafting,
    Refining,
    Synthesizing,
    Done,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_advance_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (Idle, Drafting) => true,
            (Drafting, Refining) | (Drafting, Done) => true,
            (Refining, Synthesizing) => true,
            (Synthesizing, Done) => true,
            _ => false,
        }
    }
}

/// Token and cost totals across every successful call of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunUsage {
    pub calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

impl RunUsage {
    pub(crate) fn add(&mut self, resp: &CompletionResponse) {
        self.calls += 1;
        self.input_tokens = self.input_tokens.saturating_add(resp.input_tokens as u64);
        self.output_tokens = self.output_tokens.saturating_add(resp.output_tokens as u64);
        self.cost_nanodollars = self.cost_nanodollars.saturating_add(resp.cost_nanodollars);
    }
}

/// The answer handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub parts: Vec<Part>,
    pub citations: Vec<Citation>,
    /// True when an empty draft ended the run early.
    #[serde(default)]
    pub draft_fallback: bool,
    #[serde(default)]
    pub usage: RunUsage,
}

impl FinalResult {
    /// Concatenation of all text parts.
    pub fn text(&self) -> String {
        crate::gateway::parts_text(&self.parts, "")
    }
}

/// Errors that end a run. A failed run never yields a partial answer.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// A completion call failed. `agent` is 1-based across the whole run:
    /// the drafter is agent 1, refiners follow, the synthesizer is last.
    #[error("{stage} stage failed (agent {agent}): {source}")]
    Stage {
        stage: Stage,
        agent: usize,
        #[source]
        source: ProviderError,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("run cancelled during {stage} stage")]
    Cancelled { stage: Stage },
    /// The run-level limit elapsed while `stage` was in flight.
    #[error("run timed out after {limit:?} during {stage} stage")]
    TimedOut { stage: Stage, limit: Duration },
    #[error("trace error: {0}")]
    Trace(#[from] TraceError),
}

impl PipelineError {
    /// Stage the run was in when it failed, when known.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. }
            | Self::Cancelled { stage }
            | Self::TimedOut { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
