//! Core types for the completion gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Where a request sits within a pipeline run.
///
/// The gateway copies this onto every usage record, so spend can be broken
/// down by run, stage and agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attribution {
    pub run_id: Option<Uuid>,
    /// Stage name, e.g. "draft" or "refine".
    pub stage: &'static str,
    /// 1-based agent number within the run. 0 outside a run.
    pub agent: usize,
}

impl Attribution {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            ..Default::default()
        }
    }

    pub fn agent(mut self, agent: usize) -> Self {
        self.agent = agent;
        self
    }

    pub fn run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

// =============================================================================
// CONTENT TYPES
// =============================================================================

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// Binary payload carried inline, already base64-encoded by whoever produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

/// One piece of turn content.
///
/// Serialized as `{"text": "..."}` or `{"inline_data": {"mime_type": .., "data": ..}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn inline(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Part::InlineData {
            inline_data: InlineData {
                mime_type: mime_type.into(),
                data: data.into(),
            },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            Part::InlineData { .. } => None,
        }
    }

    /// Approximate payload size in bytes.
    pub fn payload_len(&self) -> usize {
        match self {
            Part::Text { text } => text.len(),
            Part::InlineData { inline_data } => inline_data.data.len(),
        }
    }
}

/// Join the text parts of `parts` with `separator`, skipping binary payloads.
pub fn parts_text(parts: &[Part], separator: &str) -> String {
    parts
        .iter()
        .filter_map(Part::as_text)
        .collect::<Vec<_>>()
        .join(separator)
}

/// A conversation turn: one author, ordered content parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Model,
            parts,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![Part::text(text)])
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self::model(vec![Part::text(text)])
    }
}

/// A grounding source attached to a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub uri: String,
    pub title: String,
}

/// Per-request tool and reasoning flags.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolConfig {
    /// Attach the provider's web search tool.
    #[serde(default)]
    pub enable_search: bool,
    /// Ask the model to skip its internal reasoning phase.
    #[serde(default)]
    pub disable_reasoning: bool,
}

// =============================================================================
// REQUEST / RESPONSE
// =============================================================================

/// Request for one completion.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Provider model id, e.g. "gemini-2.5-flash".
    pub model: String,
    /// Conversation so far, oldest first.
    pub prior_turns: Vec<Turn>,
    /// Parts of the new user turn. May be empty when the conversation already
    /// ends with the content the model should respond to.
    pub new_turn: Vec<Part>,
    /// System instruction sent alongside the conversation.
    pub system_instruction: String,
    pub tool_config: ToolConfig,
    /// Sampling temperature; provider default when unset.
    pub temperature: Option<f32>,
    /// Maximum tokens to generate; provider default when unset.
    pub max_output_tokens: Option<u32>,
    /// Attribution for cost tracking.
    pub attribution: Attribution,
}

impl CompletionRequest {
    pub fn new(
        model: impl Into<String>,
        prior_turns: Vec<Turn>,
        new_turn: Vec<Part>,
        system_instruction: impl Into<String>,
        attribution: Attribution,
    ) -> Self {
        Self {
            model: model.into(),
            prior_turns,
            new_turn,
            system_instruction: system_instruction.into(),
            tool_config: ToolConfig::default(),
            temperature: None,
            max_output_tokens: None,
            attribution,
        }
    }

    pub fn tools(mut self, tool_config: ToolConfig) -> Self {
        self.tool_config = tool_config;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }

    /// Total payload size across all turns, the new turn and the instruction.
    pub fn payload_len(&self) -> usize {
        let turns: usize = self
            .prior_turns
            .iter()
            .flat_map(|t| t.parts.iter())
            .map(Part::payload_len)
            .sum();
        let new_turn: usize = self.new_turn.iter().map(Part::payload_len).sum();
        turns + new_turn + self.system_instruction.len()
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    Recitation,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("STOP") => FinishReason::Stop,
            Some("MAX_TOKENS") => FinishReason::MaxTokens,
            Some("SAFETY") => FinishReason::Safety,
            Some("RECITATION") => FinishReason::Recitation,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// Response from one completion.
///
/// Zero parts is a legal outcome: the provider answered without content.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Generated content, in provider order.
    pub parts: Vec<Part>,
    /// Grounding sources, in provider order, de-duplicated by uri.
    pub citations: Vec<Citation>,
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Cost in nanodollars.
    pub cost_nanodollars: i64,
    /// Time taken for the request.
    pub latency: Duration,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
}

impl CompletionResponse {
    /// Response carrying `parts` and nothing else. Used by stubs and fallbacks.
    pub fn from_parts(parts: Vec<Part>) -> Self {
        Self {
            parts,
            citations: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            latency: Duration::from_millis(0),
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        Self::from_parts(vec![Part::text(text)])
    }

    pub fn empty() -> Self {
        let mut resp = Self::from_parts(Vec::new());
        resp.finish_reason = FinishReason::Unknown("empty".to_string());
        resp
    }

    /// Concatenation of all text parts.
    pub fn text(&self) -> String {
        parts_text(&self.parts, "")
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}
