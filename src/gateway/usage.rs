//! Per-attempt usage records.
//!
//! Every attempt the gateway makes, retries included, produces one
//! `UsageRecord` tagged with the run, stage and agent that asked for it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::error::ProviderError;
use super::types::{CompletionRequest, CompletionResponse};

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub at: DateTime<Utc>,
    pub model: String,
    pub run_id: Option<Uuid>,
    pub stage: &'static str,
    pub agent: usize,
    /// 0 for the first try of a call.
    pub attempt: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub latency_ms: u64,
    /// `ProviderError::code` of a failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl UsageRecord {
    fn base(req: &CompletionRequest, attempt: u32) -> Self {
        Self {
            at: Utc::now(),
            model: req.model.clone(),
            run_id: req.attribution.run_id,
            stage: req.attribution.stage,
            agent: req.attribution.agent,
            attempt,
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            latency_ms: 0,
            error_code: None,
            request_id: None,
        }
    }

    pub fn succeeded(req: &CompletionRequest, resp: &CompletionResponse, attempt: u32) -> Self {
        Self {
            input_tokens: resp.input_tokens,
            output_tokens: resp.output_tokens,
            cost_nanodollars: resp.cost_nanodollars,
            latency_ms: resp.latency.as_millis() as u64,
            ..Self::base(req, attempt)
        }
    }

    pub fn failed(req: &CompletionRequest, err: &ProviderError, attempt: u32) -> Self {
        Self {
            error_code: Some(err.code()),
            request_id: err.request_id().map(str::to_string),
            ..Self::base(req, attempt)
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_code.is_none()
    }
}

/// Destination for usage records. Recording never fails the call.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: UsageRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: UsageRecord) {}
}

/// Writes each record to stderr as one JSON line.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrUsageSink;

#[async_trait]
impl UsageSink for StderrUsageSink {
    async fn record(&self, record: UsageRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => eprintln!("{line}"),
            Err(e) => tracing::warn!(error = %e, "failed to encode usage record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Attribution, Part};
    use std::time::Duration;

    fn request() -> CompletionRequest {
        CompletionRequest::new(
            "gemini-2.5-flash",
            vec![],
            vec![Part::text("q")],
            "",
            Attribution::new("refine").agent(3).run(Uuid::nil()),
        )
    }

    #[test]
    fn test_records_carry_stage_agent_and_attempt() {
        let mut resp = CompletionResponse::from_text("ok");
        resp.input_tokens = 7;
        resp.output_tokens = 2;
        resp.latency = Duration::from_millis(40);

        let ok = UsageRecord::succeeded(&request(), &resp, 1);
        assert!(ok.is_success());
        assert_eq!((ok.stage, ok.agent, ok.attempt), ("refine", 3, 1));
        assert_eq!(ok.run_id, Some(Uuid::nil()));
        assert_eq!((ok.input_tokens, ok.output_tokens, ok.latency_ms), (7, 2, 40));

        let err = ProviderError::service("gemini", "x", true);
        let failed = UsageRecord::failed(&request(), &err, 0);
        assert!(!failed.is_success());
        assert_eq!(failed.error_code, Some("service_error"));
        assert_eq!(failed.input_tokens, 0);
    }

    #[test]
    fn test_success_line_omits_error_fields() {
        let line = serde_json::to_value(UsageRecord::succeeded(
            &request(),
            &CompletionResponse::from_text("ok"),
            0,
        ))
        .unwrap();
        assert_eq!(line["stage"], "refine");
        assert_eq!(line["agent"], 3);
        assert!(line.get("error_code").is_none());
    }
}
