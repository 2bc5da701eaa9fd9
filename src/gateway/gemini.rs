//! Gemini adapter for `generateContent` completions.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ProviderError, ServiceDetail};
use super::pricing::completion_cost;
use super::types::*;

// =============================================================================
// TRAIT
// =============================================================================

/// Trait for completion providers.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn generate(&self, req: &CompletionRequest) -> Result<CompletionResponse, ProviderError>;
}

// =============================================================================
// GEMINI ADAPTER
// =============================================================================

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Maximum allowed response body length (8MB, leaves room for inline images).
const MAX_RESPONSE_LEN: usize = 8 * 1_024 * 1_024;

/// Maximum allowed request payload (inline request limit is 20MB).
const MAX_INPUT_BYTES: usize = 20 * 1_024 * 1_024;

/// Wait suggested for a 429 that carries no `Retry-After` header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Gemini API adapter.
#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl GeminiAdapter {
    /// Create from API key.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, Duration::from_secs(120))
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| ProviderError::config("GEMINI_API_KEY not set"))?;

        let base_url =
            std::env::var("GEMINI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());

        let timeout = std::env::var("GEMINI_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        Self::with_config(api_key, base_url, timeout)
    }

    /// Create with custom configuration.
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let key_value = HeaderValue::from_str(&api_key)
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert("x-goog-api-key", key_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    fn generate_url(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.base_url, model)
    }

    /// Extract request ID from response headers.
    fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn transport_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Transport(err)
        }
    }

    fn error_for_status(
        message: String,
        detail: ServiceDetail,
        retry_after: Option<Duration>,
    ) -> ProviderError {
        match detail.http_status.unwrap_or_default() {
            429 => ProviderError::RateLimited {
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
                detail,
            },
            401 | 403 => ProviderError::Auth { message, detail },
            400 | 404 | 413 => ProviderError::InvalidRequest { message, detail },
            status => ProviderError::Service {
                provider: "gemini",
                message,
                retryable: status >= 500,
                detail,
            },
        }
    }
}

/// `Retry-After` in whole seconds. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<ApiContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ApiInstruction<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct ApiContent<'a> {
    role: &'static str,
    parts: Vec<ApiPart<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ApiPart<'a> {
    Text {
        text: &'a str,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: ApiBlob<'a>,
    },
}

impl<'a> From<&'a Part> for ApiPart<'a> {
    fn from(p: &'a Part) -> Self {
        match p {
            Part::Text { text } => ApiPart::Text { text },
            Part::InlineData { inline_data } => ApiPart::InlineData {
                inline_data: ApiBlob {
                    mime_type: &inline_data.mime_type,
                    data: &inline_data.data,
                },
            },
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiBlob<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Serialize)]
struct ApiInstruction<'a> {
    parts: Vec<ApiPart<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiTool {
    google_search: EmptyObject,
}

#[derive(Serialize)]
struct EmptyObject {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    inline_data: Option<ResponseBlob>,
    #[serde(default)]
    thought: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseBlob {
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Deserialize)]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Deserialize)]
struct WebSource {
    uri: Option<String>,
    title: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
    thoughts_token_count: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    status: Option<String>,
}

fn build_api_request(req: &CompletionRequest) -> GenerateContentRequest<'_> {
    let mut contents: Vec<ApiContent<'_>> = req
        .prior_turns
        .iter()
        .map(|turn| ApiContent {
            role: turn.role.as_str(),
            parts: turn.parts.iter().map(ApiPart::from).collect(),
        })
        .collect();

    if !req.new_turn.is_empty() {
        contents.push(ApiContent {
            role: Role::User.as_str(),
            parts: req.new_turn.iter().map(ApiPart::from).collect(),
        });
    }

    let system_instruction = if req.system_instruction.trim().is_empty() {
        None
    } else {
        Some(ApiInstruction {
            parts: vec![ApiPart::Text {
                text: &req.system_instruction,
            }],
        })
    };

    let tools = if req.tool_config.enable_search {
        vec![ApiTool {
            google_search: EmptyObject {},
        }]
    } else {
        Vec::new()
    };

    let thinking_config = req
        .tool_config
        .disable_reasoning
        .then_some(ThinkingConfig { thinking_budget: 0 });

    let generation_config = if req.temperature.is_some()
        || req.max_output_tokens.is_some()
        || thinking_config.is_some()
    {
        Some(GenerationConfig {
            temperature: req.temperature,
            max_output_tokens: req.max_output_tokens,
            thinking_config,
        })
    } else {
        None
    };

    GenerateContentRequest {
        contents,
        system_instruction,
        tools,
        generation_config,
    }
}

fn collect_citations(metadata: Option<GroundingMetadata>) -> Vec<Citation> {
    let mut citations: Vec<Citation> = Vec::new();
    let chunks = metadata.map(|m| m.grounding_chunks).unwrap_or_default();
    for web in chunks.into_iter().filter_map(|c| c.web) {
        let Some(uri) = web.uri.filter(|u| !u.trim().is_empty()) else {
            continue;
        };
        if citations.iter().any(|c| c.uri == uri) {
            continue;
        }
        let title = web.title.unwrap_or_else(|| uri.clone());
        citations.push(Citation { uri, title });
    }
    citations
}

// =============================================================================
// COMPLETION PROVIDER IMPL
// =============================================================================

#[async_trait]
impl CompletionProvider for GeminiAdapter {
    async fn generate(&self, req: &CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let total_bytes = req.payload_len();
        if total_bytes > MAX_INPUT_BYTES {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_bytes} bytes (max {MAX_INPUT_BYTES})"
            )));
        }

        let start = Instant::now();
        let api_req = build_api_request(req);

        let mut response = self
            .client
            .post(self.generate_url(&req.model))
            .json(&api_req)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());
        let retry_after = parse_retry_after(response.headers());

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.transport_error(e))? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::service(
                    "gemini",
                    format!("Response too large: {new_len} bytes"),
                    false,
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes).to_string();

        if !status.is_success() {
            let api_error = serde_json::from_str::<GenerateContentResponse>(&body)
                .ok()
                .and_then(|p| p.error);
            let detail = ServiceDetail {
                http_status: Some(status.as_u16()),
                reason: api_error.as_ref().and_then(|e| e.status.clone()),
                request_id,
            };
            let message = api_error
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(Self::error_for_status(message, detail, retry_after));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::service("gemini", format!("Invalid JSON: {e}"), false))?;

        if let Some(error) = parsed.error {
            return Err(ProviderError::service(
                "gemini",
                error.message.unwrap_or_default(),
                false,
            ));
        }

        let (input_tokens, output_tokens) = parsed
            .usage_metadata
            .map(|u| {
                let output = u
                    .candidates_token_count
                    .unwrap_or(0)
                    .saturating_add(u.thoughts_token_count.unwrap_or(0));
                (u.prompt_token_count.unwrap_or(0), output)
            })
            .unwrap_or((0, 0));

        // No candidate is an empty answer, not a failure: the pipeline decides
        // what an empty draft means.
        let (parts, citations, finish_reason) = match parsed.candidates.into_iter().next() {
            Some(candidate) => {
                let parts = candidate
                    .content
                    .map(|c| c.parts)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|p| !p.thought)
                    .filter_map(|p| match (p.text, p.inline_data) {
                        (Some(text), _) => Some(Part::text(text)),
                        (None, Some(blob)) => Some(Part::inline(blob.mime_type, blob.data)),
                        (None, None) => None,
                    })
                    .collect();
                (
                    parts,
                    collect_citations(candidate.grounding_metadata),
                    FinishReason::from(candidate.finish_reason),
                )
            }
            None => (
                Vec::new(),
                Vec::new(),
                FinishReason::Unknown("no_candidates".to_string()),
            ),
        };

        Ok(CompletionResponse {
            parts,
            citations,
            input_tokens,
            output_tokens,
            cost_nanodollars: completion_cost(&req.model, input_tokens, output_tokens),
            latency: start.elapsed(),
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(new_turn: Vec<Part>) -> CompletionRequest {
        CompletionRequest::new(
            "gemini-2.5-flash",
            vec![Turn::user_text("earlier"), Turn::model_text("reply")],
            new_turn,
            "",
            Attribution::new("test"),
        )
    }

    #[test]
    fn test_empty_new_turn_is_not_sent() {
        let req = request(Vec::new());
        let value = serde_json::to_value(build_api_request(&req)).unwrap();
        let contents = value["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[1]["role"], "model");
        assert!(value.get("systemInstruction").is_none());
        assert!(value.get("tools").is_none());
        assert!(value.get("generationConfig").is_none());
    }

    #[test]
    fn test_tool_flags_map_to_wire_fields() {
        let req = request(vec![Part::text("now"), Part::inline("image/png", "AAAA")]).tools(
            ToolConfig {
                enable_search: true,
                disable_reasoning: true,
            },
        );
        let value = serde_json::to_value(build_api_request(&req)).unwrap();
        assert_eq!(value["tools"][0]["googleSearch"], serde_json::json!({}));
        assert_eq!(
            value["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            0
        );
        let last = &value["contents"][2];
        assert_eq!(last["role"], "user");
        assert_eq!(last["parts"][0]["text"], "now");
        assert_eq!(last["parts"][1]["inlineData"]["mimeType"], "image/png");
    }

    #[test]
    fn test_citations_dedupe_by_uri_and_default_title() {
        let metadata = GroundingMetadata {
            grounding_chunks: vec![
                GroundingChunk {
                    web: Some(WebSource {
                        uri: Some("https://a.example".into()),
                        title: Some("A".into()),
                    }),
                },
                GroundingChunk {
                    web: Some(WebSource {
                        uri: Some("https://a.example".into()),
                        title: Some("A again".into()),
                    }),
                },
                GroundingChunk {
                    web: Some(WebSource {
                        uri: Some("https://b.example".into()),
                        title: None,
                    }),
                },
                GroundingChunk { web: None },
            ],
        };
        let citations = collect_citations(Some(metadata));
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].title, "A");
        assert_eq!(citations[1].title, "https://b.example");
    }
}
