//! Completion gateway: the one boundary the pipeline depends on.

pub mod error;
pub mod gemini;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use gemini::{CompletionProvider, GeminiAdapter};
use usage::UsageSink as UsageSinkTrait;

pub use error::{ProviderError, ServiceDetail};
pub use pricing::*;
pub use types::*;
pub use usage::{NoopUsageSink, StderrUsageSink, UsageRecord, UsageSink};

/// Issues one request to the completion service and returns one response.
///
/// Implementations must be safe to call concurrently: several runs share one
/// client, and a single run fans refinement requests out over it.
#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Extra attempts after a retryable failure. The pipeline never retries on
    /// its own; this is the caller's policy and defaults to none.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ProviderGateway<U: UsageSinkTrait> {
    gemini: GeminiAdapter,
    usage_sink: Arc<U>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<U: UsageSinkTrait> CompletionClient for ProviderGateway<U> {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        ProviderGateway::complete(self, req).await
    }
}

impl<U: UsageSinkTrait> ProviderGateway<U> {
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let gemini = GeminiAdapter::from_env()?;
        Ok(Self {
            gemini,
            usage_sink,
            config: GatewayConfig::default(),
        })
    }

    pub fn with_config(gemini: GeminiAdapter, usage_sink: Arc<U>, config: GatewayConfig) -> Self {
        Self {
            gemini,
            usage_sink,
            config,
        }
    }

    /// One call, retried while the failure is transient and attempts remain.
    /// Every attempt is reported to the usage sink.
    pub async fn complete(
        &self,
        req: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            let outcome = self.gemini.generate(&req).await;
            let record = match &outcome {
                Ok(resp) => UsageRecord::succeeded(&req, resp, attempt),
                Err(err) => UsageRecord::failed(&req, err, attempt),
            };
            self.usage_sink.record(record).await;

            let err = match outcome {
                Err(err) if attempt < self.config.max_retries && err.is_retryable() => err,
                done => return done,
            };
            let delay = self.retry_delay(&err, attempt);
            tracing::debug!(
                stage = req.attribution.stage,
                agent = req.attribution.agent,
                attempt,
                error = %err,
                ?delay,
                "retrying completion"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// Exponential backoff, stretched to the service's own retry hint.
    fn retry_delay(&self, err: &ProviderError, attempt: u32) -> Duration {
        let backoff = self.config.retry_base_delay * 2u32.pow(attempt.min(5));
        err.retry_after().map_or(backoff, |hint| hint.max(backoff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(base: Duration) -> ProviderGateway<NoopUsageSink> {
        ProviderGateway::with_config(
            GeminiAdapter::new("test-key").unwrap(),
            Arc::new(NoopUsageSink),
            GatewayConfig {
                max_retries: 3,
                retry_base_delay: base,
            },
        )
    }

    #[test]
    fn test_retry_delay_doubles_and_honours_rate_limit_hint() {
        let gateway = gateway(Duration::from_millis(100));
        let transient = ProviderError::service("gemini", "overloaded", true);
        assert_eq!(gateway.retry_delay(&transient, 0), Duration::from_millis(100));
        assert_eq!(gateway.retry_delay(&transient, 2), Duration::from_millis(400));

        let limited = ProviderError::RateLimited {
            retry_after: Duration::from_secs(3),
            detail: ServiceDetail::status(429),
        };
        assert_eq!(gateway.retry_delay(&limited, 0), Duration::from_secs(3));
    }
}
