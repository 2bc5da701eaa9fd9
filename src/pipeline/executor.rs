//! Indexed fan-out / fan-in over a [`CompletionClient`].
//!
//! Requests of one stage share an input context and are independent of each
//! other, so they are dispatched together. Results are slotted back by request
//! index; completion order never leaks into the returned [`StageResult`].

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::gateway::{CompletionClient, CompletionRequest, CompletionResponse, ProviderError};

/// Responses index-aligned with the requests that produced them.
pub type StageResult = Vec<CompletionResponse>;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// First failure observed; sibling requests were abandoned.
    #[error("request {index} failed: {source}")]
    Provider {
        index: usize,
        #[source]
        source: ProviderError,
    },
    #[error("stage cancelled")]
    Cancelled,
}

#[derive(Clone)]
pub struct StageExecutor {
    client: Arc<dyn CompletionClient>,
    max_concurrency: Option<usize>,
}

impl StageExecutor {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self {
            client,
            max_concurrency: None,
        }
    }

    /// Cap the number of requests in flight at once.
    pub fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Issue one request, abandoning it if `cancel` fires first.
    pub async fn run_one(
        &self,
        req: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, StageError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StageError::Cancelled),
            result = self.client.complete(req) => {
                result.map_err(|source| StageError::Provider { index: 0, source })
            }
        }
    }

    /// Dispatch every request concurrently and wait for all of them.
    ///
    /// The first error (or cancellation) ends the wait; in-flight siblings are
    /// dropped and their results discarded.
    pub async fn run_parallel(
        &self,
        requests: Vec<CompletionRequest>,
        cancel: &CancellationToken,
    ) -> Result<StageResult, StageError> {
        let total = requests.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let limit = self.max_concurrency.unwrap_or(total).clamp(1, total);
        let client = &self.client;

        let mut in_flight = stream::iter(requests.into_iter().enumerate().map(|(index, req)| {
            async move { (index, client.complete(req).await) }
        }))
        .buffer_unordered(limit);

        let mut slots: Vec<Option<CompletionResponse>> = (0..total).map(|_| None).collect();
        let mut completed = 0usize;

        while completed < total {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StageError::Cancelled),
                next = in_flight.next() => next,
            };

            match next {
                Some((index, Ok(resp))) => {
                    tracing::debug!(index, completed, total, "stage request completed");
                    slots[index] = Some(resp);
                    completed += 1;
                }
                Some((index, Err(source))) => {
                    tracing::debug!(index, error = %source, "stage request failed");
                    return Err(StageError::Provider { index, source });
                }
                None => break,
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }
}
