use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ContextError, SummarizeError};
use crate::hooks::Hooks;
use crate::types::Message;

/// An opaque "given these messages and a directive, return a summary"
/// capability. No wire format leaks through this seam.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        messages: &[Message],
        directive: &str,
    ) -> Result<String, SummarizeError>;
}

/// Maps a model id to a summarizer client. Invoked once per (model,
/// request); the chain does not cache clients across requests.
pub trait SummarizerFactory: Send + Sync {
    fn create(&self, model: &str) -> Box<dyn Summarizer>;
}

impl<F> SummarizerFactory for F
where
    F: Fn(&str) -> Box<dyn Summarizer> + Send + Sync,
{
    fn create(&self, model: &str) -> Box<dyn Summarizer> {
        self(model)
    }
}

/// Per-model attempt policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
}

impl ModelConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_retries: 1,
            retry_delay_ms: 0,
            timeout_ms: 30_000,
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// One attempt against one model, as recorded in the chain's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub model: String,
    pub attempt: u32,
    pub success: bool,
    pub timed_out: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// A successful summarization, with the path taken to get there.
#[derive(Debug, Clone)]
pub struct SummarizeOutcome {
    pub summary: String,
    pub model: String,
    pub attempts: u32,
    pub latency_ms: u64,
    pub attempt_history: Vec<AttemptRecord>,
}

/// What one raced attempt resolved to. Explicit, so the caller never has to
/// compare wall clocks to decide whether a failure was a timeout.
enum Attempt {
    Ok(String),
    Err(SummarizeError),
    Timeout,
    Cancelled,
}

/// Ordered multi-model summarizer. Tries each configured model in turn with
/// per-attempt timeout and linear progressive backoff, advancing to the
/// next model when retries are exhausted.
pub struct FallbackChain {
    models: Vec<ModelConfig>,
    factory: Box<dyn SummarizerFactory>,
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field("models", &self.models)
            .finish_non_exhaustive()
    }
}

impl FallbackChain {
    /// Rejects an empty model list at construction.
    pub fn new(
        models: Vec<ModelConfig>,
        factory: impl SummarizerFactory + 'static,
    ) -> Result<Self, ContextError> {
        if models.is_empty() {
            return Err(ContextError::Configuration(
                "fallback chain requires at least one model".into(),
            ));
        }
        Ok(Self {
            models,
            factory: Box::new(factory),
        })
    }

    pub fn models(&self) -> &[ModelConfig] {
        &self.models
    }

    pub async fn summarize(
        &self,
        messages: &[Message],
        directive: &str,
    ) -> Result<SummarizeOutcome, ContextError> {
        self.summarize_with(messages, directive, &Hooks::default(), None)
            .await
    }

    /// Summarize with observer hooks and an optional cancellation signal.
    /// Cancellation short-circuits at the next attempt boundary; an
    /// in-flight attempt is abandoned like a timeout.
    pub async fn summarize_with(
        &self,
        messages: &[Message],
        directive: &str,
        hooks: &Hooks,
        cancel: Option<&CancellationToken>,
    ) -> Result<SummarizeOutcome, ContextError> {
        let chain_start = Instant::now();
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut total_attempts: u32 = 0;

        for (model_idx, config) in self.models.iter().enumerate() {
            let client = self.factory.create(&config.model);

            for attempt in 1..=config.max_retries {
                if attempt > 1 && config.retry_delay_ms > 0 {
                    // Linear progressive backoff: delay × attempts so far.
                    let delay = config.retry_delay_ms * u64::from(attempt - 1);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                if let Some(token) = cancel {
                    if token.is_cancelled() {
                        return Err(ContextError::Cancelled);
                    }
                }

                total_attempts += 1;
                let attempt_start = Instant::now();
                let outcome =
                    run_attempt(client.as_ref(), messages, directive, config.timeout_ms, cancel)
                        .await;
                let latency_ms = attempt_start.elapsed().as_millis() as u64;

                match outcome {
                    Attempt::Ok(summary) => {
                        history.push(AttemptRecord {
                            model: config.model.clone(),
                            attempt,
                            success: true,
                            timed_out: false,
                            latency_ms,
                            error: None,
                        });
                        debug!(model = %config.model, attempt, latency_ms, "summarization succeeded");
                        return Ok(SummarizeOutcome {
                            summary,
                            model: config.model.clone(),
                            attempts: total_attempts,
                            latency_ms: chain_start.elapsed().as_millis() as u64,
                            attempt_history: history,
                        });
                    }
                    Attempt::Timeout => {
                        history.push(AttemptRecord {
                            model: config.model.clone(),
                            attempt,
                            success: false,
                            timed_out: true,
                            latency_ms,
                            error: Some("timeout".into()),
                        });
                        hooks.attempt_failed(&config.model, attempt, "timeout");
                        warn!(model = %config.model, attempt, timeout_ms = config.timeout_ms, "summarization attempt timed out");
                    }
                    Attempt::Err(e) => {
                        let message = e.to_string();
                        history.push(AttemptRecord {
                            model: config.model.clone(),
                            attempt,
                            success: false,
                            timed_out: false,
                            latency_ms,
                            error: Some(message.clone()),
                        });
                        hooks.attempt_failed(&config.model, attempt, &message);
                        warn!(model = %config.model, attempt, error = %message, "summarization attempt failed");
                    }
                    Attempt::Cancelled => return Err(ContextError::Cancelled),
                }
            }

            if let Some(next) = self.models.get(model_idx + 1) {
                hooks.fallback(&config.model, &next.model);
                warn!(from = %config.model, to = %next.model, "falling back to next model");
            }
        }

        Err(ContextError::AllModelsFailed {
            attempted_models: self.models.iter().map(|m| m.model.clone()).collect(),
            total_attempts,
            total_latency_ms: chain_start.elapsed().as_millis() as u64,
            attempt_history: history,
        })
    }
}

async fn run_attempt(
    client: &dyn Summarizer,
    messages: &[Message],
    directive: &str,
    timeout_ms: u64,
    cancel: Option<&CancellationToken>,
) -> Attempt {
    let call = tokio::time::timeout(
        Duration::from_millis(timeout_ms),
        client.summarize(messages, directive),
    );
    let raced = match cancel {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => return Attempt::Cancelled,
                result = call => result,
            }
        }
        None => call.await,
    };
    match raced {
        Ok(Ok(summary)) => Attempt::Ok(summary),
        Ok(Err(e)) => Attempt::Err(e),
        Err(_) => Attempt::Timeout,
    }
}
