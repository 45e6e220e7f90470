use async_trait::async_trait;

use crate::error::ContextError;
use crate::types::Message;

/// Injected token counting. Implementations may call out to a provider's
/// tokenizer service, hence the async surface; the default estimator is
/// pure arithmetic.
#[async_trait]
pub trait Tokenizer: Send + Sync {
    async fn count_text(&self, text: &str) -> Result<u32, ContextError>;

    /// Count a whole message. The default serializes the body to JSON and
    /// counts that, which tracks what actually goes over the wire closely
    /// enough for pressure detection.
    async fn count_message(&self, message: &Message) -> Result<u32, ContextError> {
        let body = serde_json::to_string(&message.content)
            .map_err(|e| ContextError::Tokenizer(e.to_string()))?;
        self.count_text(&body).await
    }
}

/// Coarse `ceil(chars / 4)` estimator. Good enough for trend detection;
/// provider-accurate tokenizers are plugged in by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharEstimator;

#[async_trait]
impl Tokenizer for CharEstimator {
    async fn count_text(&self, text: &str) -> Result<u32, ContextError> {
        let chars = text.chars().count() as u32;
        Ok(chars.div_ceil(4))
    }
}

/// Total tokens for a transcript. A message's cached `tokens` wins over the
/// tokenizer when present.
pub async fn count_transcript(
    tokenizer: &dyn Tokenizer,
    messages: &[Message],
) -> Result<u32, ContextError> {
    let mut total: u32 = 0;
    for message in messages {
        let count = match message.tokens {
            Some(cached) => cached,
            None => tokenizer.count_message(message).await?,
        };
        total = total.saturating_add(count);
    }
    Ok(total)
}
