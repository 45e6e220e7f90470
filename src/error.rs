use crate::fallback::AttemptRecord;

/// Engine-level errors. Local, recoverable failures (snapshot too large in
/// the critical path, compressor failures, inheritance I/O) are converted to
/// action-log entries by the orchestrator and never escape `manage`; a
/// tokenizer failure is the one error `manage` itself returns.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("all summarizer models failed ({total_attempts} attempts across {})", attempted_models.join(", "))]
    AllModelsFailed {
        attempted_models: Vec<String>,
        total_attempts: u32,
        total_latency_ms: u64,
        attempt_history: Vec<AttemptRecord>,
    },

    #[error("snapshot too large: {size_bytes} bytes exceeds limit of {max_bytes}")]
    SnapshotTooLarge { size_bytes: usize, max_bytes: usize },

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("inheritance io error: {0}")]
    InheritanceIo(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cancelled")]
    Cancelled,
}

impl ContextError {
    /// Whether retrying the failed operation could ever succeed.
    /// `AllModelsFailed` means the whole chain was exhausted — it is final.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AllModelsFailed { .. })
    }
}

/// What an injected summarizer client can fail with. Mirrors the usual
/// shape of an LLM client error surface.
#[derive(Debug, thiserror::Error)]
pub enum SummarizeError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_models_failed_is_not_retryable() {
        let err = ContextError::AllModelsFailed {
            attempted_models: vec!["a".into(), "b".into()],
            total_attempts: 2,
            total_latency_ms: 10,
            attempt_history: vec![],
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn tokenizer_error_is_retryable() {
        assert!(ContextError::Tokenizer("boom".into()).is_retryable());
    }
}
