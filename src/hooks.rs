/// Optional observer callbacks, all fire-and-forget. Callers that want a
/// timeline of degradations (model fallbacks, failed attempts, compaction
/// churn) install closures here; everything defaults to silent.
#[derive(Default)]
pub struct Hooks {
    /// The fallback chain advanced from one model to the next.
    pub on_fallback: Option<Box<dyn Fn(&str, &str) + Send + Sync>>,
    /// A single summarizer attempt failed: (model, attempt number, error).
    pub on_attempt_failed: Option<Box<dyn Fn(&str, u32, &str) + Send + Sync>>,
    /// The compressor degraded to sliding-window truncation.
    pub on_fallback_warning: Option<Box<dyn Fn(&str) + Send + Sync>>,
    /// The session compaction counter is at or beyond the warning threshold:
    /// (compaction count, total tokens compressed). Fires on every compaction
    /// past the threshold, not once.
    pub on_compaction_warning: Option<Box<dyn Fn(u32, u64) + Send + Sync>>,
}

impl Hooks {
    pub fn with_on_fallback(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_fallback = Some(Box::new(f));
        self
    }

    pub fn with_on_attempt_failed(
        mut self,
        f: impl Fn(&str, u32, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_attempt_failed = Some(Box::new(f));
        self
    }

    pub fn with_on_fallback_warning(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_fallback_warning = Some(Box::new(f));
        self
    }

    pub fn with_on_compaction_warning(
        mut self,
        f: impl Fn(u32, u64) + Send + Sync + 'static,
    ) -> Self {
        self.on_compaction_warning = Some(Box::new(f));
        self
    }

    pub(crate) fn fallback(&self, from_model: &str, to_model: &str) {
        if let Some(f) = &self.on_fallback {
            f(from_model, to_model);
        }
    }

    pub(crate) fn attempt_failed(&self, model: &str, attempt: u32, error: &str) {
        if let Some(f) = &self.on_attempt_failed {
            f(model, attempt, error);
        }
    }

    pub(crate) fn fallback_warning(&self, message: &str) {
        if let Some(f) = &self.on_fallback_warning {
            f(message);
        }
    }

    pub(crate) fn compaction_warning(&self, count: u32, total_tokens_compressed: u64) {
        if let Some(f) = &self.on_compaction_warning {
            f(count, total_tokens_compressed);
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_fallback", &self.on_fallback.is_some())
            .field("on_attempt_failed", &self.on_attempt_failed.is_some())
            .field("on_fallback_warning", &self.on_fallback_warning.is_some())
            .field("on_compaction_warning", &self.on_compaction_warning.is_some())
            .finish()
    }
}
