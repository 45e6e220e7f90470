pub mod budget;
pub mod checkpoint;
pub mod compress;
pub mod error;
pub mod fallback;
pub mod hooks;
pub mod inherit;
pub mod prune;
pub mod snapshot;
pub mod tokenizer;
pub mod truncate;
pub mod types;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use budget::{
    calculate_output_reserve, classify, usage_ratio, BudgetParams, ContextState, Thresholds,
    TokenBudget,
};
pub use checkpoint::{Checkpoint, CheckpointStore, RollbackOutcome};
pub use compress::{
    CompressOutcome, CompressionStats, Compressor, ProtectionStrategy,
    COMPACTION_WARNING_THRESHOLD,
};
pub use error::{ContextError, SummarizeError};
pub use fallback::{
    AttemptRecord, FallbackChain, ModelConfig, SummarizeOutcome, Summarizer, SummarizerFactory,
};
pub use hooks::Hooks;
pub use inherit::{
    InheritSource, InheritType, InheritanceConfig, InheritanceStore, InheritedContext,
    InheritedSummary, SummaryType,
};
pub use prune::{PruneConfig, PruneOutcome, PRUNE_MINIMUM_TOKENS};
pub use snapshot::{SnapshotConfig, TruncationSnapshot, TruncationSnapshotStore, TruncationState};
pub use tokenizer::{count_transcript, CharEstimator, Tokenizer};
pub use truncate::{SnapshotPolicy, TruncateOptions, TruncateOutcome};
pub use types::{Content, ContentPart, Lineage, Message, Priority, Role};

use compress::CompressOutcome as Pass;
use prune::prune_tool_outputs;
use truncate::truncate;

/// Non-system messages kept by the emergency-clear recovery.
pub const EMERGENCY_KEEP_COUNT: usize = 5;

/// Aggressive truncation aims at this fraction of the history budget.
const AGGRESSIVE_TRUNCATE_RATIO: f64 = 0.7;

/// What one `manage` call did and where the transcript ended up.
#[derive(Debug)]
pub struct ManageOutcome {
    pub state: ContextState,
    pub token_count: u32,
    pub budget_used: f64,
    /// Human-readable record of each phase that ran, in order.
    pub actions: Vec<String>,
    /// Checkpoint created by this call, if pressure reached critical.
    pub checkpoint: Option<String>,
    pub messages: Vec<Message>,
}

/// The context-management engine. Sits between an agent loop and a provider
/// client: the caller appends messages and invokes [`manage`]; the engine
/// classifies pressure and applies the graduated pipeline — prune tool
/// outputs, drop low-priority messages, summarize older messages, recover.
///
/// [`manage`]: ContextEngine::manage
pub struct ContextEngine {
    tokenizer: Box<dyn Tokenizer>,
    budget: TokenBudget,
    thresholds: Thresholds,
    prune: PruneConfig,
    recent_count: usize,
    preserve_tool_pairs: bool,
    compressor: Option<Compressor>,
    checkpoints: CheckpointStore,
    snapshots: TruncationSnapshotStore,
    hooks: Hooks,
    recent_checkpoint_window: Duration,
}

impl ContextEngine {
    pub fn new(budget: TokenBudget) -> Self {
        Self {
            tokenizer: Box::new(CharEstimator),
            budget,
            thresholds: Thresholds::default(),
            prune: PruneConfig::default(),
            recent_count: 5,
            preserve_tool_pairs: true,
            compressor: None,
            checkpoints: CheckpointStore::default(),
            snapshots: TruncationSnapshotStore::new(SnapshotConfig::default()),
            hooks: Hooks::default(),
            recent_checkpoint_window: Duration::minutes(10),
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: impl Tokenizer + 'static) -> Self {
        self.tokenizer = Box::new(tokenizer);
        self
    }

    /// Thresholds must already be validated; see [`Thresholds::new`].
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_prune_config(mut self, config: PruneConfig) -> Self {
        self.prune = config;
        self
    }

    pub fn with_recent_count(mut self, count: usize) -> Self {
        self.recent_count = count;
        self
    }

    pub fn with_preserve_tool_pairs(mut self, preserve: bool) -> Self {
        self.preserve_tool_pairs = preserve;
        self
    }

    /// Enable summarization-based compression at critical pressure.
    pub fn with_compressor(mut self, compressor: Compressor) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn with_checkpoint_store(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = store;
        self
    }

    pub fn with_snapshot_config(mut self, config: SnapshotConfig) -> Self {
        self.snapshots = TruncationSnapshotStore::new(config);
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// How far back a checkpoint still counts as "recent" for rollback
    /// recovery.
    pub fn with_recent_checkpoint_window(mut self, window: Duration) -> Self {
        self.recent_checkpoint_window = window;
        self
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// The truncation-snapshot store, for recovering dropped messages by id.
    pub fn snapshots_mut(&mut self) -> &mut TruncationSnapshotStore {
        &mut self.snapshots
    }

    pub fn compressor(&self) -> Option<&Compressor> {
        self.compressor.as_ref()
    }

    pub fn compressor_mut(&mut self) -> Option<&mut Compressor> {
        self.compressor.as_mut()
    }

    pub async fn manage(&mut self, messages: &[Message]) -> Result<ManageOutcome, ContextError> {
        self.manage_with_cancel(messages, None).await
    }

    /// Run the pipeline with a cancellation signal; only summarizer calls
    /// observe it.
    pub async fn manage_with_cancel(
        &mut self,
        messages: &[Message],
        cancel: Option<&CancellationToken>,
    ) -> Result<ManageOutcome, ContextError> {
        let mut current = messages.to_vec();
        let mut actions: Vec<String> = Vec::new();
        let mut checkpoint: Option<String> = None;

        let mut tokens = count_transcript(self.tokenizer.as_ref(), &current).await?;
        let mut state = classify(tokens, &self.budget, &self.thresholds);
        if state == ContextState::Healthy {
            return Ok(self.outcome(state, tokens, actions, checkpoint, current));
        }

        info!(tokens, %state, "context pressure detected");

        // Phase 1: trim oversized tool outputs. Skipped when the transcript
        // is too small for trimming to matter.
        if tokens >= PRUNE_MINIMUM_TOKENS {
            let pruned = prune_tool_outputs(&current, &self.prune);
            if pruned.trimmed_count > 0 {
                actions.push(format!("prune:{} outputs trimmed", pruned.trimmed_count));
                current = pruned.messages;
                tokens = count_transcript(self.tokenizer.as_ref(), &current).await?;
                state = classify(tokens, &self.budget, &self.thresholds);
                if state == ContextState::Healthy {
                    return Ok(self.outcome(state, tokens, actions, checkpoint, current));
                }
            }
        }

        if state >= ContextState::Critical {
            // Checkpoint first so the shrunken transcript stays reversible.
            let id = self
                .checkpoints
                .create(&current, "pre-compression", None, tokens);
            actions.push(format!("checkpoint:{id}"));
            checkpoint = Some(id);

            // Phase 2: shed low-priority messages down to the warning level.
            let target = (f64::from(self.budget.history_budget) * self.thresholds.warning) as u32;
            let opts = TruncateOptions {
                target_tokens: target,
                recent_count: self.recent_count,
                preserve_tool_pairs: self.preserve_tool_pairs,
                max_priority: Priority::Low,
                truncation_reason: Some("critical-pressure".into()),
                truncation_id: None,
            };
            let truncated = truncate(
                &current,
                &opts,
                self.tokenizer.as_ref(),
                SnapshotPolicy::BestEffort(&mut self.snapshots),
            )
            .await?;
            if truncated.removed_count > 0 {
                actions.push(format!("truncate:{} messages removed", truncated.removed_count));
                current = truncated.messages;
                tokens = count_transcript(self.tokenizer.as_ref(), &current).await?;
                state = classify(tokens, &self.budget, &self.thresholds);
            }

            // Phase 3: summarize older messages.
            if state >= ContextState::Critical {
                if let Some(compressor) = self.compressor.as_mut() {
                    let pass = compressor
                        .compress(
                            &current,
                            self.tokenizer.as_ref(),
                            Some(&mut self.snapshots),
                            &self.hooks,
                            cancel,
                        )
                        .await?;
                    match pass {
                        Pass::Compressed {
                            messages,
                            compressed_count,
                            ..
                        } => {
                            actions.push(format!("compress:{compressed_count} messages summarized"));
                            current = messages;
                        }
                        Pass::FallbackTruncated {
                            messages,
                            removed_count,
                            ..
                        } => {
                            actions.push("compress:failed - ALL_MODELS_FAILED".into());
                            actions.push("compress:fallback to sliding window truncation".into());
                            actions.push(format!("fallback-truncate:{removed_count} messages removed"));
                            current = messages;
                        }
                        Pass::Failed { reason } => {
                            actions.push(format!("compress:failed - {reason}"));
                        }
                        Pass::Skipped { reason } => {
                            actions.push(format!("compress:skipped - {reason}"));
                        }
                    }
                    tokens = count_transcript(self.tokenizer.as_ref(), &current).await?;
                    state = classify(tokens, &self.budget, &self.thresholds);
                }
            }
        }

        // Phase 4: overflow recovery.
        if state == ContextState::Overflow {
            current = self
                .run_recovery(current, &mut actions, tokens, checkpoint.as_deref())
                .await?;
            tokens = count_transcript(self.tokenizer.as_ref(), &current).await?;
            state = classify(tokens, &self.budget, &self.thresholds);
        }

        Ok(self.outcome(state, tokens, actions, checkpoint, current))
    }

    /// Overflow recovery ladder: rollback to a recent checkpoint, else
    /// emergency-clear when usage is past the whole budget, else truncate
    /// aggressively (tool pairs may split here).
    async fn run_recovery(
        &mut self,
        current: Vec<Message>,
        actions: &mut Vec<String>,
        tokens: u32,
        own_checkpoint: Option<&str>,
    ) -> Result<Vec<Message>, ContextError> {
        // The checkpoint made earlier in this same call records the
        // pre-shrink transcript; restoring it cannot reduce pressure.
        let rollback_target = self
            .checkpoints
            .list()
            .into_iter()
            .filter(|c| Some(c.id.as_str()) != own_checkpoint)
            .find(|c| c.created_at >= Utc::now() - self.recent_checkpoint_window)
            .map(|c| c.id.clone());

        if let Some(id) = rollback_target {
            match self.checkpoints.rollback(&id, &current) {
                Ok(rolled_back) => {
                    actions.push(format!("recover:rollback {id}"));
                    info!(checkpoint = %id, discarded = rolled_back.discarded_messages.len(), "rolled back to checkpoint");
                    return Ok(rolled_back.messages);
                }
                Err(e) => {
                    warn!(checkpoint = %id, error = %e, "rollback failed, truncating aggressively");
                    actions.push(format!("recover:rollback failed - {e}"));
                    return self.aggressive_truncate(current, actions).await;
                }
            }
        }

        if usage_ratio(tokens, &self.budget) > 1.0 {
            let keep_system: Vec<bool> = current
                .iter()
                .map(|m| m.role == Role::System || m.priority == Priority::System)
                .collect();
            let non_system: Vec<usize> = (0..current.len()).filter(|&i| !keep_system[i]).collect();
            let tail_start = non_system.len().saturating_sub(EMERGENCY_KEEP_COUNT);
            let keep: std::collections::HashSet<usize> = non_system[tail_start..]
                .iter()
                .copied()
                .chain((0..current.len()).filter(|&i| keep_system[i]))
                .collect();

            let cleared: Vec<Message> = current
                .into_iter()
                .enumerate()
                .filter(|(i, _)| keep.contains(i))
                .map(|(_, m)| m)
                .collect();
            actions.push("recover:emergency_clear".into());
            warn!(kept = cleared.len(), "emergency clear applied");
            return Ok(cleared);
        }

        self.aggressive_truncate(current, actions).await
    }

    async fn aggressive_truncate(
        &mut self,
        current: Vec<Message>,
        actions: &mut Vec<String>,
    ) -> Result<Vec<Message>, ContextError> {
        let target = (f64::from(self.budget.history_budget) * AGGRESSIVE_TRUNCATE_RATIO) as u32;
        let opts = TruncateOptions {
            target_tokens: target,
            recent_count: self.recent_count,
            preserve_tool_pairs: false,
            max_priority: Priority::ToolPair,
            truncation_reason: Some("overflow-recovery".into()),
            truncation_id: None,
        };
        let truncated = truncate(
            &current,
            &opts,
            self.tokenizer.as_ref(),
            SnapshotPolicy::BestEffort(&mut self.snapshots),
        )
        .await?;
        actions.push(format!(
            "recover:aggressive_truncate:{} messages removed",
            truncated.removed_count
        ));
        Ok(truncated.messages)
    }

    fn outcome(
        &self,
        state: ContextState,
        tokens: u32,
        actions: Vec<String>,
        checkpoint: Option<String>,
        messages: Vec<Message>,
    ) -> ManageOutcome {
        ManageOutcome {
            state,
            token_count: tokens,
            budget_used: usage_ratio(tokens, &self.budget),
            actions,
            checkpoint,
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    fn budget(history: u32) -> TokenBudget {
        TokenBudget {
            total_window: history + 10_000,
            output_reserve: 8_000,
            system_reserve: 2_000,
            history_budget: history,
        }
    }

    fn msg(id: &str, role: Role, tokens: u32) -> Message {
        Message::new(id, role, Content::Text("body".into())).with_tokens(tokens)
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    struct FixedSummarizer(&'static str);

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _: &[Message], _: &str) -> Result<String, SummarizeError> {
            Ok(self.0.to_string())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _: &[Message], _: &str) -> Result<String, SummarizeError> {
            Err(SummarizeError::Request("unavailable".into()))
        }
    }

    fn working_compressor() -> Compressor {
        let chain = FallbackChain::new(vec![ModelConfig::new("modelA")], |_: &str| {
            Box::new(FixedSummarizer("compressed summary")) as Box<dyn Summarizer>
        })
        .unwrap();
        Compressor::new(chain)
    }

    fn broken_compressor() -> Compressor {
        let chain = FallbackChain::new(
            vec![ModelConfig::new("modelA"), ModelConfig::new("modelB")],
            |_: &str| Box::new(FailingSummarizer) as Box<dyn Summarizer>,
        )
        .unwrap();
        Compressor::new(chain)
    }

    // --- Healthy path ---

    #[tokio::test]
    async fn healthy_transcript_is_untouched() {
        let mut engine = ContextEngine::new(TokenBudget::for_window(100_000));
        let messages: Vec<Message> = (0..5)
            .map(|i| msg(&format!("m{i}"), Role::User, 200))
            .collect();

        let out = engine.manage(&messages).await.unwrap();
        assert_eq!(out.state, ContextState::Healthy);
        assert_eq!(out.token_count, 1_000);
        assert!(out.actions.is_empty());
        assert_eq!(out.checkpoint, None);
        assert_eq!(out.messages, messages);
    }

    // --- Prune phase ---

    fn big_tool_pair(use_id: &str, chars: usize) -> Vec<Message> {
        vec![
            Message::new(
                format!("a-{use_id}"),
                Role::Assistant,
                Content::Parts(vec![ContentPart::ToolUse {
                    id: use_id.into(),
                    name: "read".into(),
                    input: json!({}),
                }]),
            ),
            Message::new(
                format!("t-{use_id}"),
                Role::Tool,
                Content::Parts(vec![ContentPart::ToolResult {
                    tool_use_id: use_id.into(),
                    content: "x".repeat(chars),
                }]),
            ),
        ]
    }

    #[tokio::test]
    async fn warning_resolved_by_prune_alone() {
        let mut engine = ContextEngine::new(budget(20_000));
        let mut messages = vec![msg("s", Role::System, 50)];
        messages.extend(big_tool_pair("c1", 60_000)); // ~15k tokens of output

        let out = engine.manage(&messages).await.unwrap();
        assert_eq!(out.state, ContextState::Healthy);
        assert_eq!(out.actions, vec!["prune:1 outputs trimmed".to_string()]);
        assert_eq!(out.checkpoint, None);

        let ContentPart::ToolResult { content, .. } = &out.messages[2].parts()[0] else {
            panic!("expected tool result");
        };
        assert!(content.contains("chars omitted"));
    }

    #[tokio::test]
    async fn prune_skipped_below_minimum_tokens() {
        let mut engine = ContextEngine::new(budget(2_000));
        // Warning pressure but under PRUNE_MINIMUM_TOKENS.
        let messages = vec![msg("s", Role::System, 100), msg("m1", Role::User, 1_500)];

        let out = engine.manage(&messages).await.unwrap();
        assert_eq!(out.state, ContextState::Warning);
        assert!(out.actions.is_empty());
        assert_eq!(out.messages, messages);
    }

    // --- Critical path: truncate + compress ---

    #[tokio::test]
    async fn critical_sheds_low_priority_messages() {
        let mut engine = ContextEngine::new(budget(10_000));
        let mut messages = vec![msg("s", Role::System, 100)];
        for i in 0..4 {
            messages.push(msg(&format!("low{i}"), Role::Tool, 1_500).with_priority(Priority::Low));
        }
        for i in 0..6 {
            messages.push(msg(&format!("m{i}"), Role::User, 500));
        }
        // 100 + 6000 + 3000 = 9100 -> 0.91 critical.

        let out = engine.manage(&messages).await.unwrap();
        assert!(out.checkpoint.is_some());
        assert!(out
            .actions
            .iter()
            .any(|a| a.starts_with("checkpoint:")));
        // Dropping two Low messages lands under the warning target (7500).
        assert!(out.actions.contains(&"truncate:2 messages removed".to_string()));
        assert_eq!(out.state, ContextState::Healthy);
        assert!(!ids(&out.messages).contains(&"low0"));
        assert!(!ids(&out.messages).contains(&"low1"));
        assert!(ids(&out.messages).contains(&"low2"));
    }

    #[tokio::test]
    async fn critical_compresses_when_truncate_cannot_reach_warning() {
        let mut engine = ContextEngine::new(budget(10_000)).with_compressor(working_compressor());
        let mut messages = vec![msg("s", Role::System, 100)];
        for i in 0..20 {
            messages.push(msg(&format!("m{i}"), Role::User, 440));
        }
        // 8900 -> 0.89 critical; nothing is Low priority so truncate is a no-op.

        let out = engine.manage(&messages).await.unwrap();
        assert!(out.actions.contains(&"compress:15 messages summarized".to_string()));
        assert!(out.messages.len() <= messages.len() + 1);

        let summary = out
            .messages
            .iter()
            .find(|m| m.is_summary())
            .expect("summary message");
        assert_eq!(summary.content, Content::Text("compressed summary".into()));
        assert_eq!(summary.metadata["compressedCount"], 15);
        // [system] + [summary] + recent tail of 5.
        assert_eq!(out.messages.len(), 7);
        assert_eq!(out.state, ContextState::Healthy);
    }

    #[tokio::test]
    async fn manage_is_idempotent_once_healthy() {
        let mut engine = ContextEngine::new(budget(10_000)).with_compressor(working_compressor());
        let mut messages = vec![msg("s", Role::System, 100)];
        for i in 0..20 {
            messages.push(msg(&format!("m{i}"), Role::User, 440));
        }

        let first = engine.manage(&messages).await.unwrap();
        assert!(!first.actions.is_empty());

        let second = engine.manage(&first.messages).await.unwrap();
        assert_eq!(second.state, ContextState::Healthy);
        assert!(second.actions.is_empty());
        assert_eq!(second.messages, first.messages);
    }

    // --- Compression fallback (S6 shape) ---

    #[tokio::test]
    async fn fallback_truncate_when_all_models_fail() {
        let mut engine = ContextEngine::new(budget(100_000))
            .with_thresholds(Thresholds::new(0.2, 0.3, 0.9).unwrap())
            .with_compressor(broken_compressor());

        let mut messages = vec![msg("s", Role::System, 100)];
        for i in 0..25 {
            messages.push(msg(&format!("m{i}"), Role::User, 2_000));
        }
        // 50_100 tokens -> 0.5 of budget: critical under these thresholds.

        let out = engine.manage(&messages).await.unwrap();
        assert!(out.actions.contains(&"compress:failed - ALL_MODELS_FAILED".to_string()));
        assert!(out
            .actions
            .contains(&"compress:fallback to sliding window truncation".to_string()));
        assert!(out
            .actions
            .contains(&"fallback-truncate:18 messages removed".to_string()));

        // Every retained non-system message carries one common fresh parent.
        let parents: Vec<&str> = out
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| m.truncation_parent().expect("lineage marker"))
            .collect();
        assert!(!parents.is_empty());
        assert!(parents.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(out.messages[0].truncation_parent(), None);

        // The dropped messages stayed recoverable under that id.
        let parent = parents[0].to_string();
        let dropped = engine.snapshots_mut().recover(&parent).unwrap().unwrap();
        assert_eq!(dropped.len(), 18);
        assert_eq!(dropped[0].id, "m0");
    }

    // --- Overflow recovery ---

    #[tokio::test]
    async fn overflow_emergency_clear_keeps_system_and_recent() {
        let mut engine = ContextEngine::new(budget(1_000));
        let mut messages = vec![msg("s", Role::System, 100)];
        for i in 0..10 {
            messages.push(msg(&format!("m{i}"), Role::User, 200));
        }
        // 2_100 tokens -> usage 2.1, past the whole budget.

        let out = engine.manage(&messages).await.unwrap();
        assert!(out.actions.contains(&"recover:emergency_clear".to_string()));
        assert_eq!(ids(&out.messages), vec!["s", "m5", "m6", "m7", "m8", "m9"]);
        // The reserved portion itself exceeds the budget; overflow persists.
        assert_eq!(out.state, ContextState::Overflow);
    }

    #[tokio::test]
    async fn overflow_aggressive_truncate_under_full_budget() {
        let mut engine = ContextEngine::new(budget(1_000));
        let mut messages = vec![msg("s", Role::System, 50)];
        for i in 0..9 {
            messages.push(msg(&format!("m{i}"), Role::User, 100));
        }
        // 950 tokens -> 0.95: overflow, but usage <= 1.0.

        let out = engine.manage(&messages).await.unwrap();
        assert!(out
            .actions
            .contains(&"recover:aggressive_truncate:3 messages removed".to_string()));
        assert_eq!(out.token_count, 650);
        assert_eq!(out.state, ContextState::Healthy);
    }

    #[tokio::test]
    async fn overflow_rolls_back_to_prior_checkpoint() {
        let mut engine = ContextEngine::new(budget(1_000));
        let mut first = vec![msg("s", Role::System, 80)];
        for i in 0..8 {
            first.push(msg(&format!("m{i}"), Role::User, 100));
        }
        // 880 -> critical: creates a checkpoint and nothing else applies.
        let out1 = engine.manage(&first).await.unwrap();
        let prior_checkpoint = out1.checkpoint.clone().unwrap();
        assert_eq!(out1.state, ContextState::Critical);

        let mut second = first.clone();
        second.push(msg("m8", Role::User, 100));
        second.push(msg("m9", Role::User, 100));
        // 1_080 -> overflow; the prior checkpoint is recent, so roll back.
        let out2 = engine.manage(&second).await.unwrap();
        assert!(out2
            .actions
            .contains(&format!("recover:rollback {prior_checkpoint}")));
        assert_eq!(ids(&out2.messages), ids(&first));
        assert_eq!(out2.state, ContextState::Critical);
    }

    #[tokio::test]
    async fn stale_checkpoints_are_not_rollback_targets() {
        let mut engine =
            ContextEngine::new(budget(1_000)).with_recent_checkpoint_window(Duration::minutes(-1));
        let mut first = vec![msg("s", Role::System, 80)];
        for i in 0..8 {
            first.push(msg(&format!("m{i}"), Role::User, 100));
        }
        engine.manage(&first).await.unwrap();

        let mut second = first.clone();
        second.push(msg("m8", Role::User, 100));
        second.push(msg("m9", Role::User, 100));
        let out = engine.manage(&second).await.unwrap();
        // Window excludes everything: usage 1.08 > 1.0 -> emergency clear.
        assert!(out.actions.contains(&"recover:emergency_clear".to_string()));
    }

    // --- Error propagation ---

    struct ExplodingTokenizer;

    #[async_trait]
    impl Tokenizer for ExplodingTokenizer {
        async fn count_text(&self, _: &str) -> Result<u32, ContextError> {
            Err(ContextError::Tokenizer("tokenizer service down".into()))
        }
    }

    #[tokio::test]
    async fn tokenizer_failure_fails_manage() {
        let mut engine =
            ContextEngine::new(budget(1_000)).with_tokenizer(ExplodingTokenizer);
        let messages = vec![Message::text(Role::User, "hello")];
        let err = engine.manage(&messages).await.unwrap_err();
        assert!(matches!(err, ContextError::Tokenizer(_)));
    }

    // --- Invariants across the pipeline ---

    #[tokio::test]
    async fn system_messages_always_survive_in_order() {
        let mut engine = ContextEngine::new(budget(1_000)).with_compressor(broken_compressor());
        let mut messages = vec![msg("s1", Role::System, 50)];
        for i in 0..6 {
            messages.push(msg(&format!("m{i}"), Role::User, 150));
        }
        messages.push(msg("s2", Role::System, 50));

        let out = engine.manage(&messages).await.unwrap();
        let system: Vec<&str> = out
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(system, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn checkpoint_store_stays_bounded() {
        let mut engine = ContextEngine::new(budget(1_000));
        let mut messages = vec![msg("s", Role::System, 80)];
        for i in 0..8 {
            messages.push(msg(&format!("m{i}"), Role::User, 100));
        }
        for _ in 0..8 {
            engine.manage(&messages).await.unwrap();
        }
        assert!(engine.checkpoints().len() <= 5);
    }
}
