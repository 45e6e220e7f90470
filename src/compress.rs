use std::collections::HashSet;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ContextError;
use crate::fallback::FallbackChain;
use crate::hooks::Hooks;
use crate::snapshot::TruncationSnapshotStore;
use crate::tokenizer::Tokenizer;
use crate::truncate::{truncate, SnapshotPolicy, TruncateOptions};
use crate::types::{generate_id, Content, Lineage, Message, Priority, Role};

/// Session compactions at or past this count trigger the warning callback.
pub const COMPACTION_WARNING_THRESHOLD: u32 = 2;

pub const DEFAULT_TARGET_RATIO: f64 = 0.3;

/// Ranges smaller than this are not worth a summarizer round-trip.
const MIN_RANGE_LEN: usize = 4;

// Adapted from the summarization prompt used by coding agents: the summary
// replaces the original messages in a continuing window, so it must carry
// everything needed to keep working without them.
pub const DEFAULT_DIRECTIVE: &str = "\
Summarize the conversation so far. The summary will replace the original \
messages in a continuing context window, so preserve all information needed \
to continue the task without re-reading them.

Structure the summary as:
1. **Primary task and current state** — what was asked, what has been accomplished
2. **Key technical context** — files discussed, code patterns, architecture decisions
3. **Errors encountered and their resolutions** — what went wrong, how it was fixed
4. **Pending work and next steps** — what still needs to happen

Be concise but complete. Omit pleasantries and meta-discussion. Focus on \
facts and decisions.";

/// Which existing summary messages are shielded from re-compression.
#[derive(Debug, Clone)]
pub enum ProtectionStrategy {
    /// Every summary is protected.
    All,
    /// The most recent `keep` summaries by creation time are protected.
    Recent { keep: usize },
    /// The top `keep` summaries by weighted score are protected:
    /// `0.4·tokens + 0.4·recency + 0.2·compressed_count`, each normalized.
    Weighted { keep: usize },
}

impl Default for ProtectionStrategy {
    fn default() -> Self {
        Self::Recent { keep: 5 }
    }
}

/// Session-level compression counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    pub compaction_count: u32,
    pub total_tokens_compressed: u64,
}

/// What one compression pass did to the transcript.
#[derive(Debug)]
pub enum CompressOutcome {
    /// A contiguous interior range was replaced by one summary message.
    Compressed {
        messages: Vec<Message>,
        compressed_count: usize,
        compressed_tokens: u32,
        model: String,
    },
    /// Every model failed; the range was dropped by sliding-window
    /// truncation instead and retained messages were marked.
    FallbackTruncated {
        messages: Vec<Message>,
        removed_count: usize,
        truncation_parent: String,
        truncation_id: Option<String>,
    },
    /// Nothing to do (range too small, all-system transcript).
    Skipped { reason: String },
    /// The pass failed; the transcript is unchanged.
    Failed { reason: String },
}

/// Non-destructive summarizer driver. Replaces a contiguous interior range
/// of the transcript with a single summary message, leaving the system
/// prefix and recent tail intact; degrades to marked sliding-window
/// truncation when the whole fallback chain is exhausted.
pub struct Compressor {
    chain: FallbackChain,
    target_ratio: f64,
    recent_count: usize,
    preserve_tool_pairs: bool,
    summary_role: Role,
    protection: ProtectionStrategy,
    directive: String,
    stats: CompressionStats,
}

impl Compressor {
    pub fn new(chain: FallbackChain) -> Self {
        Self {
            chain,
            target_ratio: DEFAULT_TARGET_RATIO,
            recent_count: 5,
            preserve_tool_pairs: true,
            summary_role: Role::System,
            protection: ProtectionStrategy::default(),
            directive: DEFAULT_DIRECTIVE.to_string(),
            stats: CompressionStats::default(),
        }
    }

    pub fn with_target_ratio(mut self, ratio: f64) -> Self {
        self.target_ratio = ratio.clamp(0.05, 0.95);
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

    pub fn with_summary_role(mut self, role: Role) -> Self {
        self.summary_role = role;
        self
    }

    pub fn with_protection(mut self, strategy: ProtectionStrategy) -> Self {
        self.protection = strategy;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directive = directive.into();
        self
    }

    pub fn stats(&self) -> CompressionStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = CompressionStats::default();
    }

    /// One compression pass over the transcript. Summarizer failures never
    /// escape as errors; they come back as `Failed` or `FallbackTruncated`.
    pub async fn compress(
        &mut self,
        messages: &[Message],
        tokenizer: &dyn Tokenizer,
        snapshots: Option<&mut TruncationSnapshotStore>,
        hooks: &Hooks,
        cancel: Option<&CancellationToken>,
    ) -> Result<CompressOutcome, ContextError> {
        let len = messages.len();
        let mut start = match messages.iter().position(|m| m.role != Role::System) {
            Some(i) => i,
            None => {
                return Ok(CompressOutcome::Skipped {
                    reason: "no non-system messages".into(),
                })
            }
        };

        // Protected summaries act as range boundaries: never re-summarized,
        // so the range starts after a protected prefix and stops at the
        // first protected summary inside it.
        let protected = protected_summary_indices(messages, &self.protection);
        while start < len && protected.contains(&start) {
            start += 1;
        }
        if start >= len {
            return Ok(CompressOutcome::Skipped {
                reason: "no compressible messages".into(),
            });
        }

        let mut end = len.saturating_sub(self.recent_count).max(start + 1);
        if let Some(boundary) = (start..end).find(|i| protected.contains(i)) {
            end = boundary;
        }

        if end.saturating_sub(start) < MIN_RANGE_LEN {
            return Ok(CompressOutcome::Skipped {
                reason: "compression range too small".into(),
            });
        }

        let range = &messages[start..end];
        let range_tokens = count_range(tokenizer, range).await?;

        match self
            .chain
            .summarize_with(range, &self.directive, hooks, cancel)
            .await
        {
            Ok(outcome) => {
                let compressed_count = end - start;
                let summary = Message {
                    id: generate_id("msg"),
                    role: self.summary_role,
                    content: Content::Text(outcome.summary),
                    priority: Priority::Normal,
                    tokens: None,
                    created_at: Some(Utc::now()),
                    lineage: Lineage::Summary {
                        condense_id: generate_id("condense"),
                    },
                    metadata: json!({ "compressedCount": compressed_count }),
                };

                let mut result = Vec::with_capacity(len - compressed_count + 1);
                result.extend_from_slice(&messages[..start]);
                result.push(summary);
                result.extend_from_slice(&messages[end..]);

                self.stats.compaction_count += 1;
                self.stats.total_tokens_compressed += u64::from(range_tokens);
                if self.stats.compaction_count >= COMPACTION_WARNING_THRESHOLD {
                    hooks.compaction_warning(
                        self.stats.compaction_count,
                        self.stats.total_tokens_compressed,
                    );
                }

                debug!(
                    compressed = compressed_count,
                    tokens = range_tokens,
                    model = %outcome.model,
                    compaction_count = self.stats.compaction_count,
                    "compression applied"
                );

                Ok(CompressOutcome::Compressed {
                    messages: result,
                    compressed_count,
                    compressed_tokens: range_tokens,
                    model: outcome.model,
                })
            }
            Err(ContextError::AllModelsFailed { total_attempts, .. }) => {
                hooks.fallback_warning(
                    "all summarizer models failed; falling back to sliding-window truncation",
                );
                warn!(total_attempts, "summarization exhausted, using sliding-window fallback");
                self.fallback_truncate(messages, tokenizer, snapshots).await
            }
            Err(ContextError::Cancelled) => Err(ContextError::Cancelled),
            Err(e) => Ok(CompressOutcome::Failed {
                reason: e.to_string(),
            }),
        }
    }

    /// The degraded path: drop what summarization would have folded away,
    /// and mark every retained non-system, non-summary message with one
    /// fresh truncation-parent id.
    async fn fallback_truncate(
        &mut self,
        messages: &[Message],
        tokenizer: &dyn Tokenizer,
        snapshots: Option<&mut TruncationSnapshotStore>,
    ) -> Result<CompressOutcome, ContextError> {
        let total = count_range(tokenizer, messages).await?;
        let target = (f64::from(total) * self.target_ratio) as u32;
        let parent = generate_id("trunc");

        let opts = TruncateOptions {
            target_tokens: target,
            recent_count: self.recent_count,
            preserve_tool_pairs: self.preserve_tool_pairs,
            max_priority: Priority::ToolPair,
            truncation_reason: Some("compression-fallback".into()),
            truncation_id: Some(parent.clone()),
        };
        let policy = match snapshots {
            Some(store) => SnapshotPolicy::Required(store),
            None => SnapshotPolicy::Disabled,
        };

        let out = match truncate(messages, &opts, tokenizer, policy).await {
            Ok(out) => out,
            Err(e @ ContextError::Tokenizer(_)) => return Err(e),
            Err(e) => {
                return Ok(CompressOutcome::Failed {
                    reason: e.to_string(),
                })
            }
        };

        let mut retained = out.messages;
        for message in &mut retained {
            if message.role == Role::System || message.is_summary() {
                continue;
            }
            message.lineage = Lineage::TruncatedRetained {
                truncation_parent: parent.clone(),
            };
        }

        Ok(CompressOutcome::FallbackTruncated {
            messages: retained,
            removed_count: out.removed_count,
            truncation_parent: parent,
            truncation_id: out.truncation_id,
        })
    }
}

async fn count_range(tokenizer: &dyn Tokenizer, messages: &[Message]) -> Result<u32, ContextError> {
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

/// Indices of summary messages the active strategy shields.
fn protected_summary_indices(
    messages: &[Message],
    strategy: &ProtectionStrategy,
) -> HashSet<usize> {
    let summaries: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_summary())
        .map(|(i, _)| i)
        .collect();

    match strategy {
        ProtectionStrategy::All => summaries.into_iter().collect(),
        ProtectionStrategy::Recent { keep } => {
            let mut by_age = summaries;
            by_age.sort_by_key(|&i| messages[i].created_at);
            by_age.into_iter().rev().take(*keep).collect()
        }
        ProtectionStrategy::Weighted { keep } => {
            let tokens: Vec<f64> = summaries
                .iter()
                .map(|&i| f64::from(estimate_tokens(&messages[i])))
                .collect();
            let recency: Vec<f64> = summaries
                .iter()
                .map(|&i| {
                    messages[i]
                        .created_at
                        .map(|t| t.timestamp_millis() as f64)
                        .unwrap_or(0.0)
                })
                .collect();
            let counts: Vec<f64> = summaries
                .iter()
                .map(|&i| {
                    messages[i]
                        .metadata
                        .get("compressedCount")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(0) as f64
                })
                .collect();

            let mut scored: Vec<(usize, f64)> = summaries
                .iter()
                .enumerate()
                .map(|(k, &idx)| {
                    let score = 0.4 * normalize(tokens[k], &tokens)
                        + 0.4 * normalize(recency[k], &recency)
                        + 0.2 * normalize(counts[k], &counts);
                    (idx, score)
                })
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.into_iter().take(*keep).map(|(idx, _)| idx).collect()
        }
    }
}

fn normalize(value: f64, all: &[f64]) -> f64 {
    let max = all.iter().cloned().fold(0.0_f64, f64::max);
    if max <= 0.0 {
        0.0
    } else {
        value / max
    }
}

fn estimate_tokens(message: &Message) -> u32 {
    if let Some(cached) = message.tokens {
        return cached;
    }
    let chars = match &message.content {
        Content::Text(text) => text.chars().count(),
        Content::Parts(_) => serde_json::to_string(&message.content)
            .map(|s| s.chars().count())
            .unwrap_or(0),
    };
    (chars as u32).div_ceil(4)
}
