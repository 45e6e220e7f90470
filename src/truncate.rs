use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::error::ContextError;
use crate::snapshot::TruncationSnapshotStore;
use crate::tokenizer::Tokenizer;
use crate::types::{generate_id, Message, Priority, Role};

#[derive(Debug, Clone)]
pub struct TruncateOptions {
    /// Stop dropping once the transcript is at or under this many tokens.
    pub target_tokens: u32,
    /// Size of the always-kept recent tail (non-system messages).
    pub recent_count: usize,
    /// Treat a `tool_use` and its matching `tool_result` as one atomic unit.
    pub preserve_tool_pairs: bool,
    /// Only messages at or below this priority are droppable. The critical
    /// path drops `Low` only; recovery paths widen this.
    pub max_priority: Priority,
    pub truncation_reason: Option<String>,
    /// Preset id for the truncation event. Generated when absent.
    pub truncation_id: Option<String>,
}

impl Default for TruncateOptions {
    fn default() -> Self {
        Self {
            target_tokens: 0,
            recent_count: 5,
            preserve_tool_pairs: true,
            max_priority: Priority::ToolPair,
            truncation_reason: None,
            truncation_id: None,
        }
    }
}

/// Whether and how dropped messages are snapshotted. `Required` is for
/// paths that must hand out a recoverable truncation id; elsewhere a failed
/// save only costs recoverability.
pub enum SnapshotPolicy<'a> {
    Disabled,
    BestEffort(&'a mut TruncationSnapshotStore),
    Required(&'a mut TruncationSnapshotStore),
}

#[derive(Debug)]
pub struct TruncateOutcome {
    pub messages: Vec<Message>,
    pub removed_count: usize,
    pub token_count: u32,
    /// Set when the dropped messages were snapshotted.
    pub truncation_id: Option<String>,
}

/// Sliding-window truncation: system messages and the recent tail always
/// survive; the middle is dropped oldest-first until the target is met or
/// the block is exhausted.
pub async fn truncate(
    messages: &[Message],
    opts: &TruncateOptions,
    tokenizer: &dyn Tokenizer,
    snapshots: SnapshotPolicy<'_>,
) -> Result<TruncateOutcome, ContextError> {
    let mut tokens = Vec::with_capacity(messages.len());
    let mut total: u32 = 0;
    for message in messages {
        let count = match message.tokens {
            Some(cached) => cached,
            None => tokenizer.count_message(message).await?,
        };
        tokens.push(count);
        total = total.saturating_add(count);
    }

    let protected: Vec<bool> = messages
        .iter()
        .map(|m| m.role == Role::System || m.priority == Priority::System)
        .collect();

    let non_system: Vec<usize> = (0..messages.len()).filter(|&i| !protected[i]).collect();
    let tail_start = non_system.len().saturating_sub(opts.recent_count);
    let recent: HashSet<usize> = non_system[tail_start..].iter().copied().collect();

    // Pair linkage across messages, both directions.
    let mut use_msg: HashMap<&str, usize> = HashMap::new();
    let mut result_msg: HashMap<&str, usize> = HashMap::new();
    for (i, message) in messages.iter().enumerate() {
        for id in message.tool_use_ids() {
            use_msg.insert(id, i);
        }
        for id in message.tool_result_ids() {
            result_msg.insert(id, i);
        }
    }

    let mut kept = vec![true; messages.len()];
    let mut visited: HashSet<usize> = HashSet::new();

    for &idx in &non_system[..tail_start] {
        if total <= opts.target_tokens {
            break;
        }
        if visited.contains(&idx) || !kept[idx] {
            continue;
        }

        let mut group = vec![idx];
        if opts.preserve_tool_pairs {
            for id in messages[idx].tool_use_ids() {
                if let Some(&partner) = result_msg.get(id) {
                    if partner != idx {
                        group.push(partner);
                    }
                }
            }
            for id in messages[idx].tool_result_ids() {
                if let Some(&partner) = use_msg.get(id) {
                    if partner != idx {
                        group.push(partner);
                    }
                }
            }
        }

        visited.extend(group.iter().copied());

        let undroppable = group.iter().any(|&i| {
            protected[i] || recent.contains(&i) || messages[i].priority > opts.max_priority
        });
        if undroppable {
            continue;
        }

        for &i in &group {
            if kept[i] {
                kept[i] = false;
                total = total.saturating_sub(tokens[i]);
            }
        }
    }

    let retained: Vec<Message> = messages
        .iter()
        .zip(&kept)
        .filter(|(_, &k)| k)
        .map(|(m, _)| m.clone())
        .collect();
    let removed: Vec<Message> = messages
        .iter()
        .zip(&kept)
        .filter(|(_, &k)| !k)
        .map(|(m, _)| m.clone())
        .collect();

    if removed.is_empty() {
        return Ok(TruncateOutcome {
            messages: retained,
            removed_count: 0,
            token_count: total,
            truncation_id: None,
        });
    }

    let reason = opts.truncation_reason.as_deref().unwrap_or("truncation");
    let id = opts
        .truncation_id
        .clone()
        .unwrap_or_else(|| generate_id("trunc"));

    // The snapshot must exist before the shortened transcript is handed out.
    let truncation_id = match snapshots {
        SnapshotPolicy::Disabled => None,
        SnapshotPolicy::BestEffort(store) => match store.save_snapshot(&id, &removed, reason) {
            Ok(_) => Some(id),
            Err(e) => {
                warn!(error = %e, "snapshot save failed, truncation proceeds unrecoverable");
                None
            }
        },
        SnapshotPolicy::Required(store) => {
            store.save_snapshot(&id, &removed, reason)?;
            Some(id)
        }
    };

    info!(
        removed = removed.len(),
        token_count = total,
        reason,
        "truncation applied"
    );

    Ok(TruncateOutcome {
        messages: retained,
        removed_count: removed.len(),
        token_count: total,
        truncation_id,
    })
}
