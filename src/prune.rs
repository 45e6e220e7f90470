use std::collections::HashMap;

use tracing::debug;

use crate::types::{Content, ContentPart, Message};

/// Below this many transcript tokens, pruning is skipped even under warning
/// pressure — there is nothing worth reclaiming.
pub const PRUNE_MINIMUM_TOKENS: u32 = 5_000;

#[derive(Debug, Clone)]
pub struct PruneConfig {
    /// Approximate character count a trimmed tool output retains.
    pub max_output_chars: usize,
    /// Tool names whose outputs are never trimmed.
    pub protected_tools: Vec<String>,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            max_output_chars: 4_000,
            protected_tools: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct PruneOutcome {
    pub messages: Vec<Message>,
    pub trimmed_count: usize,
    pub tokens_saved_estimate: u32,
}

/// Replace oversized `tool_result` payloads with a head/marker/tail form
/// retaining roughly `max_output_chars` characters. Outputs of protected
/// tools are untouched. Operates on a copy; the input is not mutated.
pub fn prune_tool_outputs(messages: &[Message], config: &PruneConfig) -> PruneOutcome {
    // Tool names are carried by the tool_use block, not the result — map
    // result ids back through the transcript's tool_use blocks.
    let mut names_by_use_id: HashMap<&str, &str> = HashMap::new();
    for message in messages {
        for part in message.parts() {
            if let ContentPart::ToolUse { id, name, .. } = part {
                names_by_use_id.insert(id.as_str(), name.as_str());
            }
        }
    }

    let mut out = messages.to_vec();
    let mut trimmed_count = 0usize;
    let mut chars_saved = 0usize;

    for message in &mut out {
        let Content::Parts(parts) = &mut message.content else {
            continue;
        };
        let mut touched = false;
        for part in parts.iter_mut() {
            let ContentPart::ToolResult { tool_use_id, content } = part else {
                continue;
            };
            let name = names_by_use_id.get(tool_use_id.as_str()).copied();
            if let Some(name) = name {
                if config.protected_tools.iter().any(|p| p == name) {
                    continue;
                }
            }
            let char_len = content.chars().count();
            if char_len <= config.max_output_chars {
                continue;
            }

            let head_len = config.max_output_chars / 2;
            let tail_len = config.max_output_chars - head_len;
            let omitted = char_len - head_len - tail_len;
            let head: String = content.chars().take(head_len).collect();
            let tail: String = content.chars().skip(char_len - tail_len).collect();
            *content = format!("{head}… [{omitted} chars omitted] …{tail}");

            trimmed_count += 1;
            chars_saved += omitted;
            touched = true;
        }
        if touched {
            // Cached counts no longer reflect the trimmed body.
            message.tokens = None;
        }
    }

    let tokens_saved_estimate = (chars_saved / 4) as u32;
    if trimmed_count > 0 {
        debug!(trimmed = trimmed_count, tokens_saved = tokens_saved_estimate, "tool outputs pruned");
    }

    PruneOutcome {
        messages: out,
        trimmed_count,
        tokens_saved_estimate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Content, Message, Role};
    use serde_json::json;

    fn tool_pair(use_id: &str, name: &str, output: String) -> Vec<Message> {
        vec![
            Message::new(
                format!("a-{use_id}"),
                Role::Assistant,
                Content::Parts(vec![ContentPart::ToolUse {
                    id: use_id.into(),
                    name: name.into(),
                    input: json!({}),
                }]),
            ),
            Message::new(
                format!("t-{use_id}"),
                Role::Tool,
                Content::Parts(vec![ContentPart::ToolResult {
                    tool_use_id: use_id.into(),
                    content: output,
                }]),
            ),
        ]
    }

    #[test]
    fn oversized_output_trimmed_with_marker() {
        let messages = tool_pair("c1", "read", "x".repeat(10_000));
        let config = PruneConfig {
            max_output_chars: 1_000,
            protected_tools: vec![],
        };

        let outcome = prune_tool_outputs(&messages, &config);
        assert_eq!(outcome.trimmed_count, 1);
        assert!(outcome.tokens_saved_estimate > 2_000);

        let ContentPart::ToolResult { content, .. } = &outcome.messages[1].parts()[0] else {
            panic!("expected tool result");
        };
        assert!(content.contains("[9000 chars omitted]"));
        assert!(content.starts_with("xxx"));
        assert!(content.ends_with("xxx"));
    }

    #[test]
    fn small_outputs_untouched() {
        let messages = tool_pair("c1", "read", "short output".into());
        let outcome = prune_tool_outputs(&messages, &PruneConfig::default());
        assert_eq!(outcome.trimmed_count, 0);
        assert_eq!(outcome.messages, messages);
    }

    #[test]
    fn protected_tool_untouched() {
        let messages = tool_pair("c1", "plan", "x".repeat(10_000));
        let config = PruneConfig {
            max_output_chars: 1_000,
            protected_tools: vec!["plan".into()],
        };
        let outcome = prune_tool_outputs(&messages, &config);
        assert_eq!(outcome.trimmed_count, 0);
        assert_eq!(outcome.messages, messages);
    }

    #[test]
    fn trims_multiple_results_and_clears_cached_tokens() {
        let mut messages = tool_pair("c1", "read", "a".repeat(5_000));
        messages.extend(tool_pair("c2", "search", "b".repeat(5_000)));
        messages[1].tokens = Some(1_250);
        let config = PruneConfig {
            max_output_chars: 500,
            protected_tools: vec![],
        };

        let outcome = prune_tool_outputs(&messages, &config);
        assert_eq!(outcome.trimmed_count, 2);
        assert_eq!(outcome.messages[1].tokens, None);
    }

    #[test]
    fn input_is_not_mutated() {
        let messages = tool_pair("c1", "read", "x".repeat(10_000));
        let config = PruneConfig {
            max_output_chars: 100,
            protected_tools: vec![],
        };
        let _ = prune_tool_outputs(&messages, &config);
        let ContentPart::ToolResult { content, .. } = &messages[1].parts()[0] else {
            panic!("expected tool result");
        };
        assert_eq!(content.chars().count(), 10_000);
    }
}
