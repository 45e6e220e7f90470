use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Drop ordering under pressure. Higher priority is kept longer; `System`
/// priority is never dropped by truncation at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    ToolPair,
    System,
}

/// Message body: either plain text or an ordered sequence of content parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { mime_type: String, source: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult { tool_use_id: String, content: String },
}

/// How a message came to be in the transcript.
///
/// `Summary` marks a message *produced by* a compression step; the
/// `condense_id` links it to that event. `TruncatedRetained` marks a message
/// *retained through* a fallback sliding-window truncation; the
/// `truncation_parent` links it to the truncation event that replaced the
/// summarization. A message carries at most one of the two.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Lineage {
    #[default]
    None,
    Summary { condense_id: String },
    TruncatedRetained { truncation_parent: String },
}

/// A single transcript message. Owned by the caller; the engine never
/// mutates caller storage — every operation returns a new sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: Content,
    #[serde(default)]
    pub priority: Priority,
    /// Cached token count. When present it wins over the injected tokenizer —
    /// the caller is closer to the provider's accounting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lineage: Lineage,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, content: Content) -> Self {
        Self {
            id: id.into(),
            role,
            content,
            priority: Priority::default(),
            tokens: None,
            created_at: Some(Utc::now()),
            lineage: Lineage::default(),
            metadata: Value::Null,
        }
    }

    /// Plain-text message with an auto-generated id.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(generate_id("msg"), role, Content::Text(text.into()))
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn is_summary(&self) -> bool {
        matches!(self.lineage, Lineage::Summary { .. })
    }

    pub fn condense_id(&self) -> Option<&str> {
        match &self.lineage {
            Lineage::Summary { condense_id } => Some(condense_id),
            _ => None,
        }
    }

    pub fn truncation_parent(&self) -> Option<&str> {
        match &self.lineage {
            Lineage::TruncatedRetained { truncation_parent } => Some(truncation_parent),
            _ => None,
        }
    }

    /// Content parts view. Plain-text bodies yield no parts.
    pub fn parts(&self) -> &[ContentPart] {
        match &self.content {
            Content::Text(_) => &[],
            Content::Parts(parts) => parts,
        }
    }

    /// Ids of `tool_use` blocks this message carries.
    pub fn tool_use_ids(&self) -> impl Iterator<Item = &str> {
        self.parts().iter().filter_map(|p| match p {
            ContentPart::ToolUse { id, .. } => Some(id.as_str()),
            _ => None,
        })
    }

    /// Ids of `tool_use` blocks this message answers.
    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        self.parts().iter().filter_map(|p| match p {
            ContentPart::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
            _ => None,
        })
    }
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a process-unique id: nanosecond timestamp plus a counter so two
/// ids minted in the same instant still differ.
pub(crate) fn generate_id(prefix: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let n = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{ts:x}{n:02x}")
}
