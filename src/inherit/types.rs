use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What kind of knowledge an inherited summary carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryType {
    Full,
    Task,
    Decisions,
    CodeChanges,
}

/// A summary persisted at session end and re-hydrated on the next session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InheritedSummary {
    pub id: String,
    pub content: String,
    pub original_session: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub summary_type: SummaryType,
}

/// Which summary categories a new session pulls in. Each maps to a set of
/// [`SummaryType`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritType {
    Summary,
    Decisions,
    CodeState,
    PendingTasks,
}

impl InheritType {
    pub fn matches(self, summary_type: SummaryType) -> bool {
        match self {
            Self::Summary => matches!(summary_type, SummaryType::Full | SummaryType::Task),
            Self::Decisions => summary_type == SummaryType::Decisions,
            Self::CodeState => summary_type == SummaryType::CodeChanges,
            Self::PendingTasks => summary_type == SummaryType::Task,
        }
    }
}

/// Where inherited context comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritSource {
    /// Never resolve anything; the caller hydrates explicitly.
    Manual,
    /// The most recent prior session, preferring the same project.
    #[default]
    LastSession,
    /// The accumulated per-project context file.
    ProjectContext,
}

#[derive(Debug, Clone)]
pub struct InheritanceConfig {
    pub enabled: bool,
    pub source: InheritSource,
    pub inherit_types: Vec<InheritType>,
    /// Summaries beyond this many are dropped before persisting.
    pub max_inherited_summaries: usize,
}

impl Default for InheritanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: InheritSource::default(),
            inherit_types: vec![
                InheritType::Summary,
                InheritType::Decisions,
                InheritType::CodeState,
                InheritType::PendingTasks,
            ],
            max_inherited_summaries: 10,
        }
    }
}

/// One row of `index.json`, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndexEntry {
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    pub summary_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndex {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub sessions: Vec<SessionIndexEntry>,
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self {
            version: 1,
            updated_at: Utc::now(),
            sessions: Vec::new(),
        }
    }
}

/// The per-session file body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSessionData {
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    pub summaries: Vec<InheritedSummary>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Accumulated per-project knowledge, merged across sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContext {
    pub project_path: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub code_patterns: Vec<String>,
    #[serde(default)]
    pub task_summaries: Vec<String>,
}

impl ProjectContext {
    pub fn new(project_path: impl Into<String>) -> Self {
        Self {
            project_path: project_path.into(),
            updated_at: Utc::now(),
            decisions: Vec::new(),
            code_patterns: Vec::new(),
            task_summaries: Vec::new(),
        }
    }
}

/// What resolution hands back for hydration into a new session.
#[derive(Debug, Clone, PartialEq)]
pub struct InheritedContext {
    pub source_session: String,
    pub saved_at: Option<DateTime<Utc>>,
    pub summaries: Vec<InheritedSummary>,
}
