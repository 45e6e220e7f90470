use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::types::{
    InheritSource, InheritanceConfig, InheritedContext, InheritedSummary, ProjectContext,
    SessionIndex, SessionIndexEntry, StoredSessionData, SummaryType,
};
use crate::error::ContextError;
use crate::types::{generate_id, Content, Lineage, Message, Priority, Role};

const INDEX_FILE: &str = "index.json";
const PROJECT_CONTEXT_FILE: &str = "project-context.json";
/// Newest sessions kept in the index; evicted sessions lose their files.
const MAX_INDEX_SESSIONS: usize = 50;
/// Per-list cap inside the project-context file.
const MAX_PROJECT_ITEMS: usize = 10;

/// Identity of the most recently saved session.
#[derive(Debug, Clone, PartialEq)]
pub struct LastSessionInfo {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
}

/// On-disk store of prior-session summaries plus a project-level
/// accumulated-context file.
///
/// Layout under the storage directory:
/// ```text
/// index.json                  # SessionIndex, newest first, capped
/// session-<sanitizedId>.json  # StoredSessionData per session
/// project-context.json        # projectPath -> ProjectContext
/// ```
/// All writes go through temp-file + fsync + rename so a torn write can
/// never leave a half-written file behind.
pub struct InheritanceStore {
    dir: PathBuf,
    config: InheritanceConfig,
}

impl InheritanceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            config: InheritanceConfig::default(),
        }
    }

    pub fn with_config(mut self, config: InheritanceConfig) -> Self {
        self.config = config;
        self
    }

    /// Persist a session's summaries. Summaries are filtered by the
    /// configured inherit types and capped; a save with nothing left after
    /// filtering creates no files at all. A no-op when disabled.
    pub async fn save_summaries(
        &self,
        session_id: &str,
        summaries: &[InheritedSummary],
        project_path: Option<&str>,
    ) -> Result<(), ContextError> {
        if !self.config.enabled {
            return Ok(());
        }

        let mut filtered: Vec<InheritedSummary> = summaries
            .iter()
            .filter(|s| {
                self.config
                    .inherit_types
                    .iter()
                    .any(|t| t.matches(s.summary_type))
            })
            .cloned()
            .collect();
        if filtered.is_empty() {
            debug!(session_id, "no summaries match inherit types, skipping save");
            return Ok(());
        }
        filtered.truncate(self.config.max_inherited_summaries);

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ContextError::InheritanceIo(e.to_string()))?;

        let data = StoredSessionData {
            session_id: session_id.to_string(),
            saved_at: Utc::now(),
            project_path: project_path.map(String::from),
            summaries: filtered.clone(),
            metadata: serde_json::Value::Null,
        };
        write_json_atomic(&self.session_path(session_id), &data).await?;

        let mut index = self.load_index().await;
        index.sessions.retain(|s| s.session_id != session_id);
        index.sessions.insert(
            0,
            SessionIndexEntry {
                session_id: session_id.to_string(),
                saved_at: data.saved_at,
                project_path: project_path.map(String::from),
                summary_count: filtered.len(),
            },
        );
        while index.sessions.len() > MAX_INDEX_SESSIONS {
            if let Some(evicted) = index.sessions.pop() {
                let path = self.session_path(&evicted.session_id);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(session_id = %evicted.session_id, error = %e, "failed to remove evicted session file");
                    }
                }
            }
        }
        index.updated_at = Utc::now();
        write_json_atomic(&self.dir.join(INDEX_FILE), &index).await?;

        if let Some(path) = project_path {
            self.update_project_context(path, &filtered).await?;
        }

        info!(session_id, count = filtered.len(), "session summaries saved");
        Ok(())
    }

    /// Resolve what a new session should inherit. Missing or malformed
    /// files never raise — they resolve to `None` and are logged.
    pub async fn resolve_inheritance(&self, project_path: Option<&str>) -> Option<InheritedContext> {
        if !self.config.enabled {
            return None;
        }
        match self.config.source {
            InheritSource::Manual => None,
            InheritSource::LastSession => {
                let index = self.load_index().await;
                let entry = match project_path {
                    Some(path) => index
                        .sessions
                        .iter()
                        .find(|s| s.project_path.as_deref() == Some(path))
                        .or_else(|| index.sessions.first()),
                    None => index.sessions.first(),
                }?;
                let data: StoredSessionData =
                    read_json(&self.session_path(&entry.session_id)).await?;
                Some(InheritedContext {
                    source_session: data.session_id,
                    saved_at: Some(data.saved_at),
                    summaries: data.summaries,
                })
            }
            InheritSource::ProjectContext => {
                let path = project_path?;
                let contexts: HashMap<String, ProjectContext> =
                    read_json(&self.dir.join(PROJECT_CONTEXT_FILE)).await?;
                let ctx = contexts.get(path)?;
                let mut summaries = Vec::new();
                let mut push = |items: &[String], summary_type: SummaryType| {
                    for content in items {
                        summaries.push(InheritedSummary {
                            id: generate_id("inh"),
                            content: content.clone(),
                            original_session: format!("project:{path}"),
                            created_at: ctx.updated_at,
                            summary_type,
                        });
                    }
                };
                push(&ctx.decisions, SummaryType::Decisions);
                push(&ctx.code_patterns, SummaryType::CodeChanges);
                push(&ctx.task_summaries, SummaryType::Task);
                if summaries.is_empty() {
                    return None;
                }
                Some(InheritedContext {
                    source_session: format!("project:{path}"),
                    saved_at: Some(ctx.updated_at),
                    summaries,
                })
            }
        }
    }

    /// Render inherited context as the synthetic system message that opens
    /// a new session.
    pub fn format_as_message(inherited: &InheritedContext) -> Message {
        let mut body = String::from("## Inherited Context from Previous Session\n");

        let sections: [(SummaryType, &str); 4] = [
            (SummaryType::Full, "### Session Summary"),
            (SummaryType::Decisions, "### Key Decisions"),
            (SummaryType::CodeChanges, "### Code Changes"),
            (SummaryType::Task, "### Task Summary"),
        ];
        for (summary_type, heading) in sections {
            let group: Vec<&InheritedSummary> = inherited
                .summaries
                .iter()
                .filter(|s| s.summary_type == summary_type)
                .collect();
            if group.is_empty() {
                continue;
            }
            body.push('\n');
            body.push_str(heading);
            body.push('\n');
            for summary in group {
                body.push('\n');
                body.push_str(&summary.content);
                body.push('\n');
            }
        }

        Message {
            id: generate_id("msg"),
            role: Role::System,
            content: Content::Text(body),
            priority: Priority::System,
            tokens: None,
            created_at: Some(Utc::now()),
            lineage: Lineage::None,
            metadata: json!({
                "isInherited": true,
                "sourceSession": inherited.source_session,
            }),
        }
    }

    /// Identity of the most recent saved session, if any.
    pub async fn get_last_session_info(&self) -> Option<LastSessionInfo> {
        let index = self.load_index().await;
        index.sessions.first().map(|entry| LastSessionInfo {
            session_id: entry.session_id.clone(),
            timestamp: entry.saved_at,
        })
    }

    /// Remove sessions older than `max_age` (default 30 days) from disk and
    /// the index. Returns how many sessions were removed.
    pub async fn cleanup(&self, max_age: Option<Duration>) -> Result<usize, ContextError> {
        let cutoff = Utc::now() - max_age.unwrap_or_else(|| Duration::days(30));
        let mut index = self.load_index().await;
        let (keep, expired): (Vec<_>, Vec<_>) = index
            .sessions
            .drain(..)
            .partition(|s| s.saved_at >= cutoff);
        if expired.is_empty() {
            return Ok(0);
        }

        for entry in &expired {
            let path = self.session_path(&entry.session_id);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(session_id = %entry.session_id, error = %e, "failed to remove expired session file");
                }
            }
        }

        index.sessions = keep;
        index.updated_at = Utc::now();
        write_json_atomic(&self.dir.join(INDEX_FILE), &index).await?;
        info!(removed = expired.len(), "expired sessions cleaned");
        Ok(expired.len())
    }

    /// The session index, newest first. Missing or corrupt files read as
    /// empty.
    pub async fn load_index(&self) -> SessionIndex {
        read_json(&self.dir.join(INDEX_FILE))
            .await
            .unwrap_or_default()
    }

    async fn update_project_context(
        &self,
        project_path: &str,
        summaries: &[InheritedSummary],
    ) -> Result<(), ContextError> {
        let path = self.dir.join(PROJECT_CONTEXT_FILE);
        let mut contexts: HashMap<String, ProjectContext> =
            read_json(&path).await.unwrap_or_default();
        let ctx = contexts
            .entry(project_path.to_string())
            .or_insert_with(|| ProjectContext::new(project_path));

        for summary in summaries {
            let list = match summary.summary_type {
                SummaryType::Decisions => &mut ctx.decisions,
                SummaryType::CodeChanges => &mut ctx.code_patterns,
                SummaryType::Task => &mut ctx.task_summaries,
                SummaryType::Full => continue,
            };
            merge_newest(list, &summary.content);
        }
        ctx.updated_at = Utc::now();

        write_json_atomic(&path, &contexts).await
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("session-{}.json", sanitize_session_id(session_id)))
    }
}

/// Newest-first merge with content dedup and a fixed cap.
fn merge_newest(list: &mut Vec<String>, content: &str) {
    list.retain(|existing| existing != content);
    list.insert(0, content.to_string());
    list.truncate(MAX_PROJECT_ITEMS);
}

/// Anything outside `[A-Za-z0-9_-]` becomes `_`, so a session id can never
/// escape the storage directory or produce an invalid file name.
fn sanitize_session_id(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read inheritance file");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed inheritance file ignored");
            None
        }
    }
}

/// Whole-file replace: write to a temp file, fsync, rename into place.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ContextError> {
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| ContextError::Serialization(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");

    let io = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(body.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    };
    io.await.map_err(|e| ContextError::InheritanceIo(e.to_string()))
}
