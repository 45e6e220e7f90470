use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ContextError;
use crate::types::{generate_id, Message};

/// An immutable copy of the full transcript at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub reason: String,
    pub label: Option<String>,
    pub token_count: u32,
}

/// What a rollback hands back: the restored transcript plus everything the
/// current transcript had that the checkpoint does not.
#[derive(Debug)]
pub struct RollbackOutcome {
    pub messages: Vec<Message>,
    pub discarded_messages: Vec<Message>,
}

/// Bounded store of transcript snapshots for rollback-based recovery.
/// Eviction is oldest-by-creation.
pub struct CheckpointStore {
    max_checkpoints: usize,
    // Creation order: oldest first.
    checkpoints: Vec<Checkpoint>,
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new(5)
    }
}

impl CheckpointStore {
    pub fn new(max_checkpoints: usize) -> Self {
        Self {
            max_checkpoints: max_checkpoints.max(1),
            checkpoints: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Snapshot the transcript. Returns the new checkpoint's id.
    pub fn create(
        &mut self,
        messages: &[Message],
        reason: impl Into<String>,
        label: Option<String>,
        token_count: u32,
    ) -> String {
        while self.checkpoints.len() >= self.max_checkpoints {
            let evicted = self.checkpoints.remove(0);
            debug!(id = %evicted.id, "checkpoint evicted");
        }
        let checkpoint = Checkpoint {
            id: generate_id("ckpt"),
            created_at: Utc::now(),
            messages: messages.to_vec(),
            reason: reason.into(),
            label,
            token_count,
        };
        let id = checkpoint.id.clone();
        self.checkpoints.push(checkpoint);
        id
    }

    /// Checkpoints newest-first.
    pub fn list(&self) -> Vec<&Checkpoint> {
        self.checkpoints.iter().rev().collect()
    }

    pub fn get(&self, id: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.id == id)
    }

    /// Newest checkpoint created within `window` of now, if any.
    pub fn newest_within(&self, window: Duration) -> Option<&Checkpoint> {
        let cutoff = Utc::now() - window;
        self.checkpoints
            .iter()
            .rev()
            .find(|c| c.created_at >= cutoff)
    }

    /// Restore the transcript stored under `id`. Messages present in the
    /// current transcript but absent from the checkpoint are returned as
    /// discarded.
    pub fn rollback(
        &self,
        id: &str,
        current_messages: &[Message],
    ) -> Result<RollbackOutcome, ContextError> {
        let checkpoint = self
            .get(id)
            .ok_or_else(|| ContextError::CheckpointNotFound(id.to_string()))?;

        let kept_ids: std::collections::HashSet<&str> =
            checkpoint.messages.iter().map(|m| m.id.as_str()).collect();
        let discarded = current_messages
            .iter()
            .filter(|m| !kept_ids.contains(m.id.as_str()))
            .cloned()
            .collect();

        Ok(RollbackOutcome {
            messages: checkpoint.messages.clone(),
            discarded_messages: discarded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Content, Role};

    fn msg(id: &str) -> Message {
        Message::new(id, Role::User, Content::Text("x".into()))
    }

    #[test]
    fn create_and_list_newest_first() {
        let mut store = CheckpointStore::default();
        let a = store.create(&[msg("m1")], "pre-compression", None, 10);
        let b = store.create(&[msg("m1"), msg("m2")], "pre-compression", None, 20);

        let listed = store.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, b);
        assert_eq!(listed[1].id, a);
    }

    #[test]
    fn eviction_is_oldest_first_and_bounded() {
        let mut store = CheckpointStore::new(3);
        let ids: Vec<String> = (0..5)
            .map(|i| store.create(&[msg(&format!("m{i}"))], "r", None, 1))
            .collect();

        assert_eq!(store.len(), 3);
        assert!(store.get(&ids[0]).is_none());
        assert!(store.get(&ids[1]).is_none());
        assert!(store.get(&ids[4]).is_some());
    }

    #[test]
    fn rollback_restores_and_reports_discards() {
        let mut store = CheckpointStore::default();
        let id = store.create(&[msg("m1"), msg("m2")], "r", None, 20);

        let current = vec![msg("m1"), msg("m2"), msg("m3"), msg("m4")];
        let outcome = store.rollback(&id, &current).unwrap();
        assert_eq!(
            outcome.messages.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["m1", "m2"]
        );
        assert_eq!(
            outcome
                .discarded_messages
                .iter()
                .map(|m| m.id.as_str())
                .collect::<Vec<_>>(),
            vec!["m3", "m4"]
        );
    }

    #[test]
    fn rollback_unknown_id_errors() {
        let store = CheckpointStore::default();
        let err = store.rollback("ckpt_missing", &[]).unwrap_err();
        assert!(matches!(err, ContextError::CheckpointNotFound(_)));
    }

    #[test]
    fn newest_within_window() {
        let mut store = CheckpointStore::default();
        assert!(store.newest_within(Duration::minutes(10)).is_none());

        let id = store.create(&[msg("m1")], "r", None, 1);
        let found = store.newest_within(Duration::minutes(10)).unwrap();
        assert_eq!(found.id, id);
        // A zero-width window excludes even a fresh checkpoint.
        assert!(store.newest_within(Duration::milliseconds(-1)).is_none());
    }

    #[test]
    fn labels_are_kept() {
        let mut store = CheckpointStore::default();
        let id = store.create(&[msg("m1")], "manual", Some("before refactor".into()), 5);
        assert_eq!(store.get(&id).unwrap().label.as_deref(), Some("before refactor"));
    }
}
