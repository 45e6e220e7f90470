use std::io::{Read, Write};

use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ContextError;
use crate::types::Message;

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// How many snapshots to keep; the least recently used one is evicted.
    pub max_snapshots: usize,
    /// Hard cap on a single snapshot's stored bytes, post-compression.
    pub max_snapshot_size: usize,
    pub enable_compression: bool,
    /// Payloads at least this many serialized bytes get a compression pass.
    pub compression_threshold: usize,
    /// Snapshots older than this are invisible and cleaned on next touch.
    pub expiration: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 3,
            max_snapshot_size: 512 * 1024,
            enable_compression: true,
            compression_threshold: 1024,
            expiration: Duration::minutes(30),
        }
    }
}

/// The stored payload of one truncation event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncationSnapshot {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub compressed: bool,
    pub size_bytes: usize,
    payload: Vec<u8>,
}

/// A truncation event: which messages were dropped, when, and why, plus the
/// recoverable snapshot of their bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruncationState {
    pub truncation_id: String,
    pub truncated_at: DateTime<Utc>,
    pub reason: String,
    pub truncated_message_ids: Vec<String>,
    pub snapshot: TruncationSnapshot,
}

/// Short-lived, size-bounded store of dropped-message snapshots so a
/// truncation stays reversible for a while. LRU keyed by truncation id;
/// access bumps recency, saving evicts the coldest entry.
pub struct TruncationSnapshotStore {
    config: SnapshotConfig,
    // Recency order: coldest first, hottest last.
    entries: Vec<TruncationState>,
}

impl TruncationSnapshotStore {
    pub fn new(config: SnapshotConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize and store the dropped messages under `truncation_id`.
    /// Saving to an existing id overwrites. Returns the stored state.
    pub fn save_snapshot(
        &mut self,
        truncation_id: &str,
        messages: &[Message],
        reason: &str,
    ) -> Result<TruncationState, ContextError> {
        let serialized = serde_json::to_vec(messages)
            .map_err(|e| ContextError::Serialization(e.to_string()))?;

        let mut payload = serialized;
        let mut compressed = false;
        if self.config.enable_compression && payload.len() >= self.config.compression_threshold {
            let packed = gzip(&payload)?;
            // Keep the compressed form only when it actually wins.
            if packed.len() < payload.len() {
                payload = packed;
                compressed = true;
            }
        }

        if payload.len() > self.config.max_snapshot_size {
            return Err(ContextError::SnapshotTooLarge {
                size_bytes: payload.len(),
                max_bytes: self.config.max_snapshot_size,
            });
        }

        let now = Utc::now();
        let state = TruncationState {
            truncation_id: truncation_id.to_string(),
            truncated_at: now,
            reason: reason.to_string(),
            truncated_message_ids: messages.iter().map(|m| m.id.clone()).collect(),
            snapshot: TruncationSnapshot {
                snapshot_id: truncation_id.to_string(),
                created_at: now,
                expires_at: now + self.config.expiration,
                compressed,
                size_bytes: payload.len(),
                payload,
            },
        };

        self.entries.retain(|e| e.truncation_id != truncation_id);
        while self.entries.len() >= self.config.max_snapshots {
            let evicted = self.entries.remove(0);
            debug!(truncation_id = %evicted.truncation_id, "snapshot evicted");
        }
        self.entries.push(state.clone());
        Ok(state)
    }

    /// Recover the dropped messages for a truncation. Expired or unknown ids
    /// yield `None`; a hit bumps the entry's recency.
    pub fn recover(&mut self, truncation_id: &str) -> Result<Option<Vec<Message>>, ContextError> {
        let Some(state) = self.touch(truncation_id) else {
            return Ok(None);
        };
        let snapshot = &state.snapshot;
        let bytes = if snapshot.compressed {
            gunzip(&snapshot.payload)?
        } else {
            snapshot.payload.clone()
        };
        let messages: Vec<Message> = serde_json::from_slice(&bytes)
            .map_err(|e| ContextError::Serialization(e.to_string()))?;
        Ok(Some(messages))
    }

    /// Look up the truncation state without decoding the payload.
    pub fn get_state(&mut self, truncation_id: &str) -> Option<TruncationState> {
        self.touch(truncation_id).cloned()
    }

    /// All currently recoverable (non-expired) truncations, coldest first.
    pub fn list_recoverable(&self) -> Vec<&TruncationState> {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|e| e.snapshot.expires_at > now)
            .collect()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn cleanup(&mut self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|e| e.snapshot.expires_at > now);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "expired snapshots cleaned");
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Find a live entry and move it to the hot end. Expired entries are
    /// removed on the way.
    fn touch(&mut self, truncation_id: &str) -> Option<&TruncationState> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.truncation_id == truncation_id)?;
        if self.entries[idx].snapshot.expires_at <= Utc::now() {
            let expired = self.entries.remove(idx);
            warn!(truncation_id = %expired.truncation_id, "snapshot expired");
            return None;
        }
        let entry = self.entries.remove(idx);
        self.entries.push(entry);
        self.entries.last()
    }
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, ContextError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .and_then(|_| encoder.finish())
        .map_err(|e| ContextError::Serialization(e.to_string()))
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, ContextError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ContextError::Serialization(e.to_string()))?;
    Ok(out)
}
