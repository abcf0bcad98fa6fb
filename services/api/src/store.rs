//! Session Store
//!
//! Durable, per-call persistence of the conversation transcript. Each event for
//! a call is handled independently, so this store is the only continuity a call
//! has between events.
//!
//! Backends implement [`SessionStore`] with plain `Result`s. The orchestrator
//! talks to them through [`Sessions`], which applies the soft-fail policy: a
//! read problem yields a fresh transcript, and a write problem is handed back
//! for the caller to log.
//!
//! Updates are read-modify-write with no version check, so two prompts racing
//! on the same call resolve as last-writer-wins.

use async_trait::async_trait;
use callrelay_core::transcript::{Transcript, Turn};
use chrono::{DateTime, Duration, Utc};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session store query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Stored conversation is not a valid turn sequence: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Session store unavailable: {0}")]
    Unavailable(String),
}

/// Raw persistence of turn sequences keyed by call identifier.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the stored turns, or `None` if the call has no live record.
    /// Records past their expiry are treated as absent.
    async fn load(&self, call_id: &str) -> Result<Option<Vec<Turn>>, StoreError>;

    /// Overwrites the whole record for `call_id`.
    async fn save(
        &self,
        call_id: &str,
        turns: &[Turn],
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Soft-failing transcript access used by the orchestrator.
#[derive(Clone)]
pub struct Sessions {
    store: Arc<dyn SessionStore>,
    system_prompt: Arc<String>,
    ttl: Duration,
}

impl Sessions {
    pub fn new(store: Arc<dyn SessionStore>, system_prompt: Arc<String>, ttl: Duration) -> Self {
        Self {
            store,
            system_prompt,
            ttl,
        }
    }

    /// A transcript holding only the system instruction.
    pub fn fresh(&self) -> Transcript {
        Transcript::new(self.system_prompt.as_str())
    }

    /// Loads the transcript for `call_id`. Never fails: a missing, expired or
    /// unreadable record starts a fresh conversation.
    pub async fn get(&self, call_id: &str) -> Transcript {
        match self.store.load(call_id).await {
            Ok(Some(turns)) => {
                debug!(%call_id, turns = turns.len(), "Loaded stored transcript");
                Transcript::from_turns(turns, &self.system_prompt)
            }
            Ok(None) => {
                debug!(%call_id, "No stored transcript; starting fresh");
                self.fresh()
            }
            Err(e) => {
                warn!(%call_id, error = %e, "Failed to load transcript; starting fresh");
                self.fresh()
            }
        }
    }

    /// Persists `transcript` with a renewed expiry.
    pub async fn put(&self, call_id: &str, transcript: &Transcript) -> Result<(), StoreError> {
        let expires_at = Utc::now() + self.ttl;
        self.store
            .save(call_id, transcript.turns(), expires_at)
            .await
    }
}

struct MemoryRecord {
    turns: Vec<Turn>,
    expires_at: DateTime<Utc>,
}

/// An in-process store for development and tests. Contents do not survive a
/// restart.
#[derive(Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, MemoryRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every record whose expiry has passed. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        before - records.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, call_id: &str) -> Result<Option<Vec<Turn>>, StoreError> {
        let records = self.records.read().await;
        Ok(records
            .get(call_id)
            .filter(|record| record.expires_at > Utc::now())
            .map(|record| record.turns.clone()))
    }

    async fn save(
        &self,
        call_id: &str,
        turns: &[Turn],
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.records.write().await.insert(
            call_id.to_string(),
            MemoryRecord {
                turns: turns.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }
}
