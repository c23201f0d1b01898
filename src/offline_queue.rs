//! Durable buffer of mutations made while disconnected.
//!
//! The whole queue is one JSON document under [`KEY_OFFLINE_QUEUE`] and is
//! rewritten on every change. Entries are never reordered in storage; replay
//! sorts a copy.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LedgerResult;
use crate::identity::Actor;
use crate::ledger::ProductKey;
use crate::rooms::RoomStatus;
use crate::store::{read_json, write_json, KvStore, KEY_OFFLINE_QUEUE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Sale,
    RoomStatusChange,
    Purchase,
    Wastage,
    Adjustment,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Sale => "sale",
            Self::RoomStatusChange => "room-status-change",
            Self::Purchase => "purchase",
            Self::Wastage => "wastage",
            Self::Adjustment => "adjustment",
        };
        f.write_str(label)
    }
}

/// Arguments of the deferred call, exactly as the live entry point takes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationPayload {
    Sale {
        product: ProductKey,
        servings: u32,
    },
    RoomStatusChange {
        room_id: String,
        status: RoomStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        occupant: Option<String>,
    },
    Purchase {
        product: ProductKey,
        cases: u64,
        containers: u64,
    },
    Wastage {
        product: ProductKey,
        ml: u64,
        reason: String,
    },
    Adjustment {
        product: ProductKey,
        containers: u64,
        servings: f64,
        reason: String,
    },
}

impl MutationPayload {
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::Sale { .. } => MutationKind::Sale,
            Self::RoomStatusChange { .. } => MutationKind::RoomStatusChange,
            Self::Purchase { .. } => MutationKind::Purchase,
            Self::Wastage { .. } => MutationKind::Wastage,
            Self::Adjustment { .. } => MutationKind::Adjustment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineMutation {
    pub id: String,
    #[serde(flatten)]
    pub payload: MutationPayload,
    /// Client wall clock, epoch ms.
    pub created_at: i64,
    /// Who made the change; replayed activity is attributed to them.
    pub actor: Actor,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfflineQueue {
    entries: Vec<OfflineMutation>,
}

impl OfflineQueue {
    /// Load the persisted queue. A missing key is an empty queue; a corrupt
    /// one is an error so queued work is never silently dropped.
    pub fn load(store: &dyn KvStore) -> LedgerResult<Self> {
        Ok(read_json(store, KEY_OFFLINE_QUEUE)?.unwrap_or_default())
    }

    pub fn save(&self, store: &dyn KvStore) -> LedgerResult<()> {
        if self.entries.is_empty() {
            return store.remove(KEY_OFFLINE_QUEUE);
        }
        write_json(store, KEY_OFFLINE_QUEUE, self)
    }

    pub fn enqueue(&mut self, payload: MutationPayload, actor: Actor, created_at: i64) -> String {
        let id = Uuid::new_v4().to_string();
        debug!(id = %id, kind = %payload.kind(), created_at, "Queued offline mutation");
        self.entries.push(OfflineMutation {
            id: id.clone(),
            payload,
            created_at,
            actor,
            attempts: 0,
            last_error: None,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replay order: ascending creation time, ties broken by id.
    pub fn sorted(&self) -> Vec<OfflineMutation> {
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        entries
    }

    pub fn get(&self, id: &str) -> Option<&OfflineMutation> {
        self.entries.iter().find(|m| m.id == id)
    }

    pub fn mark_failed(&mut self, id: &str, error: &str) {
        match self.entries.iter_mut().find(|m| m.id == id) {
            Some(entry) => {
                entry.attempts += 1;
                entry.last_error = Some(error.to_string());
            }
            None => warn!(id, "mark_failed on unknown queued mutation"),
        }
    }

    /// Remove the given ids, keeping anything queued since. Returns how many
    /// were removed.
    pub fn remove_ids(&mut self, ids: &[String]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|m| !ids.contains(&m.id));
        before - self.entries.len()
    }
}
