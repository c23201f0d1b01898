//! Append-only activity log with a fixed cap, newest first.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::Actor;
use crate::ledger::ProductKey;

pub const DEFAULT_ACTIVITY_CAP: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Sale,
    Purchase,
    Wastage,
    /// Open container written off by a wastage entry.
    ContainerWriteOff,
    Adjustment,
    RoomStatus,
    Onboard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub id: String,
    pub actor_id: String,
    pub actor_name: String,
    pub device: String,
    pub kind: ActivityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<ProductKey>,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: i64,
}

impl ActivityRecord {
    pub fn new(actor: &Actor, kind: ActivityKind, detail: impl Into<String>, at: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            actor_id: actor.id.clone(),
            actor_name: actor.name.clone(),
            device: actor.device.clone(),
            kind,
            product: None,
            detail: detail.into(),
            reason: None,
            at,
        }
    }

    pub fn for_product(mut self, product: &ProductKey) -> Self {
        self.product = Some(product.clone());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLog {
    cap: usize,
    records: VecDeque<ActivityRecord>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_cap(DEFAULT_ACTIVITY_CAP)
    }
}

impl ActivityLog {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            records: VecDeque::new(),
        }
    }

    pub fn push(&mut self, record: ActivityRecord) {
        self.records.push_front(record);
        self.records.truncate(self.cap);
    }

    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap.max(1);
        self.records.truncate(self.cap);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<ActivityRecord> {
        self.records.iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor() -> Actor {
        Actor {
            id: "staff-1".into(),
            name: "Asha".into(),
            device: "bar-tablet".into(),
        }
    }

    #[test]
    fn test_log_is_capped_and_newest_first() {
        let mut log = ActivityLog::with_cap(3);
        for i in 0..5 {
            log.push(ActivityRecord::new(&actor(), ActivityKind::Sale, format!("sale {i}"), i));
        }
        assert_eq!(log.len(), 3);
        let recent = log.recent(10);
        assert_eq!(recent[0].detail, "sale 4");
        assert_eq!(recent[2].detail, "sale 2");
    }

    #[test]
    fn test_shrinking_cap_truncates_oldest() {
        let mut log = ActivityLog::default();
        for i in 0..10 {
            log.push(ActivityRecord::new(&actor(), ActivityKind::Purchase, "p", i));
        }
        log.set_cap(4);
        assert_eq!(log.len(), 4);
        assert_eq!(log.recent(1)[0].at, 9);
    }

    #[test]
    fn test_record_carries_attribution() {
        let record = ActivityRecord::new(&actor(), ActivityKind::Adjustment, "count", 42)
            .with_reason("monthly stocktake");
        assert_eq!(record.actor_name, "Asha");
        assert_eq!(record.device, "bar-tablet");
        assert_eq!(record.reason.as_deref(), Some("monthly stocktake"));
    }
}
