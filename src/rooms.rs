//! Room status records with timestamp-guarded last-write-wins.
//!
//! Two clients may change the same room while one of them is offline. The
//! write carrying the older client timestamp loses, regardless of the order
//! in which the writes arrive. Equal timestamps are accepted so a client can
//! re-apply its own write during replay.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    Vacant,
    Occupied,
    Cleaning,
    Maintenance,
}

impl RoomStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "vacant" | "free" | "available" => Some(Self::Vacant),
            "occupied" | "checked_in" | "checked-in" => Some(Self::Occupied),
            "cleaning" | "housekeeping" => Some(Self::Cleaning),
            "maintenance" | "out_of_order" | "ooo" => Some(Self::Maintenance),
            _ => None,
        }
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Vacant => "vacant",
            Self::Occupied => "occupied",
            Self::Cleaning => "cleaning",
            Self::Maintenance => "maintenance",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRecord {
    pub id: String,
    pub status: RoomStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupant: Option<String>,
    pub last_updated: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomsSlice {
    pub rooms: BTreeMap<String, RoomRecord>,
}

impl RoomsSlice {
    pub fn get(&self, id: &str) -> Option<&RoomRecord> {
        self.rooms.get(id.trim())
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

/// Apply a status write. Returns the new slice, or `StaleWrite` when the
/// stored record is strictly newer than `timestamp`. Unknown rooms are
/// created on first write.
pub fn update_room_status(
    slice: &RoomsSlice,
    room_id: &str,
    status: RoomStatus,
    occupant: Option<&str>,
    timestamp: i64,
) -> LedgerResult<RoomsSlice> {
    let room_id = room_id.trim();
    if room_id.is_empty() {
        return Err(LedgerError::validation("room id is empty"));
    }

    if let Some(existing) = slice.rooms.get(room_id) {
        if existing.last_updated > timestamp {
            debug!(
                room_id,
                incoming = timestamp,
                last_updated = existing.last_updated,
                "Dropping stale room write"
            );
            return Err(LedgerError::StaleWrite {
                room_id: room_id.to_string(),
                incoming: timestamp,
                last_updated: existing.last_updated,
            });
        }
    }

    let occupant = occupant
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string);

    let mut next = slice.clone();
    next.rooms.insert(
        room_id.to_string(),
        RoomRecord {
            id: room_id.to_string(),
            status,
            occupant,
            last_updated: timestamp,
        },
    );
    info!(room_id, status = %status, at = timestamp, "Room status updated");
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vacant_since_100() -> RoomsSlice {
        update_room_status(&RoomsSlice::default(), "101", RoomStatus::Vacant, None, 100).unwrap()
    }

    #[test]
    fn test_room_created_on_first_write() {
        let slice = vacant_since_100();
        let room = slice.get("101").unwrap();
        assert_eq!(room.status, RoomStatus::Vacant);
        assert_eq!(room.last_updated, 100);
        assert_eq!(slice.len(), 1);
    }

    #[test]
    fn test_older_write_is_rejected_and_record_unchanged() {
        let slice = vacant_since_100();
        let result = update_room_status(&slice, "101", RoomStatus::Occupied, Some("Mehta"), 50);
        match result {
            Err(LedgerError::StaleWrite {
                incoming,
                last_updated,
                ..
            }) => {
                assert_eq!(incoming, 50);
                assert_eq!(last_updated, 100);
            }
            other => panic!("expected StaleWrite, got {other:?}"),
        }
        let room = slice.get("101").unwrap();
        assert_eq!(room.status, RoomStatus::Vacant);
        assert_eq!(room.last_updated, 100);
    }

    #[test]
    fn test_newer_and_equal_writes_win() {
        let slice = vacant_since_100();
        let same = update_room_status(&slice, "101", RoomStatus::Cleaning, None, 100).unwrap();
        assert_eq!(same.get("101").unwrap().status, RoomStatus::Cleaning);

        let newer =
            update_room_status(&same, "101", RoomStatus::Occupied, Some(" Mehta "), 150).unwrap();
        let room = newer.get("101").unwrap();
        assert_eq!(room.status, RoomStatus::Occupied);
        assert_eq!(room.occupant.as_deref(), Some("Mehta"));
        assert_eq!(room.last_updated, 150);
    }

    #[test]
    fn test_arrival_order_does_not_matter() {
        let empty = RoomsSlice::default();
        let a = update_room_status(&empty, "7", RoomStatus::Occupied, None, 200).unwrap();
        let a = update_room_status(&a, "7", RoomStatus::Cleaning, None, 150).unwrap_or(a);

        let b = update_room_status(&empty, "7", RoomStatus::Cleaning, None, 150).unwrap();
        let b = update_room_status(&b, "7", RoomStatus::Occupied, None, 200).unwrap_or(b);

        assert_eq!(a, b);
    }

    #[test]
    fn test_blank_room_id_is_rejected() {
        assert!(matches!(
            update_room_status(&RoomsSlice::default(), "  ", RoomStatus::Vacant, None, 1),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(RoomStatus::parse("Occupied"), Some(RoomStatus::Occupied));
        assert_eq!(RoomStatus::parse(" housekeeping "), Some(RoomStatus::Cleaning));
        assert_eq!(RoomStatus::parse("on fire"), None);
    }
}
