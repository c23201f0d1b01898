//! Cross-client broadcast of full state slices.
//!
//! Every committed mutation publishes the whole affected slice. Receivers
//! drop events carrying their own origin and otherwise replace the slice
//! wholesale: the latest full snapshot wins, there is no merge.
//!
//! Frames are text: JSON, zstd-compressed, base64-encoded.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::accounting::AccountingSlice;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::InventorySlice;
use crate::rooms::RoomsSlice;

const ZSTD_LEVEL: i32 = 3;
const DEFAULT_BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceKind {
    Inventory,
    Accounting,
    Rooms,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum SlicePayload {
    Inventory(InventorySlice),
    Accounting(AccountingSlice),
    Rooms(RoomsSlice),
}

impl SliceKind {
    pub const ALL: [SliceKind; 3] = [SliceKind::Inventory, SliceKind::Accounting, SliceKind::Rooms];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inventory => "inventory",
            Self::Accounting => "accounting",
            Self::Rooms => "rooms",
        }
    }
}

impl SlicePayload {
    pub fn kind(&self) -> SliceKind {
        match self {
            Self::Inventory(_) => SliceKind::Inventory,
            Self::Accounting(_) => SliceKind::Accounting,
            Self::Rooms(_) => SliceKind::Rooms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub origin: String,
    pub timestamp: i64,
    pub slice: SlicePayload,
}

impl SyncEvent {
    pub fn kind(&self) -> SliceKind {
        self.slice.kind()
    }
}

pub fn encode_event(event: &SyncEvent) -> LedgerResult<String> {
    let json = serde_json::to_vec(event)?;
    let compressed = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)
        .map_err(|e| LedgerError::Codec(format!("zstd encode: {e}")))?;
    Ok(BASE64_STANDARD.encode(compressed))
}

pub fn decode_event(frame: &str) -> LedgerResult<SyncEvent> {
    let compressed = BASE64_STANDARD
        .decode(frame.trim())
        .map_err(|e| LedgerError::Codec(format!("base64 decode: {e}")))?;
    let json = zstd::decode_all(compressed.as_slice())
        .map_err(|e| LedgerError::Codec(format!("zstd decode: {e}")))?;
    Ok(serde_json::from_slice(&json)?)
}

pub trait Broadcaster: Send + Sync {
    fn publish(&self, event: &SyncEvent) -> LedgerResult<()>;
}

/// In-process bus shared by every client of one profile. Each client
/// subscribes its own receiver.
#[derive(Debug, Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<String>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Broadcaster for LocalBus {
    fn publish(&self, event: &SyncEvent) -> LedgerResult<()> {
        let frame = encode_event(event)?;
        match self.tx.send(frame) {
            Ok(receivers) => {
                debug!(kind = ?event.kind(), receivers, "Broadcast published");
            }
            // No other client is listening; nothing to deliver.
            Err(_) => debug!(kind = ?event.kind(), "Broadcast published with no receivers"),
        }
        Ok(())
    }
}

/// Receive the next frame addressed to `own_origin`'s peers, skipping
/// undecodable frames and our own echoes. Returns `None` once the bus closes.
pub async fn next_remote_event(
    rx: &mut broadcast::Receiver<String>,
    own_origin: &str,
) -> Option<SyncEvent> {
    loop {
        let frame = match rx.recv().await {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Broadcast receiver lagged; newer snapshots follow");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        };
        match decode_event(&frame) {
            Ok(event) if event.origin == own_origin => continue,
            Ok(event) => return Some(event),
            Err(e) => {
                warn!("Dropping undecodable broadcast frame: {e}");
                continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::{update_room_status, RoomStatus};

    fn rooms_event(origin: &str, ts: i64) -> SyncEvent {
        let rooms =
            update_room_status(&RoomsSlice::default(), "12", RoomStatus::Cleaning, None, ts).unwrap();
        SyncEvent {
            origin: origin.into(),
            timestamp: ts,
            slice: SlicePayload::Rooms(rooms),
        }
    }

    #[test]
    fn test_frame_is_compact_text() {
        let event = rooms_event("client-a", 5);
        let frame = encode_event(&event).unwrap();
        assert!(frame.is_ascii());
        assert_eq!(decode_event(&frame).unwrap(), event);
    }

    #[test]
    fn test_garbage_frame_is_codec_error() {
        assert!(matches!(decode_event("not base64!"), Err(LedgerError::Codec(_))));
        let not_zstd = BASE64_STANDARD.encode(b"plain json");
        assert!(matches!(decode_event(&not_zstd), Err(LedgerError::Codec(_))));
    }

    #[test]
    fn test_publish_without_receivers_is_ok() {
        let bus = LocalBus::new(4);
        assert!(bus.publish(&rooms_event("a", 1)).is_ok());
    }

    #[tokio::test]
    async fn test_receiver_skips_own_origin() {
        let bus = LocalBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(&rooms_event("me", 1)).unwrap();
        bus.publish(&rooms_event("peer", 2)).unwrap();

        let event = next_remote_event(&mut rx, "me").await.unwrap();
        assert_eq!(event.origin, "peer");
        assert_eq!(event.kind(), SliceKind::Rooms);
    }

    #[tokio::test]
    async fn test_closed_bus_ends_stream() {
        let bus = LocalBus::new(2);
        let mut rx = bus.subscribe();
        drop(bus);
        assert!(next_remote_event(&mut rx, "me").await.is_none());
    }
}
