//! Debounced durable flush of client state.
//!
//! Mutations only mark a slice dirty. A background task waits until no new
//! mutation has arrived for the debounce interval, then writes every dirty
//! slice once. A failed write keeps the slice dirty and raises the
//! `sync_incomplete` flag; in-memory state stays authoritative.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::accounting::AccountingSlice;
use crate::broadcast::{SliceKind, SlicePayload};
use crate::error::LedgerResult;
use crate::ledger::InventorySlice;
use crate::rooms::RoomsSlice;
use crate::store::{read_json, write_json, KvStore, KEY_ACCOUNTING, KEY_INVENTORY, KEY_ROOMS};

pub fn slice_key(kind: SliceKind) -> &'static str {
    match kind {
        SliceKind::Inventory => KEY_INVENTORY,
        SliceKind::Accounting => KEY_ACCOUNTING,
        SliceKind::Rooms => KEY_ROOMS,
    }
}

pub fn write_slice(store: &dyn KvStore, slice: &SlicePayload) -> LedgerResult<()> {
    let key = slice_key(slice.kind());
    match slice {
        SlicePayload::Inventory(s) => write_json(store, key, s),
        SlicePayload::Accounting(s) => write_json(store, key, s),
        SlicePayload::Rooms(s) => write_json(store, key, s),
    }
}

/// Persisted slices, each defaulting to empty when never written.
pub fn load_slices(store: &dyn KvStore) -> LedgerResult<(InventorySlice, AccountingSlice, RoomsSlice)> {
    let inventory = read_json(store, KEY_INVENTORY)?.unwrap_or_default();
    let accounting = read_json(store, KEY_ACCOUNTING)?.unwrap_or_default();
    let rooms = read_json(store, KEY_ROOMS)?.unwrap_or_default();
    Ok((inventory, accounting, rooms))
}

#[derive(Debug, Default)]
pub struct DirtyTracker {
    dirty: Mutex<BTreeSet<SliceKind>>,
    notify: Notify,
    sync_incomplete: AtomicBool,
    stopped: AtomicBool,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, kind: SliceKind) {
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.insert(kind);
        }
        self.notify.notify_one();
    }

    pub fn take(&self) -> Vec<SliceKind> {
        match self.dirty.lock() {
            Ok(mut dirty) => std::mem::take(&mut *dirty).into_iter().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.lock().map(|d| !d.is_empty()).unwrap_or(false)
    }

    /// Put back kinds whose write failed so the next flush retries them.
    fn restore(&self, kinds: &[SliceKind]) {
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.extend(kinds.iter().copied());
        }
    }

    pub fn sync_incomplete(&self) -> bool {
        self.sync_incomplete.load(Ordering::SeqCst)
    }

    pub fn set_sync_incomplete(&self, value: bool) {
        self.sync_incomplete.store(value, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Write every dirty slice now with `flush`, updating the warning flag.
    /// Returns the kinds written.
    pub fn flush_with<F>(&self, flush: F) -> LedgerResult<Vec<SliceKind>>
    where
        F: FnOnce(&[SliceKind]) -> LedgerResult<()>,
    {
        let kinds = self.take();
        if kinds.is_empty() {
            return Ok(kinds);
        }
        match flush(&kinds) {
            Ok(()) => {
                self.set_sync_incomplete(false);
                debug!(slices = kinds.len(), "State flushed");
                Ok(kinds)
            }
            Err(e) => {
                warn!("State flush failed, keeping in-memory state: {e}");
                self.restore(&kinds);
                self.set_sync_incomplete(true);
                Err(e)
            }
        }
    }
}

/// Debounce loop. Runs until [`DirtyTracker::stop`], flushing once more on
/// the way out.
pub async fn run_debounced<F, Fut>(tracker: Arc<DirtyTracker>, debounce: Duration, flush: F)
where
    F: Fn(Vec<SliceKind>) -> Fut,
    Fut: Future<Output = LedgerResult<()>>,
{
    info!("Persistence loop started (debounce: {}ms)", debounce.as_millis());
    loop {
        tracker.notify.notified().await;
        if tracker.is_stopped() {
            break;
        }

        // Every new notification restarts the quiet interval.
        loop {
            tokio::select! {
                _ = tracker.notify.notified() => {
                    if tracker.is_stopped() {
                        break;
                    }
                }
                _ = tokio::time::sleep(debounce) => break,
            }
        }

        flush_pending(&tracker, &flush).await;
        if tracker.is_stopped() {
            break;
        }
    }
    flush_pending(&tracker, &flush).await;
    info!("Persistence loop stopped");
}

async fn flush_pending<F, Fut>(tracker: &DirtyTracker, flush: &F)
where
    F: Fn(Vec<SliceKind>) -> Fut,
    Fut: Future<Output = LedgerResult<()>>,
{
    let kinds = tracker.take();
    if kinds.is_empty() {
        return;
    }
    match flush(kinds.clone()).await {
        Ok(()) => {
            tracker.set_sync_incomplete(false);
            debug!(slices = kinds.len(), "Debounced flush complete");
        }
        Err(e) => {
            warn!("Debounced flush failed, keeping in-memory state: {e}");
            tracker.restore(&kinds);
            tracker.set_sync_incomplete(true);
        }
    }
}
