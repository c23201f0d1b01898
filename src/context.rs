//! Per-client context: the single owner of one client's state.
//!
//! Every mutation goes through here. Online, a mutation is applied as a pure
//! fold under the state lock, logged to the activity log, marked dirty for
//! the debounced flush and broadcast as a full slice. Offline, the call is
//! appended to the durable queue instead and applied later by `replay`
//! through the same `commit_*` functions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::accounting::AccountingSlice;
use crate::activity::{ActivityKind, ActivityRecord};
use crate::broadcast::{next_remote_event, Broadcaster, SliceKind, SlicePayload, SyncEvent};
use crate::clock::Clock;
use crate::dispenser::{sell_servings, SaleOutcome};
use crate::error::{LedgerError, LedgerResult};
use crate::identity::{Actor, IdentityProvider};
use crate::ledger::{InventorySlice, LedgerEntry, ProductKey, WastageOutcome};
use crate::offline_queue::{MutationPayload, OfflineMutation, OfflineQueue};
use crate::persistence::{load_slices, run_debounced, write_slice, DirtyTracker};
use crate::reconciliation::{analyze, analyze_in_background, ReconciliationReport};
use crate::replay::{replay_queue, ReplayReport};
use crate::rooms::{update_room_status, RoomRecord, RoomStatus, RoomsSlice};
use crate::settings::EngineSettings;
use crate::stock::QuantitySnapshot;
use crate::store::KvStore;

/// Result of a mutating call: applied now, or parked in the offline queue.
#[derive(Debug, Clone)]
pub enum MutationOutcome<T> {
    Committed(T),
    Queued { mutation_id: String },
}

impl<T> MutationOutcome<T> {
    pub fn committed(self) -> Option<T> {
        match self {
            Self::Committed(value) => Some(value),
            Self::Queued { .. } => None,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerCounters {
    pub product: ProductKey,
    pub opening: QuantitySnapshot,
    pub purchases: QuantitySnapshot,
    pub sales_servings: u64,
    pub wastage_ml: u64,
    pub adjustment_ml: i64,
    pub current: QuantitySnapshot,
    pub open_remainder_ml: u64,
}

#[derive(Debug, Default)]
pub struct ClientState {
    pub inventory: InventorySlice,
    pub accounting: AccountingSlice,
    pub rooms: RoomsSlice,
    pub queue: OfflineQueue,
}

pub struct ClientContext {
    state: Mutex<ClientState>,
    store: Arc<dyn KvStore>,
    broadcaster: Arc<dyn Broadcaster>,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    online: AtomicBool,
    dirty: Arc<DirtyTracker>,
    replay_lock: tokio::sync::Mutex<()>,
}

impl ClientContext {
    /// Build a context from whatever the store already holds: settings,
    /// persisted slices and the offline queue.
    pub fn open(
        store: Arc<dyn KvStore>,
        broadcaster: Arc<dyn Broadcaster>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> LedgerResult<Self> {
        let settings = EngineSettings::load(store.as_ref())?;
        let (mut inventory, mut accounting, rooms) = load_slices(store.as_ref())?;
        inventory.activity.set_cap(settings.activity_cap);
        accounting.set_cap(settings.activity_cap);
        let queue = OfflineQueue::load(store.as_ref())?;

        info!(
            client_id = %settings.client_id,
            products = inventory.entries.len(),
            rooms = rooms.len(),
            pending = queue.len(),
            "Client context opened"
        );

        Ok(Self {
            state: Mutex::new(ClientState {
                inventory,
                accounting,
                rooms,
                queue,
            }),
            online: AtomicBool::new(settings.start_online),
            store,
            broadcaster,
            identity,
            clock,
            settings,
            dirty: Arc::new(DirtyTracker::new()),
            replay_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn client_id(&self) -> &str {
        &self.settings.client_id
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, ClientState>> {
        self.state
            .lock()
            .map_err(|e| LedgerError::Task(format!("client state lock poisoned: {e}")))
    }

    // -----------------------------------------------------------------------
    // Connectivity
    // -----------------------------------------------------------------------

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn go_offline(&self) {
        if self.online.swap(false, Ordering::SeqCst) {
            warn!(client_id = %self.settings.client_id, "Client offline; mutations will be queued");
        }
    }

    /// Come back online and drain the offline queue.
    pub async fn reconnect(&self) -> LedgerResult<ReplayReport> {
        if !self.online.swap(true, Ordering::SeqCst) {
            info!(
                pending = self.pending_sync_count(),
                "Client back online, replaying queued mutations"
            );
        }
        replay_queue(self).await
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn onboard_product(
        &self,
        key: ProductKey,
        cases: u64,
        containers: u64,
        cost_per_case: Option<f64>,
    ) -> LedgerResult<LedgerEntry> {
        if key.name.is_empty() {
            return Err(LedgerError::validation("product name is empty"));
        }
        let actor = self.identity.current();
        let at = self.now_ms();
        let mut state = self.lock()?;
        if state.inventory.contains(&key) {
            return Err(LedgerError::validation(format!("{key} is already onboarded")));
        }
        let entry =
            LedgerEntry::with_opening_units(key.clone(), cases, containers, cost_per_case, at)?;
        state.inventory.put(entry.clone());
        state.inventory.activity.push(
            ActivityRecord::new(
                &actor,
                ActivityKind::Onboard,
                format!("opening {cases} case(s) + {containers} container(s)"),
                at,
            )
            .for_product(&key),
        );
        let slices = vec![SlicePayload::Inventory(state.inventory.clone())];
        drop(state);

        info!(product = %key, total_ml = entry.current.total_ml(), "Product onboarded");
        self.after_commit(slices);
        Ok(entry)
    }

    pub fn record_sale(
        &self,
        key: &ProductKey,
        servings: u32,
    ) -> LedgerResult<MutationOutcome<SaleOutcome>> {
        if servings == 0 {
            return Err(LedgerError::validation("a sale must be at least one serving"));
        }
        let payload = MutationPayload::Sale {
            product: key.clone(),
            servings,
        };
        if let Some(queued) = self.queue_if_offline(&payload, None)? {
            return Ok(queued);
        }
        let actor = self.identity.current();
        self.commit_sale(&actor, self.now_ms(), None, key, servings)
            .map(MutationOutcome::Committed)
    }

    pub fn record_purchase(
        &self,
        key: &ProductKey,
        cases: u64,
        containers: u64,
    ) -> LedgerResult<MutationOutcome<LedgerEntry>> {
        let payload = MutationPayload::Purchase {
            product: key.clone(),
            cases,
            containers,
        };
        if let Some(queued) = self.queue_if_offline(&payload, None)? {
            return Ok(queued);
        }
        let actor = self.identity.current();
        self.commit_purchase(&actor, self.now_ms(), None, key, cases, containers)
            .map(MutationOutcome::Committed)
    }

    pub fn record_wastage(
        &self,
        key: &ProductKey,
        ml: u64,
        reason: &str,
    ) -> LedgerResult<MutationOutcome<WastageOutcome>> {
        let payload = MutationPayload::Wastage {
            product: key.clone(),
            ml,
            reason: reason.trim().to_string(),
        };
        if let Some(queued) = self.queue_if_offline(&payload, None)? {
            return Ok(queued);
        }
        let actor = self.identity.current();
        self.commit_wastage(&actor, self.now_ms(), None, key, ml, reason)
            .map(MutationOutcome::Committed)
    }

    pub fn adjust_to_physical_count(
        &self,
        key: &ProductKey,
        containers: u64,
        servings: f64,
        reason: &str,
    ) -> LedgerResult<MutationOutcome<LedgerEntry>> {
        // Reject a missing reason up front so it never sits in the queue.
        if reason.trim().is_empty() {
            return Err(LedgerError::validation(
                "a reason is required for manual stock adjustments",
            ));
        }
        let payload = MutationPayload::Adjustment {
            product: key.clone(),
            containers,
            servings,
            reason: reason.trim().to_string(),
        };
        if let Some(queued) = self.queue_if_offline(&payload, None)? {
            return Ok(queued);
        }
        let actor = self.identity.current();
        self.commit_adjustment(&actor, self.now_ms(), None, key, containers, servings, reason)
            .map(MutationOutcome::Committed)
    }

    /// Timestamp-guarded room write. `timestamp` is the client wall clock at
    /// the moment of the change; an older write than the stored one fails
    /// with `StaleWrite` and changes nothing.
    pub fn update_room_status(
        &self,
        room_id: &str,
        status: RoomStatus,
        occupant: Option<&str>,
        timestamp: i64,
    ) -> LedgerResult<MutationOutcome<RoomRecord>> {
        let payload = MutationPayload::RoomStatusChange {
            room_id: room_id.trim().to_string(),
            status,
            occupant: occupant.map(str::to_string),
        };
        if let Some(queued) = self.queue_if_offline(&payload, Some(timestamp))? {
            return Ok(queued);
        }
        let actor = self.identity.current();
        self.commit_room_status(&actor, timestamp, None, room_id, status, occupant)
            .map(MutationOutcome::Committed)
    }

    fn queue_if_offline<T>(
        &self,
        payload: &MutationPayload,
        created_at: Option<i64>,
    ) -> LedgerResult<Option<MutationOutcome<T>>> {
        if self.is_online() {
            return Ok(None);
        }
        let actor = self.identity.current();
        let created_at = created_at.unwrap_or_else(|| self.now_ms());
        let mut state = self.lock()?;
        let mutation_id = state.queue.enqueue(payload.clone(), actor, created_at);
        if let Err(e) = state.queue.save(self.store.as_ref()) {
            warn!("Offline queue not persisted, keeping it in memory: {e}");
            self.dirty.set_sync_incomplete(true);
        }
        info!(
            mutation_id = %mutation_id,
            kind = %payload.kind(),
            pending = state.queue.len(),
            "Mutation queued while offline"
        );
        Ok(Some(MutationOutcome::Queued { mutation_id }))
    }

    // -----------------------------------------------------------------------
    // Commit paths shared by live traffic and replay
    // -----------------------------------------------------------------------

    fn note_replayed(state: &mut ClientState, replay_id: Option<&str>) {
        if let Some(id) = replay_id {
            state.inventory.replayed_ids.insert(id.to_string());
        }
    }

    pub(crate) fn commit_sale(
        &self,
        actor: &Actor,
        at: i64,
        replay_id: Option<&str>,
        key: &ProductKey,
        servings: u32,
    ) -> LedgerResult<SaleOutcome> {
        let mut state = self.lock()?;
        let outcome = sell_servings(state.inventory.require(key)?, servings, at);
        if outcome.fulfilled == 0 {
            return Err(LedgerError::OutOfStock {
                product: key.clone(),
                requested: servings,
                fulfilled: 0,
            });
        }

        state.inventory.put(outcome.entry.clone());
        state.inventory.activity.push(
            ActivityRecord::new(
                actor,
                ActivityKind::Sale,
                format!("sold {} of {} serving(s)", outcome.fulfilled, servings),
                at,
            )
            .for_product(key),
        );
        state.accounting.record(&outcome, actor, at);
        Self::note_replayed(&mut state, replay_id);
        let slices = vec![
            SlicePayload::Inventory(state.inventory.clone()),
            SlicePayload::Accounting(state.accounting.clone()),
        ];
        drop(state);

        if outcome.is_partial() {
            warn!(
                product = %key,
                requested = servings,
                fulfilled = outcome.fulfilled,
                "Partial sale, product ran out"
            );
        } else {
            info!(product = %key, servings, "Sale recorded");
        }
        self.after_commit(slices);
        Ok(outcome)
    }

    pub(crate) fn commit_purchase(
        &self,
        actor: &Actor,
        at: i64,
        replay_id: Option<&str>,
        key: &ProductKey,
        cases: u64,
        containers: u64,
    ) -> LedgerResult<LedgerEntry> {
        let mut state = self.lock()?;
        let entry = state
            .inventory
            .require(key)?
            .record_purchase(cases, containers, at)?;

        state.inventory.put(entry.clone());
        state.inventory.activity.push(
            ActivityRecord::new(
                actor,
                ActivityKind::Purchase,
                format!("received {cases} case(s) + {containers} container(s)"),
                at,
            )
            .for_product(key),
        );
        Self::note_replayed(&mut state, replay_id);
        let slices = vec![SlicePayload::Inventory(state.inventory.clone())];
        drop(state);

        info!(product = %key, cases, containers, "Purchase recorded");
        self.after_commit(slices);
        Ok(entry)
    }

    pub(crate) fn commit_wastage(
        &self,
        actor: &Actor,
        at: i64,
        replay_id: Option<&str>,
        key: &ProductKey,
        ml: u64,
        reason: &str,
    ) -> LedgerResult<WastageOutcome> {
        let mut state = self.lock()?;
        let outcome = state.inventory.require(key)?.record_wastage(ml, at)?;
        let reason = reason.trim();

        state.inventory.put(outcome.entry.clone());
        let mut record =
            ActivityRecord::new(actor, ActivityKind::Wastage, format!("wasted {ml} ml"), at)
                .for_product(key);
        if !reason.is_empty() {
            record = record.with_reason(reason);
        }
        state.inventory.activity.push(record);
        if outcome.open_container_written_off {
            state.inventory.activity.push(
                ActivityRecord::new(
                    actor,
                    ActivityKind::ContainerWriteOff,
                    format!("open container written off ({ml} ml)"),
                    at,
                )
                .for_product(key),
            );
        }
        Self::note_replayed(&mut state, replay_id);
        let slices = vec![SlicePayload::Inventory(state.inventory.clone())];
        drop(state);

        if outcome.open_container_written_off {
            warn!(product = %key, ml, reason, "Open container written off");
        } else {
            info!(product = %key, ml, reason, "Wastage recorded");
        }
        self.after_commit(slices);
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn commit_adjustment(
        &self,
        actor: &Actor,
        at: i64,
        replay_id: Option<&str>,
        key: &ProductKey,
        containers: u64,
        servings: f64,
        reason: &str,
    ) -> LedgerResult<LedgerEntry> {
        let mut state = self.lock()?;
        let before = state.inventory.require(key)?;
        let before_ml = before.current.total_ml();
        let entry = before.adjust_to_physical_count(containers, servings, reason, at)?;
        let delta = entry.current.total_ml() as i64 - before_ml as i64;

        state.inventory.put(entry.clone());
        state.inventory.activity.push(
            ActivityRecord::new(
                actor,
                ActivityKind::Adjustment,
                format!("counted {containers} container(s) + {servings} serving(s), {delta:+} ml"),
                at,
            )
            .for_product(key)
            .with_reason(reason.trim()),
        );
        Self::note_replayed(&mut state, replay_id);
        let slices = vec![SlicePayload::Inventory(state.inventory.clone())];
        drop(state);

        info!(product = %key, delta_ml = delta, reason = reason.trim(), "Stock adjusted to physical count");
        self.after_commit(slices);
        Ok(entry)
    }

    pub(crate) fn commit_room_status(
        &self,
        actor: &Actor,
        timestamp: i64,
        replay_id: Option<&str>,
        room_id: &str,
        status: RoomStatus,
        occupant: Option<&str>,
    ) -> LedgerResult<RoomRecord> {
        let mut state = self.lock()?;
        let rooms = update_room_status(&state.rooms, room_id, status, occupant, timestamp)?;
        let record = rooms
            .get(room_id)
            .cloned()
            .ok_or_else(|| LedgerError::validation(format!("room {room_id} missing after write")))?;

        state.rooms = rooms;
        state.inventory.activity.push(ActivityRecord::new(
            actor,
            ActivityKind::RoomStatus,
            format!("room {} -> {}", record.id, record.status),
            timestamp,
        ));
        Self::note_replayed(&mut state, replay_id);
        let slices = vec![
            SlicePayload::Rooms(state.rooms.clone()),
            SlicePayload::Inventory(state.inventory.clone()),
        ];
        drop(state);

        self.after_commit(slices);
        Ok(record)
    }

    /// Mark slices dirty for the debounced flush and, when online, publish
    /// each one to the other clients. A failed publish does not undo the
    /// local commit.
    fn after_commit(&self, slices: Vec<SlicePayload>) {
        let online = self.is_online();
        for slice in slices {
            self.dirty.mark(slice.kind());
            if !online {
                continue;
            }
            let event = SyncEvent {
                origin: self.settings.client_id.clone(),
                timestamp: self.now_ms(),
                slice,
            };
            if let Err(e) = self.broadcaster.publish(&event) {
                warn!(kind = ?event.kind(), "Broadcast failed: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Replay support
    // -----------------------------------------------------------------------

    pub(crate) fn replay_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.replay_lock
    }

    pub(crate) fn was_replayed(&self, mutation_id: &str) -> LedgerResult<bool> {
        Ok(self.lock()?.inventory.replayed_ids.contains(mutation_id))
    }

    /// Apply one queued mutation through the live commit path, attributed to
    /// the actor and time it was made.
    pub(crate) fn apply_queued(&self, mutation: &OfflineMutation) -> LedgerResult<()> {
        let actor = &mutation.actor;
        let at = mutation.created_at;
        let id = Some(mutation.id.as_str());
        match &mutation.payload {
            MutationPayload::Sale { product, servings } => {
                self.commit_sale(actor, at, id, product, *servings).map(|_| ())
            }
            MutationPayload::RoomStatusChange {
                room_id,
                status,
                occupant,
            } => self
                .commit_room_status(actor, at, id, room_id, *status, occupant.as_deref())
                .map(|_| ()),
            MutationPayload::Purchase {
                product,
                cases,
                containers,
            } => self
                .commit_purchase(actor, at, id, product, *cases, *containers)
                .map(|_| ()),
            MutationPayload::Wastage { product, ml, reason } => self
                .commit_wastage(actor, at, id, product, *ml, reason)
                .map(|_| ()),
            MutationPayload::Adjustment {
                product,
                containers,
                servings,
                reason,
            } => self
                .commit_adjustment(actor, at, id, product, *containers, *servings, reason)
                .map(|_| ()),
        }
    }

    /// Record a queued mutation as handled without any state change (a stale
    /// room write or a sale with nothing left to pour).
    pub(crate) fn mark_replayed(&self, mutation_id: &str) -> LedgerResult<()> {
        self.lock()?
            .inventory
            .replayed_ids
            .insert(mutation_id.to_string());
        self.dirty.mark(SliceKind::Inventory);
        Ok(())
    }

    pub(crate) fn mark_queue_failed(&self, mutation_id: &str, error: &str) -> LedgerResult<()> {
        let mut state = self.lock()?;
        state.queue.mark_failed(mutation_id, error);
        if let Err(e) = state.queue.save(self.store.as_ref()) {
            warn!("Offline queue not persisted after replay failure: {e}");
            self.dirty.set_sync_incomplete(true);
        }
        Ok(())
    }

    /// Drop the replayed mutations from the queue and prune their ids.
    ///
    /// State is flushed first: the queue only shrinks on disk once the
    /// slices recording the applied ids are durable.
    pub(crate) fn finish_replay(&self, replayed: &[String]) -> LedgerResult<usize> {
        self.flush_now()?;

        let mut state = self.lock()?;
        let removed = state.queue.remove_ids(replayed);
        state.queue.save(self.store.as_ref())?;
        for id in replayed {
            state.inventory.replayed_ids.remove(id);
        }
        drop(state);

        self.dirty.mark(SliceKind::Inventory);
        Ok(removed)
    }

    /// Drop a queued mutation that can never replay. Returns whether it
    /// was queued.
    pub fn discard_queued(&self, mutation_id: &str) -> LedgerResult<bool> {
        let mut state = self.lock()?;
        let removed = state.queue.remove_ids(&[mutation_id.to_string()]) > 0;
        if removed {
            state.queue.save(self.store.as_ref())?;
            warn!(mutation_id, "Queued mutation discarded");
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn stock(&self, key: &ProductKey) -> LedgerResult<LedgerEntry> {
        Ok(self.lock()?.inventory.require(key)?.clone())
    }

    pub fn products(&self) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self.lock()?.inventory.entries.values().cloned().collect())
    }

    pub fn counters(&self, key: &ProductKey) -> LedgerResult<LedgerCounters> {
        let state = self.lock()?;
        let entry = state.inventory.require(key)?;
        Ok(LedgerCounters {
            product: entry.key.clone(),
            opening: entry.opening,
            purchases: entry.purchases,
            sales_servings: entry.sales_servings,
            wastage_ml: entry.wastage_ml,
            adjustment_ml: entry.adjustment_ml,
            current: entry.current,
            open_remainder_ml: entry.open_remainder_ml,
        })
    }

    pub fn discrepancy_report(&self) -> LedgerResult<ReconciliationReport> {
        let state = self.lock()?;
        Ok(analyze(&state.inventory, self.settings.discrepancy_tolerance))
    }

    /// Same report computed on the blocking pool from a snapshot.
    pub async fn discrepancy_report_in_background(&self) -> LedgerResult<ReconciliationReport> {
        let snapshot = self.inventory()?;
        analyze_in_background(snapshot, self.settings.discrepancy_tolerance).await
    }

    /// Newest first.
    pub fn activity(&self, limit: usize) -> LedgerResult<Vec<ActivityRecord>> {
        Ok(self.lock()?.inventory.activity.recent(limit))
    }

    /// Reads through a poisoned lock: the queue itself is still intact.
    pub fn pending_sync_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .queue
            .len()
    }

    /// Queued mutations in replay order.
    pub fn queued_mutations(&self) -> LedgerResult<Vec<OfflineMutation>> {
        Ok(self.lock()?.queue.sorted())
    }

    pub fn rooms(&self) -> LedgerResult<RoomsSlice> {
        Ok(self.lock()?.rooms.clone())
    }

    pub fn room(&self, room_id: &str) -> LedgerResult<Option<RoomRecord>> {
        Ok(self.lock()?.rooms.get(room_id).cloned())
    }

    pub fn accounting(&self) -> LedgerResult<AccountingSlice> {
        Ok(self.lock()?.accounting.clone())
    }

    pub fn inventory(&self) -> LedgerResult<InventorySlice> {
        Ok(self.lock()?.inventory.clone())
    }

    /// Set when state could not be written to durable storage.
    pub fn sync_incomplete(&self) -> bool {
        self.dirty.sync_incomplete()
    }

    // -----------------------------------------------------------------------
    // Cross-client sync
    // -----------------------------------------------------------------------

    /// Replace a slice with a peer's snapshot. Own echoes and events received
    /// while offline are ignored; returns whether the snapshot was applied.
    ///
    /// `replayed_ids` only describe this client's own queue, so the local set
    /// (limited to ids still queued) replaces whatever the peer sent.
    pub fn apply_remote(&self, event: SyncEvent) -> LedgerResult<bool> {
        if event.origin == self.settings.client_id {
            return Ok(false);
        }
        if !self.is_online() {
            debug!(origin = %event.origin, "Ignoring remote snapshot while offline");
            return Ok(false);
        }
        let kind = event.kind();
        let mut state = self.lock()?;
        match event.slice {
            SlicePayload::Inventory(mut inventory) => {
                inventory.activity.set_cap(self.settings.activity_cap);
                inventory.replayed_ids = state
                    .inventory
                    .replayed_ids
                    .iter()
                    .filter(|id| state.queue.get(id).is_some())
                    .cloned()
                    .collect();
                state.inventory = inventory;
            }
            SlicePayload::Accounting(mut accounting) => {
                accounting.set_cap(self.settings.activity_cap);
                state.accounting = accounting;
            }
            SlicePayload::Rooms(rooms) => state.rooms = rooms,
        }
        drop(state);

        self.dirty.mark(kind);
        debug!(origin = %event.origin, kind = ?kind, "Applied remote snapshot");
        Ok(true)
    }

    /// Apply peers' snapshots from `rx` until the bus closes.
    pub fn spawn_listener(self: &Arc<Self>, mut rx: broadcast::Receiver<String>) -> JoinHandle<()> {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            let origin = ctx.client_id().to_string();
            while let Some(event) = next_remote_event(&mut rx, &origin).await {
                if let Err(e) = ctx.apply_remote(event) {
                    warn!("Failed to apply remote snapshot: {e}");
                }
            }
            debug!(client_id = %origin, "Broadcast listener stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn spawn_persistence(self: &Arc<Self>) -> JoinHandle<()> {
        let ctx = Arc::clone(self);
        let debounce = Duration::from_millis(self.settings.persist_debounce_ms);
        tokio::spawn(run_debounced(Arc::clone(&self.dirty), debounce, move |kinds| {
            let ctx = Arc::clone(&ctx);
            async move { ctx.write_slices(&kinds) }
        }))
    }

    /// Stop the debounced flusher after one last flush.
    pub fn stop_persistence(&self) {
        self.dirty.stop();
    }

    /// Write every dirty slice immediately.
    pub fn flush_now(&self) -> LedgerResult<()> {
        self.dirty
            .flush_with(|kinds| self.write_slices(kinds))
            .map(|_| ())
    }

    /// Write the given slices plus the offline queue, so a queue whose own
    /// save failed is retried with every flush. The queue is saved under the
    /// state lock so an older copy never overwrites a newer one.
    fn write_slices(&self, kinds: &[SliceKind]) -> LedgerResult<()> {
        let (payloads, queue_saved): (Vec<SlicePayload>, LedgerResult<()>) = {
            let state = self.lock()?;
            let payloads = kinds
                .iter()
                .map(|kind| match kind {
                    SliceKind::Inventory => SlicePayload::Inventory(state.inventory.clone()),
                    SliceKind::Accounting => SlicePayload::Accounting(state.accounting.clone()),
                    SliceKind::Rooms => SlicePayload::Rooms(state.rooms.clone()),
                })
                .collect();
            (payloads, state.queue.save(self.store.as_ref()))
        };

        let result = queue_saved.and_then(|()| {
            payloads
                .iter()
                .try_for_each(|payload| write_slice(self.store.as_ref(), payload))
        });

        let labels = kinds
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let error = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self.store.record_flush(&labels, error.as_deref()) {
            debug!("Flush journal not written: {e}");
        }
        result
    }
}
