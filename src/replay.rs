//! Replay of the offline queue on reconnect.
//!
//! Queued mutations are applied oldest first (ties by id) through the same
//! commit functions as live traffic. Each applied id is written into the
//! inventory slice in the same fold as the mutation, so a replay interrupted
//! by a crash or timeout can simply be run again: recorded ids are skipped.
//! The first hard failure stops the drain and leaves that entry and every
//! later one queued.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::context::ClientContext;
use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    /// Mutations that changed state.
    pub applied: usize,
    /// Already applied by an earlier, interrupted replay.
    pub skipped: usize,
    /// Accepted as handled without a state change: stale room writes and
    /// sales with nothing left to pour.
    pub dropped: usize,
    /// Entries removed from the queue.
    pub cleared: usize,
}

/// Drain the queue within the configured replay timeout, including any wait
/// behind a replay already in progress. On timeout the queue is left in place
/// and `Task` is returned; running again resumes.
pub async fn replay_queue(ctx: &ClientContext) -> LedgerResult<ReplayReport> {
    let timeout = Duration::from_millis(ctx.settings().replay_timeout_ms);
    let run = async {
        let _guard = ctx.replay_lock().lock().await;
        drain(ctx).await
    };
    match tokio::time::timeout(timeout, run).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                timeout_ms = ctx.settings().replay_timeout_ms,
                pending = ctx.pending_sync_count(),
                "Replay timed out, queue kept for retry"
            );
            Err(LedgerError::Task(format!(
                "replay timed out after {}ms",
                ctx.settings().replay_timeout_ms
            )))
        }
    }
}

async fn drain(ctx: &ClientContext) -> LedgerResult<ReplayReport> {
    let entries = ctx.queued_mutations()?;
    if entries.is_empty() {
        return Ok(ReplayReport::default());
    }

    info!(count = entries.len(), "Replaying offline queue");
    let mut report = ReplayReport::default();
    let mut handled = Vec::with_capacity(entries.len());

    for mutation in &entries {
        if ctx.was_replayed(&mutation.id)? {
            report.skipped += 1;
            handled.push(mutation.id.clone());
            continue;
        }

        match ctx.apply_queued(mutation) {
            Ok(()) => report.applied += 1,
            Err(e @ (LedgerError::StaleWrite { .. } | LedgerError::OutOfStock { .. })) => {
                warn!(
                    mutation_id = %mutation.id,
                    kind = %mutation.payload.kind(),
                    "Queued mutation dropped on replay: {e}"
                );
                ctx.mark_replayed(&mutation.id)?;
                report.dropped += 1;
            }
            Err(e) => {
                let reason = e.to_string();
                ctx.mark_queue_failed(&mutation.id, &reason)?;
                warn!(
                    mutation_id = %mutation.id,
                    kind = %mutation.payload.kind(),
                    applied = report.applied,
                    pending = ctx.pending_sync_count(),
                    "Replay stopped: {reason}"
                );
                return Err(LedgerError::ReplayFailure {
                    mutation_id: mutation.id.clone(),
                    reason,
                });
            }
        }
        handled.push(mutation.id.clone());

        // Let broadcast listeners and the flusher run between entries.
        tokio::task::yield_now().await;
    }

    report.cleared = ctx.finish_replay(&handled)?;
    info!(
        applied = report.applied,
        skipped = report.skipped,
        dropped = report.dropped,
        "Offline queue replayed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::broadcast::LocalBus;
    use crate::clock::ManualClock;
    use crate::context::ClientContext;
    use crate::error::LedgerError;
    use crate::identity::StaticIdentity;
    use crate::ledger::ProductKey;
    use crate::rooms::RoomStatus;
    use crate::settings::{set_setting, KEY_REPLAY_TIMEOUT_MS};
    use crate::store::MemoryKvStore;
    use crate::units::ContainerSize;

    fn rum() -> ProductKey {
        ProductKey::new("Old Monk", ContainerSize::Ml750)
    }

    fn client(clock: Arc<ManualClock>) -> ClientContext {
        ClientContext::open(
            Arc::new(MemoryKvStore::new()),
            Arc::new(LocalBus::new(64)),
            Arc::new(StaticIdentity::new("staff-2", "Dev", "bar")),
            clock,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_replay_matches_live_application() {
        let sales = [2u32, 5, 1, 13, 4, 7];

        let live_clock = Arc::new(ManualClock::new(1_000));
        let live = client(live_clock.clone());
        live.onboard_product(rum(), 1, 0, None).unwrap();

        let offline_clock = Arc::new(ManualClock::new(1_000));
        let offline = client(offline_clock.clone());
        offline.onboard_product(rum(), 1, 0, None).unwrap();
        offline.go_offline();

        for n in sales {
            live_clock.advance(10);
            live.record_sale(&rum(), n).unwrap();
            offline_clock.advance(10);
            assert!(offline.record_sale(&rum(), n).unwrap().is_queued());
        }
        assert_eq!(offline.pending_sync_count(), sales.len());

        let report = offline.reconnect().await.unwrap();
        assert_eq!(report.applied, sales.len());
        assert_eq!(report.cleared, sales.len());
        assert_eq!(offline.pending_sync_count(), 0);

        let a = live.stock(&rum()).unwrap();
        let b = offline.stock(&rum()).unwrap();
        assert_eq!(a.current, b.current);
        assert_eq!(a.open_remainder_ml, b.open_remainder_ml);
        assert_eq!(a.sales_servings, b.sales_servings);
        assert_eq!(a.updated_at, b.updated_at);
        assert!(offline.inventory().unwrap().replayed_ids.is_empty());
    }

    #[tokio::test]
    async fn test_replay_sorts_by_creation_time() {
        let clock = Arc::new(ManualClock::new(0));
        let ctx = client(clock);
        ctx.go_offline();

        ctx.update_room_status("3", RoomStatus::Occupied, Some("Late"), 300)
            .unwrap();
        ctx.update_room_status("3", RoomStatus::Cleaning, None, 100)
            .unwrap();

        let report = ctx.reconnect().await.unwrap();
        assert_eq!(report.applied, 2);
        let room = ctx.room("3").unwrap().unwrap();
        assert_eq!(room.status, RoomStatus::Occupied);
        assert_eq!(room.last_updated, 300);
    }

    #[tokio::test]
    async fn test_stale_and_empty_entries_are_dropped_not_blocking() {
        let clock = Arc::new(ManualClock::new(500));
        let ctx = client(clock.clone());
        ctx.onboard_product(rum(), 0, 0, None).unwrap();
        ctx.update_room_status("8", RoomStatus::Vacant, None, 100)
            .unwrap();
        ctx.go_offline();

        ctx.update_room_status("8", RoomStatus::Occupied, None, 50)
            .unwrap();
        ctx.record_sale(&rum(), 1).unwrap();
        clock.advance(1);
        ctx.record_purchase(&rum(), 0, 1).unwrap();

        let report = ctx.reconnect().await.unwrap();
        assert_eq!(report.dropped, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(ctx.pending_sync_count(), 0);
        assert_eq!(ctx.room("8").unwrap().unwrap().status, RoomStatus::Vacant);
        assert_eq!(ctx.stock(&rum()).unwrap().current.total_containers(), 1);
    }

    #[tokio::test]
    async fn test_failure_stops_replay_and_retry_is_exactly_once() {
        let clock = Arc::new(ManualClock::new(0));
        let ctx = client(clock.clone());
        ctx.onboard_product(rum(), 0, 2, None).unwrap();
        ctx.go_offline();

        let gin = ProductKey::new("Gin", ContainerSize::Ml750);
        clock.set(10);
        ctx.record_sale(&rum(), 2).unwrap();
        clock.set(20);
        let bad = match ctx.record_sale(&gin, 1).unwrap() {
            crate::context::MutationOutcome::Queued { mutation_id } => mutation_id,
            other => panic!("expected queued, got {other:?}"),
        };
        clock.set(30);
        ctx.record_sale(&rum(), 1).unwrap();

        match ctx.reconnect().await {
            Err(LedgerError::ReplayFailure { mutation_id, .. }) => assert_eq!(mutation_id, bad),
            other => panic!("expected ReplayFailure, got {other:?}"),
        }
        assert_eq!(ctx.pending_sync_count(), 3);
        assert_eq!(ctx.stock(&rum()).unwrap().sales_servings, 2);
        let failed = ctx
            .queued_mutations()
            .unwrap()
            .into_iter()
            .find(|m| m.id == bad)
            .unwrap();
        assert_eq!(failed.attempts, 1);
        assert!(failed.last_error.is_some());

        // Retry after fixing the cause: the first sale must not apply twice.
        ctx.onboard_product(gin.clone(), 0, 1, None).unwrap();
        let report = ctx.reconnect().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.applied, 2);
        assert_eq!(ctx.stock(&rum()).unwrap().sales_servings, 3);
        assert_eq!(ctx.stock(&gin).unwrap().sales_servings, 1);
        assert_eq!(ctx.pending_sync_count(), 0);
    }

    #[tokio::test]
    async fn test_discarded_poison_entry_unblocks_queue() {
        let clock = Arc::new(ManualClock::new(0));
        let ctx = client(clock.clone());
        ctx.onboard_product(rum(), 0, 1, None).unwrap();
        ctx.go_offline();

        clock.set(1);
        let poison = ctx
            .record_wastage(&rum(), 5_000, "spill")
            .unwrap();
        clock.set(2);
        ctx.record_sale(&rum(), 1).unwrap();

        assert!(ctx.reconnect().await.is_err());
        let id = match poison {
            crate::context::MutationOutcome::Queued { mutation_id } => mutation_id,
            other => panic!("expected queued, got {other:?}"),
        };
        assert!(ctx.discard_queued(&id).unwrap());

        let report = ctx.reconnect().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(ctx.pending_sync_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_replay_keeps_queue_and_can_be_retried() {
        let store = Arc::new(MemoryKvStore::new());
        set_setting(store.as_ref(), KEY_REPLAY_TIMEOUT_MS, "50").unwrap();
        let ctx = ClientContext::open(
            store,
            Arc::new(LocalBus::new(64)),
            Arc::new(StaticIdentity::new("staff-2", "Dev", "bar")),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        assert_eq!(ctx.settings().replay_timeout_ms, 50);
        ctx.onboard_product(rum(), 0, 2, None).unwrap();
        ctx.go_offline();
        ctx.record_sale(&rum(), 2).unwrap();
        ctx.record_sale(&rum(), 1).unwrap();

        // Another replay holds the lock past the deadline.
        let busy = ctx.replay_lock().lock().await;
        assert!(matches!(ctx.reconnect().await, Err(LedgerError::Task(_))));
        assert_eq!(ctx.pending_sync_count(), 2);
        assert_eq!(ctx.stock(&rum()).unwrap().sales_servings, 0);
        drop(busy);

        let report = ctx.reconnect().await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(ctx.pending_sync_count(), 0);
        assert_eq!(ctx.stock(&rum()).unwrap().sales_servings, 3);
    }

    #[tokio::test]
    async fn test_empty_queue_is_a_no_op() {
        let ctx = client(Arc::new(ManualClock::new(0)));
        assert_eq!(ctx.reconnect().await.unwrap(), super::ReplayReport::default());
    }
}
