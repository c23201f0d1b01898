//! Discrepancy analysis.
//!
//! Recomputes expected closing stock in servings from opening, purchases and
//! sales alone, then compares it with the ledger's current stock. Wastage and
//! manual counts are deliberately absent from the expectation, so any of
//! them shows up as a discrepancy worth a physical audit. Read-only.

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{InventorySlice, LedgerEntry, ProductKey};
use crate::stock::round_1dp;

pub const DEFAULT_TOLERANCE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscrepancyRow {
    pub product: ProductKey,
    pub total_available: f64,
    pub expected_closing: f64,
    pub current_servings: f64,
    pub discrepancy: f64,
    pub flagged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub tolerance: f64,
    pub rows: Vec<DiscrepancyRow>,
    pub flagged_count: usize,
}

impl ReconciliationReport {
    pub fn flagged(&self) -> impl Iterator<Item = &DiscrepancyRow> {
        self.rows.iter().filter(|r| r.flagged)
    }
}

pub fn analyze_entry(entry: &LedgerEntry, tolerance: f64) -> DiscrepancyRow {
    let total_available =
        round_1dp(entry.opening.total_servings() + entry.purchases.total_servings());
    let expected_closing = round_1dp(total_available - entry.sales_servings as f64);
    let current_servings = entry.current.total_servings();
    let discrepancy = round_1dp(expected_closing - current_servings);
    DiscrepancyRow {
        product: entry.key.clone(),
        total_available,
        expected_closing,
        current_servings,
        discrepancy,
        flagged: discrepancy.abs() > tolerance,
    }
}

pub fn analyze(slice: &InventorySlice, tolerance: f64) -> ReconciliationReport {
    let rows: Vec<DiscrepancyRow> = slice
        .entries
        .values()
        .map(|entry| analyze_entry(entry, tolerance))
        .collect();
    let flagged_count = rows.iter().filter(|r| r.flagged).count();
    debug!(rows = rows.len(), flagged_count, "Reconciliation analyzed");
    ReconciliationReport {
        tolerance,
        rows,
        flagged_count,
    }
}

/// Same as [`analyze`] on the blocking pool, for large inventories.
pub async fn analyze_in_background(
    slice: InventorySlice,
    tolerance: f64,
) -> LedgerResult<ReconciliationReport> {
    let report = tokio::task::spawn_blocking(move || analyze(&slice, tolerance))
        .await
        .map_err(|e| LedgerError::Task(format!("reconciliation: {e}")))?;
    info!(
        rows = report.rows.len(),
        flagged = report.flagged_count,
        "Background reconciliation complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispenser::sell_servings;
    use crate::units::ContainerSize;

    fn slice_with(entries: Vec<LedgerEntry>) -> InventorySlice {
        let mut slice = InventorySlice::default();
        for e in entries {
            slice.put(e);
        }
        slice
    }

    fn entry(name: &str, size: ContainerSize, cases: u64, containers: u64) -> LedgerEntry {
        LedgerEntry::with_opening_units(ProductKey::new(name, size), cases, containers, None, 0)
            .unwrap()
    }

    #[test]
    fn test_purchases_and_sales_reconcile_exactly() {
        for size in [ContainerSize::Ml750, ContainerSize::Ml180] {
            let mut e = entry("House", size, 0, 5);
            for (i, n) in [3u32, 7, 1, 11].into_iter().enumerate() {
                e = sell_servings(&e, n, i as i64).entry;
                e = e.record_purchase(0, 1, i as i64).unwrap();
            }
            let row = analyze_entry(&e, DEFAULT_TOLERANCE);
            assert_eq!(row.discrepancy, 0.0, "size {size}: {row:?}");
            assert!(!row.flagged);
        }
    }

    #[test]
    fn test_full_case_drained_reconciles() {
        let e = sell_servings(&entry("Old Monk", ContainerSize::Ml750, 1, 0), 150, 1).entry;
        let row = analyze_entry(&e, DEFAULT_TOLERANCE);
        assert_eq!(row.total_available, 150.0);
        assert_eq!(row.expected_closing, 0.0);
        assert_eq!(row.discrepancy, 0.0);
    }

    #[test]
    fn test_wastage_and_counts_are_flagged() {
        let wasted = entry("Gin", ContainerSize::Ml750, 0, 4)
            .record_wastage(120, 1)
            .unwrap()
            .entry;
        let counted = entry("Rum", ContainerSize::Ml750, 0, 4)
            .adjust_to_physical_count(4, 3.0, "found a hidden bottle", 1)
            .unwrap();
        let clean = entry("Vodka", ContainerSize::Ml750, 0, 4);

        let report = analyze(&slice_with(vec![wasted, counted, clean]), DEFAULT_TOLERANCE);
        assert_eq!(report.rows.len(), 3);
        assert_eq!(report.flagged_count, 2);

        let gin = report.rows.iter().find(|r| r.product.name == "Gin").unwrap();
        assert_eq!(gin.discrepancy, 2.0);
        let rum = report.rows.iter().find(|r| r.product.name == "Rum").unwrap();
        assert_eq!(rum.discrepancy, -3.0);
    }

    #[test]
    fn test_tolerance_is_configurable() {
        let e = entry("Gin", ContainerSize::Ml750, 0, 4)
            .record_wastage(120, 1)
            .unwrap()
            .entry;
        let slice = slice_with(vec![e]);
        assert_eq!(analyze(&slice, 0.1).flagged_count, 1);
        assert_eq!(analyze(&slice, 5.0).flagged_count, 0);
    }

    #[tokio::test]
    async fn test_background_lane_matches_inline() {
        let slice = slice_with(vec![
            sell_servings(&entry("A", ContainerSize::Ml750, 1, 3), 40, 1).entry,
            entry("B", ContainerSize::Ml1000, 0, 2)
                .record_wastage(50, 1)
                .unwrap()
                .entry,
            entry("C", ContainerSize::Ml375, 2, 0),
        ]);
        let inline = analyze(&slice, DEFAULT_TOLERANCE);
        let background = analyze_in_background(slice, DEFAULT_TOLERANCE)
            .await
            .unwrap();
        assert_eq!(inline, background);
    }
}
