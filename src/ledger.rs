//! Per-product inventory ledger.
//!
//! Every mutation is a pure fold: it borrows the current entry and returns a
//! new one, so live traffic and offline replay run the exact same code.
//! Current stock is always rebuilt from the bookkeeping formula
//!
//! ```text
//! opening + purchases - wastage - sales * 60 + adjustments   (floored at 0)
//! ```
//!
//! except for sales, which move the open container directly (see
//! `dispenser`), and physical counts, which overwrite it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::activity::ActivityLog;
use crate::error::{LedgerError, LedgerResult};
use crate::stock::{servings_to_ml, to_ml, to_snapshot, QuantitySnapshot};
use crate::units::{ContainerSize, UnitConfig, SERVING_ML};

/// Ledger identity: product name plus container size. Names compare
/// case-insensitively and ignore surrounding whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductKey {
    pub name: String,
    pub size: ContainerSize,
}

impl ProductKey {
    pub fn new(name: impl Into<String>, size: ContainerSize) -> Self {
        let name: String = name.into();
        Self {
            name: name.trim().to_string(),
            size,
        }
    }

    /// Map key used by the inventory slice, e.g. `old monk@750`.
    pub fn storage_key(&self) -> String {
        format!("{}@{}", self.name.to_lowercase(), self.size.capacity_ml())
    }

    /// Parse `Name@750` / `Name@750ml` as typed on the command line.
    pub fn parse(raw: &str) -> LedgerResult<Self> {
        let (name, size) = raw
            .rsplit_once('@')
            .ok_or_else(|| LedgerError::validation(format!("expected NAME@SIZE, got '{raw}'")))?;
        if name.trim().is_empty() {
            return Err(LedgerError::validation("product name is empty"));
        }
        let size = ContainerSize::parse_label(size)
            .ok_or_else(|| LedgerError::validation(format!("unrecognized container size: {size}")))?;
        Ok(Self::new(name, size))
    }
}

impl fmt::Display for ProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub key: ProductKey,
    pub config: UnitConfig,
    pub opening: QuantitySnapshot,
    pub purchases: QuantitySnapshot,
    /// Cumulative servings sold.
    pub sales_servings: u64,
    pub wastage_ml: u64,
    /// Net ml introduced by physical counts.
    pub adjustment_ml: i64,
    pub current: QuantitySnapshot,
    /// Ml left in the tapped container, always below capacity.
    pub open_remainder_ml: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_case: Option<f64>,
    pub updated_at: i64,
}

/// Result of a wastage fold.
#[derive(Debug, Clone)]
pub struct WastageOutcome {
    pub entry: LedgerEntry,
    /// The wasted volume was exactly the open container's remainder.
    pub open_container_written_off: bool,
}

impl LedgerEntry {
    pub fn onboard(key: ProductKey, opening_ml: u64, cost_per_case: Option<f64>, at: i64) -> Self {
        let config = UnitConfig::for_size(key.size);
        let opening = to_snapshot(opening_ml, &config);
        Self {
            key,
            config,
            opening,
            purchases: QuantitySnapshot::empty(),
            sales_servings: 0,
            wastage_ml: 0,
            adjustment_ml: 0,
            current: opening,
            open_remainder_ml: opening_ml % config.capacity_ml(),
            cost_per_case,
            updated_at: at,
        }
    }

    pub fn with_opening_units(
        key: ProductKey,
        cases: u64,
        containers: u64,
        cost_per_case: Option<f64>,
        at: i64,
    ) -> LedgerResult<Self> {
        let config = UnitConfig::for_size(key.size);
        let opening_ml = to_ml(cases, containers, &config)?;
        Ok(Self::onboard(key, opening_ml, cost_per_case, at))
    }

    /// Bookkeeping total before flooring at zero.
    pub fn formula_ml_unclamped(&self) -> i128 {
        i128::from(self.opening.total_ml()) + i128::from(self.purchases.total_ml())
            - i128::from(self.wastage_ml)
            - i128::from(self.sales_servings) * i128::from(SERVING_ML)
            + i128::from(self.adjustment_ml)
    }

    pub fn formula_ml(&self) -> u64 {
        self.formula_ml_unclamped().clamp(0, i128::from(u64::MAX)) as u64
    }

    /// Rebuild `current` from the formula. The open remainder follows as
    /// `total mod capacity`, which is the untouched remainder whenever the
    /// ledger is not carrying a final-container clamp.
    fn recompute(&mut self) {
        let total = self.formula_ml();
        self.current = to_snapshot(total, &self.config);
        self.open_remainder_ml = total % self.config.capacity_ml();
    }

    pub fn record_purchase(&self, cases: u64, containers: u64, at: i64) -> LedgerResult<Self> {
        if cases == 0 && containers == 0 {
            return Err(LedgerError::validation(
                "purchase must add at least one container",
            ));
        }
        let purchased = to_ml(cases, containers, &self.config)?
            .checked_add(self.purchases.total_ml())
            .ok_or_else(|| LedgerError::validation(format!("purchases of {} out of range", self.key)))?;
        let mut next = self.clone();
        next.purchases = to_snapshot(purchased, &self.config);
        next.recompute();
        next.updated_at = at;
        Ok(next)
    }

    pub fn record_wastage(&self, ml: u64, at: i64) -> LedgerResult<WastageOutcome> {
        if ml == 0 {
            return Err(LedgerError::validation("wastage must be greater than 0 ml"));
        }
        if ml > self.current.total_ml() {
            return Err(LedgerError::validation(format!(
                "wastage of {ml} ml exceeds {} ml on hand for {}",
                self.current.total_ml(),
                self.key
            )));
        }
        let written_off = self.open_remainder_ml > 0 && ml == self.open_remainder_ml;
        let mut next = self.clone();
        next.wastage_ml = self
            .wastage_ml
            .checked_add(ml)
            .ok_or_else(|| LedgerError::validation(format!("wastage of {} out of range", self.key)))?;
        next.recompute();
        next.updated_at = at;
        Ok(WastageOutcome {
            entry: next,
            open_container_written_off: written_off,
        })
    }

    /// Overwrite current stock from a manual count. The difference to the
    /// bookkeeping formula is kept in `adjustment_ml` so later recomputation
    /// lands on the counted figure.
    pub fn adjust_to_physical_count(
        &self,
        physical_containers: u64,
        physical_servings: f64,
        reason: &str,
        at: i64,
    ) -> LedgerResult<Self> {
        if reason.trim().is_empty() {
            return Err(LedgerError::validation(
                "a reason is required for manual stock adjustments",
            ));
        }
        if !physical_servings.is_finite() || physical_servings < 0.0 {
            return Err(LedgerError::validation("physical servings must be >= 0"));
        }
        let physical_ml = physical_containers
            .checked_mul(self.config.capacity_ml())
            .and_then(|ml| ml.checked_add(servings_to_ml(physical_servings)))
            .ok_or_else(|| {
                LedgerError::validation(format!(
                    "physical count of {physical_containers} container(s) is out of range"
                ))
            })?;
        let delta = i128::from(physical_ml) - self.formula_ml_unclamped();
        let adjustment = i128::from(self.adjustment_ml) + delta;
        let adjustment_ml = i64::try_from(adjustment)
            .map_err(|_| LedgerError::validation("adjustment out of range"))?;

        let mut next = self.clone();
        next.adjustment_ml = adjustment_ml;
        next.current = to_snapshot(physical_ml, &self.config);
        next.open_remainder_ml = physical_ml % self.config.capacity_ml();
        next.updated_at = at;
        Ok(next)
    }

    pub fn stock_value(&self) -> Option<f64> {
        self.cost_per_case
            .map(|cost| cost * self.current.total_ml() as f64 / self.config.ml_per_case() as f64)
    }
}

/// The inventory slice: everything a client broadcasts as "inventory".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySlice {
    pub entries: BTreeMap<String, LedgerEntry>,
    pub activity: ActivityLog,
    /// Ids of queued offline mutations already applied; written in the same
    /// fold as the mutation itself.
    #[serde(default)]
    pub replayed_ids: BTreeSet<String>,
}

impl InventorySlice {
    pub fn get(&self, key: &ProductKey) -> Option<&LedgerEntry> {
        self.entries.get(&key.storage_key())
    }

    pub fn require(&self, key: &ProductKey) -> LedgerResult<&LedgerEntry> {
        self.get(key)
            .ok_or_else(|| LedgerError::UnknownProduct(key.clone()))
    }

    pub fn put(&mut self, entry: LedgerEntry) {
        self.entries.insert(entry.key.storage_key(), entry);
    }

    pub fn contains(&self, key: &ProductKey) -> bool {
        self.entries.contains_key(&key.storage_key())
    }
}
