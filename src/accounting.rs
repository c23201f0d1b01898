//! Bar-sale records feeding billing totals.
//!
//! Servings sold are rolled up per product for the life of the ledger; the
//! individual sale records are only kept for the most recent `cap` sales, the
//! same way the activity log is capped.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispenser::SaleOutcome;
use crate::identity::Actor;
use crate::ledger::ProductKey;

pub const DEFAULT_SALES_CAP: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarSale {
    pub id: String,
    pub product: ProductKey,
    pub requested: u32,
    pub fulfilled: u32,
    pub actor_id: String,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountingSlice {
    #[serde(default = "default_cap")]
    cap: usize,
    /// Most recent sales, oldest first.
    pub sales: VecDeque<BarSale>,
    /// Servings sold per product storage key, never truncated.
    #[serde(default)]
    pub servings_by_product: BTreeMap<String, u64>,
}

fn default_cap() -> usize {
    DEFAULT_SALES_CAP
}

impl Default for AccountingSlice {
    fn default() -> Self {
        Self::with_cap(DEFAULT_SALES_CAP)
    }
}

impl AccountingSlice {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            sales: VecDeque::new(),
            servings_by_product: BTreeMap::new(),
        }
    }

    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap.max(1);
        self.trim();
    }

    fn trim(&mut self) {
        while self.sales.len() > self.cap {
            self.sales.pop_front();
        }
    }

    /// Book a sale. Nothing is booked when no serving was poured.
    pub fn record(&mut self, outcome: &SaleOutcome, actor: &Actor, at: i64) -> Option<&BarSale> {
        if outcome.fulfilled == 0 {
            return None;
        }
        let key = outcome.entry.key.clone();
        *self
            .servings_by_product
            .entry(key.storage_key())
            .or_insert(0) += u64::from(outcome.fulfilled);
        self.sales.push_back(BarSale {
            id: Uuid::new_v4().to_string(),
            product: key,
            requested: outcome.requested,
            fulfilled: outcome.fulfilled,
            actor_id: actor.id.clone(),
            at,
        });
        self.trim();
        self.sales.back()
    }

    pub fn servings_sold(&self) -> u64 {
        self.servings_by_product.values().sum()
    }

    pub fn servings_sold_for(&self, key: &ProductKey) -> u64 {
        self.servings_by_product
            .get(&key.storage_key())
            .copied()
            .unwrap_or(0)
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<BarSale> {
        self.sales.iter().rev().take(limit).cloned().collect()
    }
}
