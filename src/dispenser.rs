//! Serving dispenser: pours one 60 ml peg at a time from the open bottle.
//!
//! State is the sealed container count in the current snapshot plus the
//! entry's open remainder. A pour that runs the open bottle dry taps the next
//! one and takes the shortfall from it, so the ml total always moves by
//! exactly one serving. Only the very last bottle can short-pour: its
//! remainder is clamped to zero.
//!
//! The shortfall is carried into the newly tapped bottle, not discarded: the
//! open remainder never exceeds the ml on hand, and a 750 ml case sells
//! exactly 150 pegs.

use tracing::debug;

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::LedgerEntry;
use crate::stock::to_snapshot;
use crate::units::SERVING_ML;

/// Outcome of a multi-serving sale. A shortfall is not an error.
#[derive(Debug, Clone)]
pub struct SaleOutcome {
    pub entry: LedgerEntry,
    pub requested: u32,
    pub fulfilled: u32,
}

impl SaleOutcome {
    pub fn shortfall(&self) -> u32 {
        self.requested - self.fulfilled
    }

    pub fn is_partial(&self) -> bool {
        self.fulfilled < self.requested
    }
}

pub fn sell_one_serving(entry: &LedgerEntry, at: i64) -> LedgerResult<LedgerEntry> {
    let capacity = entry.config.capacity_ml() as i64;
    let mut sealed = entry.current.total_containers();
    let mut remainder = entry.open_remainder_ml as i64;

    if remainder == 0 && sealed == 0 {
        return Err(LedgerError::OutOfStock {
            product: entry.key.clone(),
            requested: 1,
            fulfilled: 0,
        });
    }
    if remainder == 0 {
        sealed -= 1;
        remainder = capacity;
    }

    remainder -= SERVING_ML as i64;

    if remainder < 0 {
        if sealed > 0 {
            sealed -= 1;
            remainder += capacity;
            debug!(product = %entry.key, sealed, remainder, "Open container rolled over");
        } else {
            debug!(
                product = %entry.key,
                short_ml = -remainder,
                "Last container short-poured, clamping remainder"
            );
            remainder = 0;
        }
    }

    let remainder = remainder as u64;
    let mut next = entry.clone();
    next.current = to_snapshot(sealed * entry.config.capacity_ml() + remainder, &entry.config);
    next.open_remainder_ml = remainder;
    next.sales_servings += 1;
    next.updated_at = at;
    Ok(next)
}

/// Pour up to `servings`, stopping at the first `OutOfStock`.
pub fn sell_servings(entry: &LedgerEntry, servings: u32, at: i64) -> SaleOutcome {
    let mut current = entry.clone();
    let mut fulfilled = 0;
    for _ in 0..servings {
        match sell_one_serving(&current, at) {
            Ok(next) => {
                current = next;
                fulfilled += 1;
            }
            Err(_) => break,
        }
    }
    SaleOutcome {
        entry: current,
        requested: servings,
        fulfilled,
    }
}
