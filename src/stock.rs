//! Stock arithmetic: milliliters in, cases / containers / servings out.

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};
use crate::units::{UnitConfig, SERVING_ML};

/// Round to one decimal place (servings are always reported this way).
pub fn round_1dp(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Canonical stock representation. Only `total_ml` is stored state; the
/// breakdown fields are derived by [`to_snapshot`] and have no setters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantitySnapshot {
    total_ml: u64,
    full_cases: u64,
    loose_containers: u64,
    loose_servings: f64,
    total_containers: u64,
    total_servings: f64,
}

impl QuantitySnapshot {
    pub fn empty() -> Self {
        Self {
            total_ml: 0,
            full_cases: 0,
            loose_containers: 0,
            loose_servings: 0.0,
            total_containers: 0,
            total_servings: 0.0,
        }
    }

    pub fn total_ml(&self) -> u64 {
        self.total_ml
    }
    pub fn full_cases(&self) -> u64 {
        self.full_cases
    }
    pub fn loose_containers(&self) -> u64 {
        self.loose_containers
    }
    pub fn loose_servings(&self) -> f64 {
        self.loose_servings
    }
    pub fn total_containers(&self) -> u64 {
        self.total_containers
    }
    pub fn total_servings(&self) -> f64 {
        self.total_servings
    }

    /// Rebuild the ml figure from the breakdown. Differs from `total_ml` by
    /// at most half a tenth of a serving (3 ml) because of rounding.
    pub fn reconstructed_ml(&self, config: &UnitConfig) -> f64 {
        (self.full_cases * config.ml_per_case() + self.loose_containers * config.capacity_ml())
            as f64
            + self.loose_servings * SERVING_ML as f64
    }
}

pub fn to_snapshot(total_ml: u64, config: &UnitConfig) -> QuantitySnapshot {
    let ml_per_case = config.ml_per_case();
    let capacity = config.capacity_ml();

    let full_cases = total_ml / ml_per_case;
    let r1 = total_ml % ml_per_case;
    let loose_containers = r1 / capacity;
    let r2 = r1 % capacity;
    let loose_servings = round_1dp(r2 as f64 / SERVING_ML as f64);
    let total_containers = full_cases * config.containers_per_case + loose_containers;
    let total_servings =
        round_1dp(total_containers as f64 * config.servings_per_container + loose_servings);

    QuantitySnapshot {
        total_ml,
        full_cases,
        loose_containers,
        loose_servings,
        total_containers,
        total_servings,
    }
}

/// Inverse of [`to_snapshot`] for whole cases and containers. Counts too
/// large to express in ml are a `Validation` error.
pub fn to_ml(cases: u64, containers: u64, config: &UnitConfig) -> LedgerResult<u64> {
    cases
        .checked_mul(config.ml_per_case())
        .zip(containers.checked_mul(config.capacity_ml()))
        .and_then(|(a, b)| a.checked_add(b))
        .ok_or_else(|| {
            LedgerError::validation(format!(
                "{cases} case(s) + {containers} container(s) is out of range"
            ))
        })
}

/// Whole-ml volume of a (possibly fractional) serving count. Negative or
/// non-finite input counts as zero.
pub fn servings_to_ml(servings: f64) -> u64 {
    if !servings.is_finite() || servings <= 0.0 {
        return 0;
    }
    (servings * SERVING_ML as f64).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::ContainerSize;

    #[test]
    fn test_snapshot_breakdown_750() {
        let config = UnitConfig::for_size(ContainerSize::Ml750);
        // 1 case + 3 bottles + 690 ml
        let snap = to_snapshot(9000 + 3 * 750 + 690, &config);
        assert_eq!(snap.full_cases(), 1);
        assert_eq!(snap.loose_containers(), 3);
        assert_eq!(snap.loose_servings(), 11.5);
        assert_eq!(snap.total_containers(), 15);
        assert_eq!(snap.total_servings(), 199.0);
    }

    #[test]
    fn test_empty_snapshot() {
        let config = UnitConfig::for_size(ContainerSize::Ml1000);
        let snap = to_snapshot(0, &config);
        assert_eq!(snap, QuantitySnapshot::empty());
    }

    #[test]
    fn test_to_ml_inverts_cases_and_containers() {
        for size in ContainerSize::ALL {
            let config = UnitConfig::for_size(size);
            for cases in 0..4 {
                for containers in 0..config.containers_per_case {
                    let ml = to_ml(cases, containers, &config).unwrap();
                    let snap = to_snapshot(ml, &config);
                    assert_eq!(snap.full_cases(), cases);
                    assert_eq!(snap.loose_containers(), containers);
                    assert_eq!(snap.loose_servings(), 0.0);
                }
            }
        }
    }

    #[test]
    fn test_to_ml_rejects_out_of_range_counts() {
        let config = UnitConfig::for_size(ContainerSize::Ml750);
        assert!(matches!(
            to_ml(u64::MAX / 1000, 0, &config),
            Err(LedgerError::Validation(_))
        ));
        assert!(matches!(
            to_ml(0, u64::MAX, &config),
            Err(LedgerError::Validation(_))
        ));
        assert!(to_ml(1_000_000, 5, &config).is_ok());
    }

    #[test]
    fn test_reconstruction_within_one_serving_tolerance() {
        for size in ContainerSize::ALL {
            let config = UnitConfig::for_size(size);
            let mut ml = 0u64;
            while ml < 3 * config.ml_per_case() {
                let snap = to_snapshot(ml, &config);
                let diff = (snap.reconstructed_ml(&config) - ml as f64).abs();
                assert!(diff <= 3.0 + 1e-9, "{size}: {ml} ml drifted by {diff}");
                ml += 7;
            }
        }
    }

    #[test]
    fn test_servings_to_ml() {
        assert_eq!(servings_to_ml(2.5), 150);
        assert_eq!(servings_to_ml(0.3), 18);
        assert_eq!(servings_to_ml(-1.0), 0);
        assert_eq!(servings_to_ml(f64::NAN), 0);
    }
}
