//! Container sizes and their fixed unit configuration.
//!
//! `UnitConfig::for_size` is the only place servings-per-container is
//! computed. Every snapshot, sale and report goes through it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// Standard dispensed unit (one peg).
pub const SERVING_ML: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum ContainerSize {
    Ml1000,
    Ml750,
    Ml650,
    Ml500,
    Ml375,
    Ml180,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Spirit,
    Beer,
}

impl ContainerSize {
    pub const ALL: [ContainerSize; 6] = [
        ContainerSize::Ml1000,
        ContainerSize::Ml750,
        ContainerSize::Ml650,
        ContainerSize::Ml500,
        ContainerSize::Ml375,
        ContainerSize::Ml180,
    ];

    pub fn capacity_ml(self) -> u64 {
        match self {
            ContainerSize::Ml1000 => 1000,
            ContainerSize::Ml750 => 750,
            ContainerSize::Ml650 => 650,
            ContainerSize::Ml500 => 500,
            ContainerSize::Ml375 => 375,
            ContainerSize::Ml180 => 180,
        }
    }

    pub fn from_ml(ml: u32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|size| size.capacity_ml() == u64::from(ml))
    }

    /// Parse the loose size labels found in supplier sheets: `750`, `750ml`,
    /// `750 ML`, `75cl`, `1L`, `1 ltr`.
    pub fn parse_label(raw: &str) -> Option<Self> {
        let lower = raw.trim().to_ascii_lowercase();
        let digits_end = lower
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(lower.len());
        let (number, unit) = lower.split_at(digits_end);
        let value: f64 = number.parse().ok()?;
        let ml = match unit.trim() {
            "" | "ml" | "mls" => value,
            "cl" => value * 10.0,
            "l" | "ltr" | "litre" | "liter" => value * 1000.0,
            _ => return None,
        };
        if ml.fract() != 0.0 || ml <= 0.0 || ml > f64::from(u32::MAX) {
            return None;
        }
        Self::from_ml(ml as u32)
    }
}

impl fmt::Display for ContainerSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ml", self.capacity_ml())
    }
}

impl TryFrom<u32> for ContainerSize {
    type Error = LedgerError;

    fn try_from(ml: u32) -> Result<Self, Self::Error> {
        ContainerSize::from_ml(ml)
            .ok_or_else(|| LedgerError::validation(format!("unrecognized container size: {ml}ml")))
    }
}

impl From<ContainerSize> for u32 {
    fn from(size: ContainerSize) -> u32 {
        size.capacity_ml() as u32
    }
}

/// Fixed packaging and pour configuration for one container size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitConfig {
    pub size: ContainerSize,
    pub containers_per_case: u64,
    /// `capacity / 60` rounded to two decimals (750 -> 12.5, 1000 -> 16.67).
    pub servings_per_container: f64,
    pub category: Category,
}

impl UnitConfig {
    pub fn for_size(size: ContainerSize) -> Self {
        let (containers_per_case, category) = match size {
            ContainerSize::Ml1000 => (9, Category::Spirit),
            ContainerSize::Ml750 => (12, Category::Spirit),
            ContainerSize::Ml650 => (12, Category::Beer),
            ContainerSize::Ml500 => (24, Category::Beer),
            ContainerSize::Ml375 => (24, Category::Spirit),
            ContainerSize::Ml180 => (48, Category::Spirit),
        };
        let exact = size.capacity_ml() as f64 / SERVING_ML as f64;
        Self {
            size,
            containers_per_case,
            servings_per_container: (exact * 100.0).round() / 100.0,
            category,
        }
    }

    pub fn capacity_ml(&self) -> u64 {
        self.size.capacity_ml()
    }

    pub fn ml_per_case(&self) -> u64 {
        self.containers_per_case * self.capacity_ml()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_servings_per_container_is_two_decimal_approximation() {
        assert_eq!(UnitConfig::for_size(ContainerSize::Ml750).servings_per_container, 12.5);
        assert_eq!(UnitConfig::for_size(ContainerSize::Ml1000).servings_per_container, 16.67);
        assert_eq!(UnitConfig::for_size(ContainerSize::Ml375).servings_per_container, 6.25);
        assert_eq!(UnitConfig::for_size(ContainerSize::Ml500).servings_per_container, 8.33);
        assert_eq!(UnitConfig::for_size(ContainerSize::Ml650).servings_per_container, 10.83);
        assert_eq!(UnitConfig::for_size(ContainerSize::Ml180).servings_per_container, 3.0);
    }

    #[test]
    fn test_case_volumes() {
        assert_eq!(UnitConfig::for_size(ContainerSize::Ml750).ml_per_case(), 9000);
        assert_eq!(UnitConfig::for_size(ContainerSize::Ml1000).ml_per_case(), 9000);
        assert_eq!(UnitConfig::for_size(ContainerSize::Ml650).category, Category::Beer);
    }

    #[test]
    fn test_parse_label_variants() {
        assert_eq!(ContainerSize::parse_label("750"), Some(ContainerSize::Ml750));
        assert_eq!(ContainerSize::parse_label("750ml"), Some(ContainerSize::Ml750));
        assert_eq!(ContainerSize::parse_label(" 750 ML "), Some(ContainerSize::Ml750));
        assert_eq!(ContainerSize::parse_label("75cl"), Some(ContainerSize::Ml750));
        assert_eq!(ContainerSize::parse_label("1L"), Some(ContainerSize::Ml1000));
        assert_eq!(ContainerSize::parse_label("1 ltr"), Some(ContainerSize::Ml1000));
        assert_eq!(ContainerSize::parse_label("700ml"), None);
        assert_eq!(ContainerSize::parse_label("big"), None);
        assert_eq!(ContainerSize::parse_label(""), None);
    }

    #[test]
    fn test_serde_uses_capacity_number() {
        let json = serde_json::to_string(&ContainerSize::Ml375).unwrap();
        assert_eq!(json, "375");
        let back: ContainerSize = serde_json::from_str("650").unwrap();
        assert_eq!(back, ContainerSize::Ml650);
        assert!(serde_json::from_str::<ContainerSize>("700").is_err());
    }
}
