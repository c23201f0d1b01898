//! Tabular import feed and flat export.
//!
//! Rows arrive as JSON objects from a spreadsheet reader. Header spellings
//! vary between suppliers ("Bottle Size", "bottle_size", "SIZE (ml)") so
//! headers are normalized before lookup, and numbers may arrive as JSON
//! numbers or as text with units and separators. A bad row is skipped with
//! a reason; it never aborts the batch.

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::context::ClientContext;
use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{LedgerEntry, ProductKey};
use crate::units::{Category, ContainerSize};

const NAME_KEYS: &[&str] = &["name", "product", "productname", "brand", "item", "itemname"];
const SIZE_KEYS: &[&str] = &[
    "size",
    "sizeml",
    "ml",
    "volume",
    "bottlesize",
    "containersize",
    "capacity",
];
const CASE_KEYS: &[&str] = &["cases", "case", "casecount", "noofcases", "openingcases", "qtycases"];
const BOTTLE_KEYS: &[&str] = &[
    "bottles",
    "bottle",
    "loosebottles",
    "containers",
    "loosecontainers",
    "units",
];
const COST_KEYS: &[&str] = &["cost", "costpercase", "caseprice", "casecost", "price", "rate"];

#[derive(Debug, Clone, PartialEq)]
pub struct ImportRow {
    pub key: ProductKey,
    pub cases: u64,
    pub containers: u64,
    pub cost_per_case: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedRow {
    /// Zero-based position in the feed.
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub imported: Vec<ProductKey>,
    pub skipped: Vec<SkippedRow>,
}

/// Lowercase and drop everything but letters and digits, so `Bottle Size`,
/// `bottle-size` and `BOTTLE_SIZE` all become `bottlesize`. A trailing unit
/// in brackets (`Size (ml)`) is kept as part of the key.
fn normalize_header(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn normalized(row: &Map<String, Value>) -> Map<String, Value> {
    row.iter()
        .map(|(k, v)| (normalize_header(k), v.clone()))
        .collect()
}

fn field<'a>(row: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| row.get(*k))
        .find(|v| match v {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse `12`, `"12"`, `"1,200"` or `"₹ 5,400.50"`.
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    }
}

fn whole_count(value: Option<&Value>, label: &str) -> LedgerResult<u64> {
    let Some(value) = value else {
        return Ok(0);
    };
    let n = number(value)
        .ok_or_else(|| LedgerError::validation(format!("{label} is not a number: {value}")))?;
    if !n.is_finite() || n < 0.0 || n.fract() != 0.0 || n >= u64::MAX as f64 {
        return Err(LedgerError::validation(format!(
            "{label} must be a whole number >= 0, got {n}"
        )));
    }
    Ok(n as u64)
}

pub fn parse_row(row: &Value) -> LedgerResult<ImportRow> {
    let Value::Object(raw) = row else {
        return Err(LedgerError::validation("row is not an object"));
    };
    let row = normalized(raw);

    let name = field(&row, NAME_KEYS)
        .and_then(text)
        .ok_or_else(|| LedgerError::validation("missing product name"))?;

    let size_value = field(&row, SIZE_KEYS)
        .ok_or_else(|| LedgerError::validation(format!("missing container size for {name}")))?;
    let size = text(size_value)
        .and_then(|s| ContainerSize::parse_label(&s))
        .ok_or_else(|| {
            LedgerError::validation(format!("unrecognized container size for {name}: {size_value}"))
        })?;

    let cases = whole_count(field(&row, CASE_KEYS), "case count")?;
    let containers = whole_count(field(&row, BOTTLE_KEYS), "bottle count")?;

    let cost_per_case = match field(&row, COST_KEYS) {
        Some(v) => match number(v) {
            Some(c) if c.is_finite() && c >= 0.0 => Some(c),
            _ => return Err(LedgerError::validation(format!("invalid cost for {name}: {v}"))),
        },
        None => None,
    };

    Ok(ImportRow {
        key: ProductKey::new(name, size),
        cases,
        containers,
        cost_per_case,
    })
}

pub fn parse_rows(rows: &[Value]) -> (Vec<ImportRow>, Vec<SkippedRow>) {
    let mut parsed = Vec::new();
    let mut skipped = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        match parse_row(row) {
            Ok(r) => parsed.push(r),
            Err(e) => skipped.push(SkippedRow {
                index,
                reason: e.to_string(),
            }),
        }
    }
    (parsed, skipped)
}

/// Onboard every valid row. Rows for products already on the ledger are
/// skipped; re-importing a sheet never resets stock.
pub fn import_rows(ctx: &ClientContext, rows: &[Value]) -> ImportReport {
    let (parsed, mut skipped) = parse_rows(rows);
    let mut imported = Vec::with_capacity(parsed.len());

    let positions: Vec<usize> = (0..rows.len())
        .filter(|i| !skipped.iter().any(|s| s.index == *i))
        .collect();

    for (row, index) in parsed.into_iter().zip(positions) {
        match ctx.onboard_product(row.key.clone(), row.cases, row.containers, row.cost_per_case) {
            Ok(_) => imported.push(row.key),
            Err(e) => skipped.push(SkippedRow {
                index,
                reason: e.to_string(),
            }),
        }
    }
    skipped.sort_by_key(|s| s.index);

    for s in &skipped {
        warn!(row = s.index, reason = %s.reason, "Import row skipped");
    }
    info!(
        imported = imported.len(),
        skipped = skipped.len(),
        "Import finished"
    );
    ImportReport { imported, skipped }
}

/// One product per row, keyed so the file can be fed back to
/// [`import_rows`]. Partial containers are reported as loose servings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRow {
    pub name: String,
    pub size: String,
    pub category: Category,
    pub cases: u64,
    pub bottles: u64,
    pub loose_servings: f64,
    pub total_servings: f64,
    pub total_ml: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stock_value: Option<f64>,
}

pub fn export_rows(entries: &[LedgerEntry]) -> Vec<ExportRow> {
    entries
        .iter()
        .map(|e| ExportRow {
            name: e.key.name.clone(),
            size: e.key.size.to_string(),
            category: e.config.category,
            cases: e.current.full_cases(),
            bottles: e.current.loose_containers(),
            loose_servings: e.current.loose_servings(),
            total_servings: e.current.total_servings(),
            total_ml: e.current.total_ml(),
            cost: e.cost_per_case,
            stock_value: e.stock_value().map(|v| (v * 100.0).round() / 100.0),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_variants_are_tolerated() {
        let rows = [
            json!({"Name": "Old Monk", "Size": "750ml", "Cases": 2, "Cost": 5400}),
            json!({"product_name": "Kingfisher", "Bottle Size": "650 ML", "No. of Cases": "3", "loose-bottles": "4"}),
            json!({"BRAND": "Magic Moments", "size (ml)": 180, "case_count": "1", "Case Price": "₹ 4,800.50"}),
        ];
        let (parsed, skipped) = parse_rows(&rows);
        assert!(skipped.is_empty(), "{skipped:?}");
        assert_eq!(parsed.len(), 3);

        assert_eq!(parsed[0].key.size, ContainerSize::Ml750);
        assert_eq!(parsed[0].cases, 2);
        assert_eq!(parsed[0].cost_per_case, Some(5400.0));

        assert_eq!(parsed[1].key.name, "Kingfisher");
        assert_eq!(parsed[1].key.size, ContainerSize::Ml650);
        assert_eq!(parsed[1].containers, 4);

        assert_eq!(parsed[2].key.size, ContainerSize::Ml180);
        assert_eq!(parsed[2].cost_per_case, Some(4800.5));
    }

    #[test]
    fn test_malformed_rows_skipped_with_reason() {
        let rows = [
            json!({"name": "Good", "size": 750, "cases": 1}),
            json!({"name": "Odd Size", "size": "700ml", "cases": 1}),
            json!({"size": 750, "cases": 1}),
            json!({"name": "Half Case", "size": 750, "cases": 1.5}),
            json!(["not", "an", "object"]),
            json!({"name": "Bad Cost", "size": 375, "cost": "ask"}),
        ];
        let (parsed, skipped) = parse_rows(&rows);
        assert_eq!(parsed.len(), 1);
        let indexes: Vec<usize> = skipped.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4, 5]);
        assert!(skipped[0].reason.contains("700ml"));
    }

    #[test]
    fn test_import_onboards_and_skips_duplicates() {
        use crate::broadcast::LocalBus;
        use crate::clock::ManualClock;
        use crate::identity::StaticIdentity;
        use crate::store::MemoryKvStore;
        use std::sync::Arc;

        let ctx = ClientContext::open(
            Arc::new(MemoryKvStore::new()),
            Arc::new(LocalBus::default()),
            Arc::new(StaticIdentity::new("staff-1", "Asha", "office")),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        let rows = [
            json!({"Name": "Old Monk", "Size": "750ml", "Cases": 2}),
            json!({"Name": "Kingfisher", "Size": "650", "Cases": 1, "Bottles": 5}),
            json!({"Name": "old monk", "Size": 750, "Cases": 9}),
            json!({"Name": "Mystery", "Size": "2L"}),
        ];
        let report = import_rows(&ctx, &rows);
        assert_eq!(report.imported.len(), 2);
        let indexes: Vec<usize> = report.skipped.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![2, 3]);

        let rum = ctx
            .stock(&ProductKey::new("Old Monk", ContainerSize::Ml750))
            .unwrap();
        assert_eq!(rum.current.full_cases(), 2);
        let beer = ctx
            .stock(&ProductKey::new("Kingfisher", ContainerSize::Ml650))
            .unwrap();
        assert_eq!(beer.current.total_containers(), 17);
    }

    #[test]
    fn test_out_of_range_count_skips_row_not_batch() {
        use crate::broadcast::LocalBus;
        use crate::clock::ManualClock;
        use crate::identity::StaticIdentity;
        use crate::store::MemoryKvStore;
        use std::sync::Arc;

        let ctx = ClientContext::open(
            Arc::new(MemoryKvStore::new()),
            Arc::new(LocalBus::default()),
            Arc::new(StaticIdentity::new("staff-1", "Asha", "office")),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        let rows = [
            json!({"name": "Typo", "size": 750, "cases": 1e18}),
            json!({"name": "Huge", "size": 750, "cases": 1e30}),
            json!({"name": "Good", "size": 750, "cases": 1}),
        ];
        let report = import_rows(&ctx, &rows);
        assert_eq!(report.imported, vec![ProductKey::new("Good", ContainerSize::Ml750)]);
        let indexes: Vec<usize> = report.skipped.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![0, 1]);
        assert!(ctx.stock(&ProductKey::new("Typo", ContainerSize::Ml750)).is_err());
    }

    #[test]
    fn test_export_mirrors_import_shape() {
        let entry = LedgerEntry::with_opening_units(
            ProductKey::new("Old Monk", ContainerSize::Ml750),
            1,
            3,
            Some(5400.0),
            0,
        )
        .unwrap();
        let rows = export_rows(&[entry]);
        let row = &rows[0];
        assert_eq!(row.cases, 1);
        assert_eq!(row.bottles, 3);
        assert_eq!(row.total_servings, 187.5);
        assert_eq!(row.stock_value, Some(6750.0));

        let value = serde_json::to_value(row).unwrap();
        let back = parse_row(&value).unwrap();
        assert_eq!(back.key.name, "Old Monk");
        assert_eq!(back.key.size, ContainerSize::Ml750);
        assert_eq!((back.cases, back.containers), (1, 3));
        assert_eq!(back.cost_per_case, Some(5400.0));
    }
}
