//! Error taxonomy for the ledger, queue and sync paths.
//!
//! Every mutation returns either updated state or one of these variants;
//! callers decide whether a variant is fatal (it rarely is: `OutOfStock`
//! carries a partial result, `StaleWrite` is dropped after logging).

use thiserror::Error;

use crate::ledger::ProductKey;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Malformed import row, unrecognized container size, missing reason.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("out of stock: {product} (fulfilled {fulfilled} of {requested})")]
    OutOfStock {
        product: ProductKey,
        requested: u32,
        fulfilled: u32,
    },

    #[error("unknown product: {0}")]
    UnknownProduct(ProductKey),

    /// Room update superseded by a newer write.
    #[error("stale write for room {room_id}: incoming {incoming} < last updated {last_updated}")]
    StaleWrite {
        room_id: String,
        incoming: i64,
        last_updated: i64,
    },

    #[error("replay failed for queued mutation {mutation_id}: {reason}")]
    ReplayFailure { mutation_id: String, reason: String },

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("codec error: {0}")]
    Codec(String),

    /// Background task panicked, was cancelled or timed out.
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Codec(e.to_string())
    }
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        LedgerError::Validation(msg.into())
    }

    /// Short machine-readable code, used in activity details and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "VALIDATION_ERROR",
            LedgerError::OutOfStock { .. } => "OUT_OF_STOCK",
            LedgerError::UnknownProduct(_) => "UNKNOWN_PRODUCT",
            LedgerError::StaleWrite { .. } => "STALE_WRITE",
            LedgerError::ReplayFailure { .. } => "REPLAY_FAILURE",
            LedgerError::Persistence(_) => "PERSISTENCE_FAILURE",
            LedgerError::Storage(_) => "STORAGE_ERROR",
            LedgerError::Codec(_) => "CODEC_ERROR",
            LedgerError::Task(_) => "TASK_FAILURE",
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::ContainerSize;

    #[test]
    fn test_out_of_stock_message_reports_partial_fulfillment() {
        let err = LedgerError::OutOfStock {
            product: ProductKey::new("Old Monk", ContainerSize::Ml750),
            requested: 5,
            fulfilled: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("Old Monk"));
        assert!(msg.contains("fulfilled 2 of 5"));
        assert_eq!(err.code(), "OUT_OF_STOCK");
    }

    #[test]
    fn test_json_errors_map_to_codec() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: LedgerError = parse.unwrap_err().into();
        assert_eq!(err.code(), "CODEC_ERROR");
    }
}
