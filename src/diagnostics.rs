//! Diagnostics for Peg Ledger.
//!
//! Provides:
//! - **About info**: version, platform
//! - **Data/log directory resolution**: `PEG_LEDGER_DATA_DIR` or the
//!   platform local data directory
//! - **System health**: schema version, last flush, pending sync, servings
//!   sold, flagged discrepancies
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::warn;

use crate::context::ClientContext;
use crate::db::DbState;
use crate::error::LedgerResult;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "PEG_LEDGER_DATA_DIR";

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "peg-ledger";

const APP_DIR_NAME: &str = "peg-ledger";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

pub fn get_about_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Directories
// ---------------------------------------------------------------------------

/// Data directory: `$PEG_LEDGER_DATA_DIR` when set, otherwise the platform
/// local data directory.
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir.trim());
        }
    }
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_DIR_NAME)
}

pub fn get_log_dir() -> PathBuf {
    get_data_dir().join("logs")
}

// ---------------------------------------------------------------------------
// System health
// ---------------------------------------------------------------------------

pub fn get_system_health(db: &DbState, ctx: &ClientContext) -> LedgerResult<Value> {
    let last_flush = db.last_flush()?;
    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);
    let report = ctx.discrepancy_report()?;
    let products = ctx.products()?.len();
    let servings_sold = ctx.accounting()?.servings_sold();

    Ok(json!({
        "clientId": ctx.client_id(),
        "schemaVersion": db.schema_version(),
        "dbSizeBytes": db_size,
        "online": ctx.is_online(),
        "pendingSync": ctx.pending_sync_count(),
        "syncIncomplete": ctx.sync_incomplete(),
        "lastFlush": last_flush.map(|(at, ok)| json!({ "at": at, "ok": ok })),
        "products": products,
        "servingsSold": servings_sold,
        "flaggedDiscrepancies": report.flagged_count,
    }))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Prune old log files in `log_dir`, keeping only the most recent
/// `MAX_LOG_FILES`. Returns how many were removed.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
