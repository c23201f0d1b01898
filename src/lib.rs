//! Peg Ledger: bar inventory tracked in cases, containers and 60 ml pegs,
//! with per-client offline queues, room status and snapshot broadcast
//! between clients on the same site.

pub mod accounting;
pub mod activity;
pub mod broadcast;
pub mod clock;
pub mod context;
pub mod db;
pub mod diagnostics;
pub mod dispenser;
pub mod error;
pub mod identity;
pub mod import;
pub mod ledger;
pub mod offline_queue;
pub mod persistence;
pub mod reconciliation;
pub mod replay;
pub mod rooms;
pub mod settings;
pub mod stock;
pub mod store;
pub mod units;

use std::path::Path;

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use context::{ClientContext, MutationOutcome};
pub use error::{LedgerError, LedgerResult};
pub use ledger::{LedgerEntry, ProductKey};
pub use rooms::RoomStatus;
pub use units::ContainerSize;

/// Initialize structured logging: console plus a daily rolling file in
/// `log_dir`. `RUST_LOG` overrides the default filter.
pub fn init_logging(log_dir: &Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,peg_ledger_lib=debug"));

    // Prune old log files before setting up the appender
    std::fs::create_dir_all(log_dir).ok();
    diagnostics::prune_old_logs(log_dir);

    let file_appender =
        tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);

    // A second init (tests, embedding) keeps the first subscriber.
    if tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        return;
    }

    // Dropping the guard flushes and stops the writer; it lives until exit.
    std::mem::forget(guard);

    info!("Starting Peg Ledger v{}", env!("CARGO_PKG_VERSION"));
}
