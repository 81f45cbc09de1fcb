pub mod types;
pub mod error;
pub mod overlay;
pub mod txn;
pub mod standings;
pub mod engine;
pub mod actions;
pub mod progression;
pub mod reconcile;
pub mod snapshot;
#[cfg(test)]
mod test_support;

pub use engine::{BracketEngine, ConflictView, ResolutionDetail, ResolutionStep};
pub use error::{ActionError, ReconcileError, SnapshotError};
pub use overlay::{FieldPatch, OverlayStore, SeedMutation, SetMutation};
pub use snapshot::{parse_event_snapshot, EventSnapshot};
pub use standings::round_robin_standings;
pub use txn::{ActionKind, ConflictReason, ReportPayload, Transaction, TransactionLog};
pub use types::{now_ms, SharedEngine};

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

pub fn shared_engine(engine: BracketEngine) -> SharedEngine {
    Arc::new(Mutex::new(engine))
}

/// Initialize tracing with file + stderr output. The returned guard must
/// stay alive for the duration of the process.
pub fn init_logging(logs_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    fs::create_dir_all(logs_dir).ok();
    let file_appender = tracing_appender::rolling::daily(logs_dir, "bracket-sync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(non_blocking)
        .with_ansi(false)
        .try_init()
        .ok()?;
    info!("bracket cache logging initialized");
    Some(guard)
}
