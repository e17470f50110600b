//! The sync engine: persisted per-notebook state, the incremental sync
//! orchestrator, and the long-running daemon with its HTTP control plane.

pub mod daemon;
mod http;
pub mod orchestrator;
pub mod result;
pub mod state;

pub use daemon::{Daemon, DaemonConfig, DaemonState, SyncRunner};
pub use orchestrator::{Orchestrator, SyncSettings};
pub use result::{DocOutcome, DocumentReport, SyncOutcome};
pub use state::{SyncRecord, SyncState, SyncStatus};
