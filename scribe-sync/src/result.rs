//! Run results and the status snapshot served by the control plane.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The pipeline stage a document is in, for progress and failure context.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DocStage {
    Fetch,
    Extract,
    Render,
    Metadata,
    Ocr,
    Stamp,
    Finalize,
}

impl DocStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Extract => "extract",
            Self::Render => "render",
            Self::Metadata => "metadata",
            Self::Ocr => "ocr",
            Self::Stamp => "stamp",
            Self::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for DocStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub enum DocOutcome {
    Success {
        path: PathBuf,
        /// Count of degraded OCR pages.
        warnings: usize,
    },
    Failed {
        stage: DocStage,
        message: String,
    },
    Skipped,
}

#[derive(Clone, Debug)]
pub struct DocumentReport {
    pub id: String,
    pub name: String,
    pub outcome: DocOutcome,
}

/// Aggregate of one sync run.
#[derive(Clone, Debug)]
pub struct SyncOutcome {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Notebooks in the remote listing (after label filtering).
    pub total_documents: usize,
    /// Documents actually attempted this run.
    pub processed: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
    /// The run observed a cancellation signal and finalized early.
    pub cancelled: bool,
    pub per_document: Vec<DocumentReport>,
}

impl SyncOutcome {
    pub fn summary(&self) -> LastSyncSummary {
        LastSyncSummary {
            start_time: self.started_at,
            end_time: self.ended_at,
            duration: (self.ended_at - self.started_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64(),
            total_documents: self.total_documents,
            processed_documents: self.processed,
            success_count: self.success_count,
            failure_count: self.failure_count,
            skipped_count: self.skipped_count,
        }
    }
}

// --- status snapshot served by GET /status --- //

#[derive(Clone, Debug, Serialize)]
pub struct CurrentSyncStatus {
    pub start_time: DateTime<Utc>,
    pub documents_total: usize,
    pub documents_processed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_document: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LastSyncSummary {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds.
    pub duration: f64,
    pub total_documents: usize,
    pub processed_documents: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub state: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_sync_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_sync: Option<CurrentSyncStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_result: Option<LastSyncSummary>,
}
