//! Persisted per-notebook sync records and the incremental diff.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use scribe_api::{Document, Error};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Success,
    Failed,
    /// The notebook disappeared from the remote listing. The local file is
    /// kept; the record is only marked.
    Orphaned,
}

/// Everything we remember about one remote notebook.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SyncRecord {
    pub id: String,
    pub remote_version: u64,
    pub remote_modified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    /// SHA-256 of the produced PDF.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// What one run should do, computed from the remote list and local state.
#[derive(Debug, Default)]
pub struct SyncPlan {
    /// Remote-list order; processing follows it exactly.
    pub to_sync: Vec<Document>,
    pub skipped: usize,
    /// Record ids present locally but absent remotely.
    pub orphaned: Vec<String>,
}

/// The full id -> record map, persisted as one JSON file.
#[derive(Debug, Default)]
pub struct SyncState {
    records: BTreeMap<String, SyncRecord>,
}

impl SyncState {
    /// Load from `path`; an absent file is an empty state.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound =>
                return Ok(Self::default()),
            Err(e) =>
                return Err(Error::io(format!("reading {}", path.display()), e)),
        };
        let records = serde_json::from_slice(&bytes).map_err(|e| {
            Error::parse(format!("sync state {}", path.display()), e)
        })?;
        Ok(Self { records })
    }

    /// Atomically persist to `path` (sibling temp + rename).
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let parent = path.parent().ok_or_else(|| {
            Error::InvalidInput(format!(
                "state path {} has no parent directory",
                path.display()
            ))
        })?;
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("creating {}", parent.display()), e))?;

        let json = serde_json::to_vec_pretty(&self.records)
            .expect("SyncRecord serialization is infallible");
        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| Error::io("creating state temp file", e))?;
        temp.write_all(&json)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| Error::io("writing state temp file", e))?;
        temp.persist(path).map_err(|e| {
            Error::io(format!("renaming over {}", path.display()), e.error)
        })?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&SyncRecord> {
        self.records.get(id)
    }

    pub fn upsert(&mut self, record: SyncRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn all(&self) -> impl Iterator<Item = &SyncRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The diff: a remote document is to-sync iff it has no record, its
    /// record isn't a success, or the remote version/modification time
    /// moved. `force` marks every listed document to-sync.
    pub fn plan(&self, remote: &[Document], force: bool) -> SyncPlan {
        let mut plan = SyncPlan::default();

        for doc in remote {
            let needs_sync = force
                || match self.records.get(&doc.id) {
                    None => true,
                    Some(record) =>
                        record.status != SyncStatus::Success
                            || record.remote_version != doc.version
                            || doc.modified_at > record.remote_modified_at,
                };
            if needs_sync {
                plan.to_sync.push(doc.clone());
            } else {
                plan.skipped += 1;
            }
        }

        let remote_ids: HashSet<&str> =
            remote.iter().map(|d| d.id.as_str()).collect();
        plan.orphaned = self
            .records
            .values()
            .filter(|r| {
                !remote_ids.contains(r.id.as_str())
                    && r.status != SyncStatus::Orphaned
            })
            .map(|r| r.id.clone())
            .collect();

        debug!(
            "Sync plan: {} to sync, {} skipped, {} orphaned",
            plan.to_sync.len(),
            plan.skipped,
            plan.orphaned.len()
        );
        plan
    }

    /// Orphan policy is retention: flip the status, keep record and file.
    pub fn mark_orphans(&mut self, orphaned: &[String]) {
        for id in orphaned {
            if let Some(record) = self.records.get_mut(id) {
                record.status = SyncStatus::Orphaned;
            }
        }
    }
}
