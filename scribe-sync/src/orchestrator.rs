//! One sync run: enumerate, diff, and push each changed notebook through
//! the staged pipeline.
//!
//! Per-document policy: every stage writes into a scratch directory and
//! the output moves into place only on success, so a failed document
//! leaves the local tree at its prior state. A failed document never
//! aborts the run; auth failures do. Cancellation is checked between
//! documents and between stages/pages within one, so in-flight downloads
//! and OCR calls complete cooperatively.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::Utc;
use scribe_api::{
    auth::AuthClient, remote::sanitize_segment, Document, Error, ErrorKind,
    RemoteClient,
};
use scribe_render::{
    archive::DocArchive,
    enhance::{self, PdfMetadata},
    ocr::{DocumentOcr, OcrEngine},
    page::PageRenderer,
};
use scribe_tokio::ShutdownChannel;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::{
    result::{
        CurrentSyncStatus, DocOutcome, DocStage, DocumentReport, SyncOutcome,
    },
    state::{SyncRecord, SyncState, SyncStatus},
};

/// Creator stamped into output PDFs.
const PDF_CREATOR: &str = "scribe";

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub output_dir: PathBuf,
    pub state_path: PathBuf,
    /// Tag filter for the remote listing; empty means everything.
    pub labels: Vec<String>,
    /// Ignore recorded versions and re-sync everything listed.
    pub force: bool,
}

pub struct Orchestrator {
    auth: Arc<AuthClient>,
    remote: RemoteClient,
    renderer: PageRenderer,
    /// `None` disables the OCR and stamping stages entirely.
    ocr: Option<OcrEngine>,
    settings: SyncSettings,
    progress: Arc<Mutex<Option<CurrentSyncStatus>>>,
}

/// Successful per-document pipeline output.
struct Processed {
    path: PathBuf,
    warnings: usize,
    hash: String,
}

/// Internal routing of per-document errors.
enum DocError {
    /// The run observed the cancellation signal.
    Cancelled,
    /// Aborts the whole run (auth rejection).
    Run(Error),
    /// Recorded against this document; the run continues.
    Doc { stage: DocStage, error: Error },
}

impl DocError {
    fn classify(stage: DocStage, error: Error) -> Self {
        match error.kind() {
            ErrorKind::Auth => Self::Run(error),
            ErrorKind::Cancelled => Self::Cancelled,
            _ => Self::Doc { stage, error },
        }
    }
}

impl Orchestrator {
    pub fn new(
        auth: Arc<AuthClient>,
        remote: RemoteClient,
        renderer: PageRenderer,
        ocr: Option<OcrEngine>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            auth,
            remote,
            renderer,
            ocr,
            settings,
            progress: Arc::new(Mutex::new(None)),
        }
    }

    /// Live progress of the in-flight run, for the status endpoint.
    pub fn progress(&self) -> Option<CurrentSyncStatus> {
        self.progress.lock().expect("progress lock poisoned").clone()
    }

    pub fn is_ready(&self) -> bool {
        self.auth.is_authenticated()
    }

    /// Run one sync. Per-document failures are collected into the
    /// outcome; only auth and enumeration failures abort. A cancellation
    /// finalizes the outcome early with `cancelled = true`.
    #[instrument(skip_all, name = "(sync-run)")]
    pub async fn sync(
        &self,
        cancel: ShutdownChannel,
    ) -> Result<SyncOutcome, Error> {
        let started_at = Utc::now();
        info!("Starting sync run");

        self.auth.ensure_valid_token().await?;
        let remote_docs =
            self.remote.list_documents(&self.settings.labels).await?;
        let mut state = SyncState::load(&self.settings.state_path)?;

        let plan = state.plan(&remote_docs, self.settings.force);
        if !plan.orphaned.is_empty() {
            info!(
                "Retaining {} orphaned notebooks (absent remotely)",
                plan.orphaned.len()
            );
            state.mark_orphans(&plan.orphaned);
            state.save(&self.settings.state_path)?;
        }

        *self.progress.lock().expect("progress lock poisoned") =
            Some(CurrentSyncStatus {
                start_time: started_at,
                documents_total: plan.to_sync.len(),
                documents_processed: 0,
                current_document: None,
                stage: None,
            });

        let mut per_document = Vec::new();
        let mut processed = 0usize;
        let mut success_count = 0usize;
        let mut failure_count = 0usize;
        let mut cancelled = false;

        for doc in &plan.to_sync {
            if cancel.try_recv() {
                cancelled = true;
                break;
            }
            self.set_progress(|p| {
                p.current_document = Some(doc.name.clone());
                p.stage = Some(DocStage::Fetch.to_string());
            });

            match self.process_document(doc, &cancel).await {
                Ok(done) => {
                    processed += 1;
                    success_count += 1;
                    info!(
                        doc_id = %doc.id,
                        path = %done.path.display(),
                        warnings = done.warnings,
                        "Notebook synced"
                    );
                    state.upsert(SyncRecord {
                        id: doc.id.clone(),
                        remote_version: doc.version,
                        remote_modified_at: doc.modified_at,
                        local_path: Some(done.path.clone()),
                        status: SyncStatus::Success,
                        last_synced_at: Some(Utc::now()),
                        failure_message: None,
                        hash: Some(done.hash),
                    });
                    per_document.push(DocumentReport {
                        id: doc.id.clone(),
                        name: doc.name.clone(),
                        outcome: DocOutcome::Success {
                            path: done.path,
                            warnings: done.warnings,
                        },
                    });
                }
                Err(DocError::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(DocError::Run(error)) => {
                    self.clear_progress();
                    if let Err(e) = state.save(&self.settings.state_path) {
                        warn!("Failed to save sync state: {e:#}");
                    }
                    return Err(error);
                }
                Err(DocError::Doc { stage, error }) => {
                    processed += 1;
                    failure_count += 1;
                    let message = format!("{stage}: {error:#}");
                    warn!(
                        doc_id = %doc.id,
                        %stage,
                        "Notebook sync failed: {error:#}"
                    );
                    // Keep the prior successful artifact's path and hash;
                    // the file on disk is still that version.
                    let (prior_path, prior_hash) = match state.get(&doc.id) {
                        Some(r) => (r.local_path.clone(), r.hash.clone()),
                        None => (None, None),
                    };
                    state.upsert(SyncRecord {
                        id: doc.id.clone(),
                        remote_version: doc.version,
                        remote_modified_at: doc.modified_at,
                        local_path: prior_path,
                        status: SyncStatus::Failed,
                        last_synced_at: Some(Utc::now()),
                        failure_message: Some(message.clone()),
                        hash: prior_hash,
                    });
                    per_document.push(DocumentReport {
                        id: doc.id.clone(),
                        name: doc.name.clone(),
                        outcome: DocOutcome::Failed { stage, message },
                    });
                }
            }

            state.save(&self.settings.state_path)?;
            self.set_progress(|p| {
                p.documents_processed = processed;
                p.current_document = None;
                p.stage = None;
            });
        }

        state.save(&self.settings.state_path)?;
        self.clear_progress();

        let outcome = SyncOutcome {
            started_at,
            ended_at: Utc::now(),
            total_documents: remote_docs.len(),
            processed,
            success_count,
            failure_count,
            skipped_count: plan.skipped,
            cancelled,
            per_document,
        };
        info!(
            total = outcome.total_documents,
            processed = outcome.processed,
            success = outcome.success_count,
            failed = outcome.failure_count,
            skipped = outcome.skipped_count,
            cancelled = outcome.cancelled,
            "Sync run finished"
        );
        Ok(outcome)
    }

    async fn process_document(
        &self,
        doc: &Document,
        cancel: &ShutdownChannel,
    ) -> Result<Processed, DocError> {
        // All intermediate artifacts live here and die with the handle.
        let scratch = tempfile::tempdir().map_err(|e| {
            DocError::classify(
                DocStage::Fetch,
                Error::io("creating scratch dir", e),
            )
        })?;

        let archive_path = scratch.path().join("archive.zip");
        self.remote
            .fetch_archive(&doc.id, &archive_path)
            .await
            .map_err(|e| DocError::classify(DocStage::Fetch, e))?;
        if cancel.try_recv() {
            return Err(DocError::Cancelled);
        }

        self.set_stage(DocStage::Extract);
        let archive = DocArchive::open(&archive_path)
            .map_err(|e| DocError::classify(DocStage::Extract, e))?;

        self.set_stage(DocStage::Render);
        let draft = scratch.path().join("draft.pdf");
        let page_count = self
            .renderer
            .render_document(&archive, &draft)
            .map_err(|e| DocError::classify(DocStage::Render, e))?;
        if cancel.try_recv() {
            return Err(DocError::Cancelled);
        }

        self.set_stage(DocStage::Metadata);
        let mut tags = doc.tags.clone();
        for tag in &archive.content.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        enhance::set_metadata(
            &draft,
            &PdfMetadata {
                title: archive.metadata.visible_name.clone(),
                tags,
                created: archive.metadata.created,
                creator: PDF_CREATOR.to_owned(),
                version: doc.version,
            },
        )
        .map_err(|e| DocError::classify(DocStage::Metadata, e))?;

        let mut warnings = 0;
        if let Some(engine) = &self.ocr {
            self.set_stage(DocStage::Ocr);
            let mut doc_ocr = DocumentOcr::default();
            for page_index in 0..page_count {
                if cancel.try_recv() {
                    return Err(DocError::Cancelled);
                }
                let (page, warning) =
                    engine.process_page(&draft, page_index).await;
                doc_ocr.push_page(page, warning);
            }
            self.set_stage(DocStage::Stamp);
            enhance::stamp_text(&draft, &doc_ocr)
                .map_err(|e| DocError::classify(DocStage::Stamp, e))?;
            warnings = doc_ocr.warnings.len();
        }

        self.set_stage(DocStage::Finalize);
        let folder = self
            .remote
            .folder_path(&doc.id)
            .await
            .map_err(|e| DocError::classify(DocStage::Finalize, e))?;
        let file_name = sanitize_segment(&archive.metadata.visible_name)
            .unwrap_or_else(|| "Untitled".to_owned());
        let mut dest_dir = self.settings.output_dir.clone();
        if !folder.is_empty() {
            dest_dir.push(&folder);
        }
        let dest = dest_dir.join(format!("{file_name}.pdf"));
        move_into_place(&draft, &dest)
            .map_err(|e| DocError::classify(DocStage::Finalize, e))?;
        let hash = sha256_file(&dest)
            .map_err(|e| DocError::classify(DocStage::Finalize, e))?;

        Ok(Processed {
            path: dest,
            warnings,
            hash,
        })
    }

    fn set_stage(&self, stage: DocStage) {
        self.set_progress(|p| p.stage = Some(stage.to_string()));
    }

    fn set_progress(&self, update: impl FnOnce(&mut CurrentSyncStatus)) {
        if let Some(progress) = self
            .progress
            .lock()
            .expect("progress lock poisoned")
            .as_mut()
        {
            update(progress);
        }
    }

    fn clear_progress(&self) {
        *self.progress.lock().expect("progress lock poisoned") = None;
    }
}

/// Move `src` over `dest` without ever exposing a partial file at `dest`:
/// plain rename when possible, otherwise copy to a sibling temp in the
/// destination directory and rename that.
fn move_into_place(src: &Path, dest: &Path) -> Result<(), Error> {
    let dest_dir = dest.parent().ok_or_else(|| {
        Error::InvalidInput(format!(
            "output path {} has no parent directory",
            dest.display()
        ))
    })?;
    fs::create_dir_all(dest_dir).map_err(|e| {
        Error::io(format!("creating {}", dest_dir.display()), e)
    })?;

    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }

    // Scratch and output commonly sit on different filesystems.
    let mut temp = tempfile::NamedTempFile::new_in(dest_dir)
        .map_err(|e| Error::io("creating output temp file", e))?;
    let mut reader = fs::File::open(src)
        .map_err(|e| Error::io(format!("opening {}", src.display()), e))?;
    std::io::copy(&mut reader, &mut temp)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| Error::io("copying into output dir", e))?;
    temp.persist(dest).map_err(|e| {
        Error::io(format!("renaming over {}", dest.display()), e.error)
    })?;
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, Error> {
    let bytes = fs::read(path)
        .map_err(|e| Error::io(format!("hashing {}", path.display()), e))?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}
