//! Authenticated operations against the document storage API.
//!
//! Every operation calls [`AuthClient::ensure_valid_token`] first and uses
//! the context it returns; nothing here caches credentials. No operation
//! retries on its own — transient-error policy belongs to the sync
//! orchestrator.

use std::{path::Path, sync::Arc};

use reqwest::Url;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::{
    auth::AuthClient,
    error::Error,
    models::Document,
    rest::RestClient,
};

/// Current storage host.
pub const DEFAULT_STORAGE_BASE: &str =
    "https://document-storage-production-dot-remarkable-production.appspot.com";
/// Host the listing API still embeds in blob URLs; rewritten by
/// [`crate::UrlRewriter`] to [`DEFAULT_STORAGE_BASE`]'s host.
pub const LEGACY_STORAGE_HOST: &str = "document-storage-production.appspot.com";

const DOCS_PATH: &str = "/document-storage/json/2/docs";

pub struct RemoteClient {
    auth: Arc<AuthClient>,
    rest: RestClient,
    storage_base: Url,
}

impl RemoteClient {
    pub fn new(
        auth: Arc<AuthClient>,
        rest: RestClient,
        storage_base: Url,
    ) -> Self {
        Self {
            auth,
            rest,
            storage_base,
        }
    }

    /// List the remote tree flattened to notebooks.
    ///
    /// Collections are traversed but never emitted. With a non-empty
    /// `label_filter`, a notebook is included iff at least one of its tags
    /// matches any filter value; filtering never prunes the traversal, so
    /// tagged notebooks inside untagged collections are still found.
    pub async fn list_documents(
        &self,
        label_filter: &[String],
    ) -> Result<Vec<Document>, Error> {
        let all = self.list_all().await?;
        let notebooks = all
            .into_iter()
            .filter(Document::is_notebook)
            .filter(|doc| {
                label_filter.is_empty()
                    || doc
                        .tags
                        .iter()
                        .any(|tag| label_filter.iter().any(|f| f == tag))
            })
            .collect::<Vec<_>>();
        debug!("Listed {} notebooks", notebooks.len());
        Ok(notebooks)
    }

    pub async fn get_document(&self, id: &str) -> Result<Document, Error> {
        let ctx = self.auth.ensure_valid_token().await?;
        let url = self.endpoint(DOCS_PATH);
        let resp = self
            .rest
            .send(
                self.rest
                    .client()
                    .get(url)
                    .query(&[("doc", id), ("withBlob", "true")])
                    .bearer_auth(&ctx.bearer),
            )
            .await?;
        let docs: Vec<Document> = resp
            .json()
            .await
            .map_err(|e| Error::parse(format!("document {id}"), e))?;
        docs.into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::NotFound(format!("document {id}")))
    }

    /// Download the notebook archive to `dest_path`, creating parent
    /// directories as needed.
    #[instrument(skip_all, name = "(fetch-archive)", fields(%id))]
    pub async fn fetch_archive(
        &self,
        id: &str,
        dest_path: &Path,
    ) -> Result<(), Error> {
        let doc = self.get_document(id).await?;
        let blob_url = doc.blob_url.ok_or_else(|| {
            Error::NotFound(format!("document {id} has no archive URL"))
        })?;

        // Re-read the context: the blob fetch is its own operation.
        let ctx = self.auth.ensure_valid_token().await?;

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::io(format!("creating {}", parent.display()), e)
            })?;
        }

        let mut resp = self
            .rest
            .send(self.rest.client().get(blob_url).bearer_auth(&ctx.bearer))
            .await?;

        let mut file =
            tokio::fs::File::create(dest_path).await.map_err(|e| {
                Error::io(format!("creating {}", dest_path.display()), e)
            })?;
        let mut total = 0usize;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| Error::transport("reading archive body", e))?
        {
            total += chunk.len();
            file.write_all(&chunk).await.map_err(|e| {
                Error::io(format!("writing {}", dest_path.display()), e)
            })?;
        }
        file.flush().await.map_err(|e| {
            Error::io(format!("flushing {}", dest_path.display()), e)
        })?;
        debug!("Fetched archive: {total} bytes");
        Ok(())
    }

    /// Build the slash-joined folder path of `id`'s ancestor collections,
    /// root first, with each segment sanitized for the local filesystem.
    pub async fn folder_path(&self, id: &str) -> Result<String, Error> {
        let all = self.list_all().await?;
        let by_id: std::collections::HashMap<&str, &Document> =
            all.iter().map(|d| (d.id.as_str(), d)).collect();

        let node = by_id
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("document {id}")))?;

        let mut segments = Vec::new();
        let mut visited = std::collections::HashSet::new();
        visited.insert(node.id.as_str());

        let mut cursor = node.parent_id();
        while let Some(parent_id) = cursor {
            if !visited.insert(parent_id) {
                return Err(Error::CircularHierarchy(parent_id.to_owned()));
            }
            // A dangling parent reference truncates the path at that point.
            let Some(parent) = by_id.get(parent_id) else { break };
            if let Some(segment) = sanitize_segment(&parent.name) {
                segments.push(segment);
            }
            cursor = parent.parent_id();
        }

        segments.reverse();
        Ok(segments.join("/"))
    }

    async fn list_all(&self) -> Result<Vec<Document>, Error> {
        let ctx = self.auth.ensure_valid_token().await?;
        let url = self.endpoint(DOCS_PATH);
        let resp = self
            .rest
            .send(self.rest.client().get(url).bearer_auth(&ctx.bearer))
            .await?;
        resp.json()
            .await
            .map_err(|e| Error::parse("document listing", e))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.storage_base.as_str().trim_end_matches('/'))
    }
}

/// Make a remote name usable as one local path segment.
///
/// `/ \ :` become `-`, `* ? < > |` become `_`, `"` becomes `'`. Returns
/// `None` for segments that sanitize to nothing (or to `.`/`..`), which
/// callers drop from the path.
pub fn sanitize_segment(name: &str) -> Option<String> {
    let mapped: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '-',
            '*' | '?' | '<' | '>' | '|' => '_',
            '"' => '\'',
            c => c,
        })
        .collect();
    let trimmed = mapped.trim();
    match trimmed {
        "" | "." | ".." => None,
        _ => Some(trimmed.to_owned()),
    }
}
