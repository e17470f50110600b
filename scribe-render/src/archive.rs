//! Reading the downloaded notebook archive.
//!
//! An archive is a zip container holding `{id}.metadata` (human title and
//! timestamps), `{id}.content` (the ordered page manifest), and a
//! `{id}/` directory of per-page stroke files. Extraction is scoped to a
//! temp directory owned by the [`DocArchive`] handle and released when the
//! handle drops, on all exit paths.
//!
//! Parsing is tolerant where the data is decorative (a missing
//! `.metadata` degrades to a synthetic "Untitled" record) and fatal where
//! it is structural (a missing `.content`, or any entry whose resolved
//! path escapes the extraction root).

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use scribe_api::Error;
use serde::Deserialize;
use tempfile::TempDir;
use tracing::{debug, warn};

/// Title used when the archive carries no (or unreadable) metadata.
pub const UNTITLED: &str = "Untitled";

#[derive(Clone, Debug)]
pub struct NotebookMetadata {
    pub visible_name: String,
    pub parent: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
}

impl NotebookMetadata {
    fn untitled() -> Self {
        Self {
            visible_name: UNTITLED.to_owned(),
            parent: None,
            last_modified: None,
            created: None,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Orientation {
    #[default]
    Portrait,
    Landscape,
}

/// One manifest entry: a page id and the template it was drawn on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageEntry {
    pub id: String,
    pub template: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NotebookContent {
    pub format_version: u32,
    pub orientation: Orientation,
    /// Ordered page manifest; rendering follows this order exactly.
    pub pages: Vec<PageEntry>,
    pub tags: Vec<String>,
}

/// An opened notebook archive. Owns its extraction directory.
#[derive(Debug)]
pub struct DocArchive {
    root: TempDir,
    doc_id: String,
    pub metadata: NotebookMetadata,
    pub content: NotebookContent,
}

impl DocArchive {
    /// Extract `path` into a scoped temp directory and parse the document
    /// files.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let file = fs::File::open(path)
            .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
        let mut zip = zip::ZipArchive::new(file).map_err(|e| {
            Error::parse(format!("archive {}", path.display()), e)
        })?;

        let root = tempfile::tempdir()
            .map_err(|e| Error::io("creating extraction dir", e))?;
        extract_all(&mut zip, root.path())?;

        let (doc_id, metadata_path, content_path) = locate_files(root.path())?;

        let metadata = match metadata_path {
            Some(p) => parse_metadata(&p).unwrap_or_else(|e| {
                warn!("Unreadable notebook metadata, using defaults: {e:#}");
                NotebookMetadata::untitled()
            }),
            None => {
                debug!("Archive has no .metadata; synthesizing");
                NotebookMetadata::untitled()
            }
        };
        let content = parse_content(&content_path)?;

        Ok(Self {
            root,
            doc_id,
            metadata,
            content,
        })
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Path of the stroke file for `page_id`, if the archive contains one.
    pub fn page_file(&self, page_id: &str) -> Option<PathBuf> {
        let path = self
            .root
            .path()
            .join(&self.doc_id)
            .join(format!("{page_id}.rm"));
        path.is_file().then_some(path)
    }

    /// Stroke bytes for `page_id`; `Ok(None)` when the page has no stroke
    /// file (an empty page on the tablet).
    pub fn read_page(&self, page_id: &str) -> Result<Option<Vec<u8>>, Error> {
        match self.page_file(page_id) {
            None => Ok(None),
            Some(path) => fs::read(&path).map(Some).map_err(|e| {
                Error::io(format!("reading {}", path.display()), e)
            }),
        }
    }
}

/// Extract every entry, rejecting any whose resolved path would escape
/// `root`.
fn extract_all<R: Read + std::io::Seek>(
    zip: &mut zip::ZipArchive<R>,
    root: &Path,
) -> Result<(), Error> {
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| Error::parse(format!("archive entry {index}"), e))?;

        let Some(relative) = entry.enclosed_name() else {
            return Err(Error::fatal(format!(
                "archive entry {:?} escapes the extraction root",
                entry.name()
            )));
        };
        let dest = root.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&dest).map_err(|e| {
                Error::io(format!("creating {}", dest.display()), e)
            })?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::io(format!("creating {}", parent.display()), e)
            })?;
        }
        let mut out = fs::File::create(&dest).map_err(|e| {
            Error::io(format!("creating {}", dest.display()), e)
        })?;
        std::io::copy(&mut entry, &mut out).map_err(|e| {
            Error::io(format!("extracting {}", dest.display()), e)
        })?;
    }
    Ok(())
}

/// Locate `*.metadata` and `*.content` at the top level of the extraction
/// root. The `.content` file names the document id and is required.
fn locate_files(
    root: &Path,
) -> Result<(String, Option<PathBuf>, PathBuf), Error> {
    let mut metadata = None;
    let mut content = None;

    let entries = fs::read_dir(root)
        .map_err(|e| Error::io("listing extraction root", e))?;
    for entry in entries {
        let path = entry
            .map_err(|e| Error::io("listing extraction root", e))?
            .path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("metadata") => metadata = Some(path),
            Some("content") => content = Some(path),
            _ => {}
        }
    }

    let content = content
        .ok_or_else(|| Error::fatal("archive has no .content manifest"))?;
    let doc_id = content
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::fatal("unusable .content file name"))?
        .to_owned();
    Ok((doc_id, metadata, content))
}

// --- raw wire shapes --- //

/// Timestamps arrive as epoch milliseconds, as a string from older tablet
/// firmware and as a number from newer.
#[derive(Deserialize)]
#[serde(untagged)]
enum EpochMillis {
    Text(String),
    Number(i64),
}

impl EpochMillis {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let millis = match self {
            Self::Text(s) => s.parse::<i64>().ok()?,
            Self::Number(n) => *n,
        };
        DateTime::<Utc>::from_timestamp_millis(millis)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    visible_name: Option<String>,
    #[serde(default)]
    parent: Option<String>,
    last_modified: Option<EpochMillis>,
    created_time: Option<EpochMillis>,
}

/// Content tags: bare strings from older firmware, `{name, timestamp}`
/// objects from newer.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawTag {
    Plain(String),
    Rich { name: String },
}

#[derive(Deserialize)]
struct RawTemplate {
    value: Option<String>,
}

#[derive(Deserialize)]
struct RawStructuredPage {
    id: String,
    template: Option<RawTemplate>,
}

#[derive(Deserialize)]
struct RawStructuredPages {
    pages: Vec<RawStructuredPage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContent {
    #[serde(default)]
    format_version: Option<u32>,
    #[serde(default)]
    orientation: Option<String>,
    /// Flat manifest (format version 1).
    #[serde(default)]
    pages: Option<Vec<String>>,
    /// Structured manifest (format version 2+).
    #[serde(default, rename = "cPages")]
    c_pages: Option<RawStructuredPages>,
    #[serde(default)]
    tags: Vec<RawTag>,
}

fn parse_metadata(path: &Path) -> Result<NotebookMetadata, Error> {
    let bytes = fs::read(path)
        .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    let raw: RawMetadata = serde_json::from_slice(&bytes)
        .map_err(|e| Error::parse("notebook metadata", e))?;

    Ok(NotebookMetadata {
        visible_name: raw
            .visible_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| UNTITLED.to_owned()),
        parent: raw.parent.filter(|p| !p.is_empty()),
        last_modified: raw.last_modified.and_then(|m| m.to_datetime()),
        created: raw.created_time.and_then(|m| m.to_datetime()),
    })
}

fn parse_content(path: &Path) -> Result<NotebookContent, Error> {
    let bytes = fs::read(path)
        .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    let raw: RawContent = serde_json::from_slice(&bytes)
        .map_err(|e| Error::parse("notebook content manifest", e))?;

    let pages = match (raw.c_pages, raw.pages) {
        (Some(structured), _) => structured
            .pages
            .into_iter()
            .map(|p| PageEntry {
                id: p.id,
                template: p.template.and_then(|t| t.value),
            })
            .collect(),
        (None, Some(flat)) => flat
            .into_iter()
            .map(|id| PageEntry { id, template: None })
            .collect(),
        (None, None) =>
            return Err(Error::fatal("content manifest lists no pages")),
    };

    let orientation = match raw.orientation.as_deref() {
        Some("landscape") => Orientation::Landscape,
        _ => Orientation::Portrait,
    };

    Ok(NotebookContent {
        format_version: raw.format_version.unwrap_or(1),
        orientation,
        pages,
        tags: raw
            .tags
            .into_iter()
            .map(|t| match t {
                RawTag::Plain(name) | RawTag::Rich { name } => name,
            })
            .collect(),
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::io::Write;

    use zip::write::SimpleFileOptions;

    /// Build an archive zip on disk from `(entry_name, bytes)` pairs.
    pub fn write_archive(
        path: &std::path::Path,
        entries: &[(&str, &[u8])],
    ) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, bytes) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap();
    }

    pub const METADATA: &str = r#"{
        "visibleName": "Quarterly notes",
        "parent": "folder-1",
        "lastModified": "1714567890000",
        "createdTime": 1714000000000
    }"#;

    pub const CONTENT_FLAT: &str = r#"{
        "formatVersion": 1,
        "orientation": "portrait",
        "pages": ["page-1", "page-2"],
        "tags": ["work"]
    }"#;

    pub const CONTENT_STRUCTURED: &str = r#"{
        "formatVersion": 2,
        "orientation": "landscape",
        "cPages": {
            "pages": [
                {"id": "page-1", "template": {"value": "Blank"}},
                {"id": "page-2", "template": {"value": "LinesSmall"}},
                {"id": "page-3"}
            ]
        },
        "tags": [{"name": "work"}, {"name": "q2"}]
    }"#;

    /// A complete two-page archive with stroke data for page-1 only.
    pub fn standard_archive(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("doc-1.zip");
        write_archive(
            &path,
            &[
                ("doc-1.metadata", METADATA.as_bytes()),
                ("doc-1.content", CONTENT_FLAT.as_bytes()),
                ("doc-1/page-1.rm", b"stroke-bytes-1"),
            ],
        );
        path
    }
}

#[cfg(test)]
mod test {
    use scribe_api::ErrorKind;

    use super::{testutil::*, *};

    #[test]
    fn open_parses_metadata_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let archive = DocArchive::open(&standard_archive(dir.path())).unwrap();

        assert_eq!(archive.doc_id(), "doc-1");
        assert_eq!(archive.metadata.visible_name, "Quarterly notes");
        assert_eq!(archive.metadata.parent.as_deref(), Some("folder-1"));
        assert!(archive.metadata.last_modified.is_some());
        assert!(archive.metadata.created.is_some());

        assert_eq!(archive.content.format_version, 1);
        assert_eq!(archive.content.orientation, Orientation::Portrait);
        assert_eq!(archive.content.tags, vec!["work".to_string()]);
        let ids: Vec<_> =
            archive.content.pages.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["page-1", "page-2"]);

        assert_eq!(
            archive.read_page("page-1").unwrap().as_deref(),
            Some(b"stroke-bytes-1".as_slice())
        );
        assert_eq!(archive.read_page("page-2").unwrap(), None);
    }

    #[test]
    fn structured_manifest_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc-2.zip");
        write_archive(
            &path,
            &[("doc-2.content", CONTENT_STRUCTURED.as_bytes())],
        );
        let archive = DocArchive::open(&path).unwrap();

        assert_eq!(archive.content.format_version, 2);
        assert_eq!(archive.content.orientation, Orientation::Landscape);
        assert_eq!(archive.content.pages.len(), 3);
        assert_eq!(
            archive.content.pages[0],
            PageEntry {
                id: "page-1".into(),
                template: Some("Blank".into())
            }
        );
        assert_eq!(archive.content.pages[2].template, None);
        assert_eq!(
            archive.content.tags,
            vec!["work".to_string(), "q2".to_string()]
        );
    }

    #[test]
    fn missing_metadata_degrades_to_untitled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc-3.zip");
        write_archive(&path, &[("doc-3.content", CONTENT_FLAT.as_bytes())]);

        let archive = DocArchive::open(&path).unwrap();
        assert_eq!(archive.metadata.visible_name, UNTITLED);
    }

    #[test]
    fn missing_content_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc-4.zip");
        write_archive(&path, &[("doc-4.metadata", METADATA.as_bytes())]);

        let err = DocArchive::open(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn traversal_entries_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evil.zip");
        write_archive(
            &path,
            &[
                ("doc-5.content", CONTENT_FLAT.as_bytes()),
                ("../escape.txt", b"gotcha"),
            ],
        );

        let err = DocArchive::open(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        // Nothing may have landed outside an extraction root; the only
        // place it could go from this zip is next to our archive dir.
        assert!(!dir.path().join("escape.txt").exists());
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn extraction_dir_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let archive = DocArchive::open(&standard_archive(dir.path())).unwrap();
        let root = archive.root.path().to_owned();
        assert!(root.is_dir());
        drop(archive);
        assert!(!root.exists());
    }

    #[test]
    fn empty_page_list_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc-6.zip");
        write_archive(&path, &[("doc-6.content", br#"{"formatVersion":1}"#)]);

        let err = DocArchive::open(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }
}
