//! Turns a downloaded notebook archive into a searchable PDF.
//!
//! The stages, in pipeline order:
//!
//! 1. [`archive::DocArchive`] — open the downloaded container, read the
//!    metadata and page manifest, expose per-page stroke files.
//! 2. [`page::PageRenderer`] — produce one PDF page per manifest entry
//!    through an injected [`page::StrokeRenderer`] capability.
//! 3. [`ocr::OcrEngine`] — rasterize each PDF page and extract words with
//!    bounding boxes through an [`ocr::OcrBackend`] capability. Best
//!    effort: a failing page degrades to an empty page, never an error.
//! 4. [`enhance`] — write the Info dictionary and overlay the invisible,
//!    positioned text layer so PDF text search highlights the ink.

pub mod archive;
pub mod enhance;
pub mod ocr;
pub mod page;

pub use archive::DocArchive;
pub use enhance::PdfMetadata;
pub use ocr::{DocumentOcr, OcrEngine, PageOcr, WordBox};
pub use page::{BlankStrokeRenderer, PageRenderer, Stroke, StrokeRenderer};
