//! Final PDF enhancement: the Info dictionary and the invisible,
//! positioned text layer.
//!
//! Both operations rewrite the whole document to a sibling temp file and
//! rename over the original on success, so a crash mid-write leaves the
//! previous PDF intact.

use std::path::Path;

use chrono::{DateTime, Utc};
use lopdf::{
    content::{Content, Operation},
    dictionary, Document, Object, ObjectId, Stream,
};
use scribe_api::Error;
use tracing::debug;

use crate::{
    ocr::DocumentOcr,
    page::{PAGE_HEIGHT_PT, PAGE_WIDTH_PT},
};

/// Producer string stamped into every output PDF.
pub const PRODUCER: &str =
    concat!("scribe ", env!("CARGO_PKG_VERSION"));

/// Resource name of the font used by the invisible layer.
const OCR_FONT_NAME: &str = "ScribeOCR";

/// Values for the PDF Info dictionary.
#[derive(Clone, Debug)]
pub struct PdfMetadata {
    pub title: String,
    /// Joined comma-separated into the Subject field.
    pub tags: Vec<String>,
    pub created: Option<DateTime<Utc>>,
    pub creator: String,
    /// Remote notebook version; embedded so a later sync can verify what
    /// the local file was rendered from.
    pub version: u64,
}

/// Write the Info dictionary of the PDF at `pdf_path`.
pub fn set_metadata(pdf_path: &Path, meta: &PdfMetadata) -> Result<(), Error> {
    let mut doc = load(pdf_path)?;

    let mut info = dictionary! {
        "Title" => Object::string_literal(meta.title.as_str()),
        "Subject" => Object::string_literal(meta.tags.join(", ")),
        "Creator" => Object::string_literal(meta.creator.as_str()),
        "Producer" => Object::string_literal(PRODUCER),
        "NotebookVersion" => meta.version as i64,
    };
    if let Some(created) = meta.created {
        info.set(
            "CreationDate",
            Object::string_literal(
                created.format("D:%Y%m%d%H%M%S").to_string(),
            ),
        );
    }

    let info_id = doc.add_object(info);
    doc.trailer.set("Info", info_id);
    save_atomic(&mut doc, pdf_path)
}

/// Read back the embedded notebook version, if any.
pub fn embedded_version(pdf_path: &Path) -> Result<Option<u64>, Error> {
    let doc = load(pdf_path)?;
    let Ok(info_ref) = doc.trailer.get(b"Info") else {
        return Ok(None);
    };
    let Ok(info_id) = info_ref.as_reference() else {
        return Ok(None);
    };
    let Ok(info) = doc.get_dictionary(info_id) else {
        return Ok(None);
    };
    Ok(info
        .get(b"NotebookVersion")
        .ok()
        .and_then(|v| v.as_i64().ok())
        .map(|v| v as u64))
}

/// Overlay each recognized word as invisible text (rendering mode 3) at
/// its rescaled position, so a text search highlights the ink underneath.
pub fn stamp_text(pdf_path: &Path, ocr: &DocumentOcr) -> Result<(), Error> {
    let mut doc = load(pdf_path)?;
    let pages = doc.get_pages();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    let mut stamped_pages = 0usize;
    for page_ocr in &ocr.pages {
        if page_ocr.words.is_empty()
            || page_ocr.width == 0
            || page_ocr.height == 0
        {
            continue;
        }
        let page_no = (page_ocr.page_index + 1) as u32;
        let Some(&page_id) = pages.get(&page_no) else { continue };

        let (page_w, page_h) = media_box_size(&doc, page_id)
            .unwrap_or((PAGE_WIDTH_PT, PAGE_HEIGHT_PT));
        let pixel_dims = (page_ocr.width, page_ocr.height);

        let mut ops = Vec::with_capacity(page_ocr.words.len() * 6);
        for word in &page_ocr.words {
            let scaled = rescale_bbox(word.bbox, pixel_dims, (page_w, page_h));
            let (x, y, h) = (scaled[0], scaled[1], scaled[3]);
            // PDF origin is bottom-left; bbox origin is top-left.
            let baseline_y = page_h - y - h;
            let font_size = h.max(1.0);

            ops.push(Operation::new("BT", vec![]));
            ops.push(Operation::new("Tr", vec![3.into()]));
            ops.push(Operation::new(
                "Tf",
                vec![OCR_FONT_NAME.into(), font_size.into()],
            ));
            ops.push(Operation::new(
                "Tm",
                vec![
                    1.into(),
                    0.into(),
                    0.into(),
                    1.into(),
                    x.into(),
                    baseline_y.into(),
                ],
            ));
            ops.push(Operation::new(
                "Tj",
                vec![Object::string_literal(word.text.as_str())],
            ));
            ops.push(Operation::new("ET", vec![]));
        }

        let encoded = Content { operations: ops }
            .encode()
            .map_err(|e| Error::parse("encoding text layer", e))?;
        let stream_id = doc.add_object(Stream::new(dictionary! {}, encoded));

        append_page_content(&mut doc, page_id, stream_id)?;
        add_page_font(&mut doc, page_id, font_id)?;
        stamped_pages += 1;
    }

    debug!("Stamped text onto {stamped_pages} pages");
    save_atomic(&mut doc, pdf_path)
}

/// `pixel * (pdf_dimension / pixel_dimension)` along each axis.
pub fn rescale_bbox(
    bbox: [f32; 4],
    pixel_dims: (u32, u32),
    pdf_dims: (f32, f32),
) -> [f32; 4] {
    let sx = pdf_dims.0 / pixel_dims.0 as f32;
    let sy = pdf_dims.1 / pixel_dims.1 as f32;
    [bbox[0] * sx, bbox[1] * sy, bbox[2] * sx, bbox[3] * sy]
}

fn load(pdf_path: &Path) -> Result<Document, Error> {
    Document::load(pdf_path)
        .map_err(|e| Error::parse(format!("pdf {}", pdf_path.display()), e))
}

fn save_atomic(doc: &mut Document, pdf_path: &Path) -> Result<(), Error> {
    let parent = pdf_path.parent().ok_or_else(|| {
        Error::InvalidInput(format!(
            "pdf path {} has no parent directory",
            pdf_path.display()
        ))
    })?;
    let temp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| Error::io("creating pdf temp file", e))?;
    doc.save(temp.path()).map_err(|e| {
        Error::io("writing pdf temp file", std::io::Error::other(e))
    })?;
    temp.persist(pdf_path).map_err(|e| {
        Error::io(format!("renaming over {}", pdf_path.display()), e.error)
    })?;
    Ok(())
}

/// MediaBox width/height for `page_id`, following Parent inheritance.
fn media_box_size(doc: &Document, page_id: ObjectId) -> Option<(f32, f32)> {
    let mut cursor = page_id;
    // Parent chains are shallow; bound the walk anyway.
    for _ in 0..16 {
        let dict = doc.get_dictionary(cursor).ok()?;
        if let Ok(media_box) = dict.get(b"MediaBox") {
            let arr = media_box.as_array().ok()?;
            if arr.len() != 4 {
                return None;
            }
            let nums: Vec<f32> = arr.iter().filter_map(object_to_f32).collect();
            if nums.len() != 4 {
                return None;
            }
            return Some((nums[2] - nums[0], nums[3] - nums[1]));
        }
        cursor = dict.get(b"Parent").ok()?.as_reference().ok()?;
    }
    None
}

fn object_to_f32(obj: &Object) -> Option<f32> {
    match *obj {
        Object::Real(r) => Some(r as f32),
        Object::Integer(i) => Some(i as f32),
        _ => None,
    }
}

/// Append `stream_id` to the page's Contents (single ref or array).
fn append_page_content(
    doc: &mut Document,
    page_id: ObjectId,
    stream_id: ObjectId,
) -> Result<(), Error> {
    let existing = doc
        .get_dictionary(page_id)
        .ok()
        .and_then(|d| d.get(b"Contents").ok().cloned());

    let mut contents: Vec<Object> = match existing {
        Some(Object::Array(items)) => items,
        Some(single @ Object::Reference(_)) => vec![single],
        _ => Vec::new(),
    };
    contents.push(stream_id.into());

    let page = doc
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(|e| Error::parse("page dictionary", e))?;
    page.set("Contents", contents);
    Ok(())
}

/// Ensure the page's Resources maps [`OCR_FONT_NAME`] to our font.
fn add_page_font(
    doc: &mut Document,
    page_id: ObjectId,
    font_id: ObjectId,
) -> Result<(), Error> {
    // Resolve an indirect Resources dict to its target object id first;
    // inline (or missing) Resources are edited on the page itself.
    let resources_ref = doc
        .get_dictionary(page_id)
        .ok()
        .and_then(|d| d.get(b"Resources").ok())
        .and_then(|r| r.as_reference().ok());

    let resources = match resources_ref {
        Some(target) => doc
            .get_object_mut(target)
            .and_then(Object::as_dict_mut)
            .map_err(|e| Error::parse("resources dictionary", e))?,
        None => {
            let page = doc
                .get_object_mut(page_id)
                .and_then(Object::as_dict_mut)
                .map_err(|e| Error::parse("page dictionary", e))?;
            if page.get(b"Resources").and_then(Object::as_dict).is_err() {
                page.set("Resources", dictionary! {});
            }
            page.get_mut(b"Resources")
                .and_then(Object::as_dict_mut)
                .map_err(|e| Error::parse("resources dictionary", e))?
        }
    };

    match resources.get_mut(b"Font").and_then(Object::as_dict_mut) {
        Ok(fonts) => fonts.set(OCR_FONT_NAME, font_id),
        Err(_) => resources.set(
            "Font",
            dictionary! { OCR_FONT_NAME => font_id },
        ),
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use crate::{
        archive::{testutil::standard_archive, DocArchive},
        ocr::{PageOcr, WordBox},
        page::{BlankStrokeRenderer, PageRenderer},
    };

    fn draft_pdf(dir: &Path) -> std::path::PathBuf {
        let archive = DocArchive::open(&standard_archive(dir)).unwrap();
        let out = dir.join("draft.pdf");
        PageRenderer::new(Arc::new(BlankStrokeRenderer))
            .render_document(&archive, &out)
            .unwrap();
        out
    }

    fn meta() -> PdfMetadata {
        PdfMetadata {
            title: "Quarterly notes".into(),
            tags: vec!["work".into(), "q2".into()],
            created: Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap()),
            creator: "scribe".into(),
            version: 7,
        }
    }

    fn info_str(doc: &Document, key: &[u8]) -> String {
        let info_id =
            doc.trailer.get(b"Info").unwrap().as_reference().unwrap();
        let info = doc.get_dictionary(info_id).unwrap();
        String::from_utf8(info.get(key).unwrap().as_str().unwrap().to_vec())
            .unwrap()
    }

    #[test]
    fn metadata_lands_in_the_info_dictionary() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = draft_pdf(dir.path());
        set_metadata(&pdf, &meta()).unwrap();

        let doc = Document::load(&pdf).unwrap();
        assert_eq!(info_str(&doc, b"Title"), "Quarterly notes");
        assert_eq!(info_str(&doc, b"Subject"), "work, q2");
        assert_eq!(info_str(&doc, b"Creator"), "scribe");
        assert_eq!(info_str(&doc, b"CreationDate"), "D:20240501093000");
        assert!(info_str(&doc, b"Producer").starts_with("scribe "));
        assert_eq!(embedded_version(&pdf).unwrap(), Some(7));
    }

    #[test]
    fn stamp_embeds_searchable_text() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = draft_pdf(dir.path());

        let ocr = DocumentOcr {
            pages: vec![PageOcr {
                page_index: 0,
                width: 1755,
                height: 2340,
                words: vec![
                    WordBox {
                        text: "hello".into(),
                        bbox: [100.0, 200.0, 300.0, 60.0],
                        confidence: 90.0,
                    },
                    WordBox {
                        text: "ink".into(),
                        bbox: [500.0, 200.0, 150.0, 60.0],
                        confidence: 80.0,
                    },
                ],
            }],
            warnings: vec![],
        };
        stamp_text(&pdf, &ocr).unwrap();

        let doc = Document::load(&pdf).unwrap();
        let text = doc.extract_text(&[1]).unwrap();
        assert!(text.contains("hello"), "extracted: {text:?}");
        assert!(text.contains("ink"), "extracted: {text:?}");

        // Page 2 had no OCR result and must remain untouched.
        let text2 = doc.extract_text(&[2]).unwrap();
        assert!(!text2.contains("hello"));
    }

    #[test]
    fn stamping_nothing_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = draft_pdf(dir.path());
        let before = std::fs::read(&pdf).unwrap().len();

        stamp_text(&pdf, &DocumentOcr::default()).unwrap();
        let doc = Document::load(&pdf).unwrap();
        assert_eq!(doc.get_pages().len(), 2);
        // Still loadable and roughly the same size (one dangling font
        // object is tolerated).
        let after = std::fs::read(&pdf).unwrap().len();
        assert!(after >= before / 2);
    }

    /// Invariant: pdf_coord = pixel_coord * (pdf_dim / pixel_dim), axis by
    /// axis.
    #[test]
    fn bbox_rescale_is_exact() {
        let scaled =
            rescale_bbox([150.0, 300.0, 75.0, 30.0], (1500, 2000), (450.0, 600.0));
        assert_eq!(scaled, [45.0, 90.0, 22.5, 9.0]);

        // Identity when pixel and pdf spaces coincide.
        let same = rescale_bbox([1.0, 2.0, 3.0, 4.0], (100, 200), (100.0, 200.0));
        assert_eq!(same, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn enhancement_is_atomic_over_the_original() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = draft_pdf(dir.path());
        set_metadata(&pdf, &meta()).unwrap();

        // The file at the original path is the enhanced one; no temp
        // siblings are left behind.
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.ends_with(".pdf"))
            .collect();
        assert_eq!(entries, vec!["draft.pdf".to_string()]);
    }
}
