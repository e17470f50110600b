//! PDF page production.
//!
//! The tablet's native page is 1404x1872 px at 226 DPI. Stroke decoding is
//! an injected [`StrokeRenderer`] capability: given one page's stroke file
//! bytes (or its absence), it returns polylines in page-pixel space, which
//! are drawn into the page content stream. A per-page decode failure
//! degrades that page to a blank of native dimensions; the output PDF
//! always has exactly one page per manifest entry, in manifest order.

use std::{path::Path, sync::Arc};

use lopdf::{
    content::{Content, Operation},
    dictionary, Document, Object, Stream,
};
use scribe_api::Error;
use tracing::{debug, warn};

use crate::archive::{DocArchive, Orientation};

/// Native page raster width.
pub const PAGE_WIDTH_PX: u32 = 1404;
/// Native page raster height.
pub const PAGE_HEIGHT_PX: u32 = 1872;
/// Native pen input resolution.
pub const PAGE_DPI: f32 = 226.0;

/// Native page width in PDF points (1404 px * 72 / 226).
pub const PAGE_WIDTH_PT: f32 = 447.292;
/// Native page height in PDF points (1872 px * 72 / 226).
pub const PAGE_HEIGHT_PT: f32 = 596.389;

#[inline]
pub fn px_to_pt(px: f32) -> f32 {
    px * 72.0 / PAGE_DPI
}

/// One decoded pen stroke: a polyline in page-pixel space plus a pen
/// width, also in pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct Stroke {
    pub points: Vec<(f32, f32)>,
    pub width: f32,
}

/// Decodes one page's stroke file into drawable strokes.
///
/// The stroke format is the tablet vendor's proprietary binary encoding;
/// this crate does not prescribe its bytes. `None` input means the page
/// has no stroke file at all (blank on the tablet).
pub trait StrokeRenderer: Send + Sync {
    fn render_page(
        &self,
        stroke_file: Option<&[u8]>,
    ) -> Result<Vec<Stroke>, Error>;
}

/// Renders every page blank. The pipeline remains fully functional with
/// this renderer: pages keep native dimensions and OCR/stamping still run.
pub struct BlankStrokeRenderer;

impl StrokeRenderer for BlankStrokeRenderer {
    fn render_page(
        &self,
        _stroke_file: Option<&[u8]>,
    ) -> Result<Vec<Stroke>, Error> {
        Ok(Vec::new())
    }
}

/// Drives the manifest iteration and assembles the draft PDF.
pub struct PageRenderer {
    strokes: Arc<dyn StrokeRenderer>,
}

impl PageRenderer {
    pub fn new(strokes: Arc<dyn StrokeRenderer>) -> Self {
        Self { strokes }
    }

    /// Render every manifest page of `archive` into a PDF at `out_path`.
    /// Returns the page count.
    pub fn render_document(
        &self,
        archive: &DocArchive,
        out_path: &Path,
    ) -> Result<usize, Error> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let mut kids: Vec<Object> = Vec::new();
        for entry in &archive.content.pages {
            let stroke_file = archive.read_page(&entry.id)?;
            let strokes = match self
                .strokes
                .render_page(stroke_file.as_deref())
            {
                Ok(strokes) => strokes,
                Err(e) => {
                    warn!(
                        page_id = %entry.id,
                        "Stroke rendering failed; substituting a blank \
                         page: {e:#}"
                    );
                    Vec::new()
                }
            };

            let content = Content {
                operations: stroke_operations(&strokes),
            };
            let encoded = content
                .encode()
                .map_err(|e| Error::parse("encoding page content", e))?;
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, encoded));

            let mut page = dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            };
            if archive.content.orientation == Orientation::Landscape {
                page.set("Rotate", 90);
            }
            kids.push(doc.add_object(page).into());
        }

        let page_count = kids.len();
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => page_count as i64,
                "Resources" => dictionary! {},
                "MediaBox" => vec![
                    0f32.into(),
                    0f32.into(),
                    PAGE_WIDTH_PT.into(),
                    PAGE_HEIGHT_PT.into(),
                ],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.compress();

        doc.save(out_path).map_err(|e| {
            Error::io(
                format!("writing {}", out_path.display()),
                std::io::Error::other(e),
            )
        })?;
        debug!("Rendered {page_count} pages to {}", out_path.display());
        Ok(page_count)
    }
}

/// Strokes arrive in pixel space with the origin at the top-left; PDF puts
/// the origin at the bottom-left.
fn stroke_operations(strokes: &[Stroke]) -> Vec<Operation> {
    let mut ops = vec![
        // Round caps and joins, like ink.
        Operation::new("J", vec![1.into()]),
        Operation::new("j", vec![1.into()]),
    ];
    for stroke in strokes {
        let mut points = stroke.points.iter();
        let Some(first) = points.next() else { continue };

        ops.push(Operation::new("w", vec![px_to_pt(stroke.width).into()]));
        ops.push(Operation::new("m", xy(first)));
        for point in points {
            ops.push(Operation::new("l", xy(point)));
        }
        ops.push(Operation::new("S", vec![]));
    }
    ops
}

fn xy(point: &(f32, f32)) -> Vec<Object> {
    vec![
        px_to_pt(point.0).into(),
        (PAGE_HEIGHT_PT - px_to_pt(point.1)).into(),
    ]
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::archive::testutil::{standard_archive, write_archive};

    /// Renders a fixed diagonal on every page that has stroke bytes.
    struct DiagonalRenderer;

    impl StrokeRenderer for DiagonalRenderer {
        fn render_page(
            &self,
            stroke_file: Option<&[u8]>,
        ) -> Result<Vec<Stroke>, Error> {
            Ok(match stroke_file {
                None => Vec::new(),
                Some(_) => vec![Stroke {
                    points: vec![(0.0, 0.0), (1404.0, 1872.0)],
                    width: 4.0,
                }],
            })
        }
    }

    /// Fails on pages that have stroke bytes.
    struct FailingRenderer;

    impl StrokeRenderer for FailingRenderer {
        fn render_page(
            &self,
            stroke_file: Option<&[u8]>,
        ) -> Result<Vec<Stroke>, Error> {
            match stroke_file {
                None => Ok(Vec::new()),
                Some(_) => Err(Error::fatal("undecodable stroke version")),
            }
        }
    }

    fn page_count(pdf: &Path) -> usize {
        Document::load(pdf).unwrap().get_pages().len()
    }

    fn as_f32(obj: &Object) -> f32 {
        match *obj {
            Object::Real(r) => r as f32,
            Object::Integer(i) => i as f32,
            _ => panic!("MediaBox entry is not a number"),
        }
    }

    #[test]
    fn one_page_per_manifest_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = DocArchive::open(&standard_archive(dir.path())).unwrap();
        let out = dir.path().join("draft.pdf");

        let renderer = PageRenderer::new(Arc::new(DiagonalRenderer));
        let rendered = renderer.render_document(&archive, &out).unwrap();
        assert_eq!(rendered, 2);
        assert_eq!(page_count(&out), 2);
    }

    #[test]
    fn pages_have_native_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let archive = DocArchive::open(&standard_archive(dir.path())).unwrap();
        let out = dir.path().join("draft.pdf");
        PageRenderer::new(Arc::new(BlankStrokeRenderer))
            .render_document(&archive, &out)
            .unwrap();

        let doc = Document::load(&out).unwrap();
        let (_, page_id) = doc.get_pages().into_iter().next().unwrap();
        let page = doc.get_dictionary(page_id).unwrap();
        // MediaBox is inherited from the Pages node.
        let parent_id = page.get(b"Parent").unwrap().as_reference().unwrap();
        let pages = doc.get_dictionary(parent_id).unwrap();
        let media_box = pages.get(b"MediaBox").unwrap().as_array().unwrap();
        let w = as_f32(&media_box[2]);
        let h = as_f32(&media_box[3]);
        assert!((w - PAGE_WIDTH_PT).abs() < 0.01, "width {w}");
        assert!((h - PAGE_HEIGHT_PT).abs() < 0.01, "height {h}");
    }

    #[test]
    fn per_page_failure_substitutes_a_blank() {
        let dir = tempfile::tempdir().unwrap();
        // page-1 has stroke bytes (renderer fails on it), page-2 has none.
        let archive = DocArchive::open(&standard_archive(dir.path())).unwrap();
        let out = dir.path().join("draft.pdf");

        let rendered = PageRenderer::new(Arc::new(FailingRenderer))
            .render_document(&archive, &out)
            .unwrap();
        assert_eq!(rendered, 2);
        assert_eq!(page_count(&out), 2);
    }

    #[test]
    fn landscape_sets_page_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.zip");
        write_archive(
            &path,
            &[(
                "doc.content",
                crate::archive::testutil::CONTENT_STRUCTURED.as_bytes(),
            )],
        );
        let archive = DocArchive::open(&path).unwrap();
        let out = dir.path().join("draft.pdf");
        PageRenderer::new(Arc::new(BlankStrokeRenderer))
            .render_document(&archive, &out)
            .unwrap();

        let doc = Document::load(&out).unwrap();
        let (_, page_id) = doc.get_pages().into_iter().next().unwrap();
        let page = doc.get_dictionary(page_id).unwrap();
        assert_eq!(page.get(b"Rotate").unwrap().as_i64().unwrap(), 90);
    }

    #[test]
    fn px_to_pt_matches_native_geometry() {
        assert!((px_to_pt(PAGE_WIDTH_PX as f32) - PAGE_WIDTH_PT).abs() < 0.01);
        assert!(
            (px_to_pt(PAGE_HEIGHT_PX as f32) - PAGE_HEIGHT_PT).abs() < 0.01
        );
        assert!((px_to_pt(226.0) - 72.0).abs() < f32::EPSILON);
    }
}
