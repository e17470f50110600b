//! Best-effort OCR over rendered PDF pages.
//!
//! Two injected capabilities:
//!
//! - [`PageRasterizer`] turns one PDF page into a 300 DPI PNG.
//! - [`OcrBackend`] turns that PNG into raw model output text, which is
//!   parsed tolerantly: a malformed response reads as an empty page, never
//!   as a failure. OCR must not block document-level success.
//!
//! Bounding boxes come back in the pixel space of the rasterized page;
//! [`crate::enhance`] rescales them into PDF space when stamping.

use std::{path::Path, process::Stdio, sync::Arc};

use async_trait::async_trait;
use base64::Engine;
use scribe_api::{rest::backoff, Error, RestClient};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

/// Rasterization density for OCR input.
pub const OCR_DPI: u16 = 300;
/// Bounded retries for transient backend failures.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// One recognized word. `bbox` is `[x, y, w, h]` in rasterized-page
/// pixels; `confidence` is rescaled to 0-100.
#[derive(Clone, Debug, PartialEq)]
pub struct WordBox {
    pub text: String,
    pub bbox: [f32; 4],
    pub confidence: f32,
}

#[derive(Clone, Debug, Default)]
pub struct PageOcr {
    pub page_index: usize,
    /// Rasterized page width in pixels.
    pub width: u32,
    /// Rasterized page height in pixels.
    pub height: u32,
    pub words: Vec<WordBox>,
}

impl PageOcr {
    fn empty(page_index: usize) -> Self {
        Self {
            page_index,
            ..Self::default()
        }
    }
}

/// Per-document aggregation of page results.
#[derive(Clone, Debug, Default)]
pub struct DocumentOcr {
    pub pages: Vec<PageOcr>,
    /// One entry per degraded page.
    pub warnings: Vec<String>,
}

impl DocumentOcr {
    pub fn push_page(&mut self, page: PageOcr, warning: Option<String>) {
        self.pages.push(page);
        if let Some(warning) = warning {
            warn!("{warning}");
            self.warnings.push(warning);
        }
    }

    pub fn word_count(&self) -> usize {
        self.pages.iter().map(|p| p.words.len()).sum()
    }

    /// Mean word confidence, weighted by each page's word count.
    pub fn mean_confidence(&self) -> f32 {
        let count = self.word_count();
        if count == 0 {
            return 0.0;
        }
        let total: f32 = self
            .pages
            .iter()
            .flat_map(|p| p.words.iter())
            .map(|w| w.confidence)
            .sum();
        total / count as f32
    }
}

/// Rasterizes one page of a PDF to PNG bytes.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    async fn rasterize(
        &self,
        pdf_path: &Path,
        page_index: usize,
        dpi: u16,
    ) -> Result<Vec<u8>, Error>;
}

/// Shells out to poppler's `pdftoppm`, reading the PNG from stdout.
pub struct PdftoppmRasterizer;

#[async_trait]
impl PageRasterizer for PdftoppmRasterizer {
    async fn rasterize(
        &self,
        pdf_path: &Path,
        page_index: usize,
        dpi: u16,
    ) -> Result<Vec<u8>, Error> {
        // pdftoppm numbers pages from 1.
        let page_no = (page_index + 1).to_string();
        let output = tokio::process::Command::new("pdftoppm")
            .arg("-png")
            .args(["-r", &dpi.to_string()])
            .args(["-f", &page_no, "-l", &page_no])
            .arg(pdf_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::io("spawning pdftoppm", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::fatal(format!(
                "pdftoppm exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Produces raw model output for one page image.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    async fn recognize(&self, png: &[u8]) -> Result<String, Error>;
}

/// The JSON shape the model is instructed to return.
const OCR_PROMPT: &str = "You are an OCR engine for handwritten notes. \
Identify every legible word in the image. Respond with JSON only, no \
prose, in exactly this shape: {\"words\":[{\"text\":\"...\",\"bbox\":\
[x,y,w,h],\"confidence\":0.0}]}. Coordinates are pixels from the \
top-left of the image; confidence is between 0 and 1. If the page is \
blank, respond {\"words\":[]}.";

/// An OpenAI-compatible vision chat backend.
///
/// The API key is read only from [`Self::API_KEY_ENV`] and never
/// persisted anywhere.
pub struct VisionModelBackend {
    rest: RestClient,
    base_url: String,
    model: String,
    api_key: String,
}

impl VisionModelBackend {
    pub const API_KEY_ENV: &'static str = "OPENAI_API_KEY";

    pub fn from_env(
        rest: RestClient,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, Error> {
        let api_key = std::env::var(Self::API_KEY_ENV).map_err(|_| {
            Error::InvalidInput(format!(
                "OCR requires the {} environment variable (or pass --no-ocr)",
                Self::API_KEY_ENV
            ))
        })?;
        Ok(Self {
            rest,
            base_url: base_url.into(),
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl OcrBackend for VisionModelBackend {
    async fn recognize(&self, png: &[u8]) -> Result<String, Error> {
        let image_b64 =
            base64::engine::general_purpose::STANDARD.encode(png);
        let body = serde_json::json!({
            "model": self.model,
            // Deterministic output.
            "temperature": 0.0,
            "response_format": {"type": "json_object"},
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": OCR_PROMPT},
                    {"type": "image_url", "image_url": {
                        "url": format!("data:image/png;base64,{image_b64}"),
                    }},
                ],
            }],
        });

        let url = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let resp = self
            .rest
            .send(
                self.rest
                    .client()
                    .post(url)
                    .bearer_auth(&self.api_key)
                    .json(&body),
            )
            .await?;

        #[derive(Deserialize)]
        struct Completion {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct Message {
            content: String,
        }

        let completion: Completion = resp
            .json()
            .await
            .map_err(|e| Error::parse("vision model response", e))?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| Error::parse_msg("vision model returned no choices"))
    }
}

pub struct OcrEngine {
    rasterizer: Arc<dyn PageRasterizer>,
    backend: Arc<dyn OcrBackend>,
    max_retries: usize,
}

impl OcrEngine {
    pub fn new(
        rasterizer: Arc<dyn PageRasterizer>,
        backend: Arc<dyn OcrBackend>,
    ) -> Self {
        Self {
            rasterizer,
            backend,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// OCR one page. Never fails: any unrecoverable problem degrades the
    /// page to an empty result and explains itself in the returned
    /// warning.
    #[instrument(skip_all, name = "(ocr-page)", fields(%page_index))]
    pub async fn process_page(
        &self,
        pdf_path: &Path,
        page_index: usize,
    ) -> (PageOcr, Option<String>) {
        let png = match self
            .rasterizer
            .rasterize(pdf_path, page_index, OCR_DPI)
            .await
        {
            Ok(png) => png,
            Err(e) => {
                let warning =
                    format!("page {page_index}: rasterization failed: {e:#}");
                return (PageOcr::empty(page_index), Some(warning));
            }
        };

        let (width, height) = match png_dimensions(&png) {
            Ok(dims) => dims,
            Err(e) => {
                let warning =
                    format!("page {page_index}: unreadable raster: {e:#}");
                return (PageOcr::empty(page_index), Some(warning));
            }
        };

        let raw = match self.recognize_with_retries(&png).await {
            Ok(raw) => raw,
            Err(e) => {
                let warning =
                    format!("page {page_index}: OCR backend failed: {e:#}");
                return (PageOcr::empty(page_index), Some(warning));
            }
        };

        let (words, malformed) = parse_words(&raw);
        debug!("Recognized {} words", words.len());
        let warning = malformed.map(|detail| {
            format!("page {page_index}: malformed OCR response: {detail}")
        });
        let page = PageOcr {
            page_index,
            width,
            height,
            words,
        };
        (page, warning)
    }

    /// Transient transport errors are retried with exponential spacing;
    /// anything else returns immediately.
    async fn recognize_with_retries(
        &self,
        png: &[u8],
    ) -> Result<String, Error> {
        let mut backoff_iter = backoff::iter();
        for _ in 0..self.max_retries {
            match self.backend.recognize(png).await {
                Ok(raw) => return Ok(raw),
                Err(e) if e.is_transient() => {
                    debug!("Retrying OCR after transient error: {e:#}");
                    tokio::time::sleep(backoff_iter.next().unwrap()).await;
                }
                Err(e) => return Err(e),
            }
        }
        self.backend.recognize(png).await
    }
}

fn png_dimensions(png: &[u8]) -> Result<(u32, u32), Error> {
    image::ImageReader::new(std::io::Cursor::new(png))
        .with_guessed_format()
        .map_err(|e| Error::io("probing raster format", e))?
        .into_dimensions()
        .map_err(|e| Error::parse("decoding raster dimensions", e))
}

/// Tolerant parse of the model's word list.
///
/// Returns the words plus `Some(reason)` when the response had to be
/// discarded: not JSON, no `words` field, or any word with a bbox shorter
/// than 4 elements. An explicitly empty `words` list is a legitimately
/// blank page, not a warning.
fn parse_words(raw: &str) -> (Vec<WordBox>, Option<String>) {
    #[derive(Deserialize)]
    struct RawResponse {
        words: Option<Vec<RawWord>>,
    }
    #[derive(Deserialize)]
    struct RawWord {
        text: Option<String>,
        bbox: Option<Vec<f64>>,
        confidence: Option<f64>,
    }

    // Models occasionally wrap the JSON in a markdown fence; parse the
    // outermost object.
    let json = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => return (Vec::new(), Some("no JSON object in response".into())),
    };

    let parsed: RawResponse = match serde_json::from_str(json) {
        Ok(parsed) => parsed,
        Err(e) => return (Vec::new(), Some(format!("invalid JSON: {e}"))),
    };
    let Some(raw_words) = parsed.words else {
        return (Vec::new(), Some("response has no \"words\" field".into()));
    };

    let mut words = Vec::with_capacity(raw_words.len());
    for raw_word in raw_words {
        let text = raw_word.text.unwrap_or_default();
        let Some(bbox) = raw_word.bbox.filter(|b| b.len() >= 4) else {
            return (Vec::new(), Some("word with short bbox".into()));
        };
        if text.is_empty() {
            return (Vec::new(), Some("word with empty text".into()));
        }
        let confidence =
            (raw_word.confidence.unwrap_or(0.0).clamp(0.0, 1.0) * 100.0) as f32;
        words.push(WordBox {
            text,
            bbox: [
                bbox[0] as f32,
                bbox[1] as f32,
                bbox[2] as f32,
                bbox[3] as f32,
            ],
            confidence,
        });
    }
    (words, None)
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// A valid 2x3 PNG.
    fn tiny_png() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(
            2,
            3,
            image::Rgba([255, 255, 255, 255]),
        );
        let mut bytes = Vec::new();
        img.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();
        bytes
    }

    struct FakeRasterizer;

    #[async_trait]
    impl PageRasterizer for FakeRasterizer {
        async fn rasterize(
            &self,
            _pdf: &Path,
            _page_index: usize,
            _dpi: u16,
        ) -> Result<Vec<u8>, Error> {
            Ok(tiny_png())
        }
    }

    /// Fails with transport errors `failures` times, then returns `raw`.
    struct FlakyBackend {
        raw: String,
        failures: usize,
        calls: AtomicUsize,
    }

    impl FlakyBackend {
        fn new(raw: &str, failures: usize) -> Self {
            Self {
                raw: raw.to_owned(),
                failures,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl OcrBackend for FlakyBackend {
        async fn recognize(&self, _png: &[u8]) -> Result<String, Error> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(Error::transport(
                    "vision model",
                    std::io::Error::other("connection reset"),
                ))
            } else {
                Ok(self.raw.clone())
            }
        }
    }

    fn engine(backend: FlakyBackend) -> OcrEngine {
        OcrEngine::new(Arc::new(FakeRasterizer), Arc::new(backend))
    }

    const GOOD: &str = r#"{"words":[
        {"text":"hello","bbox":[10,20,80,30],"confidence":0.9},
        {"text":"world","bbox":[100,20,90,30],"confidence":0.5}
    ]}"#;

    #[test]
    fn parse_good_response() {
        let (words, warning) = parse_words(GOOD);
        assert!(warning.is_none());
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "hello");
        assert_eq!(words[0].bbox, [10.0, 20.0, 80.0, 30.0]);
        assert!((words[0].confidence - 90.0).abs() < 0.001);
        assert!((words[1].confidence - 50.0).abs() < 0.001);
    }

    #[test]
    fn parse_tolerates_markdown_fences() {
        let fenced = format!("```json\n{GOOD}\n```");
        let (words, warning) = parse_words(&fenced);
        assert!(warning.is_none());
        assert_eq!(words.len(), 2);
    }

    #[test]
    fn malformed_responses_read_as_empty_pages() {
        let cases = [
            "not json at all",
            r#"{"sentences":[]}"#,
            r#"{"words":[{"text":"x","bbox":[1,2,3],"confidence":1}]}"#,
            r#"{"words":[{"bbox":[1,2,3,4],"confidence":1}]}"#,
        ];
        for raw in cases {
            let (words, warning) = parse_words(raw);
            assert!(words.is_empty(), "input: {raw}");
            assert!(warning.is_some(), "input: {raw}");
        }
    }

    #[test]
    fn blank_page_is_not_a_warning() {
        let (words, warning) = parse_words(r#"{"words":[]}"#);
        assert!(words.is_empty());
        assert!(warning.is_none());
    }

    #[test]
    fn confidence_is_clamped() {
        let raw = r#"{"words":[
            {"text":"a","bbox":[0,0,1,1],"confidence":7.0},
            {"text":"b","bbox":[0,0,1,1],"confidence":-2.0}
        ]}"#;
        let (words, _) = parse_words(raw);
        assert_eq!(words[0].confidence, 100.0);
        assert_eq!(words[1].confidence, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let engine = engine(FlakyBackend::new(GOOD, 2));
        let (page, warning) =
            engine.process_page(Path::new("unused.pdf"), 0).await;
        assert!(warning.is_none());
        assert_eq!(page.words.len(), 2);
        assert_eq!(page.width, 2);
        assert_eq!(page.height, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_degrades_to_empty_page() {
        let engine = engine(FlakyBackend::new(GOOD, 99));
        let (page, warning) =
            engine.process_page(Path::new("unused.pdf"), 1).await;
        assert!(page.words.is_empty());
        assert_eq!(page.page_index, 1);
        let warning = warning.unwrap();
        assert!(warning.contains("page 1"), "warning: {warning}");
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_backend_error_is_not_retried() {
        struct AuthFailBackend(AtomicUsize);
        #[async_trait]
        impl OcrBackend for AuthFailBackend {
            async fn recognize(&self, _png: &[u8]) -> Result<String, Error> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(Error::Auth("bad API key".into()))
            }
        }

        let backend = Arc::new(AuthFailBackend(AtomicUsize::new(0)));
        let backend_dyn: Arc<dyn OcrBackend> = Arc::clone(&backend) as Arc<dyn OcrBackend>;
        let engine = OcrEngine::new(Arc::new(FakeRasterizer), backend_dyn);
        let (page, warning) =
            engine.process_page(Path::new("unused.pdf"), 0).await;
        assert!(page.words.is_empty());
        assert!(warning.is_some());
        assert_eq!(backend.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn document_aggregation() {
        let engine = engine(FlakyBackend::new(GOOD, 0));
        let mut doc = DocumentOcr::default();

        let (page, warning) =
            engine.process_page(Path::new("unused.pdf"), 0).await;
        doc.push_page(page, warning);
        doc.push_page(PageOcr::empty(1), Some("page 1: degraded".into()));

        assert_eq!(doc.word_count(), 2);
        assert!((doc.mean_confidence() - 70.0).abs() < 0.001);
        assert_eq!(doc.warnings.len(), 1);
    }
}
