//! Pdfium-backed document decoder.

use std::convert::TryFrom;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use leafview_core::{
    document_id_for_path, DocRect, DocumentBackend, DocumentInfo, DocumentProvider,
    FormFieldKind, FormWidget, RenderImage, RenderRequest, TextSegment,
};
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use rayon::prelude::*;
use tracing::{debug, instrument, warn};

/// Overrides the pdfium library location at runtime.
pub const PDFIUM_LIBRARY_ENV: &str = "LEAFVIEW_PDFIUM_LIBRARY_PATH";

pub struct PdfiumProvider {
    pdfium: Arc<Pdfium>,
}

impl PdfiumProvider {
    pub fn new() -> Result<Self> {
        let pdfium = match bind_pdfium_from_env() {
            Some(pdfium) => pdfium,
            None => bind_pdfium_default()?,
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl DocumentProvider for PdfiumProvider {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>> {
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", path))?;
        let document = PdfiumDocument::open(Arc::clone(&self.pdfium), absolute)?;
        Ok(Arc::new(document))
    }
}

struct PdfiumDocument {
    info: DocumentInfo,
    document: Mutex<PdfDocument<'static>>,
    // Must stay below `document` so it is dropped after it.
    _pdfium: Arc<Pdfium>,
}

impl PdfiumDocument {
    fn open(pdfium: Arc<Pdfium>, path: PathBuf) -> Result<Self> {
        let document = pdfium
            .load_pdf_from_file(&path, None)
            .with_context(|| format!("failed to open {:?}", path))?;
        // SAFETY: the document borrows the bindings owned by `pdfium`, which
        // this struct keeps alive and drops after the document.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
        debug!(path = %path.display(), page_count, "opened document");
        Ok(Self {
            info: DocumentInfo {
                id: document_id_for_path(&path),
                path,
                page_count,
            },
            document: Mutex::new(document),
            _pdfium: pdfium,
        })
    }

    fn with_page<R, F>(&self, page_index: usize, f: F) -> Result<R>
    where
        F: FnOnce(&PdfPage<'_>) -> Result<R>,
    {
        let document = self.document.lock();
        let index: PdfPageIndex = page_index
            .try_into()
            .map_err(|_| anyhow!("page {} is out of supported range", page_index))?;
        let page = document
            .pages()
            .get(index)
            .with_context(|| format!("page {} out of range", page_index))?;
        f(&page)
    }
}

impl DocumentBackend for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    #[instrument(skip(self))]
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        self.with_page(request.page_index, |page| {
            let config = PdfRenderConfig::new().scale_page_by_factor(request.scale.max(0.1));
            let bitmap = page
                .render_with_config(&config)
                .with_context(|| format!("failed to render page {}", request.page_index))?;
            let image = bitmap.as_image().to_rgba8();
            let (width, height) = (image.width(), image.height());
            let mut pixels = image.into_raw();
            if request.dark_mode {
                invert_pixels(&mut pixels);
            }
            Ok(RenderImage {
                width,
                height,
                pixels,
            })
        })
    }

    fn page_text(&self, page_index: usize) -> Result<String> {
        self.with_page(page_index, |page| {
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?;
            Ok(text.all())
        })
    }

    fn text_segments(&self, page_index: usize) -> Result<Vec<TextSegment>> {
        self.with_page(page_index, |page| {
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?;
            let segments = text
                .segments()
                .iter()
                .map(|segment| TextSegment {
                    text: segment.text(),
                    rect: doc_rect(&segment.bounds()),
                })
                .collect();
            Ok(segments)
        })
    }

    fn search_page(&self, page_index: usize, term: &str) -> Result<Vec<DocRect>> {
        if term.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.with_page(page_index, |page| {
            let text = page
                .text()
                .with_context(|| format!("failed to extract text for page {}", page_index))?;
            let search = text
                .search(term, &PdfSearchOptions::new())
                .with_context(|| format!("failed to perform search on page {}", page_index))?;
            let mut rects = Vec::new();
            while let Some(segments) = search.find_next() {
                rects.extend(segments.iter().map(|segment| doc_rect(&segment.bounds())));
            }
            Ok(rects)
        })
    }

    fn form_widgets(&self, page_index: usize) -> Result<Vec<FormWidget>> {
        self.with_page(page_index, |page| {
            let mut widgets = Vec::new();
            for (field_id, annotation) in page.annotations().iter().enumerate() {
                let Some(field) = annotation.as_form_field() else {
                    continue;
                };
                let bounds = match annotation.bounds() {
                    Ok(bounds) => bounds,
                    Err(err) => {
                        warn!(?err, page = page_index, field_id, "skipping form field without bounds");
                        continue;
                    }
                };
                let (kind, value, checked) = if let Some(text) = field.as_text_field() {
                    (FormFieldKind::Text, text.value().unwrap_or_default(), false)
                } else if let Some(checkbox) = field.as_checkbox_field() {
                    (
                        FormFieldKind::Checkbox,
                        String::new(),
                        checkbox.is_checked().unwrap_or(false),
                    )
                } else if let Some(radio) = field.as_radio_button_field() {
                    (
                        FormFieldKind::RadioButton,
                        String::new(),
                        radio.is_checked().unwrap_or(false),
                    )
                } else {
                    (
                        FormFieldKind::Other(format!("{:?}", field.field_type())),
                        String::new(),
                        false,
                    )
                };
                widgets.push(FormWidget {
                    field_id,
                    rect: doc_rect(&bounds),
                    kind,
                    value,
                    checked,
                });
            }
            Ok(widgets)
        })
    }
}

/// Pdfium rects share the bottom-left document origin, so corners map
/// straight across.
fn doc_rect(rect: &PdfRect) -> DocRect {
    DocRect::new(
        rect.left().value,
        rect.top().value,
        rect.right().value,
        rect.bottom().value,
    )
    .normalized()
}

/// Dark mode: inverts color channels and leaves alpha alone.
pub fn invert_pixels(pixels: &mut [u8]) {
    pixels.par_chunks_exact_mut(4).for_each(|chunk| {
        chunk[0] = 255 - chunk[0];
        chunk[1] = 255 - chunk[1];
        chunk[2] = 255 - chunk[2];
    });
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    let path = std::env::var(PDFIUM_LIBRARY_ENV).ok()?;
    if path.is_empty() {
        return None;
    }
    match Pdfium::bind_to_library(&path) {
        Ok(bindings) => Some(Pdfium::new(bindings)),
        Err(err) => {
            warn!(%path, %err, "failed to load pdfium from {}", PDFIUM_LIBRARY_ENV);
            None
        }
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => errors.push(format!("{}: {}", cwd_path.display(), err)),
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; ensure it is installed ({})",
                errors.join(", ")
            ))
        }
    }
}
