use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use uuid::Uuid;

pub mod annotations;
pub mod config;
pub mod controller;
pub mod error;
pub mod geometry;
pub mod markup;
pub mod notification;
pub mod persistence;
pub mod render_cache;
pub mod scale;
pub mod search;
pub mod segments;
pub mod session;
pub mod window;

#[cfg(test)]
pub(crate) mod test_support;

pub use annotations::{
    Annotation, AnnotationMap, AnnotationStore, MarkupKind, Rgb, ShapeKind, StampKind, StrokeKind,
};
pub use config::{EngineConfig, ViewMode, ViewPreferences};
pub use controller::{Command, Frame, PageSlot, ViewController, ViewEvent};
pub use error::{ViewError, ViewResult};
pub use geometry::{DocRect, NormPoint, NormRect, PageGeometry, PixelPoint, PixelRect};
pub use persistence::{
    AnnotationRepository, FileStateStore, MemoryAnnotationRepository, MemoryStateStore,
    ReadingState, SidecarRepository, StateStore,
};
pub use render_cache::{CompositedPage, FormOverlay, FormValue, Overlay, OverlayShape, Rgba};
pub use scale::{PageSize, Viewport, ZoomMode};
pub use search::{SearchDirection, SearchHit};
pub use session::{Session, SessionEvent};
pub use window::{PageRow, PageWindow, WindowLayout};

pub type DocumentId = Uuid;

static DOCUMENT_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("3d0f8a5e-5c1b-5e7a-9d42-1f6b0c2e7a91").expect("valid namespace UUID")
});

pub fn document_id_for_path(path: &Path) -> DocumentId {
    let resolved = path
        .canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf());
    let rendered = resolved.to_string_lossy();
    Uuid::new_v5(&*DOCUMENT_NAMESPACE, rendered.as_bytes())
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub path: PathBuf,
    pub page_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    pub page_index: usize,
    pub scale: f32,
    pub dark_mode: bool,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            page_index: 0,
            scale: 1.0,
            dark_mode: false,
        }
    }
}

/// Decoded RGBA bitmap.
#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// A run of page text with its document-space bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSegment {
    pub text: String,
    pub rect: DocRect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormFieldKind {
    Text,
    Checkbox,
    RadioButton,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormWidget {
    pub field_id: usize,
    pub rect: DocRect,
    pub kind: FormFieldKind,
    pub value: String,
    pub checked: bool,
}

/// Page decoder. Everything pixel- or text-level about a document goes
/// through this trait; the engine never parses documents itself.
pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn render_page(&self, request: RenderRequest) -> Result<RenderImage>;
    fn page_text(&self, page_index: usize) -> Result<String>;
    fn text_segments(&self, page_index: usize) -> Result<Vec<TextSegment>>;
    fn search_page(&self, page_index: usize, term: &str) -> Result<Vec<DocRect>>;
    fn form_widgets(&self, page_index: usize) -> Result<Vec<FormWidget>>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>>;
}
