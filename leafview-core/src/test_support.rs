use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;

use crate::{
    document_id_for_path, DocRect, DocumentBackend, DocumentInfo, DocumentProvider, FormWidget,
    RenderImage, RenderRequest, TextSegment,
};

/// Scriptable decoder for engine tests.
pub struct FakeBackend {
    info: DocumentInfo,
    page_size: (u32, u32),
    failing: HashSet<usize>,
    texts: HashMap<usize, String>,
    segments: HashMap<usize, Vec<TextSegment>>,
    hits: HashMap<usize, Vec<DocRect>>,
    forms: HashMap<usize, Vec<FormWidget>>,
    renders: Mutex<Vec<RenderRequest>>,
}

impl FakeBackend {
    pub fn new(page_count: usize) -> Self {
        Self::at_path(PathBuf::from("/tmp/fake.pdf"), page_count)
    }

    pub fn at_path(path: PathBuf, page_count: usize) -> Self {
        Self {
            info: DocumentInfo {
                id: document_id_for_path(&path),
                path,
                page_count,
            },
            page_size: (595, 842),
            failing: HashSet::new(),
            texts: HashMap::new(),
            segments: HashMap::new(),
            hits: HashMap::new(),
            forms: HashMap::new(),
            renders: Mutex::new(Vec::new()),
        }
    }

    pub fn with_page_size(mut self, width: u32, height: u32) -> Self {
        self.page_size = (width, height);
        self
    }

    pub fn failing_page(mut self, page: usize) -> Self {
        self.failing.insert(page);
        self
    }

    pub fn with_text(mut self, page: usize, text: &str) -> Self {
        self.texts.insert(page, text.to_string());
        self
    }

    pub fn with_segments(mut self, page: usize, segments: Vec<TextSegment>) -> Self {
        self.segments.insert(page, segments);
        self
    }

    pub fn with_hits(mut self, page: usize, rects: Vec<DocRect>) -> Self {
        self.hits.insert(page, rects);
        self
    }

    pub fn with_forms(mut self, page: usize, forms: Vec<FormWidget>) -> Self {
        self.forms.insert(page, forms);
        self
    }

    pub fn rendered_pages(&self) -> Vec<usize> {
        self.renders.lock().iter().map(|r| r.page_index).collect()
    }

    pub fn clear_render_log(&self) {
        self.renders.lock().clear();
    }

    fn check(&self, page_index: usize) -> Result<()> {
        if page_index >= self.info.page_count {
            return Err(anyhow!("page {} out of range", page_index));
        }
        if self.failing.contains(&page_index) {
            return Err(anyhow!("page {} is corrupt", page_index));
        }
        Ok(())
    }
}

impl DocumentBackend for FakeBackend {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn render_page(&self, request: RenderRequest) -> Result<RenderImage> {
        self.check(request.page_index)?;
        self.renders.lock().push(request);
        let width = ((self.page_size.0 as f32) * request.scale).round().max(1.0) as u32;
        let height = ((self.page_size.1 as f32) * request.scale).round().max(1.0) as u32;
        Ok(RenderImage {
            width,
            height,
            pixels: vec![255; (width * height * 4) as usize],
        })
    }

    fn page_text(&self, page_index: usize) -> Result<String> {
        self.check(page_index)?;
        Ok(self.texts.get(&page_index).cloned().unwrap_or_default())
    }

    fn text_segments(&self, page_index: usize) -> Result<Vec<TextSegment>> {
        self.check(page_index)?;
        Ok(self.segments.get(&page_index).cloned().unwrap_or_default())
    }

    fn search_page(&self, page_index: usize, _term: &str) -> Result<Vec<DocRect>> {
        self.check(page_index)?;
        Ok(self.hits.get(&page_index).cloned().unwrap_or_default())
    }

    fn form_widgets(&self, page_index: usize) -> Result<Vec<FormWidget>> {
        self.check(page_index)?;
        Ok(self.forms.get(&page_index).cloned().unwrap_or_default())
    }
}

pub struct FakeProvider {
    pub page_count: usize,
}

#[async_trait::async_trait]
impl DocumentProvider for FakeProvider {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>> {
        Ok(Arc::new(FakeBackend::at_path(
            path.to_path_buf(),
            self.page_count,
        )))
    }
}

pub fn segment(text: &str, left: f32, top: f32, right: f32, bottom: f32) -> TextSegment {
    TextSegment {
        text: text.to_string(),
        rect: DocRect::new(left, top, right, bottom),
    }
}
