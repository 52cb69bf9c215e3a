//! Orchestrates windowing, caching, annotations and search for one document.
//!
//! All view-state mutation goes through [`ViewController::apply`]. The
//! controller reports what changed through a shared [`ViewEvent`] queue and
//! describes what to paint through [`ViewController::frame`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::annotations::{Annotation, AnnotationStore, MarkupKind, Rgb};
use crate::config::{EngineConfig, ViewMode, ViewPreferences};
use crate::error::{ViewError, ViewResult};
use crate::geometry::{DocRect, NormRect, PageGeometry, PixelPoint, PixelRect};
use crate::markup::MarkupSelector;
use crate::notification::{NotificationKind, Notifications};
use crate::persistence::ReadingState;
use crate::render_cache::{CompositeContext, CompositedPage, FormValue, RenderCache};
use crate::scale::{self, PageSize, Viewport, ZoomMode, ZoomRequest};
use crate::search::{SearchDirection, SearchNavigator};
use crate::segments::TextSegmentCache;
use crate::window::{PageWindow, PageWindowManager, WindowInput, WindowLayout};
use crate::{DocumentBackend, DocumentInfo};

const LIGHT_FOREGROUND: Rgb = Rgb::new(0, 0, 0);
const DARK_FOREGROUND: Rgb = Rgb::new(230, 230, 230);

#[derive(Debug, Clone)]
pub enum Command {
    NextPage,
    PrevPage,
    GotoPage { page: usize },
    /// Absolute scroll offset reported by the shell.
    Scroll { offset: f32 },
    EnsureVisible { page: usize },
    ZoomIn,
    ZoomOut,
    ZoomWheel { delta: f32 },
    ZoomText { text: String },
    SetZoomMode { mode: ZoomMode },
    Resize { viewport: Viewport },
    ToggleFacingPages,
    ToggleContinuousScroll,
    ToggleViewMode,
    ToggleDarkMode,
    Find { term: String, direction: SearchDirection },
    FindNext { direction: SearchDirection },
    ClearSearch,
    AddAnnotation { page: usize, annotation: Annotation },
    Undo,
    Redo,
    Erase { page: usize, position: PixelPoint },
    EditNote { page: usize, index: usize, text: String },
    BeginMarkup { page: usize, position: PixelPoint, kind: MarkupKind },
    DragMarkup { position: PixelPoint },
    EndMarkup { color: Option<Rgb> },
    CancelMarkup,
    Snip { page: usize, from: PixelPoint, to: PixelPoint, latex: String },
    SetFormValue { page: usize, doc_rect: DocRect, value: FormValue },
    DismissNotification,
}

impl Command {
    /// Page index the command addresses directly, if any.
    pub fn target_page(&self) -> Option<usize> {
        match *self {
            Command::GotoPage { page }
            | Command::EnsureVisible { page }
            | Command::AddAnnotation { page, .. }
            | Command::Erase { page, .. }
            | Command::EditNote { page, .. }
            | Command::BeginMarkup { page, .. }
            | Command::Snip { page, .. }
            | Command::SetFormValue { page, .. } => Some(page),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    PageChanged { page: usize },
    WindowRebuilt(PageWindow),
    PageInvalidated { page: usize },
    ScrollTo { offset: f32 },
    PreferencesChanged(ViewPreferences),
    SearchMiss { term: String },
    RedrawNeeded,
}

/// What the shell shows in one materialized slot.
#[derive(Debug, Clone)]
pub enum PageSlot<'a> {
    Rendered(&'a CompositedPage),
    Placeholder { page_index: usize, label: String },
}

impl PageSlot<'_> {
    pub fn page_index(&self) -> usize {
        match self {
            PageSlot::Rendered(page) => page.page_index,
            PageSlot::Placeholder { page_index, .. } => *page_index,
        }
    }
}

/// Snapshot of everything the shell needs to paint.
#[derive(Debug, Clone)]
pub struct Frame<'a> {
    pub layout: &'a WindowLayout,
    pub slots: Vec<PageSlot<'a>>,
    pub current_page: usize,
    pub page_count: usize,
    pub zoom_label: String,
    /// Set instead of slots in reflow mode.
    pub reflow_text: Option<String>,
    /// Page the markup preview rects belong to.
    pub markup_page: Option<usize>,
    pub markup_preview: Vec<(PixelRect, Rgb)>,
    pub notification: Option<&'a str>,
}

pub struct ViewController {
    backend: Arc<dyn DocumentBackend>,
    config: EngineConfig,
    prefs: ViewPreferences,
    view_mode: ViewMode,
    viewport: Viewport,
    base_size: Option<PageSize>,
    current_page: usize,
    scroll_offset: f32,
    settle_at: Option<Instant>,
    windows: PageWindowManager,
    layout: WindowLayout,
    cache: RenderCache,
    annotations: AnnotationStore,
    segments: TextSegmentCache,
    markup: MarkupSelector,
    search: SearchNavigator,
    notifications: Notifications,
    events: Arc<Mutex<Vec<ViewEvent>>>,
}

impl ViewController {
    pub fn new(
        backend: Arc<dyn DocumentBackend>,
        annotations: AnnotationStore,
        prefs: ViewPreferences,
        config: EngineConfig,
        viewport: Viewport,
    ) -> Self {
        let mut controller = Self {
            backend,
            windows: PageWindowManager::new(config.window),
            cache: RenderCache::new(config.render_radius_before, config.render_radius_after),
            annotations: annotations.with_eraser_threshold(config.eraser_threshold),
            config,
            prefs,
            view_mode: ViewMode::Image,
            viewport,
            base_size: None,
            current_page: 0,
            scroll_offset: 0.0,
            settle_at: None,
            layout: WindowLayout::default(),
            segments: TextSegmentCache::new(),
            markup: MarkupSelector::new(),
            search: SearchNavigator::new(),
            notifications: Notifications::default(),
            events: Arc::new(Mutex::new(Vec::new())),
        };
        controller.rebuild();
        controller
    }

    pub fn info(&self) -> &DocumentInfo {
        self.backend.info()
    }

    pub fn page_count(&self) -> usize {
        self.backend.info().page_count
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    pub fn preferences(&self) -> ViewPreferences {
        self.prefs
    }

    pub fn view_mode(&self) -> ViewMode {
        self.view_mode
    }

    pub fn layout(&self) -> &WindowLayout {
        &self.layout
    }

    pub fn cache(&self) -> &RenderCache {
        &self.cache
    }

    pub fn annotations(&self) -> &AnnotationStore {
        &self.annotations
    }

    pub fn search(&self) -> &SearchNavigator {
        &self.search
    }

    pub fn notifications(&self) -> &Notifications {
        &self.notifications
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ViewEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn drain_events(&self) -> Vec<ViewEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn reading_state(&self) -> ReadingState {
        ReadingState {
            current_page: self.current_page,
            scroll_offset: self.scroll_offset,
        }
    }

    /// Restores a saved position, clamped to the current page count.
    pub fn restore(&mut self, state: ReadingState) {
        let state = state.clamped(self.page_count());
        self.current_page = state.current_page;
        self.scroll_offset = state.scroll_offset.max(0.0);
        self.rebuild();
        self.ensure_visible(self.current_page);
    }

    /// Active zoom factor.
    pub fn scale(&mut self) -> f32 {
        let base = self.base_size();
        self.config.scale_policy.scale(
            self.prefs.zoom_mode,
            self.prefs.manual_scale,
            base,
            self.viewport,
            self.prefs.facing_pages,
        )
    }

    fn base_size(&mut self) -> PageSize {
        if let Some(size) = self.base_size {
            return size;
        }
        let size = if self.page_count() == 0 {
            self.config.fallback_page_size
        } else {
            scale::measure_base_size(self.backend.as_ref(), self.config.fallback_page_size)
        };
        self.base_size = Some(size);
        size
    }

    /// Logical geometry of `page`: the rendered bitmap when there is one,
    /// otherwise the base page size at the active scale.
    pub fn page_geometry(&mut self, page: usize) -> PageGeometry {
        if let Some(rendered) = self.cache.get(page) {
            return rendered.geometry();
        }
        let scale = self.scale();
        let base = self.base_size();
        PageGeometry {
            width: base.width * scale,
            height: base.height * scale,
            scale,
        }
    }

    fn foreground(&self) -> Rgb {
        if self.prefs.dark_mode {
            DARK_FOREGROUND
        } else {
            LIGHT_FOREGROUND
        }
    }

    fn emit(&self, event: ViewEvent) {
        self.events.lock().push(event);
    }

    pub fn apply(&mut self, command: Command) -> ViewResult<()> {
        self.apply_at(command, Instant::now())
    }

    /// Rejects commands that target a page outside the document before any
    /// state changes.
    #[instrument(skip(self, now))]
    pub fn apply_at(&mut self, command: Command, now: Instant) -> ViewResult<()> {
        if let Some(page) = command.target_page() {
            self.check_page(page)?;
        }
        match command {
            Command::NextPage => {
                let step = self.page_step();
                let last = self.page_count().saturating_sub(1);
                self.navigate((self.current_page + step).min(last));
            }
            Command::PrevPage => {
                let step = self.page_step();
                self.navigate(self.current_page.saturating_sub(step));
            }
            Command::GotoPage { page } => self.navigate(page),
            Command::Scroll { offset } => self.scroll(offset, now),
            Command::EnsureVisible { page } => {
                self.ensure_visible(page);
            }
            Command::ZoomIn => self.zoom_by(1.1),
            Command::ZoomOut => self.zoom_by(0.9),
            Command::ZoomWheel { delta } => self.zoom_by(scale::wheel_factor(delta)),
            Command::ZoomText { text } => match scale::parse_zoom(&text) {
                Some(ZoomRequest::Fit(mode)) => self.set_zoom(mode, self.prefs.manual_scale),
                Some(ZoomRequest::Manual(value)) => self.set_zoom(ZoomMode::Manual, value),
                None => debug!(%text, "ignoring unparsable zoom"),
            },
            Command::SetZoomMode { mode } => self.set_zoom(mode, self.prefs.manual_scale),
            Command::Resize { viewport } => {
                if viewport != self.viewport {
                    self.viewport = viewport;
                    if self.prefs.zoom_mode != ZoomMode::Manual {
                        self.cache.clear();
                    }
                    self.rebuild();
                    self.ensure_visible(self.current_page);
                }
            }
            Command::ToggleFacingPages => {
                self.prefs.facing_pages = !self.prefs.facing_pages;
                self.cache.clear();
                self.preferences_changed();
                self.rebuild();
                self.ensure_visible(self.current_page);
            }
            Command::ToggleContinuousScroll => {
                self.prefs.continuous_scroll = !self.prefs.continuous_scroll;
                self.preferences_changed();
                self.rebuild();
                self.ensure_visible(self.current_page);
            }
            Command::ToggleDarkMode => {
                self.prefs.dark_mode = !self.prefs.dark_mode;
                self.cache.clear();
                self.preferences_changed();
                self.sync_cache();
            }
            Command::ToggleViewMode => {
                self.view_mode = match self.view_mode {
                    ViewMode::Image => ViewMode::Reflow,
                    ViewMode::Reflow => ViewMode::Image,
                };
                self.sync_cache();
                self.emit(ViewEvent::RedrawNeeded);
            }
            Command::Find { term, direction } => self.find(&term, direction, now),
            Command::FindNext { direction } => {
                if let Some(term) = self.search.term().map(str::to_string) {
                    self.find(&term, direction, now);
                }
            }
            Command::ClearSearch => {
                if let Some(hit) = self.search.clear() {
                    self.invalidate(hit.page);
                    self.sync_cache();
                }
            }
            Command::AddAnnotation { page, annotation } => {
                let page = self.annotations.add(page, annotation);
                self.annotation_changed(page);
            }
            Command::Undo => {
                if let Some(page) = self.annotations.undo() {
                    self.annotation_changed(page);
                }
            }
            Command::Redo => {
                if let Some(page) = self.annotations.redo() {
                    self.annotation_changed(page);
                }
            }
            Command::Erase { page, position } => {
                let geometry = self.page_geometry(page);
                if self
                    .annotations
                    .delete_nearest(page, position, &geometry)
                    .is_some()
                {
                    self.annotation_changed(page);
                }
            }
            Command::EditNote { page, index, text } => {
                if self.annotations.edit_note(page, index, &text) {
                    self.annotation_changed(page);
                }
            }
            Command::BeginMarkup {
                page,
                position,
                kind,
            } => self.markup.begin(page, position, kind),
            Command::DragMarkup { position } => {
                if let Some(page) = self.markup.page() {
                    let geometry = self.page_geometry(page);
                    let segments = self.segments.segments(self.backend.as_ref(), page);
                    self.markup
                        .update(position, segments, geometry.scale, geometry.height);
                    self.emit(ViewEvent::RedrawNeeded);
                }
            }
            Command::EndMarkup { color } => {
                if let Some((page, record)) = self.markup.finish(color, self.foreground()) {
                    let page = self.annotations.add(page, record);
                    self.annotation_changed(page);
                } else {
                    self.emit(ViewEvent::RedrawNeeded);
                }
            }
            Command::CancelMarkup => {
                self.markup.cancel();
                self.emit(ViewEvent::RedrawNeeded);
            }
            Command::Snip {
                page,
                from,
                to,
                latex,
            } => self.snip(page, from, to, latex),
            Command::SetFormValue {
                page,
                doc_rect,
                value,
            } => {
                self.cache.set_form_value(page, doc_rect, value);
                self.emit(ViewEvent::PageInvalidated { page });
                self.sync_cache();
            }
            Command::DismissNotification => {
                if self.notifications.dismiss().is_some() {
                    self.emit(ViewEvent::RedrawNeeded);
                }
            }
        }
        Ok(())
    }

    fn check_page(&self, page: usize) -> ViewResult<()> {
        let page_count = self.page_count();
        if page >= page_count {
            return Err(ViewError::NavigationOutOfRange {
                requested: page,
                page_count,
            });
        }
        Ok(())
    }

    /// Settles a pending scroll once the debounce interval has passed.
    /// Returns true when the window or cache was updated.
    pub fn tick(&mut self, now: Instant) -> bool {
        let expired = self.notifications.expire(now) > 0;
        if expired {
            self.emit(ViewEvent::RedrawNeeded);
        }
        match self.settle_at {
            Some(deadline) if now >= deadline => {
                self.settle_at = None;
                if self.rebuild_needed() {
                    self.rebuild();
                } else {
                    self.sync_cache();
                }
                true
            }
            _ => false,
        }
    }

    pub fn scroll_pending(&self) -> bool {
        self.settle_at.is_some()
    }

    /// Index of a note near `position`, for opening it in an editor.
    pub fn note_at(&mut self, page: usize, position: PixelPoint) -> Option<usize> {
        let geometry = self.page_geometry(page);
        self.annotations.note_at(page, position, &geometry)
    }

    pub fn export_markdown(&self) -> String {
        let title = self
            .info()
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.info().path.display().to_string());
        self.annotations.export_markdown(&title)
    }

    /// Scroll offset that centers `page`, reported as [`ViewEvent::ScrollTo`].
    pub fn ensure_visible(&mut self, page: usize) -> f32 {
        let offset = self.layout.offset_for(page, self.viewport.height);
        self.scroll_offset = offset;
        self.emit(ViewEvent::ScrollTo { offset });
        offset
    }

    pub fn frame(&mut self) -> Frame<'_> {
        let now = Instant::now();
        let scale = self.scale();
        let zoom_label = scale::zoom_label(self.prefs.zoom_mode, scale);
        let markup_preview = match self.markup.page() {
            Some(page) => {
                let geometry = self.page_geometry(page);
                self.markup.preview(geometry.scale, geometry.height)
            }
            None => Vec::new(),
        };
        let reflow_text = match self.view_mode {
            ViewMode::Reflow => Some(
                self.backend
                    .page_text(self.current_page)
                    .unwrap_or_else(|err| {
                        warn!(?err, page = self.current_page, "failed to extract page text");
                        String::new()
                    }),
            ),
            ViewMode::Image => None,
        };
        let slots = match self.view_mode {
            ViewMode::Reflow => Vec::new(),
            ViewMode::Image => self
                .layout
                .materialized()
                .map(|page| match self.cache.get(page) {
                    Some(rendered) => PageSlot::Rendered(rendered),
                    None => PageSlot::Placeholder {
                        page_index: page,
                        label: RenderCache::placeholder_label(page),
                    },
                })
                .collect(),
        };
        Frame {
            layout: &self.layout,
            slots,
            current_page: self.current_page,
            page_count: self.backend.info().page_count,
            zoom_label,
            reflow_text,
            markup_page: self.markup.page(),
            markup_preview,
            notification: self
                .notifications
                .latest(now)
                .map(|note| note.message.as_str()),
        }
    }

    fn page_step(&self) -> usize {
        if self.prefs.facing_pages {
            2
        } else {
            1
        }
    }

    fn navigate(&mut self, page: usize) {
        if page == self.current_page {
            return;
        }
        self.set_current(page);
        self.ensure_visible(page);
    }

    fn set_current(&mut self, page: usize) {
        self.current_page = page;
        self.emit(ViewEvent::PageChanged { page });
        if self.rebuild_needed() {
            self.rebuild();
        } else {
            self.sync_cache();
        }
    }

    fn rebuild_needed(&self) -> bool {
        !self.prefs.continuous_scroll
            || !self.layout.window.contains(self.current_page)
            || self
                .windows
                .needs_rebuild(&self.layout.window, self.current_page, self.page_count())
    }

    /// The cheap half of a scroll: the page number follows immediately, the
    /// window and cache wait for [`ViewController::tick`].
    fn scroll(&mut self, offset: f32, now: Instant) {
        self.scroll_offset = offset.max(0.0);
        if !self.prefs.continuous_scroll {
            return;
        }
        if let Some(page) =
            self.layout
                .page_under(self.scroll_offset, self.viewport.height, self.page_count())
        {
            if page != self.current_page {
                self.current_page = page;
                self.emit(ViewEvent::PageChanged { page });
            }
        }
        self.settle_at = Some(now + self.config.scroll_debounce);
    }

    fn zoom_by(&mut self, factor: f32) {
        let current = self.scale();
        self.set_zoom(ZoomMode::Manual, scale::step_scale(current, factor));
    }

    fn set_zoom(&mut self, mode: ZoomMode, manual_scale: f32) {
        let manual_scale = scale::clamp_scale(manual_scale);
        if mode == self.prefs.zoom_mode && manual_scale == self.prefs.manual_scale {
            return;
        }
        self.prefs.zoom_mode = mode;
        self.prefs.manual_scale = manual_scale;
        info!(%mode, manual_scale, "zoom changed");
        self.cache.clear();
        self.preferences_changed();
        self.rebuild();
        self.ensure_visible(self.current_page);
    }

    fn preferences_changed(&self) {
        self.emit(ViewEvent::PreferencesChanged(self.prefs));
    }

    #[instrument(skip(self, now))]
    fn find(&mut self, term: &str, direction: SearchDirection, now: Instant) {
        let previous = self.search.hit().map(|hit| hit.page);
        match self
            .search
            .find(self.backend.as_ref(), term, self.current_page, direction)
        {
            Ok(hit) => {
                if let Some(page) = previous {
                    self.invalidate(page);
                }
                self.invalidate(hit.page);
                if hit.page != self.current_page {
                    self.current_page = hit.page;
                    self.emit(ViewEvent::PageChanged { page: hit.page });
                }
                if self.rebuild_needed() || !self.layout.is_materialized(hit.page) {
                    self.rebuild();
                } else {
                    self.sync_cache();
                }
                self.ensure_visible(hit.page);
            }
            Err(ViewError::SearchMiss { term }) => {
                self.notifications.push(
                    format!("No matches for '{term}'"),
                    NotificationKind::Warning,
                    now,
                );
                self.emit(ViewEvent::SearchMiss { term });
            }
            Err(err) => warn!(?err, "search failed"),
        }
    }

    fn snip(&mut self, page: usize, from: PixelPoint, to: PixelPoint, latex: String) {
        let rect = PixelRect::from_corners(from, to);
        if rect.width < self.config.min_snip_size || rect.height < self.config.min_snip_size {
            debug!(page, "ignoring undersized snip");
            return;
        }
        let geometry = self.page_geometry(page);
        let norm = NormRect::new(
            rect.x / geometry.width,
            rect.y / geometry.height,
            rect.width / geometry.width,
            rect.height / geometry.height,
        );
        let page = self.annotations.add(page, Annotation::Snip { rect: norm, latex });
        self.annotation_changed(page);
    }

    fn annotation_changed(&mut self, page: usize) {
        self.invalidate(page);
        self.sync_cache();
    }

    fn invalidate(&mut self, page: usize) {
        self.cache.invalidate(page);
        self.emit(ViewEvent::PageInvalidated { page });
    }

    /// Recomputes the window from scratch and runs an admit/evict pass.
    fn rebuild(&mut self) {
        let scale = self.scale();
        let page_height = self.base_size().height * scale;
        let input = WindowInput {
            page_count: self.page_count(),
            current_page: self.current_page,
            continuous_scroll: self.prefs.continuous_scroll,
            facing_pages: self.prefs.facing_pages,
            page_height,
        };
        self.layout = self.windows.recompute(&input);
        self.cache.retain_window(&self.layout.window);
        debug!(
            start = self.layout.window.start,
            end = self.layout.window.end,
            virtual_enabled = self.layout.window.virtual_enabled,
            "window rebuilt"
        );
        self.emit(ViewEvent::WindowRebuilt(self.layout.window));
        self.sync_cache();
    }

    fn sync_cache(&mut self) {
        if self.view_mode == ViewMode::Reflow {
            return;
        }
        let ctx = CompositeContext {
            scale: self.scale(),
            device_pixel_ratio: self.viewport.device_pixel_ratio,
            dark_mode: self.prefs.dark_mode,
        };
        let materialized: BTreeSet<usize> = self.layout.materialized().collect();
        let update = self.cache.sync(
            self.backend.as_ref(),
            self.current_page,
            &materialized,
            &ctx,
            self.annotations.map(),
            &self.search,
        );
        if !update.to_render.is_empty() || !update.to_clear.is_empty() {
            self.emit(ViewEvent::RedrawNeeded);
        }
    }
}
