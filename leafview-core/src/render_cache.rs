//! Bounded cache of composited page bitmaps around the current page.
//!
//! Only pages inside `[current - radius_before, current + radius_after)` keep
//! a bitmap. Everything else that is materialized shows a placeholder.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;

use tracing::{debug, warn};

use crate::annotations::{Annotation, AnnotationMap, MarkupKind, Rgb, ShapeKind, StampKind, StrokeKind};
use crate::error::{ViewError, ViewResult};
use crate::geometry::{doc_to_pixel, DocRect, PageGeometry, PixelPoint, PixelRect};
use crate::search::SearchNavigator;
use crate::window::PageWindow;
use crate::{DocumentBackend, FormFieldKind, FormWidget, RenderImage, RenderRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn from_rgb(color: Rgb, a: u8) -> Self {
        Self::new(color.r, color.g, color.b, a)
    }
}

pub const SEARCH_HIGHLIGHT: Rgba = Rgba::new(255, 165, 0, 110);
pub const NOTE_ICON: Rgba = Rgba::new(255, 214, 0, 230);
pub const SNIP_OUTLINE: Rgba = Rgba::new(0, 100, 255, 200);
pub const FORM_FILL: Rgba = Rgba::new(200, 220, 255, 70);

/// Drawing primitive in logical page pixels.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayShape {
    Fill(PixelRect),
    Outline { rect: PixelRect, thickness: f32 },
    Ellipse { rect: PixelRect, thickness: f32 },
    Line { from: PixelPoint, to: PixelPoint, thickness: f32 },
    Polyline { points: Vec<PixelPoint>, thickness: f32 },
    Stamp { center: PixelPoint, kind: StampKind, size: f32 },
    NoteIcon { anchor: PixelPoint, size: f32 },
    Label { anchor: PixelPoint, text: String, size: f32 },
}

/// Editable form region positioned over the bitmap. `doc_rect` is the
/// decoder rect and identifies the widget across re-renders.
#[derive(Debug, Clone, PartialEq)]
pub struct FormOverlay {
    pub field_id: usize,
    pub rect: PixelRect,
    pub doc_rect: DocRect,
    pub kind: FormFieldKind,
    pub value: String,
    pub checked: bool,
}

/// Overlay layers in paint order: forms, then search highlights, then
/// annotations.
#[derive(Debug, Clone, PartialEq)]
pub enum Overlay {
    Form(FormOverlay),
    SearchHighlight(PixelRect),
    Annotation { shape: OverlayShape, color: Rgba },
}

#[derive(Debug, Clone)]
pub struct CompositedPage {
    pub page_index: usize,
    pub bitmap: RenderImage,
    /// Logical size; the bitmap is `device_pixel_ratio` times larger.
    pub width: f32,
    pub height: f32,
    pub scale: f32,
    pub device_pixel_ratio: f32,
    pub overlays: Vec<Overlay>,
}

impl CompositedPage {
    pub fn geometry(&self) -> PageGeometry {
        PageGeometry {
            width: self.width,
            height: self.height,
            scale: self.scale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    Checked(bool),
}

/// Inputs shared by every page composited in one pass.
#[derive(Debug, Clone, Copy)]
pub struct CompositeContext {
    pub scale: f32,
    pub device_pixel_ratio: f32,
    pub dark_mode: bool,
}

/// Pages to admit and evict for one admit/evict pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheUpdate {
    pub to_render: BTreeSet<usize>,
    pub to_clear: BTreeSet<usize>,
}

#[derive(Debug)]
pub struct RenderCache {
    radius_before: usize,
    radius_after: usize,
    rendered: BTreeMap<usize, CompositedPage>,
    form_values: HashMap<(usize, [u32; 4]), FormValue>,
}

impl RenderCache {
    pub fn new(radius_before: usize, radius_after: usize) -> Self {
        Self {
            radius_before,
            radius_after,
            rendered: BTreeMap::new(),
            form_values: HashMap::new(),
        }
    }

    pub fn target_range(&self, current: usize, page_count: usize) -> Range<usize> {
        let start = current.saturating_sub(self.radius_before).min(page_count);
        let end = (current + self.radius_after).min(page_count);
        start..end
    }

    /// Decides which materialized pages need a bitmap and which must fall
    /// back to a placeholder. Does not touch the cache.
    pub fn plan(
        &self,
        current: usize,
        page_count: usize,
        materialized: &BTreeSet<usize>,
    ) -> CacheUpdate {
        let target = self.target_range(current, page_count);
        let to_clear = materialized
            .iter()
            .copied()
            .filter(|page| !target.contains(page))
            .collect();
        let to_render = materialized
            .iter()
            .copied()
            .filter(|page| target.contains(page) && !self.rendered.contains_key(page))
            .collect();
        CacheUpdate {
            to_render,
            to_clear,
        }
    }

    /// Runs one admit/evict pass. Pages that fail to decode keep their
    /// placeholder and are retried on the next pass.
    pub fn sync(
        &mut self,
        backend: &dyn DocumentBackend,
        current: usize,
        materialized: &BTreeSet<usize>,
        ctx: &CompositeContext,
        annotations: &AnnotationMap,
        search: &SearchNavigator,
    ) -> CacheUpdate {
        let page_count = backend.info().page_count;
        let plan = self.plan(current, page_count, materialized);
        let target = self.target_range(current, page_count);
        self.rendered
            .retain(|page, _| materialized.contains(page) && target.contains(page));

        for &page in &plan.to_render {
            let highlights = search.highlights_for(page);
            match self.composite(backend, page, ctx, annotations.page(page), highlights) {
                Ok(composited) => {
                    self.rendered.insert(page, composited);
                }
                Err(err) => warn!(?err, page, "leaving placeholder for page"),
            }
        }
        if !plan.to_render.is_empty() || !plan.to_clear.is_empty() {
            debug!(
                current,
                rendered = plan.to_render.len(),
                cleared = plan.to_clear.len(),
                "render cache updated"
            );
        }
        plan
    }

    fn composite(
        &self,
        backend: &dyn DocumentBackend,
        page: usize,
        ctx: &CompositeContext,
        annotations: &[Annotation],
        highlights: &[DocRect],
    ) -> ViewResult<CompositedPage> {
        let dpr = if ctx.device_pixel_ratio > 0.0 {
            ctx.device_pixel_ratio
        } else {
            1.0
        };
        let request = RenderRequest {
            page_index: page,
            scale: ctx.scale * dpr,
            dark_mode: ctx.dark_mode,
        };
        let bitmap = backend
            .render_page(request)
            .map_err(|source| ViewError::Decode { page, source })?;
        let geometry = PageGeometry {
            width: bitmap.width as f32 / dpr,
            height: bitmap.height as f32 / dpr,
            scale: ctx.scale,
        };

        let mut overlays = Vec::new();
        let widgets = backend.form_widgets(page).unwrap_or_else(|err| {
            warn!(?err, page, "failed to read form widgets");
            Vec::new()
        });
        overlays.extend(
            widgets
                .into_iter()
                .map(|widget| Overlay::Form(self.form_overlay(page, widget, &geometry))),
        );
        overlays.extend(highlights.iter().map(|rect| {
            Overlay::SearchHighlight(doc_to_pixel(*rect, geometry.scale, geometry.height))
        }));
        for record in annotations {
            annotation_overlays(record, &geometry, &mut overlays);
        }

        Ok(CompositedPage {
            page_index: page,
            width: geometry.width,
            height: geometry.height,
            scale: ctx.scale,
            device_pixel_ratio: dpr,
            bitmap,
            overlays,
        })
    }

    fn form_overlay(&self, page: usize, widget: FormWidget, geometry: &PageGeometry) -> FormOverlay {
        let mut overlay = FormOverlay {
            field_id: widget.field_id,
            rect: doc_to_pixel(widget.rect, geometry.scale, geometry.height),
            doc_rect: widget.rect,
            kind: widget.kind,
            value: widget.value,
            checked: widget.checked,
        };
        match self.form_values.get(&(page, widget.rect.key())) {
            Some(FormValue::Text(value)) => overlay.value = value.clone(),
            Some(FormValue::Checked(checked)) => overlay.checked = *checked,
            None => {}
        }
        overlay
    }

    pub fn get(&self, page: usize) -> Option<&CompositedPage> {
        self.rendered.get(&page)
    }

    pub fn is_rendered(&self, page: usize) -> bool {
        self.rendered.contains_key(&page)
    }

    pub fn rendered_pages(&self) -> impl Iterator<Item = usize> + '_ {
        self.rendered.keys().copied()
    }

    /// Forces `page` to be recomposited on the next pass.
    pub fn invalidate(&mut self, page: usize) {
        self.rendered.remove(&page);
    }

    /// Drops every bitmap, e.g. after a zoom or color mode change.
    pub fn clear(&mut self) {
        self.rendered.clear();
    }

    pub fn retain_window(&mut self, window: &PageWindow) {
        self.rendered.retain(|page, _| window.contains(*page));
    }

    /// Records an edited form value. It overrides the decoder's value on
    /// every later composite of that page.
    pub fn set_form_value(&mut self, page: usize, doc_rect: DocRect, value: FormValue) {
        self.form_values.insert((page, doc_rect.key()), value);
        self.invalidate(page);
    }

    pub fn form_value(&self, page: usize, doc_rect: DocRect) -> Option<&FormValue> {
        self.form_values.get(&(page, doc_rect.key()))
    }

    /// Placeholder text shown for materialized pages without a bitmap.
    pub fn placeholder_label(page: usize) -> String {
        format!("Page {}", page + 1)
    }
}

fn annotation_overlays(record: &Annotation, geometry: &PageGeometry, out: &mut Vec<Overlay>) {
    let scale = geometry.scale;
    let mut push = |shape: OverlayShape, color: Rgba| out.push(Overlay::Annotation { shape, color });
    match record {
        Annotation::Note { rel_pos, .. } => push(
            OverlayShape::NoteIcon {
                anchor: geometry.to_pixel(*rel_pos),
                size: 20.0 * scale,
            },
            NOTE_ICON,
        ),
        Annotation::Text { rel_pos, text, color } => push(
            OverlayShape::Label {
                anchor: geometry.to_pixel(*rel_pos),
                text: text.clone(),
                size: 14.0 * scale,
            },
            Rgba::from_rgb(*color, 255),
        ),
        Annotation::Shape {
            rect,
            subtype,
            color,
            thickness,
        } => {
            let rect = geometry.rect_to_pixel(*rect);
            let shape = match subtype {
                ShapeKind::Rect => OverlayShape::Outline {
                    rect,
                    thickness: *thickness,
                },
                ShapeKind::Oval => OverlayShape::Ellipse {
                    rect,
                    thickness: *thickness,
                },
            };
            push(shape, Rgba::from_rgb(*color, 255));
        }
        Annotation::Drawing {
            points,
            subtype,
            color,
            thickness,
        } => {
            let alpha = match subtype {
                StrokeKind::Pen => 255,
                StrokeKind::Highlight => 100,
            };
            push(
                OverlayShape::Polyline {
                    points: points.iter().map(|p| geometry.to_pixel(*p)).collect(),
                    thickness: *thickness,
                },
                Rgba::from_rgb(*color, alpha),
            );
        }
        Annotation::Stamp {
            rel_pos,
            subtype,
            color,
        } => push(
            OverlayShape::Stamp {
                center: geometry.to_pixel(*rel_pos),
                kind: *subtype,
                size: 20.0 * scale,
            },
            Rgba::from_rgb(*color, 255),
        ),
        Annotation::Markup {
            rects,
            subtype,
            color,
        } => {
            let thickness = scale.max(1.0);
            for rect in rects {
                let px = doc_to_pixel(*rect, scale, geometry.height);
                match subtype {
                    MarkupKind::Highlight => {
                        push(OverlayShape::Fill(px), Rgba::from_rgb(*color, 80))
                    }
                    MarkupKind::Underline => {
                        let y = px.y + px.height * 1.25 - 2.0 * scale;
                        push(
                            OverlayShape::Line {
                                from: PixelPoint::new(px.x, y),
                                to: PixelPoint::new(px.x + px.width, y),
                                thickness,
                            },
                            Rgba::from_rgb(*color, 255),
                        );
                    }
                    MarkupKind::Strikeout => {
                        let y = px.y + px.height / 2.0;
                        push(
                            OverlayShape::Line {
                                from: PixelPoint::new(px.x, y),
                                to: PixelPoint::new(px.x + px.width, y),
                                thickness,
                            },
                            Rgba::from_rgb(*color, 255),
                        );
                    }
                }
            }
        }
        Annotation::Snip { rect, .. } => push(
            OverlayShape::Outline {
                rect: geometry.rect_to_pixel(*rect),
                thickness: 1.0,
            },
            SNIP_OUTLINE,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::NormPoint;
    use crate::search::SearchDirection;
    use crate::test_support::FakeBackend;

    fn ctx() -> CompositeContext {
        CompositeContext {
            scale: 1.0,
            device_pixel_ratio: 1.0,
            dark_mode: false,
        }
    }

    fn pages(range: Range<usize>) -> BTreeSet<usize> {
        range.collect()
    }

    #[test]
    fn target_range_is_asymmetric_and_clipped() {
        let cache = RenderCache::new(7, 8);
        assert_eq!(cache.target_range(100, 500), 93..108);
        assert_eq!(cache.target_range(2, 500), 0..10);
        assert_eq!(cache.target_range(495, 500), 488..500);
    }

    #[test]
    fn plan_splits_materialized_pages() {
        let cache = RenderCache::new(7, 8);
        let plan = cache.plan(50, 500, &pages(20..90));
        assert_eq!(plan.to_render, pages(43..58));
        assert_eq!(plan.to_clear.len(), 70 - 15);
        assert!(plan.to_clear.contains(&42));
        assert!(!plan.to_clear.contains(&43));
    }

    #[test]
    fn rendered_set_stays_inside_radius_as_current_moves() {
        let backend = FakeBackend::new(400).with_page_size(20, 30);
        let mut cache = RenderCache::new(7, 8);
        let materialized = pages(170..240);
        let map = AnnotationMap::default();
        let search = SearchNavigator::new();
        for current in [200, 205, 230, 180] {
            cache.sync(&backend, current, &materialized, &ctx(), &map, &search);
            let target = cache.target_range(current, 400);
            assert!(cache.rendered_pages().all(|page| target.contains(&page)));
            assert_eq!(cache.rendered_pages().count(), target.len());
        }
    }

    #[test]
    fn already_rendered_pages_are_not_requested_again() {
        let backend = FakeBackend::new(40).with_page_size(20, 30);
        let mut cache = RenderCache::new(7, 8);
        let materialized = pages(0..40);
        let map = AnnotationMap::default();
        let search = SearchNavigator::new();
        cache.sync(&backend, 10, &materialized, &ctx(), &map, &search);
        backend.clear_render_log();
        let update = cache.sync(&backend, 11, &materialized, &ctx(), &map, &search);
        assert_eq!(update.to_render, pages(18..19));
        assert_eq!(backend.rendered_pages(), vec![18]);
    }

    #[test]
    fn decode_failure_leaves_placeholder() {
        let backend = FakeBackend::new(10).with_page_size(20, 30).failing_page(3);
        let mut cache = RenderCache::new(7, 8);
        let map = AnnotationMap::default();
        let search = SearchNavigator::new();
        cache.sync(&backend, 0, &pages(0..10), &ctx(), &map, &search);
        assert!(!cache.is_rendered(3));
        assert!(cache.is_rendered(4));
        let retry = cache.plan(0, 10, &pages(0..10));
        assert_eq!(retry.to_render, pages(3..4));
    }

    #[test]
    fn renders_at_device_pixel_ratio_with_logical_geometry() {
        let backend = FakeBackend::new(2).with_page_size(100, 200);
        let mut cache = RenderCache::new(7, 8);
        let hidpi = CompositeContext {
            scale: 1.5,
            device_pixel_ratio: 2.0,
            ..ctx()
        };
        cache.sync(
            &backend,
            0,
            &pages(0..1),
            &hidpi,
            &AnnotationMap::default(),
            &SearchNavigator::new(),
        );
        let page = cache.get(0).unwrap();
        assert_eq!((page.bitmap.width, page.bitmap.height), (300, 600));
        assert_eq!((page.width, page.height), (150.0, 300.0));
    }

    #[test]
    fn overlays_follow_fixed_paint_order() {
        let widget = FormWidget {
            field_id: 7,
            rect: DocRect::new(10.0, 100.0, 60.0, 80.0),
            kind: FormFieldKind::Text,
            value: "decoder".into(),
            checked: false,
        };
        let backend = FakeBackend::new(3)
            .with_page_size(200, 300)
            .with_text(1, "find me")
            .with_hits(1, vec![DocRect::new(5.0, 50.0, 25.0, 40.0)])
            .with_forms(1, vec![widget.clone()]);

        let repo = std::sync::Arc::new(crate::persistence::MemoryAnnotationRepository::default());
        let mut store = crate::annotations::AnnotationStore::open(std::path::Path::new("/x.pdf"), repo);
        store.add(
            1,
            Annotation::Note {
                rel_pos: NormPoint::new(0.5, 0.5),
                text: "n".into(),
            },
        );
        let mut search = SearchNavigator::new();
        search
            .find(&backend, "find", 0, SearchDirection::Forward)
            .unwrap();

        let mut cache = RenderCache::new(7, 8);
        cache.set_form_value(1, widget.rect, FormValue::Text("edited".into()));
        cache.sync(&backend, 1, &pages(0..3), &ctx(), store.map(), &search);

        let overlays = &cache.get(1).unwrap().overlays;
        assert_eq!(overlays.len(), 3);
        match &overlays[0] {
            Overlay::Form(form) => {
                assert_eq!(form.value, "edited");
                assert_eq!(form.rect, PixelRect::new(10.0, 200.0, 50.0, 20.0));
            }
            other => panic!("expected form overlay first, got {other:?}"),
        }
        assert!(matches!(overlays[1], Overlay::SearchHighlight(_)));
        assert!(matches!(
            overlays[2],
            Overlay::Annotation {
                shape: OverlayShape::NoteIcon { .. },
                ..
            }
        ));
        assert!(cache
            .get(0)
            .unwrap()
            .overlays
            .iter()
            .all(|overlay| !matches!(overlay, Overlay::SearchHighlight(_))));
    }

    #[test]
    fn underline_sits_below_the_text_box() {
        let geometry = PageGeometry {
            width: 595.0,
            height: 842.0,
            scale: 1.0,
        };
        let mut out = Vec::new();
        annotation_overlays(
            &Annotation::Markup {
                rects: vec![DocRect::new(100.0, 800.0, 200.0, 780.0)],
                subtype: MarkupKind::Underline,
                color: Rgb::BLUE,
            },
            &geometry,
            &mut out,
        );
        match &out[0] {
            Overlay::Annotation {
                shape: OverlayShape::Line { from, to, .. },
                ..
            } => {
                assert_eq!(from.y, 42.0 + 25.0 - 2.0);
                assert_eq!((from.x, to.x), (100.0, 200.0));
            }
            other => panic!("unexpected overlay {other:?}"),
        }
    }

    #[test]
    fn window_rebuild_drops_pages_outside_new_window() {
        let backend = FakeBackend::new(400).with_page_size(20, 30);
        let mut cache = RenderCache::new(7, 8);
        cache.sync(
            &backend,
            100,
            &pages(70..140),
            &ctx(),
            &AnnotationMap::default(),
            &SearchNavigator::new(),
        );
        cache.retain_window(&PageWindow {
            start: 104,
            end: 174,
            virtual_enabled: true,
        });
        assert_eq!(cache.rendered_pages().next(), Some(104));
    }
}
