//! Per-page annotation log with undo/redo and sidecar persistence.
//!
//! Positional fields of point-like and freehand records are normalized to the
//! rendered page size so they survive zoom changes. Markup rects stay in
//! document space because they come straight from decoder text segments.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use tracing::{debug, warn};

use crate::error::{ViewError, ViewResult};
use crate::geometry::{doc_to_pixel, DocRect, NormPoint, NormRect, PageGeometry, PixelPoint};
use crate::persistence::AnnotationRepository;

/// Eraser reach, as a fraction of the page dimensions.
pub const ERASER_THRESHOLD: f32 = 0.08;
/// Slack around markup rects when erasing, in logical pixels.
pub const MARKUP_HIT_PADDING: f32 = 4.0;
/// Click radius for opening an existing note, in logical pixels.
pub const NOTE_HIT_RADIUS: f32 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ColorRepr", into = "String")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const RED: Rgb = Rgb::new(255, 0, 0);
    pub const YELLOW: Rgb = Rgb::new(255, 255, 0);
    pub const BLUE: Rgb = Rgb::new(0, 100, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn parse_hex(value: &str) -> Option<Self> {
        let hex = value.trim().strip_prefix('#')?;
        if hex.len() != 6 {
            return None;
        }
        let channel = |range: std::ops::Range<usize>| u8::from_str_radix(hex.get(range)?, 16).ok();
        Some(Self::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }

    pub fn to_hex(self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Colors were historically stored both as `"#rrggbb"` and as `[r, g, b]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ColorRepr {
    Hex(String),
    Components(Vec<u8>),
}

impl TryFrom<ColorRepr> for Rgb {
    type Error = String;

    fn try_from(repr: ColorRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            ColorRepr::Hex(hex) => {
                Rgb::parse_hex(&hex).ok_or_else(|| format!("invalid color {hex:?}"))
            }
            ColorRepr::Components(parts) if parts.len() >= 3 => {
                Ok(Rgb::new(parts[0], parts[1], parts[2]))
            }
            ColorRepr::Components(parts) => Err(format!("invalid color components {parts:?}")),
        }
    }
}

impl From<Rgb> for String {
    fn from(color: Rgb) -> Self {
        color.to_hex()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Rect,
    Oval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrokeKind {
    Pen,
    Highlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StampKind {
    Tick,
    Cross,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkupKind {
    Highlight,
    Underline,
    Strikeout,
}

impl MarkupKind {
    pub fn label(self) -> &'static str {
        match self {
            MarkupKind::Highlight => "Highlight",
            MarkupKind::Underline => "Underline",
            MarkupKind::Strikeout => "Strikeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Annotation {
    Note {
        rel_pos: NormPoint,
        text: String,
    },
    Text {
        rel_pos: NormPoint,
        text: String,
        color: Rgb,
    },
    Shape {
        rect: NormRect,
        subtype: ShapeKind,
        color: Rgb,
        thickness: f32,
    },
    Drawing {
        points: Vec<NormPoint>,
        subtype: StrokeKind,
        color: Rgb,
        thickness: f32,
    },
    Stamp {
        rel_pos: NormPoint,
        subtype: StampKind,
        color: Rgb,
    },
    Markup {
        rects: Vec<DocRect>,
        subtype: MarkupKind,
        color: Rgb,
    },
    /// Reference to a snipped region and the LaTeX recognized from it.
    Snip {
        rect: NormRect,
        latex: String,
    },
}

impl Annotation {
    /// Eraser distance from `point`, in page-relative units. `geometry` must
    /// describe the page this record belongs to.
    fn hit_distance(&self, point: NormPoint, geometry: &PageGeometry) -> f32 {
        match self {
            Annotation::Note { rel_pos, .. }
            | Annotation::Text { rel_pos, .. }
            | Annotation::Stamp { rel_pos, .. } => rel_pos.distance(&point),
            Annotation::Shape { rect, .. } | Annotation::Snip { rect, .. } => {
                if rect.contains(&point) {
                    0.0
                } else {
                    rect.center().distance(&point)
                }
            }
            Annotation::Drawing { points, .. } => points
                .iter()
                .map(|p| p.distance(&point))
                .fold(1.0, f32::min),
            Annotation::Markup { rects, .. } => {
                let pixel = geometry.to_pixel(point);
                let hit = rects.iter().any(|rect| {
                    doc_to_pixel(*rect, geometry.scale, geometry.height)
                        .contains(pixel, MARKUP_HIT_PADDING)
                });
                if hit {
                    0.0
                } else {
                    1.0
                }
            }
        }
    }
}

/// Flat per-document map, keyed by page index rendered as a decimal string.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotationMap(
    #[serde_as(as = "BTreeMap<DisplayFromStr, _>")] BTreeMap<usize, Vec<Annotation>>,
);

impl AnnotationMap {
    pub fn page(&self, page: usize) -> &[Annotation] {
        self.0.get(&page).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn pages(&self) -> impl Iterator<Item = (usize, &[Annotation])> {
        self.0.iter().map(|(page, records)| (*page, records.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    fn push(&mut self, page: usize, record: Annotation) {
        self.0.entry(page).or_default().push(record);
    }

    fn pop(&mut self, page: usize) -> Option<Annotation> {
        let records = self.0.get_mut(&page)?;
        let record = records.pop();
        if records.is_empty() {
            self.0.remove(&page);
        }
        record
    }

    fn remove(&mut self, page: usize, index: usize) -> Option<Annotation> {
        let records = self.0.get_mut(&page)?;
        if index >= records.len() {
            return None;
        }
        let record = records.remove(index);
        if records.is_empty() {
            self.0.remove(&page);
        }
        Some(record)
    }

    fn get_mut(&mut self, page: usize, index: usize) -> Option<&mut Annotation> {
        self.0.get_mut(&page)?.get_mut(index)
    }
}

/// Undo log entry. Undo always removes the last record of the page, so the
/// entry only needs to remember which page was touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAction {
    Added { page: usize },
}

pub struct AnnotationStore {
    document: PathBuf,
    map: AnnotationMap,
    undo: Vec<EditAction>,
    redo: Vec<(usize, Annotation)>,
    repository: Arc<dyn AnnotationRepository>,
    eraser_threshold: f32,
}

impl AnnotationStore {
    /// Loads the document's annotations. A missing or unreadable sidecar
    /// yields an empty store.
    pub fn open(document: &Path, repository: Arc<dyn AnnotationRepository>) -> Self {
        let map = repository.load(document);
        debug!(
            path = %document.display(),
            records = map.len(),
            "loaded annotations"
        );
        Self {
            document: document.to_path_buf(),
            map,
            undo: Vec::new(),
            redo: Vec::new(),
            repository,
            eraser_threshold: ERASER_THRESHOLD,
        }
    }

    pub fn with_eraser_threshold(mut self, threshold: f32) -> Self {
        self.eraser_threshold = threshold;
        self
    }

    pub fn map(&self) -> &AnnotationMap {
        &self.map
    }

    pub fn page(&self, page: usize) -> &[Annotation] {
        self.map.page(page)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    /// Appends `record` to `page`. Returns the page that needs re-rendering.
    pub fn add(&mut self, page: usize, record: Annotation) -> usize {
        self.map.push(page, record);
        self.undo.push(EditAction::Added { page });
        self.redo.clear();
        self.persist();
        page
    }

    /// Removes the last record of the most recently edited page.
    pub fn undo(&mut self) -> Option<usize> {
        let EditAction::Added { page } = self.undo.pop()?;
        let record = self.map.pop(page)?;
        self.redo.push((page, record));
        self.persist();
        Some(page)
    }

    /// Re-appends the last undone record to the end of its page.
    pub fn redo(&mut self) -> Option<usize> {
        let (page, record) = self.redo.pop()?;
        self.map.push(page, record);
        self.undo.push(EditAction::Added { page });
        self.persist();
        Some(page)
    }

    /// Approximate eraser: drops the single closest record within the eraser
    /// threshold of `position`. Not recorded on the undo log.
    pub fn delete_nearest(
        &mut self,
        page: usize,
        position: PixelPoint,
        geometry: &PageGeometry,
    ) -> Option<Annotation> {
        let point = geometry.normalize(position);
        let mut best: Option<(usize, f32)> = None;
        for (idx, record) in self.map.page(page).iter().enumerate() {
            let distance = record.hit_distance(point, geometry);
            let limit = best.map_or(self.eraser_threshold, |(_, d)| d);
            if distance < limit {
                best = Some((idx, distance));
            }
        }
        let (index, _) = best?;
        let removed = self.map.remove(page, index)?;
        self.persist();
        Some(removed)
    }

    /// Index of the first note or text record within [`NOTE_HIT_RADIUS`].
    pub fn note_at(&self, page: usize, position: PixelPoint, geometry: &PageGeometry) -> Option<usize> {
        self.map.page(page).iter().position(|record| match record {
            Annotation::Note { rel_pos, .. } | Annotation::Text { rel_pos, .. } => {
                let anchor = geometry.to_pixel(*rel_pos);
                let dx = anchor.x - position.x;
                let dy = anchor.y - position.y;
                (dx * dx + dy * dy).sqrt() < NOTE_HIT_RADIUS
            }
            _ => false,
        })
    }

    /// Replaces a note's text; blank text deletes the note.
    pub fn edit_note(&mut self, page: usize, index: usize, text: &str) -> bool {
        let changed = if text.trim().is_empty() {
            self.map.remove(page, index).is_some()
        } else {
            match self.map.get_mut(page, index) {
                Some(Annotation::Note { text: current, .. })
                | Some(Annotation::Text { text: current, .. }) => {
                    *current = text.to_string();
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.persist();
        }
        changed
    }

    pub fn flush(&self) -> ViewResult<()> {
        self.repository
            .save(&self.document, &self.map)
            .map_err(|source| ViewError::Persistence {
                path: self.document.clone(),
                source,
            })
    }

    fn persist(&self) {
        if let Err(err) = self.flush() {
            warn!(?err, path = %self.document.display(), "failed to save annotations");
        }
    }

    /// Markdown digest of notes and markup, one section per page.
    pub fn export_markdown(&self, title: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Notes: {title}\n");
        for (page, records) in self.map.pages() {
            if records.is_empty() {
                continue;
            }
            let _ = writeln!(out, "## Page {}\n", page + 1);
            for record in records {
                match record {
                    Annotation::Note { text, .. } | Annotation::Text { text, .. } => {
                        if !text.is_empty() {
                            let _ = writeln!(out, "- **Note:** {}", text.replace('\n', "\n> "));
                        }
                    }
                    Annotation::Markup { subtype, .. } => {
                        let _ = writeln!(out, "- *{}*", subtype.label());
                    }
                    Annotation::Snip { latex, .. } if !latex.is_empty() => {
                        let _ = writeln!(out, "- $${latex}$$");
                    }
                    _ => {}
                }
            }
            out.push_str("\n---\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryAnnotationRepository;

    fn store() -> (AnnotationStore, Arc<MemoryAnnotationRepository>) {
        let repo = Arc::new(MemoryAnnotationRepository::default());
        let store = AnnotationStore::open(Path::new("/docs/book.pdf"), repo.clone());
        (store, repo)
    }

    fn note(x: f32, y: f32, text: &str) -> Annotation {
        Annotation::Note {
            rel_pos: NormPoint::new(x, y),
            text: text.to_string(),
        }
    }

    fn drawing(points: &[(f32, f32)]) -> Annotation {
        Annotation::Drawing {
            points: points.iter().map(|&p| p.into()).collect(),
            subtype: StrokeKind::Pen,
            color: Rgb::RED,
            thickness: 3.0,
        }
    }

    fn geometry() -> PageGeometry {
        PageGeometry {
            width: 595.0,
            height: 842.0,
            scale: 1.0,
        }
    }

    #[test]
    fn add_undo_redo_restores_page_list() {
        let (mut store, _) = store();
        store.add(2, note(0.1, 0.1, "first"));
        let expected = store.page(2).to_vec();
        store.undo();
        assert!(store.page(2).is_empty());
        store.redo();
        assert_eq!(store.page(2), expected.as_slice());
    }

    #[test]
    fn undo_twice_then_redo_twice_on_same_page_keeps_order() {
        let (mut store, _) = store();
        let a = note(0.2, 0.2, "a");
        let b = drawing(&[(0.5, 0.5), (0.6, 0.6)]);
        store.add(2, a.clone());
        store.add(2, b.clone());
        store.undo();
        store.undo();
        assert!(store.page(2).is_empty());
        store.redo();
        store.redo();
        assert_eq!(store.page(2), &[a, b]);
    }

    #[test]
    fn undo_is_lifo_per_touched_page() {
        let (mut store, _) = store();
        store.add(5, note(0.1, 0.1, "five"));
        store.add(2, note(0.1, 0.1, "two"));
        assert_eq!(store.undo(), Some(2));
        assert_eq!(store.page(5).len(), 1);
        assert!(store.page(2).is_empty());
    }

    #[test]
    fn new_edit_invalidates_redo() {
        let (mut store, _) = store();
        store.add(0, note(0.1, 0.1, "a"));
        store.undo();
        assert!(store.can_redo());
        store.add(0, note(0.2, 0.2, "b"));
        assert!(!store.can_redo());
        assert_eq!(store.redo(), None);
    }

    #[test]
    fn every_edit_is_persisted() {
        let (mut store, repo) = store();
        store.add(1, note(0.3, 0.3, "saved"));
        let saved = repo.load(Path::new("/docs/book.pdf"));
        assert_eq!(saved.page(1).len(), 1);
        store.undo();
        assert!(repo.load(Path::new("/docs/book.pdf")).is_empty());
    }

    #[test]
    fn eraser_removes_closest_record_within_threshold() {
        let (mut store, _) = store();
        store.add(0, note(0.50, 0.50, "near"));
        store.add(0, note(0.53, 0.50, "nearer"));
        let geometry = geometry();
        let click = PixelPoint::new(0.54 * 595.0, 0.50 * 842.0);
        let removed = store.delete_nearest(0, click, &geometry);
        assert_eq!(removed, Some(note(0.53, 0.50, "nearer")));
        assert_eq!(store.page(0).len(), 1);
    }

    #[test]
    fn eraser_ignores_far_clicks() {
        let (mut store, _) = store();
        store.add(0, note(0.1, 0.1, "corner"));
        let click = PixelPoint::new(0.9 * 595.0, 0.9 * 842.0);
        assert!(store.delete_nearest(0, click, &geometry()).is_none());
        assert_eq!(store.page(0).len(), 1);
    }

    #[test]
    fn eraser_hits_drawings_shapes_and_markup() {
        let (mut store, _) = store();
        let geometry = geometry();
        store.add(0, drawing(&[(0.1, 0.1), (0.2, 0.2), (0.3, 0.3)]));
        store.add(
            0,
            Annotation::Shape {
                rect: NormRect::new(0.6, 0.6, 0.2, 0.2),
                subtype: ShapeKind::Oval,
                color: Rgb::BLUE,
                thickness: 2.0,
            },
        );
        store.add(
            0,
            Annotation::Markup {
                rects: vec![DocRect::new(100.0, 800.0, 200.0, 780.0)],
                subtype: MarkupKind::Highlight,
                color: Rgb::YELLOW,
            },
        );

        let on_stroke = PixelPoint::new(0.21 * 595.0, 0.2 * 842.0);
        assert!(matches!(
            store.delete_nearest(0, on_stroke, &geometry),
            Some(Annotation::Drawing { .. })
        ));
        let inside_shape = PixelPoint::new(0.7 * 595.0, 0.7 * 842.0);
        assert!(matches!(
            store.delete_nearest(0, inside_shape, &geometry),
            Some(Annotation::Shape { .. })
        ));
        // doc y 790 sits at pixel y 52 on an 842-high page at scale 1.
        let on_markup = PixelPoint::new(150.0, 52.0);
        assert!(matches!(
            store.delete_nearest(0, on_markup, &geometry),
            Some(Annotation::Markup { .. })
        ));
        assert!(store.page(0).is_empty());
    }

    #[test]
    fn markup_hit_test_uses_the_pages_own_scale() {
        let (mut store, _) = store();
        store.add(
            3,
            Annotation::Markup {
                rects: vec![DocRect::new(100.0, 800.0, 200.0, 780.0)],
                subtype: MarkupKind::Underline,
                color: Rgb::BLUE,
            },
        );
        let zoomed = PageGeometry {
            width: 1190.0,
            height: 1684.0,
            scale: 2.0,
        };
        let click = PixelPoint::new(300.0, 1684.0 - 1580.0);
        assert!(store.delete_nearest(3, click, &zoomed).is_some());
    }

    #[test]
    fn note_editing_updates_or_deletes() {
        let (mut store, _) = store();
        store.add(4, note(0.5, 0.5, "draft"));
        let geometry = geometry();
        let click = PixelPoint::new(0.5 * 595.0 + 5.0, 0.5 * 842.0);
        let index = store.note_at(4, click, &geometry).unwrap();
        assert!(store.edit_note(4, index, "final"));
        assert_eq!(store.page(4), &[note(0.5, 0.5, "final")]);
        assert!(store.edit_note(4, index, "   "));
        assert!(store.page(4).is_empty());
    }

    #[test]
    fn sidecar_format_uses_string_page_keys_and_tagged_records() {
        let (mut store, _) = store();
        store.add(
            12,
            Annotation::Markup {
                rects: vec![DocRect::new(1.0, 4.0, 3.0, 2.0)],
                subtype: MarkupKind::Strikeout,
                color: Rgb::RED,
            },
        );
        let json = serde_json::to_value(store.map()).unwrap();
        let record = &json["12"][0];
        assert_eq!(record["type"], "markup");
        assert_eq!(record["subtype"], "strikeout");
        assert_eq!(record["color"], "#ff0000");
        assert_eq!(record["rects"][0][1], 4.0);
    }

    #[test]
    fn legacy_component_colors_are_accepted() {
        let json = r##"{"0":[{"type":"markup","rects":[[1,4,3,2]],"subtype":"highlight","color":[255,255,0]}],
                       "7":[{"type":"note","rel_pos":[0.5,0.25],"text":"hi","color":"#ff0000"}]}"##;
        let map: AnnotationMap = serde_json::from_str(json).unwrap();
        assert!(matches!(
            map.page(0)[0],
            Annotation::Markup { color: Rgb::YELLOW, .. }
        ));
        assert_eq!(map.page(7), &[note(0.5, 0.25, "hi")]);
    }

    #[test]
    fn markdown_export_lists_pages_in_numeric_order() {
        let (mut store, _) = store();
        store.add(10, note(0.1, 0.1, "line one\nline two"));
        store.add(
            2,
            Annotation::Markup {
                rects: vec![DocRect::new(1.0, 4.0, 3.0, 2.0)],
                subtype: MarkupKind::Underline,
                color: Rgb::BLUE,
            },
        );
        let md = store.export_markdown("book.pdf");
        assert!(md.starts_with("# Notes: book.pdf\n\n"));
        let page3 = md.find("## Page 3").unwrap();
        let page11 = md.find("## Page 11").unwrap();
        assert!(page3 < page11);
        assert!(md.contains("- *Underline*"));
        assert!(md.contains("- **Note:** line one\n> line two"));
    }
}
