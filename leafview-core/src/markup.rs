//! Drag selection that snaps to text segment bounds.

use std::collections::HashSet;

use crate::annotations::{Annotation, MarkupKind, Rgb};
use crate::geometry::{doc_to_pixel, pixel_to_doc, DocRect, PixelPoint, PixelRect};
use crate::TextSegment;

/// Default color for a markup subtype. Underlines follow the theme
/// foreground so they stay visible in dark mode.
pub fn default_color(kind: MarkupKind, foreground: Rgb) -> Rgb {
    match kind {
        MarkupKind::Highlight => Rgb::YELLOW,
        MarkupKind::Underline => foreground,
        MarkupKind::Strikeout => Rgb::RED,
    }
}

/// Preview tint while dragging: yellow, blue or red by subtype.
pub fn preview_color(kind: MarkupKind) -> Rgb {
    match kind {
        MarkupKind::Highlight => Rgb::YELLOW,
        MarkupKind::Underline => Rgb::BLUE,
        MarkupKind::Strikeout => Rgb::RED,
    }
}

/// Segment rects touched by a pixel drag rect, in segment order, without
/// duplicates.
pub fn snap(drag: PixelRect, segments: &[TextSegment], scale: f32, page_height: f32) -> Vec<DocRect> {
    let drag = drag.normalized();
    if drag.is_empty() {
        return Vec::new();
    }
    let area = pixel_to_doc(drag, scale, page_height);
    let mut seen = HashSet::new();
    segments
        .iter()
        .map(|segment| segment.rect)
        .filter(|rect| area.overlaps(rect))
        .filter(|rect| seen.insert(rect.key()))
        .collect()
}

#[derive(Debug, Clone)]
struct Drag {
    page: usize,
    start: PixelPoint,
    kind: MarkupKind,
    snapped: Vec<DocRect>,
}

#[derive(Debug, Default)]
pub struct MarkupSelector {
    drag: Option<Drag>,
}

impl MarkupSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.drag.is_some()
    }

    pub fn page(&self) -> Option<usize> {
        self.drag.as_ref().map(|drag| drag.page)
    }

    pub fn begin(&mut self, page: usize, start: PixelPoint, kind: MarkupKind) {
        self.drag = Some(Drag {
            page,
            start,
            kind,
            snapped: Vec::new(),
        });
    }

    /// Recomputes the live snap set from the current drag rect.
    pub fn update(
        &mut self,
        current: PixelPoint,
        segments: &[TextSegment],
        scale: f32,
        page_height: f32,
    ) -> &[DocRect] {
        match self.drag.as_mut() {
            Some(drag) => {
                let rect = PixelRect::from_corners(drag.start, current);
                drag.snapped = snap(rect, segments, scale, page_height);
                &drag.snapped
            }
            None => &[],
        }
    }

    /// Pixel-space preview of the live snap set with its tint.
    pub fn preview(&self, scale: f32, page_height: f32) -> Vec<(PixelRect, Rgb)> {
        let Some(drag) = self.drag.as_ref() else {
            return Vec::new();
        };
        let color = preview_color(drag.kind);
        drag.snapped
            .iter()
            .map(|rect| (doc_to_pixel(*rect, scale, page_height), color))
            .collect()
    }

    /// Ends the drag. Returns the page and record to add when anything was
    /// snapped; the selection is cleared either way.
    pub fn finish(&mut self, color: Option<Rgb>, foreground: Rgb) -> Option<(usize, Annotation)> {
        let drag = self.drag.take()?;
        if drag.snapped.is_empty() {
            return None;
        }
        let record = Annotation::Markup {
            rects: drag.snapped,
            subtype: drag.kind,
            color: color.unwrap_or_else(|| default_color(drag.kind, foreground)),
        };
        Some((drag.page, record))
    }

    pub fn cancel(&mut self) {
        self.drag = None;
    }
}
