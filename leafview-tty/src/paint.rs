//! Software rasterizer for composited pages.
//!
//! The engine hands out decoder bitmaps plus overlay primitives in logical
//! pixels. The terminal can only show one flat image, so everything visible
//! is flattened here before it is sent through the kitty protocol.

use std::collections::HashSet;
use std::f32::consts::TAU;

use leafview_core::render_cache::{FORM_FILL, SEARCH_HIGHLIGHT};
use leafview_core::{
    CompositedPage, FormFieldKind, FormOverlay, Frame, Overlay, OverlayShape, PageSize,
    PageSlot, PixelPoint, PixelRect, RenderImage, Rgb, Rgba, StampKind, Viewport, WindowLayout,
};

/// Horizontal gap between the two pages of a facing row.
pub const PAGE_GAP: f32 = 10.0;

const PLACEHOLDER_FILL: Rgba = Rgba::new(128, 128, 128, 48);
const PLACEHOLDER_EDGE: Rgba = Rgba::new(128, 128, 128, 160);
const FORM_EDGE: Rgba = Rgba::new(90, 120, 200, 160);
const CHECK_MARK: Rgba = Rgba::new(20, 20, 20, 220);
const PREVIEW_ALPHA: u8 = 90;

pub const LIGHT_BACKGROUND: Rgba = Rgba::new(235, 235, 235, 255);
pub const DARK_BACKGROUND: Rgba = Rgba::new(30, 30, 30, 255);

/// Where one page lands in the viewport, in logical pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub page: usize,
    pub rect: PixelRect,
}

/// Lays out the materialized rows that intersect the viewport. Pages share
/// one logical size; rows are centered horizontally.
pub fn placements(
    layout: &WindowLayout,
    scroll_offset: f32,
    viewport: Viewport,
    page: PageSize,
) -> Vec<Placement> {
    let (page_width, page_height) = (page.width, page.height);
    let mut out = Vec::new();
    for (idx, row) in layout.rows.iter().enumerate() {
        let top = layout.spacer_before + idx as f32 * layout.row_height - scroll_offset;
        if top > viewport.height || top + layout.row_height < 0.0 {
            continue;
        }
        let pages: Vec<usize> = row.pages().collect();
        let row_width =
            pages.len() as f32 * page_width + pages.len().saturating_sub(1) as f32 * PAGE_GAP;
        let left = ((viewport.width - row_width) / 2.0).max(0.0);
        for (column, page) in pages.into_iter().enumerate() {
            out.push(Placement {
                page,
                rect: PixelRect::new(
                    left + column as f32 * (page_width + PAGE_GAP),
                    top,
                    page_width,
                    page_height,
                ),
            });
        }
    }
    out
}

/// Page and page-local position under a viewport point.
pub fn locate(placements: &[Placement], point: PixelPoint) -> Option<(usize, PixelPoint)> {
    placements
        .iter()
        .find(|placement| placement.rect.contains(point, 0.0))
        .map(|placement| {
            (
                placement.page,
                PixelPoint::new(point.x - placement.rect.x, point.y - placement.rect.y),
            )
        })
}

/// Flattens everything visible in `frame` into a viewport-sized image.
pub fn compose_frame(
    frame: &Frame<'_>,
    scroll_offset: f32,
    viewport: Viewport,
    page: PageSize,
    background: Rgba,
) -> RenderImage {
    let ratio = device_ratio(viewport.device_pixel_ratio);
    let width = (viewport.width * ratio).round().max(1.0) as u32;
    let height = (viewport.height * ratio).round().max(1.0) as u32;
    let mut target = RenderImage {
        width,
        height,
        pixels: [background.r, background.g, background.b, 255].repeat((width * height) as usize),
    };

    for placement in placements(frame.layout, scroll_offset, viewport, page) {
        let slot = frame
            .slots
            .iter()
            .find(|slot| slot.page_index() == placement.page);
        let mut canvas = Canvas::new(&mut target, ratio);
        match slot {
            Some(PageSlot::Rendered(rendered)) => {
                let mut painted = paint_page(rendered);
                if frame.markup_page == Some(rendered.page_index) {
                    let ratio = rendered.device_pixel_ratio;
                    paint_markup_preview(&mut painted, ratio, &frame.markup_preview);
                }
                canvas.blit(&painted, placement.rect.x, placement.rect.y);
            }
            _ => {
                canvas.fill_rect(placement.rect, PLACEHOLDER_FILL);
                canvas.outline(placement.rect, 1.0, PLACEHOLDER_EDGE);
            }
        }
    }
    target
}

/// Copies the page bitmap and burns its overlays into it.
pub fn paint_page(page: &CompositedPage) -> RenderImage {
    let mut image = page.bitmap.clone();
    let mut canvas = Canvas::new(&mut image, device_ratio(page.device_pixel_ratio));
    for overlay in &page.overlays {
        match overlay {
            Overlay::Form(form) => canvas.form(form),
            Overlay::SearchHighlight(rect) => canvas.fill_rect(*rect, SEARCH_HIGHLIGHT),
            Overlay::Annotation { shape, color } => canvas.shape(shape, *color),
        }
    }
    image
}

pub fn paint_markup_preview(image: &mut RenderImage, ratio: f32, preview: &[(PixelRect, Rgb)]) {
    let mut canvas = Canvas::new(image, device_ratio(ratio));
    for (rect, color) in preview {
        canvas.fill_rect(*rect, Rgba::from_rgb(*color, PREVIEW_ALPHA));
    }
}

fn device_ratio(ratio: f32) -> f32 {
    if ratio > 0.0 && ratio.is_finite() {
        ratio
    } else {
        1.0
    }
}

struct Canvas<'a> {
    image: &'a mut RenderImage,
    ratio: f32,
}

impl<'a> Canvas<'a> {
    fn new(image: &'a mut RenderImage, ratio: f32) -> Self {
        Self { image, ratio }
    }

    /// Device pixel span covering `[start, start + len)` logical pixels.
    fn span(&self, start: f32, len: f32, limit: u32) -> (u32, u32) {
        let limit = limit as f32;
        let from = (start * self.ratio).floor().clamp(0.0, limit);
        let to = ((start + len) * self.ratio).ceil().clamp(0.0, limit);
        (from as u32, to.max(from) as u32)
    }

    fn fill_rect(&mut self, rect: PixelRect, color: Rgba) {
        let rect = rect.normalized();
        let (x0, x1) = self.span(rect.x, rect.width, self.image.width);
        let (y0, y1) = self.span(rect.y, rect.height, self.image.height);
        let width = self.image.width as usize;
        for y in y0..y1 {
            let row_start = y as usize * width * 4;
            for x in x0..x1 {
                let idx = row_start + x as usize * 4;
                blend_pixel(&mut self.image.pixels[idx..idx + 4], color);
            }
        }
    }

    fn outline(&mut self, rect: PixelRect, thickness: f32, color: Rgba) {
        let rect = rect.normalized();
        let corners = [
            PixelPoint::new(rect.x, rect.y),
            PixelPoint::new(rect.x + rect.width, rect.y),
            PixelPoint::new(rect.x + rect.width, rect.y + rect.height),
            PixelPoint::new(rect.x, rect.y + rect.height),
        ];
        let segments = (0..4).map(|i| (corners[i], corners[(i + 1) % 4]));
        self.stroke(segments, thickness, color);
    }

    fn ellipse(&mut self, rect: PixelRect, thickness: f32, color: Rgba) {
        let rect = rect.normalized();
        let rx = rect.width / 2.0;
        let ry = rect.height / 2.0;
        let cx = rect.x + rx;
        let cy = rect.y + ry;
        let steps = ((rx + ry) * self.ratio * 2.0).ceil().max(16.0) as usize;
        let point = |i: usize| {
            let angle = TAU * i as f32 / steps as f32;
            PixelPoint::new(cx + rx * angle.cos(), cy + ry * angle.sin())
        };
        self.stroke((0..steps).map(|i| (point(i), point(i + 1))), thickness, color);
    }

    fn shape(&mut self, shape: &OverlayShape, color: Rgba) {
        match shape {
            OverlayShape::Fill(rect) => self.fill_rect(*rect, color),
            OverlayShape::Outline { rect, thickness } => self.outline(*rect, *thickness, color),
            OverlayShape::Ellipse { rect, thickness } => self.ellipse(*rect, *thickness, color),
            OverlayShape::Line {
                from,
                to,
                thickness,
            } => self.stroke([(*from, *to)], *thickness, color),
            OverlayShape::Polyline { points, thickness } => {
                if let [only] = points.as_slice() {
                    self.stroke([(*only, *only)], *thickness, color);
                } else {
                    let segments = points.windows(2).map(|pair| (pair[0], pair[1]));
                    self.stroke(segments, *thickness, color);
                }
            }
            OverlayShape::Stamp { center, kind, size } => {
                let half = size / 2.0;
                let thickness = (size / 8.0).max(1.0);
                let at = |dx: f32, dy: f32| PixelPoint::new(center.x + dx, center.y + dy);
                match kind {
                    StampKind::Tick => self.stroke(
                        [
                            (at(-half, 0.0), at(-half / 3.0, half * 0.66)),
                            (at(-half / 3.0, half * 0.66), at(half, -half)),
                        ],
                        thickness,
                        color,
                    ),
                    StampKind::Cross => self.stroke(
                        [
                            (at(-half, -half), at(half, half)),
                            (at(-half, half), at(half, -half)),
                        ],
                        thickness,
                        color,
                    ),
                }
            }
            OverlayShape::NoteIcon { anchor, size } => {
                let rect = PixelRect::new(anchor.x - size / 2.0, anchor.y - size / 2.0, *size, *size);
                self.fill_rect(rect, color);
                self.outline(rect, (size / 12.0).max(1.0), Rgba::new(0, 0, 0, color.a));
            }
            OverlayShape::Label { anchor, text, size } => {
                // No glyph rendering here; the label shows as a bar spanning
                // its approximate text extent.
                let columns = text.lines().map(|line| line.chars().count()).max().unwrap_or(0);
                let lines = text.lines().count().max(1);
                let rect = PixelRect::new(
                    anchor.x,
                    anchor.y,
                    columns as f32 * size * 0.55,
                    lines as f32 * size * 1.2,
                );
                self.fill_rect(rect, Rgba::new(color.r, color.g, color.b, 60));
                self.outline(rect, 1.0, color);
            }
        }
    }

    fn form(&mut self, form: &FormOverlay) {
        self.fill_rect(form.rect, FORM_FILL);
        self.outline(form.rect, 1.0, FORM_EDGE);
        let checkable = matches!(form.kind, FormFieldKind::Checkbox | FormFieldKind::RadioButton);
        if checkable && form.checked {
            let inset = form.rect.width.min(form.rect.height) * 0.25;
            let mark = PixelRect::new(
                form.rect.x + inset,
                form.rect.y + inset,
                form.rect.width - inset * 2.0,
                form.rect.height - inset * 2.0,
            );
            self.fill_rect(mark, CHECK_MARK);
        }
    }

    /// Strokes the segments with a round brush. Pixels are collected first so
    /// overlapping dabs blend once.
    fn stroke<I>(&mut self, segments: I, thickness: f32, color: Rgba)
    where
        I: IntoIterator<Item = (PixelPoint, PixelPoint)>,
    {
        let radius = (thickness * self.ratio / 2.0).max(0.5);
        let mut mask = HashSet::new();
        for (from, to) in segments {
            let (fx, fy) = (from.x * self.ratio, from.y * self.ratio);
            let (dx, dy) = ((to.x - from.x) * self.ratio, (to.y - from.y) * self.ratio);
            let steps = dx.abs().max(dy.abs()).ceil().max(1.0) as usize;
            for step in 0..=steps {
                let t = step as f32 / steps as f32;
                self.dab(&mut mask, fx + dx * t, fy + dy * t, radius);
            }
        }
        for idx in mask {
            blend_pixel(&mut self.image.pixels[idx * 4..idx * 4 + 4], color);
        }
    }

    fn dab(&self, mask: &mut HashSet<usize>, cx: f32, cy: f32, radius: f32) {
        let width = self.image.width as f32;
        let height = self.image.height as f32;
        let x0 = (cx - radius).floor().clamp(0.0, width) as u32;
        let x1 = (cx + radius).ceil().clamp(0.0, width) as u32;
        let y0 = (cy - radius).floor().clamp(0.0, height) as u32;
        let y1 = (cy + radius).ceil().clamp(0.0, height) as u32;
        let limit = radius * radius + 0.25;
        for y in y0..y1 {
            for x in x0..x1 {
                let px = x as f32 + 0.5 - cx;
                let py = y as f32 + 0.5 - cy;
                if px * px + py * py <= limit {
                    mask.insert(y as usize * self.image.width as usize + x as usize);
                }
            }
        }
    }

    /// Copies `source` with its top-left corner at logical `(x, y)`, clipped
    /// to the canvas. Source pixels are already device pixels.
    fn blit(&mut self, source: &RenderImage, x: f32, y: f32) {
        let ox = (x * self.ratio).round() as i64;
        let oy = (y * self.ratio).round() as i64;
        let target_width = self.image.width as i64;
        let target_height = self.image.height as i64;
        for sy in 0..source.height as i64 {
            let ty = oy + sy;
            if ty < 0 || ty >= target_height {
                continue;
            }
            let sx0 = (-ox).max(0);
            let sx1 = (source.width as i64).min(target_width - ox);
            if sx0 >= sx1 {
                continue;
            }
            let src = ((sy * source.width as i64 + sx0) * 4) as usize;
            let dst = ((ty * target_width + ox + sx0) * 4) as usize;
            let len = ((sx1 - sx0) * 4) as usize;
            self.image.pixels[dst..dst + len].copy_from_slice(&source.pixels[src..src + len]);
        }
    }
}

fn blend_pixel(pixel: &mut [u8], color: Rgba) {
    let alpha = color.a as f32 / 255.0;
    let inv = 1.0 - alpha;
    let mix = |base: u8, over: u8| {
        ((base as f32 * inv) + (over as f32 * alpha))
            .round()
            .clamp(0.0, 255.0) as u8
    };
    pixel[0] = mix(pixel[0], color.r);
    pixel[1] = mix(pixel[1], color.g);
    pixel[2] = mix(pixel[2], color.b);
}

#[cfg(test)]
mod tests {
    use super::*;
    use leafview_core::{PageRow, PageWindow};

    fn white(width: u32, height: u32) -> RenderImage {
        RenderImage {
            width,
            height,
            pixels: vec![255; (width * height * 4) as usize],
        }
    }

    fn pixel(image: &RenderImage, x: u32, y: u32) -> [u8; 4] {
        let idx = ((y * image.width + x) * 4) as usize;
        [
            image.pixels[idx],
            image.pixels[idx + 1],
            image.pixels[idx + 2],
            image.pixels[idx + 3],
        ]
    }

    fn page_with(overlays: Vec<Overlay>, ratio: f32) -> CompositedPage {
        let width = (40.0 * ratio) as u32;
        let height = (40.0 * ratio) as u32;
        CompositedPage {
            page_index: 0,
            bitmap: white(width, height),
            width: 40.0,
            height: 40.0,
            scale: 1.0,
            device_pixel_ratio: ratio,
            overlays,
        }
    }

    #[test]
    fn opaque_fill_covers_only_its_rect() {
        let page = page_with(
            vec![Overlay::Annotation {
                shape: OverlayShape::Fill(PixelRect::new(10.0, 10.0, 5.0, 5.0)),
                color: Rgba::new(255, 0, 0, 255),
            }],
            1.0,
        );
        let image = paint_page(&page);
        assert_eq!(pixel(&image, 12, 12), [255, 0, 0, 255]);
        assert_eq!(pixel(&image, 15, 15), [255, 255, 255, 255]);
        assert_eq!(pixel(&image, 9, 9), [255, 255, 255, 255]);
    }

    #[test]
    fn overlays_scale_with_device_pixel_ratio() {
        let page = page_with(
            vec![Overlay::SearchHighlight(PixelRect::new(10.0, 10.0, 5.0, 5.0))],
            2.0,
        );
        let image = paint_page(&page);
        assert_eq!(image.width, 80);
        assert_ne!(pixel(&image, 28, 28), [255, 255, 255, 255]);
        assert_eq!(pixel(&image, 31, 31), [255, 255, 255, 255]);
    }

    #[test]
    fn translucent_strokes_blend_once_where_dabs_overlap() {
        let page = page_with(
            vec![Overlay::Annotation {
                shape: OverlayShape::Polyline {
                    points: vec![
                        PixelPoint::new(5.0, 20.0),
                        PixelPoint::new(20.0, 20.0),
                        PixelPoint::new(35.0, 20.0),
                    ],
                    thickness: 4.0,
                },
                color: Rgba::new(0, 0, 0, 128),
            }],
            1.0,
        );
        let image = paint_page(&page);
        let left = pixel(&image, 10, 20);
        let joint = pixel(&image, 20, 20);
        assert_eq!(left, joint);
        assert_eq!(left[0], 127);
    }

    #[test]
    fn checked_boxes_get_a_mark() {
        let form = |checked| FormOverlay {
            field_id: 1,
            rect: PixelRect::new(0.0, 0.0, 20.0, 20.0),
            doc_rect: leafview_core::DocRect::new(0.0, 20.0, 20.0, 0.0),
            kind: FormFieldKind::Checkbox,
            value: String::new(),
            checked,
        };
        let on = paint_page(&page_with(vec![Overlay::Form(form(true))], 1.0));
        let off = paint_page(&page_with(vec![Overlay::Form(form(false))], 1.0));
        assert!(pixel(&on, 10, 10)[0] < 100);
        assert!(pixel(&off, 10, 10)[0] > 200);
    }

    #[test]
    fn placements_center_facing_rows_and_skip_offscreen_rows() {
        let layout = WindowLayout {
            window: PageWindow {
                start: 0,
                end: 4,
                virtual_enabled: false,
            },
            rows: vec![PageRow::Pair(0, 1), PageRow::Pair(2, 3)],
            spacer_before: 0.0,
            spacer_after: 0.0,
            row_height: 60.0,
            facing_pages: true,
        };
        let viewport = Viewport {
            width: 130.0,
            height: 50.0,
            device_pixel_ratio: 1.0,
        };
        let page = PageSize {
            width: 40.0,
            height: 50.0,
        };
        let placed = placements(&layout, 0.0, viewport, page);
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].rect.x, 20.0);
        assert_eq!(placed[1].rect.x, 70.0);
        assert_eq!(placed[0].rect.height, 50.0);

        let hit = locate(&placed, PixelPoint::new(75.0, 12.0));
        assert_eq!(hit, Some((1, PixelPoint::new(5.0, 12.0))));
        assert_eq!(locate(&placed, PixelPoint::new(65.0, 12.0)), None);
    }

    #[test]
    fn blit_clips_at_canvas_edges() {
        let mut target = white(10, 10);
        let source = RenderImage {
            width: 4,
            height: 4,
            pixels: [0, 0, 0, 255].repeat(16),
        };
        Canvas::new(&mut target, 1.0).blit(&source, 8.0, -2.0);
        assert_eq!(pixel(&target, 9, 0), [0, 0, 0, 255]);
        assert_eq!(pixel(&target, 9, 2), [255, 255, 255, 255]);
        assert_eq!(pixel(&target, 7, 0), [255, 255, 255, 255]);
    }
}
