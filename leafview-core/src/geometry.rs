//! Conversions between decoder document space and on-screen pixel space.
//!
//! Document space has its origin at the bottom-left of the page and does not
//! depend on zoom. Pixel space has its origin at the top-left and is scaled by
//! the active zoom factor.

use serde::{Deserialize, Serialize};

/// Rectangle in document space. `top` is expected to be above `bottom`, but
/// decoders do not always honour that; see [`DocRect::normalized`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct DocRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl DocRect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Returns the same area with `left <= right` and `top >= bottom`.
    pub fn normalized(self) -> Self {
        Self {
            left: self.left.min(self.right),
            right: self.left.max(self.right),
            top: self.top.max(self.bottom),
            bottom: self.top.min(self.bottom),
        }
    }

    pub fn overlaps(&self, other: &DocRect) -> bool {
        let a = self.normalized();
        let b = other.normalized();
        a.left < b.right && a.right > b.left && a.bottom < b.top && a.top > b.bottom
    }

    /// Bit-exact key, used where a decoder rect identifies an object.
    pub fn key(&self) -> [u32; 4] {
        [
            self.left.to_bits(),
            self.top.to_bits(),
            self.right.to_bits(),
            self.bottom.to_bits(),
        ]
    }

    pub fn approx_eq(&self, other: &DocRect, tolerance: f32) -> bool {
        (self.left - other.left).abs() <= tolerance
            && (self.top - other.top).abs() <= tolerance
            && (self.right - other.right).abs() <= tolerance
            && (self.bottom - other.bottom).abs() <= tolerance
    }
}

impl From<[f32; 4]> for DocRect {
    fn from([left, top, right, bottom]: [f32; 4]) -> Self {
        Self::new(left, top, right, bottom)
    }
}

impl From<DocRect> for [f32; 4] {
    fn from(rect: DocRect) -> Self {
        [rect.left, rect.top, rect.right, rect.bottom]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PixelPoint {
    pub x: f32,
    pub y: f32,
}

impl PixelPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Rectangle in logical pixel space, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PixelRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl PixelRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle spanned by two drag corners, in any order.
    pub fn from_corners(a: PixelPoint, b: PixelPoint) -> Self {
        Self {
            x: a.x.min(b.x),
            y: a.y.min(b.y),
            width: (a.x - b.x).abs(),
            height: (a.y - b.y).abs(),
        }
    }

    pub fn normalized(self) -> Self {
        let mut rect = self;
        if rect.width < 0.0 {
            rect.x += rect.width;
            rect.width = -rect.width;
        }
        if rect.height < 0.0 {
            rect.y += rect.height;
            rect.height = -rect.height;
        }
        rect
    }

    pub fn contains(&self, point: PixelPoint, padding: f32) -> bool {
        point.x >= self.x - padding
            && point.x <= self.x + self.width + padding
            && point.y >= self.y - padding
            && point.y <= self.y + self.height + padding
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// Page-relative point, both axes in `[0, 1]` of the rendered page size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f32, f32)", into = "(f32, f32)")]
pub struct NormPoint {
    pub x: f32,
    pub y: f32,
}

impl NormPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &NormPoint) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

impl From<(f32, f32)> for NormPoint {
    fn from((x, y): (f32, f32)) -> Self {
        Self { x, y }
    }
}

impl From<NormPoint> for (f32, f32) {
    fn from(point: NormPoint) -> Self {
        (point.x, point.y)
    }
}

/// Page-relative rectangle `(x, y, w, h)`, normalized like [`NormPoint`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f32, f32, f32, f32)", into = "(f32, f32, f32, f32)")]
pub struct NormRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl NormRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn contains(&self, point: &NormPoint) -> bool {
        point.x >= self.x
            && point.x <= self.x + self.width
            && point.y >= self.y
            && point.y <= self.y + self.height
    }

    pub fn center(&self) -> NormPoint {
        NormPoint::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

impl From<(f32, f32, f32, f32)> for NormRect {
    fn from((x, y, width, height): (f32, f32, f32, f32)) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

impl From<NormRect> for (f32, f32, f32, f32) {
    fn from(rect: NormRect) -> Self {
        (rect.x, rect.y, rect.width, rect.height)
    }
}

/// Logical size of a rendered page, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    pub width: f32,
    pub height: f32,
    pub scale: f32,
}

impl PageGeometry {
    pub fn normalize(&self, point: PixelPoint) -> NormPoint {
        NormPoint::new(
            point.x / self.width.max(f32::EPSILON),
            point.y / self.height.max(f32::EPSILON),
        )
    }

    pub fn to_pixel(&self, point: NormPoint) -> PixelPoint {
        PixelPoint::new(point.x * self.width, point.y * self.height)
    }

    pub fn rect_to_pixel(&self, rect: NormRect) -> PixelRect {
        PixelRect::new(
            rect.x * self.width,
            rect.y * self.height,
            rect.width * self.width,
            rect.height * self.height,
        )
    }
}

/// Maps a document-space rect onto a page rendered at `scale` whose logical
/// pixel height is `page_height`. Never returns a negative height.
pub fn doc_to_pixel(rect: DocRect, scale: f32, page_height: f32) -> PixelRect {
    let x = rect.left * scale;
    let width = (rect.right - rect.left) * scale;
    let mut height = (rect.top - rect.bottom) * scale;
    let mut y = page_height - rect.top * scale;
    if height < 0.0 {
        y += height;
        height = height.abs();
    }
    PixelRect::new(x, y, width, height).normalized()
}

/// Inverse of [`doc_to_pixel`]. The pixel rect is normalized first, so the
/// result always has `top >= bottom`.
pub fn pixel_to_doc(rect: PixelRect, scale: f32, page_height: f32) -> DocRect {
    let rect = rect.normalized();
    let scale = if scale > 0.0 { scale } else { 1.0 };
    DocRect {
        left: rect.x / scale,
        right: (rect.x + rect.width) / scale,
        top: (page_height - rect.y) / scale,
        bottom: (page_height - rect.y - rect.height) / scale,
    }
}
