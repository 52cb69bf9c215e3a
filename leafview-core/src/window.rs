//! Page window virtualization.
//!
//! Decides which contiguous run of pages gets on-screen placeholders and how
//! tall the spacers standing in for the rest of the document are.

use std::ops::Range;

#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    /// Documents with at most this many pages are never virtualized.
    pub virtual_threshold: usize,
    pub buffer_before: usize,
    pub buffer_after: usize,
    /// Distance from a window edge that triggers a rebuild.
    pub rebuild_margin: usize,
    pub row_spacing: f32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            virtual_threshold: 300,
            buffer_before: 30,
            buffer_after: 40,
            rebuild_margin: 10,
            row_spacing: 10.0,
        }
    }
}

/// Half-open range of materialized page indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageWindow {
    pub start: usize,
    pub end: usize,
    pub virtual_enabled: bool,
}

impl PageWindow {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn contains(&self, page: usize) -> bool {
        page >= self.start && page < self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One horizontal row of the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRow {
    Single(usize),
    Pair(usize, usize),
}

impl PageRow {
    pub fn first(&self) -> usize {
        match *self {
            PageRow::Single(page) | PageRow::Pair(page, _) => page,
        }
    }

    pub fn contains(&self, page: usize) -> bool {
        match *self {
            PageRow::Single(p) => p == page,
            PageRow::Pair(left, right) => left == page || right == page,
        }
    }

    pub fn pages(&self) -> impl Iterator<Item = usize> {
        let (first, second) = match *self {
            PageRow::Single(p) => (p, None),
            PageRow::Pair(left, right) => (left, Some(right)),
        };
        std::iter::once(first).chain(second)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WindowInput {
    pub page_count: usize,
    pub current_page: usize,
    pub continuous_scroll: bool,
    pub facing_pages: bool,
    /// Logical height of one page at the active scale.
    pub page_height: f32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WindowLayout {
    pub window: PageWindow,
    pub rows: Vec<PageRow>,
    pub spacer_before: f32,
    pub spacer_after: f32,
    pub row_height: f32,
    /// Rows hold spreads: page `p` sits in row `p / 2`.
    pub facing_pages: bool,
}

impl WindowLayout {
    pub fn materialized(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows.iter().flat_map(PageRow::pages)
    }

    pub fn is_materialized(&self, page: usize) -> bool {
        self.rows.iter().any(|row| row.contains(page))
    }

    fn row_of(&self, page: usize) -> Option<usize> {
        self.rows.iter().position(|row| row.contains(page))
    }

    fn pages_per_row(&self) -> usize {
        if self.facing_pages {
            2
        } else {
            1
        }
    }

    /// Total scrollable height of the layout.
    pub fn content_height(&self) -> f32 {
        self.spacer_before + self.rows.len() as f32 * self.row_height + self.spacer_after
    }

    /// Scroll offset that places `page`'s row at the center of a viewport of
    /// `viewport_height`. Pages outside the window are located through the
    /// spacer geometry.
    pub fn offset_for(&self, page: usize, viewport_height: f32) -> f32 {
        let top = match self.row_of(page) {
            Some(row) => self.spacer_before + row as f32 * self.row_height,
            None if page < self.window.start => {
                (page / self.pages_per_row()) as f32 * self.row_height
            }
            None => {
                let past = (page.saturating_sub(self.window.end)) / self.pages_per_row();
                self.spacer_before
                    + self.rows.len() as f32 * self.row_height
                    + past as f32 * self.row_height
            }
        };
        (top + self.row_height / 2.0 - viewport_height / 2.0).max(0.0)
    }

    /// Materialized page whose row center is closest to the viewport center.
    pub fn page_at_offset(&self, scroll_offset: f32, viewport_height: f32) -> Option<usize> {
        let center = scroll_offset + viewport_height / 2.0;
        self.rows
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                let row_center =
                    self.spacer_before + idx as f32 * self.row_height + self.row_height / 2.0;
                (row.first(), (row_center - center).abs())
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(page, _)| page)
    }

    /// Page under the viewport center, including pages that are currently
    /// represented only by a spacer.
    pub fn page_under(
        &self,
        scroll_offset: f32,
        viewport_height: f32,
        page_count: usize,
    ) -> Option<usize> {
        if page_count == 0 || self.row_height <= 0.0 {
            return None;
        }
        let center = scroll_offset + viewport_height / 2.0;
        if center < self.spacer_before {
            let row = (center.max(0.0) / self.row_height) as usize;
            let page = row * self.pages_per_row();
            return Some(page.min(self.window.start.saturating_sub(1)));
        }
        let rows_end = self.spacer_before + self.rows.len() as f32 * self.row_height;
        if center >= rows_end && self.spacer_after > 0.0 {
            let past = ((center - rows_end) / self.row_height) as usize;
            let page = self.window.end + past * self.pages_per_row();
            return Some(page.min(page_count - 1));
        }
        self.page_at_offset(scroll_offset, viewport_height)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PageWindowManager {
    pub config: WindowConfig,
}

impl PageWindowManager {
    pub fn new(config: WindowConfig) -> Self {
        Self { config }
    }

    /// Computes the window from scratch. Never patches a previous window.
    pub fn recompute(&self, input: &WindowInput) -> WindowLayout {
        let count = input.page_count;
        let current = input.current_page.min(count.saturating_sub(1));
        let row_height = input.page_height.max(0.0) + self.config.row_spacing;

        let window = if count == 0 {
            PageWindow::default()
        } else if !input.continuous_scroll {
            if input.facing_pages {
                let start = (current / 2) * 2;
                PageWindow {
                    start,
                    end: (start + 2).min(count),
                    virtual_enabled: false,
                }
            } else {
                PageWindow {
                    start: current,
                    end: current + 1,
                    virtual_enabled: false,
                }
            }
        } else if count <= self.config.virtual_threshold {
            PageWindow {
                start: 0,
                end: count,
                virtual_enabled: false,
            }
        } else {
            let mut start = current.saturating_sub(self.config.buffer_before);
            let mut end = (current + self.config.buffer_after).min(count);
            if input.facing_pages {
                // Whole spreads only, so every page keeps its row across rebuilds.
                start -= start % 2;
                end = (end + end % 2).min(count);
            }
            PageWindow {
                start,
                end,
                virtual_enabled: true,
            }
        };

        let rows = pair_rows(window.range(), input.facing_pages);
        let (spacer_before, spacer_after) = if window.virtual_enabled {
            let per_row = if input.facing_pages { 2 } else { 1 };
            (
                (window.start / per_row) as f32 * row_height,
                (count - window.end).div_ceil(per_row) as f32 * row_height,
            )
        } else {
            (0.0, 0.0)
        };

        WindowLayout {
            window,
            rows,
            spacer_before,
            spacer_after,
            row_height,
            facing_pages: input.facing_pages,
        }
    }

    /// True when `current` drifted close to an edge of a virtual window that
    /// is not also the document boundary, or left the window entirely.
    pub fn needs_rebuild(&self, window: &PageWindow, current: usize, page_count: usize) -> bool {
        if !window.virtual_enabled {
            return false;
        }
        if !window.contains(current) {
            return true;
        }
        let margin = self.config.rebuild_margin;
        let near_end = window.end < page_count && current + margin > window.end;
        let near_start = window.start > 0 && current < window.start + margin;
        near_end || near_start
    }
}

/// Groups pages into rows. In facing mode an even page pairs with its odd
/// successor when both are in range; each page lands in exactly one row.
fn pair_rows(range: Range<usize>, facing_pages: bool) -> Vec<PageRow> {
    let mut rows = Vec::with_capacity(range.len());
    let mut page = range.start;
    while page < range.end {
        if facing_pages && page % 2 == 0 && page + 1 < range.end {
            rows.push(PageRow::Pair(page, page + 1));
            page += 2;
        } else {
            rows.push(PageRow::Single(page));
            page += 1;
        }
    }
    rows
}
