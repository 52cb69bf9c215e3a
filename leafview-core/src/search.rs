//! Wrap-around text search across pages.

use tracing::{debug, instrument, warn};

use crate::error::{ViewError, ViewResult};
use crate::geometry::DocRect;
use crate::DocumentBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchDirection {
    #[default]
    Forward,
    Backward,
}

impl SearchDirection {
    fn step(self, current: usize, offset: usize, page_count: usize) -> usize {
        let offset = offset % page_count;
        match self {
            SearchDirection::Forward => (current + offset) % page_count,
            SearchDirection::Backward => (current + page_count - offset) % page_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub page: usize,
    /// Highlight rects for the exact term, in document space.
    pub rects: Vec<DocRect>,
}

/// Pages visited by a scan starting after `current`, ending back on it.
pub fn scan_order(
    current: usize,
    direction: SearchDirection,
    page_count: usize,
) -> impl Iterator<Item = usize> {
    (1..=page_count).map(move |i| direction.step(current, i, page_count))
}

#[derive(Debug, Default)]
pub struct SearchNavigator {
    term: Option<String>,
    hit: Option<SearchHit>,
}

impl SearchNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(&self) -> Option<&str> {
        self.term.as_deref()
    }

    pub fn hit(&self) -> Option<&SearchHit> {
        self.hit.as_ref()
    }

    /// Highlights to draw on `page`, if it holds the active hit.
    pub fn highlights_for(&self, page: usize) -> &[DocRect] {
        match &self.hit {
            Some(hit) if hit.page == page => &hit.rects,
            _ => &[],
        }
    }

    pub fn clear(&mut self) -> Option<SearchHit> {
        self.term = None;
        self.hit.take()
    }

    /// Scans from the page after `current` in `direction`, wrapping once
    /// around the document. On a miss the previous hit stays active.
    #[instrument(skip(self, backend))]
    pub fn find(
        &mut self,
        backend: &dyn DocumentBackend,
        term: &str,
        current: usize,
        direction: SearchDirection,
    ) -> ViewResult<SearchHit> {
        let page_count = backend.info().page_count;
        let needle = term.to_lowercase();
        if needle.trim().is_empty() || page_count == 0 {
            return Err(ViewError::SearchMiss {
                term: term.to_string(),
            });
        }

        for page in scan_order(current, direction, page_count) {
            let text = match backend.page_text(page) {
                Ok(text) => text,
                Err(err) => {
                    debug!(?err, page, "skipping page during search");
                    continue;
                }
            };
            if !text.to_lowercase().contains(&needle) {
                continue;
            }
            let rects = backend.search_page(page, term).unwrap_or_else(|err| {
                warn!(?err, page, "failed to locate search highlights");
                Vec::new()
            });
            let hit = SearchHit { page, rects };
            self.term = Some(term.to_string());
            self.hit = Some(hit.clone());
            return Ok(hit);
        }

        Err(ViewError::SearchMiss {
            term: term.to_string(),
        })
    }

    /// Repeats the last search from `current`.
    pub fn find_again(
        &mut self,
        backend: &dyn DocumentBackend,
        current: usize,
        direction: SearchDirection,
    ) -> Option<ViewResult<SearchHit>> {
        let term = self.term.clone()?;
        Some(self.find(backend, &term, current, direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeBackend;

    #[test]
    fn forward_search_wraps_past_the_end() {
        let backend = FakeBackend::new(10)
            .with_text(2, "The Quick brown fox")
            .with_hits(2, vec![DocRect::new(10.0, 20.0, 30.0, 5.0)]);
        let mut nav = SearchNavigator::new();
        let hit = nav
            .find(&backend, "quick", 7, SearchDirection::Forward)
            .unwrap();
        assert_eq!(hit.page, 2);
        assert_eq!(hit.rects.len(), 1);
        assert_eq!(nav.highlights_for(2).len(), 1);
        assert!(nav.highlights_for(3).is_empty());
    }

    #[test]
    fn backward_search_wraps_past_the_start() {
        let backend = FakeBackend::new(10).with_text(8, "needle");
        let mut nav = SearchNavigator::new();
        let hit = nav
            .find(&backend, "needle", 1, SearchDirection::Backward)
            .unwrap();
        assert_eq!(hit.page, 8);
    }

    #[test]
    fn current_page_is_checked_last() {
        let backend = FakeBackend::new(5)
            .with_text(1, "needle")
            .with_text(3, "needle");
        assert_eq!(
            scan_order(3, SearchDirection::Forward, 5).collect::<Vec<_>>(),
            vec![4, 0, 1, 2, 3]
        );
        let mut nav = SearchNavigator::new();
        let hit = nav
            .find(&backend, "needle", 3, SearchDirection::Forward)
            .unwrap();
        assert_eq!(hit.page, 1);
    }

    #[test]
    fn miss_keeps_previous_hit() {
        let backend = FakeBackend::new(4).with_text(1, "alpha");
        let mut nav = SearchNavigator::new();
        nav.find(&backend, "alpha", 0, SearchDirection::Forward)
            .unwrap();
        let err = nav
            .find(&backend, "omega", 0, SearchDirection::Forward)
            .unwrap_err();
        assert!(matches!(err, ViewError::SearchMiss { .. }));
        assert_eq!(nav.hit().map(|hit| hit.page), Some(1));
        assert_eq!(nav.term(), Some("alpha"));
    }

    #[test]
    fn unreadable_pages_are_skipped() {
        let backend = FakeBackend::new(6)
            .failing_page(1)
            .with_text(4, "target");
        let mut nav = SearchNavigator::new();
        let hit = nav
            .find(&backend, "target", 0, SearchDirection::Forward)
            .unwrap();
        assert_eq!(hit.page, 4);
    }

    #[test]
    fn find_again_reuses_term() {
        let backend = FakeBackend::new(6)
            .with_text(1, "ring")
            .with_text(4, "ring");
        let mut nav = SearchNavigator::new();
        assert!(nav
            .find_again(&backend, 0, SearchDirection::Forward)
            .is_none());
        nav.find(&backend, "ring", 0, SearchDirection::Forward)
            .unwrap();
        let again = nav
            .find_again(&backend, 1, SearchDirection::Forward)
            .unwrap()
            .unwrap();
        assert_eq!(again.page, 4);
    }
}
