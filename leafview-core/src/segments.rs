//! Lazily populated per-page text segment cache.
//!
//! Segment geometry is decoder-native and zoom independent, so entries live
//! until the document is reloaded.

use std::collections::HashMap;

use tracing::warn;

use crate::{DocumentBackend, TextSegment};

#[derive(Debug, Default)]
pub struct TextSegmentCache {
    pages: HashMap<usize, Vec<TextSegment>>,
}

impl TextSegmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Segments for `page_index`, fetched from the decoder on first use. A
    /// decoder failure yields no segments and is retried on the next call.
    pub fn segments(&mut self, backend: &dyn DocumentBackend, page_index: usize) -> &[TextSegment] {
        if !self.pages.contains_key(&page_index) {
            match backend.text_segments(page_index) {
                Ok(segments) => {
                    self.pages.insert(page_index, segments);
                }
                Err(err) => {
                    warn!(?err, page = page_index, "failed to extract text segments");
                    return &[];
                }
            }
        }
        self.pages.get(&page_index).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_cached(&self, page_index: usize) -> bool {
        self.pages.contains_key(&page_index)
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{segment, FakeBackend};

    #[test]
    fn segments_are_fetched_once_and_kept() {
        let backend = FakeBackend::new(4).with_segments(1, vec![segment("word", 0.0, 10.0, 5.0, 0.0)]);
        let mut cache = TextSegmentCache::new();
        assert!(!cache.is_cached(1));
        assert_eq!(cache.segments(&backend, 1).len(), 1);
        assert!(cache.is_cached(1));
        cache.clear();
        assert!(!cache.is_cached(1));
    }

    #[test]
    fn decoder_failure_is_not_cached() {
        let backend = FakeBackend::new(4).failing_page(2);
        let mut cache = TextSegmentCache::new();
        assert!(cache.segments(&backend, 2).is_empty());
        assert!(!cache.is_cached(2));
    }
}
