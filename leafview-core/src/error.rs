use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the view engine. Most of them are recovered locally
/// and only logged; callers see the ones that reject a request.
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("failed to decode page {page}")]
    Decode {
        page: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to persist {path:?}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("page {requested} is outside the document (0..{page_count})")]
    NavigationOutOfRange { requested: usize, page_count: usize },
    #[error("no matches for '{term}'")]
    SearchMiss { term: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ViewResult<T> = std::result::Result<T, ViewError>;
