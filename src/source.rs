//! Narrow interfaces to the collaborators that own source data and HTML.
use async_trait::async_trait;
use thiserror::Error;

use crate::model::{NaturalKey, PageType};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no source data for `{0}`")]
    NotFound(String),
    #[error("{0}")]
    Failed(String),
}

/// Enumerates the natural keys of each page type in a stable order.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn count(&self, page_type: PageType) -> Result<u64, SourceError>;

    /// Keys at positions `[offset, offset + limit)`; shorter at the end.
    async fn fetch_slice(
        &self,
        page_type: PageType,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<NaturalKey>, SourceError>;
}

/// Produces the HTML document for one page.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, page_type: PageType, key: &NaturalKey) -> Result<String, RenderError>;
}
