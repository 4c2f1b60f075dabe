pub mod otx_source;
pub mod pages;

use crate::model::{Cursor, FeedPage, Identity};
use crate::watermark::Watermark;
use async_trait::async_trait;
use connector_core::Result;

/// What to ask the feed for next.
#[derive(Debug, Clone)]
pub enum PageRequest {
    /// Opening request of a run; carries the query the whole chain is bound by.
    First {
        limit: u32,
        modified_since: Option<Watermark>,
    },
    /// Continue from a cursor returned with the previous page. The cursor
    /// already encodes the original query.
    Follow(Cursor),
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Check the credential before any extraction happens
    async fn authenticate(&self) -> Result<Identity>;

    /// Fetch one page of records
    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage>;

    /// Provenance tag for records from this source
    fn source_id(&self) -> &str;
}

pub use otx_source::OtxSource;
pub use pages::page_stream;
