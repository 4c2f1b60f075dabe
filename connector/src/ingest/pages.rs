use super::{FeedSource, PageRequest};
use crate::model::{Cursor, Page};
use crate::watermark::Watermark;
use connector_core::Result;
use futures::stream::{self, Stream};
use std::sync::Arc;
use tracing::debug;

enum Step {
    Start(Option<Watermark>),
    Follow { cursor: Cursor, number: u32 },
    Done,
}

/// Lazily walks the feed's continuation chain, one request per poll.
///
/// The stream ends after the first page without a cursor, or after the first
/// error. It cannot be resumed midway; a new run starts again from the
/// watermark.
pub fn page_stream(
    source: Arc<dyn FeedSource>,
    limit: u32,
    modified_since: Option<Watermark>,
) -> impl Stream<Item = Result<Page>> + Send {
    stream::try_unfold(Step::Start(modified_since), move |step| {
        let source = Arc::clone(&source);
        async move {
            let (request, number) = match step {
                Step::Done => return Ok(None),
                Step::Start(modified_since) => (
                    PageRequest::First {
                        limit,
                        modified_since,
                    },
                    1,
                ),
                Step::Follow { cursor, number } => (PageRequest::Follow(cursor), number),
            };

            let fetched = source.fetch_page(&request).await?;
            debug!(
                page = number,
                records = fetched.records.len(),
                has_next = fetched.next.is_some(),
                "Fetched page"
            );

            let next_step = match &fetched.next {
                Some(cursor) => Step::Follow {
                    cursor: cursor.clone(),
                    number: number + 1,
                },
                None => Step::Done,
            };

            let page = Page {
                number,
                records: fetched.records,
                next: fetched.next,
            };

            Ok(Some((page, next_step)))
        }
    })
}
