//! Lazy pagination over continuation-token based list APIs.

use std::future::Future;

use futures::stream::{self, Stream};

use crate::core::error::ProviderResult;

/// One page of a list response.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Continuation token for the next page, `None` on the last page
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next: Option<String>) -> Self {
        Self { items, next }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

// `None` once exhausted, `Some(None)` before the first page.
type Cursor = Option<Option<String>>;

/// Streams pages produced by `fetch`, which is called with `None` for the first page
/// and with the previous page's continuation token afterwards.
///
/// Pages are requested one at a time and only when the consumer asks for them. The
/// stream ends after the first error.
pub fn paginate<T, F, Fut>(fetch: F) -> impl Stream<Item = ProviderResult<Vec<T>>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = ProviderResult<Page<T>>>,
{
    let seed = (fetch, Some(None));
    stream::try_unfold(seed, |(fetch, cursor)| next_page(fetch, cursor))
}

async fn next_page<T, F, Fut>(
    mut fetch: F,
    cursor: Cursor,
) -> ProviderResult<Option<(Vec<T>, (F, Cursor))>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = ProviderResult<Page<T>>>,
{
    let Some(token) = cursor else {
        return Ok(None);
    };
    let page = fetch(token).await?;
    let next = page.next.filter(|link| !link.is_empty()).map(Some);
    Ok(Some((page.items, (fetch, next))))
}
