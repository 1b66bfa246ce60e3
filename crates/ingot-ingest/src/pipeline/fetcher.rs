//! Sources of identified work items
//!
//! A fetcher is consumed by [`Fetcher::fetch_all`]: its sequence can be
//! traversed once, and re-running a job means building a new fetcher.
//! Nothing is fetched until the returned stream is polled.

use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;

use super::outcome::{Item, ItemId};

/// Lazy, finite stream of items; an `Err` element reports a failed listing
pub type ItemStream<T> = BoxStream<'static, anyhow::Result<Item<T>>>;

/// Produces the work items of one job run
pub trait Fetcher<T>: Send {
    fn fetch_all(self) -> ItemStream<T>;
}

/// Fetcher over an in-memory collection
pub struct CollectionFetcher<T> {
    items: Vec<Item<T>>,
}

impl<T> CollectionFetcher<T> {
    pub fn new(items: Vec<Item<T>>) -> Self {
        Self { items }
    }

    /// Values identified by their 1-based position
    pub fn from_values(values: impl IntoIterator<Item = T>) -> Self {
        let items = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| Item::new(ItemId::from(i + 1), value))
            .collect();
        Self { items }
    }

    /// Values with caller-supplied identities
    pub fn from_pairs<K: Into<ItemId>>(pairs: impl IntoIterator<Item = (K, T)>) -> Self {
        let items = pairs
            .into_iter()
            .map(|(id, value)| Item::new(id, value))
            .collect();
        Self { items }
    }
}

impl<T: Send + 'static> Fetcher<T> for CollectionFetcher<T> {
    fn fetch_all(self) -> ItemStream<T> {
        stream::iter(self.items.into_iter().map(Ok)).boxed()
    }
}

/// Fetcher over an arbitrary asynchronous listing call.
///
/// The closure runs once, when the stream is first polled. A listing error
/// becomes the single `Err` element of the stream.
pub struct ListingFetcher<F> {
    list: F,
}

impl<F> ListingFetcher<F> {
    pub fn new(list: F) -> Self {
        Self { list }
    }
}

impl<T, F, Fut> Fetcher<T> for ListingFetcher<F>
where
    T: Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Vec<Item<T>>>> + Send + 'static,
{
    fn fetch_all(self) -> ItemStream<T> {
        let list = self.list;
        stream::once(async move { list().await })
            .flat_map(|listing| {
                let elements: Vec<anyhow::Result<Item<T>>> = match listing {
                    Ok(items) => items.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(elements)
            })
            .boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_collection_fetcher_numbers_values() {
        let items: Vec<_> = CollectionFetcher::from_values(vec!["a", "b"])
            .fetch_all()
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(items, vec![Item::new(1usize, "a"), Item::new(2usize, "b")]);
    }

    #[tokio::test]
    async fn test_listing_fetcher_is_lazy() {
        let listed = Arc::new(AtomicBool::new(false));
        let flag = listed.clone();
        let fetcher = ListingFetcher::new(move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(vec![Item::new("x.ok", 1u8)])
        });

        let mut stream = fetcher.fetch_all();
        assert!(!listed.load(Ordering::SeqCst));

        let first = stream.next().await.unwrap().unwrap();
        assert!(listed.load(Ordering::SeqCst));
        assert_eq!(first.id.as_str(), "x.ok");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_listing_error_is_yielded() {
        let fetcher = ListingFetcher::new(|| async {
            Err::<Vec<Item<u8>>, _>(anyhow::anyhow!("connection refused"))
        });

        let elements: Vec<_> = fetcher.fetch_all().collect().await;
        assert_eq!(elements.len(), 1);
        assert_eq!(
            elements[0].as_ref().unwrap_err().to_string(),
            "connection refused"
        );
    }
}
