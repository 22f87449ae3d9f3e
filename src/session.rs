use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    client::{FeedError, FeedFetcher, PostPublisher},
    error::ApiError,
    feed_cache::{FeedCache, PageKey, RevalidatePolicy},
    paginator::FeedPaginator,
    types::{Page, Post},
};

/// Point-in-time view of a feed for rendering.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub posts: Vec<Post>,
    pub has_more: bool,
    pub is_loading: bool,
    pub error: Option<FeedError>,
}

/// Drives a [`FeedCache`] against a fetcher, one fetch at a time.
///
/// The cache lock is never held across a fetch, so the session stays usable
/// (snapshots, local inserts) while a page is loading.
pub struct FeedSession<F> {
    fetcher: Arc<F>,
    cache: Arc<Mutex<FeedCache>>,
}

impl<F> Clone for FeedSession<F> {
    fn clone(&self) -> Self {
        Self {
            fetcher: Arc::clone(&self.fetcher),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<F: FeedFetcher> FeedSession<F> {
    pub fn new(fetcher: F, limit: u32, policy: RevalidatePolicy) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            cache: Arc::new(Mutex::new(FeedCache::new(limit, policy))),
        }
    }

    /// Runs fetches until the cache has nothing left to request. Returns the
    /// last fetch error, if any.
    pub async fn pump(&self) -> Result<(), FeedError> {
        let mut outcome = Ok(());
        loop {
            let ticket = match self.cache.lock().await.next_request() {
                Some(ticket) => ticket,
                None => return outcome,
            };

            debug!("Fetching feed page {} ({:?})", ticket.index(), ticket.key);
            let result = self.fetcher.fetch_page(&ticket.key).await;
            if let Err(e) = &result {
                warn!("Feed page {} failed: {}", ticket.index(), e);
                outcome = Err(e.clone());
            }

            if !self.cache.lock().await.apply(ticket, result) {
                debug!("Discarded feed result from an ended session");
                return outcome;
            }
        }
    }

    /// Loads the first page.
    pub async fn start(&self) -> Result<(), FeedError> {
        self.pump().await
    }

    /// Grows the feed by one page. Returns `Ok(false)` when growth was
    /// refused (load in flight, or no more pages).
    pub async fn load_more(&self) -> Result<bool, FeedError> {
        if !self.cache.lock().await.load_more() {
            return Ok(false);
        }
        self.pump().await.map(|_| true)
    }

    pub async fn retry(&self) -> Result<bool, FeedError> {
        if !self.cache.lock().await.retry() {
            return Ok(false);
        }
        self.pump().await.map(|_| true)
    }

    pub async fn refresh(&self) -> Result<(), FeedError> {
        self.cache.lock().await.reset();
        self.pump().await
    }

    pub async fn focus(&self) -> Result<(), FeedError> {
        if self.cache.lock().await.on_focus() {
            self.pump().await?;
        }
        Ok(())
    }

    pub async fn reconnect(&self) -> Result<(), FeedError> {
        if self.cache.lock().await.on_reconnect() {
            self.pump().await?;
        }
        Ok(())
    }

    /// Shows a post the user just created at the top of the feed.
    pub async fn insert_local(&self, post: Post) -> bool {
        self.cache.lock().await.insert_local(post)
    }

    /// Creates a post and, once the server accepts it, shows it at the top of
    /// the feed. A rejected post leaves the cache untouched.
    pub async fn publish<P: PostPublisher + ?Sized>(
        &self,
        publisher: &P,
        content: &str,
    ) -> Result<Post, FeedError> {
        let post = publisher.create_post(content).await?;
        if !self.insert_local(post.clone()).await {
            debug!("Post {} created before the first page loaded", post.id);
        }
        Ok(post)
    }

    pub async fn has_more(&self) -> bool {
        self.cache.lock().await.has_more()
    }

    pub async fn is_loading(&self) -> bool {
        self.cache.lock().await.is_loading()
    }

    pub async fn snapshot(&self) -> FeedSnapshot {
        let cache = self.cache.lock().await;
        FeedSnapshot {
            posts: cache.posts().cloned().collect(),
            has_more: cache.has_more(),
            is_loading: cache.is_loading(),
            error: cache.error().cloned(),
        }
    }

    /// Runs `f` against the cache under its lock.
    pub async fn with_cache<R>(&self, f: impl FnOnce(&FeedCache) -> R) -> R {
        f(&*self.cache.lock().await)
    }

    pub async fn close(&self) {
        self.cache.lock().await.close();
    }
}

// Serves the feed straight from the paginator, without HTTP.
#[async_trait]
impl FeedFetcher for FeedPaginator {
    async fn fetch_page(&self, key: &PageKey) -> Result<Page, FeedError> {
        let limit = key.limit.to_string();
        let result = match self.parse_query(key.cursor.as_deref(), Some(limit.as_str())) {
            Ok(query) => FeedPaginator::fetch_page(self, &query).await,
            Err(e) => Err(e),
        };
        result.map_err(|e: ApiError| FeedError::Server {
            status: e.status().as_u16(),
            message: e.public_message(),
        })
    }
}
