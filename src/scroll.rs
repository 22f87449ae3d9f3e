use crate::{
    client::{FeedError, FeedFetcher},
    feed_cache::{FeedCache, PageSlot},
    session::FeedSession,
};

/// Distance before the true bottom at which loading starts.
pub const DEFAULT_LEAD_MARGIN: f64 = 100.0;

/// Scroll geometry of the rendered feed, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub scroll_top: f64,
    pub viewport_height: f64,
    pub content_height: f64,
}

impl Viewport {
    fn distance_to_bottom(&self) -> f64 {
        self.content_height - (self.scroll_top + self.viewport_height)
    }
}

/// What sits below the last rendered post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFooter {
    LoadingMore,
    ScrollForMore,
    /// The newest page failed; loading resumes only through a retry.
    Failed,
    EndOfFeed,
}

impl FeedFooter {
    pub fn label(&self) -> &'static str {
        match self {
            FeedFooter::LoadingMore => "Loading posts...",
            FeedFooter::ScrollForMore => "Scroll for more posts",
            FeedFooter::Failed => "Failed to load posts.",
            FeedFooter::EndOfFeed => "You've reached the end of the feed.",
        }
    }

    /// The sentinel exists only while scrolling can still load something.
    pub fn has_sentinel(&self) -> bool {
        matches!(self, FeedFooter::LoadingMore | FeedFooter::ScrollForMore)
    }
}

/// Watches the sentinel at the bottom of the feed and asks for the next page
/// when it comes into view.
///
/// The trigger itself does not debounce; repeated observations during a load
/// are absorbed by the cache's in-flight guard.
#[derive(Debug, Clone, Copy)]
pub struct ScrollTrigger {
    lead_margin: f64,
}

impl Default for ScrollTrigger {
    fn default() -> Self {
        Self::new(DEFAULT_LEAD_MARGIN)
    }
}

impl ScrollTrigger {
    pub fn new(lead_margin: f64) -> Self {
        Self {
            lead_margin: lead_margin.max(0.0),
        }
    }

    pub fn sentinel_visible(&self, viewport: &Viewport) -> bool {
        viewport.distance_to_bottom() <= self.lead_margin
    }

    /// Footer for the tail of the chain. Revalidating earlier pages does not
    /// change it, so `EndOfFeed` holds until the feed is reset.
    pub fn footer(cache: &FeedCache) -> FeedFooter {
        match cache.size().checked_sub(1).and_then(|i| cache.slot(i)) {
            Some(PageSlot::Resolved(page)) if page.has_more => FeedFooter::ScrollForMore,
            Some(PageSlot::Resolved(_)) => FeedFooter::EndOfFeed,
            Some(PageSlot::Failed(_)) => FeedFooter::Failed,
            _ => FeedFooter::LoadingMore,
        }
    }

    pub fn should_load(&self, viewport: &Viewport, cache: &FeedCache) -> bool {
        !cache.is_loading()
            && Self::footer(cache) == FeedFooter::ScrollForMore
            && self.sentinel_visible(viewport)
    }

    /// Feeds one scroll observation to the session. Returns whether a new page
    /// was loaded.
    pub async fn observe<F: FeedFetcher>(
        &self,
        viewport: &Viewport,
        session: &FeedSession<F>,
    ) -> Result<bool, FeedError> {
        let wanted = session
            .with_cache(|cache| self.should_load(viewport, cache))
            .await;
        if !wanted {
            return Ok(false);
        }
        session.load_more().await
    }
}
