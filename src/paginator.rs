use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::{
    database::Database,
    error::{ApiError, ApiResult},
    types::{timestamp, Page},
};

pub const DEFAULT_PAGE_SIZE: i64 = 10;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Page size policy shared by the feed and comment listings.
#[derive(Debug, Clone, Copy)]
pub struct PageLimits {
    pub default: i64,
    pub max: i64,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default: DEFAULT_PAGE_SIZE,
            max: MAX_PAGE_SIZE,
        }
    }
}

impl PageLimits {
    /// Absent or non-numeric input yields the default; anything else is
    /// clamped to `1..=max`.
    pub fn resolve(&self, raw: Option<&str>) -> i64 {
        raw.and_then(|s| s.trim().parse::<i64>().ok())
            .unwrap_or(self.default)
            .clamp(1, self.max.max(1))
    }
}

/// A validated feed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedQuery {
    pub cursor: Option<DateTime<Utc>>,
    pub limit: i64,
}

pub struct FeedPaginator {
    db: Arc<Database>,
    limits: PageLimits,
}

impl FeedPaginator {
    pub fn new(db: Arc<Database>, limits: PageLimits) -> Self {
        Self { db, limits }
    }

    pub fn limits(&self) -> PageLimits {
        self.limits
    }

    /// An empty cursor counts as absent. A cursor that is not an RFC 3339
    /// timestamp is rejected rather than silently dropped.
    pub fn parse_query(&self, cursor: Option<&str>, limit: Option<&str>) -> ApiResult<FeedQuery> {
        let cursor = match cursor.map(str::trim).filter(|c| !c.is_empty()) {
            Some(raw) => Some(
                timestamp::parse(raw)
                    .map_err(|_| ApiError::Validation(format!("Invalid cursor: {}", raw)))?,
            ),
            None => None,
        };

        Ok(FeedQuery {
            cursor,
            limit: self.limits.resolve(limit),
        })
    }

    pub async fn fetch_page(&self, query: &FeedQuery) -> ApiResult<Page> {
        // One extra row tells us whether another page exists.
        let mut posts = self
            .db
            .get_posts_before(query.cursor, query.limit + 1)
            .await?;

        let has_more = posts.len() as i64 > query.limit;
        if has_more {
            posts.truncate(query.limit as usize);
        }

        let next_cursor = if has_more {
            posts.last().map(|post| timestamp::format(&post.created_at))
        } else {
            None
        };

        debug!(
            "Fetched feed page: {} posts, has_more={}, cursor={:?}",
            posts.len(),
            has_more,
            query.cursor
        );

        Ok(Page {
            posts,
            next_cursor,
            has_more,
        })
    }
}
