use tracing::warn;

use crate::{
    client::{CommentSource, FeedError},
    types::Comment,
};

/// Client-side comment list for one post.
///
/// There is no cursor here: expanding the thread or adding a comment refetches
/// the whole list. A failed refetch keeps whatever was shown before and is
/// reported by [`CommentThread::error`] until the next successful one.
#[derive(Debug, Clone)]
pub struct CommentThread {
    post_id: String,
    limit: Option<u32>,
    expanded: bool,
    comments: Vec<Comment>,
    last_error: Option<FeedError>,
}

impl CommentThread {
    pub fn new(post_id: impl Into<String>) -> Self {
        Self {
            post_id: post_id.into(),
            limit: None,
            expanded: false,
            comments: Vec::new(),
            last_error: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn post_id(&self) -> &str {
        &self.post_id
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    /// Set while the shown list is stale because the last refetch failed.
    pub fn error(&self) -> Option<&FeedError> {
        self.last_error.as_ref()
    }

    /// Expands (fetching the list) or collapses the thread.
    pub async fn toggle<S: CommentSource + ?Sized>(&mut self, source: &S) -> Result<(), FeedError> {
        self.expanded = !self.expanded;
        if self.expanded {
            self.refresh(source).await?;
        }
        Ok(())
    }

    pub async fn refresh<S: CommentSource + ?Sized>(&mut self, source: &S) -> Result<(), FeedError> {
        match source.list_comments(&self.post_id, self.limit).await {
            Ok(comments) => {
                self.comments = comments;
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to load comments for {}: {}", self.post_id, e);
                self.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Adds a comment and refetches the list. The comment exists even when the
    /// refetch fails; that failure is left in [`CommentThread::error`].
    pub async fn add<S: CommentSource + ?Sized>(&mut self, source: &S, content: &str) -> Result<Comment, FeedError> {
        let comment = source.add_comment(&self.post_id, content.trim()).await?;
        if self.refresh(source).await.is_err() {
            warn!("Comment {} added but the list is stale", comment.id);
        }
        Ok(comment)
    }
}
