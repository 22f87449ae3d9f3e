use anyhow::Result;
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::{
    feed_cache::PageKey,
    types::{
        AuthResponse, Comment, CommentResponse, CommentsResponse, ContentRequest, ErrorResponse,
        LoginRequest, Page, Post, RegisterRequest,
    },
};

/// Failure seen by the client while talking to the feed service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The request never completed. Safe to retry.
    #[error("network error: {0}")]
    Network(String),

    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl FeedError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::Network(_) => true,
            FeedError::Server { status, .. } => *status >= 500,
            FeedError::Decode(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FeedError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FeedError::Decode(e.to_string())
        } else {
            FeedError::Network(e.to_string())
        }
    }
}

/// Anything that can produce one feed page for a key.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch_page(&self, key: &PageKey) -> Result<Page, FeedError>;
}

/// Creates posts on behalf of the signed-in user.
#[async_trait]
pub trait PostPublisher: Send + Sync {
    async fn create_post(&self, content: &str) -> Result<Post, FeedError>;
}

#[async_trait]
pub trait CommentSource: Send + Sync {
    async fn list_comments(&self, post_id: &str, limit: Option<u32>) -> Result<Vec<Comment>, FeedError>;
    async fn add_comment(&self, post_id: &str, content: &str) -> Result<Comment, FeedError>;
}

/// Typed HTTP client for the feed service.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, None)
    }

    pub fn with_timeout(base_url: &str, timeout: Option<Duration>) -> Result<Self> {
        // Relative joins need the trailing slash.
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }

        let mut builder = reqwest::Client::builder().user_agent("social-feed/0.1");
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            http: builder.build()?,
            base: Url::parse(&base)?,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub async fn register(&self, email: &str, username: &str, password: &str) -> Result<AuthResponse, FeedError> {
        let body = RegisterRequest {
            email: Some(email.to_string()),
            username: Some(username.to_string()),
            password: Some(password.to_string()),
        };
        let response = self.http.post(self.url("auth/register")?).json(&body).send().await?;
        decode(response).await
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, FeedError> {
        let body = LoginRequest {
            email: Some(email.to_string()),
            password: Some(password.to_string()),
        };
        let response = self.http.post(self.url("auth/login")?).json(&body).send().await?;
        decode(response).await
    }

    pub fn posts_url(&self, key: &PageKey) -> Result<Url, FeedError> {
        let mut url = self.url("posts")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(cursor) = &key.cursor {
                query.append_pair("cursor", cursor);
            }
            query.append_pair("limit", &key.limit.to_string());
        }
        Ok(url)
    }

    fn url(&self, path: &str) -> Result<Url, FeedError> {
        self.base
            .join(path)
            .map_err(|e| FeedError::Network(format!("invalid url {}: {}", path, e)))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl FeedFetcher for ApiClient {
    async fn fetch_page(&self, key: &PageKey) -> Result<Page, FeedError> {
        let response = self.http.get(self.posts_url(key)?).send().await?;
        decode(response).await
    }
}

#[async_trait]
impl PostPublisher for ApiClient {
    async fn create_post(&self, content: &str) -> Result<Post, FeedError> {
        let body = ContentRequest {
            content: content.to_string(),
        };
        let response = self
            .authorized(self.http.post(self.url("posts")?))
            .json(&body)
            .send()
            .await?;
        decode(response).await
    }
}

#[async_trait]
impl CommentSource for ApiClient {
    async fn list_comments(&self, post_id: &str, limit: Option<u32>) -> Result<Vec<Comment>, FeedError> {
        let mut url = self.url(&format!("posts/{}/comments", post_id))?;
        if let Some(limit) = limit {
            url.query_pairs_mut().append_pair("limit", &limit.to_string());
        }
        let response = self.http.get(url).send().await?;
        let body: CommentsResponse = decode(response).await?;
        Ok(body.comments)
    }

    async fn add_comment(&self, post_id: &str, content: &str) -> Result<Comment, FeedError> {
        let url = self.url(&format!("posts/{}/comments", post_id))?;
        let body = ContentRequest {
            content: content.to_string(),
        };
        let response = self.authorized(self.http.post(url)).json(&body).send().await?;
        let body: CommentResponse = decode(response).await?;
        Ok(body.comment)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, FeedError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!("Feed service error: {}", message);
    }

    Err(FeedError::Server {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::Credentials,
        comments::CommentThread,
        database::Database,
        feed_cache::RevalidatePolicy,
        paginator::{FeedPaginator, PageLimits},
        server::{self, AppState},
        session::FeedSession,
        types::timestamp,
    };
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn spawn_server() -> (String, Arc<Database>) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.migrate().await.unwrap();
        let app = server::router(AppState {
            paginator: Arc::new(FeedPaginator::new(Arc::clone(&db), PageLimits::default())),
            credentials: Arc::new(Credentials::new("test-secret", 7)),
            db: Arc::clone(&db),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (format!("http://{}", addr), db)
    }

    #[test]
    fn test_posts_url() {
        let client = ApiClient::new("http://localhost:3000").unwrap();

        let first = client
            .posts_url(&PageKey {
                cursor: None,
                limit: 10,
            })
            .unwrap();
        assert_eq!(first.as_str(), "http://localhost:3000/posts?limit=10");

        let next = client
            .posts_url(&PageKey {
                cursor: Some("2026-01-01T00:00:00.000000Z".to_string()),
                limit: 5,
            })
            .unwrap();
        assert_eq!(next.path(), "/posts");
        let pairs: Vec<(String, String)> = next.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("cursor".to_string(), "2026-01-01T00:00:00.000000Z".to_string()),
                ("limit".to_string(), "5".to_string()),
            ]
        );
    }

    #[test]
    fn test_base_path_is_kept() {
        let client = ApiClient::new("http://example.com/api").unwrap();
        let url = client
            .posts_url(&PageKey {
                cursor: None,
                limit: 1,
            })
            .unwrap();
        assert_eq!(url.as_str(), "http://example.com/api/posts?limit=1");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(FeedError::Network("reset".into()).is_retryable());
        assert!(FeedError::Server {
            status: 500,
            message: "Internal server error".into()
        }
        .is_retryable());
        assert!(!FeedError::Server {
            status: 400,
            message: "Invalid cursor".into()
        }
        .is_retryable());
        assert_eq!(FeedError::Decode("eof".into()).status(), None);
    }

    #[tokio::test]
    async fn test_session_walks_feed_over_http() {
        let (base, db) = spawn_server().await;
        let client = ApiClient::new(&base).unwrap();
        let auth = client
            .register("alice@example.com", "alice", "secret1")
            .await
            .unwrap();
        let author = auth.user.summary();

        let start = timestamp::now() - chrono::Duration::hours(1);
        for i in 1..=25 {
            let at = start + chrono::Duration::seconds(i);
            db.store_post(&Post {
                id: format!("P{}", i),
                content: format!("post {}", i),
                created_at: at,
                updated_at: at,
                author_id: author.id.clone(),
                author: author.clone(),
            })
            .await
            .unwrap();
        }

        let session = FeedSession::new(client.clone(), 10, RevalidatePolicy::default());
        session.start().await.unwrap();
        assert!(session.load_more().await.unwrap());
        assert!(session.load_more().await.unwrap());
        assert!(!session.load_more().await.unwrap());

        let snapshot = session.snapshot().await;
        let ids: Vec<String> = snapshot.posts.iter().map(|p| p.id.clone()).collect();
        let expected: Vec<String> = (1..=25).rev().map(|i| format!("P{}", i)).collect();
        assert_eq!(ids, expected);
        assert!(!snapshot.has_more);

        let writer = client.with_token(auth.token);
        let post = session.publish(&writer, "  fresh  ").await.unwrap();
        assert_eq!(post.content, "fresh");
        assert_eq!(post.author.username, "alice");

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.posts[0], post);
        assert_eq!(snapshot.posts.len(), 26);
    }

    #[tokio::test]
    async fn test_server_errors_are_decoded() {
        let (base, _db) = spawn_server().await;
        let client = ApiClient::new(&base).unwrap();

        let err = client.create_post("hello").await.unwrap_err();
        assert_eq!(
            err,
            FeedError::Server {
                status: 401,
                message: "Authentication token is required".to_string(),
            }
        );
        assert!(!err.is_retryable());

        client
            .register("alice@example.com", "alice", "secret1")
            .await
            .unwrap();
        let err = client
            .register("alice@example.com", "bob", "secret1")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FeedError::Server {
                status: 409,
                message: "Email is already in use".to_string(),
            }
        );

        let err = client
            .login("alice@example.com", "wrong-password")
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));

        let err = client
            .fetch_page(&PageKey {
                cursor: Some("not-a-date".to_string()),
                limit: 10,
            })
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_retryable() {
        let client = ApiClient::new("http://127.0.0.1:1").unwrap();
        let err = client
            .fetch_page(&PageKey {
                cursor: None,
                limit: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Network(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_comment_thread_over_http() {
        let (base, _db) = spawn_server().await;
        let anonymous = ApiClient::new(&base).unwrap();
        let auth = anonymous
            .register("alice@example.com", "alice", "secret1")
            .await
            .unwrap();
        let client = anonymous.with_token(auth.token);
        let post = client.create_post("hello").await.unwrap();

        let mut thread = CommentThread::new(post.id.clone());
        thread.toggle(&client).await.unwrap();
        assert!(thread.comments().is_empty());

        thread.add(&client, "first").await.unwrap();
        let second = thread.add(&client, "second").await.unwrap();
        assert_eq!(second.post_id, post.id);
        assert_eq!(second.author.username, "alice");

        let contents: Vec<_> = thread.comments().iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second"]);
        assert!(thread.error().is_none());

        let err = client.add_comment("missing", "hi").await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        let err = client.list_comments("missing", None).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
    }
}
