use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    auth::{self, AuthUser, Credentials},
    database::Database,
    error::{ApiError, ApiResult},
    paginator::FeedPaginator,
    types::*,
};

const MIN_PASSWORD_LEN: usize = 6;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern compiles")
});

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub paginator: Arc<FeedPaginator>,
    pub credentials: Arc<Credentials>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/posts", get(list_posts).post(create_post))
        .route(
            "/posts/{post_id}/comments",
            get(list_comments).post(add_comment),
        )
        .route("/auth/login", post(login))
        .route("/auth/register", post(register))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> &'static str {
    "Social Feed"
}

async fn list_posts(
    State(state): State<AppState>,
    Query(params): Query<PostsParams>,
) -> ApiResult<Json<Page>> {
    let query = state
        .paginator
        .parse_query(params.cursor.as_deref(), params.limit.as_deref())?;
    let page = state.paginator.fetch_page(&query).await?;
    Ok(Json(page))
}

async fn create_post(
    State(state): State<AppState>,
    user: AuthUser,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Post>> {
    let content = required_content(body, "Content is required and must be a string")?;

    let author = state
        .db
        .find_user_by_id(&user.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    let post = state.db.insert_post(&author.summary(), &content).await?;
    info!("User {} created post {}", author.username, post.id);
    Ok(Json(post))
}

async fn list_comments(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    Query(params): Query<CommentsParams>,
) -> ApiResult<Json<CommentsResponse>> {
    let limit = state.paginator.limits().resolve(params.limit.as_deref());

    if !state.db.post_exists(&post_id).await? {
        return Err(ApiError::NotFound("Post not found".to_string()));
    }

    let comments = state.db.list_comments(&post_id, limit).await?;
    Ok(Json(CommentsResponse { comments }))
}

async fn add_comment(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    user: AuthUser,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<CommentResponse>> {
    let content = required_content(body, "Comment content is required")?;

    if !state.db.post_exists(&post_id).await? {
        return Err(ApiError::NotFound("Post not found".to_string()));
    }

    let author = state
        .db
        .find_user_by_id(&user.user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    let comment = state
        .db
        .insert_comment(&post_id, &author.summary(), &content)
        .await?;
    Ok(Json(CommentResponse { comment }))
}

async fn login(
    State(state): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Json<AuthResponse>> {
    let Json(request) = body.unwrap_or_default();
    let (email, password) = match (non_empty(request.email), non_empty(request.password)) {
        (Some(email), Some(password)) => (email, password),
        _ => {
            return Err(ApiError::Validation(
                "Email and password are required".to_string(),
            ))
        }
    };

    let invalid = || ApiError::Auth("Invalid email or password".to_string());
    let record = state.db.find_user_by_email(&email).await?.ok_or_else(invalid)?;
    if !auth::verify_password(&password, &record.password_hash) {
        warn!("Failed login for {}", email);
        return Err(invalid());
    }

    let token = state.credentials.issue_token(&record.user.id)?;
    Ok(Json(AuthResponse {
        user: record.user,
        token,
    }))
}

async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<Json<AuthResponse>> {
    let Json(request) = body.unwrap_or_default();
    let (email, username, password) = match (
        non_empty(request.email),
        non_empty(request.username),
        non_empty(request.password),
    ) {
        (Some(email), Some(username), Some(password)) => (email, username, password),
        _ => {
            return Err(ApiError::Validation(
                "Email, username and password are required".to_string(),
            ))
        }
    };

    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    if !EMAIL_RE.is_match(&email) {
        return Err(ApiError::Validation("Invalid email format".to_string()));
    }

    // Email is checked first so a doubly-conflicting request reports "email".
    if state.db.email_taken(&email).await? {
        return Err(ApiError::Conflict("Email is already in use".to_string()));
    }
    if state.db.username_taken(&username).await? {
        return Err(ApiError::Conflict("Username is already in use".to_string()));
    }

    let password_hash = auth::hash_password(&password)?;
    let user = match state.db.insert_user(&email, &username, &password_hash).await {
        Ok(user) => user,
        Err(e) if is_unique_violation(&e) => {
            return Err(ApiError::Conflict(
                "Email or username is already in use".to_string(),
            ))
        }
        Err(e) => return Err(e.into()),
    };

    info!("Registered user {}", user.username);
    let token = state.credentials.issue_token(&user.id)?;
    Ok(Json(AuthResponse { user, token }))
}

fn required_content(body: Result<Json<Value>, JsonRejection>, message: &str) -> ApiResult<String> {
    body.ok()
        .and_then(|Json(value)| {
            value
                .get("content")
                .and_then(Value::as_str)
                .map(|content| content.trim().to_string())
        })
        .filter(|content| !content.is_empty())
        .ok_or_else(|| ApiError::Validation(message.to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// A concurrent registration can slip past the taken-checks; the unique index
// still catches it.
fn is_unique_violation(e: &anyhow::Error) -> bool {
    e.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .map(|e| e.is_unique_violation())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paginator::PageLimits;
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.migrate().await.unwrap();
        router(AppState {
            paginator: Arc::new(FeedPaginator::new(Arc::clone(&db), PageLimits::default())),
            credentials: Arc::new(Credentials::new("test-secret", 7)),
            db,
        })
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn register_user(app: &Router, email: &str, username: &str) -> String {
        let (status, body) = send(
            app,
            Method::POST,
            "/auth/register",
            None,
            Some(json!({ "email": email, "username": username, "password": "secret1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "register failed: {}", body);
        body["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let app = test_app().await;
        register_user(&app, "alice@example.com", "alice").await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "email": "alice@example.com", "password": "secret1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["username"], "alice");
        assert!(body["user"].get("password_hash").is_none());
        assert!(body["token"].as_str().is_some());

        let (status, body) = send(
            &app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "email": "alice@example.com", "password": "wrong-password" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid email or password");

        let (status, _) = send(
            &app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "email": "alice@example.com" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_register_conflicts_name_the_field() {
        let app = test_app().await;
        register_user(&app, "alice@example.com", "alice").await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/auth/register",
            None,
            Some(json!({ "email": "alice@example.com", "username": "someone", "password": "secret1" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().to_lowercase().contains("email"));

        let (status, body) = send(
            &app,
            Method::POST,
            "/auth/register",
            None,
            Some(json!({ "email": "other@example.com", "username": "alice", "password": "secret1" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().to_lowercase().contains("username"));
    }

    #[tokio::test]
    async fn test_register_validation() {
        let app = test_app().await;

        for body in [
            json!({ "email": "a@example.com", "username": "a" }),
            json!({ "email": "a@example.com", "username": "a", "password": "short" }),
            json!({ "email": "not-an-email", "username": "a", "password": "secret1" }),
        ] {
            let (status, _) = send(&app, Method::POST, "/auth/register", None, Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_create_post_requires_auth() {
        let app = test_app().await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/posts",
            None,
            Some(json!({ "content": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let (status, _) = send(
            &app,
            Method::POST,
            "/posts",
            Some("garbage"),
            Some(json!({ "content": "hello" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, page) = send(&app, Method::GET, "/posts", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["posts"].as_array().unwrap().len(), 0);
        assert_eq!(page["hasMore"], false);
        assert!(page["nextCursor"].is_null());
    }

    #[tokio::test]
    async fn test_create_post_validation_and_missing_user() {
        let app = test_app().await;
        let token = register_user(&app, "alice@example.com", "alice").await;

        for body in [json!({}), json!({ "content": 42 }), json!({ "content": "   " })] {
            let (status, _) = send(&app, Method::POST, "/posts", Some(&token), Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }

        let ghost = Credentials::new("test-secret", 7).issue_token("no-such-user").unwrap();
        let (status, _) = send(
            &app,
            Method::POST,
            "/posts",
            Some(&ghost),
            Some(json!({ "content": "boo" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_posts_paginate_over_http() {
        let app = test_app().await;
        let token = register_user(&app, "alice@example.com", "alice").await;

        for i in 0..3 {
            let (status, post) = send(
                &app,
                Method::POST,
                "/posts",
                Some(&token),
                Some(json!({ "content": format!("  post {}  ", i) })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(post["content"], format!("post {}", i));
            assert_eq!(post["author"]["username"], "alice");
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let (status, first) = send(&app, Method::GET, "/posts?limit=2", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["posts"][0]["content"], "post 2");
        assert_eq!(first["posts"][1]["content"], "post 1");
        assert_eq!(first["hasMore"], true);
        assert_eq!(first["nextCursor"], first["posts"][1]["createdAt"]);

        let cursor = first["nextCursor"].as_str().unwrap();
        let uri = format!("/posts?limit=2&cursor={}", cursor);
        let (status, second) = send(&app, Method::GET, &uri, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["posts"].as_array().unwrap().len(), 1);
        assert_eq!(second["posts"][0]["content"], "post 0");
        assert_eq!(second["hasMore"], false);
        assert!(second["nextCursor"].is_null());

        let (status, body) = send(&app, Method::GET, "/posts?cursor=not-a-date", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("cursor"));
    }

    #[tokio::test]
    async fn test_comments() {
        let app = test_app().await;
        let token = register_user(&app, "alice@example.com", "alice").await;

        let (status, _) = send(&app, Method::GET, "/posts/missing/comments", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, post) = send(
            &app,
            Method::POST,
            "/posts",
            Some(&token),
            Some(json!({ "content": "hello" })),
        )
        .await;
        let post_id = post["id"].as_str().unwrap();
        let uri = format!("/posts/{}/comments", post_id);

        let (status, _) = send(&app, Method::POST, &uri, None, Some(json!({ "content": "hi" }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, Method::POST, &uri, Some(&token), Some(json!({ "content": "" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            Method::POST,
            "/posts/missing/comments",
            Some(&token),
            Some(json!({ "content": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        for text in ["first", "second"] {
            let (status, body) =
                send(&app, Method::POST, &uri, Some(&token), Some(json!({ "content": text }))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["comment"]["content"], text);
            assert_eq!(body["comment"]["postId"], post_id);
            assert_eq!(body["comment"]["author"]["username"], "alice");
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let (status, body) = send(&app, Method::GET, &uri, None, None).await;
        assert_eq!(status, StatusCode::OK);
        let contents: Vec<_> = body["comments"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["content"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(contents, vec!["first", "second"]);

        let (_, body) = send(&app, Method::GET, &format!("{}?limit=1", uri), None, None).await;
        assert_eq!(body["comments"].as_array().unwrap().len(), 1);
    }
}
