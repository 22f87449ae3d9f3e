use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use std::str::FromStr;
use uuid::Uuid;

use crate::types::{timestamp, Comment, Post, User, UserSummary};

const POSTS_LATEST_SQL: &str = r#"
    SELECT p.id, p.content, p.author_id, p.created_at, p.updated_at, u.username
    FROM posts p
    INNER JOIN users u ON u.id = p.author_id
    ORDER BY p.created_at DESC, p.id DESC
    LIMIT ?
"#;

const POSTS_BEFORE_SQL: &str = r#"
    SELECT p.id, p.content, p.author_id, p.created_at, p.updated_at, u.username
    FROM posts p
    INNER JOIN users u ON u.id = p.author_id
    WHERE p.created_at < ?
    ORDER BY p.created_at DESC, p.id DESC
    LIMIT ?
"#;

pub struct Database {
    pub pool: SqlitePool,
}

/// A stored user together with its password hash, used only by login.
pub struct UserRecord {
    pub user: User,
    pub password_hash: String,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        // Enable WAL mode for better concurrency
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await?;

        // Set busy timeout to 5 seconds
        sqlx::query("PRAGMA busy_timeout=5000;")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database, used by tests.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // User operations
    pub async fn insert_user(&self, email: &str, username: &str, password_hash: &str) -> Result<User> {
        let now = timestamp::now();
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            username: username.to_string(),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO users (id, email, username, password_hash, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(password_hash)
        .bind(timestamp::format(&user.created_at))
        .bind(timestamp::format(&user.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn find_user_by_id(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, email, username, password_hash, created_at, updated_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| user_from_row(&row).map(|record| record.user))
            .transpose()
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query(
            "SELECT id, email, username, password_hash, created_at, updated_at FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| user_from_row(&row)).transpose()
    }

    pub async fn email_taken(&self, email: &str) -> Result<bool> {
        let count: i64 = sqlx::query("SELECT COUNT(*) as count FROM users WHERE email = ?")
            .bind(email)
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;
        Ok(count > 0)
    }

    pub async fn username_taken(&self, username: &str) -> Result<bool> {
        let count: i64 = sqlx::query("SELECT COUNT(*) as count FROM users WHERE username = ?")
            .bind(username)
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;
        Ok(count > 0)
    }

    // Post operations
    pub async fn insert_post(&self, author: &UserSummary, content: &str) -> Result<Post> {
        let now = timestamp::now();
        let post = Post {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            created_at: now,
            updated_at: now,
            author_id: author.id.clone(),
            author: author.clone(),
        };
        self.store_post(&post).await?;
        Ok(post)
    }

    /// Writes a fully formed post, timestamps included.
    pub async fn store_post(&self, post: &Post) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO posts (id, content, author_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.content)
        .bind(&post.author_id)
        .bind(timestamp::format(&post.created_at))
        .bind(timestamp::format(&post.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn post_exists(&self, id: &str) -> Result<bool> {
        let count: i64 = sqlx::query("SELECT COUNT(*) as count FROM posts WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;
        Ok(count > 0)
    }

    // Feed queries
    /// Posts strictly older than `before` (or the newest posts when `None`),
    /// newest first, at most `take` rows.
    pub async fn get_posts_before(
        &self,
        before: Option<DateTime<Utc>>,
        take: i64,
    ) -> Result<Vec<Post>> {
        let query = match before {
            Some(cursor) => sqlx::query(POSTS_BEFORE_SQL).bind(timestamp::format(&cursor)),
            None => sqlx::query(POSTS_LATEST_SQL),
        };

        let rows = query.bind(take).fetch_all(&self.pool).await?;

        let mut posts = Vec::with_capacity(rows.len());
        for row in rows {
            let author_id: String = row.try_get("author_id")?;
            let username: String = row.try_get("username")?;
            let created_at_str: String = row.try_get("created_at")?;
            let updated_at_str: String = row.try_get("updated_at")?;

            posts.push(Post {
                id: row.try_get("id")?,
                content: row.try_get("content")?,
                created_at: timestamp::parse(&created_at_str)?,
                updated_at: timestamp::parse(&updated_at_str)?,
                author: UserSummary {
                    id: author_id.clone(),
                    username,
                },
                author_id,
            });
        }

        Ok(posts)
    }

    // Comment operations
    pub async fn insert_comment(
        &self,
        post_id: &str,
        author: &UserSummary,
        content: &str,
    ) -> Result<Comment> {
        let now = timestamp::now();
        let comment = Comment {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            created_at: now,
            updated_at: now,
            author_id: author.id.clone(),
            author: author.clone(),
            post_id: post_id.to_string(),
        };

        sqlx::query(
            r#"
            INSERT INTO comments (id, content, author_id, post_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&comment.id)
        .bind(&comment.content)
        .bind(&comment.author_id)
        .bind(&comment.post_id)
        .bind(timestamp::format(&comment.created_at))
        .bind(timestamp::format(&comment.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(comment)
    }

    /// Comments on a post, oldest first.
    pub async fn list_comments(&self, post_id: &str, limit: i64) -> Result<Vec<Comment>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.content, c.author_id, c.post_id, c.created_at, c.updated_at, u.username
            FROM comments c
            INNER JOIN users u ON u.id = c.author_id
            WHERE c.post_id = ?
            ORDER BY c.created_at ASC, c.id ASC
            LIMIT ?
            "#,
        )
        .bind(post_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut comments = Vec::with_capacity(rows.len());
        for row in rows {
            let author_id: String = row.try_get("author_id")?;
            let username: String = row.try_get("username")?;
            let created_at_str: String = row.try_get("created_at")?;
            let updated_at_str: String = row.try_get("updated_at")?;

            comments.push(Comment {
                id: row.try_get("id")?,
                content: row.try_get("content")?,
                created_at: timestamp::parse(&created_at_str)?,
                updated_at: timestamp::parse(&updated_at_str)?,
                author: UserSummary {
                    id: author_id.clone(),
                    username,
                },
                author_id,
                post_id: row.try_get("post_id")?,
            });
        }

        Ok(comments)
    }
}

fn user_from_row(row: &SqliteRow) -> Result<UserRecord> {
    let created_at_str: String = row.try_get("created_at")?;
    let updated_at_str: String = row.try_get("updated_at")?;

    Ok(UserRecord {
        user: User {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            username: row.try_get("username")?,
            created_at: timestamp::parse(&created_at_str)?,
            updated_at: timestamp::parse(&updated_at_str)?,
        },
        password_hash: row.try_get("password_hash")?,
    })
}
