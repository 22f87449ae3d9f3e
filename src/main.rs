use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use social_feed::{
    auth::{Credentials, DEFAULT_TOKEN_TTL_DAYS},
    client::{ApiClient, PostPublisher},
    database::Database,
    feed_cache::RevalidatePolicy,
    paginator::{FeedPaginator, PageLimits, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE},
    scroll::{FeedFooter, ScrollTrigger},
    server::{self, AppState},
    session::FeedSession,
};

#[derive(Parser)]
#[command(name = "social-feed")]
#[command(about = "A minimal social feed: posts, comments and a cursor-paginated timeline")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:./social-feed.db")]
    database_url: String,

    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,

    #[arg(long, env = "JWT_SECRET")]
    jwt_secret: Option<String>,

    #[arg(long, env = "TOKEN_TTL_DAYS", default_value_t = DEFAULT_TOKEN_TTL_DAYS)]
    token_ttl_days: i64,

    #[arg(long, env = "DEFAULT_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    default_page_size: i64,

    #[arg(long, env = "MAX_PAGE_SIZE", default_value_t = MAX_PAGE_SIZE)]
    max_page_size: i64,
}

#[derive(Subcommand)]
enum Command {
    /// Run the feed server (default)
    Serve,
    /// Page through the feed of a running server
    Browse {
        #[arg(long, env = "FEED_SERVER", default_value = "http://localhost:3000")]
        server: String,
        /// Number of pages to load
        #[arg(long, default_value_t = 3)]
        pages: usize,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Log in and publish a post
    Post {
        #[arg(long, env = "FEED_SERVER", default_value = "http://localhost:3000")]
        server: String,
        #[arg(long, env = "FEED_EMAIL")]
        email: String,
        #[arg(long, env = "FEED_PASSWORD")]
        password: String,
        content: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let args = Args::parse();

    match &args.command {
        Some(Command::Browse {
            server,
            pages,
            limit,
        }) => browse(server, *pages, *limit).await,
        Some(Command::Post {
            server,
            email,
            password,
            content,
        }) => publish(server, email, password, content).await,
        Some(Command::Serve) | None => serve(&args).await,
    }
}

async fn serve(args: &Args) -> Result<()> {
    let jwt_secret = args
        .jwt_secret
        .as_deref()
        .context("JWT_SECRET must be set to run the server")?;

    // Initialize database
    let db = Arc::new(Database::new(&args.database_url).await?);
    db.migrate().await?;

    let limits = PageLimits {
        default: args.default_page_size,
        max: args.max_page_size,
    };

    let app_state = AppState {
        paginator: Arc::new(FeedPaginator::new(Arc::clone(&db), limits)),
        credentials: Arc::new(Credentials::new(jwt_secret, args.token_ttl_days)),
        db,
    };

    let app = server::router(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!("Social feed listening on port {}", args.port);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn browse(server: &str, pages: usize, limit: u32) -> Result<()> {
    let client = ApiClient::new(server)?;
    let session = FeedSession::new(client, limit, RevalidatePolicy::default());

    session.start().await?;
    for _ in 1..pages {
        if !session.load_more().await? {
            break;
        }
    }

    let snapshot = session.snapshot().await;
    for post in &snapshot.posts {
        println!(
            "[{}] {}: {}",
            post.created_at.format("%Y-%m-%d %H:%M"),
            post.author.username,
            post.content
        );
    }

    let footer = session.with_cache(ScrollTrigger::footer).await;
    match footer {
        FeedFooter::ScrollForMore => {
            println!("-- {} posts loaded, more available --", snapshot.posts.len())
        }
        other => println!("-- {} --", other.label()),
    }
    Ok(())
}

async fn publish(server: &str, email: &str, password: &str, content: &str) -> Result<()> {
    let client = ApiClient::new(server)?;
    let auth = client.login(email, password).await?;
    let client = client.with_token(auth.token);

    let post = client.create_post(content).await?;
    info!("Published post {} as {}", post.id, auth.user.username);
    println!("{}", post.id);
    Ok(())
}
