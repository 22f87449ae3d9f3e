pub mod auth;
pub mod client;
pub mod comments;
pub mod database;
pub mod error;
pub mod feed_cache;
pub mod paginator;
pub mod scroll;
pub mod server;
pub mod session;
pub mod types;
