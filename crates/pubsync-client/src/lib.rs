//! Pubsync Client - HTTP access to external sources.
//!
//! - [`http`] - paged GET requests with retry and backoff, implementing
//!   [`pubsync_core::PageFetcher`]

pub mod http;

pub use http::HttpPageFetcher;
