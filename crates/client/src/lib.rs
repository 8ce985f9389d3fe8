//! Client code for outpost.
//!
//! This crate provides the loader chain for remote ActivityStreams documents:
//! HTTP transport, cache policy, crawler, and the persistent document cache.

pub mod cache;
pub mod crawler;
pub mod fetch;
pub mod loader;
pub mod pipeline;
pub mod policy;

#[cfg(test)]
mod testing;

pub use cache::{CacheOptions, DocumentCache};
pub use crawler::{CRAWL_TASK, CrawlArgs, CrawlHandler, Crawler, CrawlerOptions};
pub use fetch::{FetchClient, FetchConfig, FetchResponse};
pub use loader::{ActorRef, LoadOptions, Loader};
pub use pipeline::Pipeline;
pub use policy::PolicyLoader;
