//! Assembles the loader chain: cache → policy → crawler → transport.
//!
//! The crawler and the crawl task handler need to re-enter the chain from
//! the top, so they hold a weak reference to the cache, which is fixed when
//! the chain is built. Crawl discovery shares the cache's background pool, so
//! flushing the cache also waits for pending discovery.

use std::sync::{Arc, Weak};

use crate::cache::{BackgroundPool, CacheOptions, DocumentCache};
use crate::crawler::{CRAWL_TASK, CrawlHandler, Crawler, CrawlerOptions};
use crate::loader::{LoadOptions, Loader};
use crate::policy::PolicyLoader;
use outpost_core::{AppConfig, Document, DocumentStore, Error, Queue, Registry};

pub struct Pipeline {
    cache: Arc<DocumentCache>,
    queue: Arc<Queue>,
}

impl Pipeline {
    /// Build the chain over `transport`.
    ///
    /// With `cache.enabled` off, or without a store, the cache is a
    /// pass-through. With `crawler.enabled` off the crawler layer is left out.
    pub fn new(
        config: &AppConfig,
        transport: Arc<dyn Loader>,
        store: Option<Arc<dyn DocumentStore>>,
        queue: Arc<Queue>,
    ) -> Self {
        let store = store.filter(|_| config.cache.enabled);
        let options = CacheOptions::from(config);
        let pool = Arc::new(BackgroundPool::new(options.background_limit));

        let cache = Arc::new_cyclic(|weak: &Weak<DocumentCache>| {
            let root: Weak<dyn Loader> = weak.clone();

            let mut chain = transport;
            if config.crawler.enabled {
                let crawler = CrawlerOptions::from(&config.crawler);
                chain = Arc::new(Crawler::new(chain, root, Arc::clone(&queue), crawler, Arc::clone(&pool)));
            }
            chain = Arc::new(PolicyLoader::new(chain));

            DocumentCache::with_pool(chain, store, Some(Arc::clone(&queue)), options, pool)
        });

        tracing::debug!(
            cache = config.cache.enabled,
            crawler = config.crawler.enabled,
            max_depth = config.crawler.max_depth,
            "loader chain assembled"
        );

        Self { cache, queue }
    }

    /// The outermost loader. Everything loaded through it is cached and crawled.
    pub fn root(&self) -> Arc<dyn Loader> {
        self.cache.clone()
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub async fn load(&self, uri: &str, options: &LoadOptions) -> Result<Document, Error> {
        self.cache.load(uri, options).await
    }

    /// Register the crawl task handler.
    pub fn register(&self, registry: &mut Registry) -> Result<(), Error> {
        let root = Arc::downgrade(&self.root());
        registry.register(CRAWL_TASK, Arc::new(CrawlHandler::new(root)))
    }
}
