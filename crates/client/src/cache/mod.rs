//! Document cache, the outermost loader layer.
//!
//! ## Reads
//!
//! A stored record is served without touching the network, as long as its
//! Cache-Control allows it. Once past `revalidates` a refresh is started in
//! the background (stale-while-revalidate). Misses, unservable records and
//! unreadable records load through the inner chain.
//!
//! ## Writes
//!
//! Fresh documents are saved in the background, unless their Cache-Control
//! forbids storing them. Saving a relation (Like, Dislike, Announce, reply)
//! recounts that relation on its target; a target that is not cached yet gets
//! a crawl task instead of a synchronous fetch. A Create is saved along with
//! the object it wraps, which is counted only once however it arrives.
//!
//! Without a store the cache is a pass-through.

pub mod background;
pub mod record;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::crawler::CrawlArgs;
use crate::fetch::is_well_formed;
use crate::loader::{LoadOptions, Loader};
use outpost_core::{
    AppConfig, CacheControl, CachedDocument, Document, DocumentStore, Error, Queue, Relation, RelationType, now_unix,
};

pub use background::BackgroundPool;
pub use record::{Timestamps, build_record, calc_refresh_date, record_key, same_origin, set_count};

#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Shared-cache mode: `private` responses are never served.
    pub public_mode: bool,
    pub max_ttl_secs: i64,
    pub purge_interval: Duration,
    pub background_limit: usize,
    /// Scheduling for crawl tasks queued for uncached relation targets.
    pub crawl_priority: i64,
    pub crawl_delay: Duration,
    /// Longest reply chain pre-warmed from a single load.
    pub prewarm_depth: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for CacheOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            public_mode: config.cache.public_mode,
            max_ttl_secs: config.cache.max_ttl_secs as i64,
            purge_interval: config.cache.purge_interval(),
            background_limit: config.cache.background_limit,
            crawl_priority: config.crawler.priority,
            crawl_delay: config.crawler.cooldown(),
            prewarm_depth: config.crawler.max_depth,
        }
    }
}

struct Shared {
    inner: Arc<dyn Loader>,
    store: Option<Arc<dyn DocumentStore>>,
    queue: Option<Arc<Queue>>,
    pool: Arc<BackgroundPool>,
    options: CacheOptions,
}

/// Caching loader layer. Cheap to clone; clones share the pool and store.
#[derive(Clone)]
pub struct DocumentCache {
    shared: Arc<Shared>,
}

impl DocumentCache {
    pub fn new(
        inner: Arc<dyn Loader>,
        store: Option<Arc<dyn DocumentStore>>,
        queue: Option<Arc<Queue>>,
        options: CacheOptions,
    ) -> Self {
        let pool = Arc::new(BackgroundPool::new(options.background_limit));
        Self::with_pool(inner, store, queue, options, pool)
    }

    /// Like [`DocumentCache::new`], running background work on `pool`.
    pub fn with_pool(
        inner: Arc<dyn Loader>,
        store: Option<Arc<dyn DocumentStore>>,
        queue: Option<Arc<Queue>>,
        options: CacheOptions,
        pool: Arc<BackgroundPool>,
    ) -> Self {
        Self { shared: Arc::new(Shared { inner, store, queue, pool, options }) }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.shared.options
    }

    /// Fetch `uri` through the inner chain regardless of freshness and
    /// overwrite the stored record before returning.
    ///
    /// Save failures are logged; the fetched document is still returned.
    pub async fn revalidate(&self, uri: &str, options: &LoadOptions) -> Result<Document, Error> {
        let document = self.shared.inner.load(uri, options).await?;
        if let Err(e) = self.save(&document, uri, options).await {
            tracing::warn!(url = uri, error = %e, "failed to save revalidated document");
        }
        Ok(document)
    }

    /// Wait for all background work on the cache's pool to finish.
    pub async fn flush(&self) {
        self.shared.pool.idle().await;
    }

    /// Start the periodic sweep of expired records. Returns `None` when there
    /// is no store to sweep.
    pub fn spawn_purge_loop(&self) -> Option<JoinHandle<()>> {
        let store = self.shared.store.clone()?;
        let period = self.shared.options.purge_interval;

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;
                match store.purge_documents(now_unix()).await {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!(purged, "purged expired documents"),
                    Err(e) => tracing::warn!(error = %e, "document purge failed"),
                }
            }
        }))
    }

    /// Look up a servable record for `uri`. Storage errors count as misses.
    async fn lookup(&self, store: &dyn DocumentStore, uri: &str) -> Option<CachedDocument> {
        let record = match store.load_document(uri).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(url = uri, error = %e, "unreadable cache record, loading live");
                return None;
            }
        };

        let policy = record.headers.get("cache-control").map(|h| CacheControl::parse(h.as_str())).unwrap_or_default();
        if !policy.is_cache_allowed(self.shared.options.public_mode) {
            tracing::trace!(url = uri, %policy, "stored record not servable");
            return None;
        }
        Some(record)
    }

    /// Persist `document` (requested as `requested`) and update relation counts.
    ///
    /// The object inside a Create is saved as well when it comes from the
    /// same origin as the Create.
    pub async fn save(&self, document: &Document, requested: &str, options: &LoadOptions) -> Result<(), Error> {
        let Some(store) = self.shared.store.as_deref() else {
            return Ok(());
        };
        if let Some(object) = document.unwrapped().filter(|object| same_origin(object.url(), document.url())) {
            self.save_one(store, &object, object.url(), options).await?;
        }
        self.save_one(store, document, requested, options).await
    }

    async fn save_one(
        &self,
        store: &dyn DocumentStore,
        document: &Document,
        requested: &str,
        options: &LoadOptions,
    ) -> Result<(), Error> {
        let now = now_unix();
        let mut record = build_record(document, requested, now, self.shared.options.max_ttl_secs);

        match document.relation() {
            Some(relation) => {
                store.save_document(&record).await?;
                tracing::debug!(url = %record.url, kind = %relation.kind, target = %relation.target, "relation saved");
                self.count(store, document, &relation, options).await
            }
            None => {
                let policy = document.header("cache-control").map(CacheControl::parse).unwrap_or_default();
                if !policy.is_cache_allowed(self.shared.options.public_mode) {
                    tracing::debug!(url = %record.url, %policy, "not storing uncacheable document");
                    return Ok(());
                }
                for kind in RelationType::ALL {
                    let count = count_for(store, &record, kind).await?;
                    set_count(&mut record, kind, count);
                }
                store.save_document(&record).await?;
                tracing::debug!(url = %record.url, expires = record.expires, "document saved");
                Ok(())
            }
        }
    }

    /// Recount `relation.kind` on the relation's target.
    async fn count(
        &self,
        store: &dyn DocumentStore,
        document: &Document,
        relation: &Relation,
        options: &LoadOptions,
    ) -> Result<(), Error> {
        match store.load_document(&relation.target).await? {
            Some(mut target) => {
                let count = count_for(store, &target, relation.kind).await?;
                if set_count(&mut target, relation.kind, count) {
                    store.save_document(&target).await?;
                    tracing::debug!(url = %target.url, kind = %relation.kind, count, "relation count updated");
                }
                Ok(())
            }
            None => {
                let Some(queue) = &self.shared.queue else {
                    return Ok(());
                };
                if !is_well_formed(&relation.target) {
                    return Ok(());
                }
                let args = CrawlArgs::new(relation.target.clone(), vec![document.url().to_string()], options);
                let task = args.into_task(self.shared.options.crawl_priority, self.shared.options.crawl_delay)?;
                queue.push(task).await
            }
        }
    }

    fn spawn_refresh(&self, uri: &str, options: &LoadOptions) {
        let cache = self.clone();
        let uri = uri.to_string();
        let options = options.clone();
        self.shared.pool.spawn("refresh", async move {
            cache.revalidate(&uri, &options).await.map(|_| ())
        });
    }

    fn spawn_save(&self, document: Document, requested: &str, options: &LoadOptions) {
        let cache = self.clone();
        let requested = requested.to_string();
        let options = options.clone();
        self.shared.pool.spawn("save", async move { cache.save(&document, &requested, &options).await });
    }

    /// Whether the parent `href` of the reply at `uri` is worth pre-warming:
    /// the chain so far is short enough and has not visited it.
    fn should_prewarm(&self, href: &str, uri: &str, options: &LoadOptions) -> bool {
        is_well_formed(href)
            && options.depth() < self.shared.options.prewarm_depth
            && href != uri
            && !options.history.iter().any(|visited| visited == href)
    }

    /// Warm the cache for a reply's parent without crawling it.
    fn spawn_prewarm(&self, parent: String, uri: &str, options: &LoadOptions) {
        let cache = self.clone();
        let options = options.clone().without_crawl().with_history(options.history_with(uri));
        self.shared.pool.spawn("prewarm", async move { cache.load(&parent, &options).await.map(|_| ()) });
    }
}

/// Relations of `kind` pointing at any of the record's URLs.
async fn count_for(store: &dyn DocumentStore, record: &CachedDocument, kind: RelationType) -> Result<u64, Error> {
    let mut total = 0;
    for url in &record.urls {
        total += store.count_relations(kind, url).await?;
    }
    Ok(total)
}

#[async_trait]
impl Loader for DocumentCache {
    async fn load(&self, uri: &str, options: &LoadOptions) -> Result<Document, Error> {
        let Some(store) = self.shared.store.clone() else {
            return self.shared.inner.load(uri, options).await;
        };

        if let Some(record) = self.lookup(store.as_ref(), uri).await {
            tracing::debug!(url = uri, "cache hit");
            if now_unix() >= record.revalidates {
                self.spawn_refresh(uri, options);
            }
            return Ok(record.to_document());
        }

        tracing::debug!(url = uri, "cache miss");
        let document = self.shared.inner.load(uri, options).await?;
        self.spawn_save(document.clone(), uri, options);

        if let Some(parent) = document.in_reply_to().filter(|href| self.should_prewarm(href, uri, options)) {
            self.spawn_prewarm(parent, uri, options);
        }

        Ok(document)
    }
}
