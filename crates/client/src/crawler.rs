//! Related-document discovery.
//!
//! After every successful load the crawler looks at a document's authors,
//! parent, and its `context`, `replies`, `likes` and `shares` collections, and
//! schedules a delayed [`CRAWL_TASK`] for each URL not yet visited in the
//! current crawl chain. The chain is bounded by `max_depth`; the history
//! guards against cycles in the document graph.
//!
//! Discovery runs in the background; nothing here fails or delays the load
//! that triggered it.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::BackgroundPool;
use crate::fetch::is_well_formed;
use crate::loader::{ActorRef, LoadOptions, Loader};
use outpost_core::config::CrawlerConfig;
use outpost_core::{Document, Error, Page, Queue, Task, TaskHandler};

/// Task name for deferred crawl fetches.
pub const CRAWL_TASK: &str = "CrawlActivityStreams";

/// Collections whose members are considered.
const RELATED_COLLECTIONS: [&str; 4] = ["context", "replies", "likes", "shares"];

/// Arguments of a [`CRAWL_TASK`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlArgs {
    pub host: String,
    #[serde(rename = "actorType")]
    pub actor_type: String,
    #[serde(rename = "actorID")]
    pub actor_id: String,
    pub url: String,
    pub history: Vec<String>,
}

impl CrawlArgs {
    /// Arguments for crawling `url` on behalf of the load described by `options`.
    pub fn new(url: impl Into<String>, history: Vec<String>, options: &LoadOptions) -> Self {
        let actor = options.actor.clone().unwrap_or(ActorRef { kind: String::new(), id: String::new() });
        Self {
            host: options.host.clone().unwrap_or_default(),
            actor_type: actor.kind,
            actor_id: actor.id,
            url: url.into(),
            history,
        }
    }

    /// Build the queued task, deduplicated on the URL.
    pub fn into_task(self, priority: i64, delay: Duration) -> Result<Task, Error> {
        let url = self.url.clone();
        Ok(Task::with_args(CRAWL_TASK, &self)?
            .with_priority(priority)
            .with_delay(delay)
            .with_signature(url))
    }

    /// Load options that resume the crawl chain where the task left it.
    pub fn load_options(&self) -> LoadOptions {
        let mut options = LoadOptions::new().with_history(self.history.clone());
        if !self.host.is_empty() {
            options = options.with_host(self.host.clone());
        }
        if !self.actor_id.is_empty() {
            options = options.with_actor(self.actor_type.clone(), self.actor_id.clone());
        }
        options
    }
}

#[derive(Debug, Clone)]
pub struct CrawlerOptions {
    pub max_depth: usize,
    pub collection_limit: usize,
    pub cooldown: Duration,
    pub priority: i64,
}

impl Default for CrawlerOptions {
    fn default() -> Self {
        Self::from(&CrawlerConfig::default())
    }
}

impl From<&CrawlerConfig> for CrawlerOptions {
    fn from(config: &CrawlerConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            collection_limit: config.collection_limit,
            cooldown: config.cooldown(),
            priority: config.priority,
        }
    }
}

/// Loader layer that schedules crawls of related documents.
///
/// Discovery runs on the background pool after the inner load returns, so
/// collection fetches never hold up the caller.
pub struct Crawler {
    inner: Arc<dyn Loader>,
    discovery: Arc<Discovery>,
    pool: Arc<BackgroundPool>,
}

impl Crawler {
    pub fn new(
        inner: Arc<dyn Loader>,
        root: Weak<dyn Loader>,
        queue: Arc<Queue>,
        options: CrawlerOptions,
        pool: Arc<BackgroundPool>,
    ) -> Self {
        Self { inner, discovery: Arc::new(Discovery { root, queue, options }), pool }
    }

    /// Decide whether `href`, found in the document at `uri`, should be crawled.
    ///
    /// Rejects malformed URLs, chains already at `max_depth`, and URLs
    /// visited earlier in the chain (including `uri` itself).
    pub fn consider(&self, href: &str, uri: &str, options: &LoadOptions) -> Option<CrawlArgs> {
        self.discovery.consider(href, uri, options)
    }
}

struct Discovery {
    /// Outermost loader, for collection loads that must go through the cache.
    root: Weak<dyn Loader>,
    queue: Arc<Queue>,
    options: CrawlerOptions,
}

impl Discovery {
    fn consider(&self, href: &str, uri: &str, options: &LoadOptions) -> Option<CrawlArgs> {
        if !is_well_formed(href) {
            tracing::trace!(href, "skipping malformed url");
            return None;
        }
        if options.depth() >= self.options.max_depth {
            return None;
        }
        if href == uri || options.history.iter().any(|visited| visited == href) {
            tracing::trace!(href, "skipping already visited url");
            return None;
        }
        Some(CrawlArgs::new(href, options.history_with(uri), options))
    }

    async fn schedule(&self, href: &str, uri: &str, options: &LoadOptions) {
        let Some(args) = self.consider(href, uri, options) else {
            return;
        };

        let result = match args.into_task(self.options.priority, self.options.cooldown) {
            Ok(task) => self.queue.push(task).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::debug!(href, from = uri, depth = options.depth() + 1, "crawl scheduled"),
            Err(e) => tracing::warn!(href, error = %e, "failed to schedule crawl"),
        }
    }

    /// Schedule crawls for everything related to `document`.
    async fn crawl(&self, uri: &str, document: &Document, options: &LoadOptions) {
        let mut seen: HashSet<String> = HashSet::new();

        let mut candidates = document.attributed_to();
        candidates.extend(document.in_reply_to());

        for property in RELATED_COLLECTIONS {
            match self.related_members(document, property, options).await {
                Ok(members) => candidates.extend(members),
                Err(e) => tracing::warn!(url = uri, property, error = %e, "failed to expand related collection"),
            }
        }

        for href in candidates {
            if seen.insert(href.clone()) {
                self.schedule(&href, uri, options).await;
            }
        }
    }

    /// Member URLs of a collection-valued property, linked or embedded.
    async fn related_members(
        &self,
        document: &Document,
        property: &str,
        options: &LoadOptions,
    ) -> Result<Vec<String>, Error> {
        let nested = options.clone().without_crawl();

        let collection = if let Some(href) = document.link(property) {
            if !is_well_formed(&href) {
                return Ok(Vec::new());
            }
            self.root()?.load(&href, &nested).await?
        } else if let Some(embedded) = document.embedded(property) {
            embedded
        } else {
            return Ok(Vec::new());
        };

        self.members(&collection, &nested).await
    }

    /// Walk a collection's pages until `collection_limit` members are found,
    /// the pages run out, or a page repeats.
    async fn members(&self, collection: &Document, options: &LoadOptions) -> Result<Vec<String>, Error> {
        let limit = self.options.collection_limit;
        let mut members = collection.items();
        let mut visited: HashSet<String> = HashSet::from([collection.url().to_string()]);
        let mut page = collection.first();

        while members.len() < limit {
            let current = match page.take() {
                None => break,
                Some(Page::Embedded(document)) => *document,
                Some(Page::Link(href)) => {
                    if !visited.insert(href.clone()) || !is_well_formed(&href) {
                        break;
                    }
                    self.root()?.load(&href, options).await?
                }
            };
            members.extend(current.items());
            page = current.next();
        }

        members.truncate(limit);
        Ok(members)
    }

    fn root(&self) -> Result<Arc<dyn Loader>, Error> {
        upgrade(&self.root)
    }
}

fn upgrade(root: &Weak<dyn Loader>) -> Result<Arc<dyn Loader>, Error> {
    root.upgrade().ok_or_else(|| Error::ChainDropped("loader chain has been dropped".into()))
}

#[async_trait]
impl Loader for Crawler {
    async fn load(&self, uri: &str, options: &LoadOptions) -> Result<Document, Error> {
        let document = self.inner.load(uri, options).await?;

        if options.crawl && options.depth() < self.discovery.options.max_depth {
            let discovery = Arc::clone(&self.discovery);
            let uri = uri.to_string();
            let found = document.clone();
            let options = options.clone();
            self.pool.spawn("crawl", async move {
                discovery.crawl(&uri, &found, &options).await;
                Ok(())
            });
        }

        Ok(document)
    }
}

/// Handler for [`CRAWL_TASK`]: loads the URL through the full chain with
/// crawling enabled, continuing the task's history.
pub struct CrawlHandler {
    root: Weak<dyn Loader>,
}

impl CrawlHandler {
    pub fn new(root: Weak<dyn Loader>) -> Self {
        Self { root }
    }
}

#[async_trait]
impl TaskHandler for CrawlHandler {
    async fn handle(&self, task: &Task) -> Result<(), Error> {
        let args: CrawlArgs = task.args()?;
        let root = upgrade(&self.root)?;

        root.load(&args.url, &args.load_options()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StaticLoader, drain_tasks};
    use outpost_core::queue::QueueOptions;
    use outpost_core::{Store, TaskStore};
    use serde_json::json;

    struct Fixture {
        transport: Arc<StaticLoader>,
        store: Arc<Store>,
        crawler: Arc<Crawler>,
        pool: Arc<BackgroundPool>,
    }

    async fn fixture(options: CrawlerOptions) -> Fixture {
        let transport = StaticLoader::new();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let queue = Queue::new(
            QueueOptions { polling: false, ..QueueOptions::default() },
            Some(store.clone() as Arc<dyn TaskStore>),
        );
        let pool = Arc::new(BackgroundPool::new(8));
        let inner: Arc<dyn Loader> = transport.clone();
        let crawler = Arc::new_cyclic(|weak: &Weak<Crawler>| {
            let root: Weak<dyn Loader> = weak.clone();
            Crawler::new(inner, root, queue, options, Arc::clone(&pool))
        });
        Fixture { transport, store, crawler, pool }
    }

    fn history(urls: &[&str]) -> Vec<String> {
        urls.iter().map(|u| u.to_string()).collect()
    }

    #[tokio::test]
    async fn test_depth_limit_blocks_everything() {
        let f = fixture(CrawlerOptions::default()).await;
        let options = LoadOptions::new().with_history(history(&["https://r/a", "https://r/b", "https://r/c", "https://r/d"]));

        assert_eq!(f.crawler.consider("https://r/e", "https://r/x", &options), None);
    }

    #[tokio::test]
    async fn test_cycle_guard() {
        let f = fixture(CrawlerOptions::default()).await;
        let options = LoadOptions::new().with_history(history(&["https://r/a"]));

        assert_eq!(f.crawler.consider("https://r/a", "https://r/b", &options), None);
        assert_eq!(f.crawler.consider("https://r/b", "https://r/b", &options), None);

        let args = f.crawler.consider("https://r/c", "https://r/b", &options).unwrap();
        assert_eq!(args.url, "https://r/c");
        assert_eq!(args.history, history(&["https://r/a", "https://r/b"]));
    }

    #[tokio::test]
    async fn test_malformed_urls_rejected() {
        let f = fixture(CrawlerOptions::default()).await;
        assert_eq!(f.crawler.consider("mailto:a@r", "https://r/b", &LoadOptions::new()), None);
        assert_eq!(f.crawler.consider("/relative", "https://r/b", &LoadOptions::new()), None);
    }

    #[tokio::test]
    async fn test_load_schedules_author_and_parent() {
        let f = fixture(CrawlerOptions::default()).await;
        f.transport.insert(
            "https://r/note/1",
            json!({
                "id": "https://r/note/1",
                "type": "Note",
                "attributedTo": "https://r/u/alice",
                "inReplyTo": "https://r/note/0",
            }),
        );

        let options = LoadOptions::new().with_host("local.example").with_actor("Person", "https://local.example/u/me");
        f.crawler.load("https://r/note/1", &options).await.unwrap();
        f.pool.idle().await;

        let mut tasks = drain_tasks(&f.store).await;
        tasks.sort_by(|a, b| a.signature.cmp(&b.signature));
        assert_eq!(tasks.len(), 2);

        let parent: CrawlArgs = tasks[0].args().unwrap();
        assert_eq!(parent.url, "https://r/note/0");
        assert_eq!(parent.history, history(&["https://r/note/1"]));
        assert_eq!(parent.host, "local.example");
        assert_eq!(parent.actor_type, "Person");
        assert_eq!(parent.actor_id, "https://local.example/u/me");

        let task = &tasks[0];
        assert_eq!(task.name, CRAWL_TASK);
        assert_eq!(task.priority, 128);
        assert_eq!(task.start_date, task.create_date + 60);
        assert_eq!(task.signature.as_deref(), Some("https://r/note/0"));
        assert_eq!(tasks[1].signature.as_deref(), Some("https://r/u/alice"));
    }

    #[tokio::test]
    async fn test_load_returns_before_collections_are_fetched() {
        let f = fixture(CrawlerOptions::default()).await;
        f.transport.insert(
            "https://r/note/1",
            json!({"type": "Note", "replies": "https://r/note/1/replies", "likes": "https://r/note/1/likes"}),
        );
        f.transport.insert("https://r/note/1/replies", json!({"type": "Collection", "items": ["https://r/reply/1"]}));
        f.transport.insert("https://r/note/1/likes", json!({"type": "Collection", "items": []}));

        f.crawler.load("https://r/note/1", &LoadOptions::new()).await.unwrap();
        assert_eq!(f.transport.requested(), vec!["https://r/note/1"]);

        f.pool.idle().await;
        assert_eq!(f.transport.count("https://r/note/1/replies"), 1);
        assert_eq!(f.transport.count("https://r/note/1/likes"), 1);
        assert_eq!(drain_tasks(&f.store).await[0].signature.as_deref(), Some("https://r/reply/1"));
    }

    #[tokio::test]
    async fn test_task_arguments_wire_format() {
        let args = CrawlArgs::new("https://r/note/0", history(&["https://r/note/1"]), &LoadOptions::new());
        let task = args.into_task(128, Duration::from_secs(60)).unwrap();
        let wire = serde_json::Value::Object(task.arguments.clone());
        assert_eq!(
            wire,
            json!({
                "host": "",
                "actorType": "",
                "actorID": "",
                "url": "https://r/note/0",
                "history": ["https://r/note/1"],
            })
        );
    }

    #[tokio::test]
    async fn test_no_crawl_when_disabled_for_call() {
        let f = fixture(CrawlerOptions::default()).await;
        f.transport.insert("https://r/note/1", json!({"type": "Note", "inReplyTo": "https://r/note/0"}));

        f.crawler.load("https://r/note/1", &LoadOptions::new().without_crawl()).await.unwrap();
        f.pool.idle().await;
        assert_eq!(f.store.count_tasks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_related_collections_are_paged() {
        let f = fixture(CrawlerOptions { collection_limit: 3, ..CrawlerOptions::default() }).await;
        f.transport.insert(
            "https://r/note/1",
            json!({"type": "Note", "replies": "https://r/note/1/replies"}),
        );
        f.transport.insert(
            "https://r/note/1/replies",
            json!({"type": "OrderedCollection", "first": "https://r/note/1/replies?page=1"}),
        );
        f.transport.insert(
            "https://r/note/1/replies?page=1",
            json!({
                "type": "OrderedCollectionPage",
                "orderedItems": ["https://r/reply/1", "https://r/reply/2"],
                "next": "https://r/note/1/replies?page=2",
            }),
        );
        f.transport.insert(
            "https://r/note/1/replies?page=2",
            json!({
                "type": "OrderedCollectionPage",
                "orderedItems": ["https://r/reply/3", "https://r/reply/4"],
                "next": "https://r/note/1/replies?page=1",
            }),
        );

        f.crawler.load("https://r/note/1", &LoadOptions::new()).await.unwrap();
        f.pool.idle().await;

        let urls: HashSet<String> = drain_tasks(&f.store).await.into_iter().filter_map(|t| t.signature).collect();
        assert_eq!(
            urls,
            HashSet::from(["https://r/reply/1".to_string(), "https://r/reply/2".into(), "https://r/reply/3".into()])
        );

        // collection pages are loaded without crawling
        let page = f.transport.last_options("https://r/note/1/replies?page=1").unwrap();
        assert!(!page.crawl);
    }

    #[tokio::test]
    async fn test_repeating_pages_terminate() {
        let f = fixture(CrawlerOptions::default()).await;
        f.transport.insert("https://r/note/1", json!({"type": "Note", "likes": "https://r/likes"}));
        f.transport.insert(
            "https://r/likes",
            json!({"type": "Collection", "first": "https://r/likes?p=1"}),
        );
        f.transport.insert(
            "https://r/likes?p=1",
            json!({"type": "CollectionPage", "items": ["https://r/like/1"], "next": "https://r/likes?p=1"}),
        );

        f.crawler.load("https://r/note/1", &LoadOptions::new()).await.unwrap();
        f.pool.idle().await;
        assert_eq!(f.transport.count("https://r/likes?p=1"), 1);
        assert_eq!(f.store.count_tasks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_embedded_collection_needs_no_fetch() {
        let f = fixture(CrawlerOptions::default()).await;
        f.transport.insert(
            "https://r/note/1",
            json!({
                "type": "Note",
                "shares": {"type": "Collection", "items": [{"id": "https://r/announce/1", "type": "Announce"}]},
            }),
        );

        f.crawler.load("https://r/note/1", &LoadOptions::new()).await.unwrap();
        f.pool.idle().await;
        assert_eq!(f.transport.requested(), vec!["https://r/note/1"]);
        assert_eq!(drain_tasks(&f.store).await[0].signature.as_deref(), Some("https://r/announce/1"));
    }

    #[tokio::test]
    async fn test_collection_errors_do_not_fail_load() {
        let f = fixture(CrawlerOptions::default()).await;
        f.transport.insert(
            "https://r/note/1",
            json!({"type": "Note", "replies": "https://r/missing", "attributedTo": "https://r/u/alice"}),
        );

        let document = f.crawler.load("https://r/note/1", &LoadOptions::new()).await.unwrap();
        f.pool.idle().await;
        assert_eq!(document.url(), "https://r/note/1");
        assert_eq!(f.store.count_tasks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_discoveries_collapse() {
        let f = fixture(CrawlerOptions::default()).await;
        f.transport.insert(
            "https://r/note/2",
            json!({"type": "Note", "attributedTo": "https://r/u/alice"}),
        );
        f.transport.insert(
            "https://r/note/3",
            json!({"type": "Note", "attributedTo": ["https://r/u/alice", "https://r/u/alice"]}),
        );

        f.crawler.load("https://r/note/2", &LoadOptions::new()).await.unwrap();
        f.pool.idle().await;
        f.crawler.load("https://r/note/3", &LoadOptions::new()).await.unwrap();
        f.pool.idle().await;
        assert_eq!(f.store.count_tasks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_handler_resumes_chain() {
        let f = fixture(CrawlerOptions::default()).await;
        f.transport.insert("https://r/note/0", json!({"type": "Note", "id": "https://r/note/0"}));
        let root: Weak<dyn Loader> = Arc::downgrade(&f.crawler) as Weak<dyn Loader>;
        let handler = CrawlHandler::new(root);

        let args = CrawlArgs::new("https://r/note/0", history(&["https://r/note/1"]), &LoadOptions::new());
        let task = args.into_task(128, Duration::ZERO).unwrap();
        handler.handle(&task).await.unwrap();

        let options = f.transport.last_options("https://r/note/0").unwrap();
        assert!(options.crawl);
        assert_eq!(options.history, history(&["https://r/note/1"]));
    }

    #[tokio::test]
    async fn test_handler_rejects_bad_arguments() {
        let f = fixture(CrawlerOptions::default()).await;
        let root: Weak<dyn Loader> = Arc::downgrade(&f.crawler) as Weak<dyn Loader>;
        let handler = CrawlHandler::new(root);

        let err = handler.handle(&Task::new(CRAWL_TASK, serde_json::Map::new())).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_handler_after_chain_dropped() {
        let f = fixture(CrawlerOptions::default()).await;
        let root: Weak<dyn Loader> = Arc::downgrade(&f.crawler) as Weak<dyn Loader>;
        let handler = CrawlHandler::new(root);
        drop(f.crawler);

        let args = CrawlArgs::new("https://r/note/0", Vec::new(), &LoadOptions::new());
        let err = handler.handle(&args.into_task(128, Duration::ZERO).unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::ChainDropped(_)));
        assert!(!err.is_retryable());
    }
}
