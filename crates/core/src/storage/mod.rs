//! SQLite-backed storage for cached documents and queued tasks.
//!
//! The cache and the queue only see the [`DocumentStore`] and [`TaskStore`]
//! traits; [`Store`] implements both on one tokio-rusqlite connection with:
//!
//! - Versioned schema migrations
//! - WAL mode for concurrent access
//! - Alias URLs collapsing onto one canonical document row
//! - Dedup signatures stored as SHA-256 digests

pub mod connection;
pub mod documents;
pub mod hash;
pub mod migrations;
pub mod tasks;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use crate::Error;
use crate::document::{Document, RelationType};
use crate::queue::Task;

pub use connection::Store;

/// Metadata key carrying a relation's kind.
pub const META_RELATION_TYPE: &str = "relationType";
/// Metadata key carrying a relation's target URL.
pub const META_RELATION_HREF: &str = "relationHref";

/// A document persisted by the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDocument {
    /// Canonical URL (primary key).
    pub url: String,
    /// Every URL known to resolve to this document, canonical URL included.
    pub urls: Vec<String>,
    pub object: Value,
    pub headers: BTreeMap<String, String>,
    pub metadata: Map<String, Value>,
    pub published: i64,
    pub received: i64,
    /// Zero means the document is never fresh.
    pub expires: i64,
    pub revalidates: i64,
    /// The record is deleted by the purge sweep once this is in the past.
    pub purge_after: i64,
}

impl CachedDocument {
    /// Relation kind this record expresses, from its metadata.
    pub fn relation_type(&self) -> Option<RelationType> {
        self.metadata
            .get(META_RELATION_TYPE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn relation_href(&self) -> Option<&str> {
        self.metadata.get(META_RELATION_HREF).and_then(Value::as_str)
    }

    /// Stored counter for relations of `kind` targeting this record.
    pub fn relation_count(&self, kind: RelationType) -> u64 {
        self.metadata.get(kind.as_str()).and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn set_relation_count(&mut self, kind: RelationType, count: u64) {
        self.metadata.insert(kind.as_str().to_string(), Value::from(count));
    }

    /// Rebuild the document as it was loaded, keyed by its canonical URL.
    pub fn to_document(&self) -> Document {
        Document::new(self.url.clone(), self.object.clone()).with_headers(self.headers.clone())
    }
}

/// A task that failed permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub task_id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
    pub error: String,
    pub retry_count: u32,
    pub failed_at: i64,
}

/// Persistent collection of cached documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Find the record any of whose URLs equals `url`.
    async fn load_document(&self, url: &str) -> Result<Option<CachedDocument>, Error>;

    /// Insert or overwrite the record, registering all of its URLs.
    async fn save_document(&self, record: &CachedDocument) -> Result<(), Error>;

    /// Count stored relation records of `kind` pointing at `href`.
    async fn count_relations(&self, kind: RelationType, href: &str) -> Result<u64, Error>;

    /// Delete every record whose `purge_after` is before `now`.
    async fn purge_documents(&self, now: i64) -> Result<u64, Error>;
}

/// Persistent task journal and failure log.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a task. Returns false when an existing task with the same
    /// signature absorbed it.
    async fn insert_task(&self, task: &Task) -> Result<bool, Error>;

    async fn load_task(&self, task_id: &str) -> Result<Option<Task>, Error>;

    /// Claim up to `limit` eligible tasks for `lock_id`, most urgent first.
    ///
    /// Eligible tasks have both `start_date` and `timeout_date` at or before
    /// `now`, whatever their current lock. Claimed tasks get `timeout_date`.
    async fn lock_tasks(&self, lock_id: &str, now: i64, timeout_date: i64, limit: usize) -> Result<u64, Error>;

    /// Tasks currently held by `lock_id`, in priority order.
    async fn locked_tasks(&self, lock_id: &str) -> Result<Vec<Task>, Error>;

    async fn update_task(&self, task: &Task) -> Result<(), Error>;

    async fn delete_task(&self, task_id: &str) -> Result<(), Error>;

    /// Append the task to the failure log.
    async fn log_failure(&self, task: &Task, error: &str) -> Result<(), Error>;

    /// Most recent failures first.
    async fn failures(&self, limit: usize) -> Result<Vec<FailedTask>, Error>;

    async fn count_tasks(&self) -> Result<u64, Error>;
}
