//! In-memory transport and store helpers for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::loader::{LoadOptions, Loader};
use outpost_core::{Document, Error, Store, Task, TaskStore};

/// Scripted transport: serves registered documents, 404s everything else,
/// and records every request.
#[derive(Default)]
pub struct StaticLoader {
    documents: Mutex<HashMap<String, Document>>,
    calls: Mutex<Vec<(String, LoadOptions)>>,
}

impl StaticLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, url: &str, object: Value) {
        self.insert_document(Document::new(url, object));
    }

    pub fn insert_document(&self, document: Document) {
        self.documents.lock().unwrap().insert(document.url().to_string(), document);
    }

    /// URLs requested so far, in order.
    pub fn requested(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(url, _)| url.clone()).collect()
    }

    pub fn count(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(u, _)| u == url).count()
    }

    /// Options passed with the most recent request for `url`.
    pub fn last_options(&self, url: &str) -> Option<LoadOptions> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(u, _)| u == url)
            .map(|(_, options)| options.clone())
    }
}

#[async_trait]
impl Loader for StaticLoader {
    async fn load(&self, uri: &str, options: &LoadOptions) -> Result<Document, Error> {
        self.calls.lock().unwrap().push((uri.to_string(), options.clone()));
        self.documents
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| Error::NotFound(uri.to_string()))
    }
}

/// Claim and return every queued task regardless of its start date.
pub async fn drain_tasks(store: &Store) -> Vec<Task> {
    let far_future = i64::MAX / 2;
    store.lock_tasks("inspect", far_future, far_future, 10_000).await.unwrap();
    store.locked_tasks("inspect").await.unwrap()
}
