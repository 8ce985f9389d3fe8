//! The `Loader` seam shared by every layer of the fetch chain.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use outpost_core::{Document, Error};

/// Loads the ActivityStreams document behind a URL.
///
/// Each layer (cache, policy, crawler, transport) implements this and wraps
/// the next one.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, uri: &str, options: &LoadOptions) -> Result<Document, Error>;
}

/// The local actor a crawl runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRef {
    pub kind: String,
    pub id: String,
}

/// Per-call crawl state, carried from one load to the loads it triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOptions {
    /// URLs already visited in this crawl chain, oldest first.
    pub history: Vec<String>,
    /// Whether this load may discover and schedule related documents.
    pub crawl: bool,
    /// Local host the crawl is attributed to.
    pub host: Option<String>,
    pub actor: Option<ActorRef>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self { history: Vec::new(), crawl: true, host: None, actor: None }
    }
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a load that must not recurse.
    pub fn without_crawl(mut self) -> Self {
        self.crawl = false;
        self
    }

    pub fn with_history(mut self, history: Vec<String>) -> Self {
        self.history = history;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_actor(mut self, kind: impl Into<String>, id: impl Into<String>) -> Self {
        self.actor = Some(ActorRef { kind: kind.into(), id: id.into() });
        self
    }

    /// Current crawl depth.
    pub fn depth(&self) -> usize {
        self.history.len()
    }

    /// History extended with `uri`, as handed to loads triggered from it.
    pub fn history_with(&self, uri: &str) -> Vec<String> {
        let mut history = self.history.clone();
        history.push(uri.to_string());
        history
    }
}
