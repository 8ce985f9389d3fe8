//! Cache policy engine.
//!
//! Origins send wildly different (or no) Cache-Control headers for the same
//! kind of document. This layer rewrites `max-age` into a range chosen by the
//! document's shape before the cache sees it:
//!
//! | shape | max-age |
//! |-------|---------|
//! | activity | `no-store, max-age=0` |
//! | collection | at most 60s |
//! | actor, embedded outbox | 1 hour ..= 1 day |
//! | actor, linked outbox | 1 day ..= 30 days |
//! | anything else | 1 day ..= 1 year |
//!
//! A missing `max-age` takes the floor of its range. Other directives from the
//! origin are kept.

use std::sync::Arc;

use async_trait::async_trait;

use crate::loader::{LoadOptions, Loader};
use outpost_core::{CacheControl, Document, Error, Outbox};

pub const MINUTE: u64 = 60;
pub const HOUR: u64 = 60 * MINUTE;
pub const DAY: u64 = 24 * HOUR;
pub const MONTH: u64 = 30 * DAY;
pub const YEAR: u64 = 365 * DAY;

/// Bound `mid` to `[min, max]`. When the bounds are inverted, `max` wins.
pub fn clamp<T: PartialOrd>(min: T, mid: T, max: T) -> T {
    if min > max {
        max
    } else if mid < min {
        min
    } else if mid > max {
        max
    } else {
        mid
    }
}

/// Compute the corrected Cache-Control for `document` given the origin's.
pub fn policy_for(document: &Document, origin: &CacheControl) -> CacheControl {
    let mut policy = origin.clone();

    if document.is_activity() {
        policy.no_store = true;
        policy.max_age = Some(0);
        return policy;
    }

    let (min, max) = if document.is_collection() {
        (0, MINUTE)
    } else if document.is_actor() {
        match document.outbox() {
            Outbox::Embedded => (HOUR, DAY),
            Outbox::Link(_) | Outbox::Missing => (DAY, MONTH),
        }
    } else {
        (DAY, YEAR)
    };

    // collections default to the ceiling so an unstated policy still caches briefly
    let fallback = if document.is_collection() { max } else { min };
    policy.max_age = Some(clamp(min, origin.max_age.unwrap_or(fallback), max));
    policy
}

/// Rewrite the document's Cache-Control header in place.
pub fn apply(document: &mut Document) {
    let origin = document.header("cache-control").map(CacheControl::parse).unwrap_or_default();
    let policy = policy_for(document, &origin);
    tracing::trace!(url = document.url(), %origin, %policy, "applied cache policy");
    document.set_header("cache-control", policy.to_string());
}

/// Loader layer that applies the cache policy to every loaded document.
pub struct PolicyLoader {
    inner: Arc<dyn Loader>,
}

impl PolicyLoader {
    pub fn new(inner: Arc<dyn Loader>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Loader for PolicyLoader {
    async fn load(&self, uri: &str, options: &LoadOptions) -> Result<Document, Error> {
        let mut document = self.inner.load(uri, options).await?;
        apply(&mut document);
        Ok(document)
    }
}
