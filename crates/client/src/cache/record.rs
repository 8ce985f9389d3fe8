//! Turning a loaded document into a persisted cache record.

use serde_json::{Map, Value};
use url::Url;

use outpost_core::cachecontrol::parse_http_date;
use outpost_core::storage::{META_RELATION_HREF, META_RELATION_TYPE};
use outpost_core::{CacheControl, CachedDocument, Document, RelationType};

use crate::policy::DAY;

/// When a document loaded at `load` and expiring at `expire` should be
/// refreshed: halfway to expiry, but never sooner than a day after loading.
pub fn calc_refresh_date(load: i64, expire: i64) -> i64 {
    load.saturating_add((expire.saturating_sub(load) / 2).max(DAY as i64))
}

/// Seconds from an origin-supplied header value, saturated to `i64::MAX`.
fn secs(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Origin timestamps derived from the response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub published: i64,
    pub received: i64,
    pub expires: i64,
    pub revalidates: i64,
    pub purge_after: i64,
}

impl Timestamps {
    /// Derive timestamps for `document` received at `now`.
    ///
    /// `published` is the origin's `Date` less `Age`. `expires` comes from
    /// `max-age`, then the `Expires` header, and is zero (never fresh) when
    /// neither is usable. Retention is capped at `now + max_ttl`.
    ///
    /// Header values are untrusted: unparseable or negative ones are ignored
    /// and all arithmetic saturates, so `revalidates >= published` holds for
    /// any input.
    pub fn from_document(document: &Document, now: i64, max_ttl: i64) -> Self {
        let age = document
            .header("age")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(0, secs);
        let published = document
            .header("date")
            .and_then(parse_http_date)
            .map(|date| date.saturating_sub(age))
            .unwrap_or(now);

        let policy = document.header("cache-control").map(CacheControl::parse).unwrap_or_default();

        let expires = match policy.max_age {
            Some(0) => 0,
            Some(max_age) => published.saturating_add(secs(max_age)),
            None => document.header("expires").and_then(parse_http_date).unwrap_or(0),
        };

        let revalidates = match policy.stale_while_revalidate {
            _ if expires == 0 => published,
            Some(swr) => published.saturating_add(secs(swr)),
            None => expires,
        }
        .max(published);

        let purge_after = if expires > 0 {
            expires.max(calc_refresh_date(published, expires))
        } else {
            calc_refresh_date(published, published)
        };

        Self {
            published,
            received: now,
            expires,
            revalidates,
            purge_after: purge_after.min(now.saturating_add(max_ttl)),
        }
    }
}

/// Whether two URLs share scheme, host and port.
pub fn same_origin(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => a.origin() == b.origin() && a.origin().is_tuple(),
        _ => false,
    }
}

/// The URL a record for `document`, loaded as `requested`, is stored under.
///
/// The document's own id is trusted only when it has the same origin as the
/// URL it was fetched from; a server cannot claim another host's documents.
pub fn record_key(document: &Document, requested: &str) -> String {
    match document.id() {
        Some(id) if id == requested || same_origin(id, requested) => id.to_string(),
        Some(id) => {
            tracing::debug!(id, requested, "ignoring cross-origin id");
            requested.to_string()
        }
        None => requested.to_string(),
    }
}

/// Build the record for `document`, loaded as `requested`.
///
/// The record is keyed by [`record_key`] and lists `requested` as an alias
/// when it differs. Relation counters are left for the cache to fill in.
pub fn build_record(document: &Document, requested: &str, now: i64, max_ttl: i64) -> CachedDocument {
    let url = record_key(document, requested);

    let mut urls = vec![url.clone()];
    if !urls.iter().any(|u| u == requested) {
        urls.push(requested.to_string());
    }

    let mut metadata = Map::new();
    metadata.insert("isActor".into(), Value::Bool(document.is_actor()));
    metadata.insert("isObject".into(), Value::Bool(document.is_object()));
    metadata.insert("isCollection".into(), Value::Bool(document.is_collection()));

    let mut timestamps = Timestamps::from_document(document, now, max_ttl);

    if let Some(relation) = document.relation() {
        metadata.insert(META_RELATION_TYPE.into(), Value::from(relation.kind.as_str()));
        metadata.insert(META_RELATION_HREF.into(), Value::from(relation.target));
        // counters must not drop while the target is still cached
        timestamps.purge_after = now.saturating_add(max_ttl);
    }

    CachedDocument {
        url,
        urls,
        object: document.object().clone(),
        headers: document.headers().clone(),
        metadata,
        published: timestamps.published,
        received: timestamps.received,
        expires: timestamps.expires,
        revalidates: timestamps.revalidates,
        purge_after: timestamps.purge_after,
    }
}

/// Store `count` as the record's counter for `kind`, removing it at zero.
/// Returns whether the stored value changed.
pub fn set_count(record: &mut CachedDocument, kind: RelationType, count: u64) -> bool {
    if record.relation_count(kind) == count {
        return false;
    }
    if count > 0 {
        record.set_relation_count(kind, count);
    } else {
        record.metadata.remove(kind.as_str());
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 784_111_777; // Sun, 06 Nov 1994 08:49:37 GMT
    const TTL: i64 = 30 * 86_400;

    fn note(headers: &[(&str, &str)]) -> Document {
        Document::new("https://remote/note/1", json!({"id": "https://remote/note/1", "type": "Note"}))
            .with_headers(headers.iter().copied())
    }

    #[test]
    fn test_calc_refresh_date() {
        assert_eq!(calc_refresh_date(0, 3600), 86_400);
        assert_eq!(calc_refresh_date(0, 10 * 86_400), 5 * 86_400);
        assert_eq!(calc_refresh_date(100, 100), 100 + 86_400);
    }

    #[test]
    fn test_published_from_date_and_age() {
        let doc = note(&[("date", "Sun, 06 Nov 1994 08:49:37 GMT"), ("age", "30"), ("cache-control", "max-age=600")]);
        let t = Timestamps::from_document(&doc, NOW + 5, TTL);
        assert_eq!(t.published, NOW - 30);
        assert_eq!(t.received, NOW + 5);
        assert_eq!(t.expires, NOW - 30 + 600);
        assert_eq!(t.revalidates, t.expires);
    }

    #[test]
    fn test_missing_date_uses_now() {
        let t = Timestamps::from_document(&note(&[("cache-control", "max-age=600")]), NOW, TTL);
        assert_eq!(t.published, NOW);
        assert_eq!(t.expires, NOW + 600);
    }

    #[test]
    fn test_expires_header_fallback() {
        let doc = note(&[("date", "Sun, 06 Nov 1994 08:49:37 GMT"), ("expires", "Sun, 06 Nov 1994 09:49:37 GMT")]);
        let t = Timestamps::from_document(&doc, NOW, TTL);
        assert_eq!(t.expires, NOW + 3600);
    }

    #[test]
    fn test_never_fresh_without_expiry() {
        let t = Timestamps::from_document(&note(&[]), NOW, TTL);
        assert_eq!(t.expires, 0);
        assert_eq!(t.revalidates, t.published);
        assert_eq!(t.purge_after, NOW + 86_400);

        let t = Timestamps::from_document(&note(&[("cache-control", "no-store, max-age=0")]), NOW, TTL);
        assert_eq!(t.expires, 0);
    }

    #[test]
    fn test_stale_while_revalidate() {
        let doc = note(&[("cache-control", "max-age=600, stale-while-revalidate=60")]);
        let t = Timestamps::from_document(&doc, NOW, TTL);
        assert_eq!(t.revalidates, NOW + 60);
        assert!(t.revalidates >= t.published);
    }

    #[test]
    fn test_purge_after_is_capped() {
        let doc = note(&[("cache-control", "max-age=31536000")]);
        let t = Timestamps::from_document(&doc, NOW, TTL);
        assert_eq!(t.purge_after, NOW + TTL);
    }

    #[test]
    fn test_overflowing_stale_while_revalidate() {
        let doc = note(&[("cache-control", "max-age=86400, stale-while-revalidate=18446744073709551615")]);
        let t = Timestamps::from_document(&doc, NOW, TTL);
        assert_eq!(t.revalidates, i64::MAX);
        assert!(t.revalidates >= t.published);
    }

    #[test]
    fn test_overflowing_max_age() {
        let doc = note(&[("cache-control", "max-age=18446744073709551615")]);
        let t = Timestamps::from_document(&doc, NOW, TTL);
        assert_eq!(t.expires, i64::MAX);
        assert_eq!(t.purge_after, NOW + TTL);
    }

    #[test]
    fn test_negative_age_is_ignored() {
        let doc = note(&[("date", "Sun, 06 Nov 1994 08:49:37 GMT"), ("age", "-9223372036854775808")]);
        let t = Timestamps::from_document(&doc, NOW, TTL);
        assert_eq!(t.published, NOW);
    }

    #[test]
    fn test_huge_age_saturates() {
        let doc = note(&[
            ("date", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ("age", "18446744073709551615"),
            ("cache-control", "max-age=600, stale-while-revalidate=60"),
        ]);
        let t = Timestamps::from_document(&doc, NOW, TTL);
        assert!(t.published < 0);
        assert!(t.revalidates >= t.published);
        assert!(t.purge_after <= NOW + TTL);
    }

    #[test]
    fn test_revalidates_never_precedes_published() {
        for cc in ["max-age=1", "max-age=0", "stale-while-revalidate=0", "max-age=5, stale-while-revalidate=1", ""] {
            let doc = note(&[("date", "Sun, 06 Nov 1994 08:49:37 GMT"), ("cache-control", cc)]);
            let t = Timestamps::from_document(&doc, NOW, TTL);
            assert!(t.revalidates >= t.published, "{cc}");
        }
    }

    #[test]
    fn test_cross_origin_id_is_not_trusted() {
        let doc = Document::new("https://evil/x", json!({"id": "https://victim/note/1", "type": "Note"}));
        let record = build_record(&doc, "https://evil/x", NOW, TTL);
        assert_eq!(record.url, "https://evil/x");
        assert_eq!(record.urls, vec!["https://evil/x"]);

        let other_port = Document::new("https://remote/x", json!({"id": "https://remote:8443/x"}));
        assert_eq!(record_key(&other_port, "https://remote/x"), "https://remote/x");
        let other_scheme = Document::new("https://remote/x", json!({"id": "http://remote/x"}));
        assert_eq!(record_key(&other_scheme, "https://remote/x"), "https://remote/x");
    }

    #[test]
    fn test_record_aliases_and_flags() {
        let doc = Document::new("https://remote/@alice", json!({"id": "https://remote/users/alice", "type": "Person"}));
        let record = build_record(&doc, "https://remote/@alice", NOW, TTL);
        assert_eq!(record.url, "https://remote/users/alice");
        assert_eq!(record.urls, vec!["https://remote/users/alice", "https://remote/@alice"]);
        assert_eq!(record.metadata["isActor"], json!(true));
        assert_eq!(record.metadata["isObject"], json!(false));
        assert_eq!(record.relation_type(), None);
    }

    #[test]
    fn test_relation_record() {
        let doc = Document::new(
            "https://remote/like/1",
            json!({"id": "https://remote/like/1", "type": "Like", "object": "https://local/note/9"}),
        )
        .with_headers([("cache-control", "no-store, max-age=0")]);
        let record = build_record(&doc, "https://remote/like/1", NOW, TTL);
        assert_eq!(record.relation_type(), Some(RelationType::Like));
        assert_eq!(record.relation_href(), Some("https://local/note/9"));
        assert_eq!(record.purge_after, NOW + TTL);
    }

    #[test]
    fn test_set_count() {
        let mut record = build_record(&note(&[]), "https://remote/note/1", NOW, TTL);
        assert!(!set_count(&mut record, RelationType::Like, 0));
        assert!(set_count(&mut record, RelationType::Like, 2));
        assert_eq!(record.relation_count(RelationType::Like), 2);
        assert!(!set_count(&mut record, RelationType::Like, 2));
        assert!(set_count(&mut record, RelationType::Like, 0));
        assert!(!record.metadata.contains_key("like"));
    }
}
