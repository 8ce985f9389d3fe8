//! Cache-Control header parsing and serialization.
//!
//! Directives are matched case-insensitively. Unknown directives are ignored,
//! and a directive whose numeric argument does not parse is dropped on its own
//! without failing the rest of the header.
//!
//! `Display` writes directives in a fixed order, so any header built from the
//! supported directive set survives `parse(header.to_string())` unchanged.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Parsed Cache-Control directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
    pub no_cache: bool,
    pub no_store: bool,
    pub no_transform: bool,
    pub must_revalidate: bool,
    pub proxy_revalidate: bool,
    pub must_understand: bool,
    pub private: bool,
    pub public: bool,
    pub immutable: bool,
    pub stale_while_revalidate: Option<u64>,
    pub stale_if_error: Option<u64>,
}

impl CacheControl {
    /// Parse a comma-separated directive list.
    pub fn parse(header: &str) -> Self {
        let mut cc = Self::default();

        for directive in header.split(',') {
            let directive = directive.trim();
            if directive.is_empty() {
                continue;
            }

            let (name, value) = match directive.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (directive, None),
            };

            match name.to_ascii_lowercase().as_str() {
                "max-age" => cc.max_age = seconds(value).or(cc.max_age),
                "s-maxage" => cc.s_maxage = seconds(value).or(cc.s_maxage),
                "stale-while-revalidate" => {
                    cc.stale_while_revalidate = seconds(value).or(cc.stale_while_revalidate)
                }
                "stale-if-error" => cc.stale_if_error = seconds(value).or(cc.stale_if_error),
                // no-cache and private may carry a field-name list; only the flag matters here.
                "no-cache" => cc.no_cache = true,
                "private" => cc.private = true,
                "no-store" => cc.no_store = true,
                "no-transform" => cc.no_transform = true,
                "must-revalidate" => cc.must_revalidate = true,
                "proxy-revalidate" => cc.proxy_revalidate = true,
                "must-understand" => cc.must_understand = true,
                "public" => cc.public = true,
                "immutable" => cc.immutable = true,
                other => tracing::trace!(directive = other, "ignoring unknown cache-control directive"),
            }
        }

        cc
    }

    /// Whether a cache may serve this response.
    ///
    /// `public_mode` marks a shared cache, which must also honour `private`.
    pub fn is_cache_allowed(&self, public_mode: bool) -> bool {
        !(self.no_cache || self.no_store || self.max_age == Some(0) || (public_mode && self.private))
    }
}

fn seconds(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.parse::<u64>().ok())
}

/// Parse an HTTP-date header value (`Date`, `Expires`, `Retry-After`) into Unix seconds.
pub fn parse_http_date(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(value.trim()).ok().map(|dt| dt.timestamp())
}

impl FromStr for CacheControl {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();

        let flags = [
            (self.public, "public"),
            (self.private, "private"),
            (self.no_cache, "no-cache"),
            (self.no_store, "no-store"),
            (self.no_transform, "no-transform"),
            (self.must_revalidate, "must-revalidate"),
            (self.proxy_revalidate, "proxy-revalidate"),
            (self.must_understand, "must-understand"),
            (self.immutable, "immutable"),
        ];
        parts.extend(flags.iter().filter(|(set, _)| *set).map(|(_, name)| (*name).to_string()));

        let numbers = [
            ("max-age", self.max_age),
            ("s-maxage", self.s_maxage),
            ("stale-while-revalidate", self.stale_while_revalidate),
            ("stale-if-error", self.stale_if_error),
        ];
        parts.extend(numbers.iter().filter_map(|(name, v)| v.map(|v| format!("{name}={v}"))));

        f.write_str(&parts.join(", "))
    }
}
