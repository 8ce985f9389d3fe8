//! ActivityStreams documents as loaded from remote servers.
//!
//! A [`Document`] is an opaque JSON tree plus the response headers it came
//! with. Only the handful of properties needed for caching, crawling and
//! relation counting are interpreted here.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Activity types. Activities are never served from cache.
pub const ACTIVITY_TYPES: &[&str] = &[
    "Accept", "Add", "Announce", "Arrive", "Block", "Create", "Delete", "Dislike", "Flag", "Follow", "Ignore",
    "Invite", "Join", "Leave", "Like", "Listen", "Move", "Offer", "Question", "Read", "Reject", "Remove",
    "TentativeAccept", "TentativeReject", "Travel", "Undo", "Update", "View",
];

/// Actor types.
pub const ACTOR_TYPES: &[&str] = &["Application", "Group", "Organization", "Person", "Service"];

/// Collection and collection page types.
pub const COLLECTION_TYPES: &[&str] =
    &["Collection", "OrderedCollection", "CollectionPage", "OrderedCollectionPage"];

/// The kind of relation a document expresses toward its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationType {
    Like,
    Dislike,
    Announce,
    Reply,
}

impl RelationType {
    pub const ALL: [RelationType; 4] =
        [RelationType::Like, RelationType::Dislike, RelationType::Announce, RelationType::Reply];

    /// Metadata key used for both the relation marker and the counter.
    pub fn as_str(self) -> &'static str {
        match self {
            RelationType::Like => "like",
            RelationType::Dislike => "dislike",
            RelationType::Announce => "announce",
            RelationType::Reply => "reply",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relation carried by a document: "this document likes/announces/replies to `target`".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub kind: RelationType,
    pub target: String,
}

/// Shape of an actor's outbox property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbox {
    Missing,
    /// A genuine outbox collection published by the origin.
    Link(String),
    /// A map-valued outbox synthesized inline (e.g. derived from a feed).
    Embedded,
}

/// A loaded ActivityStreams document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    url: String,
    object: Value,
    headers: BTreeMap<String, String>,
}

impl Document {
    /// Create a document loaded from `url` with no response headers.
    pub fn new(url: impl Into<String>, object: Value) -> Self {
        Self { url: url.into(), object, headers: BTreeMap::new() }
    }

    /// Attach response headers. Header names are lower-cased.
    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self.headers.insert(name.as_ref().to_ascii_lowercase(), value.into());
        }
        self
    }

    /// The URL this document was requested under.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn object(&self) -> &Value {
        &self.object
    }

    pub fn into_object(self) -> Value {
        self.object
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    /// The document's own identifier (`id`, falling back to `@id`).
    pub fn id(&self) -> Option<&str> {
        self.object
            .get("id")
            .or_else(|| self.object.get("@id"))
            .and_then(Value::as_str)
    }

    /// All values of `type` (a string or an array of strings).
    pub fn types(&self) -> Vec<&str> {
        match self.object.get("type") {
            Some(Value::String(t)) => vec![t.as_str()],
            Some(Value::Array(ts)) => ts.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    fn has_type(&self, set: &[&str]) -> bool {
        self.types().iter().any(|t| set.contains(t))
    }

    pub fn is_activity(&self) -> bool {
        self.has_type(ACTIVITY_TYPES)
    }

    pub fn is_actor(&self) -> bool {
        self.has_type(ACTOR_TYPES)
    }

    pub fn is_collection(&self) -> bool {
        self.has_type(COLLECTION_TYPES)
    }

    /// Anything that is neither an activity, an actor nor a collection.
    pub fn is_object(&self) -> bool {
        !self.is_activity() && !self.is_actor() && !self.is_collection()
    }

    /// The parent document this one replies to.
    pub fn in_reply_to(&self) -> Option<String> {
        self.object.get("inReplyTo").and_then(first_href)
    }

    /// Actor URLs credited with this document.
    pub fn attributed_to(&self) -> Vec<String> {
        self.object.get("attributedTo").map(all_hrefs).unwrap_or_default()
    }

    /// The target of an activity (`object` as a link or embedded object id).
    pub fn object_href(&self) -> Option<String> {
        self.object.get("object").and_then(first_href)
    }

    /// A link-valued property: either a URL string or an object carrying only a
    /// reference. Embedded values with content are not links.
    pub fn link(&self, property: &str) -> Option<String> {
        match self.object.get(property)? {
            Value::String(href) => Some(href.clone()),
            Value::Object(map) if !is_embedded_collection(map) => {
                map.get("id").and_then(Value::as_str).map(str::to_string)
            }
            _ => None,
        }
    }

    /// An embedded collection-valued property as a document of its own.
    pub fn embedded(&self, property: &str) -> Option<Document> {
        let value = self.object.get(property)?;
        let map = value.as_object().filter(|map| is_embedded_collection(map))?;
        let url = map.get("id").and_then(Value::as_str).unwrap_or(&self.url);
        Some(Document::new(url, value.clone()))
    }

    /// Shape of the actor's `outbox` property.
    pub fn outbox(&self) -> Outbox {
        match self.object.get("outbox") {
            Some(Value::String(href)) => Outbox::Link(href.clone()),
            Some(Value::Object(_)) => Outbox::Embedded,
            _ => Outbox::Missing,
        }
    }

    /// Member hrefs of this collection (page), `orderedItems` before `items`.
    pub fn items(&self) -> Vec<String> {
        self.object
            .get("orderedItems")
            .or_else(|| self.object.get("items"))
            .map(all_hrefs)
            .unwrap_or_default()
    }

    /// The first page of a collection.
    pub fn first(&self) -> Option<Page> {
        self.object.get("first").and_then(|v| Page::from_value(&self.url, v))
    }

    /// The next page after this collection page.
    pub fn next(&self) -> Option<Page> {
        self.object.get("next").and_then(|v| Page::from_value(&self.url, v))
    }

    /// The object embedded in a Create, as a document keyed by its own id.
    ///
    /// Objects without an id, and Creates that only link their object, yield
    /// `None`.
    pub fn unwrapped(&self) -> Option<Document> {
        if !self.types().contains(&"Create") {
            return None;
        }
        let inner = self.object.get("object").filter(|v| v.is_object())?;
        let id = inner.get("id").and_then(Value::as_str)?;
        Some(Document::new(id, inner.clone()))
    }

    /// Classify this document as a relation toward another document.
    ///
    /// Like/Dislike/Announce point at their `object`. A reply is any
    /// non-activity object with `inReplyTo`. A Create is never a relation
    /// itself; see [`Document::unwrapped`].
    pub fn relation(&self) -> Option<Relation> {
        let types = self.types();
        let activity = |kind| self.object_href().map(|target| Relation { kind, target });

        if types.contains(&"Like") {
            return activity(RelationType::Like);
        }
        if types.contains(&"Dislike") {
            return activity(RelationType::Dislike);
        }
        if types.contains(&"Announce") {
            return activity(RelationType::Announce);
        }
        if self.is_object() {
            return self.in_reply_to().map(|target| Relation { kind: RelationType::Reply, target });
        }
        None
    }
}

/// A collection page, either referenced by URL or embedded in its parent.
#[derive(Debug, Clone, PartialEq)]
pub enum Page {
    Link(String),
    Embedded(Box<Document>),
}

impl Page {
    fn from_value(parent: &str, value: &Value) -> Option<Self> {
        match value {
            Value::String(href) => Some(Page::Link(href.clone())),
            Value::Object(map) if has_members(map) => {
                let url = map.get("id").and_then(Value::as_str).unwrap_or(parent);
                Some(Page::Embedded(Box::new(Document::new(url, value.clone()))))
            }
            Value::Object(map) => map.get("id").and_then(Value::as_str).map(|href| Page::Link(href.to_string())),
            _ => None,
        }
    }
}

fn has_members(map: &serde_json::Map<String, Value>) -> bool {
    map.contains_key("items") || map.contains_key("orderedItems")
}

fn is_embedded_collection(map: &serde_json::Map<String, Value>) -> bool {
    has_members(map) || map.contains_key("first")
}

/// The href of a link value: a string, an object with `id`/`href`, or the first of an array.
fn first_href(value: &Value) -> Option<String> {
    match value {
        Value::String(href) => Some(href.clone()),
        Value::Object(map) => map
            .get("id")
            .or_else(|| map.get("href"))
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::Array(values) => values.iter().find_map(first_href),
        _ => None,
    }
}

fn all_hrefs(value: &Value) -> Vec<String> {
    match value {
        Value::Array(values) => values.iter().filter_map(first_href).collect(),
        other => first_href(other).into_iter().collect(),
    }
}
