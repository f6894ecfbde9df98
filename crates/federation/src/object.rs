//! JSON-backed ActivityStreams objects.
//!
//! The engine only needs a handful of typed views over an activity:
//! its id and type, the IRIs or embedded objects behind a property,
//! and the items of a collection. [`ApObject`] keeps the full JSON so
//! that unknown extension properties survive a round trip untouched.

use std::collections::HashSet;
use std::fmt;

use outpost_common::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// The special "Public" collection.
pub const PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Default JSON-LD context.
pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Addressing properties in delivery reading order.
pub const RECIPIENT_PROPERTIES: [&str; 5] = ["to", "bto", "cc", "bcc", "audience"];

const ACTIVITY_TYPES: &[&str] = &[
    "Accept",
    "Add",
    "Announce",
    "Arrive",
    "Block",
    "Create",
    "Delete",
    "Dislike",
    "Flag",
    "Follow",
    "Ignore",
    "Invite",
    "Join",
    "Leave",
    "Like",
    "Listen",
    "Move",
    "Offer",
    "Question",
    "Read",
    "Reject",
    "Remove",
    "TentativeAccept",
    "TentativeReject",
    "Travel",
    "Undo",
    "Update",
    "View",
];

const OBJECT_TYPES: &[&str] = &[
    "Object",
    "Link",
    "Mention",
    "Note",
    "Article",
    "Audio",
    "Document",
    "Event",
    "Image",
    "Page",
    "Place",
    "Profile",
    "Relationship",
    "Tombstone",
    "Video",
    "Application",
    "Group",
    "Organization",
    "Person",
    "Service",
    "Collection",
    "CollectionPage",
    "OrderedCollection",
    "OrderedCollectionPage",
];

/// Returns whether `iri` names the Public collection in any of its spellings.
#[must_use]
pub fn is_public(iri: &str) -> bool {
    matches!(iri, PUBLIC | "as:Public" | "Public")
}

/// Returns whether two IRIs share scheme, host and port.
#[must_use]
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

/// Activity verbs the engine dispatches on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Reject,
    Add,
    Remove,
    Like,
    Announce,
    Undo,
    Block,
    /// Any other activity type, by name.
    Other(String),
}

impl ActivityKind {
    /// Parse a type name.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "Create" => Self::Create,
            "Update" => Self::Update,
            "Delete" => Self::Delete,
            "Follow" => Self::Follow,
            "Accept" => Self::Accept,
            "Reject" => Self::Reject,
            "Add" => Self::Add,
            "Remove" => Self::Remove,
            "Like" => Self::Like,
            "Announce" => Self::Announce,
            "Undo" => Self::Undo,
            "Block" => Self::Block,
            other => Self::Other(other.to_string()),
        }
    }

    /// The ActivityStreams type name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Add => "Add",
            Self::Remove => "Remove",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Undo => "Undo",
            Self::Block => "Block",
            Self::Other(name) => name,
        }
    }

    /// Whether a built-in default side effect exists for this verb.
    #[must_use]
    pub const fn is_wrapped(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value of a property: a bare IRI or an embedded object.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    Iri(Url),
    Object(ApObject),
}

impl Property {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Url::parse(s).ok().map(Self::Iri),
            Value::Object(map) => Some(Self::Object(ApObject(map.clone()))),
            _ => None,
        }
    }

    /// The IRI this value identifies. Links resolve through `href`.
    #[must_use]
    pub fn id(&self) -> Option<Url> {
        match self {
            Self::Iri(iri) => Some(iri.clone()),
            Self::Object(object) => object.id().or_else(|| {
                object
                    .get("href")
                    .and_then(Value::as_str)
                    .and_then(|href| Url::parse(href).ok())
            }),
        }
    }

    /// The embedded object, if this value is one.
    #[must_use]
    pub const fn as_object(&self) -> Option<&ApObject> {
        match self {
            Self::Object(object) => Some(object),
            Self::Iri(_) => None,
        }
    }

    /// JSON form of the value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Iri(iri) => Value::String(iri.to_string()),
            Self::Object(object) => Value::Object(object.0.clone()),
        }
    }
}

impl From<Url> for Property {
    fn from(iri: Url) -> Self {
        Self::Iri(iri)
    }
}

impl From<ApObject> for Property {
    fn from(object: ApObject) -> Self {
        Self::Object(object)
    }
}

/// An ActivityStreams object or activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApObject(Map<String, Value>);

impl ApObject {
    /// A new object of the given type with the default context.
    #[must_use]
    pub fn new(type_name: &str) -> Self {
        let mut map = Map::new();
        map.insert("@context".into(), Value::String(AS_CONTEXT.into()));
        map.insert("type".into(), Value::String(type_name.into()));
        Self(map)
    }

    /// Wrap a JSON value, which must be an object.
    pub fn from_value(value: Value) -> AppResult<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(AppError::BadRequest(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Parse a request or response body.
    pub fn from_slice(bytes: &[u8]) -> AppResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| AppError::BadRequest(format!("malformed JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> AppResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// The `id` IRI, if present and parseable.
    #[must_use]
    pub fn id(&self) -> Option<Url> {
        self.0
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Url::parse(s).ok())
    }

    pub fn set_id(&mut self, id: &Url) {
        self.set("id", id.as_str());
    }

    /// The id, or a bad-request error naming what was expected.
    pub fn require_id(&self, what: &str) -> AppResult<Url> {
        self.id()
            .ok_or_else(|| AppError::BadRequest(format!("{what} has no id")))
    }

    /// All type names; `type` may be a string or an array.
    #[must_use]
    pub fn type_names(&self) -> Vec<&str> {
        match self.0.get("type") {
            Some(Value::String(s)) => vec![s.as_str()],
            Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// The first type name.
    #[must_use]
    pub fn type_name(&self) -> Option<&str> {
        self.type_names().into_iter().next()
    }

    #[must_use]
    pub fn is_type(&self, name: &str) -> bool {
        self.type_names().contains(&name)
    }

    /// Whether this value should be handled as an activity.
    ///
    /// Known ActivityStreams activity types are activities and known object
    /// types are not. Unrecognised extension types count as activities when
    /// they carry an `actor`.
    #[must_use]
    pub fn is_activity(&self) -> bool {
        let names = self.type_names();
        if names.iter().any(|n| ACTIVITY_TYPES.contains(n)) {
            return true;
        }
        if names.is_empty() || names.iter().any(|n| OBJECT_TYPES.contains(n)) {
            return false;
        }
        self.contains("actor")
    }

    /// The dispatch kind of an activity, preferring a wrapped verb.
    #[must_use]
    pub fn activity_kind(&self) -> Option<ActivityKind> {
        if !self.is_activity() {
            return None;
        }
        let names = self.type_names();
        names
            .iter()
            .map(|n| ActivityKind::parse(n))
            .find(ActivityKind::is_wrapped)
            .or_else(|| names.first().map(|n| ActivityKind::parse(n)))
    }

    /// Every value of `key`, accepting a single value or an array.
    #[must_use]
    pub fn values(&self, key: &str) -> Vec<Property> {
        match self.0.get(key) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(values)) => values.iter().filter_map(Property::from_value).collect(),
            Some(value) => Property::from_value(value).into_iter().collect(),
        }
    }

    /// The IRIs behind `key`, skipping values without an id.
    #[must_use]
    pub fn ids(&self, key: &str) -> Vec<Url> {
        self.values(key).iter().filter_map(Property::id).collect()
    }

    /// Replace `key` with the given values. A single value is written bare.
    pub fn set_values(&mut self, key: &str, values: &[Property]) {
        match values {
            [] => {
                self.0.remove(key);
            }
            [single] => self.set(key, single.to_value()),
            many => self.set(key, Value::Array(many.iter().map(Property::to_value).collect())),
        }
    }

    pub fn set_iris(&mut self, key: &str, iris: &[Url]) {
        let values: Vec<Property> = iris.iter().cloned().map(Property::Iri).collect();
        self.set_values(key, &values);
    }

    #[must_use]
    pub fn is_collection(&self) -> bool {
        self.type_names().iter().any(|n| {
            matches!(
                *n,
                "Collection" | "CollectionPage" | "OrderedCollection" | "OrderedCollectionPage"
            )
        })
    }

    #[must_use]
    pub fn is_ordered_collection(&self) -> bool {
        self.type_names()
            .iter()
            .any(|n| matches!(*n, "OrderedCollection" | "OrderedCollectionPage"))
    }

    const fn items_key(ordered: bool) -> &'static str {
        if ordered { "orderedItems" } else { "items" }
    }

    /// Collection members from `orderedItems` or `items`.
    #[must_use]
    pub fn items(&self) -> Vec<Property> {
        self.values(Self::items_key(self.is_ordered_collection()))
    }

    fn set_items(&mut self, items: &[Property]) {
        let key = Self::items_key(self.is_ordered_collection());
        self.set(key, Value::Array(items.iter().map(Property::to_value).collect()));
        if self.contains("totalItems") {
            self.set("totalItems", items.len());
        }
    }

    /// Put `item` at the front of the collection.
    pub fn prepend_item(&mut self, item: Property) {
        let mut items = vec![item];
        items.extend(self.items());
        self.set_items(&items);
    }

    /// Put `item` at the end of the collection.
    pub fn append_item(&mut self, item: Property) {
        let mut items = self.items();
        items.push(item);
        self.set_items(&items);
    }

    /// Whether a member is identified by `iri`.
    #[must_use]
    pub fn contains_item(&self, iri: &Url) -> bool {
        self.items().iter().any(|item| item.id().as_ref() == Some(iri))
    }

    /// Drop every member identified by `iri`. Returns whether any was removed.
    pub fn remove_item(&mut self, iri: &Url) -> bool {
        let items = self.items();
        let before = items.len();
        let kept: Vec<Property> = items
            .into_iter()
            .filter(|item| item.id().as_ref() != Some(iri))
            .collect();
        let removed = kept.len() != before;
        if removed {
            self.set_items(&kept);
        }
        removed
    }

    /// Keep the first occurrence of every member IRI, in order.
    pub fn dedupe_items(&mut self) {
        let mut seen = HashSet::new();
        let items: Vec<Property> = self
            .items()
            .into_iter()
            .filter(|item| match item.id() {
                Some(id) => seen.insert(id.to_string()),
                None => true,
            })
            .collect();
        if self.contains(Self::items_key(self.is_ordered_collection())) {
            self.set_items(&items);
        }
    }

    /// Remove `bto` and `bcc` here and on every embedded `object`.
    pub fn strip_hidden_recipients(&mut self) {
        strip_hidden(&mut self.0);
    }
}

fn strip_hidden(map: &mut Map<String, Value>) {
    map.remove("bto");
    map.remove("bcc");
    match map.get_mut("object") {
        Some(Value::Object(inner)) => strip_hidden(inner),
        Some(Value::Array(values)) => {
            for value in values {
                if let Value::Object(inner) = value {
                    strip_hidden(inner);
                }
            }
        }
        _ => {}
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
