//! Change events as they reach the scheduler: raw (pre-decoding) documents and
//! decoded document events.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;

pub type Vector = Vec<f32>;

/// Undecoded change-stream event as delivered by the wire client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument(Vec<u8>);

impl RawDocument {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_json(value: &Value) -> Self {
        Self(value.to_string().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parse_json(&self) -> serde_json::Result<Value> {
        serde_json::from_slice(&self.0)
    }
}

/// Dotted path into a document, e.g. `plot.summary`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldPath(SmolStr);

impl FieldPath {
    pub fn new(path: impl AsRef<str>) -> Self {
        Self(SmolStr::new(path.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Every string stored at this path. Arrays are flattened at any level.
    pub fn collect_strings(&self, document: &Value) -> Vec<String> {
        let mut out = Vec::new();
        let segments: Vec<&str> = self.segments().collect();
        collect_strings_at(document, &segments, &mut out);
        out
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn collect_strings_at(value: &Value, segments: &[&str], out: &mut Vec<String>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_strings_at(item, segments, out);
            }
        }
        Value::Object(map) => {
            if let Some((head, rest)) = segments.split_first() {
                if let Some(child) = map.get(*head) {
                    collect_strings_at(child, rest, out);
                }
            }
        }
        Value::String(s) if segments.is_empty() => out.push(s.clone()),
        _ => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Insert,
    Update,
    Replace,
    Delete,
}

/// A decoded, projected change to one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEvent {
    pub event_type: EventType,
    pub document_id: Value,
    /// Post-image of the document; absent for deletes and for updates whose
    /// post-image was not requested.
    pub document: Option<Value>,
    /// Set when an update only touched filter fields; consumers apply it as a
    /// partial update.
    #[serde(default)]
    pub filter_field_updates: Option<Value>,
    /// Embeddings already known for this document, per field and source text.
    #[serde(default)]
    pub auto_embeddings: HashMap<FieldPath, HashMap<String, Vector>>,
}

impl DocumentEvent {
    pub fn insert(document_id: Value, document: Value) -> Self {
        Self::with_document(EventType::Insert, document_id, document)
    }

    pub fn update(document_id: Value, document: Value) -> Self {
        Self::with_document(EventType::Update, document_id, document)
    }

    pub fn replace(document_id: Value, document: Value) -> Self {
        Self::with_document(EventType::Replace, document_id, document)
    }

    pub fn delete(document_id: Value) -> Self {
        Self {
            event_type: EventType::Delete,
            document_id,
            document: None,
            filter_field_updates: None,
            auto_embeddings: HashMap::new(),
        }
    }

    /// Update that only changed filter fields.
    pub fn filter_only_update(document_id: Value, document: Value, updates: Value) -> Self {
        Self {
            filter_field_updates: Some(updates),
            ..Self::update(document_id, document)
        }
    }

    fn with_document(event_type: EventType, document_id: Value, document: Value) -> Self {
        Self {
            event_type,
            document_id,
            document: Some(document),
            filter_field_updates: None,
            auto_embeddings: HashMap::new(),
        }
    }

    pub fn with_auto_embeddings(
        mut self,
        embeddings: HashMap<FieldPath, HashMap<String, Vector>>,
    ) -> Self {
        self.auto_embeddings = embeddings;
        self
    }

    /// Whether the event carries a document that can be indexed.
    pub fn has_valid_document(&self) -> bool {
        self.event_type != EventType::Delete && self.document.is_some()
    }

    pub fn is_filter_only_update(&self) -> bool {
        self.filter_field_updates.is_some()
    }
}
