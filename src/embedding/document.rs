//! Reading auto-embed texts out of documents and writing embeddings back.

use std::collections::HashMap;

use serde_json::Value;

use crate::replication::{DocumentEvent, FieldPath, Vector};

const HASH_FIELD_SUFFIX: &str = "_hash";

/// An auto-embed field resolved against the model catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoEmbedField {
    pub path: FieldPath,
    /// Canonical name of the model embedding this field.
    pub model: String,
}

/// Embeddings of one batch, by model name and source text.
pub type ModelEmbeddings = HashMap<String, HashMap<String, Vector>>;

/// Whether the event carries a document whose texts must be embedded.
/// Deletes, document-less events and filter-only updates pass through as-is.
pub fn needs_embedding(event: &DocumentEvent) -> bool {
    event.has_valid_document() && !event.is_filter_only_update()
}

/// Distinct non-empty strings stored at `path`, in document order.
pub fn field_texts(document: &Value, path: &FieldPath) -> Vec<String> {
    let mut texts = path.collect_strings(document);
    texts.retain(|text| !text.is_empty());
    let mut seen = std::collections::HashSet::new();
    texts.retain(|text| seen.insert(text.clone()));
    texts
}

/// Content hash recorded next to a materialized embedding.
pub fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

pub fn hash_field_path(path: &FieldPath) -> FieldPath {
    FieldPath::new(format!("{}{}", path, HASH_FIELD_SUFFIX))
}

fn lookup<'a>(
    event: &'a DocumentEvent,
    embeddings: &'a ModelEmbeddings,
    field: &AutoEmbedField,
    text: &str,
) -> Option<&'a Vector> {
    embeddings
        .get(&field.model)
        .and_then(|by_text| by_text.get(text))
        .or_else(|| {
            event
                .auto_embeddings
                .get(&field.path)
                .and_then(|reusable| reusable.get(text))
        })
}

/// Copy of `event` carrying, per auto-embed field, the vector of every text
/// found in its document. Texts without an embedding are left out.
pub fn attach_embeddings(
    event: &DocumentEvent,
    fields: &[AutoEmbedField],
    embeddings: &ModelEmbeddings,
) -> DocumentEvent {
    let Some(document) = &event.document else {
        return event.clone();
    };

    let mut attached = HashMap::new();
    for field in fields {
        let texts = field_texts(document, &field.path);
        if texts.is_empty() {
            continue;
        }
        let vectors: HashMap<String, Vector> = texts
            .into_iter()
            .filter_map(|text| {
                let vector = lookup(event, embeddings, field, &text)?.clone();
                Some((text, vector))
            })
            .collect();
        attached.insert(field.path.clone(), vectors);
    }
    event.clone().with_auto_embeddings(attached)
}

/// Copy of `event` whose document has every auto-embed string replaced by its
/// vector, with the hash of the source text stored under `<field>_hash`.
/// Strings without an embedding, and non-string values of auto-embed fields,
/// are dropped.
pub fn materialize(
    event: &DocumentEvent,
    fields: &[AutoEmbedField],
    embeddings: &ModelEmbeddings,
) -> DocumentEvent {
    let Some(document) = &event.document else {
        return event.clone();
    };

    let mut rewritten = document.clone();
    for field in fields {
        let segments: Vec<&str> = field.path.segments().collect();
        let find = |text: &str| lookup(event, embeddings, field, text).cloned();
        replace_strings(&mut rewritten, &segments, &find);
    }

    let mut materialized = event.clone();
    materialized.document = Some(rewritten);
    materialized.auto_embeddings.clear();
    materialized
}

fn replace_strings(value: &mut Value, segments: &[&str], find: &dyn Fn(&str) -> Option<Vector>) {
    match value {
        Value::Array(items) => {
            for item in items {
                replace_strings(item, segments, find);
            }
        }
        Value::Object(map) => {
            let Some((head, rest)) = segments.split_first() else {
                return;
            };
            if !rest.is_empty() {
                if let Some(child) = map.get_mut(*head) {
                    replace_strings(child, rest, find);
                }
                return;
            }
            let Some(leaf) = map.remove(*head) else {
                return;
            };
            if let Some((vectors, hashes)) = embed_leaf(leaf, find) {
                map.insert(head.to_string(), vectors);
                map.insert(format!("{}{}", head, HASH_FIELD_SUFFIX), hashes);
            }
        }
        _ => {}
    }
}

fn embed_leaf(leaf: Value, find: &dyn Fn(&str) -> Option<Vector>) -> Option<(Value, Value)> {
    match leaf {
        Value::String(text) => {
            let vector = find(&text)?;
            Some((vector_value(&vector), Value::String(hash_text(&text))))
        }
        Value::Array(items) => {
            let (vectors, hashes): (Vec<Value>, Vec<Value>) = items
                .iter()
                .filter_map(|item| {
                    let text = item.as_str()?;
                    let vector = find(text)?;
                    Some((vector_value(&vector), Value::String(hash_text(text))))
                })
                .unzip();
            if vectors.is_empty() {
                None
            } else {
                Some((Value::Array(vectors), Value::Array(hashes)))
            }
        }
        _ => None,
    }
}

fn vector_value(vector: &[f32]) -> Value {
    Value::Array(vector.iter().map(|v| Value::from(f64::from(*v))).collect())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fields() -> Vec<AutoEmbedField> {
        vec![
            AutoEmbedField {
                path: FieldPath::new("title"),
                model: "voyage-3-large".into(),
            },
            AutoEmbedField {
                path: FieldPath::new("plot.summary"),
                model: "bge-small".into(),
            },
        ]
    }

    fn embeddings() -> ModelEmbeddings {
        let mut embeddings = ModelEmbeddings::new();
        embeddings
            .entry("voyage-3-large".into())
            .or_default()
            .insert("Alien".into(), vec![1.0, 2.0]);
        embeddings
            .entry("bge-small".into())
            .or_default()
            .insert("in space".into(), vec![0.5]);
        embeddings
    }

    #[test]
    fn test_field_texts_skip_empty_and_duplicates() {
        let doc = json!({ "tags": ["a", "", "b", "a"] });
        assert_eq!(field_texts(&doc, &FieldPath::new("tags")), vec!["a", "b"]);
    }

    #[test]
    fn test_needs_embedding() {
        assert!(needs_embedding(&DocumentEvent::insert(json!(1), json!({}))));
        assert!(!needs_embedding(&DocumentEvent::delete(json!(1))));
        assert!(!needs_embedding(&DocumentEvent::filter_only_update(
            json!(1),
            json!({ "year": 1979 }),
            json!({ "year": 1979 })
        )));
    }

    #[test]
    fn test_attach_embeddings_uses_reusable_vectors() {
        let mut reusable = HashMap::new();
        reusable.insert(
            FieldPath::new("plot.summary"),
            HashMap::from([("old text".to_string(), vec![9.0])]),
        );
        let event = DocumentEvent::insert(
            json!(1),
            json!({ "title": "Alien", "plot": { "summary": "old text" }, "year": 1979 }),
        )
        .with_auto_embeddings(reusable);

        let attached = attach_embeddings(&event, &fields(), &embeddings());
        assert_eq!(
            attached.auto_embeddings[&FieldPath::new("title")]["Alien"],
            vec![1.0, 2.0]
        );
        assert_eq!(
            attached.auto_embeddings[&FieldPath::new("plot.summary")]["old text"],
            vec![9.0]
        );
        assert_eq!(attached.document, event.document);
    }

    #[test]
    fn test_materialize_replaces_strings_and_records_hashes() {
        let event = DocumentEvent::insert(
            json!(1),
            json!({
                "title": "Alien",
                "plot": { "summary": "in space" },
                "year": 1979,
            }),
        );

        let materialized = materialize(&event, &fields(), &embeddings());
        let doc = materialized.document.unwrap();
        assert_eq!(doc["title"], json!([1.0, 2.0]));
        assert_eq!(doc["title_hash"], json!(hash_text("Alien")));
        assert_eq!(doc["plot"]["summary"], json!([0.5]));
        assert_eq!(doc["plot"]["summary_hash"], json!(hash_text("in space")));
        assert_eq!(doc["year"], json!(1979));
    }

    #[test]
    fn test_materialize_drops_unembedded_values() {
        let event = DocumentEvent::insert(
            json!(1),
            json!({ "title": ["Alien", "Unknown", 7], "plot": { "summary": 42 } }),
        );

        let doc = materialize(&event, &fields(), &embeddings()).document.unwrap();
        assert_eq!(doc["title"], json!([[1.0, 2.0]]));
        assert_eq!(doc["title_hash"], json!([hash_text("Alien")]));
        assert!(doc["plot"].get("summary").is_none());
        assert!(doc["plot"].get("summary_hash").is_none());
    }

    #[test]
    fn test_hash_field_path() {
        assert_eq!(
            hash_field_path(&FieldPath::new("plot.summary")).as_str(),
            "plot.summary_hash"
        );
        assert_eq!(hash_text("a"), hash_text("a"));
        assert_ne!(hash_text("a"), hash_text("b"));
    }
}
