//! Index definitions as far as scheduling cares about them.

use serde::{Deserialize, Serialize};

use super::event::FieldPath;
use super::generation::IndexId;

/// One field of a vector index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VectorField {
    /// Text field embedded by the server with `model`.
    AutoEmbed { path: FieldPath, model: String },
    /// Field that already holds vectors.
    Vector { path: FieldPath, dimensions: usize },
    Filter { path: FieldPath },
}

impl VectorField {
    pub fn path(&self) -> &FieldPath {
        match self {
            VectorField::AutoEmbed { path, .. }
            | VectorField::Vector { path, .. }
            | VectorField::Filter { path } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorIndexDefinition {
    pub index_id: IndexId,
    pub name: String,
    pub fields: Vec<VectorField>,
    /// Embedded documents are written to a materialized view collection
    /// instead of being attached to the indexed events.
    #[serde(default)]
    pub materialized_view: bool,
}

impl VectorIndexDefinition {
    /// `(path, model)` of every auto-embed field, in definition order.
    pub fn auto_embed_fields(&self) -> impl Iterator<Item = (&FieldPath, &str)> {
        self.fields.iter().filter_map(|field| match field {
            VectorField::AutoEmbed { path, model } => Some((path, model.as_str())),
            _ => None,
        })
    }

    pub fn has_auto_embed_fields(&self) -> bool {
        self.auto_embed_fields().next().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum IndexDefinition {
    Search { index_id: IndexId, name: String },
    Vector(VectorIndexDefinition),
}

/// How batches of an index are indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexingFlavour {
    Plain,
    AutoEmbedding,
    AutoEmbeddingMaterializedView,
}

impl IndexDefinition {
    pub fn index_id(&self) -> IndexId {
        match self {
            IndexDefinition::Search { index_id, .. } => *index_id,
            IndexDefinition::Vector(vector) => vector.index_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            IndexDefinition::Search { name, .. } => name,
            IndexDefinition::Vector(vector) => &vector.name,
        }
    }

    pub fn as_vector(&self) -> Option<&VectorIndexDefinition> {
        match self {
            IndexDefinition::Vector(vector) => Some(vector),
            IndexDefinition::Search { .. } => None,
        }
    }

    pub fn flavour(&self) -> IndexingFlavour {
        match self.as_vector() {
            Some(vector) if vector.has_auto_embed_fields() && vector.materialized_view => {
                IndexingFlavour::AutoEmbeddingMaterializedView
            }
            Some(vector) if vector.has_auto_embed_fields() => IndexingFlavour::AutoEmbedding,
            _ => IndexingFlavour::Plain,
        }
    }
}
