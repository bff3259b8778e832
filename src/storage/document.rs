//! Document representation
//!
//! Documents follow JSON:API: a primary `data` resource with `type`, `id`,
//! `attributes`, `relationships` and `meta`, plus optional `included`
//! resources. A `PendingChange` pairs the before/after states of a write.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// A JSON:API resource object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub relationships: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

/// Which part of a resource a field lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// `type` and `id`
    TopLevel,
    Attributes,
    Relationships,
}

impl Section {
    /// JSON pointer to a field in this section of the primary resource
    pub fn pointer(self, field: &str) -> String {
        match self {
            Section::TopLevel => format!("/data/{}", field),
            Section::Attributes => format!("/data/attributes/{}", field),
            Section::Relationships => format!("/data/relationships/{}", field),
        }
    }
}

/// A `(type, id)` reference to a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl DocRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Read a `{type, id}` resource identifier
    pub fn from_identifier(value: &Value) -> Option<Self> {
        let kind = value.get("type")?.as_str()?;
        let id = value.get("id")?.as_str()?;
        Some(Self::new(kind, id))
    }

    /// Parse the `type/id` form stored in the `refs` column
    pub fn parse(key: &str) -> Option<Self> {
        let (kind, id) = key.split_once('/')?;
        Some(Self::new(kind, id))
    }

    pub fn to_identifier(&self) -> Value {
        serde_json::json!({ "type": self.kind, "id": self.id })
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

impl Resource {
    /// Create a new resource of the given type
    pub fn new(kind: impl Into<String>, id: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            id,
            attributes: Map::new(),
            relationships: Map::new(),
            meta: None,
        }
    }

    /// Builder: set an attribute
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Builder: set a relationship's `data`
    pub fn with_relationship(mut self, name: impl Into<String>, data: Value) -> Self {
        self.set_relationship_data(name, data);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: Value) {
        self.attributes.insert(name.into(), value);
    }

    /// The `data` member of a relationship, if the relationship is present
    pub fn relationship_data(&self, name: &str) -> Option<&Value> {
        self.relationships.get(name).and_then(|rel| rel.get("data"))
    }

    pub fn set_relationship_data(&mut self, name: impl Into<String>, data: Value) {
        self.relationships
            .insert(name.into(), serde_json::json!({ "data": data }));
    }

    /// The resources a relationship points at
    pub fn related(&self, name: &str) -> Vec<DocRef> {
        identifiers(self.relationship_data(name))
    }

    /// Every resource this one points at, across all relationships
    pub fn all_related(&self) -> Vec<DocRef> {
        let mut refs: Vec<DocRef> = self
            .relationships
            .values()
            .flat_map(|rel| identifiers(rel.get("data")))
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }

    pub fn doc_ref(&self) -> Option<DocRef> {
        self.id.as_ref().map(|id| DocRef::new(&self.kind, id))
    }

    /// `meta.version`, used for optimistic concurrency by writers
    pub fn version(&self) -> Option<&Value> {
        self.meta.as_ref().and_then(|m| m.get("version"))
    }
}

/// Identifiers found in a relationship's `data` (single, many or null)
pub fn identifiers(data: Option<&Value>) -> Vec<DocRef> {
    match data {
        Some(Value::Array(items)) => items.iter().filter_map(DocRef::from_identifier).collect(),
        Some(value @ Value::Object(_)) => DocRef::from_identifier(value).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// A full JSON:API document: primary resource plus included resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentContext {
    pub data: Resource,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<Resource>,
}

impl DocumentContext {
    pub fn new(data: Resource) -> Self {
        Self {
            data,
            included: Vec::new(),
        }
    }

    pub fn with_included(mut self, included: Vec<Resource>) -> Self {
        self.included = included;
        self
    }

    /// Find an included resource by reference
    pub fn included_resource(&self, target: &DocRef) -> Option<&Resource> {
        self.included
            .iter()
            .find(|r| r.kind == target.kind && r.id.as_deref() == Some(target.id.as_str()))
    }
}

/// The before/after states of one write
#[derive(Debug, Clone, Default)]
pub struct PendingChange {
    /// State before the write (None on create)
    pub original_document: Option<Resource>,
    /// State after the write (None on delete)
    pub final_document: Option<Resource>,
    /// Resources included alongside the original
    pub original_included: Vec<Resource>,
    /// Resources included alongside the final state
    pub final_included: Vec<Resource>,
    /// Values the engine itself injected (defaults), by field name
    pub server_provided_values: HashMap<String, Value>,
}

/// Which state of a pending change to read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Original,
    Final,
}

impl PendingChange {
    pub fn create(final_document: Resource) -> Self {
        Self {
            final_document: Some(final_document),
            ..Default::default()
        }
    }

    pub fn update(original_document: Resource, final_document: Resource) -> Self {
        Self {
            original_document: Some(original_document),
            final_document: Some(final_document),
            ..Default::default()
        }
    }

    pub fn delete(original_document: Resource) -> Self {
        Self {
            original_document: Some(original_document),
            ..Default::default()
        }
    }

    pub fn with_final_included(mut self, included: Vec<Resource>) -> Self {
        self.final_included = included;
        self
    }

    pub fn with_original_included(mut self, included: Vec<Resource>) -> Self {
        self.original_included = included;
        self
    }

    pub fn is_create(&self) -> bool {
        self.original_document.is_none() && self.final_document.is_some()
    }

    pub fn is_delete(&self) -> bool {
        self.final_document.is_none()
    }

    /// The content type this change is about
    pub fn kind(&self) -> Option<&str> {
        self.final_document
            .as_ref()
            .or(self.original_document.as_ref())
            .map(|r| r.kind.as_str())
    }

    pub fn document(&self, side: Side) -> Option<&Resource> {
        match side {
            Side::Original => self.original_document.as_ref(),
            Side::Final => self.final_document.as_ref(),
        }
    }

    pub fn original_document_context(&self) -> Option<DocumentContext> {
        self.original_document.clone().map(|data| {
            DocumentContext::new(data).with_included(self.original_included.clone())
        })
    }

    pub fn final_document_context(&self) -> Option<DocumentContext> {
        self.final_document
            .clone()
            .map(|data| DocumentContext::new(data).with_included(self.final_included.clone()))
    }
}
