//! Design documents and the code-declared definitions that feed them.
//!
//! A [`DesignDocument`] models the stored `_design/*` shape with every
//! category keyed by name; keys the client does not understand are
//! preserved verbatim through the flattened remainder, so reconciling
//! never clobbers unrelated state. [`merge`](crate::design::merge::merge)
//! combines a stored document with a generated candidate; the
//! [`reconciler`] drives GET/merge/PUT.

pub mod merge;
pub mod reconciler;

pub use reconciler::{reconcile, reconcile_mango_indexes, ReconcileOptions, ReconcileOutcome};

use crate::error::{CouchError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Prefix marking a function source that must be loaded through the
/// caller's [`SourceProvider`].
pub const CLASSPATH_PREFIX: &str = "classpath:";

/// A stored design document.
///
/// View payloads stay raw [`Value`]s: JavaScript views carry
/// `{map, reduce?}` while `language: "query"` index documents carry the
/// Mango field-map shape, and the merge treats both uniformly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesignDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub views: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shows: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub updates: BTreeMap<String, String>,
    /// Everything else the server stores on the document.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

fn default_language() -> String {
    "javascript".to_string()
}

impl DesignDocument {
    pub fn new(id: impl Into<String>) -> Self {
        DesignDocument {
            id: id.into(),
            rev: None,
            language: default_language(),
            views: BTreeMap::new(),
            filters: BTreeMap::new(),
            shows: BTreeMap::new(),
            lists: BTreeMap::new(),
            updates: BTreeMap::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Supplies function sources referenced as `classpath:<path>` or loaded
/// from `file` payloads.
pub trait SourceProvider {
    fn load(&self, path: &str) -> Result<String>;
}

/// Resolve an inline-or-referenced source string.
fn resolve_source(source: &str, provider: &dyn SourceProvider) -> Result<String> {
    match source.strip_prefix(CLASSPATH_PREFIX) {
        Some(path) => provider.load(path),
        None => Ok(source.to_string()),
    }
}

/// Declaration of one map/reduce view.
#[derive(Debug, Clone, Default)]
pub struct ViewDef {
    pub name: String,
    pub map: Option<String>,
    pub reduce: Option<String>,
    /// Path to a JSON `{map, reduce}` payload, loaded via the provider.
    pub file: Option<String>,
}

impl ViewDef {
    pub fn new(name: impl Into<String>) -> Self {
        ViewDef {
            name: name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn map(mut self, map: impl Into<String>) -> Self {
        self.map = Some(map.into());
        self
    }

    #[must_use]
    pub fn reduce(mut self, reduce: impl Into<String>) -> Self {
        self.reduce = Some(reduce.into());
        self
    }

    #[must_use]
    pub fn file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    fn generate(&self, provider: &dyn SourceProvider) -> Result<Value> {
        if let Some(file) = &self.file {
            let payload = provider.load(file)?;
            let value: Value = serde_json::from_str(&payload)?;
            return Ok(value);
        }
        let map = self.map.as_deref().ok_or_else(|| {
            CouchError::Config(format!("view `{}` declares neither map nor file", self.name))
        })?;
        let mut view = serde_json::Map::new();
        view.insert(
            "map".to_string(),
            Value::String(resolve_source(map, provider)?),
        );
        if let Some(reduce) = &self.reduce {
            view.insert(
                "reduce".to_string(),
                Value::String(resolve_source(reduce, provider)?),
            );
        }
        Ok(Value::Object(view))
    }
}

/// Declaration of a filter, show, list, or update handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerDef {
    pub name: String,
    pub function: Option<String>,
    pub file: Option<String>,
}

impl HandlerDef {
    pub fn new(name: impl Into<String>) -> Self {
        HandlerDef {
            name: name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    #[must_use]
    pub fn file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    fn generate(&self, provider: &dyn SourceProvider) -> Result<String> {
        if let Some(file) = &self.file {
            return provider.load(file);
        }
        let function = self.function.as_deref().ok_or_else(|| {
            CouchError::Config(format!(
                "handler `{}` declares neither function nor file",
                self.name
            ))
        })?;
        resolve_source(function, provider)
    }
}

/// Declaration of one Mango index.
#[derive(Debug, Clone)]
pub struct MangoIndexDef {
    pub name: String,
    pub fields: Vec<String>,
}

impl MangoIndexDef {
    pub fn new(name: impl Into<String>, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        MangoIndexDef {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// The `language: "query"` view payload for this index.
    fn generate(&self) -> Value {
        let field_map: serde_json::Map<String, Value> = self
            .fields
            .iter()
            .map(|f| (f.clone(), Value::String("asc".to_string())))
            .collect();
        serde_json::json!({
            "map": {
                "fields": field_map,
                "partial_filter_selector": {}
            },
            "reduce": "_count",
            "options": {"def": {"fields": &self.fields}}
        })
    }
}

/// The full declaration set for one document type.
#[derive(Debug, Clone, Default)]
pub struct DesignMapping {
    /// Target design document id, e.g. `_design/Order`.
    pub design_id: String,
    pub views: Vec<ViewDef>,
    pub filters: Vec<HandlerDef>,
    pub shows: Vec<HandlerDef>,
    pub lists: Vec<HandlerDef>,
    pub updates: Vec<HandlerDef>,
}

impl DesignMapping {
    pub fn new(design_id: impl Into<String>) -> Self {
        DesignMapping {
            design_id: design_id.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn view(mut self, view: ViewDef) -> Self {
        self.views.push(view);
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: HandlerDef) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn show(mut self, show: HandlerDef) -> Self {
        self.shows.push(show);
        self
    }

    #[must_use]
    pub fn list(mut self, list: HandlerDef) -> Self {
        self.lists.push(list);
        self
    }

    #[must_use]
    pub fn update_handler(mut self, update: HandlerDef) -> Self {
        self.updates.push(update);
        self
    }

    /// Generate the candidate design document from the declarations.
    pub fn generate(&self, provider: &dyn SourceProvider) -> Result<DesignDocument> {
        let mut doc = DesignDocument::new(self.design_id.clone());
        for view in &self.views {
            doc.views.insert(view.name.clone(), view.generate(provider)?);
        }
        for filter in &self.filters {
            doc.filters
                .insert(filter.name.clone(), filter.generate(provider)?);
        }
        for show in &self.shows {
            doc.shows.insert(show.name.clone(), show.generate(provider)?);
        }
        for list in &self.lists {
            doc.lists.insert(list.name.clone(), list.generate(provider)?);
        }
        for update in &self.updates {
            doc.updates
                .insert(update.name.clone(), update.generate(provider)?);
        }
        Ok(doc)
    }
}

/// Mango index design document for a type: `_design/<Type>_mango` with
/// `language: "query"` and one view per declared index.
pub fn mango_index_document(type_name: &str, indexes: &[MangoIndexDef]) -> DesignDocument {
    let mut doc = DesignDocument::new(format!("_design/{type_name}_mango"));
    doc.language = "query".to_string();
    for index in indexes {
        doc.views.insert(index.name.clone(), index.generate());
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapProvider(BTreeMap<String, String>);

    impl SourceProvider for MapProvider {
        fn load(&self, path: &str) -> Result<String> {
            self.0
                .get(path)
                .cloned()
                .ok_or_else(|| CouchError::Config(format!("no resource `{path}`")))
        }
    }

    fn provider() -> MapProvider {
        let mut map = BTreeMap::new();
        map.insert(
            "views/all.js".to_string(),
            "function(doc) { emit(doc._id, null); }".to_string(),
        );
        map.insert(
            "views/stats.json".to_string(),
            r#"{"map": "function(doc) { emit(doc.code, 1); }", "reduce": "_sum"}"#.to_string(),
        );
        MapProvider(map)
    }

    #[test]
    fn test_inline_view_generation() {
        let view = ViewDef::new("all").map("function(doc) { emit(null, null); }");
        let value = view.generate(&provider()).unwrap();
        assert_eq!(
            value["map"],
            Value::String("function(doc) { emit(null, null); }".into())
        );
        assert!(value.get("reduce").is_none());
    }

    #[test]
    fn test_classpath_resolution() {
        let view = ViewDef::new("all").map("classpath:views/all.js");
        let value = view.generate(&provider()).unwrap();
        assert_eq!(
            value["map"],
            Value::String("function(doc) { emit(doc._id, null); }".into())
        );
    }

    #[test]
    fn test_file_payload() {
        let view = ViewDef::new("stats").file("views/stats.json");
        let value = view.generate(&provider()).unwrap();
        assert_eq!(value["reduce"], Value::String("_sum".into()));
    }

    #[test]
    fn test_missing_resource_is_an_error() {
        let view = ViewDef::new("all").map("classpath:nope.js");
        assert!(view.generate(&provider()).is_err());
    }

    #[test]
    fn test_view_without_map_or_file_is_an_error() {
        assert!(ViewDef::new("broken").generate(&provider()).is_err());
    }

    #[test]
    fn test_mapping_generation() {
        let mapping = DesignMapping::new("_design/Order")
            .view(ViewDef::new("all").map("classpath:views/all.js"))
            .filter(HandlerDef::new("mine").function("function(doc, req) { return true; }"));
        let doc = mapping.generate(&provider()).unwrap();
        assert_eq!(doc.id, "_design/Order");
        assert_eq!(doc.language, "javascript");
        assert!(doc.views.contains_key("all"));
        assert!(doc.filters.contains_key("mine"));
    }

    #[test]
    fn test_design_doc_preserves_unknown_keys() {
        let raw = serde_json::json!({
            "_id": "_design/Order",
            "_rev": "3-x",
            "language": "javascript",
            "views": {"all": {"map": "..."}},
            "validate_doc_update": "function(n, o) {}",
            "options": {"partitioned": false}
        });
        let doc: DesignDocument = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(doc.extra.len(), 2);
        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn test_mango_index_document_shape() {
        let doc = mango_index_document(
            "Order",
            &[MangoIndexDef::new("by_code", vec!["code", "version"])],
        );
        assert_eq!(doc.id, "_design/Order_mango");
        assert_eq!(doc.language, "query");
        let view = &doc.views["by_code"];
        assert_eq!(view["map"]["fields"]["code"], Value::String("asc".into()));
        assert_eq!(
            view["options"]["def"]["fields"],
            serde_json::json!(["code", "version"])
        );
    }
}
