//! Design documents: named bundles of views installed as one unit.

use crate::store::{RawDocument, ID_KEY, REV_KEY};
use crate::view::{CompiledView, ViewSpec};
use ngs_types::DocId;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const LANGUAGE: &str = "javascript";

/// A subject area's views, keyed by view name.
///
/// Serialisation is a pure function of the contents: views are emitted in name order and every
/// object is built in sorted key order, so re-serialising an unchanged bundle is byte-identical.
#[derive(Clone, Debug, PartialEq)]
pub struct DesignDocument {
    name: String,
    views: BTreeMap<String, CompiledView>,
}

impl DesignDocument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            views: BTreeMap::new(),
        }
    }

    /// Compiles and adds a view. A later view with the same name replaces the earlier one.
    pub fn with_view(mut self, spec: ViewSpec) -> Self {
        self.add_view(spec);
        self
    }

    pub fn add_view(&mut self, spec: ViewSpec) {
        let compiled = spec.compile();
        self.views.insert(compiled.name().to_string(), compiled);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `_design/<name>`.
    pub fn id(&self) -> DocId {
        DocId::design(&self.name)
    }

    pub fn view(&self, name: &str) -> Option<&CompiledView> {
        self.views.get(name)
    }

    pub fn views(&self) -> impl Iterator<Item = &CompiledView> {
        self.views.values()
    }

    fn views_value(&self) -> Value {
        let mut views = Map::new();
        for (name, view) in &self.views {
            let functions: BTreeMap<String, Value> = view.functions().into_iter().collect();
            views.insert(name.clone(), Value::Object(functions.into_iter().collect()));
        }
        Value::Object(views)
    }

    /// Store-native form, without `_rev`.
    pub fn to_serializable_form(&self) -> RawDocument {
        let mut doc = Map::new();
        doc.insert(ID_KEY.into(), Value::String(self.id().into_string()));
        doc.insert("language".into(), Value::String(LANGUAGE.into()));
        doc.insert("views".into(), self.views_value());
        doc
    }

    /// Canonical JSON text of [`to_serializable_form`](Self::to_serializable_form).
    pub fn to_json_string(&self) -> String {
        Value::Object(self.to_serializable_form()).to_string()
    }

    /// True if the stored design document already carries exactly these view definitions.
    ///
    /// `_rev` and any store-added bookkeeping fields are ignored.
    pub fn matches_stored(&self, stored: &RawDocument) -> bool {
        stored.get("language").and_then(Value::as_str) == Some(LANGUAGE)
            && stored.get("views") == Some(&self.views_value())
    }

    /// Store-native form carrying the revision of the copy it replaces.
    pub fn to_update(&self, current_rev: Option<&str>) -> RawDocument {
        let mut doc = self.to_serializable_form();
        if let Some(rev) = current_rev {
            doc.insert(REV_KEY.into(), Value::String(rev.to_string()));
        }
        doc
    }
}
