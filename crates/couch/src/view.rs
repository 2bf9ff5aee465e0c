//! Declarative view specifications and their compiler.
//!
//! A [`ViewSpec`] states *what* a view emits: a structured body over one input document, the
//! document types it applies to, an optional reduction and a soft-delete policy. Compiling it
//! yields a [`CompiledView`] that carries both the JavaScript map function installed in the
//! store and a native evaluator with identical semantics.
//!
//! ## Guard order
//!
//! The compiler, not the view author, wraps the body:
//!
//! ```text
//! if (!doc.deleted) {                                   // soft-delete guard
//!   if (doc.document_type && (doc.document_type === ...)) {   // type guard
//!     <body>
//!   }
//! }
//! ```
//!
//! A deleted document is therefore rejected before type or emission logic runs.

use crate::javascript;
use crate::store::{RawDocument, ID_KEY};
use serde_json::{Map, Value};

/// Field marking a document as soft-deleted.
pub const DELETED_FIELD: &str = "deleted";
/// Field carrying the document type discriminator.
pub const DOCUMENT_TYPE_FIELD: &str = "document_type";

fn split_path(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

/// Value expression evaluated against the input document.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// The document id.
    Id,
    /// The whole document.
    Doc,
    /// Current element of an [`MapBody::EmitEach`] list.
    Item,
    /// Nested field; missing segments evaluate to `null`.
    Field(Vec<String>),
    Literal(Value),
    Array(Vec<Expr>),
}

impl Expr {
    /// Field expression from a dotted path such as `"filemaker_record.Jahr"`.
    pub fn field(path: &str) -> Self {
        Expr::Field(split_path(path))
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    fn eval(&self, doc: &RawDocument, item: Option<&Value>) -> Value {
        match self {
            Expr::Id => doc.get(ID_KEY).cloned().unwrap_or(Value::Null),
            Expr::Doc => Value::Object(doc.clone()),
            Expr::Item => item.cloned().unwrap_or(Value::Null),
            Expr::Field(segments) => lookup(doc, segments).cloned().unwrap_or(Value::Null),
            Expr::Literal(value) => value.clone(),
            Expr::Array(items) => Value::Array(items.iter().map(|e| e.eval(doc, item)).collect()),
        }
    }
}

fn lookup<'a>(doc: &'a RawDocument, segments: &[String]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    let mut current = doc.get(first)?;
    for segment in rest {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Predicate over the input document.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// Field is present and not `null`.
    Exists(Vec<String>),
    /// Field is a list of exactly `n` elements.
    ListLenEq(Vec<String>, usize),
    /// Field is a list of at least `n` elements.
    ListLenAtLeast(Vec<String>, usize),
    /// Field equals one of the listed values.
    OneOf(Vec<String>, Vec<Value>),
    All(Vec<Condition>),
}

impl Condition {
    pub fn exists(path: &str) -> Self {
        Condition::Exists(split_path(path))
    }

    pub fn list_len_eq(path: &str, n: usize) -> Self {
        Condition::ListLenEq(split_path(path), n)
    }

    pub fn list_len_at_least(path: &str, n: usize) -> Self {
        Condition::ListLenAtLeast(split_path(path), n)
    }

    pub fn one_of<I, V>(path: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Condition::OneOf(split_path(path), values.into_iter().map(Into::into).collect())
    }

    fn holds(&self, doc: &RawDocument) -> bool {
        match self {
            Condition::Exists(segments) => {
                matches!(lookup(doc, segments), Some(v) if !v.is_null())
            }
            Condition::ListLenEq(segments, n) => {
                matches!(lookup(doc, segments), Some(Value::Array(items)) if items.len() == *n)
            }
            Condition::ListLenAtLeast(segments, n) => {
                matches!(lookup(doc, segments), Some(Value::Array(items)) if items.len() >= *n)
            }
            Condition::OneOf(segments, values) => match lookup(doc, segments) {
                Some(v) if !v.is_null() => values.contains(v),
                _ => false,
            },
            Condition::All(conditions) => conditions.iter().all(|c| c.holds(doc)),
        }
    }
}

/// Structured body of a map function.
#[derive(Clone, Debug, PartialEq)]
pub enum MapBody {
    Emit {
        key: Expr,
        value: Expr,
    },
    /// One emission per element of a list field; `Expr::Item` names the element.
    EmitEach {
        list: Vec<String>,
        key: Expr,
        value: Expr,
    },
    When {
        condition: Condition,
        then: Box<MapBody>,
    },
    /// Per-type branches, for views spanning several document shapes.
    ByType(Vec<(String, MapBody)>),
    Sequence(Vec<MapBody>),
}

impl MapBody {
    pub fn emit(key: Expr, value: Expr) -> Self {
        MapBody::Emit { key, value }
    }

    pub fn emit_each(list: &str, key: Expr, value: Expr) -> Self {
        MapBody::EmitEach {
            list: split_path(list),
            key,
            value,
        }
    }

    pub fn when(condition: Condition, then: MapBody) -> Self {
        MapBody::When {
            condition,
            then: Box::new(then),
        }
    }

    fn run(&self, doc: &RawDocument, out: &mut Vec<(Value, Value)>) {
        match self {
            MapBody::Emit { key, value } => out.push((key.eval(doc, None), value.eval(doc, None))),
            MapBody::EmitEach { list, key, value } => {
                if let Some(Value::Array(items)) = lookup(doc, list) {
                    for item in items {
                        out.push((key.eval(doc, Some(item)), value.eval(doc, Some(item))));
                    }
                }
            }
            MapBody::When { condition, then } => {
                if condition.holds(doc) {
                    then.run(doc, out);
                }
            }
            MapBody::ByType(branches) => {
                let doc_type = doc.get(DOCUMENT_TYPE_FIELD).and_then(Value::as_str);
                for (branch_type, branch) in branches {
                    if doc_type == Some(branch_type.as_str()) {
                        branch.run(doc, out);
                    }
                }
            }
            MapBody::Sequence(items) => {
                for item in items {
                    item.run(doc, out);
                }
            }
        }
    }
}

/// Reduction applied over emitted values.
///
/// Every variant is associative: reducing partial batches and then rereducing the partial
/// results gives the same answer as reducing everything at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reduce {
    /// Store built-in `_count`.
    Count,
    /// Store built-in `_sum`.
    Sum,
    /// JavaScript `sum(values)` reduce, valid for both reduce and rereduce passes.
    ScriptSum,
}

impl Reduce {
    /// Source installed in the design document.
    pub fn source(&self) -> String {
        match self {
            Reduce::Count => "_count".to_string(),
            Reduce::Sum => "_sum".to_string(),
            Reduce::ScriptSum => javascript::SUM_REDUCE.to_string(),
        }
    }

    /// First-level reduce over emitted values.
    pub fn reduce(&self, values: &[Value]) -> Value {
        match self {
            Reduce::Count => Value::from(values.len() as u64),
            Reduce::Sum | Reduce::ScriptSum => sum(values),
        }
    }

    /// Combines results of earlier [`reduce`](Self::reduce) or `rereduce` calls.
    pub fn rereduce(&self, partials: &[Value]) -> Value {
        sum(partials)
    }
}

/// Integer sum while every value is an integer and the total fits, float sum otherwise.
fn sum(values: &[Value]) -> Value {
    let exact = values
        .iter()
        .try_fold(0i64, |total, v| v.as_i64().and_then(|n| total.checked_add(n)));
    match exact {
        Some(total) => Value::from(total),
        None => Value::from(values.iter().filter_map(Value::as_f64).sum::<f64>()),
    }
}

/// Whether soft-deleted documents reach the view body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeletePolicy {
    #[default]
    ExcludeDeleted,
    IncludeDeleted,
}

/// Declarative description of one view.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSpec {
    name: String,
    body: MapBody,
    doc_types: Option<Vec<String>>,
    reduce: Option<Reduce>,
    deleted: DeletePolicy,
}

impl ViewSpec {
    /// A view applying to every document type, excluding deleted documents, without reduce.
    pub fn new(name: impl Into<String>, body: MapBody) -> Self {
        Self {
            name: name.into(),
            body,
            doc_types: None,
            reduce: None,
            deleted: DeletePolicy::default(),
        }
    }

    /// Restrict the view to the listed document types (logical OR).
    pub fn for_types<I, S>(mut self, doc_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.doc_types = Some(doc_types.into_iter().map(Into::into).collect());
        self
    }

    pub fn reduce(mut self, reduce: Reduce) -> Self {
        self.reduce = Some(reduce);
        self
    }

    /// Opt out of the soft-delete guard.
    pub fn include_deleted(mut self) -> Self {
        self.deleted = DeletePolicy::IncludeDeleted;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wraps the body in its guards and renders the map function.
    pub fn compile(&self) -> CompiledView {
        let mut source = javascript::body(&self.body);
        if let Some(doc_types) = &self.doc_types {
            source = javascript::if_block(&javascript::type_guard(doc_types), &source);
        }
        if self.deleted == DeletePolicy::ExcludeDeleted {
            source = javascript::if_block(javascript::DELETE_GUARD, &source);
        }

        CompiledView {
            name: self.name.clone(),
            map_source: javascript::map_function(&source),
            spec: self.clone(),
        }
    }
}

/// Executable form of a [`ViewSpec`].
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledView {
    name: String,
    map_source: String,
    spec: ViewSpec,
}

impl CompiledView {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// JavaScript map function installed in the store.
    pub fn map_source(&self) -> &str {
        &self.map_source
    }

    pub fn reducer(&self) -> Option<Reduce> {
        self.spec.reduce
    }

    /// `{"map": ..., "reduce": ...}` entry of a design document.
    pub fn functions(&self) -> Map<String, Value> {
        let mut functions = Map::new();
        functions.insert("map".into(), Value::String(self.map_source.clone()));
        if let Some(reduce) = self.spec.reduce {
            functions.insert("reduce".into(), Value::String(reduce.source()));
        }
        functions
    }

    /// Runs the guarded map function natively over one document.
    pub fn map(&self, doc: &RawDocument) -> Vec<(Value, Value)> {
        let mut out = Vec::new();

        if self.spec.deleted == DeletePolicy::ExcludeDeleted && is_truthy(doc.get(DELETED_FIELD))
        {
            return out;
        }

        if let Some(doc_types) = &self.spec.doc_types {
            match doc.get(DOCUMENT_TYPE_FIELD).and_then(Value::as_str) {
                Some(t) if doc_types.iter().any(|allowed| allowed == t) => {}
                _ => return out,
            }
        }

        self.spec.body.run(doc, &mut out);
        out
    }
}

/// JavaScript truthiness of an optional JSON value.
fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}
