//! Rendering of compiled views into CouchDB JavaScript source.
//!
//! Output is a pure function of the view structure: two-space indentation, one statement per
//! line, JSON-encoded literals.

use crate::view::{Condition, Expr, MapBody};
use serde_json::Value;

const INDENT: &str = "  ";

pub(crate) fn indent(body: &str) -> String {
    body.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{INDENT}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn if_block(head: &str, body: &str) -> String {
    format!("if ({head}) {{\n{}\n}}", indent(body))
}

pub(crate) fn map_function(body: &str) -> String {
    format!("function (doc) {{\n{}\n}}", indent(body))
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

pub(crate) fn literal(value: &Value) -> String {
    // serde_json output is valid JavaScript for every JSON value.
    value.to_string()
}

pub(crate) fn path(root: &str, segments: &[String]) -> String {
    let mut out = root.to_string();
    for segment in segments {
        if is_identifier(segment) {
            out.push('.');
            out.push_str(segment);
        } else {
            out.push('[');
            out.push_str(&literal(&Value::String(segment.clone())));
            out.push(']');
        }
    }
    out
}

/// Every prefix of the path must be truthy and the full path non-null.
fn exists(segments: &[String]) -> String {
    let mut parts: Vec<String> = (1..segments.len())
        .map(|i| path("doc", &segments[..i]))
        .collect();
    parts.push(format!("{} != null", path("doc", segments)));
    parts.join(" && ")
}

pub(crate) fn expr(expr: &Expr) -> String {
    match expr {
        Expr::Id => "doc._id".to_string(),
        Expr::Doc => "doc".to_string(),
        Expr::Item => "item".to_string(),
        Expr::Field(segments) => path("doc", segments),
        Expr::Literal(value) => literal(value),
        Expr::Array(items) => {
            let rendered: Vec<String> = items.iter().map(self::expr).collect();
            format!("[{}]", rendered.join(", "))
        }
    }
}

pub(crate) fn condition(condition: &Condition) -> String {
    match condition {
        Condition::Exists(segments) => exists(segments),
        Condition::ListLenEq(segments, n) => {
            let p = path("doc", segments);
            format!("Array.isArray({p}) && {p}.length === {n}")
        }
        Condition::ListLenAtLeast(segments, n) => {
            let p = path("doc", segments);
            format!("Array.isArray({p}) && {p}.length >= {n}")
        }
        Condition::OneOf(segments, values) => {
            let allowed: Vec<String> = values.iter().map(literal).collect();
            format!(
                "{} && [{}].includes({})",
                exists(segments),
                allowed.join(", "),
                path("doc", segments)
            )
        }
        Condition::All(conditions) => conditions
            .iter()
            .map(|c| format!("({})", self::condition(c)))
            .collect::<Vec<_>>()
            .join(" && "),
    }
}

pub(crate) fn body(body: &MapBody) -> String {
    match body {
        MapBody::Emit { key, value } => format!("emit({}, {});", expr(key), expr(value)),
        MapBody::EmitEach { list, key, value } => {
            let p = path("doc", list);
            let emit = format!(
                "var item = {p}[i];\nemit({}, {});",
                expr(key),
                expr(value)
            );
            let each = format!("for (var i = 0; i < {p}.length; i++) {{\n{}\n}}", indent(&emit));
            if_block(&format!("Array.isArray({p})"), &each)
        }
        MapBody::When { condition: c, then } => if_block(&condition(c), &self::body(then)),
        MapBody::ByType(branches) => branches
            .iter()
            .map(|(doc_type, branch)| {
                let head = format!(
                    "doc.document_type === {}",
                    literal(&Value::String(doc_type.clone()))
                );
                if_block(&head, &self::body(branch))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        MapBody::Sequence(items) => items
            .iter()
            .map(self::body)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

pub(crate) fn type_guard(doc_types: &[String]) -> String {
    let alternatives: Vec<String> = doc_types
        .iter()
        .map(|t| format!("doc.document_type === {}", literal(&Value::String(t.clone()))))
        .collect();
    format!("doc.document_type && ({})", alternatives.join(" || "))
}

pub(crate) const DELETE_GUARD: &str = "!doc.deleted";

pub(crate) const SUM_REDUCE: &str = "function (keys, values, rereduce) {\n  return sum(values);\n}";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indents_every_non_empty_line() {
        assert_eq!(indent("a\n\nb"), "  a\n\n  b");
    }

    #[test]
    fn paths_fall_back_to_brackets() {
        let segments = vec!["filemaker_record".to_string(), "Mol NR".to_string()];
        assert_eq!(path("doc", &segments), "doc.filemaker_record[\"Mol NR\"]");
    }

    #[test]
    fn exists_guards_every_parent() {
        let segments = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(
            exists(&segments),
            "doc.a && doc.a.b && doc.a.b.c != null"
        );
    }
}
