//! YAML front-matter rendering.
//!
//! Rendering is a pure function of `(BookMetadata, CustomFields)`: the same
//! inputs always produce byte-identical text, so re-running a batch never
//! churns the headers of books that did not change.
//!
//! Field order is fixed: title, authors, publisher, date, language,
//! identifiers, description, subjects, rights, then the custom fields in
//! declaration order. Absent fields are omitted, never written as `null` or
//! an empty string. Every string value is double-quoted.

use crate::config::{CustomFields, FieldValue};
use crate::pipeline::metadata::BookMetadata;
use std::fmt::Write as _;

/// Keys emitted from metadata; custom fields may not reuse them.
pub const RESERVED_KEYS: &[&str] = &[
    "title",
    "authors",
    "publisher",
    "date",
    "language",
    "identifiers",
    "description",
    "subjects",
    "rights",
];

/// Render the `---`-delimited header block, ending with a newline.
pub fn render_frontmatter(meta: &BookMetadata, custom: &CustomFields) -> String {
    let mut yaml = String::from("---\n");

    scalar(&mut yaml, "title", meta.title());
    list(&mut yaml, "authors", meta.authors());
    if let Some(p) = meta.publisher() {
        scalar(&mut yaml, "publisher", p);
    }
    if let Some(d) = meta.date() {
        scalar(&mut yaml, "date", d);
    }
    if let Some(l) = meta.language() {
        scalar(&mut yaml, "language", l);
    }
    if !meta.identifiers().is_empty() {
        yaml.push_str("identifiers:\n");
        for (scheme, value) in meta.identifiers() {
            let _ = writeln!(yaml, "  {}: {}", yaml_key(scheme), yaml_string(value));
        }
    }
    if let Some(d) = meta.description() {
        scalar(&mut yaml, "description", d);
    }
    list(&mut yaml, "subjects", meta.subjects());
    if let Some(r) = meta.rights() {
        scalar(&mut yaml, "rights", r);
    }

    for (key, value) in custom.iter() {
        let rendered = match value {
            FieldValue::Text(s) => yaml_string(s),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Number(n) => n.to_string(),
        };
        let _ = writeln!(yaml, "{}: {}", yaml_key(key), rendered);
    }

    yaml.push_str("---\n");
    yaml
}

fn scalar(yaml: &mut String, key: &str, value: &str) {
    let _ = writeln!(yaml, "{key}: {}", yaml_string(value));
}

fn list(yaml: &mut String, key: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    let _ = writeln!(yaml, "{key}:");
    for v in values {
        let _ = writeln!(yaml, "  - {}", yaml_string(v));
    }
}

/// Double-quoted YAML scalar with backslash escapes.
fn yaml_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            // Line and paragraph separators fold to spaces inside a quoted
            // scalar; BOM and non-characters are not allowed in a YAML stream.
            c if c.is_control() || matches!(c, '\u{2028}' | '\u{2029}' | '\u{FEFF}' | '\u{FFFE}' | '\u{FFFF}') => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Words a YAML 1.1 or 1.2 reader resolves to null or a boolean.
const YAML_KEYWORDS: &[&str] = &["null", "true", "false", "yes", "no", "on", "off", "y", "n"];

/// Plain keys stay bare; anything else is quoted.
fn yaml_key(key: &str) -> String {
    let mut chars = key.chars();
    let plain = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !YAML_KEYWORDS.iter().any(|k| key.eq_ignore_ascii_case(k));
    if plain {
        key.to_string()
    } else {
        yaml_string(key)
    }
}
