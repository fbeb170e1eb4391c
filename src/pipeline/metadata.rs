//! Bibliographic metadata: raw converter fields → [`BookMetadata`].
//!
//! The mapping is deliberately forgiving. Values are trimmed, empty values
//! count as absent, unknown keys are ignored, and a missing title falls back
//! to the source file name. Missing fields never fail a conversion; they
//! surface as [`ConversionWarning::MetadataIncomplete`].

use crate::error::ConversionWarning;
use crate::pipeline::source::RawMetadata;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Typed bibliographic record for one book. Immutable once extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookMetadata {
    title: String,
    authors: Vec<String>,
    publisher: Option<String>,
    language: Option<String>,
    date: Option<String>,
    identifiers: BTreeMap<String, String>,
    description: Option<String>,
    subjects: Vec<String>,
    rights: Option<String>,
}

impl BookMetadata {
    /// A record with only a title; every other field absent.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            authors: Vec::new(),
            publisher: None,
            language: None,
            date: None,
            identifiers: BTreeMap::new(),
            description: None,
            subjects: Vec::new(),
            rights: None,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn authors(&self) -> &[String] {
        &self.authors
    }

    pub fn publisher(&self) -> Option<&str> {
        self.publisher.as_deref()
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Publication date, free-form as found in the package.
    pub fn date(&self) -> Option<&str> {
        self.date.as_deref()
    }

    /// Scheme (lower-case) → value, e.g. `isbn` → `9780140449136`.
    pub fn identifiers(&self) -> &BTreeMap<String, String> {
        &self.identifiers
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    pub fn rights(&self) -> Option<&str> {
        self.rights.as_deref()
    }
}

/// Build a [`BookMetadata`] from raw converter fields.
///
/// `source` is the archive path; its file stem becomes the title when the
/// package has none. Returns the record plus any defaults that were applied.
pub fn extract_metadata(
    raw: &RawMetadata,
    source: &Path,
) -> (BookMetadata, Vec<ConversionWarning>) {
    let mut meta = BookMetadata::titled(String::new());
    let mut warnings = Vec::new();

    for (key, value) in raw.iter() {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let key = key.trim().to_ascii_lowercase();

        if let Some(scheme) = key.strip_prefix("identifier:") {
            add_identifier(&mut meta.identifiers, scheme.trim(), value);
            continue;
        }

        match key.as_str() {
            "title" => set_once(&mut meta.title, value),
            "creator" | "author" | "authors" => push_unique(&mut meta.authors, value),
            "publisher" => set_option_once(&mut meta.publisher, value),
            "language" | "lang" => set_option_once(&mut meta.language, value),
            "date" | "published" | "pubdate" => set_option_once(&mut meta.date, value),
            "identifier" => {
                let scheme = classify_identifier(value);
                add_identifier(&mut meta.identifiers, scheme, value);
            }
            "isbn" => add_identifier(&mut meta.identifiers, "isbn", value),
            "description" | "abstract" => set_option_once(&mut meta.description, value),
            "subject" | "subjects" | "keywords" => push_unique(&mut meta.subjects, value),
            "rights" => set_option_once(&mut meta.rights, value),
            _ => {}
        }
    }

    if meta.title.is_empty() {
        let fallback = fallback_title(source);
        warnings.push(ConversionWarning::MetadataIncomplete {
            field: "title".into(),
            fallback: format!("using file name '{fallback}'"),
        });
        meta.title = fallback;
    }

    if meta.authors.is_empty() {
        warnings.push(ConversionWarning::MetadataIncomplete {
            field: "authors".into(),
            fallback: "omitted from front-matter".into(),
        });
    }

    (meta, warnings)
}

/// File name without its final extension; `Untitled` when there is none.
fn fallback_title(source: &Path) -> String {
    source
        .file_stem()
        .map(|s| s.to_string_lossy().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Untitled".to_string())
}

fn set_once(slot: &mut String, value: &str) {
    if slot.is_empty() {
        *slot = value.to_string();
    }
}

fn set_option_once(slot: &mut Option<String>, value: &str) {
    if slot.is_none() {
        *slot = Some(value.to_string());
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

fn add_identifier(ids: &mut BTreeMap<String, String>, scheme: &str, value: &str) {
    let scheme = if scheme.is_empty() {
        "id".to_string()
    } else {
        scheme.to_ascii_lowercase()
    };
    let value = match scheme.as_str() {
        "isbn" => strip_prefix_ignore_case(value, "urn:isbn:"),
        "uuid" => strip_prefix_ignore_case(value, "urn:uuid:"),
        _ => value,
    };
    ids.entry(scheme).or_insert_with(|| value.to_string());
}

/// Guess the scheme of an identifier that arrived without one.
fn classify_identifier(value: &str) -> &'static str {
    let lower = value.to_ascii_lowercase();
    if lower.starts_with("urn:uuid:") {
        return "uuid";
    }
    if lower.contains("isbn") {
        return "isbn";
    }
    let digits: String = value.chars().filter(|c| *c != '-' && *c != ' ').collect();
    let isbn_shaped = (digits.len() == 10 || digits.len() == 13)
        && digits
            .chars()
            .enumerate()
            .all(|(i, c)| c.is_ascii_digit() || (i == 9 && digits.len() == 10 && c == 'X'));
    if isbn_shaped {
        "isbn"
    } else {
        "id"
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> &'a str {
    match value.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => value[prefix.len()..].trim(),
        _ => value,
    }
}
