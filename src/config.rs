//! Configuration types for EPUB-to-Markdown conversion.
//!
//! All conversion behaviour is controlled through [`ConversionConfig`], built
//! via its [`ConversionConfigBuilder`] or loaded from a JSON document with
//! [`ConversionConfig::from_json_file`]. One immutable value is passed into
//! every stage; nothing is read from process-wide state, so two conversions
//! with different configs can run side by side in the same batch.
//!
//! # JSON layout
//!
//! ```json
//! {
//!   "processing":  { "extract_images": true, "concurrency": 4 },
//!   "cleanup":     { "remove_div_blocks": true, "fix_links": false },
//!   "frontmatter": { "add": true, "custom_fields": { "source": "epub", "draft": false } },
//!   "images":      { "extract_path": "images", "optimize": true, "max_width": 1200 }
//! }
//! ```
//!
//! Missing sections and keys take the documented defaults; unknown keys are
//! ignored so a config written for a newer release still loads.

use crate::error::Epub2MdError;
use crate::pipeline::frontmatter::RESERVED_KEYS;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};

/// Configuration for converting one or more EPUB files.
///
/// Built via [`ConversionConfig::builder()`] or using
/// [`ConversionConfig::default()`].
///
/// # Example
/// ```rust
/// use epub2md::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .optimize_images(true)
///     .max_image_size(800, 1000)
///     .custom_field("source", "epub")
///     .build()
///     .unwrap();
/// assert!(config.images.optimize);
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Write embedded images next to the Markdown and rewrite their
    /// references. Default: true.
    ///
    /// When disabled, image references are left exactly as the converter
    /// produced them and no image files are written.
    pub extract_images: bool,

    /// Which cleanup stages run. Every stage defaults to on.
    pub cleanup: CleanupOptions,

    /// Front-matter header options.
    pub frontmatter: FrontmatterOptions,

    /// Image extraction and optimisation options.
    pub images: ImageOptions,

    /// Maximum number of files converted at once in a batch. Default: 4.
    ///
    /// Each in-flight file holds a converter process and its extracted media,
    /// so this bounds both child processes and open file descriptors.
    pub concurrency: usize,

    /// Stop starting new files after the first failure. Default: false.
    ///
    /// Files already in flight still complete and are counted.
    pub fail_fast: bool,

    /// Extra attempts for a transient output write failure. Default: 2.
    pub io_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 100.
    pub retry_backoff_ms: u64,

    /// Upper bound on a single converter invocation, in seconds. Default: 300.
    pub converter_timeout_secs: u64,

    /// Per-file progress events for batch runs.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            extract_images: true,
            cleanup: CleanupOptions::default(),
            frontmatter: FrontmatterOptions::default(),
            images: ImageOptions::default(),
            concurrency: 4,
            fail_fast: false,
            io_retries: 2,
            retry_backoff_ms: 100,
            converter_timeout_secs: 300,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("extract_images", &self.extract_images)
            .field("cleanup", &self.cleanup)
            .field("frontmatter", &self.frontmatter)
            .field("images", &self.images)
            .field("concurrency", &self.concurrency)
            .field("fail_fast", &self.fail_fast)
            .field("io_retries", &self.io_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("converter_timeout_secs", &self.converter_timeout_secs)
            .field(
                "progress_callback",
                &self
                    .progress_callback
                    .as_ref()
                    .map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Reopen this config for further overrides (e.g. CLI flags on top of
    /// a loaded file).
    pub fn into_builder(self) -> ConversionConfigBuilder {
        ConversionConfigBuilder { config: self }
    }

    /// Parse a JSON configuration document, merging it over the defaults.
    pub fn from_json_str(json: &str) -> Result<Self, Epub2MdError> {
        let file: ConfigFile = serde_json::from_str(json)
            .map_err(|e| Epub2MdError::InvalidConfig(format!("malformed JSON config: {e}")))?;
        file.into_config()
    }

    /// Read and parse a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Epub2MdError> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).map_err(|source| Epub2MdError::ConfigUnreadable {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json_str(&text)
    }

    /// Check every constraint the pipeline relies on.
    pub fn validate(&self) -> Result<(), Epub2MdError> {
        if self.concurrency == 0 {
            return Err(Epub2MdError::InvalidConfig(
                "processing.concurrency must be ≥ 1".into(),
            ));
        }
        if self.converter_timeout_secs == 0 {
            return Err(Epub2MdError::InvalidConfig(
                "processing.converter_timeout_secs must be ≥ 1".into(),
            ));
        }
        if self.images.max_width == 0 || self.images.max_height == 0 {
            return Err(Epub2MdError::InvalidConfig(format!(
                "images.max_width and images.max_height must be ≥ 1, got {}x{}",
                self.images.max_width, self.images.max_height
            )));
        }
        validate_extract_path(&self.images.extract_path)?;
        for (key, _) in self.frontmatter.custom_fields.iter() {
            if key.trim().is_empty() {
                return Err(Epub2MdError::InvalidConfig(
                    "frontmatter.custom_fields keys must not be empty".into(),
                ));
            }
            if RESERVED_KEYS.contains(&key.as_str()) {
                return Err(Epub2MdError::InvalidConfig(format!(
                    "frontmatter.custom_fields key '{key}' collides with a metadata field"
                )));
            }
        }
        Ok(())
    }
}

fn validate_extract_path(path: &str) -> Result<(), Epub2MdError> {
    if path.trim().is_empty() {
        return Err(Epub2MdError::InvalidConfig(
            "images.extract_path must not be empty".into(),
        ));
    }
    let relative = Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !relative {
        return Err(Epub2MdError::InvalidConfig(format!(
            "images.extract_path must be a relative path inside the output directory, got '{path}'"
        )));
    }
    Ok(())
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn extract_images(mut self, v: bool) -> Self {
        self.config.extract_images = v;
        self
    }

    pub fn cleanup(mut self, options: CleanupOptions) -> Self {
        self.config.cleanup = options;
        self
    }

    pub fn remove_div_blocks(mut self, v: bool) -> Self {
        self.config.cleanup.remove_div_blocks = v;
        self
    }

    pub fn remove_spans(mut self, v: bool) -> Self {
        self.config.cleanup.remove_spans = v;
        self
    }

    pub fn remove_duplicate_images(mut self, v: bool) -> Self {
        self.config.cleanup.remove_duplicate_images = v;
        self
    }

    pub fn fix_headers(mut self, v: bool) -> Self {
        self.config.cleanup.fix_headers = v;
        self
    }

    pub fn fix_links(mut self, v: bool) -> Self {
        self.config.cleanup.fix_links = v;
        self
    }

    pub fn normalize_whitespace(mut self, v: bool) -> Self {
        self.config.cleanup.normalize_whitespace = v;
        self
    }

    pub fn add_frontmatter(mut self, v: bool) -> Self {
        self.config.frontmatter.add = v;
        self
    }

    /// Append (or replace in place) a custom front-matter field.
    pub fn custom_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.config.frontmatter.custom_fields.insert(key, value);
        self
    }

    pub fn extract_path(mut self, path: impl Into<String>) -> Self {
        self.config.images.extract_path = path.into();
        self
    }

    pub fn optimize_images(mut self, v: bool) -> Self {
        self.config.images.optimize = v;
        self
    }

    pub fn max_image_size(mut self, width: u32, height: u32) -> Self {
        self.config.images.max_width = width.max(1);
        self.config.images.max_height = height.max(1);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn fail_fast(mut self, v: bool) -> Self {
        self.config.fail_fast = v;
        self
    }

    pub fn io_retries(mut self, n: u32) -> Self {
        self.config.io_retries = n.min(5);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn converter_timeout_secs(mut self, secs: u64) -> Self {
        self.config.converter_timeout_secs = secs.max(1);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, Epub2MdError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Sections ─────────────────────────────────────────────────────────────

/// Toggles for the cleanup stages.
///
/// Disabling a stage turns it into a pass-through; the remaining stages still
/// run in their fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupOptions {
    /// Stage 1: drop `:::` fenced-div markers.
    pub remove_div_blocks: bool,
    /// Stage 2: drop `[]{#id}` anchor spans and other inline attribute residue.
    pub remove_spans: bool,
    /// Drop standalone image lines that repeat an earlier image.
    pub remove_duplicate_images: bool,
    /// Stage 3: canonical ATX headings separated by one blank line.
    pub fix_headers: bool,
    /// Stage 4: point internal links at heading anchors.
    pub fix_links: bool,
    /// Stage 5: blank-line collapse, trailing whitespace, final newline.
    pub normalize_whitespace: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            remove_div_blocks: true,
            remove_spans: true,
            remove_duplicate_images: true,
            fix_headers: true,
            fix_links: true,
            normalize_whitespace: true,
        }
    }
}

impl CleanupOptions {
    /// Every stage disabled; the pipeline only normalises line endings.
    pub fn none() -> Self {
        Self {
            remove_div_blocks: false,
            remove_spans: false,
            remove_duplicate_images: false,
            fix_headers: false,
            fix_links: false,
            normalize_whitespace: false,
        }
    }
}

/// Front-matter header options.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontmatterOptions {
    /// Prepend a YAML header. Default: true.
    pub add: bool,
    /// User fields emitted after the metadata fields, in declaration order.
    pub custom_fields: CustomFields,
}

impl Default for FrontmatterOptions {
    fn default() -> Self {
        Self {
            add: true,
            custom_fields: CustomFields::default(),
        }
    }
}

/// Image extraction options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptions {
    /// Directory (relative to the Markdown file) that receives the images.
    /// Default: `images`.
    pub extract_path: String,
    /// Downscale images larger than `max_width` × `max_height`. Default: false.
    pub optimize: bool,
    /// Default: 1200.
    pub max_width: u32,
    /// Default: 1600.
    pub max_height: u32,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            extract_path: "images".to_string(),
            optimize: false,
            max_width: 1200,
            max_height: 1600,
        }
    }
}

// ── Custom fields ────────────────────────────────────────────────────────

/// A custom front-matter value. Only scalar shapes are supported.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Bool(bool),
    Number(serde_json::Number),
}

impl FieldValue {
    fn from_json(key: &str, value: serde_json::Value) -> Result<Self, Epub2MdError> {
        match value {
            serde_json::Value::String(s) => Ok(FieldValue::Text(s)),
            serde_json::Value::Bool(b) => Ok(FieldValue::Bool(b)),
            serde_json::Value::Number(n) => Ok(FieldValue::Number(n)),
            other => Err(Epub2MdError::InvalidConfig(format!(
                "frontmatter.custom_fields.{key}: expected a string, boolean or number, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Number(n.into())
    }
}

/// Ordered string → scalar mapping. Insertion order is emission order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomFields(Vec<(String, FieldValue)>);

impl CustomFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a field; an existing key keeps its position and takes the new value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── On-disk document ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    processing: ProcessingSection,
    cleanup: CleanupOptions,
    frontmatter: FrontmatterSection,
    images: ImageOptions,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ProcessingSection {
    extract_images: bool,
    concurrency: usize,
    fail_fast: bool,
    io_retries: u32,
    retry_backoff_ms: u64,
    converter_timeout_secs: u64,
}

impl Default for ProcessingSection {
    fn default() -> Self {
        let d = ConversionConfig::default();
        Self {
            extract_images: d.extract_images,
            concurrency: d.concurrency,
            fail_fast: d.fail_fast,
            io_retries: d.io_retries,
            retry_backoff_ms: d.retry_backoff_ms,
            converter_timeout_secs: d.converter_timeout_secs,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct FrontmatterSection {
    add: bool,
    custom_fields: serde_json::Map<String, serde_json::Value>,
}

impl Default for FrontmatterSection {
    fn default() -> Self {
        Self {
            add: true,
            custom_fields: serde_json::Map::new(),
        }
    }
}

impl ConfigFile {
    fn into_config(self) -> Result<ConversionConfig, Epub2MdError> {
        let mut custom_fields = CustomFields::new();
        for (key, value) in self.frontmatter.custom_fields {
            let value = FieldValue::from_json(&key, value)?;
            custom_fields.insert(key, value);
        }

        let config = ConversionConfig {
            extract_images: self.processing.extract_images,
            cleanup: self.cleanup,
            frontmatter: FrontmatterOptions {
                add: self.frontmatter.add,
                custom_fields,
            },
            images: self.images,
            concurrency: self.processing.concurrency,
            fail_fast: self.processing.fail_fast,
            io_retries: self.processing.io_retries,
            retry_backoff_ms: self.processing.retry_backoff_ms,
            converter_timeout_secs: self.processing.converter_timeout_secs,
            progress_callback: None,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_everything_but_optimisation() {
        let c = ConversionConfig::default();
        assert!(c.extract_images);
        assert_eq!(c.cleanup, CleanupOptions::default());
        assert!(c.cleanup.remove_div_blocks && c.cleanup.fix_links);
        assert!(c.frontmatter.add);
        assert!(!c.images.optimize);
        assert_eq!(c.images.extract_path, "images");
        assert_eq!((c.images.max_width, c.images.max_height), (1200, 1600));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn empty_document_yields_defaults() {
        let c = ConversionConfig::from_json_str("{}").unwrap();
        assert_eq!(c.cleanup, CleanupOptions::default());
        assert_eq!(c.images, ImageOptions::default());
        assert_eq!(c.concurrency, 4);
    }

    #[test]
    fn partial_sections_merge_over_defaults() {
        let c = ConversionConfig::from_json_str(
            r#"{"cleanup": {"fix_links": false}, "images": {"optimize": true, "max_width": 640}}"#,
        )
        .unwrap();
        assert!(!c.cleanup.fix_links);
        assert!(c.cleanup.fix_headers);
        assert!(c.cleanup.remove_duplicate_images);
        assert!(c.images.optimize);
        assert_eq!(c.images.max_width, 640);
        assert_eq!(c.images.max_height, 1600);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let c = ConversionConfig::from_json_str(
            r#"{"pandoc": {"extra_args": ["--wrap=none"]}, "cleanup": {"shiny": true}}"#,
        );
        assert!(c.is_ok(), "{c:?}");
    }

    #[test]
    fn wrong_types_are_invalid() {
        let err = ConversionConfig::from_json_str(r#"{"images": {"optimize": "yes"}}"#)
            .unwrap_err();
        assert!(matches!(err, Epub2MdError::InvalidConfig(_)), "{err}");
    }

    #[test]
    fn custom_fields_keep_declaration_order() {
        let c = ConversionConfig::from_json_str(
            r#"{"frontmatter": {"custom_fields": {"zeta": "z", "alpha": true, "mid": 3}}}"#,
        )
        .unwrap();
        let keys: Vec<&str> = c
            .frontmatter
            .custom_fields
            .iter()
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(keys, ["zeta", "alpha", "mid"]);
        assert_eq!(
            c.frontmatter.custom_fields.get("alpha"),
            Some(&FieldValue::Bool(true))
        );
    }

    #[test]
    fn custom_field_arrays_are_rejected() {
        let err = ConversionConfig::from_json_str(
            r#"{"frontmatter": {"custom_fields": {"tags": ["a", "b"]}}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("tags"), "{err}");
    }

    #[test]
    fn custom_field_cannot_shadow_metadata() {
        let err = ConversionConfig::builder()
            .custom_field("title", "Other")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn extract_path_must_stay_inside_output() {
        for bad in ["", "../images", "/tmp/images"] {
            let r = ConversionConfig::builder().extract_path(bad).build();
            assert!(r.is_err(), "'{bad}' should be rejected");
        }
        assert!(ConversionConfig::builder()
            .extract_path("assets/img")
            .build()
            .is_ok());
    }

    #[test]
    fn builder_clamps_numbers() {
        let c = ConversionConfig::builder()
            .concurrency(0)
            .max_image_size(0, 0)
            .build()
            .unwrap();
        assert_eq!(c.concurrency, 1);
        assert_eq!((c.images.max_width, c.images.max_height), (1, 1));
    }

    #[test]
    fn zero_concurrency_in_file_is_invalid() {
        let r = ConversionConfig::from_json_str(r#"{"processing": {"concurrency": 0}}"#);
        assert!(r.is_err());
    }

    #[test]
    fn custom_field_insert_replaces_in_place() {
        let mut f = CustomFields::new();
        f.insert("a", "1");
        f.insert("b", true);
        f.insert("a", 2i64);
        let pairs: Vec<_> = f.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), FieldValue::from(2i64)),
                ("b".to_string(), FieldValue::Bool(true))
            ]
        );
    }
}
