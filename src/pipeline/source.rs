//! The document-converter seam: what an external converter hands us.
//!
//! Unpacking the EPUB container and turning its XHTML into Markdown is not
//! done here. A [`DocumentConverter`] (pandoc by default, see
//! [`crate::pipeline::pandoc`]) produces a [`RawDocument`]: raw Markdown
//! text, the package metadata as flat key/value pairs, and the embedded
//! image bytes. Everything downstream is a pure function of that value, which
//! is what lets the tests drive the whole pipeline with an in-memory fake.

use crate::error::Epub2MdError;
use async_trait::async_trait;
use std::path::Path;

/// Converter output for one archive.
#[derive(Debug, Clone, Default)]
pub struct RawDocument {
    /// Markdown exactly as the converter emitted it.
    pub markdown: String,
    /// Package metadata, unvalidated.
    pub metadata: RawMetadata,
    /// Embedded media discovered by the converter.
    pub assets: Vec<RawAsset>,
}

/// An embedded asset as supplied by the converter. Read-only to this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAsset {
    /// The reference path exactly as it appears in the raw Markdown.
    pub id: String,
    /// `/`-separated path of the file inside the archive. References are
    /// pointed here when images are not extracted, because `id` may name a
    /// scratch file that is gone once the converter returns.
    pub href: String,
    pub bytes: Vec<u8>,
    /// MIME type hint, e.g. `image/jpeg`.
    pub content_type: String,
}

impl RawAsset {
    /// An asset whose archive path is its id.
    pub fn new(id: impl Into<String>, bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            href: id.clone(),
            id,
            bytes,
            content_type: content_type.into(),
        }
    }

    pub fn with_href(mut self, href: impl Into<String>) -> Self {
        self.href = href.into();
        self
    }

    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

/// Flat package metadata: ordered `(key, value)` pairs.
///
/// Keys may repeat (one `creator` entry per author). Identifier entries may
/// carry their scheme as `identifier:<scheme>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMetadata {
    entries: Vec<(String, String)>,
}

impl RawMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Builder-style [`RawMetadata::push`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawMetadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut meta = RawMetadata::new();
        for (k, v) in iter {
            meta.push(k, v);
        }
        meta
    }
}

/// Turns an archive on disk into a [`RawDocument`].
///
/// Implementations must be `Send + Sync`: a batch shares one converter across
/// concurrently running files.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &str;

    /// Verify the converter can run at all.
    ///
    /// Called once before a run; failure is [`Epub2MdError::ConverterUnavailable`]
    /// and aborts the run before any file is processed.
    async fn check_available(&self) -> Result<(), Epub2MdError>;

    /// Convert one archive.
    async fn convert(&self, source: &Path) -> Result<RawDocument, Epub2MdError>;
}
