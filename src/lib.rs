//! # epub2md
//!
//! Convert EPUB e-books into clean, portable Markdown with a YAML metadata
//! header and the book's images extracted beside it.
//!
//! ## Why this crate?
//!
//! pandoc reads EPUB well, but its Markdown keeps every trace of the source
//! XHTML: `:::` div fences around each container, `[]{#filepos123}` anchors,
//! attribute blocks on headings, links into files that no longer exist, and
//! image paths inside a temporary directory. This crate takes pandoc's
//! output and turns it into something a person would want to edit.
//!
//! ## Pipeline Overview
//!
//! ```text
//! EPUB
//!  │
//!  ├─ 1. Input       validate the ZIP container
//!  ├─ 2. Convert     pandoc → raw Markdown + metadata JSON + media files
//!  ├─ 3. Metadata    raw fields → BookMetadata (title falls back to file name)
//!  ├─ 4. Cleanup     5 ordered, idempotent rules (fences, spans, headings, links, whitespace)
//!  ├─ 5. Images      unique flat names under images/, references rewritten, optional resize
//!  ├─ 6. Header      deterministic YAML front-matter + custom fields
//!  └─ 7. Output      <root>/<book>/<book>.md written atomically, images beside it
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use epub2md::{convert, ConversionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConversionConfig::default();
//!     let result = convert("books/dune.epub", None, &config).await?;
//!     println!("{} → {:?}", result.input.display(), result.output);
//!     for w in &result.warnings {
//!         eprintln!("warning: {w}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Cleanup is usable on its own, without pandoc:
//!
//! ```rust
//! use epub2md::{clean_markdown, CleanupOptions};
//!
//! let raw = ":::div\n# Heading #\n:::\n\n[]{#anchor}Text";
//! assert_eq!(clean_markdown(raw, &CleanupOptions::default()), "# Heading\n\nText\n");
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `epub2md` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! epub2md = { version = "0.1", default-features = false }
//! ```
//!
//! ## Requirements
//!
//! The default converter shells out to [pandoc](https://pandoc.org) 2.x or
//! 3.x. Any other converter can be plugged in by implementing
//! [`DocumentConverter`].

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    CleanupOptions, ConversionConfig, ConversionConfigBuilder, CustomFields, FieldValue,
    FrontmatterOptions, ImageOptions,
};
pub use convert::{
    convert, convert_file, convert_sync, convert_to_file, output_path_for, render_document,
    write_document,
};
pub use error::{ConversionWarning, Epub2MdError};
pub use output::{BatchFailure, BatchReport, ConversionResult, RenderedDocument};
pub use pipeline::cleanup::{clean_markdown, clean_markdown_with_stats, CleanupRule, CleanupStats};
pub use pipeline::frontmatter::render_frontmatter;
pub use pipeline::images::{restore_archive_paths, resolve_images, ImageResolution, ResolvedAsset};
pub use pipeline::input::discover_sources;
pub use pipeline::metadata::{extract_metadata, BookMetadata};
pub use pipeline::optimize::{ImageTransform, RasterTransform, TransformOutcome};
pub use pipeline::pandoc::PandocConverter;
pub use pipeline::source::{DocumentConverter, RawAsset, RawDocument, RawMetadata};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use stream::{convert_batch, convert_batch_stream, plan_batch, BatchJob, ResultStream};
