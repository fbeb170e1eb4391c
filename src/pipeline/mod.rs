//! Pipeline stages for EPUB-to-Markdown conversion.
//!
//! Each submodule implements one transformation step, and everything after
//! the converter is a pure function of its input.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ pandoc ──▶ metadata ──▶ cleanup ──▶ images ──▶ frontmatter
//! (check)   (source)   (extract)    (6 rules)   (resolve)  (YAML header)
//! ```
//!
//! 1. [`input`]   — validate the archive; discover `*.epub` files for batches
//! 2. [`pandoc`]  — run the external converter behind the
//!    [`source::DocumentConverter`] seam
//! 3. [`metadata`] — raw package fields → typed [`metadata::BookMetadata`]
//! 4. [`cleanup`] — ordered, idempotent rewrite rules
//!    (fences, spans, [`headings`], [`links`], whitespace)
//! 5. [`images`]  — give assets unique names and rewrite references;
//!    [`optimize`] shrinks oversized rasters on request
//! 6. [`frontmatter`] — deterministic YAML header

pub mod cleanup;
pub mod frontmatter;
pub mod headings;
pub mod images;
pub mod input;
pub mod links;
pub mod metadata;
pub mod optimize;
pub mod pandoc;
pub mod source;
