//! Error types for the epub2md library.
//!
//! Two distinct types reflect two distinct failure modes:
//!
//! * [`Epub2MdError`] — **Fatal**: the file (or the whole run) cannot be
//!   converted at all (archive missing or corrupt, pandoc not installed,
//!   invalid configuration, output not writable). Returned as
//!   `Err(Epub2MdError)` from the top-level `convert*` functions.
//!
//! * [`ConversionWarning`] — **Non-fatal**: something was degraded (a
//!   metadata field defaulted, an image reference had no matching asset, an
//!   image could not be optimised) but the document was still written.
//!   Stored inside [`crate::output::ConversionResult`] so callers can
//!   inspect what was lost without losing the whole book.
//!
//! Fatal errors come in two scopes. Most are *per-file*: the orchestrator
//! turns them into a failed result and moves on to the next book. A few are
//! *run-level* ([`Epub2MdError::is_run_fatal`]) and abort before any file is
//! touched.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the epub2md library.
///
/// Degraded-but-written outcomes use [`ConversionWarning`] instead.
#[derive(Debug, Error)]
pub enum Epub2MdError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("EPUB file not found: '{path}'\nCheck the path exists and is readable.")]
    SourceNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a ZIP container.
    #[error("File is not a valid EPUB archive: '{path}'\nFirst bytes: {magic:?}")]
    NotAnArchive { path: PathBuf, magic: [u8; 4] },

    /// The converter rejected the archive (corrupt container, bad markup).
    #[error("Could not read EPUB '{path}': {detail}")]
    SourceUnreadable { path: PathBuf, detail: String },

    // ── Converter errors ──────────────────────────────────────────────────
    /// The external document converter is not installed or not runnable.
    #[error("Document converter '{tool}' is not available.\n{hint}")]
    ConverterUnavailable { tool: String, hint: String },

    /// The converter did not finish within the configured timeout.
    #[error("Converter timed out after {secs}s on '{path}'\nIncrease processing.converter_timeout_secs.")]
    ConverterTimeout { path: PathBuf, secs: u64 },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file (Markdown or image).
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file could not be read.
    #[error("Failed to read configuration file '{path}': {source}")]
    ConfigUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Epub2MdError {
    /// Errors that make every file in the run fail the same way.
    ///
    /// These are reported once and stop the run before any conversion.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Epub2MdError::ConverterUnavailable { .. }
                | Epub2MdError::InvalidConfig(_)
                | Epub2MdError::ConfigUnreadable { .. }
        )
    }

    /// Output errors worth another attempt (permission race, interrupted
    /// syscall). Malformed input is never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Epub2MdError::OutputWriteFailed { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

/// A non-fatal problem encountered while converting one file.
///
/// The document is still written; the warning travels with the
/// [`crate::output::ConversionResult`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversionWarning {
    /// A bibliographic field was missing; a default was applied.
    #[error("metadata field '{field}' missing: {fallback}")]
    MetadataIncomplete { field: String, fallback: String },

    /// An image reference matched no asset; the reference text was kept.
    #[error("image reference '{reference}' has no matching asset; left unchanged")]
    AssetUnresolved { reference: String },

    /// The image transform failed; original bytes were written instead.
    #[error("could not optimise '{asset}', wrote original bytes: {detail}")]
    AssetOptimizeFailed { asset: String, detail: String },
}
