//! Progress-callback trait for per-file conversion events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ConversionConfigBuilder::progress_callback`] to hear about
//! each book as a batch works through it. The library never draws anything
//! itself; the CLI forwards these events to an `indicatif` progress bar.
//!
//! # Example
//!
//! ```rust
//! use epub2md::{ConversionConfig, ConversionProgressCallback};
//! use std::path::Path;
//! use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};
//!
//! struct Counter(AtomicUsize);
//!
//! impl ConversionProgressCallback for Counter {
//!     fn on_file_complete(&self, input: &Path, _output: &Path, _images: usize) {
//!         let done = self.0.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{done}: {}", input.display());
//!     }
//! }
//!
//! let config = ConversionConfig::builder()
//!     .progress_callback(Arc::new(Counter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use std::path::Path;
use std::sync::Arc;

/// Called by the orchestrator as files move through the pipeline.
///
/// Files in a batch run concurrently, so per-file methods may be called from
/// several tasks at once. All methods default to no-ops.
pub trait ConversionProgressCallback: Send + Sync {
    /// Once, before the first file starts.
    fn on_batch_start(&self, total_files: usize) {
        let _ = total_files;
    }

    /// A file is about to be handed to the converter.
    fn on_file_start(&self, input: &Path) {
        let _ = input;
    }

    /// A file was written; `images_written` counts materialised assets.
    fn on_file_complete(&self, input: &Path, output: &Path, images_written: usize) {
        let _ = (input, output, images_written);
    }

    /// A file failed; `error` is the human-readable reason.
    fn on_file_error(&self, input: &Path, error: &str) {
        let _ = (input, error);
    }

    /// Once, after every file has been attempted or skipped.
    fn on_batch_complete(&self, total_files: usize, succeeded: usize) {
        let _ = (total_files, succeeded);
    }
}

/// Does nothing. Equivalent to configuring no callback.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Type stored in [`crate::config::ConversionConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;
