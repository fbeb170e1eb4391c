//! Result types returned by the conversion entry points.

use crate::error::{ConversionWarning, Epub2MdError};
use crate::pipeline::cleanup::CleanupStats;
use crate::pipeline::images::ResolvedAsset;
use crate::pipeline::metadata::BookMetadata;
use serde::Serialize;
use std::path::PathBuf;

/// A fully rendered book, before anything touches the disk.
#[derive(Debug, Clone)]
pub struct RenderedDocument {
    /// Front-matter (if enabled) followed by the cleaned body.
    pub markdown: String,
    pub metadata: BookMetadata,
    /// Images to write, paths relative to the Markdown file.
    pub assets: Vec<ResolvedAsset>,
    pub warnings: Vec<ConversionWarning>,
    /// Local image references found in the body.
    pub images_found: usize,
    /// References that matched no asset and were left as-is.
    pub images_unresolved: usize,
    pub cleanup: CleanupStats,
}

/// Per-file outcome. Serialises to one JSON object for `--json` output.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionResult {
    pub input: PathBuf,
    /// Markdown path. Set when the target was known, even on failure.
    pub output: Option<PathBuf>,
    pub success: bool,
    /// Error message when `success` is false.
    pub error: Option<String>,
    /// `true` when the file was never attempted (fail-fast abort).
    pub skipped: bool,
    pub title: Option<String>,
    pub images_found: usize,
    pub images_written: usize,
    pub images_unresolved: usize,
    pub images_optimized: usize,
    /// What the cleanup rules removed or rewrote.
    pub cleanup: CleanupStats,
    pub warnings: Vec<ConversionWarning>,
    pub duration_ms: u64,
}

impl ConversionResult {
    pub(crate) fn failed(
        input: PathBuf,
        output: Option<PathBuf>,
        error: &Epub2MdError,
        duration_ms: u64,
    ) -> Self {
        Self {
            input,
            output,
            success: false,
            error: Some(error.to_string()),
            skipped: false,
            title: None,
            images_found: 0,
            images_written: 0,
            images_unresolved: 0,
            images_optimized: 0,
            cleanup: CleanupStats::default(),
            warnings: Vec::new(),
            duration_ms,
        }
    }

    pub(crate) fn skipped(input: PathBuf) -> Self {
        Self {
            input,
            output: None,
            success: false,
            error: Some("skipped: batch aborted after an earlier failure".to_string()),
            skipped: true,
            title: None,
            images_found: 0,
            images_written: 0,
            images_unresolved: 0,
            images_optimized: 0,
            cleanup: CleanupStats::default(),
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// One failed file in a [`BatchReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub input: PathBuf,
    pub error: String,
}

/// Aggregate tally of a batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Files not attempted because of `fail_fast`.
    pub skipped: usize,
    /// Every file's result, sorted by input path.
    pub results: Vec<ConversionResult>,
    /// Failed (not skipped) files with their error, sorted by input path.
    pub failures: Vec<BatchFailure>,
    pub duration_ms: u64,
}

impl BatchReport {
    /// Fold one result into the tally.
    pub fn record(&mut self, result: ConversionResult) {
        if result.success {
            self.succeeded += 1;
        } else if result.skipped {
            self.skipped += 1;
        } else {
            self.failed += 1;
            self.failures.push(BatchFailure {
                input: result.input.clone(),
                error: result.error.clone().unwrap_or_default(),
            });
        }
        self.results.push(result);
    }

    /// Sort results and failures by input path.
    pub(crate) fn finish(&mut self, duration_ms: u64) {
        self.results.sort_by(|a, b| a.input.cmp(&b.input));
        self.failures.sort_by(|a, b| a.input.cmp(&b.input));
        self.duration_ms = duration_ms;
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// `true` when every file converted.
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(name: &str) -> ConversionResult {
        ConversionResult {
            success: true,
            error: None,
            skipped: false,
            ..ConversionResult::skipped(PathBuf::from(name))
        }
    }

    #[test]
    fn tally_counts_each_outcome() {
        let mut report = BatchReport::default();
        report.record(ok("b.epub"));
        report.record(ConversionResult::failed(
            PathBuf::from("c.epub"),
            None,
            &Epub2MdError::Internal("boom".into()),
            3,
        ));
        report.record(ConversionResult::skipped(PathBuf::from("a.epub")));
        report.finish(10);

        assert_eq!((report.succeeded, report.failed, report.skipped), (1, 1, 1));
        assert_eq!(report.total(), 3);
        assert!(!report.all_succeeded());
        assert_eq!(report.results[0].input, PathBuf::from("a.epub"));
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("boom"));
    }

    #[test]
    fn result_serialises_warnings_with_kind_tag() {
        let mut result = ok("x.epub");
        result.warnings.push(ConversionWarning::AssetUnresolved {
            reference: "a.png".into(),
        });
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["warnings"][0]["kind"], "asset_unresolved");
        assert_eq!(json["success"], true);
        assert_eq!(json["cleanup"]["divs_removed"], 0);
    }
}
