//! Batch conversion: many books, bounded concurrency, one tally.
//!
//! Files share nothing but the converter, so they run independently through
//! `buffer_unordered(concurrency)`. That bound is also the cap on
//! simultaneous pandoc processes. Results are folded into the
//! [`BatchReport`] by the single consumer of the stream, so the tally has
//! exactly one owner no matter how many conversions are in flight.
//!
//! With `fail_fast`, the first failure raises a shared flag; files that have
//! not started yet come back as skipped, files already running complete.

use crate::config::ConversionConfig;
use crate::convert::{book_path, convert_file, sanitize_stem};
use crate::error::Epub2MdError;
use crate::output::{BatchReport, ConversionResult};
use crate::pipeline::images::unique_name;
use crate::pipeline::source::DocumentConverter;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::Stream;
use tracing::{info, warn};

/// A boxed stream of per-file results, in completion order.
pub type ResultStream = Pin<Box<dyn Stream<Item = ConversionResult> + Send>>;

/// One file of a batch: where it comes from and where its Markdown goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Map discovered inputs to output paths, mirroring each file's directory
/// relative to `input_root` under `output_root`.
///
/// Stems are unique per output directory, ignoring case: `a.epub` and
/// `a.EPUB`, or `Dune: Messiah` and `Dune Messiah`, would otherwise share a
/// book directory. Later inputs get `-1`, `-2`, ... in input order.
pub fn plan_batch(inputs: &[PathBuf], input_root: &Path, output_root: &Path) -> Vec<BatchJob> {
    let mut used: HashMap<String, HashSet<String>> = HashMap::new();
    inputs
        .iter()
        .map(|input| {
            let relative_dir = input
                .strip_prefix(input_root)
                .ok()
                .and_then(Path::parent)
                .unwrap_or(Path::new(""));
            let taken = used
                .entry(relative_dir.to_string_lossy().to_lowercase())
                .or_default();
            let name = unique_name(format!("{}.md", sanitize_stem(input)), taken);
            let stem = name.strip_suffix(".md").unwrap_or(&name);
            BatchJob {
                input: input.clone(),
                output: book_path(&output_root.join(relative_dir), stem),
            }
        })
        .collect()
}

/// Start converting `jobs`, yielding each result as it completes.
///
/// The configuration and converter are checked first; a run-level problem is
/// returned as `Err` before any file is touched.
pub async fn convert_batch_stream(
    converter: Arc<dyn DocumentConverter>,
    jobs: Vec<BatchJob>,
    config: &ConversionConfig,
) -> Result<ResultStream, Epub2MdError> {
    config.validate()?;
    converter.check_available().await?;

    let abort = Arc::new(AtomicBool::new(false));
    let concurrency = config.concurrency;
    let config = config.clone();

    let s = stream::iter(jobs.into_iter().map(move |job| {
        let converter = Arc::clone(&converter);
        let abort = Arc::clone(&abort);
        let cfg = config.clone();
        async move {
            if abort.load(Ordering::SeqCst) {
                return ConversionResult::skipped(job.input);
            }
            let result = convert_file(converter.as_ref(), &job.input, &job.output, &cfg).await;
            if !result.success && cfg.fail_fast && !abort.swap(true, Ordering::SeqCst) {
                warn!("Stopping batch after failure of {}", job.input.display());
            }
            result
        }
    }))
    .buffer_unordered(concurrency);

    Ok(Box::pin(s))
}

/// Convert every job and return the aggregate tally.
///
/// Per-file failures never abort the run; they are counted and listed in
/// [`BatchReport::failures`].
pub async fn convert_batch(
    converter: Arc<dyn DocumentConverter>,
    jobs: Vec<BatchJob>,
    config: &ConversionConfig,
) -> Result<BatchReport, Epub2MdError> {
    let start = Instant::now();
    let total = jobs.len();
    info!("Starting batch of {} files (concurrency {})", total, config.concurrency);

    let mut results = convert_batch_stream(converter, jobs, config).await?;
    if let Some(ref cb) = config.progress_callback {
        cb.on_batch_start(total);
    }

    let mut report = BatchReport::default();
    while let Some(result) = results.next().await {
        report.record(result);
    }
    report.finish(start.elapsed().as_millis() as u64);

    if let Some(ref cb) = config.progress_callback {
        cb.on_batch_complete(total, report.succeeded);
    }
    info!(
        "Batch complete: {} succeeded, {} failed, {} skipped in {}ms",
        report.succeeded, report.failed, report.skipped, report.duration_ms
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_mirrors_relative_directories() {
        let inputs = vec![
            PathBuf::from("/lib/a.epub"),
            PathBuf::from("/lib/scifi/Dune.epub"),
        ];
        let jobs = plan_batch(&inputs, Path::new("/lib"), Path::new("/out"));
        assert_eq!(jobs[0].output, PathBuf::from("/out/a/a.md"));
        assert_eq!(jobs[1].output, PathBuf::from("/out/scifi/Dune/Dune.md"));
    }

    #[test]
    fn inputs_outside_root_land_at_top_level() {
        let jobs = plan_batch(&[PathBuf::from("/elsewhere/x.epub")], Path::new("/lib"), Path::new("/out"));
        assert_eq!(jobs[0].output, PathBuf::from("/out/x/x.md"));
    }

    #[test]
    fn colliding_stems_are_numbered() {
        let inputs = vec![
            PathBuf::from("/lib/a.EPUB"),
            PathBuf::from("/lib/a.epub"),
            PathBuf::from("/lib/Dune Messiah.epub"),
            PathBuf::from("/lib/Dune: Messiah.epub"),
            PathBuf::from("/lib/sub/a.epub"),
        ];
        let outputs: Vec<PathBuf> = plan_batch(&inputs, Path::new("/lib"), Path::new("/out"))
            .into_iter()
            .map(|j| j.output)
            .collect();
        assert_eq!(
            outputs,
            [
                "/out/a/a.md",
                "/out/a-1/a-1.md",
                "/out/Dune Messiah/Dune Messiah.md",
                "/out/Dune Messiah-1/Dune Messiah-1.md",
                "/out/sub/a/a.md",
            ]
            .map(PathBuf::from)
        );
    }
}
