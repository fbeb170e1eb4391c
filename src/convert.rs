//! Single-file conversion: converter output → rendered document → disk.
//!
//! The work splits into a pure half and an I/O half:
//!
//! - [`render_document`] runs metadata extraction, cleanup, image resolution
//!   and front-matter synthesis entirely in memory. It is CPU-bound and runs
//!   in `spawn_blocking` from the async entry points.
//! - [`write_document`] materialises the images and the Markdown file, the
//!   latter atomically (temp file + rename) so an interrupted run never leaves
//!   a half-written book behind.
//!
//! Image resolution runs after cleanup because link repair can rewrite the
//! text an image caption sits in.

use crate::config::ConversionConfig;
use crate::error::Epub2MdError;
use crate::output::{ConversionResult, RenderedDocument};
use crate::pipeline::cleanup::clean_markdown_with_stats;
use crate::pipeline::frontmatter::render_frontmatter;
use crate::pipeline::images::{resolve_images, restore_archive_paths, ResolvedAsset};
use crate::pipeline::metadata::extract_metadata;
use crate::pipeline::optimize::{ImageTransform, RasterTransform};
use crate::pipeline::pandoc::PandocConverter;
use crate::pipeline::source::{DocumentConverter, RawDocument};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Convert one EPUB with pandoc, writing `<root>/<stem>/<stem>.md`.
///
/// `output_root` defaults to the directory containing `input`. Errors are
/// returned directly, including run-level ones such as pandoc being absent.
pub async fn convert(
    input: impl AsRef<Path>,
    output_root: Option<&Path>,
    config: &ConversionConfig,
) -> Result<ConversionResult, Epub2MdError> {
    config.validate()?;
    let input = input.as_ref();
    let converter = PandocConverter::new().with_timeout_secs(config.converter_timeout_secs);
    converter.check_available().await?;

    let root = match output_root {
        Some(root) => root.to_path_buf(),
        None => input.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    let output = output_path_for(input, &root);
    convert_to_file(&converter, input, &output, config).await
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    input: impl AsRef<Path>,
    output_root: Option<&Path>,
    config: &ConversionConfig,
) -> Result<ConversionResult, Epub2MdError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Epub2MdError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(convert(input, output_root, config))
}

/// Convert `input` with `converter` and write the Markdown to `output`.
///
/// Images go under `output`'s directory at `images.extract_path`.
pub async fn convert_to_file(
    converter: &dyn DocumentConverter,
    input: &Path,
    output: &Path,
    config: &ConversionConfig,
) -> Result<ConversionResult, Epub2MdError> {
    let start = Instant::now();
    info!("Converting {} → {}", input.display(), output.display());

    let raw = converter.convert(input).await?;
    debug!(
        "{} returned {} bytes, {} assets",
        converter.name(),
        raw.markdown.len(),
        raw.assets.len()
    );

    let source = input.to_path_buf();
    let cfg = config.clone();
    let rendered =
        tokio::task::spawn_blocking(move || render_document(raw, &source, &cfg, &RasterTransform))
            .await
            .map_err(|e| Epub2MdError::Internal(format!("render task panicked: {e}")))?;

    let images_written = write_document(&rendered, output, config).await?;
    let duration_ms = start.elapsed().as_millis() as u64;

    info!(
        "Wrote {} ({} images, {} warnings) in {}ms",
        output.display(),
        images_written,
        rendered.warnings.len(),
        duration_ms
    );

    Ok(ConversionResult {
        input: input.to_path_buf(),
        output: Some(output.to_path_buf()),
        success: true,
        error: None,
        skipped: false,
        title: Some(rendered.metadata.title().to_string()),
        images_found: rendered.images_found,
        images_written,
        images_unresolved: rendered.images_unresolved,
        images_optimized: rendered.assets.iter().filter(|a| a.optimized).count(),
        cleanup: rendered.cleanup,
        warnings: rendered.warnings,
        duration_ms,
    })
}

/// Like [`convert_to_file`], but a failure becomes a failed
/// [`ConversionResult`] instead of an `Err`, and progress callbacks fire.
///
/// This is the per-file unit of a batch: nothing it does can stop a sibling.
pub async fn convert_file(
    converter: &dyn DocumentConverter,
    input: &Path,
    output: &Path,
    config: &ConversionConfig,
) -> ConversionResult {
    let start = Instant::now();
    if let Some(ref cb) = config.progress_callback {
        cb.on_file_start(input);
    }

    match convert_to_file(converter, input, output, config).await {
        Ok(result) => {
            if let Some(ref cb) = config.progress_callback {
                cb.on_file_complete(input, output, result.images_written);
            }
            result
        }
        Err(e) => {
            warn!("Failed to convert {}: {}", input.display(), e);
            if let Some(ref cb) = config.progress_callback {
                cb.on_file_error(input, &e.to_string());
            }
            ConversionResult::failed(
                input.to_path_buf(),
                Some(output.to_path_buf()),
                &e,
                start.elapsed().as_millis() as u64,
            )
        }
    }
}

/// Metadata → cleanup → images → front-matter, all in memory.
pub fn render_document(
    raw: RawDocument,
    source: &Path,
    config: &ConversionConfig,
    transform: &dyn ImageTransform,
) -> RenderedDocument {
    let (metadata, mut warnings) = extract_metadata(&raw.metadata, source);
    for w in &warnings {
        warn!("{}: {}", source.display(), w);
    }

    let (body, cleanup) = clean_markdown_with_stats(&raw.markdown, &config.cleanup);
    debug!("{}: cleanup {:?}", source.display(), cleanup);

    let resolution = if config.extract_images {
        resolve_images(&body, &raw.assets, &config.images, transform)
    } else {
        restore_archive_paths(&body, &raw.assets)
    };
    warnings.extend(resolution.warnings);
    let body = resolution.markdown;

    let markdown = if config.frontmatter.add {
        let header = render_frontmatter(&metadata, &config.frontmatter.custom_fields);
        if body.trim().is_empty() {
            header
        } else {
            format!("{header}\n{body}")
        }
    } else {
        body
    };

    RenderedDocument {
        markdown,
        metadata,
        assets: resolution.assets,
        warnings,
        images_found: resolution.references_found,
        images_unresolved: resolution.unresolved,
        cleanup,
    }
}

/// Write the images, then the Markdown, under `output`'s directory.
///
/// Returns the number of images written.
pub async fn write_document(
    doc: &RenderedDocument,
    output: &Path,
    config: &ConversionConfig,
) -> Result<usize, Epub2MdError> {
    let book_dir = output.parent().unwrap_or(Path::new(""));

    for asset in &doc.assets {
        let path = asset_path(book_dir, asset);
        let (target, bytes) = (path.as_path(), asset.bytes.as_slice());
        with_retries(config, target, || async move {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(target, bytes).await
        })
        .await?;
        debug!("Wrote image {}", path.display());
    }

    let contents = doc.markdown.as_bytes();
    with_retries(config, output, || async move {
        if !book_dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(book_dir).await?;
        }
        write_atomic(output, contents).await
    })
    .await?;

    Ok(doc.assets.len())
}

fn asset_path(book_dir: &Path, asset: &ResolvedAsset) -> PathBuf {
    asset
        .path
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .fold(book_dir.to_path_buf(), |p, c| p.join(c))
}

/// Write through a uniquely named temp file in the target directory, then
/// rename over `path`. The temp file is removed if anything fails.
async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let path = path.to_path_buf();
    let contents = contents.to_vec();
    tokio::task::spawn_blocking(move || {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".epub2md-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(&contents)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Run `op`, retrying transient failures with exponential backoff
/// (`retry_backoff_ms × 2^(attempt−1)`), at most `io_retries` extra times.
async fn with_retries<F, Fut>(
    config: &ConversionConfig,
    path: &Path,
    mut op: F,
) -> Result<(), Epub2MdError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    let mut attempt = 0u32;
    loop {
        let Err(source) = op().await else {
            return Ok(());
        };
        let err = Epub2MdError::OutputWriteFailed {
            path: path.to_path_buf(),
            source,
        };
        if attempt >= config.io_retries || !err.is_transient() {
            return Err(err);
        }
        attempt += 1;
        let delay = config.retry_backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
        warn!(
            "{err}; retry {attempt}/{} in {delay}ms",
            config.io_retries
        );
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
}

/// `<root>/<stem>/<stem>.md` for an input file.
pub fn output_path_for(input: &Path, output_root: &Path) -> PathBuf {
    book_path(output_root, &sanitize_stem(input))
}

pub(crate) fn book_path(output_root: &Path, stem: &str) -> PathBuf {
    output_root.join(stem).join(format!("{stem}.md"))
}

/// File stem made safe as a directory name: path and shell metacharacters
/// removed, whitespace runs collapsed. Falls back to `output`.
pub fn sanitize_stem(input: &Path) -> String {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') && !c.is_control())
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches('.');
    if trimmed.is_empty() {
        "output".to_string()
    } else {
        trimmed.to_string()
    }
}
