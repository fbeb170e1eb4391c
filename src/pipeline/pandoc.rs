//! [`DocumentConverter`] backed by the `pandoc` executable.
//!
//! Two pandoc runs per book:
//!
//! 1. `--to=markdown --extract-media=<tmp>/media` for the body. pandoc writes
//!    every embedded file under the media directory and references it in the
//!    Markdown by that exact path, which becomes the [`RawAsset`] id. The
//!    path below the media directory is the file's place in the archive and
//!    becomes its `href`.
//! 2. `--to=plain --template=<tmp>/meta.tpl` with a template that is just
//!    `$meta-json$`, which prints the package metadata as JSON.
//!
//! Both runs are bounded by the configured timeout and killed if it expires.
//! A non-zero exit means pandoc could not read the archive; that is never
//! retried.

use crate::error::Epub2MdError;
use crate::pipeline::input;
use crate::pipeline::source::{DocumentConverter, RawAsset, RawDocument, RawMetadata};
use async_trait::async_trait;
use serde_json::Value;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const META_TEMPLATE: &str = "$meta-json$\n";

const INSTALL_HINT: &str = "Install pandoc (https://pandoc.org/installing.html) \
                            or pass its location with --pandoc.";

/// Runs `pandoc` as a child process.
#[derive(Debug, Clone)]
pub struct PandocConverter {
    program: PathBuf,
    timeout: Duration,
}

impl Default for PandocConverter {
    fn default() -> Self {
        Self {
            program: PathBuf::from("pandoc"),
            timeout: Duration::from_secs(300),
        }
    }
}

impl PandocConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific pandoc binary instead of the one on `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs.max(1));
        self
    }

    fn unavailable(&self, detail: impl std::fmt::Display) -> Epub2MdError {
        Epub2MdError::ConverterUnavailable {
            tool: self.program.display().to_string(),
            hint: format!("{detail}\n{INSTALL_HINT}"),
        }
    }

    /// Run pandoc on `source` and return its stdout.
    async fn run(&self, source: &Path, args: &[OsString]) -> Result<String, Epub2MdError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).arg(source).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => {
                return Err(Epub2MdError::ConverterTimeout {
                    path: source.to_path_buf(),
                    secs: self.timeout.as_secs(),
                })
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(self.unavailable(e));
            }
            Ok(Err(e)) => {
                return Err(Epub2MdError::Internal(format!(
                    "failed to spawn {}: {e}",
                    self.program.display()
                )))
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Epub2MdError::SourceUnreadable {
                path: source.to_path_buf(),
                detail: format!("pandoc exited with {}: {}", output.status, stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DocumentConverter for PandocConverter {
    fn name(&self) -> &str {
        "pandoc"
    }

    async fn check_available(&self) -> Result<(), Epub2MdError> {
        let output = Command::new(&self.program)
            .arg("--version")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.unavailable(e))?;

        if !output.status.success() {
            return Err(self.unavailable(format!("`--version` exited with {}", output.status)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = stdout.lines().next().unwrap_or("pandoc (unknown version)");
        info!("Using {version}");
        Ok(())
    }

    async fn convert(&self, source: &Path) -> Result<RawDocument, Epub2MdError> {
        input::validate_source(source)?;

        let workdir = TempDir::new().map_err(|e| Epub2MdError::Internal(format!("tempdir: {e}")))?;
        let media_dir = workdir.path().join("media");
        let template = workdir.path().join("meta.tpl");
        tokio::fs::write(&template, META_TEMPLATE)
            .await
            .map_err(|e| Epub2MdError::Internal(format!("metadata template: {e}")))?;

        let mut extract_media = OsString::from("--extract-media=");
        extract_media.push(media_dir.as_os_str());
        let markdown = self
            .run(
                source,
                &[
                    "--from=epub".into(),
                    "--to=markdown".into(),
                    "--wrap=none".into(),
                    extract_media,
                ],
            )
            .await?;

        let mut template_arg = OsString::from("--template=");
        template_arg.push(template.as_os_str());
        let meta_json = self
            .run(source, &["--from=epub".into(), "--to=plain".into(), template_arg])
            .await?;

        let metadata = match flatten_metadata(&meta_json) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Ignoring unparseable metadata from {}: {e}", source.display());
                RawMetadata::new()
            }
        };

        let assets = tokio::task::spawn_blocking(move || collect_media(&media_dir))
            .await
            .map_err(|e| Epub2MdError::Internal(format!("media scan task: {e}")))??;

        debug!(
            "pandoc produced {} bytes of Markdown, {} metadata fields, {} assets",
            markdown.len(),
            metadata.len(),
            assets.len()
        );

        Ok(RawDocument {
            markdown,
            metadata,
            assets,
        })
    }
}

/// Flatten pandoc's `$meta-json$` output into ordered key/value pairs.
///
/// Lists repeat the key; `{"text": ..}` objects contribute their text, and an
/// identifier's `scheme` is folded into the key as `identifier:<scheme>`.
pub fn flatten_metadata(json: &str) -> Result<RawMetadata, serde_json::Error> {
    let root: serde_json::Map<String, Value> = serde_json::from_str(json.trim())?;
    let mut meta = RawMetadata::new();
    for (key, value) in &root {
        flatten_value(&mut meta, key, value);
    }
    Ok(meta)
}

fn flatten_value(meta: &mut RawMetadata, key: &str, value: &Value) {
    match value {
        Value::String(s) => meta.push(key, s.as_str()),
        Value::Number(n) => meta.push(key, n.to_string()),
        Value::Bool(b) => meta.push(key, b.to_string()),
        Value::Array(items) => {
            for item in items {
                flatten_value(meta, key, item);
            }
        }
        Value::Object(obj) => {
            let Some(text) = obj.get("text") else {
                return;
            };
            match obj.get("scheme").and_then(Value::as_str) {
                Some(scheme) if key == "identifier" => {
                    flatten_value(meta, &format!("identifier:{scheme}"), text)
                }
                _ => flatten_value(meta, key, text),
            }
        }
        Value::Null => {}
    }
}

/// Every file pandoc extracted, in path order.
///
/// The id is the absolute path pandoc wrote into the Markdown; the href is
/// the same file relative to `media_dir`.
fn collect_media(media_dir: &Path) -> Result<Vec<RawAsset>, Epub2MdError> {
    if !media_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = WalkDir::new(media_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let bytes = std::fs::read(&path).map_err(|e| {
                Epub2MdError::Internal(format!("reading extracted media {}: {e}", path.display()))
            })?;
            let content_type = content_type_for(&path);
            let href = path
                .strip_prefix(media_dir)
                .unwrap_or(&path)
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            Ok(RawAsset::new(path.to_string_lossy(), bytes, content_type).with_href(href))
        })
        .collect()
}

fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "tif" | "tiff" => "image/tiff",
        "css" => "text/css",
        "ttf" | "otf" => "font/otf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(meta: &RawMetadata) -> Vec<(String, String)> {
        meta.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn flattens_strings_lists_and_text_objects() {
        let json = r#"{
            "title": "Dune",
            "creator": [{"role": "aut", "text": "Frank Herbert"}, "Brian Herbert"],
            "identifier": [{"scheme": "ISBN", "text": "9780441013593"}, {"text": "urn:uuid:42"}],
            "language": "en",
            "cover-image": null,
            "page-progression-direction": true
        }"#;
        let meta = flatten_metadata(json).unwrap();
        let expected: Vec<(String, String)> = [
            ("title", "Dune"),
            ("creator", "Frank Herbert"),
            ("creator", "Brian Herbert"),
            ("identifier:ISBN", "9780441013593"),
            ("identifier", "urn:uuid:42"),
            ("language", "en"),
            ("page-progression-direction", "true"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(pairs(&meta), expected);
    }

    #[test]
    fn empty_metadata_is_fine() {
        assert!(flatten_metadata("{}\n").unwrap().is_empty());
    }

    #[test]
    fn non_object_metadata_is_an_error() {
        assert!(flatten_metadata("[1,2]").is_err());
        assert!(flatten_metadata("").is_err());
    }

    #[test]
    fn media_is_collected_with_exact_paths() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("OEBPS/images");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("cover.JPG"), [0xFF, 0xD8]).unwrap();
        std::fs::write(dir.path().join("OEBPS/style.css"), "p{}").unwrap();

        let assets = collect_media(dir.path()).unwrap();
        assert_eq!(assets.len(), 2);
        let cover = assets.iter().find(|a| a.is_image()).unwrap();
        assert_eq!(cover.id, images.join("cover.JPG").to_string_lossy());
        assert_eq!(cover.href, "OEBPS/images/cover.JPG");
        assert_eq!(cover.content_type, "image/jpeg");
        assert_eq!(cover.bytes, [0xFF, 0xD8]);
    }

    #[test]
    fn missing_media_dir_means_no_assets() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_media(&dir.path().join("media")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let converter = PandocConverter::new().with_program("/nonexistent/pandoc-binary");
        let err = converter.check_available().await.unwrap_err();
        assert!(err.is_run_fatal(), "{err}");
    }

    #[tokio::test]
    async fn invalid_source_fails_before_spawning() {
        let converter = PandocConverter::new().with_program("/nonexistent/pandoc-binary");
        let err = converter.convert(Path::new("/no/such/book.epub")).await.unwrap_err();
        assert!(matches!(err, Epub2MdError::SourceNotFound { .. }));
    }
}
