//! Image reference resolution.
//!
//! The converter hands over image bytes keyed by the exact path string it
//! wrote into the Markdown (`/tmp/x/media/OEBPS/images/cover.jpg`). This
//! module gives each image a flat, unique file name under `extract_path`,
//! rewrites the matching references, and optionally shrinks the bytes.
//!
//! Nothing is written here; [`ImageResolution::assets`] is what the
//! orchestrator materialises.
//!
//! A reference with no matching asset is kept verbatim and reported as
//! [`ConversionWarning::AssetUnresolved`]. Remote and `data:` references are
//! not ours to resolve and are skipped silently.
//!
//! When images are not extracted, [`restore_archive_paths`] points the
//! references back at each asset's path inside the archive instead.

use crate::config::ImageOptions;
use crate::error::ConversionWarning;
use crate::pipeline::cleanup::{join_lines, split_lines, CodeFence};
use crate::pipeline::optimize::{ImageTransform, TransformOutcome};
use crate::pipeline::source::RawAsset;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

static RE_MD_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(!\[[^\]\n]*\]\(\s*)(<[^<>\n]*>|[^\s()<>]+)((?:\s+"[^"\n]*")?\s*\))"#).unwrap()
});

static RE_HTML_IMG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(<img\b[^>]*?\bsrc\s*=\s*)(?:"([^"\n]*)"|'([^'\n]*)')"#).unwrap()
});

static RE_UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]").unwrap());

static RE_SCHEME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:").unwrap());

/// A [`RawAsset`] with its final place in the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    /// The identifier the converter supplied.
    pub source_id: String,
    /// Path relative to the Markdown file, `/`-separated.
    pub path: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
    /// `true` when `bytes` came out of the image transform.
    pub optimized: bool,
}

/// Output of [`resolve_images`].
#[derive(Debug, Clone, Default)]
pub struct ImageResolution {
    pub markdown: String,
    /// One entry per image asset, in supply order; paths are unique.
    pub assets: Vec<ResolvedAsset>,
    pub warnings: Vec<ConversionWarning>,
    /// Local image references seen in the Markdown.
    pub references_found: usize,
    /// References left pointing at their original target.
    pub unresolved: usize,
}

/// Resolve every local image reference in `markdown` against `assets`.
///
/// Non-image assets (stylesheets, fonts) are ignored. Every image asset is
/// materialised whether or not it is referenced, so nothing the book ships
/// is dropped.
pub fn resolve_images(
    markdown: &str,
    assets: &[RawAsset],
    options: &ImageOptions,
    transform: &dyn ImageTransform,
) -> ImageResolution {
    let dir = options.extract_path.trim_end_matches('/');
    let mut used = HashSet::new();
    let mut by_id: HashMap<&str, String> = HashMap::new();
    let mut resolution = ImageResolution::default();

    for asset in assets.iter().filter(|a| a.is_image()) {
        if by_id.contains_key(asset.id.as_str()) {
            debug!("Duplicate asset id {}, keeping first", asset.id);
            continue;
        }
        let filename = unique_name(asset_filename(asset), &mut used);
        let path = format!("{dir}/{filename}");
        debug!("Asset {} → {}", asset.id, path);
        by_id.insert(asset.id.as_str(), path.clone());

        let (bytes, optimized) = if options.optimize {
            optimise(asset, options, transform, &mut resolution.warnings)
        } else {
            (asset.bytes.clone(), false)
        };

        resolution.assets.push(ResolvedAsset {
            source_id: asset.id.clone(),
            path,
            bytes,
            content_type: asset.content_type.clone(),
            optimized,
        });
    }

    rewrite_references(markdown, &by_id, &mut resolution);
    resolution
}

/// Point local image references at the archive-relative path of their asset
/// (`OEBPS/images/cover.jpg`) without materialising anything.
///
/// Used when image extraction is off: the converter's ids can name scratch
/// files that no longer exist once it returns.
pub fn restore_archive_paths(markdown: &str, assets: &[RawAsset]) -> ImageResolution {
    let mut by_id: HashMap<&str, String> = HashMap::new();
    for asset in assets.iter().filter(|a| a.is_image()) {
        by_id.entry(asset.id.as_str()).or_insert_with(|| asset.href.clone());
    }
    let mut resolution = ImageResolution::default();
    rewrite_references(markdown, &by_id, &mut resolution);
    resolution
}

/// Rewrite every local reference found in `by_id`, outside code, and tally
/// the rest into `resolution`.
fn rewrite_references(markdown: &str, by_id: &HashMap<&str, String>, resolution: &mut ImageResolution) {
    let mut unresolved_seen = HashSet::new();
    let mut rewrite = |target: &str| -> Option<String> {
        if is_external(target) {
            return None;
        }
        resolution.references_found += 1;
        if let Some(path) = by_id.get(target) {
            return Some(path.clone());
        }
        resolution.unresolved += 1;
        if unresolved_seen.insert(target.to_string()) {
            warn!("Image reference '{target}' has no matching asset");
            resolution.warnings.push(ConversionWarning::AssetUnresolved {
                reference: target.to_string(),
            });
        }
        None
    };

    let (lines, trailing) = split_lines(markdown);
    let mut fence = CodeFence::default();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for line in lines {
        if fence.is_code(line) {
            out.push(line.to_string());
            continue;
        }
        let line = RE_MD_IMAGE.replace_all(line, |caps: &Captures| {
            let raw = &caps[2];
            let target = raw.strip_prefix('<').and_then(|t| t.strip_suffix('>')).unwrap_or(raw);
            match rewrite(target) {
                Some(path) if path.contains(' ') => format!("{}<{path}>{}", &caps[1], &caps[3]),
                Some(path) => format!("{}{path}{}", &caps[1], &caps[3]),
                None => caps[0].to_string(),
            }
        });
        let line = RE_HTML_IMG.replace_all(&line, |caps: &Captures| {
            let target = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
            match rewrite(target) {
                Some(path) => format!("{}\"{path}\"", &caps[1]),
                None => caps[0].to_string(),
            }
        });
        out.push(line.into_owned());
    }

    resolution.markdown = join_lines(&out, trailing);
}

fn optimise(
    asset: &RawAsset,
    options: &ImageOptions,
    transform: &dyn ImageTransform,
    warnings: &mut Vec<ConversionWarning>,
) -> (Vec<u8>, bool) {
    match transform.fit_within(&asset.bytes, &asset.content_type, options.max_width, options.max_height) {
        Ok(TransformOutcome::Resized(bytes)) => (bytes, true),
        Ok(TransformOutcome::Unchanged) => (asset.bytes.clone(), false),
        Err(e) => {
            warn!("Could not optimise {}: {e}", asset.id);
            warnings.push(ConversionWarning::AssetOptimizeFailed {
                asset: asset.id.clone(),
                detail: e.to_string(),
            });
            (asset.bytes.clone(), false)
        }
    }
}

fn is_external(target: &str) -> bool {
    target.is_empty() || target.starts_with("//") || RE_SCHEME.is_match(target)
}

/// Flat, filesystem-safe file name for an asset.
fn asset_filename(asset: &RawAsset) -> String {
    let base = asset.id.rsplit(['/', '\\']).next().unwrap_or_default();
    let base = base.split(['?', '#']).next().unwrap_or_default();
    let mut name = RE_UNSAFE_CHARS
        .replace_all(base, "_")
        .trim_matches('.')
        .to_string();
    if name.is_empty() {
        name = "image".to_string();
    }
    if Path::new(&name).extension().is_none() {
        if let Some(ext) = extension_for(&asset.content_type) {
            name.push('.');
            name.push_str(ext);
        }
    }
    name
}

/// First-seen keeps the name; later ones get `-1`, `-2`, ... before the
/// extension. Comparison ignores case so the output also works on
/// case-insensitive filesystems.
pub(crate) fn unique_name(name: String, used: &mut HashSet<String>) -> String {
    if used.insert(name.to_lowercase()) {
        return name;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => name.split_at(i),
        _ => (name.as_str(), ""),
    };
    let mut n = 1;
    loop {
        let candidate = format!("{stem}-{n}{ext}");
        if used.insert(candidate.to_lowercase()) {
            return candidate;
        }
        n += 1;
    }
}

fn extension_for(content_type: &str) -> Option<&'static str> {
    match content_type.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/bmp" => Some("bmp"),
        "image/svg+xml" => Some("svg"),
        "image/tiff" => Some("tiff"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::optimize::TransformError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoTransform;

    impl ImageTransform for NoTransform {
        fn fit_within(&self, _: &[u8], _: &str, _: u32, _: u32) -> Result<TransformOutcome, TransformError> {
            Ok(TransformOutcome::Unchanged)
        }
    }

    struct Halve(AtomicUsize);

    impl ImageTransform for Halve {
        fn fit_within(&self, bytes: &[u8], _: &str, _: u32, _: u32) -> Result<TransformOutcome, TransformError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(TransformOutcome::Resized(bytes[..bytes.len() / 2].to_vec()))
        }
    }

    struct Broken;

    impl ImageTransform for Broken {
        fn fit_within(&self, _: &[u8], _: &str, _: u32, _: u32) -> Result<TransformOutcome, TransformError> {
            Err("decoder exploded".into())
        }
    }

    fn jpg(id: &str) -> RawAsset {
        RawAsset::new(id, vec![1, 2, 3, 4], "image/jpeg")
    }

    fn opts() -> ImageOptions {
        ImageOptions::default()
    }

    #[test]
    fn same_basename_gets_numbered_suffix_in_supply_order() {
        let md = "![a](OEBPS/a/cover.jpg)\n![b](OEBPS/b/cover.jpg)\n";
        let res = resolve_images(md, &[jpg("OEBPS/a/cover.jpg"), jpg("OEBPS/b/cover.jpg")], &opts(), &NoTransform);
        let paths: Vec<&str> = res.assets.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, ["images/cover.jpg", "images/cover-1.jpg"]);
        assert_eq!(res.markdown, "![a](images/cover.jpg)\n![b](images/cover-1.jpg)\n");
        assert!(res.warnings.is_empty());
    }

    #[test]
    fn collisions_ignore_case() {
        let res = resolve_images("", &[jpg("x/Pic.jpg"), jpg("y/pic.JPG")], &opts(), &NoTransform);
        assert_eq!(res.assets[0].path, "images/Pic.jpg");
        assert_eq!(res.assets[1].path, "images/pic-1.JPG");
    }

    #[test]
    fn unresolved_reference_is_kept_and_reported() {
        let md = "Before ![missing](OEBPS/nope.png) after\n";
        let res = resolve_images(md, &[], &opts(), &NoTransform);
        assert_eq!(res.markdown, md);
        assert_eq!(res.unresolved, 1);
        assert_eq!(
            res.warnings,
            [ConversionWarning::AssetUnresolved {
                reference: "OEBPS/nope.png".into()
            }]
        );
    }

    #[test]
    fn remote_references_are_not_counted() {
        let md = "![a](https://x.y/a.png) ![b](data:image/png;base64,AAAA)";
        let res = resolve_images(md, &[], &opts(), &NoTransform);
        assert_eq!(res.markdown, md);
        assert_eq!(res.references_found, 0);
        assert!(res.warnings.is_empty());
    }

    #[test]
    fn titles_angle_brackets_and_html_img_are_rewritten() {
        let md = "![c](<media/my cover.jpg> \"Cover\")\n<img src=\"media/fig.png\" alt=\"f\"/>";
        let assets = [
            jpg("media/my cover.jpg"),
            RawAsset::new("media/fig.png", vec![0], "image/png"),
        ];
        let res = resolve_images(md, &assets, &opts(), &NoTransform);
        assert_eq!(
            res.markdown,
            "![c](images/my_cover.jpg \"Cover\")\n<img src=\"images/fig.png\" alt=\"f\"/>"
        );
        assert_eq!(res.references_found, 2);
    }

    #[test]
    fn filenames_are_sanitised_and_get_extensions() {
        let res = resolve_images(
            "",
            &[
                RawAsset::new("OEBPS/img/fig 1 (a).png", vec![0], "image/png"),
                RawAsset::new("OEBPS/img/blob", vec![0], "image/gif"),
                RawAsset::new("OEBPS/img/", vec![0], "image/png"),
            ],
            &opts(),
            &NoTransform,
        );
        let paths: Vec<&str> = res.assets.iter().map(|a| a.path.as_str()).collect();
        assert_eq!(paths, ["images/fig_1__a_.png", "images/blob.gif", "images/image.png"]);
    }

    #[test]
    fn non_image_assets_are_ignored() {
        let res = resolve_images(
            "",
            &[RawAsset::new("OEBPS/style.css", b"p{}".to_vec(), "text/css")],
            &opts(),
            &NoTransform,
        );
        assert!(res.assets.is_empty());
    }

    #[test]
    fn optimisation_runs_only_when_enabled() {
        let halve = Halve(AtomicUsize::new(0));
        let res = resolve_images("", &[jpg("a.jpg")], &opts(), &halve);
        assert!(!res.assets[0].optimized);
        assert_eq!(halve.0.load(Ordering::SeqCst), 0);

        let enabled = ImageOptions { optimize: true, ..opts() };
        let res = resolve_images("", &[jpg("a.jpg")], &enabled, &halve);
        assert!(res.assets[0].optimized);
        assert_eq!(res.assets[0].bytes, [1, 2]);
    }

    #[test]
    fn failed_optimisation_falls_back_to_original_bytes() {
        let enabled = ImageOptions { optimize: true, ..opts() };
        let res = resolve_images("![x](a.jpg)", &[jpg("a.jpg")], &enabled, &Broken);
        assert_eq!(res.assets[0].bytes, [1, 2, 3, 4]);
        assert!(!res.assets[0].optimized);
        assert_eq!(res.markdown, "![x](images/a.jpg)");
        assert!(matches!(
            res.warnings.as_slice(),
            [ConversionWarning::AssetOptimizeFailed { asset, .. }] if asset == "a.jpg"
        ));
    }

    #[test]
    fn references_in_code_blocks_are_untouched() {
        let md = "```\n![x](a.jpg)\n```";
        let res = resolve_images(md, &[jpg("a.jpg")], &opts(), &NoTransform);
        assert_eq!(res.markdown, md);
        assert_eq!(res.references_found, 0);
    }

    #[test]
    fn archive_paths_restored_for_scratch_ids() {
        let md = "![Cover](/tmp/.tmpAb12/media/OEBPS/images/cover.jpg)\n![gone](/tmp/.tmpAb12/media/x.png)\n";
        let assets = [jpg("/tmp/.tmpAb12/media/OEBPS/images/cover.jpg").with_href("OEBPS/images/cover.jpg")];
        let res = restore_archive_paths(md, &assets);
        assert_eq!(
            res.markdown,
            "![Cover](OEBPS/images/cover.jpg)\n![gone](/tmp/.tmpAb12/media/x.png)\n"
        );
        assert!(res.assets.is_empty());
        assert_eq!((res.references_found, res.unresolved), (2, 1));
    }

    #[test]
    fn unique_names_number_case_insensitively() {
        let mut used = HashSet::new();
        let names: Vec<String> = ["a.md", "A.md", "Vol. 2.md", "vol. 2.md"]
            .into_iter()
            .map(|n| unique_name(n.to_string(), &mut used))
            .collect();
        assert_eq!(names, ["a.md", "A-1.md", "Vol. 2.md", "vol. 2-1.md"]);
    }
}
