//! Input validation and discovery.
//!
//! pandoc's error for a truncated or mislabelled archive is a wall of
//! Haskell exception text. Checking existence, permissions and the ZIP magic
//! bytes (`PK\x03\x04`) up front turns the common cases into precise errors
//! before the converter is ever spawned.

use crate::error::Epub2MdError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

/// Check that `path` is a readable file that starts like an EPUB container.
pub fn validate_source(path: &Path) -> Result<(), Epub2MdError> {
    if !path.is_file() {
        return Err(Epub2MdError::SourceNotFound {
            path: path.to_path_buf(),
        });
    }

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(Epub2MdError::PermissionDenied {
                path: path.to_path_buf(),
            });
        }
        Err(e) => {
            return Err(Epub2MdError::SourceUnreadable {
                path: path.to_path_buf(),
                detail: e.to_string(),
            });
        }
    };

    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) if magic == ZIP_MAGIC => {}
        Ok(()) => {
            return Err(Epub2MdError::NotAnArchive {
                path: path.to_path_buf(),
                magic,
            });
        }
        Err(_) => {
            return Err(Epub2MdError::SourceUnreadable {
                path: path.to_path_buf(),
                detail: "file is shorter than a ZIP header".to_string(),
            });
        }
    }

    debug!("Validated EPUB container: {}", path.display());
    Ok(())
}

/// Find `*.epub` files under `dir`, sorted by path.
///
/// Without `recursive` only the top level is scanned. Unreadable directory
/// entries are skipped.
pub fn discover_sources(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>, Epub2MdError> {
    if !dir.is_dir() {
        return Err(Epub2MdError::SourceNotFound {
            path: dir.to_path_buf(),
        });
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(max_depth)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| is_epub(p))
        .collect();
    found.sort();

    debug!("Discovered {} EPUB files under {}", found.len(), dir.display());
    Ok(found)
}

fn is_epub(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("epub"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_file_is_not_found() {
        let err = validate_source(Path::new("/definitely/not/here.epub")).unwrap_err();
        assert!(matches!(err, Epub2MdError::SourceNotFound { .. }));
    }

    #[test]
    fn non_zip_is_rejected_with_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.epub");
        fs::write(&path, b"%PDF-1.7 not an epub").unwrap();
        match validate_source(&path) {
            Err(Epub2MdError::NotAnArchive { magic, .. }) => assert_eq!(&magic, b"%PDF"),
            other => panic!("expected NotAnArchive, got {other:?}"),
        }
    }

    #[test]
    fn truncated_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.epub");
        fs::write(&path, b"PK").unwrap();
        assert!(matches!(
            validate_source(&path),
            Err(Epub2MdError::SourceUnreadable { .. })
        ));
    }

    #[test]
    fn zip_header_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.epub");
        fs::write(&path, b"PK\x03\x04rest-of-archive").unwrap();
        assert!(validate_source(&path).is_ok());
    }

    #[test]
    fn discovery_respects_recursion_flag() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("series/vol2")).unwrap();
        fs::write(dir.path().join("b.epub"), b"").unwrap();
        fs::write(dir.path().join("a.EPUB"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        fs::write(dir.path().join("series/vol2/c.epub"), b"").unwrap();

        let flat = discover_sources(dir.path(), false).unwrap();
        let names: Vec<String> = flat
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.EPUB", "b.epub"]);

        let deep = discover_sources(dir.path(), true).unwrap();
        assert_eq!(deep.len(), 3);
        assert!(deep.iter().any(|p| p.ends_with("series/vol2/c.epub")));
    }
}
