//! Path resolution against the allowed root set.

use std::path::{Path, PathBuf};

use crate::error::ScanError;

/// Resolve a scan path: it must exist, be a regular file, and (when roots
/// are configured) resolve under one of the allowed roots after symlink
/// canonicalization.
pub fn resolve(path: &Path, allowed_roots: &[PathBuf]) -> Result<PathBuf, ScanError> {
    let resolved = path
        .canonicalize()
        .map_err(|_| ScanError::NotFound(path.to_path_buf()))?;
    if !resolved.is_file() {
        return Err(ScanError::NotFound(path.to_path_buf()));
    }
    if allowed_roots.is_empty() {
        return Ok(resolved);
    }
    for root in allowed_roots {
        let Ok(root) = root.canonicalize() else {
            continue;
        };
        if resolved.starts_with(&root) {
            return Ok(resolved);
        }
    }
    Err(ScanError::Forbidden(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_path_is_not_found() {
        let dir = TempDir::new().unwrap();
        let result = resolve(&dir.path().join("nope.png"), &[]);
        assert!(matches!(result, Err(ScanError::NotFound(_))));
    }

    #[test]
    fn test_no_roots_allows_any_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.png");
        std::fs::write(&file, b"data").unwrap();
        assert!(resolve(&file, &[]).is_ok());
    }

    #[test]
    fn test_outside_roots_is_forbidden() {
        let root = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let file = elsewhere.path().join("a.png");
        std::fs::write(&file, b"data").unwrap();
        let result = resolve(&file, &[root.path().to_path_buf()]);
        assert!(matches!(result, Err(ScanError::Forbidden(_))));
    }

    #[test]
    fn test_inside_roots_is_allowed() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("a.png");
        std::fs::write(&file, b"data").unwrap();
        assert!(resolve(&file, &[root.path().to_path_buf()]).is_ok());
    }

    #[test]
    fn test_directory_is_not_found() {
        let root = TempDir::new().unwrap();
        let result = resolve(root.path(), &[]);
        assert!(matches!(result, Err(ScanError::NotFound(_))));
    }
}
