//! The process-wide set of directory roots a client may read or write.
//!
//! Built once at startup from configuration, CLI arguments, or an
//! environment variable (see [`crate::config`]) and never mutated again —
//! no lock is needed to read it.

use std::path::{Path, PathBuf};

use crate::error::LibrarianError;

/// An immutable set of canonical directory roots.
#[derive(Debug, Clone)]
pub struct AllowList {
    roots: Vec<PathBuf>,
}

impl AllowList {
    /// Canonicalize every root and build the list. Roots that don't exist
    /// on disk yet are rejected — the allow-list names real directories.
    pub fn new(roots: Vec<PathBuf>) -> Result<Self, LibrarianError> {
        if roots.is_empty() {
            return Err(LibrarianError::invalid_argument(
                "at least one allow-list root is required",
            ));
        }
        let mut canonical = Vec::with_capacity(roots.len());
        for root in roots {
            let resolved = root.canonicalize().map_err(|e| {
                LibrarianError::invalid_argument(format!(
                    "allow-list root '{}' does not resolve: {e}",
                    root.display()
                ))
            })?;
            if !resolved.is_dir() {
                return Err(LibrarianError::invalid_argument(format!(
                    "allow-list root '{}' is not a directory",
                    resolved.display()
                )));
            }
            canonical.push(resolved);
        }
        Ok(Self { roots: canonical })
    }

    /// The canonical roots, in the order they were configured.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// True if `path` is equal to, or a descendant of, at least one root.
    /// `path` must already be canonicalized — this performs no I/O.
    pub fn contains(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }

    /// The root `path` resolves under, if any.
    pub fn root_for(&self, path: &Path) -> Option<&Path> {
        self.roots
            .iter()
            .find(|root| path.starts_with(root))
            .map(PathBuf::as_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rejects_empty_list() {
        assert!(AllowList::new(vec![]).is_err());
    }

    #[test]
    fn rejects_nonexistent_root() {
        let err = AllowList::new(vec![PathBuf::from("/does/not/exist/hopefully")]).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn contains_descendants_only() {
        let dir = TempDir::new().unwrap();
        let allow = AllowList::new(vec![dir.path().to_path_buf()]).unwrap();
        let inside = dir.path().join("src/main.rs");
        assert!(allow.contains(&inside));
        assert!(!allow.contains(Path::new("/etc/passwd")));
    }
}
