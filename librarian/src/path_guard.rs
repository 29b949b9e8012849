//! Validates every path argument a tool call receives against the
//! [`AllowList`] before any other module sees it.
//!
//! `resolve` is the sole entry point. It canonicalizes the input (so a
//! symlink that targets outside every root is caught, not just a literal
//! `..` in the string) and rejects anything that doesn't land under a
//! configured root.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::allowlist::AllowList;
use crate::error::LibrarianError;

/// A path that has passed the guard: canonical, and known to live under
/// `root`.
#[derive(Debug, Clone)]
pub struct GuardedPath {
    pub canonical: PathBuf,
    pub root: PathBuf,
}

/// Resolve `input` against `allow`, rejecting anything that escapes the
/// allow-list.
///
/// Mirrors the contract in the design doc:
/// 1. empty/non-path input -> `InvalidArgument`
/// 2. make absolute relative to the process cwd, resolve `.`/`..`
/// 3. the canonicalized path (following symlinks) must land under a root
/// 4. non-existent paths (write targets that don't exist yet) are resolved
///    against their nearest existing ancestor so traversal is still caught
pub fn resolve(allow: &AllowList, input: &str) -> Result<GuardedPath, LibrarianError> {
    if input.trim().is_empty() {
        return Err(LibrarianError::invalid_argument("path must not be empty"));
    }

    let raw = PathBuf::from(input);
    let absolute = if raw.is_absolute() {
        raw
    } else {
        std::env::current_dir()
            .map_err(|e| LibrarianError::internal(format!("cannot read cwd: {e}")))?
            .join(raw)
    };

    let canonical = canonicalize_best_effort(&absolute)?;

    match allow.root_for(&canonical) {
        Some(root) => Ok(GuardedPath {
            canonical,
            root: root.to_path_buf(),
        }),
        None => Err(LibrarianError::path_not_in_allowlist(&canonical)),
    }
}

/// Like [`resolve`] but additionally probes that the target is writable
/// (or, for a path that doesn't exist yet, that its parent directory is).
pub fn resolve_for_write(allow: &AllowList, input: &str) -> Result<GuardedPath, LibrarianError> {
    let guarded = resolve(allow, input)?;
    probe_writable(&guarded.canonical)?;
    Ok(guarded)
}

fn probe_writable(path: &Path) -> Result<(), LibrarianError> {
    if path.exists() {
        return OpenOptions::new()
            .append(true)
            .open(path)
            .map(|_| ())
            .map_err(|e| {
                LibrarianError::permission_denied(format!(
                    "'{}' is not writable: {e}",
                    path.display()
                ))
            });
    }
    let parent = path
        .parent()
        .ok_or_else(|| LibrarianError::invalid_argument("path has no parent directory"))?;
    if !parent.exists() {
        // The caller (e.g. write_file, create_directory) is expected to
        // create missing parents; absence alone isn't a permission failure.
        return Ok(());
    }
    let probe = parent.join(format!(".librarian-write-probe-{}", std::process::id()));
    match OpenOptions::new().create(true).write(true).open(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            Ok(())
        }
        Err(e) => Err(LibrarianError::permission_denied(format!(
            "'{}' is not writable: {e}",
            parent.display()
        ))),
    }
}

/// Canonicalize `path`, walking up to the nearest existing ancestor if the
/// path itself (or a suffix of it) doesn't exist yet, then re-appending the
/// missing suffix. This lets write-intent tools (`write_file`,
/// `create_directory`) target paths that don't exist on disk while still
/// catching a `..` that would otherwise escape the allow-list.
fn canonicalize_best_effort(path: &Path) -> Result<PathBuf, LibrarianError> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }

    let mut missing = Vec::new();
    let mut current = path.to_path_buf();
    loop {
        match current.parent() {
            Some(parent) if parent != current => {
                missing.push(
                    current
                        .file_name()
                        .ok_or_else(|| LibrarianError::invalid_argument("invalid path"))?
                        .to_owned(),
                );
                current = parent.to_path_buf();
                if let Ok(canonical_parent) = current.canonicalize() {
                    let mut result = canonical_parent;
                    for component in missing.iter().rev() {
                        result.push(component);
                    }
                    return Ok(result);
                }
            }
            _ => {
                return Err(LibrarianError::invalid_argument(format!(
                    "no existing ancestor for '{}'",
                    path.display()
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn allow(dir: &Path) -> AllowList {
        AllowList::new(vec![dir.to_path_buf()]).unwrap()
    }

    #[test]
    fn rejects_empty_input() {
        let dir = TempDir::new().unwrap();
        let result = resolve(&allow(dir.path()), "");
        assert!(result.is_err());
    }

    #[test]
    fn accepts_descendant() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "").unwrap();
        let guarded = resolve(&allow(dir.path()), dir.path().join("a.py").to_str().unwrap())
            .expect("should resolve");
        assert_eq!(guarded.root, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn rejects_outside_root() {
        let dir = TempDir::new().unwrap();
        let result = resolve(&allow(dir.path()), "/etc/passwd");
        assert!(matches!(
            result.unwrap_err().kind,
            crate::error::ErrorKind::PermissionDenied
        ));
    }

    #[test]
    fn rejects_traversal_out_of_root() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let escape = sub.join("../../etc/passwd");
        let result = resolve(&allow(dir.path()), escape.to_str().unwrap());
        assert!(result.is_err());
    }

    #[test]
    fn allows_new_file_under_existing_dir() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("new_file.py");
        let guarded =
            resolve_for_write(&allow(dir.path()), target.to_str().unwrap()).expect("should resolve");
        assert_eq!(guarded.canonical.file_name().unwrap(), "new_file.py");
    }
}
