//! Directory walking shared by the index builder and the `search_files` /
//! `directory_tree` tools.
//!
//! Excludes the usual noise directories and anything the project itself
//! marks with a `.ai_ignore` file, and guards against symlink cycles the
//! same way the teacher's walker does: a `visited` set of canonicalized
//! directory paths, checked before descending.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "venv",
    ".venv",
    "env",
    "__pycache__",
    ".ai_reference",
];

/// True if `name` should be skipped entirely when walking a directory tree:
/// every dotdir (`.git`, `.venv`, ...) plus the fixed noise list above.
pub fn is_excluded_dir(name: &str) -> bool {
    name.starts_with('.') || EXCLUDED_DIRS.contains(&name)
}

/// Recursively collect every regular file under `root`, skipping excluded
/// directories, symlink cycles, and any directory containing an
/// `.ai_ignore` marker file. Returned paths are relative to `root`,
/// forward-slash separated, and sorted for deterministic output.
pub fn gather_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut visited = HashSet::new();
    walk(root, root, &mut visited, &mut files)?;
    files.sort();
    Ok(files)
}

fn walk(
    root: &Path,
    dir: &Path,
    visited: &mut HashSet<PathBuf>,
    out: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    let canonical = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !visited.insert(canonical) {
        return Ok(());
    }
    if dir.join(".ai_ignore").exists() {
        return Ok(());
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if file_type.is_dir() {
            if is_excluded_dir(&name) {
                continue;
            }
            walk(root, &path, visited, out)?;
        } else if file_type.is_symlink() {
            if let Ok(target) = path.canonicalize() {
                if target.is_dir() {
                    if is_excluded_dir(&name) {
                        continue;
                    }
                    walk(root, &path, visited, out)?;
                } else if target.is_file() {
                    push_relative(root, &path, out);
                }
            }
        } else if file_type.is_file() {
            push_relative(root, &path, out);
        }
    }
    Ok(())
}

fn push_relative(root: &Path, path: &Path, out: &mut Vec<PathBuf>) {
    if let Ok(rel) = path.strip_prefix(root) {
        out.push(rel.to_path_buf());
    }
}

/// Render a path's components with `/` regardless of platform, for storage
/// in JSON artifacts.
pub fn to_forward_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// A cheap binary-file heuristic: a NUL byte in the first 8 KiB, matching
/// the rule of thumb most text-oriented tools use.
pub fn is_probably_binary(bytes: &[u8]) -> bool {
    let probe_len = bytes.len().min(8192);
    bytes[..probe_len].contains(&0)
}

/// Modification time of `path` expressed as nanoseconds since the Unix
/// epoch, clamped to 0 on platforms/filesystems that can't report it.
pub fn mtime_nanos(path: &Path) -> std::io::Result<u128> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata.modified()?;
    Ok(modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn excludes_noise_dirs() {
        assert!(is_excluded_dir(".git"));
        assert!(is_excluded_dir("__pycache__"));
        assert!(is_excluded_dir(".venv"));
        assert!(!is_excluded_dir("src"));
    }

    #[test]
    fn gathers_files_sorted_and_skips_excluded() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("node_modules/junk.py"), "").unwrap();
        std::fs::write(dir.path().join("b.py"), "").unwrap();
        std::fs::write(dir.path().join("a.py"), "").unwrap();

        let files = gather_files(dir.path()).unwrap();
        assert_eq!(files, vec![PathBuf::from("a.py"), PathBuf::from("b.py")]);
    }

    #[test]
    fn honors_ai_ignore_marker() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("vendored");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join(".ai_ignore"), "").unwrap();
        std::fs::write(sub.join("skip.py"), "").unwrap();
        std::fs::write(dir.path().join("keep.py"), "").unwrap();

        let files = gather_files(dir.path()).unwrap();
        assert_eq!(files, vec![PathBuf::from("keep.py")]);
    }

    #[test]
    fn detects_binary_via_nul_byte() {
        assert!(is_probably_binary(b"hello\0world"));
        assert!(!is_probably_binary(b"hello world"));
    }
}
