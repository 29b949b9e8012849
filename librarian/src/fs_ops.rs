//! Scoped filesystem tools. Every entry point takes a [`GuardedPath`] (or a
//! raw string resolved via [`crate::path_guard`] by the caller) rather than
//! a bare `Path`, so nothing in this module can be reached without first
//! passing the allow-list check.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

use crate::allowlist::AllowList;
use crate::error::{LibrarianError, LibrarianResult};
use crate::fs_walk;
use crate::index;
use crate::path_guard::{self, GuardedPath};

pub fn read_file(allow: &AllowList, path: &str) -> LibrarianResult<String> {
    let guarded = path_guard::resolve(allow, path)?;
    let bytes = std::fs::read(&guarded.canonical)?;
    if fs_walk::is_probably_binary(&bytes) {
        return Ok(format!("binary file, {} bytes", bytes.len()));
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[derive(Serialize)]
pub struct ReadManyResult {
    pub path: String,
    pub content: Option<String>,
    pub error: Option<String>,
}

pub fn read_multiple_files(allow: &AllowList, paths: &[String]) -> Vec<ReadManyResult> {
    paths
        .iter()
        .map(|p| match read_file(allow, p) {
            Ok(content) => ReadManyResult {
                path: p.clone(),
                content: Some(content),
                error: None,
            },
            Err(e) => ReadManyResult {
                path: p.clone(),
                content: None,
                error: Some(e.message),
            },
        })
        .collect()
}

pub fn write_file(allow: &AllowList, path: &str, content: &str) -> LibrarianResult<()> {
    let guarded = path_guard::resolve_for_write(allow, path)?;
    if let Some(parent) = guarded.canonical.parent() {
        std::fs::create_dir_all(parent)?;
    }
    index::atomic_write(&guarded.canonical, content.as_bytes())
}

#[derive(Clone, Debug)]
pub struct Edit {
    pub old_text: String,
    pub new_text: String,
}

pub struct EditOutcome {
    pub diff: String,
    pub applied: bool,
}

/// Apply `edits` in order to an in-memory copy of the file's contents; each
/// `old_text` must match exactly once against the *current* buffer (i.e.
/// after prior edits in the same call have been applied). Writes atomically
/// unless `dry_run`.
pub fn edit_file(allow: &AllowList, path: &str, edits: &[Edit], dry_run: bool) -> LibrarianResult<EditOutcome> {
    let guarded = path_guard::resolve_for_write(allow, path)?;
    let original = std::fs::read_to_string(&guarded.canonical)?;
    let mut buffer = original.clone();

    for edit in edits {
        let occurrences = buffer.matches(edit.old_text.as_str()).count();
        match occurrences {
            0 => return Err(LibrarianError::edit_not_found(&edit.old_text)),
            1 => {
                buffer = buffer.replacen(&edit.old_text, &edit.new_text, 1);
            }
            n => return Err(LibrarianError::edit_ambiguous(&edit.old_text, n)),
        }
    }

    let diff = similar::TextDiff::from_lines(&original, &buffer)
        .unified_diff()
        .context_radius(3)
        .header(path, path)
        .to_string();

    if !dry_run {
        index::atomic_write(&guarded.canonical, buffer.as_bytes())?;
    }

    Ok(EditOutcome { diff, applied: !dry_run })
}

pub fn create_directory(allow: &AllowList, path: &str) -> LibrarianResult<()> {
    let guarded = path_guard::resolve_for_write(allow, path)?;
    std::fs::create_dir_all(&guarded.canonical)?;
    Ok(())
}

#[derive(Clone, Debug, Serialize)]
pub struct DirEntryTag {
    pub name: String,
    pub is_dir: bool,
}

pub fn list_directory(allow: &AllowList, path: &str) -> LibrarianResult<Vec<DirEntryTag>> {
    let guarded = path_guard::resolve(allow, path)?;
    let mut entries: Vec<DirEntryTag> = std::fs::read_dir(&guarded.canonical)?
        .filter_map(|e| e.ok())
        .map(|e| DirEntryTag {
            name: e.file_name().to_string_lossy().into_owned(),
            is_dir: e.file_type().map(|t| t.is_dir()).unwrap_or(false),
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

#[derive(Clone, Debug, Serialize)]
pub struct TreeNode {
    pub name: String,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

pub fn directory_tree(allow: &AllowList, path: &str, max_depth: Option<usize>) -> LibrarianResult<TreeNode> {
    let guarded = path_guard::resolve(allow, path)?;
    build_tree(&guarded.canonical, 0, max_depth)
}

fn build_tree(dir: &Path, depth: usize, max_depth: Option<usize>) -> LibrarianResult<TreeNode> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string());
    let mut children = Vec::new();

    if max_depth.is_none_or(|max| depth < max) {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let entry_name = entry.file_name().to_string_lossy().into_owned();
            if entry_name.starts_with('.') || entry_name == "__pycache__" {
                continue;
            }
            let file_type = entry.file_type().map_err(LibrarianError::from)?;
            if file_type.is_dir() {
                children.push(build_tree(&entry.path(), depth + 1, max_depth)?);
            } else {
                children.push(TreeNode {
                    name: entry_name,
                    is_dir: false,
                    children: Vec::new(),
                });
            }
        }
    }

    Ok(TreeNode {
        name,
        is_dir: true,
        children,
    })
}

pub fn move_file(allow: &AllowList, source: &str, destination: &str, allow_cross_device: bool) -> LibrarianResult<()> {
    let src = path_guard::resolve(allow, source)?;
    let dest = path_guard::resolve_for_write(allow, destination)?;
    if dest.canonical.exists() {
        return Err(LibrarianError::already_exists(format!(
            "'{}' already exists",
            dest.canonical.display()
        )));
    }
    if let Some(parent) = dest.canonical.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(&src.canonical, &dest.canonical) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) && allow_cross_device => {
            std::fs::copy(&src.canonical, &dest.canonical)?;
            std::fs::remove_file(&src.canonical)?;
            Ok(())
        }
        Err(e) if is_cross_device(&e) => Err(LibrarianError::invalid_argument(
            "cross-device move rejected; enable allow_cross_device_move to permit a copy+unlink fallback",
        )),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn is_cross_device(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(e: &std::io::Error) -> bool {
    // std::io::ErrorKind::CrossesDevices is unstable; rename() on Windows
    // surfaces a generic Other error for cross-volume moves, so treat any
    // non-NotFound/PermissionDenied rename failure as a candidate for the
    // copy+unlink fallback.
    !matches!(
        e.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
    )
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub is_dir: bool,
}

/// Case-insensitive substring match on file/directory names. Entries whose
/// directory name contains any `exclude_patterns` substring are pruned
/// before recursing.
pub fn search_files(
    allow: &AllowList,
    path: &str,
    pattern: &str,
    exclude_patterns: &[String],
) -> LibrarianResult<Vec<SearchHit>> {
    let guarded = path_guard::resolve(allow, path)?;
    let needle = pattern.to_lowercase();
    let excludes: Vec<String> = exclude_patterns.iter().map(|s| s.to_lowercase()).collect();
    let mut hits = Vec::new();
    walk_search(&guarded.canonical, &guarded.canonical, &needle, &excludes, &mut hits)?;
    hits.sort_by(|a: &SearchHit, b: &SearchHit| a.path.cmp(&b.path));
    Ok(hits)
}

fn walk_search(
    root: &Path,
    dir: &Path,
    needle: &str,
    excludes: &[String],
    out: &mut Vec<SearchHit>,
) -> LibrarianResult<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let lower = name.to_lowercase();
        let file_type = entry.file_type().map_err(LibrarianError::from)?;

        if file_type.is_dir() {
            if excludes.iter().any(|pat| lower.contains(pat.as_str())) || fs_walk::is_excluded_dir(&name) {
                continue;
            }
            if lower.contains(needle) {
                out.push(SearchHit {
                    path: fs_walk::to_forward_slash(entry.path().strip_prefix(root).unwrap_or(&entry.path())),
                    is_dir: true,
                });
            }
            walk_search(root, &entry.path(), needle, excludes, out)?;
        } else if lower.contains(needle) {
            out.push(SearchHit {
                path: fs_walk::to_forward_slash(entry.path().strip_prefix(root).unwrap_or(&entry.path())),
                is_dir: false,
            });
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Serialize)]
pub struct FileInfo {
    pub size_bytes: u64,
    pub human_size: String,
    pub is_dir: bool,
    pub modified_unix: Option<i64>,
    pub accessed_unix: Option<i64>,
    pub created_unix: Option<i64>,
    #[cfg(unix)]
    pub mode: u32,
}

pub fn get_file_info(allow: &AllowList, path: &str) -> LibrarianResult<FileInfo> {
    let guarded = path_guard::resolve(allow, path)?;
    let metadata = std::fs::metadata(&guarded.canonical)?;
    Ok(FileInfo {
        size_bytes: metadata.len(),
        human_size: human_readable_size(metadata.len()),
        is_dir: metadata.is_dir(),
        modified_unix: to_unix_seconds(metadata.modified().ok()),
        accessed_unix: to_unix_seconds(metadata.accessed().ok()),
        created_unix: to_unix_seconds(metadata.created().ok()),
        #[cfg(unix)]
        mode: {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode()
        },
    })
}

fn to_unix_seconds(time: Option<SystemTime>) -> Option<i64> {
    time.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

fn human_readable_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[0])
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

pub fn list_allowed_directories(allow: &AllowList) -> Vec<PathBuf> {
    allow.roots().to_vec()
}

pub fn guard(allow: &AllowList, path: &str) -> LibrarianResult<GuardedPath> {
    path_guard::resolve(allow, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn allow(dir: &Path) -> AllowList {
        AllowList::new(vec![dir.to_path_buf()]).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let allow = allow(dir.path());
        let target = dir.path().join("out.py");
        write_file(&allow, target.to_str().unwrap(), "print(1)\n").unwrap();
        let content = read_file(&allow, target.to_str().unwrap()).unwrap();
        assert_eq!(content, "print(1)\n");
    }

    #[test]
    fn edit_requires_exactly_one_match() {
        let dir = TempDir::new().unwrap();
        let allow = allow(dir.path());
        let target = dir.path().join("a.py");
        std::fs::write(&target, "x = 1\ny = x\nz = x\n").unwrap();

        let err = edit_file(
            &allow,
            target.to_str().unwrap(),
            &[Edit {
                old_text: "x".into(),
                new_text: "w".into(),
            }],
            false,
        )
        .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::EditAmbiguous);
    }

    #[test]
    fn edit_dry_run_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let allow = allow(dir.path());
        let target = dir.path().join("a.py");
        std::fs::write(&target, "class A: pass\n").unwrap();

        let outcome = edit_file(
            &allow,
            target.to_str().unwrap(),
            &[Edit {
                old_text: "class A: pass".into(),
                new_text: "class A:\n    def m(self): pass".into(),
            }],
            true,
        )
        .unwrap();
        assert!(!outcome.applied);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "class A: pass\n");
    }

    #[test]
    fn second_identical_edit_fails_not_found() {
        let dir = TempDir::new().unwrap();
        let allow = allow(dir.path());
        let target = dir.path().join("a.py");
        std::fs::write(&target, "foo\n").unwrap();
        let edit = Edit {
            old_text: "foo".into(),
            new_text: "bar".into(),
        };
        edit_file(&allow, target.to_str().unwrap(), std::slice::from_ref(&edit), false).unwrap();
        let err = edit_file(&allow, target.to_str().unwrap(), std::slice::from_ref(&edit), false).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::EditNotFound);
    }

    #[test]
    fn search_files_matches_case_insensitively() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Needle.py"), "").unwrap();
        std::fs::write(dir.path().join("other.py"), "").unwrap();
        let hits = search_files(&allow(dir.path()), dir.path().to_str().unwrap(), "needle", &[]).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "Needle.py");
    }

    #[test]
    fn directory_tree_hides_dunders_and_dotdirs() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("__pycache__")).unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("a.py"), "").unwrap();
        let tree = directory_tree(&allow(dir.path()), dir.path().to_str().unwrap(), None).unwrap();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].name, "a.py");
    }
}
