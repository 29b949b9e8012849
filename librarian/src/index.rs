//! The on-disk `.ai_reference/` layout: mini-librarians, `script_index.json`,
//! `component_registry.json`, and the atomic-write machinery backing them.
//!
//! Every JSON artifact is written temp-then-rename within its own directory
//! (the same pattern the teacher's snapshot writer uses for its own state
//! file), so a reader never observes a partially-written file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LibrarianError, LibrarianResult};
use crate::fs_walk;
use crate::model::{ComponentKind, ComponentRef, FileSummary};
use crate::parser;

pub const SCHEMA_VERSION: &str = "0.1.0";
const AI_REFERENCE_DIR: &str = ".ai_reference";
const SCRIPTS_DIR: &str = "scripts";
const DIAGNOSTICS_DIR: &str = "diagnostics";
const README_TEMPLATE: &str = include_str!("index_readme_template.md");

/// One project-wide entry in `script_index.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub classes: Vec<String>,
    pub functions: Vec<String>,
    pub mini_librarian: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScriptIndex {
    pub version: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub files: BTreeMap<String, FileEntry>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub size_reduced: bool,
}

impl ScriptIndex {
    pub fn empty() -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            updated_at: chrono::Utc::now(),
            files: BTreeMap::new(),
            size_reduced: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComponentLocation {
    pub file: String,
    pub kind: ComponentKind,
    pub start_line: usize,
    pub end_line: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ComponentRegistry {
    pub components: BTreeMap<String, ComponentLocation>,
    pub methods: BTreeMap<String, ComponentLocation>,
    /// `name -> [(file, start_line, end_line)]` for every collision after
    /// the first, kept for diagnostic/query purposes (§3 collision rule).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub shadowed: BTreeMap<String, Vec<ComponentLocation>>,
}

impl ComponentRegistry {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// The fully-indexed state of a project, built from every [`FileSummary`] in
/// the tree. Building this does not touch disk; [`write_artifacts`] does.
pub struct BuiltIndex {
    pub script_index: ScriptIndex,
    pub component_registry: ComponentRegistry,
    pub summaries: BTreeMap<String, FileSummary>,
}

/// Read and parse every `.py` file under `root`, in deterministic
/// (sorted-path) order, and assemble the registries. Non-Python files are
/// skipped; binary files are stubbed with `parse_error = "binary"`.
pub fn build_index(root: &Path) -> LibrarianResult<BuiltIndex> {
    let files = fs_walk::gather_files(root)?;
    let mut script_index = ScriptIndex::empty();
    let mut component_registry = ComponentRegistry::empty();
    let mut summaries = BTreeMap::new();

    for rel in files {
        if rel.extension().and_then(|e| e.to_str()) != Some("py") {
            continue;
        }
        let relative_path = fs_walk::to_forward_slash(&rel);
        let absolute = root.join(&rel);
        let summary = read_and_parse(&absolute, &relative_path)?;

        let mut entry = FileEntry {
            path: relative_path.clone(),
            classes: summary.classes.iter().map(|c| c.name.clone()).collect(),
            functions: summary.functions.iter().map(|f| f.name.clone()).collect(),
            mini_librarian: mini_librarian_relative_path(&relative_path),
        };
        entry.classes.sort();
        entry.functions.sort();

        if summary.parse_error.is_none() {
            for component in summary.top_level_components() {
                register_component(&mut component_registry, &relative_path, component);
            }
        }

        script_index.files.insert(relative_path.clone(), entry);
        summaries.insert(relative_path, summary);
    }

    Ok(BuiltIndex {
        script_index,
        component_registry,
        summaries,
    })
}

fn read_and_parse(absolute: &Path, relative_path: &str) -> LibrarianResult<FileSummary> {
    let bytes = std::fs::read(absolute)?;
    if fs_walk::is_probably_binary(&bytes) {
        return Ok(FileSummary::stub_with_error(relative_path, "binary"));
    }
    let source = String::from_utf8_lossy(&bytes).into_owned();
    Ok(parser::parse_python(relative_path, &source))
}

fn register_component(registry: &mut ComponentRegistry, file: &str, component: &ComponentRef) {
    let location = ComponentLocation {
        file: file.to_string(),
        kind: component.kind,
        start_line: component.start_line,
        end_line: component.end_line,
    };

    match registry.components.entry(component.name.clone()) {
        std::collections::btree_map::Entry::Vacant(slot) => {
            slot.insert(location.clone());
        }
        std::collections::btree_map::Entry::Occupied(existing) => {
            // Keep the first encountered in ascending path order. Since
            // build_index walks files in sorted order, "first encountered"
            // is simply "already present" unless this file sorts earlier,
            // which cannot happen given the iteration order.
            if existing.get().file > location.file {
                let shadowed = existing.into_mut().clone();
                registry
                    .shadowed
                    .entry(component.name.clone())
                    .or_default()
                    .push(shadowed);
            } else {
                registry
                    .shadowed
                    .entry(component.name.clone())
                    .or_default()
                    .push(location.clone());
                return;
            }
        }
    }

    for (method_name, method) in &component.methods {
        let qualified = format!("{}.{}", component.name, method_name);
        registry.methods.insert(
            qualified,
            ComponentLocation {
                file: file.to_string(),
                kind: method.kind,
                start_line: method.start_line,
                end_line: method.end_line,
            },
        );
    }
}

/// `a/b/c.py` -> `scripts/a_b_c_py.json`. Reversible enough for display
/// purposes; not parsed back, so collisions between e.g. `a/b.py` and
/// `a_b.py` are tolerated (last writer wins, documented behavior).
pub fn flatten_relative_path(relative_path: &str) -> String {
    relative_path.replace(['/', '.'], "_")
}

fn mini_librarian_relative_path(relative_path: &str) -> String {
    format!("{SCRIPTS_DIR}/{}.json", flatten_relative_path(relative_path))
}

pub fn ai_reference_dir(root: &Path) -> PathBuf {
    root.join(AI_REFERENCE_DIR)
}

/// Create the `.ai_reference/` skeleton if absent. Never removes files a
/// user may have placed alongside the owned artifacts.
pub fn ensure_skeleton(root: &Path) -> LibrarianResult<()> {
    let dir = ai_reference_dir(root);
    std::fs::create_dir_all(dir.join(SCRIPTS_DIR))?;
    std::fs::create_dir_all(dir.join(DIAGNOSTICS_DIR))?;
    let readme = dir.join("README.md");
    if !readme.exists() {
        atomic_write(&readme, README_TEMPLATE.as_bytes())?;
    }
    Ok(())
}

/// Serialize and atomically write every artifact for a freshly built index:
/// the registries, plus one mini-librarian per summary. Applies the
/// §4.C size-cap reduction policy to `script_index.json`.
pub fn write_artifacts(root: &Path, built: &BuiltIndex, max_script_index_bytes: u64) -> LibrarianResult<()> {
    ensure_skeleton(root)?;
    let dir = ai_reference_dir(root);

    for (relative_path, summary) in &built.summaries {
        let mini_path = dir.join(mini_librarian_relative_path(relative_path));
        if let Some(parent) = mini_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(summary)?;
        atomic_write(&mini_path, &bytes)?;
    }

    write_script_index(&dir, &built.script_index, max_script_index_bytes)?;

    let registry_bytes = serde_json::to_vec_pretty(&built.component_registry)?;
    atomic_write(&dir.join("component_registry.json"), &registry_bytes)?;

    Ok(())
}

fn write_script_index(dir: &Path, index: &ScriptIndex, max_bytes: u64) -> LibrarianResult<()> {
    let path = dir.join("script_index.json");
    let pretty = serde_json::to_vec_pretty(index)?;
    if (pretty.len() as u64) <= max_bytes {
        return atomic_write(&path, &pretty);
    }

    let mut reduced = index.clone();
    reduced.size_reduced = true;
    let reduced_pretty = serde_json::to_vec_pretty(&reduced)?;
    if (reduced_pretty.len() as u64) <= max_bytes {
        return atomic_write(&path, &reduced_pretty);
    }

    let compact = serde_json::to_vec(&reduced)?;
    atomic_write(&path, &compact)
}

pub fn load_script_index(root: &Path) -> LibrarianResult<ScriptIndex> {
    let path = ai_reference_dir(root).join("script_index.json");
    let bytes = std::fs::read(&path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn load_component_registry(root: &Path) -> LibrarianResult<ComponentRegistry> {
    let path = ai_reference_dir(root).join("component_registry.json");
    let bytes = std::fs::read(&path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn load_mini_librarian(root: &Path, relative_path: &str) -> LibrarianResult<FileSummary> {
    let path = ai_reference_dir(root).join(mini_librarian_relative_path(relative_path));
    let bytes = std::fs::read(&path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write `bytes` to `path` via a sibling temp file plus rename, so no
/// reader ever observes a partial write. Retries once on failure before
/// surfacing `Internal`, per the error-handling design.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> LibrarianResult<()> {
    match atomic_write_once(path, bytes) {
        Ok(()) => Ok(()),
        Err(_) => atomic_write_once(path, bytes)
            .map_err(|e| LibrarianError::internal(format!("atomic write to {} failed: {e}", path.display()))),
    }
}

fn atomic_write_once(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("write target has no parent directory"))?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".librarian-tmp-")
        .tempfile_in(parent)?;
    use std::io::Write;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn builds_index_with_classes_and_functions() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "class A:\n    pass\ndef f():\n    pass\n").unwrap();
        std::fs::write(dir.path().join("b.py"), "def g():\n    return 1\n").unwrap();

        let built = build_index(dir.path()).unwrap();
        assert_eq!(built.script_index.files.len(), 2);
        assert!(built.component_registry.components.contains_key("A"));
        assert!(built.component_registry.components.contains_key("f"));
        assert!(built.component_registry.components.contains_key("g"));
    }

    #[test]
    fn write_artifacts_round_trips_and_is_atomic() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "def f():\n    pass\n").unwrap();
        let built = build_index(dir.path()).unwrap();
        write_artifacts(dir.path(), &built, 512_000).unwrap();

        let reread = load_script_index(dir.path()).unwrap();
        assert_eq!(reread.files.len(), 1);
        let registry = load_component_registry(dir.path()).unwrap();
        assert!(registry.components.contains_key("f"));
        let mini = load_mini_librarian(dir.path(), "a.py").unwrap();
        assert_eq!(mini.functions.len(), 1);
        assert!(ai_reference_dir(dir.path()).join("README.md").exists());
    }

    #[test]
    fn collision_keeps_first_path_and_records_shadowed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "def dup():\n    pass\n").unwrap();
        std::fs::write(dir.path().join("z.py"), "def dup():\n    pass\n").unwrap();

        let built = build_index(dir.path()).unwrap();
        let location = built.component_registry.components.get("dup").unwrap();
        assert_eq!(location.file, "a.py");
        assert_eq!(built.component_registry.shadowed.get("dup").unwrap().len(), 1);
    }

    #[test]
    fn size_cap_triggers_reduced_form() {
        let dir = TempDir::new().unwrap();
        for i in 0..50 {
            std::fs::write(
                dir.path().join(format!("m{i}.py")),
                format!("def f{i}():\n    pass\n"),
            )
            .unwrap();
        }
        let built = build_index(dir.path()).unwrap();
        write_artifacts(dir.path(), &built, 200).unwrap();
        let reread = load_script_index(dir.path()).unwrap();
        assert!(reread.size_reduced);
    }
}
