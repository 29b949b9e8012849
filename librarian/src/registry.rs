//! The in-memory, process-wide map from project root to its indexed state.
//!
//! Keyed by canonical root, one `RwLock` per project so a query against one
//! project never blocks a re-index of another. Readers (`query_component`,
//! `find_implementation`) take read locks; writers (index builds) take
//! write locks, acquired from the start — no lock upgrades.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::LibrarianResult;
use crate::index::{self, BuiltIndex, ComponentRegistry, ScriptIndex};
use crate::model::Project;

/// The full in-memory state for one active project.
pub struct ProjectEntry {
    pub project: Project,
    pub script_index: ScriptIndex,
    pub component_registry: ComponentRegistry,
}

impl ProjectEntry {
    fn from_built(root: PathBuf, built: BuiltIndex) -> Self {
        let mut project = Project::new(root);
        project.last_scanned_at = Some(chrono::Utc::now());
        for (relative_path, summary) in &built.summaries {
            let absolute = project.root.join(relative_path);
            if let Ok(mtime) = crate::fs_walk::mtime_nanos(&absolute) {
                project.indexed_files.insert(relative_path.clone(), mtime);
            }
            let _ = summary;
        }
        Self {
            project,
            script_index: built.script_index,
            component_registry: built.component_registry,
        }
    }
}

/// Process-wide registry. Cloning is cheap (an `Arc` around the map); every
/// clone shares the same underlying projects.
#[derive(Clone, Default)]
pub struct Registry {
    projects: Arc<RwLock<HashMap<PathBuf, Arc<RwLock<ProjectEntry>>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The per-project lock, creating an empty slot if this is the first
    /// time `root` has been seen. Does not touch disk.
    async fn slot(&self, root: &Path) -> Arc<RwLock<ProjectEntry>> {
        if let Some(existing) = self.projects.read().await.get(root) {
            return existing.clone();
        }
        let mut projects = self.projects.write().await;
        projects
            .entry(root.to_path_buf())
            .or_insert_with(|| {
                Arc::new(RwLock::new(ProjectEntry::from_built(
                    root.to_path_buf(),
                    BuiltIndex {
                        script_index: ScriptIndex::empty(),
                        component_registry: ComponentRegistry::empty(),
                        summaries: Default::default(),
                    },
                )))
            })
            .clone()
    }

    /// True if `root` has an in-memory entry (regardless of `active`).
    pub async fn is_loaded(&self, root: &Path) -> bool {
        self.projects.read().await.contains_key(root)
    }

    /// Run a full index build for `root` and install the result, replacing
    /// whatever was there. Used by `initialize_librarian` and
    /// `generate_librarian`, and by the watcher on a dirty scan.
    pub async fn reindex(&self, root: &Path, max_script_index_bytes: u64) -> LibrarianResult<(usize, usize)> {
        let built = index::build_index(root)?;
        index::write_artifacts(root, &built, max_script_index_bytes)?;
        let files_indexed = built.script_index.files.len();
        let components_identified = built.component_registry.components.len() + built.component_registry.methods.len();

        let slot = self.slot(root).await;
        let mut entry = slot.write().await;
        *entry = ProjectEntry::from_built(root.to_path_buf(), built);
        entry.project.active = true;

        Ok((files_indexed, components_identified))
    }

    /// Populate the in-memory view from `.ai_reference/` on disk without
    /// re-running the parser, for a project that exists but isn't active.
    pub async fn load_from_disk(&self, root: &Path) -> LibrarianResult<()> {
        let script_index = index::load_script_index(root)?;
        let component_registry = index::load_component_registry(root)?;
        let slot = self.slot(root).await;
        let mut entry = slot.write().await;
        entry.script_index = script_index;
        entry.component_registry = component_registry;
        entry.project.active = false;
        Ok(())
    }

    /// Read-only access to a project's entry, lazily loading it from disk
    /// first if it isn't already in memory.
    pub async fn with_project<F, R>(&self, root: &Path, f: F) -> LibrarianResult<R>
    where
        F: FnOnce(&ProjectEntry) -> R,
    {
        if !self.is_loaded(root).await {
            self.load_from_disk(root).await?;
        }
        let slot = self.slot(root).await;
        let entry = slot.read().await;
        Ok(f(&entry))
    }

    pub async fn mark_active(&self, root: &Path, active: bool) {
        let slot = self.slot(root).await;
        slot.write().await.project.active = active;
    }

    pub async fn active_roots(&self) -> Vec<PathBuf> {
        let projects = self.projects.read().await;
        let mut roots: Vec<_> = Vec::new();
        for (root, entry) in projects.iter() {
            if entry.read().await.project.active {
                roots.push(root.clone());
            }
        }
        roots
    }

    pub async fn indexed_files(&self, root: &Path) -> Option<std::collections::BTreeMap<String, u128>> {
        let projects = self.projects.read().await;
        let entry = projects.get(root)?;
        Some(entry.read().await.project.indexed_files.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reindex_populates_registry() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "def f():\n    pass\n").unwrap();
        let registry = Registry::new();
        let (files, components) = registry.reindex(dir.path(), 512_000).await.unwrap();
        assert_eq!(files, 1);
        assert_eq!(components, 1);

        let found = registry
            .with_project(dir.path(), |entry| entry.component_registry.components.contains_key("f"))
            .await
            .unwrap();
        assert!(found);
    }

    #[tokio::test]
    async fn lazy_loads_from_disk_when_not_active() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "def f():\n    pass\n").unwrap();
        let writer = Registry::new();
        writer.reindex(dir.path(), 512_000).await.unwrap();

        let reader = Registry::new();
        assert!(!reader.is_loaded(dir.path()).await);
        let found = reader
            .with_project(dir.path(), |entry| entry.component_registry.components.contains_key("f"))
            .await
            .unwrap();
        assert!(found);
    }
}
