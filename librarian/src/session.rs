//! Process-scoped persistence of the active-project set across restarts.
//!
//! Written atomically at shutdown, the same temp-then-rename pattern used
//! for every other JSON artifact (see [`crate::index::atomic_write`]).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LibrarianResult;
use crate::index;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Session {
    pub active_projects: Vec<PathBuf>,
    /// absolute path -> unix seconds of last successful scan.
    pub last_update: BTreeMap<PathBuf, i64>,
}

impl Session {
    pub fn load(path: &Path) -> Session {
        if !path.exists() {
            return Session::default();
        }
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!("session file at {} is malformed, ignoring: {e}", path.display());
                Session::default()
            }),
            Err(e) => {
                tracing::warn!("failed to read session file {}: {e}", path.display());
                Session::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> LibrarianResult<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        index::atomic_write(path, &bytes)
    }

    /// Keep only projects whose root still exists, so a stale session entry
    /// from a deleted directory doesn't get reinstated.
    pub fn retain_existing(&mut self) {
        self.active_projects.retain(|p| p.is_dir());
        let existing: std::collections::HashSet<_> = self.active_projects.iter().cloned().collect();
        self.last_update.retain(|p, _| existing.contains(p));
    }

    pub fn mark_active(&mut self, root: PathBuf, unix_seconds: i64) {
        if !self.active_projects.contains(&root) {
            self.active_projects.push(root.clone());
        }
        self.last_update.insert(root, unix_seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_default() {
        let dir = TempDir::new().unwrap();
        let session = Session::load(&dir.path().join("session.json"));
        assert!(session.active_projects.is_empty());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        let mut session = Session::default();
        session.mark_active(dir.path().to_path_buf(), 1_700_000_000);
        session.save(&path).unwrap();

        let reloaded = Session::load(&path);
        assert_eq!(reloaded.active_projects, vec![dir.path().to_path_buf()]);
        assert_eq!(reloaded.last_update[dir.path()], 1_700_000_000);
    }

    #[test]
    fn retain_existing_drops_deleted_roots() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("gone");
        let mut session = Session::default();
        session.mark_active(gone.clone(), 1);
        session.mark_active(dir.path().to_path_buf(), 2);

        session.retain_existing();
        assert_eq!(session.active_projects, vec![dir.path().to_path_buf()]);
        assert!(!session.last_update.contains_key(&gone));
    }
}
