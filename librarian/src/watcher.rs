//! The background watcher loop.
//!
//! Unlike the teacher's single-project, OS-event-driven watcher (`notify` +
//! a debouncer), this loop polls: it iterates every active project on a
//! fixed interval, throttled per-project, and diffs an mtime map to decide
//! whether a re-index is warranted. That matches a fleet of independently
//! throttled projects better than a recursive filesystem-event subscription
//! would, and keeps the dependency footprint to what `tokio::time` already
//! provides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::fs_walk;
use crate::registry::Registry;

/// Per-project backoff state, so one misbehaving project doesn't spam logs
/// or burn CPU retrying every tick.
struct Backoff {
    consecutive_failures: u32,
    next_attempt_after: std::time::Instant,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            next_attempt_after: std::time::Instant::now(),
        }
    }
}

/// A handle used to signal the watcher to stop. Cloned into the spawned
/// task; dropped/set from the shutdown path.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives the watch loop until `stop` is signaled. Intended to be spawned
/// once at process startup via `tokio::spawn`.
pub async fn run(
    registry: Registry,
    stop: StopFlag,
    scan_period: Duration,
    max_script_index_bytes: u64,
) {
    let mut backoffs: std::collections::HashMap<PathBuf, Backoff> = std::collections::HashMap::new();
    let mut last_scan: std::collections::HashMap<PathBuf, std::time::Instant> = std::collections::HashMap::new();

    loop {
        if stop.is_stopped() {
            break;
        }

        let roots = registry.active_roots().await;
        for root in roots {
            if stop.is_stopped() {
                break;
            }

            let backoff = backoffs.entry(root.clone()).or_default();
            if std::time::Instant::now() < backoff.next_attempt_after {
                continue;
            }

            let due = last_scan
                .get(&root)
                .is_none_or(|last| last.elapsed() >= scan_period);
            if !due {
                continue;
            }
            last_scan.insert(root.clone(), std::time::Instant::now());

            match scan_project(&registry, &root, max_script_index_bytes).await {
                Ok(()) => {
                    backoffs.insert(root.clone(), Backoff::default());
                }
                Err(e) => {
                    tracing::warn!("watcher scan of {} failed: {e}", root.display());
                    let backoff = backoffs.entry(root.clone()).or_default();
                    backoff.consecutive_failures += 1;
                    let capped_secs = 300u64.min(30 * 2u64.pow(backoff.consecutive_failures.min(4)));
                    backoff.next_attempt_after =
                        std::time::Instant::now() + Duration::from_secs(capped_secs);
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Check whether `root` is dirty (file set or any mtime changed) and, if
/// so, run a full re-index. A full rebuild rather than a true incremental
/// diff keeps the collision/shadowing bookkeeping in one place (see
/// `index::build_index`); it is still bounded by "only touched when dirty".
async fn scan_project(registry: &Registry, root: &Path, max_script_index_bytes: u64) -> crate::error::LibrarianResult<()> {
    let current = current_mtimes(root)?;
    let previous = registry.indexed_files(root).await.unwrap_or_default();

    if current == previous {
        return Ok(());
    }

    registry.reindex(root, max_script_index_bytes).await?;
    Ok(())
}

fn current_mtimes(root: &Path) -> crate::error::LibrarianResult<BTreeMap<String, u128>> {
    let mut map = BTreeMap::new();
    for rel in fs_walk::gather_files(root)? {
        if rel.extension().and_then(|e| e.to_str()) != Some("py") {
            continue;
        }
        let relative_path = fs_walk::to_forward_slash(&rel);
        let absolute = root.join(&rel);
        if let Ok(mtime) = fs_walk::mtime_nanos(&absolute) {
            map.insert(relative_path, mtime);
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn scan_is_noop_when_nothing_changed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "def f():\n    pass\n").unwrap();
        let registry = Registry::new();
        registry.reindex(dir.path(), 512_000).await.unwrap();

        scan_project(&registry, dir.path(), 512_000).await.unwrap();
        let found = registry
            .with_project(dir.path(), |e| e.component_registry.components.contains_key("f"))
            .await
            .unwrap();
        assert!(found);
    }

    #[tokio::test]
    async fn scan_picks_up_new_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "def f():\n    pass\n").unwrap();
        let registry = Registry::new();
        registry.reindex(dir.path(), 512_000).await.unwrap();

        std::fs::write(dir.path().join("b.py"), "def g():\n    pass\n").unwrap();
        scan_project(&registry, dir.path(), 512_000).await.unwrap();

        let found = registry
            .with_project(dir.path(), |e| e.component_registry.components.contains_key("g"))
            .await
            .unwrap();
        assert!(found);
    }

    #[test]
    fn stop_flag_round_trips() {
        let stop = StopFlag::new();
        assert!(!stop.is_stopped());
        stop.signal();
        assert!(stop.is_stopped());
    }
}
