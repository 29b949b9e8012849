//! Process configuration.
//!
//! Everything here is optional except the allow-list, which must come from
//! CLI arguments, a config file, or the `LIBRARIAN_ALLOWED_ROOTS`
//! environment variable (colon/semicolon-delimited, per-platform).

use std::path::{Path, PathBuf};

use serde::Deserialize;

const DEFAULT_SCAN_PERIOD_SECS: u64 = 30;
const DEFAULT_TASKBOARD_WORKERS: usize = 2;
const DEFAULT_TASKBOARD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_SCRIPT_INDEX_BYTES: u64 = 512_000;
const DEFAULT_CONTEXT_LINES: usize = 3;

/// Top-level daemon configuration, loadable from `librarian.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory roots the process may touch. Populated from the config
    /// file, then overridden by CLI args / env var if those are present.
    pub allowed_roots: Vec<PathBuf>,
    pub scan_period_seconds: u64,
    pub taskboard_workers: usize,
    pub taskboard_default_timeout_seconds: u64,
    pub max_script_index_bytes: u64,
    pub context_lines: usize,
    pub debug: bool,
    pub reject_large_projects: bool,
    pub allow_cross_device_move: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_roots: Vec::new(),
            scan_period_seconds: DEFAULT_SCAN_PERIOD_SECS,
            taskboard_workers: DEFAULT_TASKBOARD_WORKERS,
            taskboard_default_timeout_seconds: DEFAULT_TASKBOARD_TIMEOUT_SECS,
            max_script_index_bytes: DEFAULT_MAX_SCRIPT_INDEX_BYTES,
            context_lines: DEFAULT_CONTEXT_LINES,
            debug: false,
            reject_large_projects: false,
            allow_cross_device_move: false,
        }
    }
}

impl Config {
    /// Load `path` if it exists; otherwise return defaults. Malformed TOML
    /// is logged and treated as absent rather than aborting startup.
    pub fn load_from_path(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("failed to parse {}: {e}", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("failed to read {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Parse the allow-list environment variable, if set. Accepts `:` on
    /// Unix and `;` on Windows, matching `std::env::split_paths`.
    pub fn roots_from_env(var: &str) -> Vec<PathBuf> {
        std::env::var_os(var)
            .map(|value| std::env::split_paths(&value).collect())
            .unwrap_or_default()
    }

    /// Merge CLI-provided and env-provided roots on top of whatever the
    /// config file set, with CLI taking precedence when non-empty.
    pub fn resolve_allowed_roots(&self, cli_roots: Vec<PathBuf>, env_var: &str) -> Vec<PathBuf> {
        if !cli_roots.is_empty() {
            return cli_roots;
        }
        let env_roots = Self::roots_from_env(env_var);
        if !env_roots.is_empty() {
            return env_roots;
        }
        self.allowed_roots.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.scan_period_seconds, 30);
        assert_eq!(config.taskboard_workers, 2);
        assert!(config.allowed_roots.is_empty());
    }

    #[test]
    fn load_missing_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from_path(&dir.path().join("librarian.toml"));
        assert_eq!(config.scan_period_seconds, 30);
    }

    #[test]
    fn load_valid_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("librarian.toml");
        std::fs::write(
            &path,
            r#"
scan_period_seconds = 10
taskboard_workers = 4
"#,
        )
        .unwrap();
        let config = Config::load_from_path(&path);
        assert_eq!(config.scan_period_seconds, 10);
        assert_eq!(config.taskboard_workers, 4);
    }

    #[test]
    fn cli_roots_win_over_env_and_file() {
        let config = Config {
            allowed_roots: vec![PathBuf::from("/from/file")],
            ..Config::default()
        };
        let resolved =
            config.resolve_allowed_roots(vec![PathBuf::from("/from/cli")], "LIBRARIAN_TEST_VAR_UNSET");
        assert_eq!(resolved, vec![PathBuf::from("/from/cli")]);
    }
}
