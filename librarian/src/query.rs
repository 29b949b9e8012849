//! `query_component` and `find_implementation`: the two read-only lookups
//! answered from the in-memory registry rather than by re-scanning.

use std::path::Path;

use serde::Serialize;

use crate::error::LibrarianResult;
use crate::fs_walk;
use crate::index::ComponentLocation;
use crate::model::ComponentKind;
use crate::registry::Registry;

const MAX_MATCH_FILES: usize = 200;
const MAX_MATCHES: usize = 1000;

#[derive(Clone, Debug, Serialize)]
pub struct ComponentMatch {
    pub file: String,
    pub kind: ComponentKind,
    pub start_line: usize,
    pub end_line: usize,
    pub source_excerpt: String,
}

/// Exact, case-sensitive lookup against the component registry. `name` may
/// be a bare top-level name or `"Class.method"`.
pub async fn query_component(registry: &Registry, root: &Path, name: &str) -> LibrarianResult<Vec<ComponentMatch>> {
    let locations: Vec<ComponentLocation> = registry
        .with_project(root, |entry| {
            let mut hits = Vec::new();
            if let Some(loc) = entry.component_registry.components.get(name) {
                hits.push(loc.clone());
            }
            if let Some(loc) = entry.component_registry.methods.get(name) {
                hits.push(loc.clone());
            }
            if let Some(shadowed) = entry.component_registry.shadowed.get(name) {
                hits.extend(shadowed.iter().cloned());
            }
            hits
        })
        .await?;

    let mut matches = Vec::with_capacity(locations.len());
    for location in locations {
        let excerpt = read_excerpt(root, &location.file, location.start_line, location.end_line)?;
        matches.push(ComponentMatch {
            file: location.file,
            kind: location.kind,
            start_line: location.start_line,
            end_line: location.end_line,
            source_excerpt: excerpt,
        });
    }
    Ok(matches)
}

fn read_excerpt(root: &Path, relative_path: &str, start_line: usize, end_line: usize) -> LibrarianResult<String> {
    let absolute = root.join(relative_path);
    let content = std::fs::read_to_string(&absolute)?;
    let lines: Vec<&str> = content.lines().collect();
    let start = start_line.saturating_sub(1).min(lines.len());
    let end = end_line.min(lines.len());
    Ok(lines[start..end].join("\n"))
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchMatch {
    pub file: String,
    pub line: usize,
    pub context_before: Vec<String>,
    pub matched_line: String,
    pub context_after: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchResult {
    pub matches: Vec<SearchMatch>,
    pub truncated: bool,
}

/// Case-insensitive substring search across every text file under `root`,
/// optionally filtered by a glob/extension pattern. Mirrors the watcher's
/// directory exclusions.
pub fn find_implementation(
    root: &Path,
    search_text: &str,
    file_pattern: Option<&str>,
    context_lines: usize,
) -> LibrarianResult<SearchResult> {
    let needle = search_text.to_lowercase();
    let glob = file_pattern.map(compile_pattern).transpose()?;

    let mut files = fs_walk::gather_files(root)?;
    files.sort();

    let mut matches = Vec::new();
    let mut files_with_hits = 0usize;
    let mut truncated = false;

    'files: for rel in files {
        if files_with_hits >= MAX_MATCH_FILES {
            truncated = true;
            break;
        }
        if let Some(glob) = &glob {
            let name = rel.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !glob.is_match(name) {
                continue;
            }
        }
        let absolute = root.join(&rel);
        let Ok(bytes) = std::fs::read(&absolute) else {
            continue;
        };
        if fs_walk::is_probably_binary(&bytes) {
            continue;
        }
        let content = String::from_utf8_lossy(&bytes).into_owned();
        let lines: Vec<&str> = content.lines().collect();
        let relative_path = fs_walk::to_forward_slash(&rel);

        let mut hit_in_file = false;
        for (idx, line) in lines.iter().enumerate() {
            if !line.to_lowercase().contains(&needle) {
                continue;
            }
            hit_in_file = true;
            let before_start = idx.saturating_sub(context_lines);
            let after_end = (idx + 1 + context_lines).min(lines.len());
            matches.push(SearchMatch {
                file: relative_path.clone(),
                line: idx + 1,
                context_before: lines[before_start..idx].iter().map(|s| s.to_string()).collect(),
                matched_line: line.to_string(),
                context_after: lines[idx + 1..after_end].iter().map(|s| s.to_string()).collect(),
            });
            if matches.len() >= MAX_MATCHES {
                truncated = true;
                break 'files;
            }
        }
        if hit_in_file {
            files_with_hits += 1;
        }
    }

    Ok(SearchResult { matches, truncated })
}

fn compile_pattern(pattern: &str) -> LibrarianResult<globset::GlobMatcher> {
    let pattern = if pattern.starts_with('*') || pattern.contains('/') {
        pattern.to_string()
    } else if let Some(ext) = pattern.strip_prefix('.') {
        format!("*.{ext}")
    } else {
        format!("*.{pattern}")
    };
    globset::Glob::new(&pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| crate::error::LibrarianError::invalid_argument(format!("invalid file_pattern: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn query_component_finds_class_and_method() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.py"),
            "class A:\n    def m(self):\n        pass\n",
        )
        .unwrap();
        let registry = Registry::new();
        registry.reindex(dir.path(), 512_000).await.unwrap();

        let hits = query_component(&registry, dir.path(), "A").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, ComponentKind::Class);

        let method_hits = query_component(&registry, dir.path(), "A.m").await.unwrap();
        assert_eq!(method_hits.len(), 1);
        assert_eq!(method_hits[0].kind, ComponentKind::Method);
    }

    #[test]
    fn find_implementation_is_case_insensitive_with_context() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.py"),
            "line1\nline2\nNEEDLE here\nline4\nline5\n",
        )
        .unwrap();
        let result = find_implementation(dir.path(), "needle", None, 1).unwrap();
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].context_before, vec!["line2".to_string()]);
        assert_eq!(result.matches[0].context_after, vec!["line4".to_string()]);
        assert!(!result.truncated);
    }

    #[test]
    fn find_implementation_respects_file_pattern() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.py"), "needle\n").unwrap();
        std::fs::write(dir.path().join("a.txt"), "needle\n").unwrap();
        let result = find_implementation(dir.path(), "needle", Some("*.py"), 0).unwrap();
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].file, "a.py");
    }
}
