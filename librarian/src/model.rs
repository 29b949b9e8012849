//! Core data types shared across the parser, index writer, and registry.
//!
//! Mirrors the data model: a project's tree is reduced to one
//! [`FileSummary`] per source file, and those summaries are assembled into
//! the project-wide [`crate::index::ScriptIndex`] and
//! [`crate::index::ComponentRegistry`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A named, span-bearing code entity: a class, function, or method.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRef {
    pub name: String,
    pub kind: ComponentKind,
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive; always `>= start_line`.
    pub end_line: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Param>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bases: Vec<String>,
    /// Immediate methods, in source order. Only populated for classes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub methods: BTreeMap<String, ComponentRef>,
    /// Dotted call targets found in the body (`Name(...)`, `obj.attr(...)`),
    /// flattened and unresolved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub calls: Vec<CallRef>,
}

impl ComponentRef {
    pub fn new(name: impl Into<String>, kind: ComponentKind, start_line: usize, end_line: usize) -> Self {
        Self {
            name: name.into(),
            kind,
            start_line,
            end_line: end_line.max(start_line),
            docstring: None,
            parameters: Vec::new(),
            return_type: None,
            bases: Vec::new(),
            methods: BTreeMap::new(),
            calls: Vec::new(),
        }
    }
}

/// The three component kinds the design recognizes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    #[default]
    Class,
    Function,
    Method,
}

/// A function or method parameter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_annotation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// A single invocation found in a function/method body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRef {
    pub name: String,
    pub line: usize,
}

/// A single `import`/`from ... import` statement, normalized to one entry
/// per imported name (`from a.b import c` -> `module_path: "a.b"`,
/// `imported_name: "a.b.c"`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Import {
    pub module_path: String,
    pub imported_name: String,
    pub line: usize,
}

/// Per-file result of [`crate::parser::parse_file`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileSummary {
    /// Project-relative, forward-slash path.
    pub relative_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<ComponentRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<ComponentRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<Import>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl FileSummary {
    pub fn new(relative_path: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            ..Default::default()
        }
    }

    pub fn stub_with_error(relative_path: impl Into<String>, parse_error: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            parse_error: Some(parse_error.into()),
            ..Default::default()
        }
    }

    /// All top-level components (classes and functions), in source order,
    /// as `(name, kind, start_line, end_line)` tuples used by the index
    /// writer and the component registry.
    pub fn top_level_components(&self) -> impl Iterator<Item = &ComponentRef> {
        self.classes.iter().chain(self.functions.iter())
    }
}

/// A rooted directory under the allow-list, as seen by the in-memory
/// registry (see [`crate::registry::Registry`]).
#[derive(Clone, Debug)]
pub struct Project {
    pub root: PathBuf,
    pub active: bool,
    pub last_scanned_at: Option<chrono::DateTime<chrono::Utc>>,
    /// path (relative to root) -> mtime in nanoseconds since epoch.
    pub indexed_files: BTreeMap<String, u128>,
}

impl Project {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            active: true,
            last_scanned_at: None,
            indexed_files: BTreeMap::new(),
        }
    }
}
