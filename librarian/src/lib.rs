//! # librarian
//!
//! Core of a developer-tooling daemon that maintains, across conversations
//! with an AI coding assistant, a persistent, auto-refreshing index of one
//! or more source-code projects.
//!
//! The crate mirrors the system's data flow:
//!
//! - [`allowlist`] — the process-wide set of directory roots a client may
//!   touch.
//! - [`path_guard`] — validates every path argument against the allow-list
//!   before it reaches any other module.
//! - [`parser`] — turns one source file into a [`model::FileSummary`].
//! - [`index`] — assembles and atomically persists the per-project
//!   `.ai_reference/` artifacts (mini-librarians, `script_index.json`,
//!   `component_registry.json`).
//! - [`registry`] — the in-memory mirror of every active project's
//!   registries, guarded by a per-project read/write lock.
//! - [`watcher`] — the background loop that detects filesystem drift and
//!   triggers incremental re-indexing.
//! - [`taskboard`] — an async job queue for long-running analyses.
//! - [`session`] — persists the set of active projects across restarts.
//! - [`query`] — read-side helpers used by `query_component` and
//!   `find_implementation`.
//! - [`fs_ops`] — scoped filesystem operations (read/write/edit/move/...).
//!
//! None of these modules know about the wire protocol; that lives in the
//! `librarian-mcp` binary, which wires them up behind `rmcp` tool calls.

pub mod allowlist;
pub mod config;
pub mod error;
pub mod fs_ops;
pub mod fs_walk;
pub mod index;
pub mod model;
pub mod parser;
pub mod path_guard;
pub mod query;
pub mod registry;
pub mod session;
pub mod taskboard;
pub mod watcher;

pub use allowlist::AllowList;
pub use error::{ErrorKind, LibrarianError, LibrarianResult};
pub use model::{ComponentKind, ComponentRef, FileSummary, Import, Project};
pub use registry::Registry;
