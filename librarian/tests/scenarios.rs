//! End-to-end scenarios exercising the library surface the way
//! `librarian-mcp`'s tool handlers do, without going through the MCP
//! transport itself.

use std::time::Duration;

use librarian::allowlist::AllowList;
use librarian::error::ErrorKind;
use librarian::registry::Registry;
use librarian::taskboard::{Priority, TaskBoard, TaskStatus};
use librarian::{fs_ops, index, path_guard, query};
use tempfile::TempDir;

fn allow(dir: &std::path::Path) -> AllowList {
    AllowList::new(vec![dir.to_path_buf()]).unwrap()
}

/// S1: cold init of a two-file project.
#[tokio::test]
async fn cold_init_of_two_file_project() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.py"), "class A: pass\ndef f(): pass\n").unwrap();
    std::fs::write(dir.path().join("b.py"), "def g(): return 1\n").unwrap();

    index::ensure_skeleton(dir.path()).unwrap();
    let registry = Registry::new();
    let (files, components) = registry.reindex(dir.path(), 512_000).await.unwrap();
    assert_eq!(files, 2);
    assert_eq!(components, 3);

    let on_disk = index::load_script_index(dir.path()).unwrap();
    assert_eq!(on_disk.files.len(), 2);
    let registry_on_disk = index::load_component_registry(dir.path()).unwrap();
    assert!(registry_on_disk.components.contains_key("A"));
    assert!(registry_on_disk.components.contains_key("f"));
    assert!(registry_on_disk.components.contains_key("g"));

    let hits = query::query_component(&registry, dir.path(), "A").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].file, "a.py");
    assert_eq!(hits[0].start_line, 1);
}

/// S2: incremental update after a file changes picks up the new component.
#[tokio::test]
async fn incremental_update_picks_up_new_function() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.py"), "class A: pass\ndef f(): pass\n").unwrap();
    std::fs::write(dir.path().join("b.py"), "def g(): return 1\n").unwrap();

    let registry = Registry::new();
    registry.reindex(dir.path(), 512_000).await.unwrap();

    std::fs::write(dir.path().join("b.py"), "def g(): return 1\ndef h(): pass\n").unwrap();
    registry.reindex(dir.path(), 512_000).await.unwrap();

    let result = query::find_implementation(dir.path(), "def h", None, 3).unwrap();
    assert_eq!(result.matches.len(), 1);
    assert_eq!(result.matches[0].file, "b.py");

    let on_disk = index::load_component_registry(dir.path()).unwrap();
    assert!(on_disk.components.contains_key("h"));
}

/// S3: edit a file then verify the new method is queryable and the class's
/// span grows.
#[test]
fn edit_then_verify() {
    let dir = TempDir::new().unwrap();
    let allow = allow(dir.path());
    let target = dir.path().join("a.py");
    std::fs::write(&target, "class A: pass\n").unwrap();

    let outcome = fs_ops::edit_file(
        &allow,
        target.to_str().unwrap(),
        &[fs_ops::Edit {
            old_text: "class A: pass".into(),
            new_text: "class A:\n    def m(self): pass".into(),
        }],
        false,
    )
    .unwrap();
    assert!(outcome.applied);
    assert!(outcome.diff.contains("class A"));

    let built = index::build_index(dir.path()).unwrap();
    let a = built.component_registry.components.get("A").unwrap();
    assert!(a.end_line >= 2);
    let m = built.component_registry.methods.get("A.m").unwrap();
    assert_eq!(m.start_line, 2);
}

/// S4: a path outside the allow-list is rejected with no side effect.
#[test]
fn permission_rejection_has_no_side_effect() {
    let dir = TempDir::new().unwrap();
    let allow = allow(dir.path());
    let err = fs_ops::read_file(&allow, "/etc/passwd").unwrap_err();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);
}

/// S5: an ambiguous edit leaves the file untouched.
#[test]
fn ambiguous_edit_is_rejected() {
    let dir = TempDir::new().unwrap();
    let allow = allow(dir.path());
    let target = dir.path().join("a.py");
    std::fs::write(&target, "x = 1\ny = x\nz = x\n").unwrap();

    let err = fs_ops::edit_file(
        &allow,
        target.to_str().unwrap(),
        &[fs_ops::Edit {
            old_text: "x".into(),
            new_text: "w".into(),
        }],
        false,
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::EditAmbiguous);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "x = 1\ny = x\nz = x\n");
}

/// S6: high priority dequeues ahead of low, and a completed task is stable
/// across a cancel request.
#[tokio::test]
async fn taskboard_lifecycle() {
    let handler: librarian::taskboard::TaskHandler = std::sync::Arc::new(|_params, _cancel| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(serde_json::json!({"ok": true}))
        })
    });
    let board = TaskBoard::new(Duration::from_secs(5)).with_handler("noop", handler);
    board.spawn_workers(1);

    let low = board.submit("noop", serde_json::Value::Null, Priority::Low).await.unwrap();
    let high = board.submit("noop", serde_json::Value::Null, Priority::High).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(board.status(&high).await.unwrap().status, TaskStatus::Completed);
    assert_eq!(board.status(&low).await.unwrap().status, TaskStatus::Completed);

    let after_cancel = board.cancel(&high).await.unwrap();
    assert_eq!(after_cancel.status, TaskStatus::Completed);
    board.shutdown();
}

/// Path Guard: traversal out of the allow-list root never resolves, even
/// when the offending segment is buried in the middle of the path.
#[test]
fn path_guard_rejects_traversal() {
    let dir = TempDir::new().unwrap();
    let sub = dir.path().join("project").join("src");
    std::fs::create_dir_all(&sub).unwrap();
    let allow = allow(&dir.path().join("project"));
    let escape = sub.join("../../../etc/passwd");
    let result = path_guard::resolve(&allow, escape.to_str().unwrap());
    assert!(result.is_err());
}

/// Boundary: an empty project directory initializes with zero files and
/// zero components.
#[tokio::test]
async fn empty_project_initializes_cleanly() {
    let dir = TempDir::new().unwrap();
    index::ensure_skeleton(dir.path()).unwrap();
    let registry = Registry::new();
    let (files, components) = registry.reindex(dir.path(), 512_000).await.unwrap();
    assert_eq!(files, 0);
    assert_eq!(components, 0);
}

/// Boundary: a binary file is stubbed with `parse_error = "binary"` and
/// contributes no components.
#[tokio::test]
async fn binary_file_is_stubbed() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("blob.py"), b"\x00\x01\x02not really python").unwrap();
    let registry = Registry::new();
    let (files, components) = registry.reindex(dir.path(), 512_000).await.unwrap();
    assert_eq!(files, 1);
    assert_eq!(components, 0);

    let mini = index::load_mini_librarian(dir.path(), "blob.py").unwrap();
    assert_eq!(mini.parse_error.as_deref(), Some("binary"));
}

/// Boundary: a duplicate top-level name across files is retrievable from
/// both locations via `query_component`.
#[tokio::test]
async fn duplicate_top_level_name_is_retrievable_from_both_files() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.py"), "def dup(): pass\n").unwrap();
    std::fs::write(dir.path().join("z.py"), "def dup(): pass\n").unwrap();

    let registry = Registry::new();
    registry.reindex(dir.path(), 512_000).await.unwrap();

    let hits = query::query_component(&registry, dir.path(), "dup").await.unwrap();
    let files: Vec<&str> = hits.iter().map(|h| h.file.as_str()).collect();
    assert!(files.contains(&"a.py"));
    assert!(files.contains(&"z.py"));
}
