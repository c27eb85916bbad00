mod common;

use embermesh::manifests::{InstalledComponents, RepositoryError, RepositoryIndex};
use tempfile::TempDir;

use common::write_manifest;

#[test]
fn open_creates_an_empty_index() {
    let base = TempDir::new().unwrap();
    let index = RepositoryIndex::open(base.path().join("repositories.json")).unwrap();
    assert!(index.list().unwrap().is_empty());
    let raw = std::fs::read_to_string(index.index_file()).unwrap();
    assert_eq!(raw, "[]");
}

#[test]
fn add_then_list_round_trips() {
    let base = TempDir::new().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();

    let index = RepositoryIndex::open(base.path().join("repositories.json")).unwrap();
    assert_eq!(index.add(&repo).unwrap(), 1);
    assert_eq!(index.list().unwrap(), vec![repo]);
}

#[test]
fn duplicate_paths_are_deduplicated() {
    let base = TempDir::new().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();

    let index = RepositoryIndex::open(base.path().join("repositories.json")).unwrap();
    assert_eq!(index.add(&repo).unwrap(), 1);
    assert_eq!(index.add(&repo).unwrap(), 0);
    assert_eq!(index.list().unwrap().len(), 1);
}

#[test]
fn adding_a_missing_path_is_fatal() {
    let base = TempDir::new().unwrap();
    let index = RepositoryIndex::open(base.path().join("repositories.json")).unwrap();
    let err = index.add(base.path().join("does-not-exist")).unwrap_err();
    assert!(matches!(err, RepositoryError::PathNotFound { .. }));
}

#[test]
fn deleting_an_unregistered_path_removes_nothing() {
    let base = TempDir::new().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    let index = RepositoryIndex::open(base.path().join("repositories.json")).unwrap();
    assert_eq!(index.delete(&repo).unwrap(), 0);
}

#[test]
fn deleting_a_vanished_path_still_removes_the_entry() {
    let base = TempDir::new().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();

    let index = RepositoryIndex::open(base.path().join("repositories.json")).unwrap();
    index.add(&repo).unwrap();
    std::fs::remove_dir_all(&repo).unwrap();

    assert_eq!(index.delete(&repo).unwrap(), 1);
    assert!(index.list().unwrap().is_empty());
}

#[test]
fn corrupt_index_reads_as_empty() {
    let base = TempDir::new().unwrap();
    let file = base.path().join("repositories.json");
    let index = RepositoryIndex::open(&file).unwrap();
    std::fs::write(&file, "this is not json").unwrap();
    assert!(index.list().unwrap().is_empty());
}

#[test]
fn malformed_entries_are_skipped_on_read() {
    let base = TempDir::new().unwrap();
    let repo = base.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    let file = base.path().join("repositories.json");
    let index = RepositoryIndex::open(&file).unwrap();
    std::fs::write(
        &file,
        format!(
            r#"[{{"path": "{}"}}, {{"path": "x", "extra": 1}}, {{"nopath": true}}]"#,
            repo.display()
        ),
    )
    .unwrap();
    assert_eq!(index.list().unwrap(), vec![repo]);
}

#[test]
fn discovery_walks_indexed_roots_in_order() {
    let base = TempDir::new().unwrap();
    let repo_a = base.path().join("repo_a");
    let repo_b = base.path().join("repo_b");
    std::fs::create_dir_all(&repo_a).unwrap();
    std::fs::create_dir_all(&repo_b).unwrap();
    write_manifest(&repo_a, "one", "tests.one", &[], &["c1"], &[]);
    write_manifest(&repo_b, "nested/two", "tests.two", &[], &[], &[]);
    // Same name in a later repo is ignored in favour of the first.
    write_manifest(&repo_b, "shadow", "tests.one", &[], &[], &[]);

    let index = RepositoryIndex::open(base.path().join("repositories.json")).unwrap();
    index.add(&repo_a).unwrap();
    index.add(&repo_b).unwrap();

    let installed = InstalledComponents::discover(&index).unwrap();
    assert_eq!(installed.len(), 2);
    assert!(installed.get("tests.one").unwrap().provides("c1"));
    assert!(installed.get("tests.two").is_some());
}
