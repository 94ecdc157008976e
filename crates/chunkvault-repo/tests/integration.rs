//! End-to-end repository behavior on disk.

use chunkvault_repo::{ChangeKind, MergeOutcome, RepoConfig, RepoError, Repository};
use chunkvault_store::{EncryptionKey, HashValue, StoreRegistry};
use tempfile::TempDir;

fn init(registry: &StoreRegistry, dir: &std::path::Path) -> Repository {
    Repository::init(registry, dir, RepoConfig::default(), None).unwrap()
}

#[test]
fn test_commit_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let registry = StoreRegistry::new();
    let repo = init(&registry, dir.path());
    repo.write_bytes("a", b"hello").unwrap();
    repo.write_bytes("dir/b", b"world").unwrap();
    let head = repo.commit("first").unwrap().unwrap();
    repo.close(&registry);
    registry.prune();
    assert_eq!(registry.open_count(), 0);

    let repo = Repository::open(&registry, dir.path(), RepoConfig::default(), None).unwrap();
    assert_eq!(repo.head(), Some(head));
    assert_eq!(repo.revision(), 1);
    assert_eq!(repo.read_bytes("a").unwrap(), b"hello");
    assert_eq!(repo.read_bytes("dir/b").unwrap(), b"world");
    assert_eq!(repo.list_directories("").unwrap(), vec!["dir"]);
    assert_eq!(repo.list_files("").unwrap(), vec!["a"]);
}

#[test]
fn test_second_commit_without_changes_is_noop() {
    let dir = TempDir::new().unwrap();
    let registry = StoreRegistry::new();
    let repo = init(&registry, dir.path());
    repo.write_bytes("file", b"x").unwrap();
    let head = repo.commit("one").unwrap();
    assert!(head.is_some());
    assert_eq!(repo.commit("two").unwrap(), None);
    assert_eq!(repo.revision(), 1);
    assert_eq!(repo.head(), head);
}

#[test]
fn test_open_missing_repository_fails() {
    let dir = TempDir::new().unwrap();
    let err = Repository::open(&StoreRegistry::new(), &dir.path().join("none"), RepoConfig::default(), None)
        .unwrap_err();
    assert!(matches!(err, RepoError::Store(_)));
}

#[test]
fn test_fast_forward_from_clone() {
    let registry = StoreRegistry::new();
    let origin_dir = TempDir::new().unwrap();
    let clone_dir = TempDir::new().unwrap();
    let origin = init(&registry, origin_dir.path());
    let clone = init(&registry, clone_dir.path());

    origin.write_bytes("readme", b"v1").unwrap();
    let first = origin.commit("v1").unwrap().unwrap();
    assert_eq!(
        clone.merge(&origin.accessor(), &first).unwrap(),
        MergeOutcome::FastForward(first)
    );
    assert_eq!(clone.read_bytes("readme").unwrap(), b"v1");

    origin.write_bytes("readme", b"v2").unwrap();
    let second = origin.commit("v2").unwrap().unwrap();
    assert_eq!(
        clone.merge(&origin.accessor(), &second).unwrap(),
        MergeOutcome::FastForward(second)
    );
    assert_eq!(clone.head(), Some(second));
    assert_eq!(clone.revision(), 2);
    assert_eq!(clone.read_bytes("readme").unwrap(), b"v2");

    assert_eq!(
        clone.merge(&origin.accessor(), &second).unwrap(),
        MergeOutcome::FastForward(second)
    );
    assert_eq!(clone.revision(), 2);
}

#[test]
fn test_diverged_histories_merge() {
    let registry = StoreRegistry::new();
    let left_dir = TempDir::new().unwrap();
    let right_dir = TempDir::new().unwrap();
    let left = init(&registry, left_dir.path());
    let right = init(&registry, right_dir.path());

    left.write_bytes("shared", b"base").unwrap();
    let base = left.commit("base").unwrap().unwrap();
    right.merge(&left.accessor(), &base).unwrap();

    left.write_bytes("left/only", b"L").unwrap();
    left.commit("left").unwrap();
    right.write_bytes("right/only", b"R").unwrap();
    let right_head = right.commit("right").unwrap().unwrap();

    let MergeOutcome::Merged(merged) = left.merge(&right.accessor(), &right_head).unwrap() else {
        panic!("expected a merge commit");
    };
    assert_eq!(left.head(), Some(merged));
    assert_eq!(left.read_bytes("left/only").unwrap(), b"L");
    assert_eq!(left.read_bytes("right/only").unwrap(), b"R");
    assert_eq!(left.read_bytes("shared").unwrap(), b"base");
    assert_eq!(left.last_merge_stats().conflicts, 0);
    let history = left.history().unwrap();
    assert_eq!(history[0].commit.parents.len(), 2);

    let diff = left.get_diff(&base.data_hash, &merged.data_hash).unwrap();
    let paths: Vec<(&str, ChangeKind)> = diff.iter().map(|e| (e.path.as_str(), e.kind)).collect();
    assert_eq!(
        paths,
        vec![
            ("left", ChangeKind::Added),
            ("left/only", ChangeKind::Added),
            ("right", ChangeKind::Added),
            ("right/only", ChangeKind::Added),
        ]
    );

    assert_eq!(
        right.merge(&left.accessor(), &merged).unwrap(),
        MergeOutcome::FastForward(merged)
    );
}

#[test]
fn test_unrelated_histories_do_not_merge() {
    let registry = StoreRegistry::new();
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    let a = init(&registry, a_dir.path());
    let b = init(&registry, b_dir.path());
    a.write_bytes("x", b"a").unwrap();
    a.commit("a").unwrap();
    b.write_bytes("y", b"b").unwrap();
    let b_head = b.commit("b").unwrap().unwrap();
    assert!(matches!(
        a.merge(&b.accessor(), &b_head),
        Err(RepoError::NoCommonAncestor { .. })
    ));
}

#[test]
fn test_encrypted_repository_needs_its_key() {
    let dir = TempDir::new().unwrap();
    let registry = StoreRegistry::new();
    let key = || Some(EncryptionKey([42; 32]));
    let repo = Repository::init(&registry, dir.path(), RepoConfig::default(), key()).unwrap();
    repo.write_bytes("secret", b"plans").unwrap();
    let head = repo.commit("sealed").unwrap().unwrap();
    let entry = repo.log_entries().pop().unwrap();
    assert!(!entry.message.contains(&head.data_hash.to_hex()));
    repo.close(&registry);

    let reopened = Repository::open(&registry, dir.path(), RepoConfig::default(), key()).unwrap();
    assert_eq!(reopened.read_bytes("secret").unwrap(), b"plans");
    reopened.close(&registry);

    let wrong = Repository::open(
        &registry,
        dir.path(),
        RepoConfig::default(),
        Some(EncryptionKey([7; 32])),
    );
    assert!(wrong.is_err_and(|e| e.is_crypto()));
}

#[test]
fn test_diff_of_unknown_commit() {
    let dir = TempDir::new().unwrap();
    let repo = init(&StoreRegistry::new(), dir.path());
    repo.write_bytes("a", b"1").unwrap();
    let head = repo.commit("one").unwrap().unwrap();
    assert!(matches!(
        repo.get_diff(&head.data_hash, &HashValue::of(b"missing")),
        Err(RepoError::CommitNotFound(_))
    ));
}
