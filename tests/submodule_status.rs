mod common;

use common::{have_git, init_engine, run_git, TestRepo};
use treesync::CancelToken;

#[test]
fn test_submodule_status_lists_nested_commit() {
    if !have_git() {
        eprintln!("skipping: git not found in PATH");
        return;
    }
    let sub = TestRepo::new();
    sub.write("lib.txt", "lib\n");
    let sub_commit = sub.commit_all("sub c1");

    let repo = TestRepo::new();
    repo.write("a.txt", "a\n");
    repo.commit_all("c1");
    run_git(
        repo.path(),
        &[
            "submodule",
            "add",
            sub.path().to_str().expect("utf8 path"),
            "vendor/lib",
        ],
    );
    repo.commit_all("add submodule");

    let td = tempfile::tempdir().expect("tmpdir");
    let engine = init_engine(&td.path().join("locks"));
    let cancel = CancelToken::new();

    let status = engine
        .get_submodules_status(repo.path(), &cancel)
        .expect("get_submodules_status failed");
    assert_eq!(status.len(), 1, "{status:?}");
    assert_eq!(status[0].path, "vendor/lib");
    assert_eq!(status[0].commit, sub_commit);
    assert!(status[0].submodules.is_empty());
}

#[test]
fn test_submodule_status_empty_without_submodules() {
    if !have_git() {
        eprintln!("skipping: git not found in PATH");
        return;
    }
    let repo = TestRepo::new();
    repo.write("a.txt", "a\n");
    repo.commit_all("c1");

    let td = tempfile::tempdir().expect("tmpdir");
    let engine = init_engine(&td.path().join("locks"));
    let cancel = CancelToken::new();

    let status = engine
        .get_submodules_status(repo.path(), &cancel)
        .expect("get_submodules_status failed");
    assert!(status.is_empty(), "{status:?}");
}

#[test]
fn test_prepare_work_tree_with_submodules() {
    if !have_git() {
        eprintln!("skipping: git not found in PATH");
        return;
    }
    // `submodule update` spawns clones that read neither the superproject's
    // local config nor the helper's `-c protocol.file.allow` flag; the env
    // override is the only setting every descendant process inherits.
    std::env::set_var("GIT_ALLOW_PROTOCOL", "file");

    let sub = TestRepo::new();
    sub.write("lib.txt", "lib\n");
    sub.commit_all("sub c1");

    let repo = TestRepo::new();
    repo.write("a.txt", "a\n");
    repo.commit_all("c1");
    run_git(
        repo.path(),
        &[
            "-c",
            "protocol.file.allow=always",
            "submodule",
            "add",
            sub.path().to_str().expect("utf8 path"),
            "vendor/lib",
        ],
    );
    let commit = repo.commit_all("add submodule");

    let td = tempfile::tempdir().expect("tmpdir");
    let engine = init_engine(&td.path().join("locks"));
    let cancel = CancelToken::new();

    let wt = engine
        .prepare_work_tree(&repo.git_dir(), &td.path().join("cache"), &commit, true, &cancel)
        .expect("prepare with submodules failed");
    assert!(
        wt.join("vendor/lib/lib.txt").is_file(),
        "submodule content missing in {}",
        wt.display()
    );
}
