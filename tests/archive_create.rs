mod common;

use std::collections::HashMap;

use common::{have_git, init_engine, TestRepo};
use treesync::{AnyPathFilter, ArchiveOptions, ArchiveType, CancelToken, GlobPathFilter};

#[cfg(unix)]
fn make_executable(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).expect("stat").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("chmod");
}

fn tar_entries(bytes: &[u8]) -> HashMap<String, (u32, Vec<u8>)> {
    use std::io::Read;
    let mut archive = tar::Archive::new(bytes);
    let mut result = HashMap::new();
    for entry in archive.entries().expect("tar entries") {
        let mut entry = entry.expect("tar entry");
        let path = entry
            .path()
            .expect("entry path")
            .to_string_lossy()
            .into_owned();
        let mode = entry.header().mode().expect("entry mode");
        let mut content = Vec::new();
        entry.read_to_end(&mut content).expect("entry content");
        result.insert(path, (mode, content));
    }
    result
}

#[test]
fn test_archive_whole_tree() {
    if !have_git() {
        eprintln!("skipping: git not found in PATH");
        return;
    }
    let repo = TestRepo::new();
    repo.write("a.txt", "alpha\n");
    repo.write("dir/b.txt", "beta\n");
    let commit = repo.commit_all("c1");

    let td = tempfile::tempdir().expect("tmpdir");
    let engine = init_engine(&td.path().join("locks"));
    let cancel = CancelToken::new();

    let mut out = Vec::new();
    let desc = engine
        .create_archive(
            &repo.git_dir(),
            &td.path().join("cache"),
            &mut out,
            &ArchiveOptions {
                commit,
                with_submodules: false,
                filter: &AnyPathFilter,
            },
            &cancel,
        )
        .expect("create_archive failed");

    assert_eq!(desc.archive_type, ArchiveType::Directory);
    assert!(!desc.is_empty);

    let entries = tar_entries(&out);
    assert_eq!(entries["a.txt"].1, b"alpha\n");
    assert_eq!(entries["dir/b.txt"].1, b"beta\n");
}

#[cfg(unix)]
#[test]
fn test_archive_preserves_index_mode() {
    if !have_git() {
        eprintln!("skipping: git not found in PATH");
        return;
    }
    let repo = TestRepo::new();
    repo.write("run.sh", "#!/bin/sh\n");
    make_executable(&repo.path().join("run.sh"));
    repo.write("plain.txt", "p\n");
    let commit = repo.commit_all("c1");

    let td = tempfile::tempdir().expect("tmpdir");
    let engine = init_engine(&td.path().join("locks"));
    let cancel = CancelToken::new();

    let mut out = Vec::new();
    engine
        .create_archive(
            &repo.git_dir(),
            &td.path().join("cache"),
            &mut out,
            &ArchiveOptions {
                commit,
                with_submodules: false,
                filter: &AnyPathFilter,
            },
            &cancel,
        )
        .expect("create_archive failed");

    let entries = tar_entries(&out);
    assert_eq!(entries["run.sh"].0 & 0o777, 0o755, "{entries:?}");
    assert_eq!(entries["plain.txt"].0 & 0o777, 0o644, "{entries:?}");
}

#[cfg(unix)]
#[test]
fn test_archive_symlink_entry_keeps_target_and_mode() {
    if !have_git() {
        eprintln!("skipping: git not found in PATH");
        return;
    }
    let repo = TestRepo::new();
    repo.write("target.txt", "t\n");
    std::os::unix::fs::symlink("target.txt", repo.path().join("link")).expect("symlink");
    let commit = repo.commit_all("c1");

    let td = tempfile::tempdir().expect("tmpdir");
    let engine = init_engine(&td.path().join("locks"));
    let cancel = CancelToken::new();

    let mut out = Vec::new();
    engine
        .create_archive(
            &repo.git_dir(),
            &td.path().join("cache"),
            &mut out,
            &ArchiveOptions {
                commit,
                with_submodules: false,
                filter: &AnyPathFilter,
            },
            &cancel,
        )
        .expect("create_archive failed");

    let mut archive = tar::Archive::new(out.as_slice());
    let mut found = false;
    for entry in archive.entries().expect("tar entries") {
        let entry = entry.expect("tar entry");
        if entry.path().expect("entry path").to_string_lossy() != "link" {
            continue;
        }
        found = true;
        assert_eq!(entry.header().entry_type(), tar::EntryType::Symlink);
        assert_eq!(entry.header().mode().expect("entry mode") & 0o7777, 0o777);
        let target = entry
            .link_name()
            .expect("link name")
            .expect("link target missing");
        assert_eq!(target.to_string_lossy(), "target.txt");
    }
    assert!(found, "link entry missing from archive");
}

#[test]
fn test_archive_scoped_to_base_path() {
    if !have_git() {
        eprintln!("skipping: git not found in PATH");
        return;
    }
    let repo = TestRepo::new();
    repo.write("src/lib.rs", "lib\n");
    repo.write("docs/readme.md", "docs\n");
    let commit = repo.commit_all("c1");

    let td = tempfile::tempdir().expect("tmpdir");
    let engine = init_engine(&td.path().join("locks"));
    let cancel = CancelToken::new();

    let filter =
        GlobPathFilter::new("src", &[] as &[&str], &[] as &[&str]).expect("filter build failed");
    let mut out = Vec::new();
    let desc = engine
        .create_archive(
            &repo.git_dir(),
            &td.path().join("cache"),
            &mut out,
            &ArchiveOptions {
                commit,
                with_submodules: false,
                filter: &filter,
            },
            &cancel,
        )
        .expect("create_archive failed");

    assert_eq!(desc.archive_type, ArchiveType::Directory);
    let entries = tar_entries(&out);
    assert!(entries.contains_key("lib.rs"), "{entries:?}");
    assert!(!entries.keys().any(|k| k.contains("readme")), "{entries:?}");
}

#[test]
fn test_archive_missing_base_path_fails() {
    if !have_git() {
        eprintln!("skipping: git not found in PATH");
        return;
    }
    let repo = TestRepo::new();
    repo.write("a.txt", "a\n");
    let commit = repo.commit_all("c1");

    let td = tempfile::tempdir().expect("tmpdir");
    let engine = init_engine(&td.path().join("locks"));
    let cancel = CancelToken::new();

    let filter =
        GlobPathFilter::new("no/such/dir", &[] as &[&str], &[] as &[&str]).expect("filter build failed");
    let mut out = Vec::new();
    let err = engine
        .create_archive(
            &repo.git_dir(),
            &td.path().join("cache"),
            &mut out,
            &ArchiveOptions {
                commit,
                with_submodules: false,
                filter: &filter,
            },
            &cancel,
        )
        .expect_err("missing base path must fail");
    assert!(err.to_string().contains("does not exist"), "{err}");
}
