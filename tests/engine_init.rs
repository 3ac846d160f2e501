mod common;

use common::have_git;
use treesync::{CancelToken, Engine, Error, Options};

#[test]
fn test_init_discovers_git_and_version() {
    if !have_git() {
        eprintln!("skipping: git not found in PATH");
        return;
    }
    let engine = Engine::init(Options::default()).expect("engine init failed");
    let version = engine.git_version();
    assert!(version.major >= 2, "unexpected git version {version}");

    // Engine is usable in assertion messages and diagnostics.
    let rendered = format!("{engine:?}");
    assert!(rendered.contains("git_version"), "{rendered}");
}

#[test]
fn test_init_fails_for_missing_binary() {
    let err = Engine::init(Options {
        git_binary: Some("/no/such/git-binary".into()),
        ..Default::default()
    })
    .expect_err("init with bogus binary must fail");
    assert!(matches!(err, Error::Io { .. }), "{err}");
}

#[test]
fn test_cancelled_token_aborts_operations() {
    if !have_git() {
        eprintln!("skipping: git not found in PATH");
        return;
    }
    let engine = Engine::init(Options::default()).expect("engine init failed");

    let cancel = CancelToken::new();
    cancel.cancel();
    let td = tempfile::tempdir().expect("tmpdir");
    let result = engine.status(td.path(), &cancel);
    assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");
}
