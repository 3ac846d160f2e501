//! Miscellaneous repository plumbing: ref listing, ancestry checks,
//! integrity checks, fetching and shallow-clone probes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::version::GitVersion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefDescriptor {
    pub commit: String,
    pub ref_name: String,
}

/// List all refs of the repository (`git show-ref`).
pub fn show_ref(engine: &Engine, repo_dir: &Path, cancel: &CancelToken) -> Result<Vec<RefDescriptor>> {
    let output = engine
        .git()
        .dir(repo_dir)
        .arg("show-ref")
        .run(cancel)?;
    parse_show_ref(&output.stdout)
}

pub(crate) fn parse_show_ref(output: &str) -> Result<Vec<RefDescriptor>> {
    let mut refs = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let (commit, ref_name) = line
            .split_once(' ')
            .ok_or_else(|| Error::Other(format!("unexpected show-ref line: {line:?}")))?;
        refs.push(RefDescriptor {
            commit: commit.to_string(),
            ref_name: ref_name.to_string(),
        });
    }
    Ok(refs)
}

/// True if `ancestor_commit` is an ancestor of `descendant_commit`.
/// `merge-base --is-ancestor` answers through the exit code: 0 yes, 1 no,
/// anything else is a real failure.
pub fn is_ancestor(
    engine: &Engine,
    git_dir: &Path,
    ancestor_commit: &str,
    descendant_commit: &str,
    cancel: &CancelToken,
) -> Result<bool> {
    let cmd = engine.git().args([
        "--git-dir",
        &git_dir.display().to_string(),
        "merge-base",
        "--is-ancestor",
        ancestor_commit,
        descendant_commit,
    ]);
    let (status, output) = cmd.run_unchecked(cancel)?;
    match status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(Error::CommandFailed {
            command: cmd.render(),
            status,
            output: output.combined,
        }),
    }
}

#[derive(Debug, Default, Clone)]
pub struct FsckOptions {
    pub full: bool,
    pub strict: bool,
    pub unreachable: bool,
}

/// Verify object-store connectivity/validity; returns git's report text.
pub fn fsck(
    engine: &Engine,
    repo_dir: &Path,
    opts: &FsckOptions,
    cancel: &CancelToken,
) -> Result<String> {
    let mut args = vec!["fsck".to_string()];
    if opts.full {
        args.push("--full".to_string());
    }
    if opts.strict {
        args.push("--strict".to_string());
    }
    if opts.unreachable {
        args.push("--unreachable".to_string());
    }
    let output = engine.git().dir(repo_dir).args(args).run(cancel)?;
    Ok(output.combined)
}

#[derive(Debug, Default, Clone)]
pub struct FetchOptions {
    pub all: bool,
    pub tags_only: bool,
    pub prune: bool,
    pub prune_tags: bool,
    pub unshallow: bool,
    pub update_head_ok: bool,
    /// Remote name to refspecs.
    pub refspecs: HashMap<String, Vec<String>>,
}

pub fn fetch(
    engine: &Engine,
    repo_dir: &Path,
    opts: &FetchOptions,
    cancel: &CancelToken,
) -> Result<()> {
    let mut args = vec!["fetch".to_string()];
    if opts.unshallow {
        args.push("--unshallow".to_string());
    }
    if opts.all {
        args.push("--all".to_string());
    }
    if opts.tags_only {
        args.push("--tags".to_string());
    }
    if opts.update_head_ok {
        args.push("--update-head-ok".to_string());
    }
    if opts.prune || opts.prune_tags {
        args.push("--prune".to_string());
        // --prune-tags appeared in 2.17.
        let prune_tags_supported = engine.git_version()
            >= GitVersion {
                major: 2,
                minor: 17,
                patch: 0,
            };
        if opts.prune_tags && prune_tags_supported {
            args.push("--prune-tags".to_string());
        }
    }
    for (remote, refspecs) in &opts.refspecs {
        args.push(remote.clone());
        args.extend(refspecs.iter().cloned());
    }

    engine.git().dir(repo_dir).args(args).run(cancel)?;
    Ok(())
}

/// True when the repository is a shallow clone. `rev-parse
/// --is-shallow-repository` appeared in 2.15; older versions fall back to
/// probing the shallow file inside the git dir.
pub fn is_shallow_clone(engine: &Engine, repo_dir: &Path, cancel: &CancelToken) -> Result<bool> {
    let supported = engine.git_version()
        >= GitVersion {
            major: 2,
            minor: 15,
            patch: 0,
        };
    if !supported {
        let git_dir = resolve_repo_dir(engine, repo_dir, cancel)?;
        let git_dir = if git_dir.is_absolute() {
            git_dir
        } else {
            repo_dir.join(git_dir)
        };
        return Ok(git_dir.join("shallow").is_file());
    }

    let output = engine
        .git()
        .dir(repo_dir)
        .args(["rev-parse", "--is-shallow-repository"])
        .run(cancel)?;
    Ok(output.stdout.trim() == "true")
}

/// Resolve a branch name to its tip commit.
pub fn get_last_branch_commit(
    engine: &Engine,
    repo_dir: &Path,
    branch: &str,
    cancel: &CancelToken,
) -> Result<String> {
    let output = engine
        .git()
        .dir(repo_dir)
        .args(["rev-parse", branch])
        .run(cancel)?;
    Ok(output.stdout.trim().to_string())
}

/// Resolve the real git directory behind `repo_dir`
/// (`git --git-dir <dir> rev-parse --git-dir`).
pub fn resolve_repo_dir(engine: &Engine, repo_dir: &Path, cancel: &CancelToken) -> Result<PathBuf> {
    let output = engine
        .git()
        .args([
            "--git-dir",
            &repo_dir.display().to_string(),
            "rev-parse",
            "--git-dir",
        ])
        .run(cancel)?;
    Ok(PathBuf::from(output.stdout.trim()))
}
