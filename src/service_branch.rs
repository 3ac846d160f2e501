//! Service-branch synchronization: capture the live state of a source
//! worktree as a commit on a dedicated service branch, built on top of a
//! source commit.
//!
//! The branch is named after the source commit, so histories built on
//! different source commits never mix. Re-running the sync with an
//! unchanged source worktree produces no new commit and returns the same
//! hash. Staging runs in the cached service worktree with `--work-tree`
//! pointed at the source checkout, leaving the source repository's own
//! index untouched.

use std::path::Path;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::host_lock::DEFAULT_LOCK_TIMEOUT;
use crate::repository::is_ancestor;
use crate::version::GitVersion;
use crate::work_tree::{prepare_work_tree_locked, work_tree_cache_lock_name, CURRENT_COMMIT_FILE};

pub const DEFAULT_SERVICE_BRANCH_PREFIX: &str = "_treesync_";

const BOT_IDENTITY: [&str; 4] = [
    "-c",
    "user.email=treesync@build.local",
    "-c",
    "user.name=treesync",
];

/// Pathspec stdin support (`--pathspec-from-file`) appeared in git 2.25.
const PATHSPEC_FROM_FILE_MIN: GitVersion = GitVersion {
    major: 2,
    minor: 25,
    patch: 0,
};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Prepended to the source commit hash to form the branch name.
    pub service_branch_prefix: String,
    /// Glob patterns whose source-worktree changes are kept out of the
    /// sync commit.
    pub exclude_globs: Vec<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            service_branch_prefix: DEFAULT_SERVICE_BRANCH_PREFIX.to_string(),
            exclude_globs: Vec::new(),
        }
    }
}

/// Commit the current state of `source_work_tree_dir` onto the service
/// branch for `source_commit` and return the resulting branch head. Returns
/// the existing head unchanged when the source worktree adds nothing.
pub fn sync_source_work_tree_with_service_branch(
    engine: &Engine,
    git_dir: &Path,
    source_work_tree_dir: &Path,
    cache_dir: &Path,
    source_commit: &str,
    opts: &SyncOptions,
    cancel: &CancelToken,
) -> Result<String> {
    engine.locker().with_lock(
        &work_tree_cache_lock_name(cache_dir),
        DEFAULT_LOCK_TIMEOUT,
        cancel,
        || {
            sync_locked(
                engine,
                git_dir,
                source_work_tree_dir,
                cache_dir,
                source_commit,
                opts,
                cancel,
            )
        },
    )
}

fn sync_locked(
    engine: &Engine,
    git_dir: &Path,
    source_work_tree_dir: &Path,
    cache_dir: &Path,
    source_commit: &str,
    opts: &SyncOptions,
    cancel: &CancelToken,
) -> Result<String> {
    let service_work_tree_dir =
        prepare_work_tree_locked(engine, git_dir, cache_dir, source_commit, true, cancel)?;

    // The sync rewrites the checkout; the commit marker must not claim the
    // worktree still sits at the source commit.
    let marker = cache_dir.join(CURRENT_COMMIT_FILE);
    if marker.exists() {
        std::fs::remove_file(&marker)
            .map_err(|e| Error::io(format!("unable to remove {}", marker.display()), e))?;
    }

    let branch = format!("{}{}", opts.service_branch_prefix, source_commit);
    let head = get_or_create_service_branch_head(
        engine,
        &service_work_tree_dir,
        &branch,
        source_commit,
        cancel,
    )?;

    // The prepare step leaves the worktree detached at the source commit;
    // the branch must be checked out before merging so the merge commit
    // lands on the branch and not on a discarded detached HEAD.
    engine
        .git()
        .dir(&service_work_tree_dir)
        .args(["checkout", &branch])
        .run(cancel)?;

    if head != source_commit
        && !is_ancestor(engine, git_dir, source_commit, &head, cancel)?
    {
        merge_source_commit(engine, &service_work_tree_dir, &branch, source_commit, cancel)?;
    }

    let head = rev_parse(engine, &service_work_tree_dir, &branch, cancel)?;

    let reverted_excluded = revert_excluded_changes(
        engine,
        source_work_tree_dir,
        &service_work_tree_dir,
        source_commit,
        &head,
        &opts.exclude_globs,
        cancel,
    )?;

    let has_new_changes = stage_changes(
        engine,
        source_work_tree_dir,
        &service_work_tree_dir,
        &opts.exclude_globs,
        true,
        cancel,
    )?;

    if !reverted_excluded && !has_new_changes {
        debug!(
            target: "treesync::service_branch",
            "no changes on {branch}, reusing head {head}"
        );
        return Ok(head);
    }

    stage_changes(
        engine,
        source_work_tree_dir,
        &service_work_tree_dir,
        &opts.exclude_globs,
        false,
        cancel,
    )?;

    let new_head = commit_changes(engine, &service_work_tree_dir, &branch, cancel)?;

    info!(
        target: "treesync::service_branch",
        "synced {} onto {branch}: {new_head}",
        source_work_tree_dir.display()
    );
    Ok(new_head)
}

/// Resolve the service branch head, creating the branch at the source
/// commit when it does not exist yet.
fn get_or_create_service_branch_head(
    engine: &Engine,
    service_work_tree_dir: &Path,
    branch: &str,
    source_commit: &str,
    cancel: &CancelToken,
) -> Result<String> {
    let existing = engine
        .git()
        .dir(service_work_tree_dir)
        .args(["branch", "--list", branch])
        .run(cancel)?;

    if existing.stdout.trim().is_empty() {
        engine
            .git()
            .dir(service_work_tree_dir)
            .args(["checkout", "-b", branch, source_commit])
            .run(cancel)?;
        return Ok(source_commit.to_string());
    }

    rev_parse(engine, service_work_tree_dir, branch, cancel)
}

/// Bring new source history into the service branch without touching its
/// tree (`-s ours`). Unrelated histories are allowed: a rebased source
/// branch shares no ancestry with the old service commits.
fn merge_source_commit(
    engine: &Engine,
    service_work_tree_dir: &Path,
    branch: &str,
    source_commit: &str,
    cancel: &CancelToken,
) -> Result<()> {
    let mut args: Vec<String> = BOT_IDENTITY.iter().map(|s| s.to_string()).collect();
    args.extend(
        [
            "merge",
            "--no-edit",
            "-s",
            "ours",
            "--allow-unrelated-histories",
            source_commit,
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    engine
        .git()
        .dir(service_work_tree_dir)
        .args(args)
        .run(cancel)
        .map_err(|err| {
            Error::Other(format!(
                "unable to merge commit {source_commit} into service branch {branch}: {err}. \
                 Delete the service branch manually to recover"
            ))
        })?;
    Ok(())
}

/// Reset excluded paths in the service index back to their source-commit
/// content. Returns true when anything was reverted.
fn revert_excluded_changes(
    engine: &Engine,
    source_work_tree_dir: &Path,
    service_work_tree_dir: &Path,
    source_commit: &str,
    head: &str,
    exclude_globs: &[String],
    cancel: &CancelToken,
) -> Result<bool> {
    if exclude_globs.is_empty() || head == source_commit {
        return Ok(false);
    }

    let mut diff_args = vec![
        "-c".to_string(),
        "diff.renames=false".to_string(),
        "-c".to_string(),
        "core.quotePath=false".to_string(),
        "diff".to_string(),
        "--binary".to_string(),
        head.to_string(),
        source_commit.to_string(),
        "--".to_string(),
    ];
    diff_args.extend(exclude_globs.iter().cloned());

    let diff = engine
        .git()
        .dir(source_work_tree_dir)
        .args(diff_args)
        .run(cancel)?;

    if diff.stdout.is_empty() {
        return Ok(false);
    }

    engine
        .git()
        .dir(service_work_tree_dir)
        .args(["apply", "--binary", "--index"])
        .stdin(diff.stdout.into_bytes())
        .run(cancel)?;
    Ok(true)
}

/// Stage everything in the source worktree except the excluded globs, into
/// the service worktree's index. With `dry_run` the index is untouched and
/// the return value reports whether anything would be staged.
fn stage_changes(
    engine: &Engine,
    source_work_tree_dir: &Path,
    service_work_tree_dir: &Path,
    exclude_globs: &[String],
    dry_run: bool,
    cancel: &CancelToken,
) -> Result<bool> {
    let mut pathspecs = vec![":.".to_string()];
    pathspecs.extend(exclude_globs.iter().map(|glob| format!(":!{glob}")));

    let mut args = vec![
        "--work-tree".to_string(),
        source_work_tree_dir.display().to_string(),
        "add".to_string(),
    ];
    if dry_run {
        args.push("--dry-run".to_string());
        args.push("--ignore-missing".to_string());
    }

    let output = if engine.git_version() >= PATHSPEC_FROM_FILE_MIN {
        args.push("--pathspec-from-file=-".to_string());
        args.push("--pathspec-file-nul".to_string());
        engine
            .git()
            .dir(service_work_tree_dir)
            .args(args)
            .stdin(pathspecs.join("\0").into_bytes())
            .run(cancel)?
    } else {
        args.push("--".to_string());
        args.extend(pathspecs);
        engine
            .git()
            .dir(service_work_tree_dir)
            .args(args)
            .run(cancel)?
    };

    if dry_run {
        Ok(!output.combined.trim().is_empty())
    } else {
        Ok(true)
    }
}

fn commit_changes(
    engine: &Engine,
    service_work_tree_dir: &Path,
    branch: &str,
    cancel: &CancelToken,
) -> Result<String> {
    let message = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string();

    let mut args: Vec<String> = BOT_IDENTITY.iter().map(|s| s.to_string()).collect();
    args.extend(
        ["commit", "--no-verify", "-m", &message]
            .iter()
            .map(|s| s.to_string()),
    );
    engine
        .git()
        .dir(service_work_tree_dir)
        .args(args)
        .run(cancel)?;

    let new_head = rev_parse(engine, service_work_tree_dir, branch, cancel)?;

    engine
        .git()
        .dir(service_work_tree_dir)
        .args(["checkout", "--force", "--detach", &new_head])
        .run(cancel)?;

    Ok(new_head)
}

fn rev_parse(
    engine: &Engine,
    work_tree_dir: &Path,
    rev: &str,
    cancel: &CancelToken,
) -> Result<String> {
    let output = engine
        .git()
        .dir(work_tree_dir)
        .args(["rev-parse", rev])
        .run(cancel)?;
    Ok(output.stdout.trim().to_string())
}
