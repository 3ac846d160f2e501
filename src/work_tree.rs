//! Worktree cache management.
//!
//! Each cache directory owns one checkout of one repository:
//!
//! ```text
//! <cache_dir>/git_dir          path of the owning repository's git dir
//! <cache_dir>/last_access_at   unix timestamp, refreshed on every use
//! <cache_dir>/current_commit   commit hash + newline; absent after a
//!                              failed or partial switch
//! <cache_dir>/worktree/        the actual checkout
//! ```
//!
//! Invariant: when `current_commit` names commit C and the checkout passes
//! the consistency check, the checkout is already at C and is reused without
//! a new checkout.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::host_lock::DEFAULT_LOCK_TIMEOUT;
use crate::submodule::{sync_submodules, update_submodules};

pub(crate) const GIT_DIR_FILE: &str = "git_dir";
pub(crate) const LAST_ACCESS_FILE: &str = "last_access_at";
pub(crate) const CURRENT_COMMIT_FILE: &str = "current_commit";
pub(crate) const WORK_TREE_SUBDIR: &str = "worktree";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorktreeDescriptor {
    pub path: String,
    pub head: String,
    pub branch: String,
}

/// Prepare a checkout of `commit` under `cache_dir`, creating or repairing
/// the cached worktree as needed. Serialized host-wide per cache directory.
pub fn prepare_work_tree(
    engine: &Engine,
    git_dir: &Path,
    cache_dir: &Path,
    commit: &str,
    with_submodules: bool,
    cancel: &CancelToken,
) -> Result<PathBuf> {
    engine.locker().with_lock(
        &work_tree_cache_lock_name(cache_dir),
        DEFAULT_LOCK_TIMEOUT,
        cancel,
        || prepare_work_tree_locked(engine, git_dir, cache_dir, commit, with_submodules, cancel),
    )
}

pub(crate) fn work_tree_cache_lock_name(cache_dir: &Path) -> String {
    format!("git_work_tree_cache {}", cache_dir.display())
}

/// The lock-free body of [`prepare_work_tree`]; also used by callers that
/// already hold the cache-dir lock (service-branch sync, patch producer).
pub(crate) fn prepare_work_tree_locked(
    engine: &Engine,
    git_dir: &Path,
    cache_dir: &Path,
    commit: &str,
    with_submodules: bool,
    cancel: &CancelToken,
) -> Result<PathBuf> {
    let git_dir = absolutize(git_dir)?;
    let cache_dir = absolutize(cache_dir)?;

    fs::create_dir_all(&cache_dir)
        .map_err(|e| Error::io(format!("unable to create dir {}", cache_dir.display()), e))?;

    touch_last_access(&cache_dir)?;

    let git_dir_file = cache_dir.join(GIT_DIR_FILE);
    if !git_dir_file.exists() {
        fs::write(&git_dir_file, format!("{}\n", git_dir.display()))
            .map_err(|e| Error::io(format!("error writing {}", git_dir_file.display()), e))?;
    }

    let work_tree_dir = cache_dir.join(WORK_TREE_SUBDIR);
    let current_commit_file = cache_dir.join(CURRENT_COMMIT_FILE);

    let mut work_tree_exists = work_tree_dir.exists();

    if work_tree_exists {
        match verify_consistency(engine, &git_dir, &work_tree_dir, cancel) {
            Ok(None) => {
                // Marker short-circuit: consistent checkout already at the
                // requested commit is reused as-is.
                if let Ok(current) = fs::read_to_string(&current_commit_file) {
                    if current.trim() == commit {
                        return Ok(work_tree_dir);
                    }
                }
            }
            Ok(Some(reason)) => {
                let err = Error::InconsistentWorktree {
                    path: work_tree_dir.clone(),
                    reason,
                };
                warn!(target: "treesync::work_tree", "{err}, recreating");
                remove_work_tree(&current_commit_file, &work_tree_dir)?;
                work_tree_exists = false;
            }
            Err(err @ (Error::InvalidBacklink { .. } | Error::Io { .. })) => {
                // A malformed, missing or unreadable backlink is a local
                // defect of the cached checkout; it is logged, then repaired
                // like any other inconsistency.
                warn!(target: "treesync::work_tree", "{err}, recreating");
                remove_work_tree(&current_commit_file, &work_tree_dir)?;
                work_tree_exists = false;
            }
            Err(err) => return Err(err),
        }
    }

    if work_tree_exists {
        // Stale marker must not survive a failed switch.
        if current_commit_file.exists() {
            fs::remove_file(&current_commit_file).map_err(|e| {
                Error::io(
                    format!("unable to remove {}", current_commit_file.display()),
                    e,
                )
            })?;
        }
    }

    info!(
        target: "treesync::work_tree",
        "switching worktree {} to commit {commit}",
        work_tree_dir.display()
    );
    switch_work_tree(engine, &git_dir, &work_tree_dir, commit, with_submodules, cancel)?;

    fs::write(&current_commit_file, format!("{commit}\n")).map_err(|e| {
        Error::io(
            format!("error writing {}", current_commit_file.display()),
            e,
        )
    })?;

    Ok(work_tree_dir)
}

fn remove_work_tree(current_commit_file: &Path, work_tree_dir: &Path) -> Result<()> {
    if current_commit_file.exists() {
        fs::remove_file(current_commit_file).map_err(|e| {
            Error::io(
                format!("unable to remove {}", current_commit_file.display()),
                e,
            )
        })?;
    }
    if work_tree_dir.exists() {
        fs::remove_dir_all(work_tree_dir).map_err(|e| {
            Error::io(
                format!(
                    "unable to remove invalidated worktree {}",
                    work_tree_dir.display()
                ),
                e,
            )
        })?;
    }
    Ok(())
}

/// A worktree is consistent when it is registered in the owning repository
/// and its backlink file resolves to a path inside that repository's git dir.
/// Returns `None` when consistent, otherwise the failed check.
fn verify_consistency(
    engine: &Engine,
    git_dir: &Path,
    work_tree_dir: &Path,
    cancel: &CancelToken,
) -> Result<Option<String>> {
    let registered = get_work_tree_list(engine, git_dir, cancel)?
        .iter()
        .any(|desc| same_path(Path::new(&desc.path), work_tree_dir));
    if !registered {
        return Ok(Some(format!("not registered in repo {}", git_dir.display())));
    }

    let backlink = read_backlink(work_tree_dir)?;
    let backlink = backlink.canonicalize().unwrap_or(backlink);
    let git_dir_canon = git_dir.canonicalize().unwrap_or_else(|_| git_dir.to_path_buf());
    if backlink.starts_with(&git_dir_canon) {
        Ok(None)
    } else {
        Ok(Some(format!(
            "backlink {} resolves outside repo {}",
            backlink.display(),
            git_dir.display()
        )))
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => a == b,
    }
}

/// Read the worktree's `.git` backlink file (`gitdir: <path>`).
pub(crate) fn read_backlink(work_tree_dir: &Path) -> Result<PathBuf> {
    let path = work_tree_dir.join(".git");
    let content = fs::read_to_string(&path)
        .map_err(|e| Error::io(format!("unable to read {}", path.display()), e))?;

    let first_line = content.lines().next().unwrap_or_default();
    let target = first_line
        .strip_prefix("gitdir: ")
        .ok_or_else(|| Error::InvalidBacklink {
            path: path.clone(),
            reason: format!("missing `gitdir: ` prefix in {first_line:?}"),
        })?
        .trim();
    if target.is_empty() {
        return Err(Error::InvalidBacklink {
            path,
            reason: "empty gitdir target".to_string(),
        });
    }

    let target = PathBuf::from(target);
    if target.is_absolute() {
        Ok(target)
    } else {
        Ok(work_tree_dir.join(target))
    }
}

fn switch_work_tree(
    engine: &Engine,
    git_dir: &Path,
    work_tree_dir: &Path,
    commit: &str,
    with_submodules: bool,
    cancel: &CancelToken,
) -> Result<()> {
    if !work_tree_dir.exists() {
        engine
            .git()
            .args([
                "-C",
                &git_dir.display().to_string(),
                "worktree",
                "add",
                "--force",
                "--detach",
                &work_tree_dir.display().to_string(),
                commit,
            ])
            .run(cancel)?;
    } else {
        engine
            .git()
            .dir(work_tree_dir)
            .args(["checkout", "--force", "--detach", commit])
            .run(cancel)?;
    }

    engine
        .git()
        .dir(work_tree_dir)
        .args(["reset", "--hard", commit])
        .run(cancel)?;

    engine
        .git()
        .dir(work_tree_dir)
        .args([
            "--work-tree",
            &work_tree_dir.display().to_string(),
            "clean",
            "-d",
            "-f",
            "-f",
            "-x",
        ])
        .run(cancel)?;

    if with_submodules {
        sync_submodules(engine, work_tree_dir, cancel)?;
        update_submodules(engine, work_tree_dir, cancel)?;

        for inner in [
            vec!["reset", "--hard"],
            vec!["clean", "-d", "-f", "-f", "-x"],
        ] {
            let mut args = vec![
                "--work-tree".to_string(),
                work_tree_dir.display().to_string(),
                "submodule".to_string(),
                "foreach".to_string(),
                "--recursive".to_string(),
                "git".to_string(),
                "-c".to_string(),
                "core.autocrlf=false".to_string(),
                "-c".to_string(),
                "gc.auto=0".to_string(),
            ];
            args.extend(inner.into_iter().map(String::from));
            engine.git().dir(work_tree_dir).args(args).run(cancel)?;
        }
    }

    Ok(())
}

/// List registered worktrees of a repository
/// (`git worktree list --porcelain`).
pub fn get_work_tree_list(
    engine: &Engine,
    repo_dir: &Path,
    cancel: &CancelToken,
) -> Result<Vec<WorktreeDescriptor>> {
    let output = engine
        .git()
        .args([
            "-C",
            &repo_dir.display().to_string(),
            "worktree",
            "list",
            "--porcelain",
        ])
        .run(cancel)?;
    Ok(parse_work_tree_list(&output.stdout))
}

pub(crate) fn parse_work_tree_list(output: &str) -> Vec<WorktreeDescriptor> {
    let mut result = Vec::new();
    let mut current: Option<WorktreeDescriptor> = None;

    for line in output.lines() {
        if line.is_empty() {
            if let Some(desc) = current.take() {
                result.push(desc);
            }
            continue;
        }
        let desc = current.get_or_insert_with(WorktreeDescriptor::default);
        if let Some(path) = line.strip_prefix("worktree ") {
            desc.path = path.to_string();
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            desc.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch ") {
            desc.branch = branch.to_string();
        }
    }
    if let Some(desc) = current.take() {
        result.push(desc);
    }
    result
}

fn touch_last_access(cache_dir: &Path) -> Result<()> {
    let path = cache_dir.join(LAST_ACCESS_FILE);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    fs::write(&path, format!("{now}\n"))
        .map_err(|e| Error::io(format!("error writing timestamp file {}", path.display()), e))
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir()
        .map_err(|e| Error::io("unable to determine current dir", e))?;
    Ok(cwd.join(path))
}
