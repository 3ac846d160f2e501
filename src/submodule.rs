//! Submodule inspection and the submodule maintenance steps of a worktree
//! switch.

use std::path::Path;

use crate::cancel::CancelToken;
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Recursive submodule state: path (relative to the parent repository),
/// currently checked out commit and nested submodules.
#[derive(Debug, Clone)]
pub struct SubmoduleStatus {
    pub path: String,
    pub commit: String,
    pub submodules: Vec<SubmoduleStatus>,
}

/// Read the submodule tree of `repo_dir` by running `git submodule status`
/// per nesting level. Uninitialized or conflicted submodules cannot be
/// resolved to a commit and are reported as [`Error::UnsupportedSubmoduleState`].
pub fn get_submodules_status(
    engine: &Engine,
    repo_dir: &Path,
    cancel: &CancelToken,
) -> Result<Vec<SubmoduleStatus>> {
    let output = engine
        .git()
        .dir(repo_dir)
        .args(["submodule", "status"])
        .run(cancel)?;

    let mut result = Vec::new();
    for line in output.stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let (state, commit, path) = parse_submodule_status_line(line)?;
        match state {
            b'-' => {
                return Err(Error::UnsupportedSubmoduleState(format!(
                    "submodule {path} is not initialized"
                )))
            }
            b'U' => {
                return Err(Error::UnsupportedSubmoduleState(format!(
                    "submodule {path} has merge conflicts"
                )))
            }
            _ => {}
        }

        let submodules = get_submodules_status(engine, &repo_dir.join(&path), cancel)?;
        result.push(SubmoduleStatus {
            path,
            commit,
            submodules,
        });
    }
    Ok(result)
}

// [ +-U]<sha1> <path> (<describe>)
fn parse_submodule_status_line(line: &str) -> Result<(u8, String, String)> {
    let state = *line.as_bytes().first().ok_or(Error::UnexpectedStatusFormat {
        line: line.to_string(),
    })?;
    if !matches!(state, b' ' | b'+' | b'-' | b'U') {
        return Err(Error::UnexpectedStatusFormat {
            line: line.to_string(),
        });
    }

    let rest = &line[1..];
    let (commit, tail) = rest.split_once(' ').ok_or(Error::UnexpectedStatusFormat {
        line: line.to_string(),
    })?;
    if commit.len() < 40 || !commit.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::UnexpectedStatusFormat {
            line: line.to_string(),
        });
    }

    // Strip the trailing "(describe)" annotation when present.
    let path = match tail.rfind(" (") {
        Some(idx) if tail.ends_with(')') => &tail[..idx],
        _ => tail,
    };

    Ok((state, commit.to_string(), path.to_string()))
}

/// Synchronize submodule remote URLs with `.gitmodules`.
pub(crate) fn sync_submodules(
    engine: &Engine,
    work_tree_dir: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    engine
        .git()
        .dir(work_tree_dir)
        .args(["submodule", "sync", "--recursive"])
        .run(cancel)?;
    Ok(())
}

/// Initialize and update all submodules recursively.
pub(crate) fn update_submodules(
    engine: &Engine,
    work_tree_dir: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    engine
        .git()
        .dir(work_tree_dir)
        .args(["submodule", "update", "--init", "--recursive"])
        .run(cancel)?;
    Ok(())
}
