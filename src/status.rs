//! Structured parsing of `git status --porcelain=v2` output.
//!
//! Used by callers that need a change summary without producing a full diff.
//! Renames and ignored files are never reported because status always runs
//! with `--no-renames` and without `--ignored`.

use std::path::Path;

use crate::cancel::CancelToken;
use crate::engine::Engine;
use crate::error::{Error, Result};

#[derive(Debug, Default, Clone)]
pub struct StatusResult {
    pub index: Scope,
    pub worktree: Scope,
    pub untracked: Vec<String>,
}

impl StatusResult {
    /// Union of index and worktree scopes.
    pub fn index_with_worktree(&self) -> Scope {
        let mut paths = self.index.paths.clone();
        paths.extend(self.worktree.paths.iter().cloned());
        let mut submodules = self.index.submodules.clone();
        submodules.extend(self.worktree.submodules.iter().cloned());
        Scope { paths, submodules }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Scope {
    pub paths: Vec<String>,
    pub submodules: Vec<SubmoduleChange>,
}

#[derive(Debug, Clone)]
pub struct SubmoduleChange {
    pub path: String,
    pub is_added: bool,
    pub is_deleted: bool,
    pub is_modified: bool,
    pub is_commit_changed: bool,
    pub has_tracked_changes: bool,
    pub has_untracked_changes: bool,
}

pub fn status(engine: &Engine, work_tree_dir: &Path, cancel: &CancelToken) -> Result<StatusResult> {
    let output = engine
        .git()
        .dir(work_tree_dir)
        .args([
            "status",
            "--porcelain=v2",
            "--untracked-files=all",
            "--no-renames",
        ])
        .run(cancel)?;

    parse_status(&output.stdout)
}

pub(crate) fn parse_status(output: &str) -> Result<StatusResult> {
    let mut result = StatusResult::default();
    for line in output.lines() {
        if line.is_empty() {
            return Err(Error::UnexpectedStatusFormat {
                line: String::new(),
            });
        }
        match line.as_bytes()[0] {
            b'1' => parse_ordinary_entry(&mut result, line)?,
            b'u' => parse_unmerged_entry(&mut result, line)?,
            b'?' => parse_untracked_entry(&mut result, line)?,
            _ => {
                return Err(Error::UnexpectedStatusFormat {
                    line: line.to_string(),
                })
            }
        }
    }
    Ok(result)
}

fn format_err(line: &str) -> Error {
    Error::UnexpectedStatusFormat {
        line: line.to_string(),
    }
}

// 1 <XY> <sub> <mH> <mI> <mW> <hH> <hI> <path>
fn parse_ordinary_entry(result: &mut StatusResult, line: &str) -> Result<()> {
    let fields: Vec<&str> = line.split(' ').collect();
    if fields.len() < 9 {
        return Err(format_err(line));
    }
    let xy = fields[1];
    let sub = fields[2];
    let path = fields[8..].join(" "); // names with spaces

    if sub == "N..." {
        parse_scope_codes(result, xy, &path, line, None)
    } else if sub.starts_with('S') {
        if sub.len() != 4 {
            return Err(format_err(line));
        }
        parse_scope_codes(result, xy, &path, line, Some(sub))
    } else {
        Err(format_err(line))
    }
}

/// Record the entry in the index and/or worktree scope based on the two
/// status codes. For submodule entries (`S<c><m><u>`), the `<sub>` field
/// flags commit/tracked/untracked changes inside the submodule.
fn parse_scope_codes(
    result: &mut StatusResult,
    xy: &str,
    path: &str,
    line: &str,
    submodule_sub: Option<&str>,
) -> Result<()> {
    if xy.len() != 2 {
        return Err(format_err(line));
    }
    let stage_code = xy.as_bytes()[0];
    let worktree_code = xy.as_bytes()[1];

    match submodule_sub {
        None => {
            if stage_code != b'.' {
                result.index.paths.push(path.to_string());
            }
            if worktree_code != b'.' {
                result.worktree.paths.push(path.to_string());
            }
        }
        Some(sub) => {
            let sub = sub.as_bytes();
            let change = |scope_code: u8| SubmoduleChange {
                path: path.to_string(),
                is_added: scope_code == b'A',
                is_deleted: scope_code == b'D',
                is_modified: scope_code == b'M',
                is_commit_changed: sub[1] != b'.',
                has_tracked_changes: sub[2] != b'.',
                has_untracked_changes: sub[3] != b'.',
            };
            if stage_code != b'.' {
                result.index.submodules.push(change(stage_code));
            }
            if worktree_code != b'.' {
                result.worktree.submodules.push(change(worktree_code));
            }
        }
    }
    Ok(())
}

// u <xy> <sub> <m1> <m2> <m3> <mW> <h1> <h2> <h3> <path>
fn parse_unmerged_entry(result: &mut StatusResult, line: &str) -> Result<()> {
    let fields: Vec<&str> = line.split(' ').collect();
    if fields.len() < 11 {
        return Err(format_err(line));
    }
    let xy = fields[1];
    let path = fields[10..].join(" ");
    parse_scope_codes(result, xy, &path, line, None)
}

// ? <path>
fn parse_untracked_entry(result: &mut StatusResult, line: &str) -> Result<()> {
    match line.strip_prefix("? ") {
        Some(path) => {
            result.untracked.push(path.to_string());
            Ok(())
        }
        None => Err(format_err(line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinary_regular_file_scopes() {
        let out = "1 M. N... 100644 100644 100644 aaaa bbbb staged.txt\n\
                   1 .M N... 100644 100644 100644 aaaa bbbb dirty.txt\n\
                   1 MM N... 100644 100644 100644 aaaa bbbb both.txt\n";
        let r = parse_status(out).expect("parse failed");
        assert_eq!(r.index.paths, vec!["staged.txt", "both.txt"]);
        assert_eq!(r.worktree.paths, vec!["dirty.txt", "both.txt"]);
        assert!(r.untracked.is_empty());
    }

    #[test]
    fn test_path_with_spaces() {
        let out = "1 .M N... 100644 100644 100644 aaaa bbbb my file.txt\n";
        let r = parse_status(out).expect("parse failed");
        assert_eq!(r.worktree.paths, vec!["my file.txt"]);
    }

    #[test]
    fn test_untracked_entry() {
        let out = "? build/output.bin\n";
        let r = parse_status(out).expect("parse failed");
        assert_eq!(r.untracked, vec!["build/output.bin"]);
    }

    #[test]
    fn test_unmerged_entry() {
        let out = "u UU N... 100644 100644 100644 100644 a1 a2 a3 conflicted.txt\n";
        let r = parse_status(out).expect("parse failed");
        assert_eq!(r.index.paths, vec!["conflicted.txt"]);
        assert_eq!(r.worktree.paths, vec!["conflicted.txt"]);
    }

    #[test]
    fn test_submodule_entry_flags() {
        let out = "1 .M SC.U 160000 160000 160000 aaaa bbbb libs/dep\n";
        let r = parse_status(out).expect("parse failed");
        assert_eq!(r.worktree.submodules.len(), 1);
        let sub = &r.worktree.submodules[0];
        assert_eq!(sub.path, "libs/dep");
        assert!(sub.is_modified);
        assert!(sub.is_commit_changed);
        assert!(!sub.has_tracked_changes);
        assert!(sub.has_untracked_changes);
    }

    #[test]
    fn test_rename_entry_is_hard_error() {
        let out = "2 R. N... 100644 100644 100644 aaaa bbbb R100 new.txt\told.txt\n";
        let err = parse_status(out).expect_err("rename lines are unexpected with --no-renames");
        assert!(matches!(err, Error::UnexpectedStatusFormat { .. }));
    }

    #[test]
    fn test_unknown_leader_is_hard_error() {
        let err = parse_status("x whatever\n").expect_err("unknown leader must fail");
        assert!(matches!(err, Error::UnexpectedStatusFormat { .. }));
    }

    #[test]
    fn test_index_with_worktree_union() {
        let out = "1 M. N... 100644 100644 100644 aaaa bbbb a.txt\n\
                   1 .M N... 100644 100644 100644 aaaa bbbb b.txt\n";
        let r = parse_status(out).expect("parse failed");
        let union = r.index_with_worktree();
        assert_eq!(union.paths, vec!["a.txt", "b.txt"]);
    }
}
