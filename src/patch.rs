//! Patch creation: a filtered `git diff` between two commits, streamed
//! through the diff parser into the caller's writer.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::cancel::CancelToken;
use crate::diff_parser::DiffParser;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::host_lock::DEFAULT_LOCK_TIMEOUT;
use crate::path_filter::PathFilter;
use crate::work_tree::{prepare_work_tree_locked, work_tree_cache_lock_name};

pub struct PatchOptions {
    pub from_commit: String,
    pub to_commit: String,
    pub with_submodules: bool,
    /// Emit whole files instead of hunks (`diff.context=999999999`).
    pub with_entire_file_context: bool,
    pub with_binary: bool,
    /// Repo-relative original path to new scope-relative name, applied to
    /// diff headers while streaming.
    pub file_renames: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct PatchDescriptor {
    pub paths: Vec<String>,
    pub binary_paths: Vec<String>,
    pub paths_to_remove: Vec<String>,
    pub out_lines: u64,
}

impl PatchDescriptor {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.paths_to_remove.is_empty()
    }

    pub fn has_binary(&self) -> bool {
        !self.binary_paths.is_empty()
    }
}

enum PipeItem {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

const PIPE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Stream a patch between `opts.from_commit` and `opts.to_commit` into
/// `out`, restricted by `filter`.
///
/// Without submodules the diff runs directly against the repository.
/// With submodules it runs inside a prepared worktree at `to_commit`, the
/// only place `--submodule=diff` yields submodule content.
pub fn create_patch<W: Write>(
    engine: &Engine,
    git_dir: &Path,
    cache_dir: &Path,
    out: W,
    filter: &dyn PathFilter,
    opts: &PatchOptions,
    cancel: &CancelToken,
) -> Result<PatchDescriptor> {
    if !opts.with_submodules {
        let cmd = diff_command(engine, opts).args([
            "-C".to_string(),
            git_dir.display().to_string(),
        ]);
        let cmd = add_diff_args(cmd, opts, filter);
        return run_diff_pipeline(cmd, out, filter, opts, cancel);
    }

    let pool = engine.work_tree_pool(cache_dir);
    let slot = pool.acquire(cancel)?;
    let slot_cache_dir = slot.dir().clone();

    engine.locker().with_lock(
        &work_tree_cache_lock_name(&slot_cache_dir),
        DEFAULT_LOCK_TIMEOUT,
        cancel,
        || {
            let work_tree_dir = prepare_work_tree_locked(
                engine,
                git_dir,
                &slot_cache_dir,
                &opts.to_commit,
                true,
                cancel,
            )?;
            let cmd = diff_command(engine, opts).dir(&work_tree_dir);
            let cmd = add_diff_args(cmd, opts, filter);
            run_diff_pipeline(cmd, out, filter, opts, cancel)
        },
    )
}

fn diff_command(engine: &Engine, opts: &PatchOptions) -> crate::command::GitCommand {
    let mut cmd = engine
        .git()
        .args(["-c", "diff.renames=false", "-c", "core.quotePath=false"]);
    if opts.with_entire_file_context {
        cmd = cmd.args(["-c", "diff.context=999999999"]);
    }
    cmd
}

fn add_diff_args(
    cmd: crate::command::GitCommand,
    opts: &PatchOptions,
    filter: &dyn PathFilter,
) -> crate::command::GitCommand {
    let mut cmd = cmd.args(["diff", "--full-index"]);
    cmd = if opts.with_submodules {
        cmd.arg("--submodule=diff")
    } else {
        cmd.arg("--submodule=log")
    };
    if opts.with_binary {
        cmd = cmd.arg("--binary");
    }
    cmd = cmd.args([opts.from_commit.as_str(), opts.to_commit.as_str()]);

    let base_path = filter.base_path();
    if !base_path.is_empty() && base_path != "." {
        cmd = cmd.args(["--", base_path]);
    }
    cmd
}

/// Spawn the diff, merge both pipes into one channel and feed stdout through
/// the parser. Channel closure (both reader threads done) is the completion
/// signal; the child is reaped only after that.
fn run_diff_pipeline<W: Write>(
    cmd: crate::command::GitCommand,
    out: W,
    filter: &dyn PathFilter,
    opts: &PatchOptions,
    cancel: &CancelToken,
) -> Result<PatchDescriptor> {
    let mut parser = DiffParser::new(out, filter, opts.file_renames.clone());

    let mut spawned = cmd.spawn()?;
    let (tx, rx) = mpsc::channel::<PipeItem>();

    let stdout_pipe = spawned
        .stdout
        .take()
        .ok_or_else(|| Error::Other(format!("stdout pipe missing for {}", spawned.rendered)))?;
    let stderr_pipe = spawned
        .stderr
        .take()
        .ok_or_else(|| Error::Other(format!("stderr pipe missing for {}", spawned.rendered)))?;

    spawn_pipe_reader(stdout_pipe, tx.clone(), PipeItem::Stdout);
    spawn_pipe_reader(stderr_pipe, tx, PipeItem::Stderr);

    // recv_timeout fails with Disconnected once both reader threads finished
    // and dropped their senders. The timeout keeps cancellation responsive
    // even when the child produces no output.
    let mut pipeline_result: Result<()> = Ok(());
    loop {
        if cancel.is_cancelled() {
            spawned.kill();
            return Err(Error::Cancelled);
        }
        let item = match rx.recv_timeout(PIPE_POLL_INTERVAL) {
            Ok(item) => item,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };
        if pipeline_result.is_err() {
            continue;
        }
        pipeline_result = match item {
            PipeItem::Stdout(chunk) => parser.handle_stdout(&chunk),
            PipeItem::Stderr(chunk) => {
                parser.handle_stderr(&chunk);
                Ok(())
            }
        };
        if pipeline_result.is_err() {
            spawned.kill();
        }
    }

    let status = spawned.wait(cancel)?;
    pipeline_result?;

    if !status.success() {
        return Err(Error::CommandFailed {
            command: spawned.rendered,
            status,
            output: parser.unrecognized_capture(),
        });
    }

    let descriptor = PatchDescriptor {
        paths: std::mem::take(&mut parser.paths),
        binary_paths: std::mem::take(&mut parser.binary_paths),
        paths_to_remove: std::mem::take(&mut parser.paths_to_remove),
        out_lines: parser.out_lines,
    };
    debug!(
        target: "treesync::patch",
        "patch {}..{}: {} paths, {} binary, {} removals, {} lines",
        opts.from_commit,
        opts.to_commit,
        descriptor.paths.len(),
        descriptor.binary_paths.len(),
        descriptor.paths_to_remove.len(),
        descriptor.out_lines
    );
    Ok(descriptor)
}

fn spawn_pipe_reader<R, F>(mut pipe: R, tx: mpsc::Sender<PipeItem>, wrap: F)
where
    R: Read + Send + 'static,
    F: Fn(Vec<u8>) -> PipeItem + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(wrap(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_emptiness() {
        let mut desc = PatchDescriptor::default();
        assert!(desc.is_empty());
        assert!(!desc.has_binary());

        desc.paths_to_remove.push("gone.txt".to_string());
        assert!(!desc.is_empty());

        desc.binary_paths.push("logo.png".to_string());
        assert!(desc.has_binary());
    }
}
