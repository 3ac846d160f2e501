//! External git process invocation with independent output capture,
//! optional live teeing and cooperative cancellation.

use std::env;
use std::ffi::{OsStr, OsString};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Baseline options prepended to every git invocation: no autocrlf
/// translation (byte-stable diffs) and no automatic gc (no background
/// processes racing over cached worktrees).
const COMMON_GIT_OPTIONS: [&str; 4] = ["-c", "core.autocrlf=false", "-c", "gc.auto=0"];

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub const DEBUG_GIT_COMMANDS_ENV: &str = "TREESYNC_DEBUG_GIT_COMMANDS";

fn debug_git_commands() -> bool {
    env::var(DEBUG_GIT_COMMANDS_ENV).ok().as_deref() == Some("1")
}

/// Captured output of a finished git command. The three buffers are
/// independent: `combined` interleaves stdout and stderr in arrival order
/// and is what command failures embed for diagnostics.
#[derive(Debug, Default)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub combined: String,
}

/// Builder for one git invocation. Owned exclusively by its caller; the
/// underlying process is reaped on success and killed on cancellation.
#[derive(Debug)]
pub struct GitCommand {
    binary: PathBuf,
    dir: Option<PathBuf>,
    args: Vec<OsString>,
    stdin: Option<Vec<u8>>,
    live_output: bool,
}

impl GitCommand {
    pub fn new(binary: &Path) -> Self {
        Self {
            binary: binary.to_path_buf(),
            dir: None,
            args: Vec::new(),
            stdin: None,
            live_output: false,
        }
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    /// Tee process output to the caller's stderr as it arrives, in addition
    /// to buffering it. Buffer contents are unaffected.
    pub fn live_output(mut self, enabled: bool) -> Self {
        self.live_output = enabled;
        self
    }

    /// Human-readable rendering used in failure messages and debug traces.
    pub fn render(&self) -> String {
        let mut parts = vec![self.binary.display().to_string()];
        if let Some(ref dir) = self.dir {
            parts.push(format!("(in {})", dir.display()));
        }
        parts.extend(COMMON_GIT_OPTIONS.iter().map(|s| s.to_string()));
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(COMMON_GIT_OPTIONS.iter().map(OsStr::new));
        cmd.args(&self.args);
        if let Some(ref dir) = self.dir {
            cmd.current_dir(dir);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd
    }

    /// Spawn the process with piped stdout/stderr and hand the raw handles to
    /// the caller (used by the patch producer, which streams stdout through
    /// the diff parser instead of buffering it).
    pub fn spawn(&self) -> Result<SpawnedGit> {
        let rendered = self.render();
        if debug_git_commands() {
            debug!(target: "treesync::command", "spawn: {rendered}");
        }

        let mut cmd = self.build();
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::io(format!("failed to spawn {rendered}"), e))?;

        if let Some(bytes) = self.stdin.clone() {
            let mut pipe = child.stdin.take().ok_or_else(|| {
                Error::Other(format!("stdin pipe was not created for {rendered}"))
            })?;
            // Writer thread: a full pipe must not deadlock against our readers.
            thread::spawn(move || {
                let _ = pipe.write_all(&bytes);
            });
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            Error::Other(format!("stdout pipe was not created for {rendered}"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            Error::Other(format!("stderr pipe was not created for {rendered}"))
        })?;

        Ok(SpawnedGit {
            child,
            stdout: Some(stdout),
            stderr: Some(stderr),
            rendered,
        })
    }

    /// Run to completion. Non-zero exit becomes [`Error::CommandFailed`] with
    /// the captured combined output; cancellation kills the process and maps
    /// to [`Error::Cancelled`].
    pub fn run(&self, cancel: &CancelToken) -> Result<GitOutput> {
        let (status, output) = self.run_unchecked(cancel)?;
        if !status.success() {
            return Err(Error::CommandFailed {
                command: self.render(),
                status,
                output: output.combined,
            });
        }
        Ok(output)
    }

    /// Like [`run`](Self::run) but hands the exit status back to the caller
    /// instead of failing on non-zero exit. Used where git encodes an answer
    /// in the exit code (`merge-base --is-ancestor`).
    pub fn run_unchecked(&self, cancel: &CancelToken) -> Result<(ExitStatus, GitOutput)> {
        let mut spawned = self.spawn()?;
        let combined = Arc::new(Mutex::new(Vec::new()));

        let stdout_pipe = spawned
            .stdout
            .take()
            .ok_or_else(|| Error::Other(format!("stdout pipe missing for {}", spawned.rendered)))?;
        let stderr_pipe = spawned
            .stderr
            .take()
            .ok_or_else(|| Error::Other(format!("stderr pipe missing for {}", spawned.rendered)))?;
        let stdout_handle = spawn_capture(stdout_pipe, Arc::clone(&combined), self.live_output);
        let stderr_handle = spawn_capture(stderr_pipe, Arc::clone(&combined), self.live_output);

        let status = spawned.wait(cancel)?;

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        let combined = combined.lock().map(|b| b.clone()).unwrap_or_default();

        let output = GitOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            combined: String::from_utf8_lossy(&combined).into_owned(),
        };

        if debug_git_commands() {
            debug!(
                target: "treesync::command",
                "done: {} status={status} combined:\n{}",
                spawned.rendered,
                output.combined
            );
        }

        Ok((status, output))
    }
}

/// A spawned git process plus its pipes, pre-rendered command line attached
/// for diagnostics.
pub struct SpawnedGit {
    child: Child,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    pub rendered: String,
}

impl SpawnedGit {
    /// Wait for process exit, polling the cancellation token. On cancel the
    /// child is killed and reaped before returning [`Error::Cancelled`].
    pub fn wait(&mut self, cancel: &CancelToken) -> Result<ExitStatus> {
        loop {
            if cancel.is_cancelled() {
                let _ = self.child.kill();
                let _ = self.child.wait();
                return Err(Error::Cancelled);
            }
            match self.child.wait_timeout(CANCEL_POLL_INTERVAL) {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => continue,
                Err(e) => {
                    return Err(Error::io(
                        format!("failed to wait for {}", self.rendered),
                        e,
                    ))
                }
            }
        }
    }

    pub fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Reader thread for one pipe: accumulates a per-stream buffer, mirrors every
/// chunk into the shared combined buffer, and optionally tees it live. No
/// byte lands in one sink without landing in the others.
fn spawn_capture<R: Read + Send + 'static>(
    mut pipe: R,
    combined: Arc<Mutex<Vec<u8>>>,
    live: bool,
) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut local = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    local.extend_from_slice(&buf[..n]);
                    if let Ok(mut shared) = combined.lock() {
                        shared.extend_from_slice(&buf[..n]);
                    }
                    if live {
                        let mut sink = io::stderr();
                        let _ = sink.write_all(&buf[..n]);
                        let _ = sink.flush();
                    }
                }
                Err(_) => break,
            }
        }
        local
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_common_options_and_args() {
        let cmd = GitCommand::new(Path::new("git"))
            .dir("/tmp/repo")
            .args(["rev-parse", "HEAD"]);
        let rendered = cmd.render();
        assert!(rendered.contains("core.autocrlf=false"), "{rendered}");
        assert!(rendered.contains("gc.auto=0"), "{rendered}");
        assert!(rendered.contains("rev-parse HEAD"), "{rendered}");
        assert!(rendered.contains("/tmp/repo"), "{rendered}");
    }
}
