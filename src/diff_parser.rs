//! Line-oriented state machine over raw `git diff` output.
//!
//! Reduces a diff stream to structured path sets (touched, binary, removed)
//! while rewriting path prefixes to scope-relative form, and re-emits a
//! filtered, byte-for-byte reproducible diff suitable for `git apply`.

use std::collections::HashMap;
use std::io::Write;

use crate::error::{Error, Result};
use crate::path_filter::PathFilter;

/// Parser state. Transitions are driven purely by line prefixes; unexpected
/// lines in a file-diff state fall through to the output stream unchanged,
/// except in `IgnoreDiff`, where they are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Unrecognized,
    DiffBegin,
    DiffBody,
    NewFileDiff,
    DeleteFileDiff,
    ModifyFileDiff,
    RenameDiff,
    IgnoreDiff,
}

impl ParserState {
    fn name(self) -> &'static str {
        match self {
            ParserState::Unrecognized => "unrecognized",
            ParserState::DiffBegin => "diffBegin",
            ParserState::DiffBody => "diffBody",
            ParserState::NewFileDiff => "newFileDiff",
            ParserState::DeleteFileDiff => "deleteFileDiff",
            ParserState::ModifyFileDiff => "modifyFileDiff",
            ParserState::RenameDiff => "renameDiff",
            ParserState::IgnoreDiff => "ignoreDiff",
        }
    }
}

pub struct DiffParser<'a, W: Write> {
    filter: &'a dyn PathFilter,
    /// Files to rename while patching: repo-relative original path to new
    /// scope-relative name.
    file_renames: HashMap<String, String>,

    out: W,
    pub out_lines: u64,
    /// Unclassified prelude lines plus everything git wrote to stderr;
    /// embedded in error messages.
    unrecognized: Vec<u8>,

    pub paths: Vec<String>,
    pub binary_paths: Vec<String>,
    pub paths_to_remove: Vec<String>,
    last_seen_paths: Vec<String>,

    state: ParserState,
    line_buf: Vec<u8>,
}

fn append_unique(list: &mut Vec<String>, value: String) {
    if !list.iter().any(|v| *v == value) {
        list.push(value);
    }
}

impl<'a, W: Write> DiffParser<'a, W> {
    pub fn new(out: W, filter: &'a dyn PathFilter, file_renames: HashMap<String, String>) -> Self {
        Self {
            filter,
            file_renames,
            out,
            out_lines: 0,
            unrecognized: Vec::new(),
            paths: Vec::new(),
            binary_paths: Vec::new(),
            paths_to_remove: Vec::new(),
            last_seen_paths: Vec::new(),
            state: ParserState::Unrecognized,
            line_buf: Vec::with_capacity(4096),
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn unrecognized_capture(&self) -> String {
        String::from_utf8_lossy(&self.unrecognized).into_owned()
    }

    /// Feed a chunk of the diff stream; lines are assembled across chunk
    /// boundaries with O(1) state.
    pub fn handle_stdout(&mut self, data: &[u8]) -> Result<()> {
        for &b in data {
            if b == b'\n' {
                let line = String::from_utf8_lossy(&self.line_buf).into_owned();
                self.line_buf.clear();
                self.handle_line(&line)?;
            } else {
                self.line_buf.push(b);
            }
        }
        Ok(())
    }

    pub fn handle_stderr(&mut self, data: &[u8]) {
        self.unrecognized.extend_from_slice(data);
    }

    fn write_out_line(&mut self, line: &str) -> Result<()> {
        self.out_lines += 1;
        self.out
            .write_all(line.as_bytes())
            .and_then(|()| self.out.write_all(b"\n"))
            .map_err(|e| Error::io("error writing diff output", e))
    }

    fn write_unrecognized_line(&mut self, line: &str) {
        self.unrecognized.extend_from_slice(line.as_bytes());
        self.unrecognized.push(b'\n');
    }

    pub fn handle_line(&mut self, line: &str) -> Result<()> {
        match self.state {
            ParserState::Unrecognized => {
                if line.starts_with("diff --git ") {
                    return self.handle_diff_begin(line);
                }
                if line.starts_with("Submodule ") {
                    return self.handle_submodule_line(line);
                }
                self.write_unrecognized_line(line);
                Ok(())
            }

            ParserState::IgnoreDiff => {
                if line.starts_with("diff --git ") {
                    return self.handle_diff_begin(line);
                }
                if line.starts_with("Submodule ") {
                    return self.handle_submodule_line(line);
                }
                // Lines of an out-of-scope file diff are dropped.
                Ok(())
            }

            ParserState::DiffBegin => {
                if line.starts_with("deleted file mode ") {
                    // Recorded here so binary deletions (which never emit a
                    // `--- a/` line) are captured too.
                    for path in self.last_seen_paths.clone() {
                        append_unique(&mut self.paths_to_remove, path);
                    }
                    self.state = ParserState::DeleteFileDiff;
                    return self.write_out_line(line);
                }
                if line.starts_with("new file mode ") {
                    self.state = ParserState::NewFileDiff;
                    return self.write_out_line(line);
                }
                if line.starts_with("old mode ") {
                    self.state = ParserState::ModifyFileDiff;
                    return self.write_out_line(line);
                }
                if line.starts_with("index ") {
                    self.state = ParserState::ModifyFileDiff;
                    return self.handle_index_line(line);
                }
                if line.starts_with("similarity index ") {
                    self.state = ParserState::RenameDiff;
                    return self.write_out_line(line);
                }
                Err(Error::UnexpectedDiffFormat {
                    state: self.state.name(),
                    line: line.to_string(),
                })
            }

            ParserState::ModifyFileDiff => {
                if line.starts_with("new mode ") {
                    return self.write_out_line(line);
                }
                if line.starts_with("--- ") {
                    return self.rewrite_path_line(line, "--- a/", false);
                }
                if line.starts_with("+++ ") {
                    self.state = ParserState::DiffBody;
                    return self.rewrite_path_line(line, "+++ b/", false);
                }
                self.handle_shared_file_state_line(line)
            }

            ParserState::NewFileDiff => {
                if line.starts_with("+++ ") {
                    self.state = ParserState::DiffBody;
                    return self.rewrite_path_line(line, "+++ b/", false);
                }
                self.handle_shared_file_state_line(line)
            }

            ParserState::DeleteFileDiff => {
                if line.starts_with("--- ") {
                    self.state = ParserState::DiffBody;
                    return self.rewrite_path_line(line, "--- a/", true);
                }
                self.handle_shared_file_state_line(line)
            }

            ParserState::RenameDiff => {
                if line.starts_with("rename from ") {
                    return self.handle_rename_from(line);
                }
                if line.starts_with("rename to ") {
                    return self.handle_rename_to(line);
                }
                self.handle_shared_file_state_line(line)
            }

            ParserState::DiffBody => {
                if line.starts_with("diff --git ") {
                    return self.handle_diff_begin(line);
                }
                if line.starts_with("Submodule ") {
                    return self.handle_submodule_line(line);
                }
                self.write_out_line(line)
            }
        }
    }

    /// Transitions shared by every active file-diff state; unmatched lines
    /// pass through to the output stream.
    fn handle_shared_file_state_line(&mut self, line: &str) -> Result<()> {
        if line.starts_with("diff --git ") {
            return self.handle_diff_begin(line);
        }
        if line.starts_with("Submodule ") {
            return self.handle_submodule_line(line);
        }
        if line.starts_with("index ") {
            return self.handle_index_line(line);
        }
        if line.starts_with("similarity index ") {
            self.state = ParserState::RenameDiff;
            return self.write_out_line(line);
        }
        if line.starts_with("GIT binary patch") {
            return self.handle_binary_begin_header(line);
        }
        if line.starts_with("Binary files") {
            return self.handle_short_binary_header(line);
        }
        self.write_out_line(line)
    }

    fn handle_diff_begin(&mut self, line: &str) -> Result<()> {
        let (a, b) = split_diff_header_paths(line).ok_or_else(|| Error::UnexpectedDiffFormat {
            state: self.state.name(),
            line: line.to_string(),
        })?;

        self.last_seen_paths.clear();

        let mut rewritten = Vec::with_capacity(2);
        for (raw, prefix) in [(a.as_str(), "a/"), (b.as_str(), "b/")] {
            let quoted = raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2;
            let with_prefix = if quoted {
                unquote_git_path(raw).ok_or_else(|| Error::UnexpectedDiffFormat {
                    state: self.state.name(),
                    line: line.to_string(),
                })?
            } else {
                raw.to_string()
            };

            let path = with_prefix
                .strip_prefix(prefix)
                .unwrap_or(&with_prefix)
                .to_string();

            if !self.filter.is_path_matched(&path) {
                self.state = ParserState::IgnoreDiff;
                return Ok(());
            }

            let path = self.apply_file_renames(&path);
            let new_path = self.trim_path(&path);
            append_unique(&mut self.paths, new_path.clone());
            append_unique(&mut self.last_seen_paths, new_path.clone());

            let prefixed = format!("{prefix}{new_path}");
            rewritten.push(if quoted {
                quote_git_path(&prefixed)
            } else {
                prefixed
            });
        }

        self.state = ParserState::DiffBegin;
        self.write_out_line(&format!("diff --git {} {}", rewritten[0], rewritten[1]))
    }

    /// Rewrite a `--- a/...`/`+++ b/...` line to scope-relative form; a
    /// deletion's old path is also added to paths_to_remove.
    fn rewrite_path_line(&mut self, line: &str, prefix: &str, removes: bool) -> Result<()> {
        match line.strip_prefix(prefix) {
            Some(rest) => {
                let path = self.apply_file_renames(rest);
                let new_path = self.trim_path(&path);
                if removes {
                    append_unique(&mut self.paths_to_remove, new_path.clone());
                }
                self.write_out_line(&format!("{prefix}{new_path}"))
            }
            // `--- /dev/null` and `+++ /dev/null` pass through untouched.
            None => self.write_out_line(line),
        }
    }

    fn handle_rename_from(&mut self, line: &str) -> Result<()> {
        let path = line.trim_start_matches("rename from ");
        let new_path = self.trim_path(path);
        // The old identity ceases to exist at that path.
        append_unique(&mut self.paths_to_remove, new_path.clone());
        self.write_out_line(&format!("rename from {new_path}"))
    }

    fn handle_rename_to(&mut self, line: &str) -> Result<()> {
        let path = line.trim_start_matches("rename to ");
        let new_path = self.trim_path(path);
        self.state = ParserState::DiffBody;
        self.write_out_line(&format!("rename to {new_path}"))
    }

    /// Truncate blob hashes on `index <l>..<r> [<mode>]` lines to 8 hex chars
    /// so patch identity does not depend on the full-index width.
    fn handle_index_line(&mut self, line: &str) -> Result<()> {
        let mut parts = line.splitn(3, ' ');
        let prefix = parts.next().unwrap_or_default();
        let hashes = match parts.next() {
            Some(h) => h,
            None => return self.write_out_line(line),
        };
        let suffix = parts.next();

        let (left, right) = match hashes.split_once("..") {
            Some(pair) => pair,
            None => return self.write_out_line(line),
        };

        let strip = |h: &str| -> String {
            if h.len() < 8 {
                h.to_string()
            } else {
                h[..8].to_string()
            }
        };
        let left: Vec<String> = left.split(',').map(strip).collect();
        let right: Vec<String> = right.split(',').map(strip).collect();

        let new_line = match suffix {
            Some(suffix) => format!(
                "{prefix} {}..{} {suffix}",
                left.join(","),
                right.join(",")
            ),
            None => format!("{prefix} {}..{}", left.join(","), right.join(",")),
        };
        self.write_out_line(&new_line)
    }

    /// Long binary header (`GIT binary patch`, emitted with `--binary`).
    fn handle_binary_begin_header(&mut self, line: &str) -> Result<()> {
        for path in self.last_seen_paths.clone() {
            append_unique(&mut self.binary_paths, path);
        }
        self.state = ParserState::DiffBody;
        self.write_out_line(line)
    }

    /// Short binary header (`Binary files ... differ`). A binary deletion is
    /// captured through the `deleted file mode` path, never inferred here.
    fn handle_short_binary_header(&mut self, line: &str) -> Result<()> {
        for path in self.last_seen_paths.clone() {
            append_unique(&mut self.binary_paths, path);
        }
        self.state = ParserState::Unrecognized;
        self.write_out_line(line)
    }

    fn handle_submodule_line(&mut self, line: &str) -> Result<()> {
        self.state = ParserState::Unrecognized;
        if line.ends_with(" (commits not present)") {
            return Err(Error::UnsupportedSubmoduleState(format!(
                "cannot handle git diff line {line:?}, check specified commits are correct"
            )));
        }
        Ok(())
    }

    fn apply_file_renames(&self, path: &str) -> String {
        match self.file_renames.get(path) {
            Some(new_name) => {
                let base = self.filter.base_path();
                if base.is_empty() {
                    new_name.clone()
                } else {
                    format!("{base}/{new_name}")
                }
            }
            None => path.to_string(),
        }
    }

    fn trim_path(&self, path: &str) -> String {
        // git may emit a trailing tab after paths containing spaces.
        self.filter.trim_base(path).trim_end_matches('\t').to_string()
    }
}

fn split_diff_header_paths(line: &str) -> Option<(String, String)> {
    // Quoted form first: diff --git "a/x y" "b/x y"
    if let Some((_, rest)) = line.split_once(" \"a/") {
        let (a_tail, b_tail) = rest.split_once(" \"b/")?;
        return Some((format!("\"a/{a_tail}"), format!("\"b/{b_tail}")));
    }
    let (_, rest) = line.split_once(" a/")?;
    let (a_tail, b_tail) = rest.split_once(" b/")?;
    Some((format!("a/{a_tail}"), format!("b/{b_tail}")))
}

/// Undo git's C-style path quoting (`core.quotePath` escapes).
fn unquote_git_path(quoted: &str) -> Option<String> {
    let inner = quoted.strip_prefix('"')?.strip_suffix('"')?;
    let bytes = inner.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        i += 1;
        let c = *bytes.get(i)?;
        match c {
            b'\\' | b'"' => out.push(c),
            b't' => out.push(b'\t'),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b'0'..=b'7' => {
                let mut value: u32 = 0;
                let mut digits = 0;
                while digits < 3 {
                    match bytes.get(i) {
                        Some(&d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            i += 1;
                            digits += 1;
                        }
                        _ => break,
                    }
                }
                out.push(value as u8);
                continue;
            }
            _ => return None,
        }
        i += 1;
    }
    Some(String::from_utf8_lossy(&out).into_owned())
}

/// Re-quote a rewritten path the way git would.
fn quote_git_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 2);
    out.push('"');
    for &b in path.as_bytes() {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\t' => out.push_str("\\t"),
            b'\n' => out.push_str("\\n"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\{b:03o}")),
        }
    }
    out.push('"');
    out
}
