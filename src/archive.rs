//! Tar archive creation from a prepared worktree.
//!
//! File modes come from the git index (`ls-files --stage`), not from the
//! filesystem, so archives are reproducible across checkout umasks.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use tar::{Builder, EntryType, Header};
use tracing::debug;
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::host_lock::DEFAULT_LOCK_TIMEOUT;
use crate::path_filter::PathFilter;
use crate::work_tree::{prepare_work_tree_locked, work_tree_cache_lock_name};

const GIT_MODE_SYMLINK: u32 = 0o120000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    File,
    Directory,
}

pub struct ArchiveOptions<'a> {
    pub commit: String,
    pub with_submodules: bool,
    pub filter: &'a dyn PathFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveDescriptor {
    pub archive_type: ArchiveType,
    pub is_empty: bool,
}

/// Stream a tar archive of `opts.commit` (restricted by `opts.filter`)
/// into `out`.
pub fn create_archive<W: Write>(
    engine: &Engine,
    git_dir: &Path,
    cache_dir: &Path,
    out: W,
    opts: &ArchiveOptions<'_>,
    cancel: &CancelToken,
) -> Result<ArchiveDescriptor> {
    engine.locker().with_lock(
        &work_tree_cache_lock_name(cache_dir),
        DEFAULT_LOCK_TIMEOUT,
        cancel,
        || {
            let work_tree_dir = prepare_work_tree_locked(
                engine,
                git_dir,
                cache_dir,
                &opts.commit,
                opts.with_submodules,
                cancel,
            )?;
            write_archive(engine, &work_tree_dir, out, opts, cancel)
        },
    )
}

fn write_archive<W: Write>(
    engine: &Engine,
    work_tree_dir: &Path,
    out: W,
    opts: &ArchiveOptions<'_>,
    cancel: &CancelToken,
) -> Result<ArchiveDescriptor> {
    let modes = read_index_modes(engine, work_tree_dir, opts.with_submodules, cancel)?;

    let base_path = opts.filter.base_path();
    let base_abs = if base_path.is_empty() || base_path == "." {
        work_tree_dir.to_path_buf()
    } else {
        work_tree_dir.join(base_path)
    };

    let mut tar = Builder::new(out);
    let mut wrote_any = false;
    let mut base_seen = false;

    let walker = WalkDir::new(&base_abs)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");

    for entry in walker {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.io_error().map(|e| e.kind()) == Some(std::io::ErrorKind::NotFound)
                    && err.path() == Some(base_abs.as_path())
                {
                    break;
                }
                return Err(Error::Other(format!(
                    "error walking worktree {}: {err}",
                    work_tree_dir.display()
                )));
            }
        };
        base_seen = true;

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(work_tree_dir)
            .map_err(|e| Error::Other(format!("path outside worktree: {e}")))?;
        let rel = slash_path(rel);

        if !opts.filter.is_path_matched(&rel) {
            continue;
        }

        let git_mode = *modes.get(rel.as_str()).ok_or_else(|| {
            Error::Other(format!("cannot determine git file mode for {rel}"))
        })?;

        let entry_name = opts.filter.trim_base(&rel);
        let entry_name = if entry_name == "." {
            // Base path names a plain file; archive it under its own name.
            Path::new(&rel)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or(rel.clone())
        } else {
            entry_name
        };

        debug!(target: "treesync::archive", "archiving {rel} as {entry_name} mode {git_mode:o}");
        append_entry(&mut tar, entry.path(), &entry_name, git_mode, file_type.is_symlink())?;
        wrote_any = true;
    }

    tar.finish()
        .map_err(|e| Error::io("error finalizing tar archive", e))?;

    if !base_seen && !base_path.is_empty() && base_path != "." {
        return Err(Error::Other(format!(
            "base path {base_path} does not exist in commit {}",
            opts.commit
        )));
    }

    let archive_type = if base_abs.is_file() {
        ArchiveType::File
    } else {
        ArchiveType::Directory
    };

    Ok(ArchiveDescriptor {
        archive_type,
        is_empty: !wrote_any,
    })
}

fn append_entry<W: Write>(
    tar: &mut Builder<W>,
    abs_path: &Path,
    entry_name: &str,
    git_mode: u32,
    is_symlink: bool,
) -> Result<()> {
    let meta = fs::symlink_metadata(abs_path)
        .map_err(|e| Error::io(format!("unable to stat {}", abs_path.display()), e))?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut header = Header::new_gnu();
    header.set_mode(git_mode & 0o7777);
    header.set_mtime(mtime);
    header.set_uid(0);
    header.set_gid(0);

    if git_mode == GIT_MODE_SYMLINK || is_symlink {
        header.set_entry_type(EntryType::Symlink);
        // The git mode 0o120000 carries no permission bits; tar link
        // entries conventionally use 0o777.
        header.set_mode(0o777);
        header.set_size(0);
        let target = match fs::read_link(abs_path) {
            Ok(target) => target,
            // Checkouts with core.symlinks=false materialize links as
            // regular files holding the target path.
            Err(_) => {
                let content = fs::read_to_string(abs_path).map_err(|e| {
                    Error::io(format!("unable to read link file {}", abs_path.display()), e)
                })?;
                std::path::PathBuf::from(content.trim_end())
            }
        };
        tar.append_link(&mut header, entry_name, &target)
            .map_err(|e| Error::io(format!("error archiving link {entry_name}"), e))?;
    } else {
        header.set_entry_type(EntryType::Regular);
        header.set_size(meta.len());
        let file = fs::File::open(abs_path)
            .map_err(|e| Error::io(format!("unable to open {}", abs_path.display()), e))?;
        tar.append_data(&mut header, entry_name, file)
            .map_err(|e| Error::io(format!("error archiving {entry_name}"), e))?;
    }
    Ok(())
}

/// Collect index modes of the worktree (and, optionally, every submodule)
/// keyed by slash-separated path relative to the worktree root.
fn read_index_modes(
    engine: &Engine,
    work_tree_dir: &Path,
    with_submodules: bool,
    cancel: &CancelToken,
) -> Result<HashMap<String, u32>> {
    let mut modes = HashMap::new();

    let output = engine
        .git()
        .dir(work_tree_dir)
        .args(["ls-files", "--stage"])
        .run(cancel)?;
    parse_ls_files_stage(&output.stdout, "", &mut modes)?;

    if with_submodules {
        let output = engine
            .git()
            .dir(work_tree_dir)
            .args([
                "submodule",
                "foreach",
                "--recursive",
                "git",
                "-c",
                "core.autocrlf=false",
                "-c",
                "gc.auto=0",
                "ls-files",
                "--stage",
            ])
            .run(cancel)?;

        let mut prefix = String::new();
        for line in output.stdout.lines() {
            if let Some(rest) = line.strip_prefix("Entering '") {
                prefix = rest.trim_end_matches('\'').to_string();
                continue;
            }
            parse_ls_files_stage_line(line, &prefix, &mut modes)?;
        }
    }

    Ok(modes)
}

fn parse_ls_files_stage(
    output: &str,
    prefix: &str,
    modes: &mut HashMap<String, u32>,
) -> Result<()> {
    for line in output.lines() {
        parse_ls_files_stage_line(line, prefix, modes)?;
    }
    Ok(())
}

/// One `ls-files --stage` line: `<mode> <hash> <stage>\t<path>`.
fn parse_ls_files_stage_line(
    line: &str,
    prefix: &str,
    modes: &mut HashMap<String, u32>,
) -> Result<()> {
    if line.is_empty() {
        return Ok(());
    }
    let (meta, path) = line
        .split_once('\t')
        .ok_or_else(|| Error::Other(format!("unexpected ls-files line {line:?}")))?;
    let mode_str = meta
        .split_whitespace()
        .next()
        .ok_or_else(|| Error::Other(format!("unexpected ls-files line {line:?}")))?;
    let mode = u32::from_str_radix(mode_str, 8)
        .map_err(|_| Error::Other(format!("bad file mode in ls-files line {line:?}")))?;

    let key = if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{prefix}/{path}")
    };
    modes.insert(key, mode);
    Ok(())
}

fn slash_path(path: &Path) -> String {
    let components: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    components.join("/")
}
