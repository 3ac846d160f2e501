//! Engine: the service object every operation hangs off.
//!
//! Initialization locates the git binary, runs the version gate and fixes
//! the process-wide knobs (live output, lock directory, worktree pool size).
//! Everything downstream receives the engine by reference instead of
//! reading globals.

use std::collections::HashMap;
use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::archive::{create_archive, ArchiveDescriptor, ArchiveOptions};
use crate::cancel::CancelToken;
use crate::command::GitCommand;
use crate::error::{Error, Result};
use crate::host_lock::HostLocker;
use crate::patch::{create_patch, PatchDescriptor, PatchOptions};
use crate::path_filter::PathFilter;
use crate::pool::WorktreePool;
use crate::service_branch::{sync_source_work_tree_with_service_branch, SyncOptions};
use crate::status::{status, StatusResult};
use crate::submodule::{get_submodules_status, SubmoduleStatus};
use crate::version::{check_version_constraints, GitVersion, DISABLE_VERSION_CHECK_ENV};
use crate::work_tree::{get_work_tree_list, prepare_work_tree, WorktreeDescriptor};
use crate::{repository, repository::{FetchOptions, FsckOptions, RefDescriptor}};

pub const LIVE_GIT_OUTPUT_ENV: &str = "TREESYNC_LIVE_GIT_OUTPUT";
pub const WORKTREE_POOL_SIZE_ENV: &str = "TREESYNC_WORKTREE_POOL_SIZE";

const DEFAULT_WORKTREE_POOL_SIZE: usize = 1;

#[derive(Debug, Default, Clone)]
pub struct Options {
    /// Explicit git binary; discovered on PATH when unset.
    pub git_binary: Option<PathBuf>,
    /// Directory for host-wide lock files; a shared temp-dir location
    /// when unset.
    pub locks_dir: Option<PathBuf>,
    /// Tee git output to stderr as it arrives. `TREESYNC_LIVE_GIT_OUTPUT=1`
    /// turns this on as well.
    pub live_git_output: bool,
    /// Parallel worktree cache directories per base dir. Overridden by
    /// `TREESYNC_WORKTREE_POOL_SIZE`.
    pub worktree_pool_size: Option<usize>,
}

pub struct Engine {
    git_binary: PathBuf,
    git_version: GitVersion,
    live_git_output: bool,
    worktree_pool_size: usize,
    locker: HostLocker,
    pools: RwLock<HashMap<PathBuf, Arc<WorktreePool>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("git_binary", &self.git_binary)
            .field("git_version", &self.git_version)
            .field("live_git_output", &self.live_git_output)
            .field("worktree_pool_size", &self.worktree_pool_size)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Locate git, verify its version against the supported range and build
    /// the engine. Fails when git is missing or the version gate rejects it.
    pub fn init(opts: Options) -> Result<Engine> {
        let git_binary = match opts.git_binary {
            Some(path) => path,
            None => which::which("git")
                .map_err(|e| Error::Other(format!("git binary not found: {e}")))?,
        };

        let cancel = CancelToken::new();
        let output = GitCommand::new(&git_binary).arg("version").run(&cancel)?;
        let git_version = GitVersion::parse(&output.stdout)?;

        let min_check_disabled = env::var(DISABLE_VERSION_CHECK_ENV).ok().as_deref() == Some("1");
        check_version_constraints(git_version, min_check_disabled)?;

        let live_git_output =
            opts.live_git_output || env::var(LIVE_GIT_OUTPUT_ENV).ok().as_deref() == Some("1");

        let worktree_pool_size = env::var(WORKTREE_POOL_SIZE_ENV)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .or(opts.worktree_pool_size)
            .unwrap_or(DEFAULT_WORKTREE_POOL_SIZE)
            .max(1);

        let locker = match opts.locks_dir {
            Some(dir) => HostLocker::new(dir),
            None => HostLocker::default(),
        };

        debug!(
            target: "treesync::engine",
            "initialized with git {git_version} at {}",
            git_binary.display()
        );

        Ok(Engine {
            git_binary,
            git_version,
            live_git_output,
            worktree_pool_size,
            locker,
            pools: RwLock::new(HashMap::new()),
        })
    }

    pub(crate) fn git(&self) -> GitCommand {
        GitCommand::new(&self.git_binary).live_output(self.live_git_output)
    }

    pub fn git_version(&self) -> GitVersion {
        self.git_version
    }

    pub(crate) fn locker(&self) -> &HostLocker {
        &self.locker
    }

    /// Pool of parallel worktree cache dirs rooted at `base_dir`. One pool
    /// per base dir for the lifetime of the engine.
    pub(crate) fn work_tree_pool(&self, base_dir: &Path) -> Arc<WorktreePool> {
        if let Ok(pools) = self.pools.read() {
            if let Some(pool) = pools.get(base_dir) {
                return Arc::clone(pool);
            }
        }
        let mut pools = match self.pools.write() {
            Ok(pools) => pools,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(pools.entry(base_dir.to_path_buf()).or_insert_with(|| {
            Arc::new(WorktreePool::new(
                base_dir.to_path_buf(),
                self.worktree_pool_size,
            ))
        }))
    }

    // Operation entry points. Thin delegates so callers only ever need the
    // engine in scope.

    pub fn prepare_work_tree(
        &self,
        git_dir: &Path,
        cache_dir: &Path,
        commit: &str,
        with_submodules: bool,
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        prepare_work_tree(self, git_dir, cache_dir, commit, with_submodules, cancel)
    }

    pub fn create_patch<W: Write>(
        &self,
        git_dir: &Path,
        cache_dir: &Path,
        out: W,
        filter: &dyn PathFilter,
        opts: &PatchOptions,
        cancel: &CancelToken,
    ) -> Result<PatchDescriptor> {
        create_patch(self, git_dir, cache_dir, out, filter, opts, cancel)
    }

    pub fn create_archive<W: Write>(
        &self,
        git_dir: &Path,
        cache_dir: &Path,
        out: W,
        opts: &ArchiveOptions<'_>,
        cancel: &CancelToken,
    ) -> Result<ArchiveDescriptor> {
        create_archive(self, git_dir, cache_dir, out, opts, cancel)
    }

    pub fn sync_source_work_tree_with_service_branch(
        &self,
        git_dir: &Path,
        source_work_tree_dir: &Path,
        cache_dir: &Path,
        source_commit: &str,
        opts: &SyncOptions,
        cancel: &CancelToken,
    ) -> Result<String> {
        sync_source_work_tree_with_service_branch(
            self,
            git_dir,
            source_work_tree_dir,
            cache_dir,
            source_commit,
            opts,
            cancel,
        )
    }

    pub fn status(&self, work_tree_dir: &Path, cancel: &CancelToken) -> Result<StatusResult> {
        status(self, work_tree_dir, cancel)
    }

    pub fn get_submodules_status(
        &self,
        repo_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<Vec<SubmoduleStatus>> {
        get_submodules_status(self, repo_dir, cancel)
    }

    pub fn get_work_tree_list(
        &self,
        repo_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<Vec<WorktreeDescriptor>> {
        get_work_tree_list(self, repo_dir, cancel)
    }

    pub fn show_ref(&self, repo_dir: &Path, cancel: &CancelToken) -> Result<Vec<RefDescriptor>> {
        repository::show_ref(self, repo_dir, cancel)
    }

    pub fn is_ancestor(
        &self,
        git_dir: &Path,
        ancestor_commit: &str,
        descendant_commit: &str,
        cancel: &CancelToken,
    ) -> Result<bool> {
        repository::is_ancestor(self, git_dir, ancestor_commit, descendant_commit, cancel)
    }

    pub fn fsck(
        &self,
        repo_dir: &Path,
        opts: &FsckOptions,
        cancel: &CancelToken,
    ) -> Result<String> {
        repository::fsck(self, repo_dir, opts, cancel)
    }

    pub fn fetch(
        &self,
        repo_dir: &Path,
        opts: &FetchOptions,
        cancel: &CancelToken,
    ) -> Result<()> {
        repository::fetch(self, repo_dir, opts, cancel)
    }

    pub fn is_shallow_clone(&self, repo_dir: &Path, cancel: &CancelToken) -> Result<bool> {
        repository::is_shallow_clone(self, repo_dir, cancel)
    }

    pub fn get_last_branch_commit(
        &self,
        repo_dir: &Path,
        branch: &str,
        cancel: &CancelToken,
    ) -> Result<String> {
        repository::get_last_branch_commit(self, repo_dir, branch, cancel)
    }

    pub fn resolve_repo_dir(&self, repo_dir: &Path, cancel: &CancelToken) -> Result<PathBuf> {
        repository::resolve_repo_dir(self, repo_dir, cancel)
    }
}
