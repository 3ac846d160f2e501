//! Git content-addressing and worktree-synchronization engine.
//!
//! Wraps the system `git` binary to provide deterministic patch and archive
//! extraction, cached detached worktrees with self-repair, service-branch
//! snapshots of live worktree state, and porcelain status/submodule
//! introspection. All operations are host-concurrency safe through named
//! file locks and accept a cancellation token.

pub mod archive;
pub mod cancel;
pub(crate) mod command;
pub mod diff_parser;
pub mod engine;
pub mod error;
pub mod host_lock;
pub mod patch;
pub mod path_filter;
pub mod pool;
pub mod repository;
pub mod service_branch;
pub mod status;
pub mod submodule;
pub mod version;
pub mod work_tree;

pub use archive::{ArchiveDescriptor, ArchiveOptions, ArchiveType};
pub use cancel::CancelToken;
pub use engine::{Engine, Options};
pub use error::{Error, Result};
pub use patch::{PatchDescriptor, PatchOptions};
pub use path_filter::{AnyPathFilter, GlobPathFilter, PathFilter};
pub use repository::{FetchOptions, FsckOptions, RefDescriptor};
pub use service_branch::{SyncOptions, DEFAULT_SERVICE_BRANCH_PREFIX};
pub use status::{Scope, StatusResult, SubmoduleChange};
pub use submodule::SubmoduleStatus;
pub use version::GitVersion;
pub use work_tree::WorktreeDescriptor;
