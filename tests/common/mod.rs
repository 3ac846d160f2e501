use std::path::{Path, PathBuf};
use std::process::Command;

pub fn have_git() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[allow(dead_code)]
pub fn init_engine(locks_dir: &Path) -> treesync::Engine {
    treesync::Engine::init(treesync::Options {
        locks_dir: Some(locks_dir.to_path_buf()),
        ..Default::default()
    })
    .expect("engine init failed")
}

#[allow(dead_code)]
pub fn run_git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "protocol.file.allow=always"])
        .args(args)
        .current_dir(dir)
        .status()
        .expect("failed to spawn git");
    assert!(status.success(), "git {args:?} failed in {}", dir.display());
}

#[allow(dead_code)]
pub fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to spawn git");
    assert!(out.status.success(), "git {args:?} failed in {}", dir.display());
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A throwaway repository with a configured committer identity.
pub struct TestRepo {
    pub root: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestRepo {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("tmpdir");
        run_git(root.path(), &["init", "-q"]);
        run_git(root.path(), &["config", "user.name", "Treesync Test"]);
        run_git(root.path(), &["config", "user.email", "treesync@example.com"]);
        // Local-path submodules need the file protocol allowed on git >= 2.38.
        run_git(root.path(), &["config", "protocol.file.allow", "always"]);
        TestRepo { root }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn git_dir(&self) -> PathBuf {
        self.root.path().join(".git")
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.root.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, content).expect("write file");
    }

    pub fn commit_all(&self, message: &str) -> String {
        run_git(self.path(), &["add", "-A"]);
        run_git(self.path(), &["commit", "-q", "-m", message, "--no-verify"]);
        self.head()
    }

    pub fn head(&self) -> String {
        git_stdout(self.path(), &["rev-parse", "HEAD"])
    }
}
