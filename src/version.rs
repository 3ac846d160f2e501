use std::fmt;

use crate::error::{Error, Result};

/// Minimum supported git version.
pub const MIN_GIT_VERSION: GitVersion = GitVersion {
    major: 2,
    minor: 18,
    patch: 0,
};

/// Versions with known-broken behavior that are rejected even when the
/// minimum-version check is disabled (2.22.0 mishandles worktree removal).
pub const FORBIDDEN_GIT_VERSIONS: [GitVersion; 1] = [GitVersion {
    major: 2,
    minor: 22,
    patch: 0,
}];

pub const DISABLE_VERSION_CHECK_ENV: &str = "TREESYNC_DISABLE_GIT_VERSION_CHECK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GitVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for GitVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl GitVersion {
    /// Parse the output of `git version`, e.g. `git version 2.37.1` or
    /// `git version 2.37.1.windows.1`. Trailing non-numeric components are
    /// ignored; a missing patch component defaults to zero.
    pub fn parse(output: &str) -> Result<GitVersion> {
        let raw = output
            .trim()
            .strip_prefix("git version ")
            .unwrap_or_else(|| output.trim());
        let token = raw.split_whitespace().next().unwrap_or("");

        let mut numbers = token.split('.').map_while(|part| part.parse::<u32>().ok());

        let major = numbers
            .next()
            .ok_or_else(|| Error::Other(format!("unable to parse git version from {output:?}")))?;
        let minor = numbers.next().unwrap_or(0);
        let patch = numbers.next().unwrap_or(0);

        Ok(GitVersion {
            major,
            minor,
            patch,
        })
    }
}

/// Enforce the version gate. The denylist always applies; the minimum-version
/// check is skipped when `min_check_disabled` is set (callers derive it from
/// `TREESYNC_DISABLE_GIT_VERSION_CHECK=1`).
pub fn check_version_constraints(version: GitVersion, min_check_disabled: bool) -> Result<()> {
    for forbidden in FORBIDDEN_GIT_VERSIONS {
        if version == forbidden {
            return Err(Error::VersionConstraintViolation {
                detected: version.to_string(),
                constraint: format!("version {forbidden} is known to be broken"),
            });
        }
    }

    if !min_check_disabled && version < MIN_GIT_VERSION {
        return Err(Error::VersionConstraintViolation {
            detected: version.to_string(),
            constraint: format!("minimum supported version is {MIN_GIT_VERSION}"),
        });
    }

    Ok(())
}
