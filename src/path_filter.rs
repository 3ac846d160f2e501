//! Path scoping for archive/diff/patch operations.
//!
//! A filter answers two questions about a repo-relative slash path: does it
//! belong to the current scope, and what is its scope-relative name.

use std::fmt;

use globset::{GlobSet, GlobSetBuilder};

use crate::error::{Error, Result};

pub trait PathFilter: Send + Sync {
    /// Scope base, repo-relative, slash-separated, no trailing slash.
    /// Empty means the repository root.
    fn base_path(&self) -> &str;

    /// True if the repo-relative path is inside the scope.
    fn is_path_matched(&self, path: &str) -> bool;

    /// Rewrite a repo-relative path to its scope-relative name.
    /// The base path itself maps to `.`.
    fn trim_base(&self, path: &str) -> String;
}

/// Filter that admits every path; scope-relative names equal repo-relative
/// names.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnyPathFilter;

impl PathFilter for AnyPathFilter {
    fn base_path(&self) -> &str {
        ""
    }

    fn is_path_matched(&self, _path: &str) -> bool {
        true
    }

    fn trim_base(&self, path: &str) -> String {
        trim_base_path("", path)
    }
}

/// (base, includes, excludes) filter. A path is in scope iff it is under the
/// base path AND (includes are empty OR one matches) AND no exclude matches.
/// Patterns are matched against the base-relative remainder and support `*`,
/// character classes and `**`; a pattern naming a directory also matches
/// everything below it.
pub struct GlobPathFilter {
    base_path: String,
    include_patterns: Vec<String>,
    exclude_patterns: Vec<String>,
    includes: Option<GlobSet>,
    excludes: Option<GlobSet>,
}

impl fmt::Debug for GlobPathFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobPathFilter")
            .field("base_path", &self.base_path)
            .field("includes", &self.include_patterns)
            .field("excludes", &self.exclude_patterns)
            .finish()
    }
}

impl GlobPathFilter {
    pub fn new<S: AsRef<str>>(
        base_path: &str,
        include_patterns: &[S],
        exclude_patterns: &[S],
    ) -> Result<Self> {
        let include_patterns: Vec<String> = include_patterns
            .iter()
            .map(|s| normalize_pattern(s.as_ref()))
            .collect();
        let exclude_patterns: Vec<String> = exclude_patterns
            .iter()
            .map(|s| normalize_pattern(s.as_ref()))
            .collect();

        Ok(Self {
            base_path: base_path.trim_matches('/').to_string(),
            includes: build_glob_set(&include_patterns)?,
            excludes: build_glob_set(&exclude_patterns)?,
            include_patterns,
            exclude_patterns,
        })
    }

    /// Base-relative remainder of `path`, or `None` when the path is outside
    /// the base. The base path itself yields `Some("")`.
    fn rel_to_base<'a>(&self, path: &'a str) -> Option<&'a str> {
        let path = path.trim_matches('/');
        if self.base_path.is_empty() {
            return Some(path);
        }
        if path == self.base_path {
            return Some("");
        }
        path.strip_prefix(self.base_path.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }
}

impl PathFilter for GlobPathFilter {
    fn base_path(&self) -> &str {
        &self.base_path
    }

    fn is_path_matched(&self, path: &str) -> bool {
        let rel = match self.rel_to_base(path) {
            Some(rel) => rel,
            None => return false,
        };

        if let Some(ref excludes) = self.excludes {
            if excludes.is_match(rel) {
                return false;
            }
        }

        match self.includes {
            Some(ref includes) => rel.is_empty() || includes.is_match(rel),
            None => true,
        }
    }

    fn trim_base(&self, path: &str) -> String {
        trim_base_path(&self.base_path, path)
    }
}

fn trim_base_path(base: &str, path: &str) -> String {
    let path = path.trim_matches('/');
    if base.is_empty() {
        return if path.is_empty() {
            ".".to_string()
        } else {
            path.to_string()
        };
    }
    if path == base {
        return ".".to_string();
    }
    match path.strip_prefix(base).and_then(|r| r.strip_prefix('/')) {
        Some(rel) => rel.to_string(),
        None => path.to_string(),
    }
}

fn normalize_pattern(pattern: &str) -> String {
    pattern.trim_matches('/').to_string()
}

/// Compile patterns into a single set. Each pattern is added twice: as-is and
/// with a `/**` suffix, so a pattern naming a directory matches its contents.
/// `literal_separator` keeps `*` within one path component.
fn build_glob_set(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        for expanded in [pattern.clone(), format!("{pattern}/**")] {
            let glob = globset::GlobBuilder::new(&expanded)
                .literal_separator(true)
                .build()
                .map_err(|source| Error::InvalidGlob {
                    pattern: pattern.clone(),
                    source,
                })?;
            builder.add(glob);
        }
    }
    let set = builder.build().map_err(|source| Error::InvalidGlob {
        pattern: patterns.join(", "),
        source,
    })?;
    Ok(Some(set))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(base: &str, inc: &[&str], exc: &[&str]) -> GlobPathFilter {
        GlobPathFilter::new(base, inc, exc).expect("filter build failed")
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let f = filter("", &[], &[]);
        assert!(f.is_path_matched("a.txt"));
        assert!(f.is_path_matched("deep/nested/file.rs"));
    }

    #[test]
    fn test_base_path_scoping() {
        let f = filter("docs", &[], &[]);
        assert!(f.is_path_matched("docs/readme.md"));
        assert!(f.is_path_matched("docs"));
        assert!(!f.is_path_matched("src/main.rs"));
        assert!(!f.is_path_matched("docs-other/file"));
    }

    #[test]
    fn test_trim_base() {
        let f = filter("docs", &[], &[]);
        assert_eq!(f.trim_base("docs/guide/intro.md"), "guide/intro.md");
        assert_eq!(f.trim_base("docs"), ".");
        let any = AnyPathFilter;
        assert_eq!(any.trim_base("a/b"), "a/b");
    }

    #[test]
    fn test_includes_restrict_scope() {
        let f = filter("", &["*.md"], &[]);
        assert!(f.is_path_matched("readme.md"));
        assert!(!f.is_path_matched("main.rs"));
        // literal separator: a bare `*` does not cross `/`
        assert!(!f.is_path_matched("docs/readme.md"));
    }

    #[test]
    fn test_double_star_recurses() {
        let f = filter("", &["**/*.md"], &[]);
        assert!(f.is_path_matched("docs/deep/readme.md"));
        let g = filter("", &["docs/**"], &[]);
        assert!(g.is_path_matched("docs/deep/readme.md"));
        assert!(!g.is_path_matched("src/readme.md"));
    }

    #[test]
    fn test_directory_pattern_matches_contents() {
        let f = filter("", &["docs"], &[]);
        assert!(f.is_path_matched("docs/a/b.md"));
    }

    #[test]
    fn test_excludes_win() {
        let f = filter("", &[], &["vendor"]);
        assert!(f.is_path_matched("src/lib.rs"));
        assert!(!f.is_path_matched("vendor/dep/lib.rs"));

        let g = filter("", &["**/*.go"], &["vendor/**"]);
        assert!(g.is_path_matched("pkg/a.go"));
        assert!(!g.is_path_matched("vendor/pkg/a.go"));
    }

    #[test]
    fn test_character_classes() {
        let f = filter("", &["file[0-9].txt"], &[]);
        assert!(f.is_path_matched("file3.txt"));
        assert!(!f.is_path_matched("fileA.txt"));
    }

    #[test]
    fn test_patterns_are_base_relative() {
        let f = filter("app", &["*.yaml"], &[]);
        assert!(f.is_path_matched("app/values.yaml"));
        assert!(!f.is_path_matched("values.yaml"));
    }
}
