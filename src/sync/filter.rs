//! File predicate for sync and verification scans.
//!
//! A filter is an ordered set of include/exclude glob rules plus optional
//! size and age bounds, evaluated against scanned [`FileInfo`] records.
//! Patterns match the full forward-slash path first, then the final
//! component, so `.DS_Store`-style rules work without a leading `**/`.

use anyhow::{Context, Result};
use chrono::Utc;
use globset::{Glob, GlobMatcher};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::sync::scan::FileInfo;

/// Predicate over `{path, size, modtime, is_dir}`.
///
/// An empty filter accepts everything. With include rules present, a path
/// must match at least one of them; any matching exclude rule rejects.
#[derive(Clone, Default)]
pub struct Filter {
    includes: Vec<(String, GlobMatcher)>,
    excludes: Vec<(String, GlobMatcher)>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub min_age: Option<Duration>,
    pub max_age: Option<Duration>,
}

/// `**` collapses to `*`; with globset's defaults `*` crosses separators,
/// so the collapsed form still matches whole subtrees.
fn compile(pattern: &str) -> Result<GlobMatcher> {
    let normalized = pattern.replace("**", "*");
    let glob = Glob::new(&normalized)
        .with_context(|| format!("invalid filter pattern {pattern:?}"))?;
    Ok(glob.compile_matcher())
}

fn matches_pattern(matcher: &GlobMatcher, path: &str) -> bool {
    if matcher.is_match(path) {
        return true;
    }
    match path.rsplit('/').next() {
        Some(name) if name != path => matcher.is_match(name),
        _ => false,
    }
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_include(&mut self, pattern: &str) -> Result<()> {
        let matcher = compile(pattern)?;
        self.includes.push((pattern.to_string(), matcher));
        Ok(())
    }

    pub fn add_exclude(&mut self, pattern: &str) -> Result<()> {
        let matcher = compile(pattern)?;
        self.excludes.push((pattern.to_string(), matcher));
        Ok(())
    }

    /// Evaluate the predicate. Age bounds need a modtime; entries without
    /// one pass them.
    pub fn matches(&self, info: &FileInfo) -> bool {
        if !self.includes.is_empty()
            && !self
                .includes
                .iter()
                .any(|(_, m)| matches_pattern(m, &info.path))
        {
            return false;
        }
        if self
            .excludes
            .iter()
            .any(|(_, m)| matches_pattern(m, &info.path))
        {
            return false;
        }
        if let Some(min) = self.min_size {
            if info.size < min {
                return false;
            }
        }
        if let Some(max) = self.max_size {
            if info.size > max {
                return false;
            }
        }
        if let Some(modtime) = info.modtime {
            let age = (Utc::now() - modtime).to_std().unwrap_or(Duration::ZERO);
            if let Some(min) = self.min_age {
                if age < min {
                    return false;
                }
            }
            if let Some(max) = self.max_age {
                if age > max {
                    return false;
                }
            }
        }
        true
    }

    /// Parse a rule file: one rule per line, `#` comments and blanks
    /// ignored, `+ pattern` includes, `- pattern` excludes, bare patterns
    /// exclude.
    pub fn from_rules(text: &str) -> Result<Self> {
        let mut filter = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(pattern) = line.strip_prefix("+ ") {
                filter.add_include(pattern.trim())?;
            } else if let Some(pattern) = line.strip_prefix("- ") {
                filter.add_exclude(pattern.trim())?;
            } else {
                filter.add_exclude(line)?;
            }
        }
        Ok(filter)
    }

    pub fn from_rules_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read filter rules from {}", path.display()))?;
        Self::from_rules(&text)
    }

    pub fn include_patterns(&self) -> impl Iterator<Item = &str> {
        self.includes.iter().map(|(p, _)| p.as_str())
    }

    pub fn exclude_patterns(&self) -> impl Iterator<Item = &str> {
        self.excludes.iter().map(|(p, _)| p.as_str())
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("includes", &self.includes.iter().map(|(p, _)| p).collect::<Vec<_>>())
            .field("excludes", &self.excludes.iter().map(|(p, _)| p).collect::<Vec<_>>())
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .field("min_age", &self.min_age)
            .field("max_age", &self.max_age)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, size: u64) -> FileInfo {
        FileInfo {
            path: path.to_string(),
            size,
            modtime: Some(Utc::now()),
            hash: None,
            is_dir: false,
        }
    }

    #[test]
    fn test_empty_filter_accepts_all() {
        let filter = Filter::new();
        assert!(filter.matches(&file("anything/at/all.bin", 0)));
    }

    #[test]
    fn test_exclude_by_extension_and_name() {
        let mut filter = Filter::new();
        filter.add_exclude("*.log").unwrap();
        filter.add_exclude(".DS_Store").unwrap();

        assert!(!filter.matches(&file("debug.log", 1)));
        assert!(!filter.matches(&file("deep/dir/trace.log", 1)));
        assert!(!filter.matches(&file("sub/.DS_Store", 1)));
        assert!(filter.matches(&file("main.rs", 1)));
    }

    #[test]
    fn test_includes_restrict() {
        let mut filter = Filter::new();
        filter.add_include("*.txt").unwrap();

        assert!(filter.matches(&file("notes.txt", 1)));
        assert!(filter.matches(&file("sub/notes.txt", 1)));
        assert!(!filter.matches(&file("binary.dat", 1)));
    }

    #[test]
    fn test_exclude_beats_include() {
        let mut filter = Filter::new();
        filter.add_include("*.txt").unwrap();
        filter.add_exclude("secret*").unwrap();

        assert!(filter.matches(&file("plain.txt", 1)));
        assert!(!filter.matches(&file("secret.txt", 1)));
    }

    #[test]
    fn test_double_star_collapses() {
        let mut filter = Filter::new();
        filter.add_exclude("node_modules/**").unwrap();
        assert!(!filter.matches(&file("node_modules/pkg/index.js", 1)));
        assert!(filter.matches(&file("src/index.js", 1)));
    }

    #[test]
    fn test_size_bounds() {
        let mut filter = Filter::new();
        filter.min_size = Some(10);
        filter.max_size = Some(100);

        assert!(!filter.matches(&file("small", 5)));
        assert!(filter.matches(&file("fits", 50)));
        assert!(!filter.matches(&file("big", 500)));
    }

    #[test]
    fn test_age_bounds() {
        let mut filter = Filter::new();
        filter.min_age = Some(Duration::from_secs(3600));

        let fresh = file("fresh", 1);
        assert!(!filter.matches(&fresh));

        let old = FileInfo {
            modtime: Some(Utc::now() - chrono::Duration::hours(2)),
            ..file("old", 1)
        };
        assert!(filter.matches(&old));

        // No modtime: age bounds cannot apply.
        let unknown = FileInfo {
            modtime: None,
            ..file("unknown", 1)
        };
        assert!(filter.matches(&unknown));
    }

    #[test]
    fn test_exclude_monotonicity() {
        let paths = ["a.txt", "b.log", "c/d.tmp", "e.rs"];
        let mut filter = Filter::new();
        let before: Vec<_> = paths.iter().filter(|p| filter.matches(&file(p, 1))).collect();
        filter.add_exclude("*.tmp").unwrap();
        let after: Vec<_> = paths.iter().filter(|p| filter.matches(&file(p, 1))).collect();
        assert!(after.len() <= before.len());
        assert!(after.iter().all(|p| before.contains(p)));
    }

    #[test]
    fn test_rule_file_parsing() {
        let rules = "\
# keep sources, drop build output
+ *.rs
+ *.toml
- target/**

*.bak
";
        let filter = Filter::from_rules(rules).unwrap();
        assert!(filter.matches(&file("src/lib.rs", 1)));
        assert!(filter.matches(&file("Cargo.toml", 1)));
        assert!(!filter.matches(&file("target/debug/lib.rs", 1)));
        assert!(!filter.matches(&file("old.bak", 1)));
        assert!(!filter.matches(&file("README.md", 1)));
    }

    #[test]
    fn test_invalid_pattern_errors() {
        let mut filter = Filter::new();
        assert!(filter.add_exclude("[unclosed").is_err());
    }
}
