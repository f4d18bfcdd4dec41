//! Test discovery and the capture/replay exclusion list.
//!
//! The expectations file holds one shell glob per line; blank lines and
//! `#` comments are ignored. Any discovered test matching a glob is excluded
//! before batching.

use glob::Pattern;
use std::path::Path;
use tracing::{info, warn};

/// Line after which `--list-tests` output contains test names.
const TESTS_LIST_HEADER: &str = "Tests list:";

/// Compiled exclusion globs.
#[derive(Debug, Clone, Default)]
pub struct SkipList {
    patterns: Vec<Pattern>,
}

impl SkipList {
    /// Parses expectations text. Lines that are not valid globs are logged and ignored.
    pub fn parse(content: &str) -> Self {
        let patterns = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| match Pattern::new(line) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = line, error = %e, "Ignoring invalid expectation pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// Loads the expectations file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    /// Whether `test_name` matches any exclusion glob.
    pub fn is_skipped(&self, test_name: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(test_name))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Test names after the `Tests list:` header, minus excluded ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredTests {
    pub tests: Vec<String>,
    pub skipped: usize,
}

/// Extracts test names from `--list-tests` output and drops excluded ones.
pub fn parse_test_list(output: &str, skip_list: &SkipList) -> DiscoveredTests {
    let mut discovered = DiscoveredTests::default();
    let names = output
        .lines()
        .map(str::trim)
        .skip_while(|line| *line != TESTS_LIST_HEADER)
        .skip(1)
        .filter(|line| !line.is_empty());

    for name in names {
        if skip_list.is_skipped(name) {
            discovered.skipped += 1;
        } else {
            discovered.tests.push(name.to_string());
        }
    }

    info!(
        "Found {} tests and {} skipped tests.",
        discovered.tests.len(),
        discovered.skipped
    );
    discovered
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_OUTPUT: &str = "\
Running main() from gtest_main.cc
Tests list:
BufferDataTest.Basic/ES2_Vulkan
BufferDataTest.Huge/ES2_Vulkan
ClearTest.Color/ES2_Vulkan

ClearTest.Depth/ES2_Vulkan
";

    #[test]
    fn test_parse_ignores_blank_and_comment_lines() {
        let skip = SkipList::parse("# comment\n\n  BufferDataTest.*  \n#ClearTest.*\n");
        assert_eq!(skip.len(), 1);
        assert!(skip.is_skipped("BufferDataTest.Basic/ES2_Vulkan"));
        assert!(!skip.is_skipped("ClearTest.Color/ES2_Vulkan"));
    }

    #[test]
    fn test_glob_semantics() {
        let skip = SkipList::parse("*/ES3_*\nClearTest.Co?or/*\n");
        assert!(skip.is_skipped("Any.Test/ES3_Vulkan"));
        assert!(skip.is_skipped("ClearTest.Color/ES2_Vulkan"));
        assert!(!skip.is_skipped("ClearTest.Depth/ES2_Vulkan"));
    }

    #[test]
    fn test_empty_skip_list_skips_nothing() {
        let skip = SkipList::default();
        assert!(skip.is_empty());
        assert!(!skip.is_skipped("Anything"));
    }

    #[test]
    fn test_parse_test_list_starts_after_header() {
        let discovered = parse_test_list(LIST_OUTPUT, &SkipList::default());
        assert_eq!(
            discovered.tests,
            vec![
                "BufferDataTest.Basic/ES2_Vulkan",
                "BufferDataTest.Huge/ES2_Vulkan",
                "ClearTest.Color/ES2_Vulkan",
                "ClearTest.Depth/ES2_Vulkan",
            ]
        );
        assert_eq!(discovered.skipped, 0);
    }

    #[test]
    fn test_parse_test_list_applies_exclusions() {
        let skip = SkipList::parse("BufferDataTest.*\n");
        let discovered = parse_test_list(LIST_OUTPUT, &skip);
        assert_eq!(discovered.tests.len(), 2);
        assert_eq!(discovered.skipped, 2);
    }

    #[test]
    fn test_parse_test_list_without_header_is_empty() {
        let discovered = parse_test_list("A.b/C\nA.d/C\n", &SkipList::default());
        assert!(discovered.tests.is_empty());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("capture_replay_expectations.txt");
        std::fs::write(&path, "# flaky\nClearTest.*\n").unwrap();

        let skip = SkipList::from_file(&path).unwrap();
        assert!(skip.is_skipped("ClearTest.Color/ES2_Vulkan"));
    }
}
