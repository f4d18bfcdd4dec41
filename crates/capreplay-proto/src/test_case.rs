//! The unit of work: one test discovered from the capture test binary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Infix shared by every trace artifact a capture run writes for a test.
///
/// Only single-context captures are supported, so a header is always named
/// `<label>_capture_context<id>.h`.
pub const TRACE_FILE_SUFFIX: &str = "_capture_context";

/// A named test with its derived artifact label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    full_name: String,
    params: String,
    label: String,
    context_id: u32,
}

impl TestCase {
    /// Creates a test case from its full gtest name (e.g. `Suite.Test/ES2_Vulkan`).
    pub fn new(full_name: impl Into<String>) -> Self {
        let full_name = full_name.into();
        let params = full_name
            .split_once('/')
            .map(|(_, params)| params.to_string())
            .unwrap_or_default();
        let label = sanitize_label(&full_name);
        Self {
            full_name,
            params,
            label,
            context_id: 0,
        }
    }

    /// The full test name as passed to `--gtest_filter`.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Everything after the first `/`, or empty.
    pub fn params(&self) -> &str {
        &self.params
    }

    /// Identifier-safe rendering of the name, used to prefix trace artifacts.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Context id parsed from the capture header; 0 until discovered.
    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    /// Records the discovered capture context.
    pub fn set_context_id(&mut self, context_id: u32) {
        self.context_id = context_id;
    }

    /// Stem shared by this test's context header, source, and file list.
    ///
    /// Only meaningful once the context id is known.
    pub fn trace_stem(&self) -> String {
        format!("{}{}{}", self.label, TRACE_FILE_SUFFIX, self.context_id)
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Params: {}", self.full_name, self.params)
    }
}

fn sanitize_label(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
