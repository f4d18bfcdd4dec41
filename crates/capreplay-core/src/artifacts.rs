//! Trace artifacts: recognizing capture output and generating replay glue.
//!
//! A successful single-context capture of a test labelled `L` leaves, in the
//! worker's trace folder:
//! - `L_capture_context<N>.h` and `L_capture_context<N>.cpp`
//! - one or more `L_capture_context<N>_frame<F>.cpp`
//! - `L_capture_context<N>_files.txt`, listing every source of the trace
//!
//! From the surviving tests of a batch, the build stage writes a `.gni` source
//! list and a `CompositeTests<id>.h/.cpp` pair that registers each trace with
//! the replay harness.

use capreplay_proto::{Error, Result, TRACE_FILE_SUFFIX, TestCase};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

/// Attempts made to remove a folder that is still briefly locked.
const DELETE_ATTEMPTS: u32 = 5;

const COMPOSITE_HEADER_TEMPLATE: &str = r#"#pragma once
#include <vector>
#include <string>

{trace_headers}
struct TestTraceInfo {
    std::string testName;
    uint32_t replayContextMajorVersion;
    uint32_t replayContextMinorVersion;
    EGLint replayPlatformType;
    EGLint replayDeviceType;
    uint32_t replayFrameStart;
    uint32_t replayFrameEnd;
    EGLint replayDrawSurfaceWidth;
    EGLint replayDrawSurfaceHeight;
    EGLint defaultFramebufferRedBits;
    EGLint defaultFramebufferGreenBits;
    EGLint defaultFramebufferBlueBits;
    EGLint defaultFramebufferAlphaBits;
    EGLint defaultFramebufferDepthBits;
    EGLint defaultFramebufferStencilBits;
    bool isBinaryDataCompressed;
};

extern std::vector<TestTraceInfo> testTraceInfos;
"#;

const TRACE_INFO_INIT_TEMPLATE: &str = r#"    {
        "{namespace}",
        {namespace}::kReplayContextClientMajorVersion,
        {namespace}::kReplayContextClientMinorVersion,
        {namespace}::kReplayPlatformType,
        {namespace}::kReplayDeviceType,
        {namespace}::kReplayFrameStart,
        {namespace}::kReplayFrameEnd,
        {namespace}::kReplayDrawSurfaceWidth,
        {namespace}::kReplayDrawSurfaceHeight,
        {namespace}::kDefaultFramebufferRedBits,
        {namespace}::kDefaultFramebufferGreenBits,
        {namespace}::kDefaultFramebufferBlueBits,
        {namespace}::kDefaultFramebufferAlphaBits,
        {namespace}::kDefaultFramebufferDepthBits,
        {namespace}::kDefaultFramebufferStencilBits,
        {namespace}::kIsBinaryDataCompressed
    },
"#;

/// Files a capture produced for one test, by kind.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TraceFiles {
    pub frame_files: usize,
    pub context_headers: usize,
    pub context_sources: usize,
    pub source_lists: usize,
    /// Context id from the (last seen) header name, if it parsed.
    pub context_id: Option<u32>,
}

impl TraceFiles {
    /// Scans `trace_folder` for the artifacts of `label`.
    pub fn scan(trace_folder: &Path, label: &str) -> Result<Self> {
        let prefix = format!("{label}{TRACE_FILE_SUFFIX}");
        let mut files = Self::default();

        let entries = fs::read_dir(trace_folder).map_err(|e| Error::artifact(trace_folder, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::artifact(trace_folder, e))?;
            if !entry.file_type().is_ok_and(|t| t.is_file()) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            files.classify(rest);
        }
        Ok(files)
    }

    /// Counts one file given its name with the `<label>_capture_context` prefix removed.
    fn classify(&mut self, rest: &str) {
        if rest.contains("_frame") {
            self.frame_files += 1;
        } else if rest.ends_with(".txt") {
            self.source_lists += 1;
        } else if let Some(id) = rest.strip_suffix(".h") {
            self.context_headers += 1;
            self.context_id = id.parse().ok().filter(|&id| id > 0);
        } else if rest.ends_with(".cpp") {
            self.context_sources += 1;
        }
    }

    /// Context id if these files are a complete single-context trace.
    pub fn replayable_context(&self) -> Option<u32> {
        let complete = self.frame_files >= 1
            && self.context_headers == 1
            && self.context_sources == 1
            && self.source_lists == 1;
        if complete { self.context_id } else { None }
    }
}

/// Context id of `test` if its capture left everything replay needs.
///
/// Only reads the directory, so repeated calls over unchanged files agree.
pub fn can_run_replay(trace_folder: &Path, test: &TestCase) -> Result<Option<u32>> {
    let files = TraceFiles::scan(trace_folder, test.label())?;
    debug!(label = test.label(), ?files, "Inspected trace files");
    Ok(files.replayable_context())
}

/// Writes `traces<id>.gni`, listing each test's trace sources.
///
/// Source paths are namespaced under `trace_dir_name` so the replay build can
/// find them relative to the sample folder.
pub fn write_gni(
    trace_folder: &Path,
    trace_dir_name: &str,
    composite_id: u32,
    tests: &[TestCase],
) -> Result<PathBuf> {
    let mut entries = Vec::with_capacity(tests.len());
    for test in tests {
        if test.context_id() == 0 {
            return Err(Error::MissingContext(test.full_name().to_string()));
        }
        let list_path = trace_folder.join(format!("{}_files.txt", test.trace_stem()));
        let listing = fs::read_to_string(&list_path).map_err(|e| Error::artifact(&list_path, e))?;
        let files = listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|file| format!("\"{trace_dir_name}/{file}\""))
            .collect::<Vec<_>>()
            .join(",");
        entries.push(format!(
            "[\"{}\", {}, [{}]]",
            test.label(),
            test.context_id(),
            files
        ));
    }

    let gni_path = trace_folder.join(format!("traces{composite_id}.gni"));
    let content = format!("trace_data = [\n{}\n]\n", entries.join(",\n"));
    fs::write(&gni_path, content).map_err(|e| Error::artifact(&gni_path, e))?;
    Ok(gni_path)
}

/// Writes `CompositeTests<id>.h` and `.cpp`, which glue the traces into the harness.
pub fn write_composite_files(
    trace_folder: &Path,
    composite_id: u32,
    tests: &[TestCase],
) -> Result<(PathBuf, PathBuf)> {
    let trace_headers: String = tests
        .iter()
        .map(|test| format!("#include \"{}.h\"\n", test.trace_stem()))
        .collect();
    let h_filename = format!("CompositeTests{composite_id}.h");
    let h_path = trace_folder.join(&h_filename);
    let header = COMPOSITE_HEADER_TEMPLATE.replace("{trace_headers}", &trace_headers);
    fs::write(&h_path, header).map_err(|e| Error::artifact(&h_path, e))?;

    let inits: String = tests
        .iter()
        .map(|test| TRACE_INFO_INIT_TEMPLATE.replace("{namespace}", test.label()))
        .collect();
    let cpp_path = trace_folder.join(format!("CompositeTests{composite_id}.cpp"));
    let source = format!(
        "#include \"{h_filename}\"\n\nstd::vector<TestTraceInfo> testTraceInfos =\n{{\n{inits}\n}};\n"
    );
    fs::write(&cpp_path, source).map_err(|e| Error::artifact(&cpp_path, e))?;

    Ok((h_path, cpp_path))
}

/// Removes the regular files directly inside `path`, leaving subfolders alone.
pub fn clear_folder_content(path: &Path) -> Result<()> {
    for entry in fs::read_dir(path).map_err(|e| Error::artifact(path, e))? {
        let entry = entry.map_err(|e| Error::artifact(path, e))?;
        if entry.file_type().is_ok_and(|t| t.is_file()) {
            let file = entry.path();
            fs::remove_file(&file).map_err(|e| Error::artifact(&file, e))?;
        }
    }
    Ok(())
}

/// Recreates empty `traces0..count` folders under `sample_folder`.
pub fn create_trace_folders(sample_folder: &Path, count: usize) -> Result<()> {
    for worker_id in 0..count {
        let path = sample_folder.join(crate::RunConfig::trace_dir_name(worker_id));
        if path.is_dir() {
            fs::remove_dir_all(&path).map_err(|e| Error::artifact(&path, e))?;
        }
        fs::create_dir_all(&path).map_err(|e| Error::artifact(&path, e))?;
    }
    Ok(())
}

/// Deletes `traces0..count` under `sample_folder`.
pub fn delete_trace_folders(sample_folder: &Path, count: usize) {
    for worker_id in 0..count {
        safe_delete_folder(&sample_folder.join(crate::RunConfig::trace_dir_name(worker_id)));
    }
}

/// Deletes the trace folders and the build directory of a run.
///
/// The removal retries block, so inside a multi-threaded runtime the work is
/// moved off the async worker thread with `block_in_place`.
pub fn purge_run_folders(sample_folder: &Path, folder_count: usize, out_dir: &Path) {
    let purge = || {
        debug!(out_dir = %out_dir.display(), "Purging trace folders and build directory");
        delete_trace_folders(sample_folder, folder_count);
        safe_delete_folder(out_dir);
    };
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(purge);
        }
        _ => purge(),
    }
}

/// Removes `path` recursively, retrying briefly while files are still held open.
///
/// Blocking; async callers go through [`purge_run_folders`].
pub fn safe_delete_folder(path: &Path) {
    for attempt in 1..=DELETE_ATTEMPTS {
        if !path.is_dir() {
            return;
        }
        match fs::remove_dir_all(path) {
            Ok(()) => return,
            Err(e) if attempt < DELETE_ATTEMPTS => {
                debug!(path = %path.display(), error = %e, attempt, "Retrying folder removal");
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to delete folder");
            }
        }
    }
}
