//! Run configuration for the capreplay orchestrator.
//!
//! Every field has a default, so an empty YAML file (or no file at all) is a
//! valid configuration. Command-line flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Name of the expectations file inside the replay sample folder.
pub const EXPECTATIONS_FILE: &str = "capture_replay_expectations.txt";

/// Target name of the replay binary.
pub const REPLAY_BINARY: &str = "capture_replay_tests";

/// Prefix of per-worker trace folders inside the replay sample folder.
pub const TRACE_FOLDER: &str = "traces";

/// Top-level configuration for one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Where to build for capture and replay, relative to the checkout root.
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,

    /// GoogleTest filter selecting the tests to run.
    #[serde(default = "default_gtest_filter")]
    pub gtest_filter: String,

    /// Test suite binary to capture with.
    #[serde(default = "default_test_suite")]
    pub test_suite: String,

    /// Folder holding the replay harness sources, trace folders and expectations.
    #[serde(default = "default_replay_sample_folder")]
    pub replay_sample_folder: PathBuf,

    /// Number of tests per batch.
    #[serde(default = "default_batch_count")]
    pub batch_count: usize,

    /// Upper bound on concurrent workers.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    /// Keep trace files between batches (also disambiguates composite files).
    #[serde(default)]
    pub keep_temp_files: bool,

    /// Delete trace folders and the output directory on exit.
    #[serde(default)]
    pub purge: bool,

    /// Use goma for distributed builds.
    #[serde(default)]
    pub use_goma: bool,

    /// Custom goma directory; empty means the one on PATH.
    #[serde(default)]
    pub goma_dir: String,

    /// Write the log to `result_file` instead of the terminal.
    #[serde(default)]
    pub output_to_file: bool,

    /// Log file name inside the replay sample folder.
    #[serde(default = "default_result_file")]
    pub result_file: String,

    /// Include full process output in batch reports.
    #[serde(default)]
    pub verbose: bool,

    /// Log level filter (trace, debug, info, warn, error).
    #[serde(default = "default_log")]
    pub log: String,

    /// depot_tools directory holding gn and ninja. Searched on PATH when unset.
    #[serde(default)]
    pub depot_tools_path: Option<PathBuf>,

    /// Run capture under `vpython testing/xvfb.py`.
    #[serde(default)]
    pub xvfb: bool,

    /// Timeout for capture and replay runs, in seconds.
    #[serde(default = "default_subprocess_timeout")]
    pub subprocess_timeout_secs: u64,

    /// Quiet period after which the coordinator logs a heartbeat, in seconds.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    /// Sleep between coordinator polls, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Last frame captured per test.
    #[serde(default = "default_capture_frame_end")]
    pub capture_frame_end: u32,
}

fn default_out_dir() -> PathBuf {
    PathBuf::from("out/CaptureReplayTest")
}

fn default_gtest_filter() -> String {
    "*/ES2_Vulkan".to_string()
}

fn default_test_suite() -> String {
    "angle_end2end_tests".to_string()
}

fn default_replay_sample_folder() -> PathBuf {
    PathBuf::from("src/tests/capture_replay_tests")
}

fn default_batch_count() -> usize {
    8
}

fn default_max_jobs() -> usize {
    8
}

fn default_result_file() -> String {
    "results.txt".to_string()
}

fn default_log() -> String {
    "info".to_string()
}

fn default_subprocess_timeout() -> u64 {
    600 // 10 minutes
}

fn default_heartbeat() -> u64 {
    20
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_capture_frame_end() -> u32 {
    100
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            out_dir: default_out_dir(),
            gtest_filter: default_gtest_filter(),
            test_suite: default_test_suite(),
            replay_sample_folder: default_replay_sample_folder(),
            batch_count: default_batch_count(),
            max_jobs: default_max_jobs(),
            keep_temp_files: false,
            purge: false,
            use_goma: false,
            goma_dir: String::new(),
            output_to_file: false,
            result_file: default_result_file(),
            verbose: false,
            log: default_log(),
            depot_tools_path: None,
            xvfb: false,
            subprocess_timeout_secs: default_subprocess_timeout(),
            heartbeat_secs: default_heartbeat(),
            poll_interval_ms: default_poll_interval(),
            capture_frame_end: default_capture_frame_end(),
        }
    }
}

impl RunConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path_ref)?;
        let config: Self = serde_yaml::from_str(&content)?;
        debug!(
            out_dir = %config.out_dir.display(),
            batch_count = config.batch_count,
            max_jobs = config.max_jobs,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Checks the configuration and returns warnings worth showing the user.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        if self.batch_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_jobs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_jobs".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_ms".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let mut warnings = Vec::new();
        if self.subprocess_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "subprocess_timeout_secs".to_string(),
                message: "0 disables the capture and replay timeout".to_string(),
            });
        }
        if !self.goma_dir.is_empty() && !self.use_goma {
            warnings.push(ConfigWarning {
                field: "goma_dir".to_string(),
                message: "set without use_goma; goma_dir is passed to gn but goma is off"
                    .to_string(),
            });
        }
        if self.output_to_file && self.result_file.is_empty() {
            warnings.push(ConfigWarning {
                field: "result_file".to_string(),
                message: "empty result file name; logging to the terminal".to_string(),
            });
        }
        Ok(warnings)
    }

    /// Name of the test suite executable on this platform.
    pub fn test_suite_binary(&self) -> String {
        if cfg!(windows) && !self.test_suite.ends_with(".exe") {
            format!("{}.exe", self.test_suite)
        } else {
            self.test_suite.clone()
        }
    }

    /// Build directory for the capture-enabled test suite.
    pub fn capture_build_dir(&self) -> PathBuf {
        self.out_dir.join("Capture")
    }

    /// Build directory for a worker's replay binary.
    pub fn replay_build_dir(&self, worker_id: usize) -> PathBuf {
        self.out_dir.join(format!("Replay{worker_id}"))
    }

    /// Path to the replay binary a worker builds.
    pub fn replay_binary_path(&self, worker_id: usize) -> PathBuf {
        let name = if cfg!(windows) {
            format!("{REPLAY_BINARY}.exe")
        } else {
            REPLAY_BINARY.to_string()
        };
        self.replay_build_dir(worker_id).join(name)
    }

    /// Name of a worker's private trace folder, relative to the sample folder.
    pub fn trace_dir_name(worker_id: usize) -> String {
        format!("{TRACE_FOLDER}{worker_id}")
    }

    /// Full path of a worker's private trace folder.
    pub fn trace_folder_path(&self, worker_id: usize) -> PathBuf {
        self.replay_sample_folder.join(Self::trace_dir_name(worker_id))
    }

    /// Path of the test expectations (exclusion) file.
    pub fn expectations_path(&self) -> PathBuf {
        self.replay_sample_folder.join(EXPECTATIONS_FILE)
    }

    /// Path of the log file used with `output_to_file`.
    pub fn result_file_path(&self) -> PathBuf {
        self.replay_sample_folder.join(&self.result_file)
    }

    /// Capture and replay timeout; `None` when disabled.
    pub fn subprocess_timeout(&self) -> Option<Duration> {
        (self.subprocess_timeout_secs > 0).then(|| Duration::from_secs(self.subprocess_timeout_secs))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// A configuration value that is allowed but probably not intended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Warning [{}]: {}", self.field, self.message)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.out_dir, PathBuf::from("out/CaptureReplayTest"));
        assert_eq!(config.gtest_filter, "*/ES2_Vulkan");
        assert_eq!(config.batch_count, 8);
        assert_eq!(config.max_jobs, 8);
        assert_eq!(config.subprocess_timeout(), Some(Duration::from_secs(600)));
        assert!(!config.keep_temp_files);
        assert!(config.validate().unwrap().is_empty());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
out_dir: out/Custom
batch_count: 4
keep_temp_files: true
depot_tools_path: /opt/depot_tools
"#;
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.out_dir, PathBuf::from("out/Custom"));
        assert_eq!(config.batch_count, 4);
        assert!(config.keep_temp_files);
        assert_eq!(config.depot_tools_path, Some(PathBuf::from("/opt/depot_tools")));
        // Untouched fields keep their defaults
        assert_eq!(config.max_jobs, 8);
        assert_eq!(config.test_suite, "angle_end2end_tests");
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config: RunConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.batch_count, default_batch_count());
        assert_eq!(config.log, "info");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("capreplay.yml");
        std::fs::write(&path, "max_jobs: 3\nverbose: true\n").unwrap();

        let config = RunConfig::from_file(&path).unwrap();
        assert_eq!(config.max_jobs, 3);
        assert!(config.verbose);
    }

    #[test]
    fn test_from_missing_file_is_io_error() {
        let result = RunConfig::from_file("/nonexistent/capreplay.yml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_zero_batch_count_rejected() {
        let config = RunConfig {
            batch_count: 0,
            ..RunConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "batch_count"
        ));
    }

    #[test]
    fn test_zero_max_jobs_rejected() {
        let config = RunConfig {
            max_jobs: 0,
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_warnings() {
        let config = RunConfig {
            subprocess_timeout_secs: 0,
            goma_dir: "/goma".to_string(),
            ..RunConfig::default()
        };
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 2);
        assert_eq!(
            warnings[0].to_string(),
            "Warning [subprocess_timeout_secs]: 0 disables the capture and replay timeout"
        );
        assert_eq!(config.subprocess_timeout(), None);
    }

    #[test]
    fn test_derived_paths() {
        let config = RunConfig::default();
        assert_eq!(
            config.trace_folder_path(2),
            PathBuf::from("src/tests/capture_replay_tests/traces2")
        );
        assert_eq!(
            config.replay_build_dir(1),
            PathBuf::from("out/CaptureReplayTest/Replay1")
        );
        assert_eq!(
            config.capture_build_dir(),
            PathBuf::from("out/CaptureReplayTest/Capture")
        );
        assert_eq!(
            config.expectations_path(),
            PathBuf::from("src/tests/capture_replay_tests/capture_replay_expectations.txt")
        );
    }
}
