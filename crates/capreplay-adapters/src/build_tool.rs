//! The `gn gen` + `ninja` build pipeline from depot_tools.

use crate::{CommandSpec, ProcessOutcome, ProcessRunner};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::debug;

const DEPOT_TOOLS_DIR: &str = "depot_tools";

/// Parallelism multiplier used for distributed (goma) builds.
const GOMA_CORE_MULTIPLIER: usize = 40;

/// Errors locating the build tools.
#[derive(Debug, thiserror::Error)]
pub enum BuildToolError {
    #[error("No depot_tools directory found on PATH; pass --depot-tools-path")]
    DepotToolsNotFound,
}

/// Paths and fixed arguments for generating and running builds.
#[derive(Debug, Clone)]
pub struct BuildTool {
    gn_path: PathBuf,
    ninja_path: PathBuf,
    use_goma: bool,
    goma_dir: Option<String>,
}

impl BuildTool {
    /// Locates `gn` and `ninja` in `depot_tools_path`, or in the first `PATH`
    /// entry named `depot_tools` when no path is given.
    pub fn locate(
        depot_tools_path: Option<&Path>,
        use_goma: bool,
        goma_dir: Option<String>,
    ) -> Result<Self, BuildToolError> {
        let depot_tools = match depot_tools_path {
            Some(path) => path.to_path_buf(),
            None => std::env::var_os("PATH")
                .and_then(|path| find_depot_tools(&path))
                .ok_or(BuildToolError::DepotToolsNotFound)?,
        };
        debug!(depot_tools = %depot_tools.display(), "Using depot_tools");

        Ok(Self {
            gn_path: depot_tools.join(exe_name("gn", "bat")),
            ninja_path: depot_tools.join(exe_name("ninja", "exe")),
            use_goma,
            goma_dir: goma_dir.filter(|dir| !dir.is_empty()),
        })
    }

    pub fn gn_path(&self) -> &Path {
        &self.gn_path
    }

    pub fn ninja_path(&self) -> &Path {
        &self.ninja_path
    }

    /// Fixed gn args followed by `extra`, as `key=value` pairs.
    pub fn gn_args(&self, extra: &[(String, String)]) -> Vec<(String, String)> {
        let mut args = vec![
            ("use_goma".to_string(), self.use_goma.to_string()),
            (
                "angle_with_capture_by_default".to_string(),
                "true".to_string(),
            ),
        ];
        args.extend(extra.iter().cloned());
        if let Some(dir) = &self.goma_dir {
            args.push(("goma_dir".to_string(), format!("\"{dir}\"")));
        }
        args
    }

    /// `gn gen --args=<...> <build_dir>`.
    pub fn generate_command(&self, build_dir: &Path, extra: &[(String, String)]) -> CommandSpec {
        let args = self
            .gn_args(extra)
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        CommandSpec::new(&self.gn_path)
            .arg("gen")
            .arg(format!("--args={args}"))
            .arg(build_dir.to_string_lossy())
    }

    /// `ninja [-j N] -C <build_dir> <target>`.
    pub fn build_command(&self, build_dir: &Path, target: &str) -> CommandSpec {
        let mut command = CommandSpec::new(&self.ninja_path);
        if self.use_goma {
            let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
            command = command.arg("-j").arg(goma_jobs(cores).to_string());
        }
        command
            .arg("-C")
            .arg(build_dir.to_string_lossy())
            .arg(target)
    }

    /// Generates build files in `build_dir`.
    pub async fn generate(
        &self,
        runner: &mut dyn ProcessRunner,
        build_dir: &Path,
        extra: &[(String, String)],
        capture_output: bool,
    ) -> ProcessOutcome {
        let mut command = self.generate_command(build_dir, extra);
        if !capture_output {
            command = command.inherit_output();
        }
        debug!(command = %command, "Calling gn gen");
        runner.run(&command, None).await
    }

    /// Builds `target` in `build_dir`.
    pub async fn build(
        &self,
        runner: &mut dyn ProcessRunner,
        build_dir: &Path,
        target: &str,
        capture_output: bool,
    ) -> ProcessOutcome {
        let mut command = self.build_command(build_dir, target);
        if !capture_output {
            command = command.inherit_output();
        }
        debug!(command = %command, "Calling ninja");
        runner.run(&command, None).await
    }
}

/// First entry of a `PATH`-style list whose last component is `depot_tools`.
pub fn find_depot_tools(path_var: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var).find(|path| path.file_name() == Some(OsStr::new(DEPOT_TOOLS_DIR)))
}

/// Ninja job count for goma builds on a machine with `cores` cores.
///
/// Windows sees no gain above 1000 jobs; macOS runs out of file handles above 500.
pub fn goma_jobs(cores: usize) -> usize {
    let jobs = cores * GOMA_CORE_MULTIPLIER;
    if cfg!(target_os = "windows") {
        jobs.min(1000)
    } else if cfg!(target_os = "macos") {
        jobs.min(500)
    } else {
        jobs
    }
}

fn exe_name(name: &str, windows_ext: &str) -> String {
    if cfg!(windows) {
        format!("{name}.{windows_ext}")
    } else {
        name.to_string()
    }
}
