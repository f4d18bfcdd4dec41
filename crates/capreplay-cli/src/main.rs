//! # capreplay-cli
//!
//! Binary entry point for the capture/replay orchestrator.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Logging setup, to the terminal or a result file
//! - Signal handling that cancels the run cleanly
//! - Cleanup of generated folders with `--purge`

use anyhow::{Context, Result};
use capreplay_adapters::{BuildTool, ProcessGroup, ProcessRunner};
use capreplay_core::{Coordinator, RunConfig, RunOutcome, artifacts, trace_folder_count};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Unix-specific process management for process group leadership
#[cfg(unix)]
mod process_management {
    use nix::unistd::{Pid, setpgid};
    use tracing::debug;

    /// Makes this process a group leader so every build, capture and replay
    /// child shares its process group.
    pub fn setup_process_group() {
        let pid = Pid::this();
        if let Err(e) = setpgid(pid, pid) {
            // EPERM: already a group leader (e.g. started from a shell)
            if e != nix::errno::Errno::EPERM {
                debug!("Could not set process group ({}), continuing anyway", e);
            }
        }
        debug!("Process group initialized: PID {}", pid);
    }
}

#[cfg(not(unix))]
mod process_management {
    /// No-op on non-Unix platforms.
    pub fn setup_process_group() {}
}

/// Captures each test's GL calls to a trace, rebuilds the trace as a
/// standalone replay, and checks the replay reproduces the test.
#[derive(Parser, Debug)]
#[command(name = "capreplay", version, about)]
struct Cli {
    /// YAML configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where to build ANGLE for capture and replay
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Use goma for distributed builds
    #[arg(long)]
    use_goma: bool,

    /// Tests to run, as a gtest filter
    #[arg(long = "gtest_filter")]
    gtest_filter: Option<String>,

    /// Test suite binary to capture from
    #[arg(long)]
    test_suite: Option<String>,

    /// Maximum number of tests per batch
    #[arg(long)]
    batch_count: Option<usize>,

    /// Keep trace files between batches and after the run
    #[arg(long)]
    keep_temp_files: bool,

    /// Delete trace folders and the build directory when done
    #[arg(long)]
    purge: bool,

    /// Goma directory, if not the default
    #[arg(long)]
    goma_dir: Option<String>,

    /// Write logs to the result file instead of the terminal
    #[arg(long)]
    output_to_file: bool,

    /// Log file name, relative to the replay sample folder
    #[arg(long)]
    result_file: Option<String>,

    /// Write the final report as JSON to this path
    #[arg(long)]
    json_report: Option<PathBuf>,

    /// Show full process output in batch reports and enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long)]
    log: Option<String>,

    /// Maximum number of worker tasks
    #[arg(short = 'j', long)]
    max_jobs: Option<usize>,

    /// depot_tools directory holding gn and ninja
    #[arg(long)]
    depot_tools_path: Option<PathBuf>,

    /// Run captures under a virtual X server
    #[arg(long)]
    xvfb: bool,

    /// Print the resolved configuration and exit
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    /// Loads the config file (or defaults) and applies flag overrides.
    fn resolve_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => RunConfig::default(),
        };

        if let Some(out_dir) = &self.out_dir {
            config.out_dir.clone_from(out_dir);
        }
        if let Some(filter) = &self.gtest_filter {
            config.gtest_filter.clone_from(filter);
        }
        if let Some(suite) = &self.test_suite {
            config.test_suite.clone_from(suite);
        }
        if let Some(count) = self.batch_count {
            config.batch_count = count;
        }
        if let Some(dir) = &self.goma_dir {
            config.goma_dir.clone_from(dir);
        }
        if let Some(file) = &self.result_file {
            config.result_file.clone_from(file);
        }
        if let Some(level) = &self.log {
            config.log.clone_from(level);
        }
        if let Some(jobs) = self.max_jobs {
            config.max_jobs = jobs;
        }
        if let Some(path) = &self.depot_tools_path {
            config.depot_tools_path = Some(path.clone());
        }
        config.use_goma |= self.use_goma;
        config.keep_temp_files |= self.keep_temp_files;
        config.purge |= self.purge;
        config.output_to_file |= self.output_to_file;
        config.verbose |= self.verbose;
        config.xvfb |= self.xvfb;

        Ok(config)
    }
}

fn init_logging(config: &RunConfig) -> Result<()> {
    let level = if config.verbose { "debug" } else { config.log.as_str() };
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.output_to_file && !config.result_file.is_empty() {
        let path = config.result_file_path();
        let file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// Raises the cancel flag on SIGINT, SIGTERM or SIGHUP.
fn spawn_signal_handlers(cancel: &Arc<watch::Sender<bool>>) {
    let cancel_sigint = Arc::clone(cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received (SIGINT), stopping workers...");
            cancel_sigint.send_replace(true);
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        for (kind, name) in [
            (SignalKind::terminate(), "SIGTERM"),
            (SignalKind::hangup(), "SIGHUP"),
        ] {
            let cancel = Arc::clone(cancel);
            match signal(kind) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        stream.recv().await;
                        warn!("{} received, stopping workers...", name);
                        cancel.send_replace(true);
                    });
                }
                Err(e) => warn!("Failed to register {} handler: {}", name, e),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;
    init_logging(&config)?;

    for warning in config.validate().context("Invalid configuration")? {
        warn!("{}", warning);
    }

    if cli.dry_run {
        let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
        println!("{yaml}");
        return Ok(ExitCode::SUCCESS);
    }

    process_management::setup_process_group();
    let code = run(config, cli.json_report).await?;
    Ok(ExitCode::from(code))
}

async fn run(config: RunConfig, json_report: Option<PathBuf>) -> Result<u8> {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    let build_tool = BuildTool::locate(
        config.depot_tools_path.as_deref(),
        config.use_goma,
        Some(config.goma_dir.clone()),
    )?;

    // Purge runs on every exit path, including errors.
    let folders = trace_folder_count(cpus, config.max_jobs);
    let _purge = scopeguard::guard(
        (config.purge, config.replay_sample_folder.clone(), config.out_dir.clone()),
        move |(purge, sample_folder, out_dir)| {
            if purge {
                artifacts::purge_run_folders(&sample_folder, folders, &out_dir);
            }
        },
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let cancel_tx = Arc::new(cancel_tx);
    spawn_signal_handlers(&cancel_tx);

    let coordinator = Coordinator::new(Arc::new(config), build_tool, cancel_rx);
    let mut group = ProcessGroup::new();
    let outcome = coordinator
        .run(
            &mut group,
            |_| -> Box<dyn ProcessRunner> { Box::new(ProcessGroup::new()) },
            cpus,
        )
        .await?;

    match &outcome {
        RunOutcome::Completed(report) => {
            report.log_summary();
            if let Some(path) = json_report {
                report
                    .write_json(&path)
                    .with_context(|| format!("Failed to write report to {}", path.display()))?;
                info!("Report written to {}", path.display());
            }
        }
        RunOutcome::Interrupted => warn!("Run interrupted"),
    }

    Ok(u8::try_from(outcome.exit_code()).unwrap_or(1))
}
