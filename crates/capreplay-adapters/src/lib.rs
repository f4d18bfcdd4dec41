//! # capreplay-adapters
//!
//! Adapters between the capreplay orchestrator and the external programs it
//! drives:
//! - `ManagedProcess`, a single child process with join-with-timeout and kill
//! - `ProcessGroup`, the per-worker (and per-coordinator) supervisor that
//!   guarantees no child or worker outlives it
//! - `BuildTool`, the `gn gen` + `ninja` pair from depot_tools
//!
//! The `ProcessRunner` trait is the seam the batch pipeline is written
//! against, so tests can substitute a scripted runner for real processes.

mod build_tool;
mod command;
mod managed_process;
mod process_group;

pub use build_tool::{BuildTool, BuildToolError, find_depot_tools, goma_jobs};
pub use command::CommandSpec;
pub use managed_process::{ManagedProcess, ProcessExit, WaitError};
pub use process_group::{ProcessGroup, ProcessOutcome, ProcessRunner, RunStatus};
