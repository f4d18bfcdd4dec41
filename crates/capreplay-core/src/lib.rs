//! # capreplay-core
//!
//! Batch pipeline and scheduling for the capture/replay regression harness.
//!
//! This crate provides:
//! - Run configuration and the test expectations (exclusion) list
//! - Trace artifact validation and replay source generation
//! - The per-batch capture → build → replay pipeline
//! - The worker pool, coordinator loop, and aggregated report

pub mod artifacts;
mod batch;
mod config;
mod coordinator;
mod expectations;
mod queue;
mod report;
pub mod testing;
mod worker;

pub use batch::{
    MISSING_TRACES_MESSAGE, NO_RESULT_MESSAGE, RESULT_TAG, StageOutcome, TestBatch, WorkerContext,
    parse_replay_output,
};
pub use config::{ConfigError, ConfigWarning, EXPECTATIONS_FILE, REPLAY_BINARY, RunConfig, TRACE_FOLDER};
pub use coordinator::{
    Coordinator, CoordinatorError, RunOutcome, partition, trace_folder_count, worker_count,
};
pub use expectations::{DiscoveredTests, SkipList, parse_test_list};
pub use queue::{JobQueue, ResultLog};
pub use report::{AggregateReport, ReportCounts};
pub use worker::{WorkerExit, run_worker};
