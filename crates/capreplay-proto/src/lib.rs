//! # capreplay-proto
//!
//! Shared types, error definitions, and result records for the capreplay
//! orchestrator.
//!
//! This crate provides the foundational abstractions used across all capreplay
//! crates, including:
//! - `TestCase`, the unit of work that flows through a batch
//! - `ResultCode` and `GroupedResult` for per-stage outcomes
//! - `BatchResult`, the per-batch slice of the final report
//! - `WorkerMessage` for progress reporting from workers to the coordinator
//! - Common error types

mod batch_result;
mod error;
mod message;
mod result;
mod test_case;

pub use batch_result::BatchResult;
pub use error::{Error, Result};
pub use message::WorkerMessage;
pub use result::{GroupedResult, ResultCode};
pub use test_case::{TRACE_FILE_SUFFIX, TestCase};
