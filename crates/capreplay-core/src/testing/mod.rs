//! Testing utilities for deterministic pipeline and coordinator tests.

pub mod scripted_runner;

pub use scripted_runner::{ScriptedRunner, write_capture};
