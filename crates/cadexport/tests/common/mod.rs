//! Shared test utilities for cadexport integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring a queue, store and broadcaster over a temp database
//! - `FakeTool`, a scripted stand-in for the export tool
//! - Builders and recording sessions/caches for assertions

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{FakeTool, Outcome, TestHarness};
