//! Bridge to the external CAD export tool.
//!
//! The queue talks to a [`ConversionTool`]; [`ScriptBridge`] is the real
//! implementation, which launches a scripting host per export and watches
//! the process until it exits or times out.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::BridgeError;

mod paths;
mod progress;
mod script;

pub use paths::{normalize_output_dir, normalize_output_dir_with, resolve_input, ResolvedInput};
pub use progress::{FormatClass, ProgressEstimator, ProgressModel, ToolPhase};
pub use script::ScriptBridge;

/// One export invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub job_id: String,
    pub input: PathBuf,
    /// Destination directory as declared on the job; normalized by the bridge.
    pub output_dir: String,
    /// Lowercase format name.
    pub format: String,
    /// Treated as a heavyweight export for progress estimation.
    pub heavy: bool,
}

/// Result of an invocation that exited cleanly.
///
/// `artifact` is `None` when the tool reported success but the expected
/// output file is missing; callers treat that as a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOutput {
    pub artifact: Option<PathBuf>,
}

/// Progress callback, invoked with non-decreasing percentages.
pub type ProgressFn = dyn Fn(u8) + Send + Sync;

#[async_trait]
pub trait ConversionTool: Send + Sync {
    /// Runs one export. At most one call is in flight at a time.
    async fn run(
        &self,
        request: &ConversionRequest,
        on_progress: &ProgressFn,
    ) -> Result<ConversionOutput, BridgeError>;
}
