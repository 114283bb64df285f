use std::path::PathBuf;
use thiserror::Error;

use crate::model::JobStatus;

#[derive(Error, Debug)]
pub enum CadExportError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Detector error: {0}")]
    Detector(#[from] DetectorError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Corrupt column '{column}' for job '{id}': {reason}")]
    Corrupt {
        id: String,
        column: &'static str,
        reason: String,
    },

    #[error("Failed to encode column '{column}': {source}")]
    Encode {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of a single external tool invocation.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Input file not found: {path}")]
    InputNotFound { path: PathBuf },

    #[error("Export tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("Export tool timed out after {seconds}s: {diagnostics}")]
    ToolTimeout { seconds: u64, diagnostics: String },

    #[error("Export tool exited with code {code:?}: {output}")]
    ToolFailed { code: Option<i32>, output: String },

    #[error("Failed to spawn export tool: {0}")]
    Spawn(#[source] std::io::Error),
}

impl BridgeError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BridgeError::InputNotFound { .. })
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    RecordNotFound(String),

    #[error("{format}: failed after {attempts} attempts")]
    RetryExhausted { format: String, attempts: u32 },

    #[error("Cannot move job '{id}' from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job '{0}' has no outstanding formats to resubmit")]
    NothingToResubmit(String),

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Notification channel error: {0}")]
    Channel(String),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Session closed")]
    Closed,

    #[error("Send timed out")]
    Timeout,

    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to load snapshot: {0}")]
    Snapshot(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("Local cache error: {0}")]
    Cache(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, CadExportError>;
