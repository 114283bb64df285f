//! Domain types shared by the queue, store, detector and fan-out layers.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod event;
pub mod wire;

pub use event::ChangeEvent;
pub use wire::{Incoming, WireMessage};

/// Export formats accepted on submission.
pub const SUPPORTED_FORMATS: [&str; 3] = ["pdf", "dwf", "dwg"];

/// Lifecycle state of an export job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Concluded,
    ConcludedWithErrors,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Concluded => "concluded",
            JobStatus::ConcludedWithErrors => "concluded_with_errors",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Pending or Processing.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "concluded" => Ok(JobStatus::Concluded),
            "concluded_with_errors" => Ok(JobStatus::ConcludedWithErrors),
            "error" => Ok(JobStatus::Error),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// A file produced by the export tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    pub format: String,
    pub path: String,
    pub size_bytes: u64,
}

impl Artifact {
    /// Describes an exported file on disk; size is 0 if it cannot be read.
    pub fn from_file(path: &Path, format: &str) -> Self {
        Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            format: format.to_string(),
            path: path.to_string_lossy().into_owned(),
            size_bytes: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        }
    }
}

/// A unit of work: one source drawing exported to one or more formats.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub source_file: String,
    pub computer_of_origin: String,
    pub destination_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub requested_formats: Vec<String>,
    #[serde(default)]
    pub produced_artifacts: Vec<Artifact>,
    #[serde(default)]
    pub queue_position: Option<i64>,
    #[serde(default)]
    pub progress_percent: u8,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Requested formats, falling back to `defaults` when none were requested.
    pub fn effective_formats(&self, defaults: &[String]) -> Vec<String> {
        let formats: Vec<String> = if self.requested_formats.is_empty() {
            defaults.to_vec()
        } else {
            self.requested_formats.clone()
        };
        normalize_formats(&formats)
    }

    pub fn has_artifact(&self, format: &str) -> bool {
        self.produced_artifacts
            .iter()
            .any(|a| a.format.eq_ignore_ascii_case(format))
    }

    /// Requested formats without a produced artifact yet.
    pub fn outstanding_formats(&self, defaults: &[String]) -> Vec<String> {
        self.effective_formats(defaults)
            .into_iter()
            .filter(|f| !self.has_artifact(f))
            .collect()
    }
}

/// Submission payload for a new job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub source_file: String,
    pub computer_of_origin: String,
    pub destination_path: String,
    #[serde(default)]
    pub original_path: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub requested_formats: Vec<String>,
}

/// Lowercases, trims and de-duplicates format names, keeping first occurrence order.
pub fn normalize_formats(formats: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(formats.len());
    for format in formats {
        let f = format.trim().to_lowercase();
        if !f.is_empty() && !out.contains(&f) {
            out.push(f);
        }
    }
    out
}
