use crate::model::{Artifact, JobStatus};

/// Final status and error list for a job after one of its exports finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Settlement {
    pub status: JobStatus,
    pub errors: Vec<String>,
}

/// Whether `entry` is the recorded error for `format`.
pub(crate) fn is_error_for(entry: &str, format: &str) -> bool {
    entry
        .split_once(':')
        .map(|(f, _)| f.trim().eq_ignore_ascii_case(format))
        .unwrap_or(false)
}

/// Decides a job's status from what it produced and what failed.
///
/// - more exports of the job still queued: `Processing`
/// - every requested format produced: `Concluded`, errors cleared
/// - errors with some output: `ConcludedWithErrors`
/// - errors with no output: `Error`
/// - otherwise `Processing`
pub(crate) fn settle(
    formats: &[String],
    artifacts: &[Artifact],
    errors: Vec<String>,
    items_remaining: bool,
) -> Settlement {
    if items_remaining {
        return Settlement {
            status: JobStatus::Processing,
            errors,
        };
    }

    let produced = formats
        .iter()
        .filter(|f| artifacts.iter().any(|a| a.format.eq_ignore_ascii_case(f)))
        .count();

    if produced == formats.len() {
        return Settlement {
            status: JobStatus::Concluded,
            errors: Vec::new(),
        };
    }

    let status = match (errors.is_empty(), produced > 0) {
        (false, true) => JobStatus::ConcludedWithErrors,
        (false, false) => JobStatus::Error,
        (true, _) => JobStatus::Processing,
    };
    Settlement { status, errors }
}
