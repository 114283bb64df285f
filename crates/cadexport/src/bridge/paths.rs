use std::path::{Path, PathBuf};

use crate::error::BridgeError;
use crate::model::Job;

/// Where the input file for a job was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedInput {
    /// `<working_dir>/<source_file>`.
    Colocated(PathBuf),
    /// `<working_dir>/<stem>.<ext>` for one of the alternate extensions.
    AlternateExtension(PathBuf),
    /// The job's declared original path.
    Original(PathBuf),
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Colocated(p)
            | ResolvedInput::AlternateExtension(p)
            | ResolvedInput::Original(p) => p,
        }
    }

    pub fn into_path(self) -> PathBuf {
        match self {
            ResolvedInput::Colocated(p)
            | ResolvedInput::AlternateExtension(p)
            | ResolvedInput::Original(p) => p,
        }
    }
}

/// Locates the file the tool should open for `job`.
///
/// Prefers a file in the job's working directory named after the declared
/// source file, then the same stem with each alternate extension, then the
/// declared original path.
pub fn resolve_input(job: &Job, alternate_extensions: &[String]) -> Result<ResolvedInput, BridgeError> {
    let source_name = Path::new(&job.source_file)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&job.source_file));

    if let Some(dir) = job.working_dir.as_deref().filter(|d| !d.is_empty()) {
        let dir = Path::new(dir);
        let colocated = dir.join(&source_name);
        if colocated.is_file() {
            return Ok(ResolvedInput::Colocated(colocated));
        }

        if let Some(stem) = source_name.file_stem() {
            for ext in alternate_extensions {
                let candidate = dir.join(format!(
                    "{}.{}",
                    stem.to_string_lossy(),
                    ext.trim_start_matches('.')
                ));
                if candidate.is_file() {
                    return Ok(ResolvedInput::AlternateExtension(candidate));
                }
            }
        }
    }

    if let Some(original) = job.original_path.as_deref().filter(|p| !p.is_empty()) {
        let original = PathBuf::from(original);
        if original.is_file() {
            return Ok(ResolvedInput::Original(original));
        }
        return Err(BridgeError::InputNotFound { path: original });
    }

    let attempted = match job.working_dir.as_deref() {
        Some(dir) => Path::new(dir).join(&source_name),
        None => source_name,
    };
    Err(BridgeError::InputNotFound { path: attempted })
}

/// Normalizes a destination directory using the platform separator.
pub fn normalize_output_dir(raw: &str) -> String {
    normalize_output_dir_with(raw, std::path::MAIN_SEPARATOR)
}

/// Normalizes a destination directory: both slash styles become `sep`,
/// repeated separators collapse, trailing separators are dropped, and a
/// leading double separator (network share) is preserved.
pub fn normalize_output_dir_with(raw: &str, sep: char) -> String {
    let trimmed = raw.trim();
    let is_separator = |c: char| c == '/' || c == '\\';

    let unc = {
        let mut chars = trimmed.chars();
        matches!((chars.next(), chars.next()), (Some(a), Some(b)) if is_separator(a) && is_separator(b))
    };

    let mut out = String::with_capacity(trimmed.len());
    let mut last_was_sep = false;
    for c in trimmed.chars() {
        if is_separator(c) {
            if !last_was_sep {
                out.push(sep);
            }
            last_was_sep = true;
        } else {
            out.push(c);
            last_was_sep = false;
        }
    }

    while out.len() > 1 && out.ends_with(sep) {
        out.pop();
    }

    if unc && out.len() > 1 {
        out.insert(0, sep);
    }

    out
}
