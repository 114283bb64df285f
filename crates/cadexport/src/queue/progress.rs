use std::collections::HashMap;

const IN_FLIGHT_CEILING: u8 = 99;

#[derive(Debug, Default)]
struct JobProgress {
    formats: Vec<String>,
    values: HashMap<String, u8>,
}

impl JobProgress {
    /// Mean of per-format progress; 100 when no formats are tracked.
    fn aggregate(&self) -> u8 {
        if self.formats.is_empty() {
            return 100;
        }
        let sum: u32 = self
            .formats
            .iter()
            .map(|f| u32::from(self.values.get(f).copied().unwrap_or(0)))
            .sum();
        (sum / self.formats.len() as u32).min(100) as u8
    }
}

/// Per-(job, format) progress for jobs with work in flight.
///
/// Values only move up; a job's aggregate is the mean over its requested
/// formats.
#[derive(Debug, Default)]
pub(crate) struct ProgressBook {
    jobs: HashMap<String, JobProgress>,
}

impl ProgressBook {
    /// Starts (or resumes) tracking `job_id`. Formats for which `is_done`
    /// holds are pinned at 100. Returns the aggregate.
    pub fn begin(&mut self, job_id: &str, formats: &[String], is_done: impl Fn(&str) -> bool) -> u8 {
        let entry = self.jobs.entry(job_id.to_string()).or_default();
        entry.formats = formats.to_vec();
        for format in formats {
            let value = entry.values.entry(format.clone()).or_insert(0);
            if is_done(format) {
                *value = 100;
            }
        }
        entry.aggregate()
    }

    /// Records a new estimate, capped at 99 since only `complete` may mark a
    /// format done. Returns the aggregate when the format's value rose.
    pub fn record(&mut self, job_id: &str, format: &str, pct: u8) -> Option<u8> {
        self.raise(job_id, format, pct.min(IN_FLIGHT_CEILING))
    }

    pub fn complete(&mut self, job_id: &str, format: &str) -> Option<u8> {
        self.raise(job_id, format, 100)
            .or_else(|| self.aggregate(job_id))
    }

    fn raise(&mut self, job_id: &str, format: &str, pct: u8) -> Option<u8> {
        let entry = self.jobs.get_mut(job_id)?;
        let value = entry.values.entry(format.to_string()).or_insert(0);
        if pct <= *value {
            return None;
        }
        *value = pct;
        Some(entry.aggregate())
    }

    pub fn aggregate(&self, job_id: &str) -> Option<u8> {
        self.jobs.get(job_id).map(JobProgress::aggregate)
    }

    pub fn forget(&mut self, job_id: &str) {
        self.jobs.remove(job_id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }
}
