use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::model::{ChangeEvent, Job, JobStatus};

/// The parts of a job whose change is worth announcing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub status: JobStatus,
    pub progress: u8,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for Fingerprint {
    fn from(job: &Job) -> Self {
        Self {
            status: job.status,
            progress: job.progress_percent,
            updated_at: job.updated_at,
        }
    }
}

/// Last announced fingerprint per job id.
///
/// The cache is updated before an event is returned, so a failed delivery
/// is never retried.
#[derive(Debug, Default)]
pub struct StateCache {
    entries: HashMap<String, Fingerprint>,
}

impl StateCache {
    /// Replaces the cache with `jobs` without producing events.
    pub fn prime(&mut self, jobs: &[Job]) {
        self.entries = jobs
            .iter()
            .map(|j| (j.id.clone(), Fingerprint::from(j)))
            .collect();
    }

    /// Records `job`; returns `Insert` for an unseen id, `Update` for a
    /// changed fingerprint and `None` otherwise.
    pub fn observe(&mut self, job: &Job) -> Option<ChangeEvent> {
        let fingerprint = Fingerprint::from(job);
        match self.entries.insert(job.id.clone(), fingerprint.clone()) {
            None => Some(ChangeEvent::Insert(job.clone())),
            Some(previous) if previous != fingerprint => Some(ChangeEvent::Update(job.clone())),
            Some(_) => None,
        }
    }

    /// Returns whether `id` was known.
    pub fn forget(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Compares a full listing against the cache. Ids missing from `jobs`
    /// produce `Delete` and leave the cache.
    pub fn diff(&mut self, jobs: &[Job]) -> Vec<ChangeEvent> {
        let mut events: Vec<ChangeEvent> = jobs.iter().filter_map(|j| self.observe(j)).collect();

        let present: HashSet<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        let mut gone: Vec<String> = self
            .entries
            .keys()
            .filter(|id| !present.contains(id.as_str()))
            .cloned()
            .collect();
        gone.sort();
        for id in gone {
            self.entries.remove(&id);
            events.push(ChangeEvent::Delete(id));
        }
        events
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
