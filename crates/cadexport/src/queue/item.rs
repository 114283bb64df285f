use std::cmp::Ordering;

use serde::Serialize;

/// One (job, format) export waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub job_id: String,
    pub format: String,
    pub position: i64,
    /// 0 for ordinary formats, 1 for heavy ones; heavy exports of a job run last.
    pub rank: u8,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl WorkItem {
    pub fn new(job_id: &str, format: &str, position: i64, heavy: bool) -> Self {
        Self {
            job_id: job_id.to_string(),
            format: format.to_string(),
            position,
            rank: u8::from(heavy),
            attempt: 1,
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    pub fn is_same_export(&self, job_id: &str, format: &str) -> bool {
        self.job_id == job_id && self.format == format
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.job_id, self.format)
    }

    fn sort_key(&self) -> (i64, &str, u8, &str) {
        (self.position, &self.job_id, self.rank, &self.format)
    }
}

impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key()
            .cmp(&other.sort_key())
            .then(self.attempt.cmp(&other.attempt))
    }
}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Public view of a queued or running item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemView {
    pub job_id: String,
    pub format: String,
    pub position: i64,
    pub attempt: u32,
    pub label: String,
}

impl From<&WorkItem> for ItemView {
    fn from(item: &WorkItem) -> Self {
        Self {
            job_id: item.job_id.clone(),
            format: item.format.clone(),
            position: item.position,
            attempt: item.attempt,
            label: item.label(),
        }
    }
}

/// Sorted list of pending work, unique per (job, format).
#[derive(Debug, Default)]
pub(crate) struct WorkList {
    items: Vec<WorkItem>,
}

impl WorkList {
    /// Inserts in order; returns false when the export is already queued.
    pub fn insert(&mut self, item: WorkItem) -> bool {
        if self
            .items
            .iter()
            .any(|i| i.is_same_export(&item.job_id, &item.format))
        {
            return false;
        }
        let at = self.items.partition_point(|i| i < &item);
        self.items.insert(at, item);
        true
    }

    pub fn pop_front(&mut self) -> Option<WorkItem> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0))
        }
    }

    /// Removes every item of `job_id`, returning them.
    pub fn remove_job(&mut self, job_id: &str) -> Vec<WorkItem> {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.items)
                .into_iter()
                .partition(|i| i.job_id == job_id);
        self.items = kept;
        removed
    }

    pub fn contains_job(&self, job_id: &str) -> bool {
        self.items.iter().any(|i| i.job_id == job_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter()
    }
}
