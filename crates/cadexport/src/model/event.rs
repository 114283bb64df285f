use super::Job;

/// A change to the job set, as fanned out to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Insert(Job),
    Update(Job),
    Delete(String),
}

impl ChangeEvent {
    pub fn job_id(&self) -> &str {
        match self {
            ChangeEvent::Insert(job) | ChangeEvent::Update(job) => &job.id,
            ChangeEvent::Delete(id) => id,
        }
    }
}
