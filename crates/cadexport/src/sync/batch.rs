use std::collections::HashMap;

use crate::model::Job;

#[derive(Debug, Clone)]
enum PendingOp {
    Upsert(Job),
    Delete,
}

/// Operations waiting for the next flush, last op per id wins.
///
/// Ids keep the position of their first appearance so a flush writes them
/// in arrival order.
#[derive(Debug, Default)]
pub struct PendingBatch {
    order: Vec<String>,
    ops: HashMap<String, PendingOp>,
}

impl PendingBatch {
    pub fn push_upsert(&mut self, job: Job) {
        let id = job.id.clone();
        self.push(id, PendingOp::Upsert(job));
    }

    pub fn push_delete(&mut self, id: String) {
        self.push(id, PendingOp::Delete);
    }

    fn push(&mut self, id: String, op: PendingOp) {
        if self.ops.insert(id.clone(), op).is_none() {
            self.order.push(id);
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Empties the batch into `(upserts, deletes)`.
    pub fn take(&mut self) -> (Vec<Job>, Vec<String>) {
        let mut ops = std::mem::take(&mut self.ops);
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for id in std::mem::take(&mut self.order) {
            match ops.remove(&id) {
                Some(PendingOp::Upsert(job)) => upserts.push(job),
                Some(PendingOp::Delete) => deletes.push(id),
                None => {}
            }
        }
        (upserts, deletes)
    }
}
