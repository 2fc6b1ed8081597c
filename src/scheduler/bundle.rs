use bytes::Bytes;
use uuid::Uuid;

use crate::scheduler::job::Unit;

/// Immutable snapshot of units handed to one executor.
#[derive(Debug, Clone)]
pub struct DispatchBundle {
    pub bundle_id: u64,
    pub job_id: Uuid,
    pub job_name: String,
    pub executor: Uuid,
    /// Units in dispatch order.
    pub units: Vec<Unit>,
    /// Size the bundler asked for; `units.len()` may be smaller.
    pub size_hint: usize,
    /// Shared data context of the job.
    pub data: Bytes,
    /// Submitter uuid, used by executors to route resource requests.
    pub submitter: Option<Uuid>,
    /// At least one unit was dispatched before and came back through a requeue.
    pub requeued: bool,
}

impl DispatchBundle {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn positions(&self) -> Vec<usize> {
        self.units.iter().map(|u| u.position).collect()
    }
}
