use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{GridError, Result};
use crate::scheduler::bundle::DispatchBundle;
use crate::scheduler::job::{
    Job, JobReport, JobSla, JobStatus, ResultsCollector, Unit, UnitOutcome, UnitResult,
};
use crate::scheduler::policy::ExecutorInfo;

/// (priority desc, rank asc, id). The rank starts as the admission sequence and is
/// bumped when fair rotation moves a job behind its equal-priority peers.
type OrderKey = (Reverse<i32>, u64, Uuid);

/// A job and the executors allowed to receive its next bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub job_id: Uuid,
    /// Candidate executors accepted by the job's policy, in candidate order.
    pub executors: Vec<Uuid>,
    /// Pending units whose dependencies are all terminal.
    pub dispatchable: usize,
    pub max_bundle_size: Option<usize>,
}

/// A job removed because its `expires_at` passed, with the executors still holding its units.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredJob {
    pub job_id: Uuid,
    pub executors: Vec<Uuid>,
}

/// Point-in-time view of one queued job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub name: String,
    pub priority: i32,
    pub status: JobStatus,
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub executors: usize,
    pub admitted_at: DateTime<Utc>,
}

struct InFlightBundle {
    executor: Uuid,
    /// Positions not yet reported back.
    positions: Vec<usize>,
}

struct QueuedJob {
    id: Uuid,
    name: String,
    priority: i32,
    sla: JobSla,
    data: Bytes,
    submitter: Option<Uuid>,
    admitted_at: DateTime<Utc>,
    rank: u64,
    total: usize,
    pending: VecDeque<Unit>,
    in_flight: HashMap<usize, (u64, Unit)>,
    bundles: HashMap<u64, InFlightBundle>,
    results: Vec<Option<UnitResult>>,
    requeued: HashSet<usize>,
    collector: Option<ResultsCollector>,
}

impl QueuedJob {
    fn key(&self) -> OrderKey {
        (Reverse(self.priority), self.rank, self.id)
    }

    fn is_ready(&self, unit: &Unit) -> bool {
        unit.depends_on
            .iter()
            .all(|d| self.results.get(*d).is_some_and(Option::is_some))
    }

    fn dispatchable(&self) -> usize {
        self.pending.iter().filter(|u| self.is_ready(u)).count()
    }

    fn active_executors(&self) -> HashSet<Uuid> {
        self.bundles.values().map(|b| b.executor).collect()
    }

    fn completed(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    fn is_finished(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    fn status(&self, now: DateTime<Utc>) -> JobStatus {
        if self.sla.start_at.is_some_and(|t| t > now) {
            JobStatus::Scheduled
        } else if self.in_flight.is_empty() {
            JobStatus::Pending
        } else if self.pending.is_empty() {
            JobStatus::FullyDispatched
        } else {
            JobStatus::Executing
        }
    }
}

/// Priority queue of admitted jobs and the bookkeeping of their in-flight units.
///
/// Not synchronized; the driver keeps it behind a single lock.
pub struct JobQueue {
    jobs: HashMap<Uuid, QueuedJob>,
    order: BTreeSet<OrderKey>,
    next_seq: u64,
    next_bundle_id: u64,
    config: QueueConfig,
    expired: Vec<ExpiredJob>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            jobs: HashMap::new(),
            order: BTreeSet::new(),
            next_seq: 0,
            next_bundle_id: 1,
            config,
            expired: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, job_id: &Uuid) -> bool {
        self.jobs.contains_key(job_id)
    }

    /// Validate and enqueue a job. The collector is called exactly once, when the job
    /// completes, is cancelled or expires.
    pub fn admit(
        &mut self,
        job: Job,
        submitter: Option<Uuid>,
        collector: ResultsCollector,
    ) -> Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(GridError::DuplicateJob(job.id));
        }
        if self.jobs.len() >= self.config.max_jobs {
            return Err(GridError::QueueFull(self.config.max_jobs));
        }
        job.validate()?;

        let seq = self.next_seq;
        self.next_seq += 1;
        let total = job.units.len();
        let queued = QueuedJob {
            id: job.id,
            name: job.name,
            priority: job.priority,
            sla: job.sla,
            data: Bytes::from(job.data),
            submitter,
            admitted_at: Utc::now(),
            rank: seq,
            total,
            pending: job.units.into(),
            in_flight: HashMap::new(),
            bundles: HashMap::new(),
            results: vec![None; total],
            requeued: HashSet::new(),
            collector: Some(collector),
        };

        tracing::debug!(job_id = %queued.id, priority = queued.priority, units = total, "Job admitted");
        self.order.insert(queued.key());
        self.jobs.insert(queued.id, queued);
        Ok(())
    }

    /// First job in queue order that has a dispatchable unit and at least one candidate
    /// its policy accepts. Jobs whose deadline passed are expired on the way.
    pub fn next_eligible(&mut self, candidates: &[ExecutorInfo]) -> Option<Selection> {
        let now = Utc::now();
        self.expire_due(now);
        if candidates.is_empty() {
            return None;
        }

        for (_, _, job_id) in &self.order {
            let Some(job) = self.jobs.get(job_id) else {
                continue;
            };
            if job.sla.start_at.is_some_and(|t| t > now) {
                continue;
            }
            let dispatchable = job.dispatchable();
            if dispatchable == 0 {
                continue;
            }
            if let Some(max) = job.sla.max_executors {
                if job.active_executors().len() >= max {
                    continue;
                }
            }
            let executors: Vec<Uuid> = candidates
                .iter()
                .filter(|c| job.sla.policy.accepts(c))
                .map(|c| c.uuid)
                .collect();
            if executors.is_empty() {
                continue;
            }
            return Some(Selection {
                job_id: job.id,
                executors,
                dispatchable,
                max_bundle_size: job.sla.max_bundle_size,
            });
        }
        None
    }

    /// Move up to `count` dispatchable units of a job into a new in-flight bundle.
    pub fn take_units(
        &mut self,
        job_id: Uuid,
        count: usize,
        executor: Uuid,
    ) -> Result<DispatchBundle> {
        let count = count.max(1);
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(GridError::JobNotFound(job_id))?;

        let mut taken = Vec::with_capacity(count);
        let mut kept = VecDeque::with_capacity(job.pending.len());
        while let Some(unit) = job.pending.pop_front() {
            let ready = unit
                .depends_on
                .iter()
                .all(|d| job.results.get(*d).is_some_and(Option::is_some));
            if taken.len() < count && ready {
                taken.push(unit);
            } else {
                kept.push_back(unit);
            }
        }
        job.pending = kept;
        if taken.is_empty() {
            return Err(GridError::NoDispatchableUnits(job_id));
        }

        let bundle_id = self.next_bundle_id;
        self.next_bundle_id += 1;

        let requeued = taken.iter().any(|u| job.requeued.contains(&u.position));
        let positions: Vec<usize> = taken.iter().map(|u| u.position).collect();
        for unit in &taken {
            job.in_flight.insert(unit.position, (bundle_id, unit.clone()));
        }
        job.bundles.insert(
            bundle_id,
            InFlightBundle {
                executor,
                positions,
            },
        );

        if self.config.fair_rotation {
            self.order.remove(&job.key());
            job.rank = self.next_seq;
            self.next_seq += 1;
            self.order.insert(job.key());
        }

        tracing::debug!(
            job_id = %job_id,
            bundle_id,
            executor = %executor,
            units = taken.len(),
            requested = count,
            "Units taken for dispatch"
        );

        Ok(DispatchBundle {
            bundle_id,
            job_id,
            job_name: job.name.clone(),
            executor,
            units: taken,
            size_hint: count,
            data: job.data.clone(),
            submitter: job.submitter,
            requeued,
        })
    }

    /// Put the incomplete units of a bundle back at the front of pending, in their original
    /// order. Returns the number requeued; a second call for the same bundle returns 0.
    pub fn requeue(&mut self, bundle: &DispatchBundle) -> usize {
        let Some(job) = self.jobs.get_mut(&bundle.job_id) else {
            return 0;
        };
        let Some(record) = job.bundles.remove(&bundle.bundle_id) else {
            return 0;
        };

        let mut units = Vec::with_capacity(record.positions.len());
        for position in record.positions {
            let owned = matches!(job.in_flight.get(&position), Some((id, _)) if *id == bundle.bundle_id);
            if owned {
                if let Some((_, unit)) = job.in_flight.remove(&position) {
                    job.requeued.insert(position);
                    units.push(unit);
                }
            }
        }
        let count = units.len();
        for unit in units.into_iter().rev() {
            job.pending.push_front(unit);
        }
        if count > 0 {
            tracing::info!(job_id = %bundle.job_id, bundle_id = bundle.bundle_id, units = count, "Units requeued");
        }
        count
    }

    /// Record results of a bundle. Results for units no longer held by that bundle are
    /// ignored. Returns the number of results accepted.
    pub fn complete(&mut self, job_id: Uuid, bundle_id: u64, results: Vec<UnitResult>) -> usize {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            tracing::debug!(job_id = %job_id, bundle_id, "Results for a job no longer queued");
            return 0;
        };

        let mut accepted = 0;
        for result in results {
            let owned =
                matches!(job.in_flight.get(&result.position), Some((id, _)) if *id == bundle_id);
            if !owned {
                tracing::debug!(job_id = %job_id, bundle_id, position = result.position, "Stale result ignored");
                continue;
            }
            job.in_flight.remove(&result.position);
            if let Some(record) = job.bundles.get_mut(&bundle_id) {
                record.positions.retain(|p| *p != result.position);
            }
            if let Some(slot) = job.results.get_mut(result.position) {
                *slot = Some(result);
                accepted += 1;
            }
        }

        if job
            .bundles
            .get(&bundle_id)
            .is_some_and(|r| r.positions.is_empty())
        {
            job.bundles.remove(&bundle_id);
        }

        if job.is_finished() {
            self.finalize(job_id, false, false);
        }
        accepted
    }

    /// Fail every unit the bundle still holds with the given error.
    pub fn fail_bundle(&mut self, bundle: &DispatchBundle, error: &str) -> usize {
        let Some(job) = self.jobs.get(&bundle.job_id) else {
            return 0;
        };
        let Some(record) = job.bundles.get(&bundle.bundle_id) else {
            return 0;
        };
        let results = record
            .positions
            .iter()
            .map(|&position| UnitResult {
                position,
                id: job
                    .in_flight
                    .get(&position)
                    .and_then(|(_, unit)| unit.id.clone()),
                outcome: UnitOutcome::Failed {
                    error: error.to_string(),
                },
                elapsed_ms: 0,
            })
            .collect();
        self.complete(bundle.job_id, bundle.bundle_id, results)
    }

    /// Void the remaining units and finalize the job with `cancelled = true`. Returns the
    /// executors still holding its units so the caller can abort them.
    pub fn cancel(&mut self, job_id: Uuid) -> Result<Vec<Uuid>> {
        self.finalize(job_id, true, false)
            .ok_or(GridError::JobNotFound(job_id))
    }

    /// Jobs expired since the last call.
    pub fn take_expired(&mut self) -> Vec<ExpiredJob> {
        std::mem::take(&mut self.expired)
    }

    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        let now = Utc::now();
        self.order
            .iter()
            .filter_map(|(_, _, id)| self.jobs.get(id))
            .map(|job| JobSnapshot {
                id: job.id,
                name: job.name.clone(),
                priority: job.priority,
                status: job.status(now),
                total: job.total,
                pending: job.pending.len(),
                in_flight: job.in_flight.len(),
                completed: job.completed(),
                executors: job.active_executors().len(),
                admitted_at: job.admitted_at,
            })
            .collect()
    }

    /// Positions still waiting for dispatch, in dispatch order.
    pub fn pending_positions(&self, job_id: &Uuid) -> Option<Vec<usize>> {
        self.jobs
            .get(job_id)
            .map(|job| job.pending.iter().map(|u| u.position).collect())
    }

    pub fn in_flight_count(&self, job_id: &Uuid) -> Option<usize> {
        self.jobs.get(job_id).map(|job| job.in_flight.len())
    }

    fn expire_due(&mut self, now: DateTime<Utc>) {
        let due: Vec<Uuid> = self
            .jobs
            .values()
            .filter(|job| job.sla.expires_at.is_some_and(|t| t <= now))
            .map(|job| job.id)
            .collect();
        for job_id in due {
            if let Some(executors) = self.finalize(job_id, true, true) {
                tracing::info!(job_id = %job_id, "Job expired");
                self.expired.push(ExpiredJob { job_id, executors });
            }
        }
    }

    fn finalize(&mut self, job_id: Uuid, cancelled: bool, expired: bool) -> Option<Vec<Uuid>> {
        let mut job = self.jobs.remove(&job_id)?;
        self.order.remove(&job.key());

        let executors: Vec<Uuid> = job.active_executors().into_iter().collect();
        let unfinished = job
            .pending
            .iter()
            .chain(job.in_flight.values().map(|(_, unit)| unit));
        for unit in unfinished {
            if let Some(slot) = job.results.get_mut(unit.position) {
                if slot.is_none() {
                    *slot = Some(UnitResult::void(unit));
                }
            }
        }
        let results: Vec<UnitResult> = job
            .results
            .into_iter()
            .enumerate()
            .map(|(position, r)| r.unwrap_or_else(|| UnitResult::new(position, UnitOutcome::Void)))
            .collect();

        let report = JobReport {
            job_id,
            name: job.name,
            cancelled,
            expired,
            results,
        };
        tracing::info!(
            job_id = %job_id,
            cancelled,
            expired,
            completed = report.completed_count(),
            "Job finished"
        );
        if let Some(collector) = job.collector.take() {
            collector(report);
        }
        Some(executors)
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("jobs", &self.jobs.len())
            .field("next_bundle_id", &self.next_bundle_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::TaskSpec;
    use std::sync::{Arc, Mutex};

    fn job(name: &str, priority: i32, units: usize) -> Job {
        let mut job = Job::new(name).with_priority(priority);
        for _ in 0..units {
            job.add_unit(Unit::new(TaskSpec::new("noop", Vec::new())));
        }
        job
    }

    fn noop() -> ResultsCollector {
        Box::new(|_| {})
    }

    #[test]
    fn duplicate_admission_rejected() {
        let mut queue = JobQueue::default();
        let j = job("a", 0, 1);
        queue.admit(j.clone(), None, noop()).unwrap();
        assert!(matches!(
            queue.admit(j, None, noop()),
            Err(GridError::DuplicateJob(_))
        ));
    }

    #[test]
    fn capacity_enforced() {
        let mut queue = JobQueue::new(QueueConfig {
            max_jobs: 1,
            fair_rotation: true,
        });
        queue.admit(job("a", 0, 1), None, noop()).unwrap();
        assert!(matches!(
            queue.admit(job("b", 0, 1), None, noop()),
            Err(GridError::QueueFull(1))
        ));
    }

    #[test]
    fn take_units_respects_count_and_keeps_job_queued() {
        let mut queue = JobQueue::default();
        let j = job("a", 0, 3);
        let id = j.id;
        queue.admit(j, None, noop()).unwrap();
        let exec = Uuid::new_v4();

        let bundle = queue.take_units(id, 5, exec).unwrap();
        assert_eq!(bundle.positions(), vec![0, 1, 2]);
        assert_eq!(bundle.size_hint, 5);
        // Pending empty but still queued until results return
        assert!(queue.contains(&id));
        assert!(queue.next_eligible(&[ExecutorInfo::new(exec, 1)]).is_none());
    }

    #[test]
    fn collector_called_once_on_completion() {
        let mut queue = JobQueue::default();
        let j = job("a", 0, 2);
        let id = j.id;
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        queue
            .admit(j, None, Box::new(move |r| sink.lock().unwrap().push(r)))
            .unwrap();

        let bundle = queue.take_units(id, 2, Uuid::new_v4()).unwrap();
        let results = bundle
            .units
            .iter()
            .map(|u| {
                UnitResult::new(
                    u.position,
                    UnitOutcome::Completed {
                        output: vec![u.position as u8],
                    },
                )
            })
            .collect();
        assert_eq!(queue.complete(id, bundle.bundle_id, results), 2);
        assert!(queue.is_empty());

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].cancelled);
        assert_eq!(reports[0].completed_count(), 2);
    }

    #[test]
    fn fail_bundle_marks_remaining_units() {
        let mut queue = JobQueue::default();
        let j = job("a", 0, 2);
        let id = j.id;
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        queue
            .admit(j, None, Box::new(move |r| sink.lock().unwrap().push(r)))
            .unwrap();

        let bundle = queue.take_units(id, 2, Uuid::new_v4()).unwrap();
        assert_eq!(queue.fail_bundle(&bundle, "node crashed"), 2);
        let reports = reports.lock().unwrap();
        assert!(reports[0]
            .results
            .iter()
            .all(|r| matches!(&r.outcome, UnitOutcome::Failed { error } if error == "node crashed")));
    }

    #[test]
    fn status_in_snapshot() {
        let mut queue = JobQueue::default();
        let j = job("a", 0, 2);
        let id = j.id;
        queue.admit(j, None, noop()).unwrap();
        assert_eq!(queue.snapshot()[0].status, JobStatus::Pending);
        queue.take_units(id, 1, Uuid::new_v4()).unwrap();
        assert_eq!(queue.snapshot()[0].status, JobStatus::Executing);
        queue.take_units(id, 1, Uuid::new_v4()).unwrap();
        let snap = &queue.snapshot()[0];
        assert_eq!(snap.status, JobStatus::FullyDispatched);
        assert_eq!(snap.in_flight, 2);
        assert_eq!(snap.executors, 2);
    }
}
