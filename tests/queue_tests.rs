use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use grid_lite::config::QueueConfig;
use grid_lite::error::GridError;
use grid_lite::scheduler::{
    ExecutionPolicy, ExecutorInfo, Job, JobQueue, JobReport, JobSla, JobStatus, ResultsCollector,
    TaskSpec, Unit, UnitOutcome, UnitResult,
};

fn job(name: &str, priority: i32, units: usize) -> Job {
    let mut job = Job::new(name).with_priority(priority);
    for _ in 0..units {
        job.add_unit(Unit::new(TaskSpec::new("echo", b"x".to_vec())));
    }
    job
}

fn noop() -> ResultsCollector {
    Box::new(|_| {})
}

fn collecting() -> (ResultsCollector, Arc<Mutex<Vec<JobReport>>>) {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    (
        Box::new(move |r| sink.lock().unwrap().push(r)),
        reports,
    )
}

fn completed(positions: &[usize]) -> Vec<UnitResult> {
    positions
        .iter()
        .map(|&p| UnitResult::new(p, UnitOutcome::Completed { output: vec![] }))
        .collect()
}

fn executor() -> ExecutorInfo {
    ExecutorInfo::new(Uuid::new_v4(), 4)
}

fn strict_fifo() -> JobQueue {
    JobQueue::new(QueueConfig {
        max_jobs: 100,
        fair_rotation: false,
    })
}

#[test]
fn test_higher_priority_selected_first() {
    let mut queue = JobQueue::default();
    let a = job("a", 5, 10);
    let b = job("b", 10, 3);
    let (a_id, b_id) = (a.id, b.id);
    queue.admit(a, None, noop()).unwrap();
    queue.admit(b, None, noop()).unwrap();

    let exec = executor();
    let selection = queue.next_eligible(&[exec.clone()]).unwrap();
    assert_eq!(selection.job_id, b_id);
    assert_eq!(selection.dispatchable, 3);

    // Dispatching all of B leaves A untouched
    let bundle = queue.take_units(b_id, 3, exec.uuid).unwrap();
    assert_eq!(bundle.len(), 3);
    assert_eq!(queue.pending_positions(&a_id).unwrap().len(), 10);
    assert_eq!(queue.in_flight_count(&a_id), Some(0));

    let next = queue.next_eligible(&[exec]).unwrap();
    assert_eq!(next.job_id, a_id);
    assert_eq!(next.dispatchable, 10);
}

#[test]
fn test_equal_priority_in_admission_order() {
    let mut queue = strict_fifo();
    let first = job("first", 1, 4);
    let second = job("second", 1, 4);
    let first_id = first.id;
    queue.admit(first, None, noop()).unwrap();
    queue.admit(second, None, noop()).unwrap();

    let exec = executor();
    for _ in 0..3 {
        let selection = queue.next_eligible(&[exec.clone()]).unwrap();
        assert_eq!(selection.job_id, first_id);
        queue.take_units(selection.job_id, 1, exec.uuid).unwrap();
    }
}

#[test]
fn test_fair_rotation_alternates_equal_priorities() {
    let mut queue = JobQueue::default();
    let first = job("first", 1, 4);
    let second = job("second", 1, 4);
    let (first_id, second_id) = (first.id, second.id);
    queue.admit(first, None, noop()).unwrap();
    queue.admit(second, None, noop()).unwrap();

    let exec = executor();
    let mut order = Vec::new();
    for _ in 0..4 {
        let selection = queue.next_eligible(&[exec.clone()]).unwrap();
        order.push(selection.job_id);
        queue.take_units(selection.job_id, 1, exec.uuid).unwrap();
    }
    assert_eq!(order, vec![first_id, second_id, first_id, second_id]);
}

#[test]
fn test_unit_dispatched_at_most_once() {
    let mut queue = JobQueue::default();
    let j = job("a", 0, 5);
    let id = j.id;
    queue.admit(j, None, noop()).unwrap();

    let first = queue.take_units(id, 3, Uuid::new_v4()).unwrap();
    let second = queue.take_units(id, 3, Uuid::new_v4()).unwrap();
    assert_eq!(first.positions(), vec![0, 1, 2]);
    assert_eq!(second.positions(), vec![3, 4]);
    assert_ne!(first.bundle_id, second.bundle_id);
    assert!(matches!(
        queue.take_units(id, 1, Uuid::new_v4()),
        Err(GridError::NoDispatchableUnits(_))
    ));
}

#[test]
fn test_partial_results_then_disconnect_requeues_rest() {
    let mut queue = JobQueue::default();
    let j = job("a", 0, 6);
    let id = j.id;
    queue.admit(j, None, noop()).unwrap();

    let bundle = queue.take_units(id, 4, Uuid::new_v4()).unwrap();
    assert_eq!(queue.complete(id, bundle.bundle_id, completed(&[0, 1])), 2);

    assert_eq!(queue.requeue(&bundle), 2);
    // Requeued units go back to the front, in their original order
    assert_eq!(queue.pending_positions(&id).unwrap(), vec![2, 3, 4, 5]);
    assert_eq!(queue.in_flight_count(&id), Some(0));

    // Idempotent
    assert_eq!(queue.requeue(&bundle), 0);
    assert_eq!(queue.pending_positions(&id).unwrap().len(), 4);

    let again = queue.take_units(id, 2, Uuid::new_v4()).unwrap();
    assert_eq!(again.positions(), vec![2, 3]);
    assert!(again.requeued);
}

#[test]
fn test_stale_bundle_results_ignored() {
    let mut queue = JobQueue::default();
    let j = job("a", 0, 2);
    let id = j.id;
    queue.admit(j, None, noop()).unwrap();

    let old = queue.take_units(id, 2, Uuid::new_v4()).unwrap();
    queue.requeue(&old);
    let fresh = queue.take_units(id, 2, Uuid::new_v4()).unwrap();

    // The old executor reports late
    assert_eq!(queue.complete(id, old.bundle_id, completed(&[0, 1])), 0);
    assert_eq!(queue.in_flight_count(&id), Some(2));
    assert_eq!(queue.complete(id, fresh.bundle_id, completed(&[0, 1])), 2);
    assert!(!queue.contains(&id));
}

#[test]
fn test_report_ordered_by_position() {
    let mut queue = JobQueue::default();
    let j = job("a", 0, 4);
    let id = j.id;
    let (collector, reports) = collecting();
    queue.admit(j, None, collector).unwrap();

    let first = queue.take_units(id, 2, Uuid::new_v4()).unwrap();
    let second = queue.take_units(id, 2, Uuid::new_v4()).unwrap();
    queue.complete(id, second.bundle_id, completed(&[3, 2]));
    queue.complete(id, first.bundle_id, completed(&[1, 0]));

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    let positions: Vec<usize> = reports[0].results.iter().map(|r| r.position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);
    assert!(!reports[0].cancelled);
    assert_eq!(reports[0].completed_count(), 4);
}

#[test]
fn test_cancel_voids_remaining_units() {
    let mut queue = JobQueue::default();
    let j = job("a", 0, 4);
    let id = j.id;
    let (collector, reports) = collecting();
    queue.admit(j, None, collector).unwrap();

    let exec = Uuid::new_v4();
    let bundle = queue.take_units(id, 2, exec).unwrap();
    queue.complete(id, bundle.bundle_id, completed(&[0]));

    let holders = queue.cancel(id).unwrap();
    assert_eq!(holders, vec![exec]);
    assert!(matches!(queue.cancel(id), Err(GridError::JobNotFound(_))));

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(report.cancelled);
    assert!(!report.expired);
    assert!(report.results[0].outcome.is_success());
    for result in &report.results[1..] {
        assert_eq!(result.outcome, UnitOutcome::Void);
    }
}

#[test]
fn test_expired_job_cancelled_lazily() {
    let mut queue = JobQueue::default();
    let mut j = job("a", 0, 3);
    j.sla.expires_at = Some(Utc::now() - ChronoDuration::milliseconds(1));
    let id = j.id;
    let (collector, reports) = collecting();
    queue.admit(j, None, collector).unwrap();
    assert!(queue.contains(&id));

    assert!(queue.next_eligible(&[executor()]).is_none());
    assert!(!queue.contains(&id));

    let expired = queue.take_expired();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].job_id, id);
    assert!(queue.take_expired().is_empty());

    let reports = reports.lock().unwrap();
    assert!(reports[0].cancelled);
    assert!(reports[0].expired);
}

#[test]
fn test_start_at_holds_job_back() {
    let mut queue = JobQueue::default();
    let j = job("later", 10, 2).with_sla(JobSla {
        start_at: Some(Utc::now() + ChronoDuration::hours(1)),
        ..JobSla::default()
    });
    let now_job = job("now", 0, 2);
    let now_id = now_job.id;
    queue.admit(j, None, noop()).unwrap();
    queue.admit(now_job, None, noop()).unwrap();

    let selection = queue.next_eligible(&[executor()]).unwrap();
    assert_eq!(selection.job_id, now_id);

    let statuses: Vec<JobStatus> = queue.snapshot().iter().map(|s| s.status).collect();
    assert!(statuses.contains(&JobStatus::Scheduled));
}

#[test]
fn test_policy_filters_executors() {
    let mut queue = JobQueue::default();
    let j = job("big", 0, 4).with_sla(JobSla {
        policy: ExecutionPolicy::MinThreads(8),
        ..JobSla::default()
    });
    let id = j.id;
    queue.admit(j, None, noop()).unwrap();

    let small = ExecutorInfo::new(Uuid::new_v4(), 2);
    let large = ExecutorInfo::new(Uuid::new_v4(), 16);
    assert!(queue.next_eligible(&[small.clone()]).is_none());

    let selection = queue.next_eligible(&[small, large.clone()]).unwrap();
    assert_eq!(selection.job_id, id);
    assert_eq!(selection.executors, vec![large.uuid]);
}

#[test]
fn test_max_executors_limits_concurrency() {
    let mut queue = JobQueue::default();
    let j = job("a", 0, 6).with_sla(JobSla {
        max_executors: Some(1),
        max_bundle_size: Some(2),
        ..JobSla::default()
    });
    let id = j.id;
    queue.admit(j, None, noop()).unwrap();

    let (e1, e2) = (executor(), executor());
    let selection = queue.next_eligible(&[e1.clone(), e2.clone()]).unwrap();
    assert_eq!(selection.max_bundle_size, Some(2));
    let bundle = queue.take_units(id, 2, e1.uuid).unwrap();

    assert!(queue.next_eligible(&[e2.clone()]).is_none());
    queue.complete(id, bundle.bundle_id, completed(&[0, 1]));
    assert!(queue.next_eligible(&[e2]).is_some());
}

#[test]
fn test_dependencies_gate_dispatch() {
    let mut queue = JobQueue::default();
    let mut j = Job::new("deps");
    j.add_unit(Unit::new(TaskSpec::new("echo", vec![])));
    j.add_unit(Unit::new(TaskSpec::new("echo", vec![])).depends_on([0]));
    j.add_unit(Unit::new(TaskSpec::new("echo", vec![])));
    let id = j.id;
    queue.admit(j, None, noop()).unwrap();

    let exec = executor();
    assert_eq!(queue.next_eligible(&[exec.clone()]).unwrap().dispatchable, 2);
    let bundle = queue.take_units(id, 10, exec.uuid).unwrap();
    assert_eq!(bundle.positions(), vec![0, 2]);
    assert!(queue.next_eligible(&[exec.clone()]).is_none());

    // A failed dependency still unblocks its dependents
    queue.complete(
        id,
        bundle.bundle_id,
        vec![
            UnitResult::new(0, UnitOutcome::Failed { error: "boom".into() }),
            UnitResult::new(2, UnitOutcome::Completed { output: vec![] }),
        ],
    );
    let next = queue.take_units(id, 10, exec.uuid).unwrap();
    assert_eq!(next.positions(), vec![1]);
}

#[test]
fn test_admission_rejects_invalid_jobs() {
    let mut queue = JobQueue::default();

    let empty = Job::new("empty");
    assert!(matches!(
        queue.admit(empty, None, noop()),
        Err(GridError::EmptyJob(_))
    ));

    let mut cyclic = Job::new("cyclic");
    cyclic.add_unit(Unit::new(TaskSpec::new("echo", vec![])).depends_on([1]));
    cyclic.add_unit(Unit::new(TaskSpec::new("echo", vec![])).depends_on([0]));
    let err = queue.admit(cyclic, None, noop()).unwrap_err();
    assert!(matches!(err, GridError::DependencyCycle { .. }));
    assert!(err.is_admission());

    let mut dangling = Job::new("dangling");
    dangling.add_unit(Unit::new(TaskSpec::new("echo", vec![])).depends_on([5]));
    assert!(matches!(
        queue.admit(dangling, None, noop()),
        Err(GridError::UnknownDependency { dependency: 5, .. })
    ));

    let bad_sla = job("bad", 0, 1).with_sla(JobSla {
        max_bundle_size: Some(0),
        ..JobSla::default()
    });
    assert!(matches!(
        queue.admit(bad_sla, None, noop()),
        Err(GridError::InvalidSla { .. })
    ));

    assert!(queue.is_empty());
}

#[test]
fn test_fail_bundle_fails_only_held_units() {
    let mut queue = JobQueue::default();
    let j = job("a", 0, 3);
    let id = j.id;
    let (collector, reports) = collecting();
    queue.admit(j, None, collector).unwrap();

    let bundle = queue.take_units(id, 3, Uuid::new_v4()).unwrap();
    queue.complete(id, bundle.bundle_id, completed(&[0]));
    assert_eq!(queue.fail_bundle(&bundle, "executor crashed"), 2);

    let reports = reports.lock().unwrap();
    let report = &reports[0];
    assert!(report.results[0].outcome.is_success());
    assert_eq!(
        report.results[1].outcome,
        UnitOutcome::Failed {
            error: "executor crashed".into()
        }
    );
}
