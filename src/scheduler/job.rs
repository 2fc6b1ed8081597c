use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::scheduler::policy::ExecutionPolicy;

/// Names the task implementation an executor runs for a unit, plus its opaque arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub kind: String,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl TaskSpec {
    pub fn new(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
        }
    }
}

/// Per-unit timeout, either relative to submission on the executor or absolute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitTimeout {
    After { millis: u64 },
    At { deadline: DateTime<Utc> },
}

impl UnitTimeout {
    pub fn after(duration: Duration) -> Self {
        UnitTimeout::After {
            millis: duration.as_millis() as u64,
        }
    }

    /// Time left before the timeout fires; `None` when it can never fire or already passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            UnitTimeout::After { millis } if *millis > 0 => Some(Duration::from_millis(*millis)),
            UnitTimeout::After { .. } => None,
            UnitTimeout::At { deadline } => (*deadline - now)
                .to_std()
                .ok()
                .filter(|d| !d.is_zero()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Sequence number within the job.
    pub position: usize,
    /// Optional user-supplied id, used for cancellation by id on the executor.
    pub id: Option<String>,
    pub task: TaskSpec,
    pub timeout: Option<UnitTimeout>,
    /// Positions of units that must be terminal before this one is dispatched.
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

impl Unit {
    pub fn new(task: TaskSpec) -> Self {
        Self {
            position: 0,
            id: None,
            task,
            timeout: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: UnitTimeout) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn depends_on(mut self, positions: impl IntoIterator<Item = usize>) -> Self {
        self.depends_on.extend(positions);
        self
    }
}

/// Terminal outcome of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Completed { output: Vec<u8> },
    Failed { error: String },
    Cancelled,
    TimedOut,
    /// Never executed because the job was cancelled or expired first.
    Void,
}

impl UnitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Completed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            UnitOutcome::Completed { .. } => "completed",
            UnitOutcome::Failed { .. } => "failed",
            UnitOutcome::Cancelled => "cancelled",
            UnitOutcome::TimedOut => "timed_out",
            UnitOutcome::Void => "void",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub position: usize,
    pub id: Option<String>,
    pub outcome: UnitOutcome,
    /// Wall-clock time between the unit starting on a worker and its termination.
    pub elapsed_ms: u64,
}

impl UnitResult {
    pub fn new(position: usize, outcome: UnitOutcome) -> Self {
        Self {
            position,
            id: None,
            outcome,
            elapsed_ms: 0,
        }
    }

    pub fn void(unit: &Unit) -> Self {
        Self {
            position: unit.position,
            id: unit.id.clone(),
            outcome: UnitOutcome::Void,
            elapsed_ms: 0,
        }
    }
}

/// Scheduling policy attached to a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSla {
    /// Overrides the bundler recommendation when smaller.
    pub max_bundle_size: Option<usize>,
    /// The job is cancelled instead of dispatched once this passes.
    pub expires_at: Option<DateTime<Utc>>,
    /// The job is held back until this time.
    pub start_at: Option<DateTime<Utc>>,
    /// Maximum number of executors working on the job at once.
    pub max_executors: Option<usize>,
    #[serde(default)]
    pub policy: ExecutionPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    /// Higher values are dispatched first.
    pub priority: i32,
    pub sla: JobSla,
    /// Data context shared by every unit of the job.
    pub data: Vec<u8>,
    pub units: Vec<Unit>,
}

impl Job {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            priority: 0,
            sla: JobSla::default(),
            data: Vec::new(),
            units: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sla(mut self, sla: JobSla) -> Self {
        self.sla = sla;
        self
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Append a unit, assigning the next position.
    pub fn add_unit(&mut self, mut unit: Unit) -> usize {
        let position = self.units.len();
        unit.position = position;
        self.units.push(unit);
        position
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.add_unit(unit);
        self
    }

    /// Admission checks: non-empty, sane SLA, contiguous positions and an acyclic
    /// dependency graph.
    pub fn validate(&self) -> Result<()> {
        if self.units.is_empty() {
            return Err(GridError::EmptyJob(self.id));
        }
        let invalid = |reason: &str| GridError::InvalidSla {
            job_id: self.id,
            reason: reason.to_string(),
        };
        if self.sla.max_bundle_size == Some(0) {
            return Err(invalid("max_bundle_size must be at least 1"));
        }
        if self.sla.max_executors == Some(0) {
            return Err(invalid("max_executors must be at least 1"));
        }
        if let (Some(start), Some(expires)) = (self.sla.start_at, self.sla.expires_at) {
            if start >= expires {
                return Err(invalid("start_at must precede expires_at"));
            }
        }
        self.sla.policy.validate().map_err(|e| invalid(&e))?;

        for (index, unit) in self.units.iter().enumerate() {
            if unit.position != index {
                return Err(GridError::protocol(format!(
                    "unit at index {index} carries position {}",
                    unit.position
                )));
            }
            for &dependency in &unit.depends_on {
                if dependency >= self.units.len() {
                    return Err(GridError::UnknownDependency {
                        job_id: self.id,
                        position: index,
                        dependency,
                    });
                }
            }
        }
        self.check_cycles()
    }

    fn check_cycles(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Visiting,
            Done,
        }

        let mut marks = vec![Mark::New; self.units.len()];
        for root in 0..self.units.len() {
            if marks[root] != Mark::New {
                continue;
            }
            // Iterative DFS: (node, index of the next dependency to visit)
            let mut stack = vec![(root, 0usize)];
            marks[root] = Mark::Visiting;
            while let Some((node, next)) = stack.last_mut() {
                let deps = &self.units[*node].depends_on;
                if *next < deps.len() {
                    let dep = deps[*next];
                    *next += 1;
                    match marks[dep] {
                        Mark::Visiting => {
                            return Err(GridError::DependencyCycle {
                                job_id: self.id,
                                position: dep,
                            })
                        }
                        Mark::New => {
                            marks[dep] = Mark::Visiting;
                            stack.push((dep, 0));
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[*node] = Mark::Done;
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    pub fn header(&self) -> JobHeader {
        JobHeader {
            job_id: self.id,
            name: self.name.clone(),
            priority: self.priority,
            sla: self.sla.clone(),
            unit_count: self.units.len(),
        }
    }

    /// Rebuild a job from its wire pieces.
    pub fn from_parts(header: JobHeader, data: Vec<u8>, units: Vec<Unit>) -> Self {
        Self {
            id: header.job_id,
            name: header.name,
            priority: header.priority,
            sla: header.sla,
            data,
            units,
        }
    }

    pub fn dependency_positions(&self) -> HashSet<usize> {
        self.units
            .iter()
            .flat_map(|u| u.depends_on.iter().copied())
            .collect()
    }
}

/// Job metadata sent ahead of the data and unit frames of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHeader {
    pub job_id: Uuid,
    pub name: String,
    pub priority: i32,
    pub sla: JobSla,
    pub unit_count: usize,
}

/// Final account of a job, delivered to its results collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub name: String,
    pub cancelled: bool,
    pub expired: bool,
    /// One entry per unit, ordered by position.
    pub results: Vec<UnitResult>,
}

impl JobReport {
    pub fn completed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome.is_success())
            .count()
    }
}

/// Receives the report of a job when it leaves the queue.
pub type ResultsCollector = Box<dyn FnOnce(JobReport) + Send>;

/// Coarse lifecycle status of a queued job, as shown by snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its `start_at` time.
    Scheduled,
    Pending,
    Executing,
    /// Every unit has been sent; waiting for the last bundles to return.
    FullyDispatched,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Scheduled => write!(f, "scheduled"),
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Executing => write!(f, "executing"),
            JobStatus::FullyDispatched => write!(f, "fully_dispatched"),
        }
    }
}
