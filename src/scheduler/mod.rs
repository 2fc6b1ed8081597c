pub mod bundle;
pub mod job;
pub mod policy;
pub mod queue;

pub use bundle::DispatchBundle;
pub use job::{
    Job, JobHeader, JobReport, JobSla, JobStatus, ResultsCollector, TaskSpec, Unit, UnitOutcome,
    UnitResult, UnitTimeout,
};
pub use policy::{ExecutionPolicy, ExecutorInfo};
pub use queue::{ExpiredJob, JobQueue, JobSnapshot, Selection};
