use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Job already queued: {0}")]
    DuplicateJob(Uuid),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {0} has no units")]
    EmptyJob(Uuid),

    #[error("Invalid SLA for job {job_id}: {reason}")]
    InvalidSla { job_id: Uuid, reason: String },

    #[error("Dependency cycle among units of job {job_id} at unit {position}")]
    DependencyCycle { job_id: Uuid, position: usize },

    #[error("Unit {position} of job {job_id} depends on unknown unit {dependency}")]
    UnknownDependency {
        job_id: Uuid,
        position: usize,
        dependency: usize,
    },

    #[error("Job queue is full ({0} jobs)")]
    QueueFull(usize),

    #[error("Job {0} has no dispatchable units")]
    NoDispatchableUnits(Uuid),

    #[error("Job {job_id} rejected: {reason}")]
    Rejected { job_id: Uuid, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Executor not found: {0}")]
    ExecutorNotFound(Uuid),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GridError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        GridError::Protocol(msg.into())
    }

    /// Admission failures are rejected synchronously and never reach the queue.
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            GridError::DuplicateJob(_)
                | GridError::QueueFull(_)
                | GridError::EmptyJob(_)
                | GridError::InvalidSla { .. }
                | GridError::DependencyCycle { .. }
                | GridError::UnknownDependency { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, GridError>;
