use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::node::resources::ResourceClient;

/// Route to the submitter's resource provider for one job.
#[derive(Clone)]
pub struct ResourceAccess {
    client: Arc<ResourceClient>,
    submitter: Uuid,
}

impl ResourceAccess {
    pub fn new(client: Arc<ResourceClient>, submitter: Uuid) -> Self {
        Self { client, submitter }
    }
}

/// Everything a running unit can see besides its payload.
#[derive(Clone)]
pub struct TaskContext {
    pub job_id: Uuid,
    pub position: usize,
    pub unit_id: Option<String>,
    /// Data context shared by all units of the job.
    pub data: Bytes,
    cancel: CancellationToken,
    resources: Option<ResourceAccess>,
}

impl TaskContext {
    pub fn new(job_id: Uuid, position: usize, unit_id: Option<String>, data: Bytes) -> Self {
        Self {
            job_id,
            position,
            unit_id,
            data,
            cancel: CancellationToken::new(),
            resources: None,
        }
    }

    pub(crate) fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn with_resources(mut self, resources: Option<ResourceAccess>) -> Self {
        self.resources = resources;
        self
    }

    /// Set once the unit is cancelled or timed out. Tasks that loop should check it.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Fetch a named resource from the submitter of this job, through the driver.
    pub async fn resource(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let access = self
            .resources
            .as_ref()
            .ok_or_else(|| GridError::protocol("no resource channel for this job"))?;
        access.client.fetch(access.submitter, name).await
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("job_id", &self.job_id)
            .field("position", &self.position)
            .field("unit_id", &self.unit_id)
            .finish()
    }
}

/// A unit implementation registered under a task kind.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    async fn run(&self, ctx: TaskContext, payload: Vec<u8>) -> std::result::Result<Vec<u8>, String>;

    /// Called once when the unit is cancelled.
    fn on_cancel(&self, _ctx: &TaskContext) {}

    /// Called once when the unit's timeout fires.
    fn on_timeout(&self, _ctx: &TaskContext) {}
}

/// Maps task kinds to implementations.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `echo`, `sleep` and `fail`.
    pub fn with_builtins() -> Self {
        Self::new()
            .with("echo", EchoTask)
            .with("sleep", SleepTask)
            .with("fail", FailTask)
    }

    pub fn register(&mut self, kind: impl Into<String>, task: impl Task) {
        self.tasks.insert(kind.into(), Arc::new(task));
    }

    pub fn with(mut self, kind: impl Into<String>, task: impl Task) -> Self {
        self.register(kind, task);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.tasks.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Returns its payload.
pub struct EchoTask;

#[async_trait]
impl Task for EchoTask {
    async fn run(&self, _ctx: TaskContext, payload: Vec<u8>) -> std::result::Result<Vec<u8>, String> {
        Ok(payload)
    }
}

/// Sleeps for the number of milliseconds given as a decimal payload, then returns it.
pub struct SleepTask;

#[async_trait]
impl Task for SleepTask {
    async fn run(&self, ctx: TaskContext, payload: Vec<u8>) -> std::result::Result<Vec<u8>, String> {
        let millis: u64 = std::str::from_utf8(&payload)
            .map_err(|e| e.to_string())?
            .trim()
            .parse()
            .map_err(|e| format!("invalid sleep duration: {e}"))?;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(payload),
            _ = ctx.cancelled() => Err("interrupted".to_string()),
        }
    }
}

/// Fails with its payload as the error message.
pub struct FailTask;

#[async_trait]
impl Task for FailTask {
    async fn run(&self, _ctx: TaskContext, payload: Vec<u8>) -> std::result::Result<Vec<u8>, String> {
        Err(String::from_utf8_lossy(&payload).into_owned())
    }
}
