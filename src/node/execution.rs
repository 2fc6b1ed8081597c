use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::node::task::{ResourceAccess, Task, TaskContext, TaskRegistry};
use crate::scheduler::job::{Unit, UnitOutcome, UnitResult, UnitTimeout};

/// Units of one job to run on this executor.
pub struct ExecutionBundle {
    pub job_id: Uuid,
    pub data: Bytes,
    pub units: Vec<Unit>,
    pub resources: Option<ResourceAccess>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
enum SlotState {
    Submitted,
    /// Elapsed times are wall-clock from this instant; no CPU time is accounted.
    Running {
        wall_start: Instant,
    },
    Terminated {
        reason: Termination,
        wall_start: Option<Instant>,
        at: Instant,
    },
}

struct Slot {
    job_id: Uuid,
    unit_id: Option<String>,
    state: SlotState,
    token: CancellationToken,
    task: Option<Arc<dyn Task>>,
    ctx: TaskContext,
}

#[derive(Default)]
struct SlotTable {
    slots: HashMap<u64, Slot>,
    by_job: HashMap<Uuid, HashSet<u64>>,
    by_unit: HashMap<String, HashSet<u64>>,
}

impl SlotTable {
    fn insert(&mut self, number: u64, slot: Slot) {
        self.by_job.entry(slot.job_id).or_default().insert(number);
        if let Some(id) = &slot.unit_id {
            self.by_unit.entry(id.clone()).or_default().insert(number);
        }
        self.slots.insert(number, slot);
    }

    fn remove(&mut self, number: u64) -> Option<Slot> {
        let slot = self.slots.remove(&number)?;
        if let Some(set) = self.by_job.get_mut(&slot.job_id) {
            set.remove(&number);
            if set.is_empty() {
                self.by_job.remove(&slot.job_id);
            }
        }
        if let Some(id) = &slot.unit_id {
            if let Some(set) = self.by_unit.get_mut(id) {
                set.remove(&number);
                if set.is_empty() {
                    self.by_unit.remove(id);
                }
            }
        }
        Some(slot)
    }
}

/// What a runner observed when it stopped.
enum RunOutcome {
    Finished(UnitOutcome),
    /// The slot was terminated from outside; its terminal state is recorded on the slot.
    Terminated,
}

struct Inner {
    registry: Arc<TaskRegistry>,
    permits: Arc<Semaphore>,
    pool_size: Mutex<usize>,
    slots: Mutex<SlotTable>,
    next_slot: AtomicU64,
    current_job: Mutex<Option<Uuid>>,
}

impl Inner {
    fn mark_running(&self, number: u64) -> bool {
        let mut table = self.slots.lock();
        match table.slots.get_mut(&number) {
            Some(slot) if matches!(slot.state, SlotState::Submitted) => {
                slot.state = SlotState::Running {
                    wall_start: Instant::now(),
                };
                true
            }
            _ => false,
        }
    }

    /// Move a live slot to a terminal state and run its callback. No-op for slots that
    /// already finished or were terminated.
    fn terminate(&self, number: u64, reason: Termination) -> bool {
        let (task, ctx) = {
            let mut table = self.slots.lock();
            let Some(slot) = table.slots.get_mut(&number) else {
                return false;
            };
            let wall_start = match slot.state {
                SlotState::Submitted => None,
                SlotState::Running { wall_start } => Some(wall_start),
                SlotState::Terminated { .. } => return false,
            };
            slot.state = SlotState::Terminated {
                reason,
                wall_start,
                at: Instant::now(),
            };
            slot.token.cancel();
            (slot.task.clone(), slot.ctx.clone())
        };

        tracing::debug!(job_id = %ctx.job_id, position = ctx.position, ?reason, "Unit terminated");
        if let Some(task) = task {
            match reason {
                Termination::Cancelled => task.on_cancel(&ctx),
                Termination::TimedOut => task.on_timeout(&ctx),
            }
        }
        true
    }

    /// Remove a slot whose runner stopped and build its result.
    fn settle(&self, number: u64, position: usize, outcome: RunOutcome) -> UnitResult {
        let slot = self.slots.lock().remove(number);
        let (unit_id, state) = match slot {
            Some(slot) => (slot.unit_id, slot.state),
            None => (None, SlotState::Submitted),
        };

        let (outcome, elapsed) = match (state, outcome) {
            (
                SlotState::Terminated {
                    reason,
                    wall_start,
                    at,
                },
                _,
            ) => {
                let outcome = match reason {
                    Termination::Cancelled => UnitOutcome::Cancelled,
                    Termination::TimedOut => UnitOutcome::TimedOut,
                };
                let elapsed = wall_start.map(|s| at.duration_since(s)).unwrap_or_default();
                (outcome, elapsed)
            }
            (SlotState::Running { wall_start }, RunOutcome::Finished(outcome)) => {
                (outcome, wall_start.elapsed())
            }
            (_, RunOutcome::Finished(outcome)) => (outcome, Duration::ZERO),
            (_, RunOutcome::Terminated) => (UnitOutcome::Cancelled, Duration::ZERO),
        };

        UnitResult {
            position,
            id: unit_id,
            outcome,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Runs units in a bounded worker pool with per-unit timeouts and cancellation.
#[derive(Clone)]
pub struct ExecutionManager {
    inner: Arc<Inner>,
}

impl ExecutionManager {
    pub fn new(config: &ExecutionConfig, registry: Arc<TaskRegistry>) -> Self {
        let size = config.processing_threads.max(1);
        Self {
            inner: Arc::new(Inner {
                registry,
                permits: Arc::new(Semaphore::new(size)),
                pool_size: Mutex::new(size),
                slots: Mutex::new(SlotTable::default()),
                next_slot: AtomicU64::new(1),
                current_job: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// Run every unit of the bundle and return once all of them are terminal.
    ///
    /// Results come back in bundle order.
    pub async fn execute(&self, bundle: ExecutionBundle) -> Vec<UnitResult> {
        let ExecutionBundle {
            job_id,
            data,
            units,
            resources,
        } = bundle;
        *self.inner.current_job.lock() = Some(job_id);
        tracing::debug!(job_id = %job_id, units = units.len(), "Executing bundle");

        let mut runners = JoinSet::new();
        let mut timers: DelayQueue<u64> = DelayQueue::new();
        let mut timer_keys: HashMap<u64, delay_queue::Key> = HashMap::new();
        let mut results: Vec<Option<UnitResult>> = vec![None; units.len()];
        let mut positions = Vec::with_capacity(units.len());
        let now = Utc::now();

        for (index, unit) in units.into_iter().enumerate() {
            let number = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);
            let token = CancellationToken::new();
            let task = self.inner.registry.get(&unit.task.kind);
            let ctx = TaskContext::new(job_id, unit.position, unit.id.clone(), data.clone())
                .with_cancel(token.clone())
                .with_resources(resources.clone());
            positions.push((unit.position, unit.id.clone()));

            self.inner.slots.lock().insert(
                number,
                Slot {
                    job_id,
                    unit_id: unit.id.clone(),
                    state: SlotState::Submitted,
                    token: token.clone(),
                    task: task.clone(),
                    ctx: ctx.clone(),
                },
            );

            let delay = unit
                .timeout
                .filter(|t| !matches!(t, UnitTimeout::After { millis: 0 }))
                .map(|t| t.remaining(now).unwrap_or_default());
            if let Some(delay) = delay {
                timer_keys.insert(number, timers.insert(number, delay));
            }

            let inner = self.inner.clone();
            let position = unit.position;
            runners.spawn(async move {
                let outcome = run_slot(&inner, number, unit, task, ctx, token).await;
                (index, number, inner.settle(number, position, outcome))
            });
        }

        loop {
            tokio::select! {
                joined = runners.join_next() => match joined {
                    None => break,
                    Some(Ok((index, number, result))) => {
                        if let Some(key) = timer_keys.remove(&number) {
                            timers.remove(&key);
                        }
                        results[index] = Some(result);
                    }
                    Some(Err(e)) => {
                        tracing::error!(job_id = %job_id, error = %e, "Unit runner failed");
                    }
                },
                Some(expired) = timers.next(), if !timers.is_empty() => {
                    let number = expired.into_inner();
                    timer_keys.remove(&number);
                    self.inner.terminate(number, Termination::TimedOut);
                }
            }
        }

        {
            let mut current = self.inner.current_job.lock();
            if *current == Some(job_id) {
                *current = None;
            }
        }

        results
            .into_iter()
            .zip(positions)
            .map(|(result, (position, id))| {
                result.unwrap_or_else(|| UnitResult {
                    position,
                    id,
                    outcome: UnitOutcome::Failed {
                        error: "unit runner lost".to_string(),
                    },
                    elapsed_ms: 0,
                })
            })
            .collect()
    }

    /// Cancel every unit of a job running here. Returns the number of units terminated.
    pub fn cancel_job(&self, job_id: Uuid) -> usize {
        let numbers: Vec<u64> = self
            .inner
            .slots
            .lock()
            .by_job
            .get(&job_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        self.terminate_all(numbers)
    }

    /// Cancel units by their user-supplied id.
    pub fn cancel_unit(&self, unit_id: &str) -> usize {
        let numbers: Vec<u64> = self
            .inner
            .slots
            .lock()
            .by_unit
            .get(unit_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        self.terminate_all(numbers)
    }

    pub fn cancel_all(&self) -> usize {
        let numbers: Vec<u64> = self.inner.slots.lock().slots.keys().copied().collect();
        self.terminate_all(numbers)
    }

    fn terminate_all(&self, numbers: Vec<u64>) -> usize {
        numbers
            .into_iter()
            .filter(|n| self.inner.terminate(*n, Termination::Cancelled))
            .count()
    }

    /// Job whose bundle is currently executing, if any.
    pub fn current_job_id(&self) -> Option<Uuid> {
        *self.inner.current_job.lock()
    }

    pub fn active_units(&self) -> usize {
        self.inner.slots.lock().slots.len()
    }

    pub fn thread_pool_size(&self) -> usize {
        *self.inner.pool_size.lock()
    }

    /// Resize the worker pool. Shrinking takes effect as running units release their workers.
    pub fn set_thread_pool_size(&self, size: usize) {
        let size = size.max(1);
        let mut current = self.inner.pool_size.lock();
        if size > *current {
            self.inner.permits.add_permits(size - *current);
        } else if size < *current {
            let surplus = (*current - size) as u32;
            let permits = self.inner.permits.clone();
            tokio::spawn(async move {
                if let Ok(permit) = permits.acquire_many_owned(surplus).await {
                    permit.forget();
                }
            });
        }
        tracing::info!(from = *current, to = size, "Thread pool resized");
        *current = size;
    }
}

async fn run_slot(
    inner: &Inner,
    number: u64,
    unit: Unit,
    task: Option<Arc<dyn Task>>,
    ctx: TaskContext,
    token: CancellationToken,
) -> RunOutcome {
    let Some(task) = task else {
        return RunOutcome::Finished(UnitOutcome::Failed {
            error: format!("unknown task kind '{}'", unit.task.kind),
        });
    };

    let permit = tokio::select! {
        biased;
        _ = token.cancelled() => return RunOutcome::Terminated,
        permit = inner.permits.clone().acquire_owned() => permit,
    };
    let Ok(_permit) = permit else {
        return RunOutcome::Finished(UnitOutcome::Failed {
            error: "worker pool closed".to_string(),
        });
    };
    if !inner.mark_running(number) {
        return RunOutcome::Terminated;
    }

    let payload = unit.task.payload;
    let mut handle = tokio::spawn(async move { task.run(ctx, payload).await });
    tokio::select! {
        joined = &mut handle => RunOutcome::Finished(match joined {
            Ok(Ok(output)) => UnitOutcome::Completed { output },
            Ok(Err(error)) => UnitOutcome::Failed { error },
            Err(e) if e.is_panic() => UnitOutcome::Failed {
                error: format!("task panicked: {}", panic_message(e.into_panic())),
            },
            Err(_) => UnitOutcome::Cancelled,
        }),
        _ = token.cancelled() => {
            handle.abort();
            RunOutcome::Terminated
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
