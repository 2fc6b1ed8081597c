use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::bundler::{clamp_size, Bundler};
use crate::driver::DriverState;
use crate::error::{GridError, Result};
use crate::protocol::{decode_json, BundleHeader, BundleKind, BundleParams, ChannelKind};
use crate::scheduler::{DispatchBundle, ExecutorInfo, UnitResult};
use crate::transport::{Channel, ChannelId, Channels, Protocol, Signal, StateTable, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Driver handshake sent; waiting for the executor's.
    WaitHandshake,
    /// Ready to receive a bundle.
    Idle,
    /// A bundle is out; waiting for its results header.
    WaitResults,
    /// Reading the result frames announced by the results header.
    ReadResults,
}

struct PendingBundle {
    bundle: DispatchBundle,
    sent_at: Instant,
}

#[derive(Default)]
pub struct NodeChannel {
    info: Option<ExecutorInfo>,
    bundler: Option<Box<dyn Bundler>>,
    pending: Option<PendingBundle>,
    results_header: Option<BundleHeader>,
    results: Vec<UnitResult>,
}

/// Management view of one connected executor.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorSummary {
    pub uuid: Uuid,
    pub addr: Option<String>,
    pub is_peer: bool,
    pub hostname: String,
    pub processing_threads: usize,
    pub state: String,
    pub current_job: Option<Uuid>,
    pub bundler: Option<String>,
    pub bundle_size: Option<usize>,
}

pub enum NodeCommand {
    /// Something became dispatchable; run a dispatch pass now.
    Wake,
    ListExecutors(oneshot::Sender<Vec<ExecutorSummary>>),
    CancelJob {
        job_id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    /// Tell the executors holding units of an already finalized job to stop them.
    AbortJob {
        job_id: Uuid,
        executors: Vec<Uuid>,
    },
    SetThreads {
        executor: Uuid,
        size: usize,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Driver side of node job channels: handshake, dispatch and result collection.
pub struct NodeProtocol {
    state: Arc<DriverState>,
}

impl NodeProtocol {
    pub fn new(state: Arc<DriverState>) -> Self {
        Self { state }
    }

    fn on_handshake(&mut self, ctx: &mut Channel<Self>, signal: Signal) -> Result<Transition<NodeState>> {
        let Signal::Frame(frame) = signal else {
            return Ok(Transition::Stay);
        };
        let header: BundleHeader = decode_json(&frame)?;
        header.expect_kind(BundleKind::Handshake)?;
        let uuid = header
            .params
            .node_uuid
            .ok_or_else(|| GridError::protocol("executor handshake without NODE_UUID"))?;

        let mut system_info = header.params.system_info.unwrap_or_default();
        if let Some(threads) = header.params.thread_pool_size {
            system_info.processing_threads = threads;
        }
        let info = ExecutorInfo {
            uuid,
            addr: ctx.peer(),
            is_peer: header.params.is_peer.unwrap_or(false),
            system_info,
        };
        ctx.data.bundler = Some(self.state.bundlers.create(&info));
        tracing::info!(
            executor = %uuid,
            channel = ctx.id(),
            threads = info.system_info.processing_threads,
            peer = info.is_peer,
            "Executor connected"
        );
        ctx.data.info = Some(info);
        self.state.stats.executor_connected();
        Ok(Transition::To(NodeState::Idle))
    }

    fn on_idle(&mut self, ctx: &mut Channel<Self>, signal: Signal) -> Result<Transition<NodeState>> {
        let Signal::Frame(frame) = signal else {
            return Ok(Transition::Stay);
        };
        let header: BundleHeader = decode_json(&frame)?;
        header.expect_kind(BundleKind::Notification)?;
        self.apply_notification(ctx, header.params);
        Ok(Transition::Stay)
    }

    fn on_wait_results(
        &mut self,
        ctx: &mut Channel<Self>,
        signal: Signal,
    ) -> Result<Transition<NodeState>> {
        let Signal::Frame(frame) = signal else {
            return Ok(Transition::Stay);
        };
        let header: BundleHeader = decode_json(&frame)?;
        match header.kind {
            BundleKind::Notification => {
                self.apply_notification(ctx, header.params);
                Ok(Transition::Stay)
            }
            BundleKind::Results => {
                let (expected, size) = ctx
                    .data
                    .pending
                    .as_ref()
                    .map(|p| (p.bundle.bundle_id, p.bundle.len()))
                    .ok_or_else(|| GridError::protocol("results without a pending bundle"))?;
                if header.bundle_id != expected {
                    return Err(GridError::protocol(format!(
                        "results for bundle {} while {expected} is pending",
                        header.bundle_id
                    )));
                }
                let count = header.unit_count;
                // A failed bundle carries no results, anything else reports every unit
                let valid = count == size || (count == 0 && header.params.node_exception.is_some());
                if !valid {
                    return Err(GridError::protocol(format!(
                        "{count} results announced for a bundle of {size} units"
                    )));
                }
                ctx.data.results = Vec::with_capacity(count.min(size));
                ctx.data.results_header = Some(header);
                if count == 0 {
                    self.finish_bundle(ctx);
                    Ok(Transition::To(NodeState::Idle))
                } else {
                    Ok(Transition::To(NodeState::ReadResults))
                }
            }
            other => Err(GridError::protocol(format!(
                "unexpected {other:?} header while waiting for results"
            ))),
        }
    }

    fn on_read_results(
        &mut self,
        ctx: &mut Channel<Self>,
        signal: Signal,
    ) -> Result<Transition<NodeState>> {
        let Signal::Frame(frame) = signal else {
            return Ok(Transition::Stay);
        };
        ctx.data.results.push(decode_json::<UnitResult>(&frame)?);
        let expected = ctx
            .data
            .results_header
            .as_ref()
            .map_or(0, |h| h.unit_count);
        if ctx.data.results.len() < expected {
            return Ok(Transition::Stay);
        }
        self.finish_bundle(ctx);
        Ok(Transition::To(NodeState::Idle))
    }

    /// Hand the collected results to the queue, requeue whatever the executor did not
    /// report, and feed the bundler.
    fn finish_bundle(&mut self, ctx: &mut Channel<Self>) {
        let Some(PendingBundle { bundle, sent_at }) = ctx.data.pending.take() else {
            return;
        };
        let header = ctx.data.results_header.take();
        let results = std::mem::take(&mut ctx.data.results);
        let params = header.map(|h| h.params).unwrap_or_default();
        let elapsed = params
            .node_bundle_elapsed
            .map(Duration::from_millis)
            .unwrap_or_else(|| sent_at.elapsed());
        let executed_ms: u64 = results.iter().map(|r| r.elapsed_ms).sum();

        let (accepted, requeued) = {
            let mut queue = self.state.queue.lock();
            let accepted = match &params.node_exception {
                Some(error) => {
                    tracing::warn!(job_id = %bundle.job_id, bundle_id = bundle.bundle_id, error = %error, "Executor failed the bundle");
                    queue.fail_bundle(&bundle, error)
                }
                None => queue.complete(bundle.job_id, bundle.bundle_id, results),
            };
            (accepted, queue.requeue(&bundle))
        };

        self.state.stats.units_completed(accepted, executed_ms);
        if requeued > 0 {
            self.state.stats.units_requeued(requeued);
        }
        if let Some(bundler) = ctx.data.bundler.as_mut() {
            bundler.feedback(bundle.len(), elapsed);
        }
        tracing::debug!(
            job_id = %bundle.job_id,
            bundle_id = bundle.bundle_id,
            accepted,
            requeued,
            elapsed_ms = elapsed.as_millis() as u64,
            "Bundle returned"
        );
    }

    fn apply_notification(&mut self, ctx: &mut Channel<Self>, params: BundleParams) {
        let Some(info) = ctx.data.info.as_mut() else {
            return;
        };
        let mut changed = false;
        if let Some(system_info) = params.system_info {
            info.system_info = system_info;
            changed = true;
        }
        if let Some(threads) = params.thread_pool_size {
            info.system_info.processing_threads = threads;
            changed = true;
        }
        if changed {
            tracing::info!(executor = %info.uuid, threads = info.system_info.processing_threads, "Executor configuration changed");
            // Thread-based sizing depends on what the executor just reported
            if ctx.data.bundler.as_ref().is_some_and(|b| b.name() == "node_threads") {
                ctx.data.bundler = Some(self.state.bundlers.create(info));
            }
        }
    }

    /// Pair idle executors with eligible jobs until either runs out.
    fn dispatch(&mut self, channels: &mut Channels<Self>) {
        loop {
            let idle: Vec<(ChannelId, ExecutorInfo)> = channels
                .iter()
                .filter(|(_, c)| c.state == NodeState::Idle && !c.is_closing())
                .filter_map(|(id, c)| c.data.info.clone().map(|info| (*id, info)))
                .collect();
            // Queried even with no idle executor so that deadlines are still enforced
            let candidates: Vec<ExecutorInfo> = idle.iter().map(|(_, info)| info.clone()).collect();

            let mut queue = self.state.queue.lock();
            let Some(selection) = queue.next_eligible(&candidates) else {
                return;
            };
            let Some((channel_id, info)) = selection
                .executors
                .first()
                .and_then(|uuid| idle.iter().find(|(_, info)| info.uuid == *uuid))
                .cloned()
            else {
                return;
            };
            let Some(ctx) = channels.get_mut(&channel_id) else {
                return;
            };

            let factory = &self.state.bundlers;
            if ctx
                .data
                .bundler
                .as_ref()
                .map_or(true, |b| factory.is_stale(b.as_ref()))
            {
                ctx.data.bundler = Some(factory.create(&info));
            }
            let recommended = ctx.data.bundler.as_ref().map_or(1, |b| b.compute_size());
            let size = clamp_size(recommended, selection.max_bundle_size, selection.dispatchable);

            let bundle = match queue.take_units(selection.job_id, size, info.uuid) {
                Ok(bundle) => bundle,
                Err(e) => {
                    tracing::warn!(job_id = %selection.job_id, error = %e, "Dispatch aborted");
                    return;
                }
            };

            if let Err(e) = send_bundle(ctx, &bundle) {
                tracing::warn!(executor = %info.uuid, error = %e, "Failed to frame bundle");
                queue.requeue(&bundle);
                ctx.close();
                continue;
            }
            drop(queue);

            self.state.stats.units_dispatched(bundle.len());
            tracing::debug!(
                job_id = %bundle.job_id,
                bundle_id = bundle.bundle_id,
                executor = %info.uuid,
                units = bundle.len(),
                "Bundle dispatched"
            );
            ctx.data.pending = Some(PendingBundle {
                bundle,
                sent_at: Instant::now(),
            });
            ctx.state = NodeState::WaitResults;
        }
    }

    fn abort(&self, channels: &mut Channels<Self>, job_id: Uuid, executors: &[Uuid], expired: bool) {
        for ctx in channels.values_mut() {
            let holds = ctx
                .data
                .info
                .as_ref()
                .is_some_and(|info| executors.contains(&info.uuid));
            if !holds {
                continue;
            }
            let notice = BundleHeader::new(BundleKind::Notification).with_params(BundleParams {
                cancel_job: Some(job_id),
                job_expired: expired,
                ..BundleParams::default()
            });
            if let Err(e) = ctx.write_json(&notice) {
                tracing::warn!(channel = ctx.id(), error = %e, "Failed to send cancellation");
                ctx.close();
            }
        }
    }

    fn abort_expired(&mut self, channels: &mut Channels<Self>) {
        let expired = self.state.queue.lock().take_expired();
        for job in expired {
            self.abort(channels, job.job_id, &job.executors, true);
        }
    }

    fn summaries(channels: &Channels<Self>) -> Vec<ExecutorSummary> {
        channels
            .values()
            .filter_map(|ctx| {
                let info = ctx.data.info.as_ref()?;
                Some(ExecutorSummary {
                    uuid: info.uuid,
                    addr: info.addr.map(|a| a.to_string()),
                    is_peer: info.is_peer,
                    hostname: info.system_info.hostname.clone(),
                    processing_threads: info.system_info.processing_threads,
                    state: format!("{:?}", ctx.state),
                    current_job: ctx.data.pending.as_ref().map(|p| p.bundle.job_id),
                    bundler: ctx.data.bundler.as_ref().map(|b| b.name().to_string()),
                    bundle_size: ctx.data.bundler.as_ref().map(|b| b.compute_size()),
                })
            })
            .collect()
    }
}

fn send_bundle(ctx: &mut Channel<NodeProtocol>, bundle: &DispatchBundle) -> Result<()> {
    let mut header = BundleHeader::new(BundleKind::Dispatch).with_params(BundleParams {
        job_requeue: bundle.requeued,
        client_uuid: bundle.submitter,
        ..BundleParams::default()
    });
    header.bundle_id = bundle.bundle_id;
    header.job_id = Some(bundle.job_id);
    header.job_name = Some(bundle.job_name.clone());
    header.unit_count = bundle.len();

    ctx.write_json(&header)?;
    ctx.write_frame(bundle.data.clone())?;
    for unit in &bundle.units {
        ctx.write_json(unit)?;
    }
    Ok(())
}

impl Protocol for NodeProtocol {
    type State = NodeState;
    type Data = NodeChannel;
    type Command = NodeCommand;

    const NAME: &'static str = "node";

    fn transitions() -> StateTable<Self> {
        StateTable::new()
            .on(NodeState::WaitHandshake, Self::on_handshake)
            .on(NodeState::Idle, Self::on_idle)
            .on(NodeState::WaitResults, Self::on_wait_results)
            .on(NodeState::ReadResults, Self::on_read_results)
    }

    fn initial_state(&self, _kind: ChannelKind) -> NodeState {
        NodeState::WaitHandshake
    }

    fn new_data(&self, _kind: ChannelKind) -> NodeChannel {
        NodeChannel::default()
    }

    fn on_open(&mut self, ctx: &mut Channel<Self>) -> Result<()> {
        let handshake = BundleHeader::new(BundleKind::Handshake).with_params(BundleParams {
            driver_uuid: Some(self.state.uuid),
            ..BundleParams::default()
        });
        ctx.write_json(&handshake)
    }

    fn on_command(&mut self, command: NodeCommand, channels: &mut Channels<Self>) -> Vec<ChannelId> {
        match command {
            NodeCommand::Wake => {}
            NodeCommand::ListExecutors(reply) => {
                let _ = reply.send(Self::summaries(channels));
            }
            NodeCommand::CancelJob { job_id, reply } => {
                let found = match self.state.cancel_job(job_id) {
                    Ok(executors) => {
                        self.abort(channels, job_id, &executors, false);
                        true
                    }
                    Err(_) => false,
                };
                let _ = reply.send(found);
            }
            NodeCommand::AbortJob { job_id, executors } => {
                self.abort(channels, job_id, &executors, false);
            }
            NodeCommand::SetThreads {
                executor,
                size,
                reply,
            } => {
                let target = channels.values_mut().find(|ctx| {
                    ctx.data
                        .info
                        .as_ref()
                        .is_some_and(|info| info.uuid == executor)
                });
                let result = match target {
                    Some(ctx) => {
                        let notice = BundleHeader::new(BundleKind::Notification).with_params(
                            BundleParams {
                                thread_pool_size: Some(size.max(1)),
                                ..BundleParams::default()
                            },
                        );
                        ctx.write_json(&notice)
                    }
                    None => Err(GridError::ExecutorNotFound(executor)),
                };
                let _ = reply.send(result);
            }
        }
        Vec::new()
    }

    fn poll(&mut self, channels: &mut Channels<Self>) -> Vec<ChannelId> {
        self.abort_expired(channels);
        self.dispatch(channels);
        // Dispatching may have expired jobs on the way
        self.abort_expired(channels);
        Vec::new()
    }

    fn on_close(&mut self, ctx: &mut Channel<Self>) {
        if let Some(pending) = ctx.data.pending.take() {
            let bundle = &pending.bundle;
            // Results that arrived before the connection dropped still count
            let partial = std::mem::take(&mut ctx.data.results);
            let executed_ms: u64 = partial.iter().map(|r| r.elapsed_ms).sum();
            let (accepted, requeued) = {
                let mut queue = self.state.queue.lock();
                let accepted = if partial.is_empty() {
                    0
                } else {
                    queue.complete(bundle.job_id, bundle.bundle_id, partial)
                };
                (accepted, queue.requeue(bundle))
            };
            if accepted > 0 {
                self.state.stats.units_completed(accepted, executed_ms);
            }
            self.state.stats.units_requeued(requeued);
            tracing::info!(job_id = %bundle.job_id, bundle_id = bundle.bundle_id, accepted, requeued, "Bundle of a lost executor returned to the queue");
        }
        if let Some(info) = &ctx.data.info {
            self.state.stats.executor_disconnected();
            tracing::info!(executor = %info.uuid, channel = ctx.id(), "Executor disconnected");
        }
    }
}

