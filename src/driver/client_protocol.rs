use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use uuid::Uuid;

use crate::driver::node_protocol::{NodeCommand, NodeProtocol};
use crate::driver::DriverState;
use crate::error::{GridError, Result};
use crate::protocol::{
    decode_json, BundleParams, ChannelKind, ClientMessage, DriverMessage, MAX_PREALLOCATED_UNITS,
};
use crate::scheduler::{Job, JobHeader, JobReport, Unit};
use crate::transport::{
    Channel, ChannelId, Channels, MultiplexerHandle, Protocol, Signal, StateTable, Transition,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    WaitHandshake,
    Idle,
    /// Submission header read; the data-context frame comes next.
    WaitJobData,
    WaitUnits,
}

#[derive(Default)]
pub struct ClientChannel {
    uuid: Option<Uuid>,
    header: Option<JobHeader>,
    data: Bytes,
    units: Vec<Unit>,
    /// Jobs admitted through this channel and not yet reported.
    jobs: HashSet<Uuid>,
}

pub enum ClientCommand {
    /// A job submitted on `channel` finished; send its report.
    Deliver { channel: ChannelId, report: JobReport },
}

/// Driver side of client job channels: job submission, cancellation and result delivery.
pub struct ClientProtocol {
    state: Arc<DriverState>,
    handle: MultiplexerHandle<ClientProtocol>,
    nodes: MultiplexerHandle<NodeProtocol>,
}

impl ClientProtocol {
    pub fn new(
        state: Arc<DriverState>,
        handle: MultiplexerHandle<ClientProtocol>,
        nodes: MultiplexerHandle<NodeProtocol>,
    ) -> Self {
        Self {
            state,
            handle,
            nodes,
        }
    }

    fn on_handshake(&mut self, ctx: &mut Channel<Self>, signal: Signal) -> Result<Transition<ClientState>> {
        let Signal::Frame(frame) = signal else {
            return Ok(Transition::Stay);
        };
        match decode_json::<ClientMessage>(&frame)? {
            ClientMessage::Handshake { params } => {
                let uuid = params
                    .client_uuid
                    .ok_or_else(|| GridError::protocol("client handshake without CLIENT_UUID"))?;
                tracing::info!(client = %uuid, channel = ctx.id(), "Client connected");
                ctx.data.uuid = Some(uuid);
                Ok(Transition::To(ClientState::Idle))
            }
            other => Err(GridError::protocol(format!(
                "expected client handshake, got {other:?}"
            ))),
        }
    }

    fn on_idle(&mut self, ctx: &mut Channel<Self>, signal: Signal) -> Result<Transition<ClientState>> {
        let Signal::Frame(frame) = signal else {
            return Ok(Transition::Stay);
        };
        match decode_json::<ClientMessage>(&frame)? {
            ClientMessage::Submit { header } => {
                ctx.data.units = Vec::with_capacity(header.unit_count.min(MAX_PREALLOCATED_UNITS));
                ctx.data.header = Some(header);
                Ok(Transition::To(ClientState::WaitJobData))
            }
            ClientMessage::Cancel { job_id } => {
                let found = ctx.data.jobs.contains(&job_id) && self.cancel(job_id);
                ctx.write_json(&DriverMessage::CancelAck { job_id, found })?;
                Ok(Transition::Stay)
            }
            ClientMessage::Handshake { .. } => Err(GridError::protocol("repeated client handshake")),
        }
    }

    fn on_job_data(&mut self, ctx: &mut Channel<Self>, signal: Signal) -> Result<Transition<ClientState>> {
        let Signal::Frame(frame) = signal else {
            return Ok(Transition::Stay);
        };
        ctx.data.data = frame;
        if ctx.data.header.as_ref().map_or(0, |h| h.unit_count) == 0 {
            self.submit(ctx)?;
            return Ok(Transition::To(ClientState::Idle));
        }
        Ok(Transition::To(ClientState::WaitUnits))
    }

    fn on_units(&mut self, ctx: &mut Channel<Self>, signal: Signal) -> Result<Transition<ClientState>> {
        let Signal::Frame(frame) = signal else {
            return Ok(Transition::Stay);
        };
        ctx.data.units.push(decode_json::<Unit>(&frame)?);
        let expected = ctx.data.header.as_ref().map_or(0, |h| h.unit_count);
        if ctx.data.units.len() < expected {
            return Ok(Transition::Stay);
        }
        self.submit(ctx)?;
        Ok(Transition::To(ClientState::Idle))
    }

    /// Admit the fully read submission and answer the client.
    fn submit(&mut self, ctx: &mut Channel<Self>) -> Result<()> {
        let header = ctx
            .data
            .header
            .take()
            .ok_or_else(|| GridError::protocol("job data without a submission header"))?;
        let data = std::mem::take(&mut ctx.data.data);
        let units = std::mem::take(&mut ctx.data.units);
        let job = Job::from_parts(header, data.to_vec(), units);
        let job_id = job.id;
        let pending = job.sla.start_at.is_some_and(|t| t > Utc::now());

        let channel = ctx.id();
        let handle = self.handle.clone();
        let collector = Box::new(move |report: JobReport| {
            if handle.send(ClientCommand::Deliver { channel, report }).is_err() {
                tracing::debug!(channel, "Client multiplexer gone, report dropped");
            }
        });

        // Track the job before admission: an empty or already expired job reports at once
        let fresh = ctx.data.jobs.insert(job_id);
        match self.state.admit(job, ctx.data.uuid, collector) {
            Ok(()) => {
                ctx.write_json(&DriverMessage::Accepted {
                    job_id,
                    params: BundleParams {
                        job_pending: pending,
                        ..BundleParams::default()
                    },
                })?;
                let _ = self.nodes.send(NodeCommand::Wake);
            }
            Err(e) => {
                // A rejected resubmission must not untrack the live job it collided with
                if fresh {
                    ctx.data.jobs.remove(&job_id);
                }
                tracing::info!(job_id = %job_id, error = %e, "Job rejected");
                ctx.write_json(&DriverMessage::Rejected {
                    job_id,
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    fn cancel(&self, job_id: Uuid) -> bool {
        match self.state.cancel_job(job_id) {
            Ok(executors) => {
                if !executors.is_empty() {
                    let _ = self.nodes.send(NodeCommand::AbortJob { job_id, executors });
                }
                true
            }
            Err(_) => false,
        }
    }
}

impl Protocol for ClientProtocol {
    type State = ClientState;
    type Data = ClientChannel;
    type Command = ClientCommand;

    const NAME: &'static str = "client";

    fn transitions() -> StateTable<Self> {
        StateTable::new()
            .on(ClientState::WaitHandshake, Self::on_handshake)
            .on(ClientState::Idle, Self::on_idle)
            .on(ClientState::WaitJobData, Self::on_job_data)
            .on(ClientState::WaitUnits, Self::on_units)
    }

    fn initial_state(&self, _kind: ChannelKind) -> ClientState {
        ClientState::WaitHandshake
    }

    fn new_data(&self, _kind: ChannelKind) -> ClientChannel {
        ClientChannel::default()
    }

    fn on_open(&mut self, ctx: &mut Channel<Self>) -> Result<()> {
        ctx.write_json(&DriverMessage::Handshake {
            params: BundleParams {
                driver_uuid: Some(self.state.uuid),
                ..BundleParams::default()
            },
        })
    }

    fn on_command(&mut self, command: ClientCommand, channels: &mut Channels<Self>) -> Vec<ChannelId> {
        match command {
            ClientCommand::Deliver { channel, report } => {
                let job_id = report.job_id;
                match channels
                    .get_mut(&channel)
                    .filter(|ctx| ctx.data.jobs.contains(&job_id))
                {
                    Some(ctx) => {
                        ctx.data.jobs.remove(&job_id);
                        if let Err(e) = ctx.write_json(&DriverMessage::Report { report }) {
                            tracing::warn!(job_id = %job_id, channel, error = %e, "Failed to send job report");
                            ctx.close();
                        }
                    }
                    None => {
                        tracing::debug!(job_id = %job_id, channel, "Submitter gone, report dropped");
                    }
                }
            }
        }
        Vec::new()
    }

    fn on_close(&mut self, ctx: &mut Channel<Self>) {
        for job_id in ctx.data.jobs.drain().collect::<Vec<_>>() {
            if self.cancel(job_id) {
                tracing::info!(job_id = %job_id, channel = ctx.id(), "Job cancelled, submitter disconnected");
            }
        }
        if let Some(uuid) = ctx.data.uuid {
            tracing::info!(client = %uuid, channel = ctx.id(), "Client disconnected");
        }
    }
}
