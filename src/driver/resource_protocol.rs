use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::protocol::{decode_json, ChannelKind, ResourceMessage};
use crate::transport::{Channel, ChannelId, Channels, Protocol, Signal, StateTable, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    WaitHello,
    /// A submitter answering requests for its own resources.
    Provider,
    NodeIdle,
    /// An executor parked until its request is answered.
    NodeWaiting,
}

type ResourceKey = (Uuid, String);

#[derive(Default)]
pub struct ResourceChannel {
    uuid: Option<Uuid>,
    /// Request the parked executor is waiting on: its own id and what it asked for.
    waiting: Option<(u64, ResourceKey)>,
    /// Requests forwarded to this provider.
    forwarded: HashSet<ResourceKey>,
}

struct PendingRequest {
    waiters: Vec<ChannelId>,
    /// Provider channel the request went to, once forwarded.
    sent_to: Option<ChannelId>,
}

/// Routes resource requests from executors to the submitter that owns the resource.
///
/// Resolved bytes are cached per (submitter, name) until the submitter's provider
/// channel closes. Concurrent requests for the same key share one provider round trip.
#[derive(Default)]
pub struct ResourceProtocol {
    providers: HashMap<Uuid, ChannelId>,
    cache: HashMap<ResourceKey, Vec<u8>>,
    pending: HashMap<ResourceKey, PendingRequest>,
    answers: HashMap<ChannelId, Option<Vec<u8>>>,
    ready: Vec<ChannelId>,
    next_request_id: u64,
}

impl ResourceProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached resources.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    fn resolve(&mut self, key: &ResourceKey, data: Option<Vec<u8>>) {
        let Some(request) = self.pending.remove(key) else {
            return;
        };
        for waiter in request.waiters {
            self.answers.insert(waiter, data.clone());
            self.ready.push(waiter);
        }
    }

    fn on_hello(&mut self, ctx: &mut Channel<Self>, signal: Signal) -> Result<Transition<ResourceState>> {
        let Signal::Frame(frame) = signal else {
            return Ok(Transition::Stay);
        };
        let ResourceMessage::Hello { uuid } = decode_json(&frame)? else {
            return Err(GridError::protocol("resource channel did not start with hello"));
        };
        ctx.data.uuid = Some(uuid);
        match ctx.kind() {
            ChannelKind::ClientResource => {
                if let Some(previous) = self.providers.insert(uuid, ctx.id()) {
                    tracing::debug!(submitter = %uuid, previous, "Provider channel replaced");
                }
                tracing::info!(submitter = %uuid, channel = ctx.id(), "Resource provider connected");
                Ok(Transition::To(ResourceState::Provider))
            }
            _ => {
                tracing::debug!(executor = %uuid, channel = ctx.id(), "Executor resource channel opened");
                Ok(Transition::To(ResourceState::NodeIdle))
            }
        }
    }

    fn on_node_idle(&mut self, ctx: &mut Channel<Self>, signal: Signal) -> Result<Transition<ResourceState>> {
        let Signal::Frame(frame) = signal else {
            return Ok(Transition::Stay);
        };
        let ResourceMessage::Request {
            request_id,
            submitter,
            name,
        } = decode_json(&frame)?
        else {
            return Err(GridError::protocol("executor sent a non-request message"));
        };

        let key = (submitter, name);
        if let Some(data) = self.cache.get(&key) {
            ctx.write_json(&ResourceMessage::Response {
                request_id,
                submitter,
                name: key.1.clone(),
                data: Some(data.clone()),
            })?;
            return Ok(Transition::Stay);
        }

        tracing::debug!(submitter = %submitter, name = %key.1, channel = ctx.id(), "Resource requested");
        self.pending
            .entry(key.clone())
            .or_insert_with(|| PendingRequest {
                waiters: Vec::new(),
                sent_to: None,
            })
            .waiters
            .push(ctx.id());
        ctx.data.waiting = Some((request_id, key));
        Ok(Transition::To(ResourceState::NodeWaiting))
    }

    fn on_node_waiting(&mut self, ctx: &mut Channel<Self>, signal: Signal) -> Result<Transition<ResourceState>> {
        if let Signal::Frame(_) = signal {
            return Err(GridError::protocol("request sent while another is outstanding"));
        }
        let Some(data) = self.answers.remove(&ctx.id()) else {
            return Ok(Transition::Stay);
        };
        let (request_id, (submitter, name)) = ctx
            .data
            .waiting
            .take()
            .ok_or_else(|| GridError::protocol("resumed without an outstanding request"))?;
        ctx.write_json(&ResourceMessage::Response {
            request_id,
            submitter,
            name,
            data,
        })?;
        Ok(Transition::To(ResourceState::NodeIdle))
    }

    fn on_provider(&mut self, ctx: &mut Channel<Self>, signal: Signal) -> Result<Transition<ResourceState>> {
        let Signal::Frame(frame) = signal else {
            return Ok(Transition::Stay);
        };
        let ResourceMessage::Response {
            submitter,
            name,
            data,
            ..
        } = decode_json(&frame)?
        else {
            return Err(GridError::protocol("provider sent a non-response message"));
        };
        if Some(submitter) != ctx.data.uuid {
            return Err(GridError::protocol(format!(
                "provider answered for submitter {submitter}"
            )));
        }

        let key = (submitter, name);
        ctx.data.forwarded.remove(&key);
        tracing::debug!(submitter = %submitter, name = %key.1, found = data.is_some(), "Resource resolved");
        if let Some(bytes) = &data {
            self.cache.insert(key.clone(), bytes.clone());
        }
        self.resolve(&key, data);
        Ok(Transition::Stay)
    }
}

impl Protocol for ResourceProtocol {
    type State = ResourceState;
    type Data = ResourceChannel;
    type Command = ();

    const NAME: &'static str = "resource";

    fn transitions() -> StateTable<Self> {
        StateTable::new()
            .on(ResourceState::WaitHello, Self::on_hello)
            .on(ResourceState::Provider, Self::on_provider)
            .on(ResourceState::NodeIdle, Self::on_node_idle)
            .on(ResourceState::NodeWaiting, Self::on_node_waiting)
    }

    fn initial_state(&self, _kind: ChannelKind) -> ResourceState {
        ResourceState::WaitHello
    }

    fn new_data(&self, _kind: ChannelKind) -> ResourceChannel {
        ResourceChannel::default()
    }

    fn on_command(&mut self, _command: (), _channels: &mut Channels<Self>) -> Vec<ChannelId> {
        Vec::new()
    }

    /// Forward new requests to their providers and answer the ones nobody can serve.
    fn poll(&mut self, channels: &mut Channels<Self>) -> Vec<ChannelId> {
        let unsent: Vec<ResourceKey> = self
            .pending
            .iter()
            .filter(|(_, request)| request.sent_to.is_none())
            .map(|(key, _)| key.clone())
            .collect();

        for key in unsent {
            let provider = self
                .providers
                .get(&key.0)
                .copied()
                .filter(|id| channels.get(id).is_some_and(|c| !c.is_closing()));
            let Some(provider_id) = provider else {
                tracing::debug!(submitter = %key.0, name = %key.1, "No provider for resource");
                self.resolve(&key, None);
                continue;
            };
            let Some(ctx) = channels.get_mut(&provider_id) else {
                continue;
            };

            self.next_request_id += 1;
            let request = ResourceMessage::Request {
                request_id: self.next_request_id,
                submitter: key.0,
                name: key.1.clone(),
            };
            if let Err(e) = ctx.write_json(&request) {
                tracing::warn!(channel = provider_id, error = %e, "Failed to forward resource request");
                ctx.close();
                self.resolve(&key, None);
                continue;
            }
            ctx.data.forwarded.insert(key.clone());
            if let Some(pending) = self.pending.get_mut(&key) {
                pending.sent_to = Some(provider_id);
            }
        }

        std::mem::take(&mut self.ready)
    }

    fn on_close(&mut self, ctx: &mut Channel<Self>) {
        let id = ctx.id();
        match ctx.state {
            ResourceState::Provider => {
                let Some(uuid) = ctx.data.uuid else {
                    return;
                };
                if self.providers.get(&uuid) == Some(&id) {
                    self.providers.remove(&uuid);
                    self.cache.retain(|(submitter, _), _| *submitter != uuid);
                }
                for key in std::mem::take(&mut ctx.data.forwarded) {
                    self.resolve(&key, None);
                }
                tracing::info!(submitter = %uuid, channel = id, "Resource provider disconnected");
            }
            _ => {
                self.answers.remove(&id);
                if let Some((_, key)) = ctx.data.waiting.take() {
                    if let Some(pending) = self.pending.get_mut(&key) {
                        pending.waiters.retain(|w| *w != id);
                        if pending.waiters.is_empty() && pending.sent_to.is_none() {
                            self.pending.remove(&key);
                        }
                    }
                }
            }
        }
    }
}
