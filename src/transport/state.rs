use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::ChannelKind;
use crate::transport::context::ChannelContext;

pub type ChannelId = u64;

/// Why a channel is being serviced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// A complete frame was decoded from the channel's read buffer.
    Frame(Bytes),
    /// A parked channel was woken because whatever it waited on is ready.
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    To(S),
    Stay,
    Close,
}

pub type Channel<P> = ChannelContext<<P as Protocol>::State, <P as Protocol>::Data>;
pub type Channels<P> = BTreeMap<ChannelId, Channel<P>>;
pub type Handler<P> =
    fn(&mut P, &mut Channel<P>, Signal) -> Result<Transition<<P as Protocol>::State>>;

/// A protocol family served by one multiplexer.
///
/// Handlers registered in [`Protocol::transitions`] do one bounded step of work per
/// signal. Work that spans channels (dispatching, routing) happens in [`Protocol::poll`]
/// and [`Protocol::on_command`], which see every channel at once.
pub trait Protocol: Send + Sized + 'static {
    type State: Copy + Eq + Hash + fmt::Debug + Send + 'static;
    type Data: Send + 'static;
    type Command: Send + 'static;

    const NAME: &'static str;

    fn transitions() -> StateTable<Self>;

    fn initial_state(&self, kind: ChannelKind) -> Self::State;

    fn new_data(&self, kind: ChannelKind) -> Self::Data;

    /// Called once when a channel joins the multiplexer, before any frame is read.
    fn on_open(&mut self, _ctx: &mut Channel<Self>) -> Result<()> {
        Ok(())
    }

    /// Handle a side-channel command. Returns channels to resume.
    fn on_command(&mut self, command: Self::Command, channels: &mut Channels<Self>)
        -> Vec<ChannelId>;

    /// Called after every event and on every tick. Returns channels to resume.
    fn poll(&mut self, _channels: &mut Channels<Self>) -> Vec<ChannelId> {
        Vec::new()
    }

    /// Called once when a channel leaves the multiplexer, whatever the reason.
    fn on_close(&mut self, _ctx: &mut Channel<Self>) {}
}

/// Maps each state of a protocol to the handler that services it.
pub struct StateTable<P: Protocol> {
    handlers: HashMap<P::State, Handler<P>>,
}

impl<P: Protocol> Default for StateTable<P> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<P: Protocol> StateTable<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, state: P::State, handler: Handler<P>) -> Self {
        self.handlers.insert(state, handler);
        self
    }

    pub fn handles(&self, state: P::State) -> bool {
        self.handlers.contains_key(&state)
    }

    /// Run the handler of the channel's current state and apply its transition.
    ///
    /// Errors and unhandled states mark the channel as closing.
    pub fn perform_transition(
        &self,
        protocol: &mut P,
        ctx: &mut Channel<P>,
        signal: Signal,
    ) -> Transition<P::State> {
        let Some(handler) = self.handlers.get(&ctx.state) else {
            tracing::warn!(protocol = P::NAME, channel = ctx.id(), state = ?ctx.state, "No handler for state");
            ctx.close();
            return Transition::Close;
        };

        match handler(protocol, ctx, signal) {
            Ok(Transition::To(next)) => {
                tracing::trace!(protocol = P::NAME, channel = ctx.id(), from = ?ctx.state, to = ?next, "Transition");
                ctx.state = next;
                Transition::To(next)
            }
            Ok(Transition::Stay) => Transition::Stay,
            Ok(Transition::Close) => {
                ctx.close();
                Transition::Close
            }
            Err(e) => {
                tracing::warn!(
                    protocol = P::NAME,
                    channel = ctx.id(),
                    state = ?ctx.state,
                    error = %e,
                    "Channel failed, closing"
                );
                ctx.close();
                Transition::Close
            }
        }
    }
}
