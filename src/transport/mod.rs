//! Non-blocking connection handling for the driver.
//!
//! One [`Multiplexer`] per protocol family owns all channels of that family and drives
//! each through the protocol's [`StateTable`].

pub mod acceptor;
pub mod context;
pub mod multiplexer;
pub mod state;

pub use acceptor::{run_acceptor, ChannelSink, Routes};
pub use context::ChannelContext;
pub use multiplexer::{Multiplexer, MultiplexerHandle, MultiplexerInbox};
pub use state::{Channel, ChannelId, Channels, Protocol, Signal, StateTable, Transition};
