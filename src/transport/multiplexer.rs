use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{GridError, Result};
use crate::protocol::ChannelKind;
use crate::transport::context::ChannelContext;
use crate::transport::state::{ChannelId, Channels, Protocol, Signal, StateTable};

const READ_CHUNK: usize = 8 * 1024;
/// Flushes a channel may have outstanding before the peer counts as stalled.
const WRITE_QUEUE_DEPTH: usize = 1024;

/// Everything a multiplexer loop reacts to.
pub enum Input<P: Protocol> {
    Open {
        stream: TcpStream,
        peer: SocketAddr,
        kind: ChannelKind,
    },
    Data(ChannelId, Bytes),
    Eof(ChannelId, Option<String>),
    Command(P::Command),
}

/// Sending side of a multiplexer: new connections and side-channel commands.
pub struct MultiplexerHandle<P: Protocol> {
    tx: mpsc::UnboundedSender<Input<P>>,
}

impl<P: Protocol> Clone for MultiplexerHandle<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub struct MultiplexerInbox<P: Protocol> {
    rx: mpsc::UnboundedReceiver<Input<P>>,
}

impl<P: Protocol> MultiplexerHandle<P> {
    /// Create the handle before the protocol so the protocol can hold a copy of it.
    pub fn channel() -> (Self, MultiplexerInbox<P>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, MultiplexerInbox { rx })
    }

    pub fn open(&self, stream: TcpStream, peer: SocketAddr, kind: ChannelKind) -> Result<()> {
        self.tx
            .send(Input::Open { stream, peer, kind })
            .map_err(|_| GridError::ChannelClosed)
    }

    pub fn send(&self, command: P::Command) -> Result<()> {
        self.tx
            .send(Input::Command(command))
            .map_err(|_| GridError::ChannelClosed)
    }
}

/// One event loop serving every channel of a protocol family.
///
/// Reader tasks forward raw chunks; the loop reassembles frames in each channel's read
/// buffer, drives the state table, and hands encoded output to per-channel writer tasks.
/// The loop itself never awaits network I/O.
pub struct Multiplexer<P: Protocol> {
    protocol: P,
    table: StateTable<P>,
    channels: Channels<P>,
    readers: HashMap<ChannelId, JoinHandle<()>>,
    events: mpsc::UnboundedSender<Input<P>>,
    next_id: ChannelId,
    max_frame_len: usize,
    tick: Duration,
}

impl<P: Protocol> Multiplexer<P> {
    pub fn new(
        protocol: P,
        handle: &MultiplexerHandle<P>,
        max_frame_len: usize,
        tick: Duration,
    ) -> Self {
        Self {
            protocol,
            table: P::transitions(),
            channels: Default::default(),
            readers: HashMap::new(),
            events: handle.tx.clone(),
            next_id: 1,
            max_frame_len,
            tick,
        }
    }

    pub async fn run(mut self, mut inbox: MultiplexerInbox<P>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(protocol = P::NAME, "Multiplexer started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                input = inbox.rx.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => break,
                },
                _ = tick.tick() => {}
            }
            self.service();
        }

        for ctx in self.channels.values_mut() {
            ctx.close();
        }
        self.sweep();
        tracing::info!(protocol = P::NAME, "Multiplexer stopped");
    }

    fn handle_input(&mut self, input: Input<P>) {
        match input {
            Input::Open { stream, peer, kind } => self.open(stream, peer, kind),
            Input::Data(id, chunk) => self.on_data(id, &chunk),
            Input::Eof(id, reason) => {
                if let Some(ctx) = self.channels.get_mut(&id) {
                    tracing::debug!(protocol = P::NAME, channel = id, reason = ?reason, "Peer closed channel");
                    ctx.close();
                }
            }
            Input::Command(command) => {
                let resume = self.protocol.on_command(command, &mut self.channels);
                self.resume(resume);
            }
        }
    }

    fn open(&mut self, stream: TcpStream, peer: SocketAddr, kind: ChannelKind) {
        let id = self.next_id;
        self.next_id += 1;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(channel = id, error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        tokio::spawn(write_loop(write_half, writer_rx));
        let reader = tokio::spawn(read_loop::<P>(id, read_half, self.events.clone()));

        let mut ctx = ChannelContext::new(
            id,
            kind,
            Some(peer),
            self.protocol.initial_state(kind),
            self.protocol.new_data(kind),
            self.max_frame_len,
        );
        ctx.attach(writer_tx);
        if let Err(e) = self.protocol.on_open(&mut ctx) {
            tracing::warn!(protocol = P::NAME, channel = id, error = %e, "Failed to open channel");
            ctx.close();
        }
        tracing::debug!(protocol = P::NAME, channel = id, peer = %peer, kind = %kind, "Channel opened");
        self.channels.insert(id, ctx);
        self.readers.insert(id, reader);
    }

    fn on_data(&mut self, id: ChannelId, chunk: &[u8]) {
        let Some(ctx) = self.channels.get_mut(&id) else {
            return;
        };
        ctx.ingest(chunk);
        while !ctx.is_closing() {
            match ctx.next_frame() {
                Ok(Some(frame)) => {
                    self.table
                        .perform_transition(&mut self.protocol, ctx, Signal::Frame(frame));
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(protocol = P::NAME, channel = id, error = %e, "Undecodable input, closing");
                    ctx.close();
                }
            }
        }
    }

    fn resume(&mut self, ids: Vec<ChannelId>) {
        for id in ids {
            if let Some(ctx) = self.channels.get_mut(&id) {
                if !ctx.is_closing() {
                    self.table
                        .perform_transition(&mut self.protocol, ctx, Signal::Resume);
                }
            }
        }
    }

    fn service(&mut self) {
        let resume = self.protocol.poll(&mut self.channels);
        self.resume(resume);
        self.sweep();
    }

    /// Flush pending writes and drop channels marked as closing.
    fn sweep(&mut self) {
        let mut closed = Vec::new();
        for (id, ctx) in self.channels.iter_mut() {
            if !ctx.flush() {
                ctx.close();
            }
            if ctx.is_closing() {
                closed.push(*id);
            }
        }

        for id in closed {
            if let Some(mut ctx) = self.channels.remove(&id) {
                self.protocol.on_close(&mut ctx);
                ctx.flush();
                tracing::debug!(protocol = P::NAME, channel = id, "Channel closed");
            }
            if let Some(reader) = self.readers.remove(&id) {
                reader.abort();
            }
        }
    }
}

async fn read_loop<P: Protocol>(
    id: ChannelId,
    mut read_half: OwnedReadHalf,
    events: mpsc::UnboundedSender<Input<P>>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = events.send(Input::Eof(id, None));
                break;
            }
            Ok(_) => {
                if events.send(Input::Data(id, buf.split().freeze())).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = events.send(Input::Eof(id, Some(e.to_string())));
                break;
            }
        }
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            tracing::debug!(error = %e, "Channel write failed");
            return;
        }
    }
    let _ = write_half.shutdown().await;
}
