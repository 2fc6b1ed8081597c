use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{GridError, Result};
use crate::protocol::ChannelKind;
use crate::transport::multiplexer::MultiplexerHandle;
use crate::transport::state::Protocol;

const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Destination for identified connections.
pub trait ChannelSink: Send + Sync {
    fn open(&self, stream: TcpStream, peer: SocketAddr, kind: ChannelKind) -> Result<()>;
}

impl<P: Protocol> ChannelSink for MultiplexerHandle<P> {
    fn open(&self, stream: TcpStream, peer: SocketAddr, kind: ChannelKind) -> Result<()> {
        MultiplexerHandle::open(self, stream, peer, kind)
    }
}

/// Single listening port shared by every channel family.
#[derive(Clone, Default)]
pub struct Routes {
    sinks: HashMap<ChannelKind, Arc<dyn ChannelSink>>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, kind: ChannelKind, sink: impl ChannelSink + 'static) -> Self {
        self.sinks.insert(kind, Arc::new(sink));
        self
    }

    fn get(&self, kind: ChannelKind) -> Option<Arc<dyn ChannelSink>> {
        self.sinks.get(&kind).cloned()
    }
}

/// Accept connections until shutdown, handing each to the multiplexer named by its
/// identifier frame.
pub async fn run_acceptor(listener: TcpListener, routes: Routes, shutdown: CancellationToken) {
    let local = listener.local_addr().ok();
    tracing::info!(addr = ?local, "Acceptor listening");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        let routes = routes.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(IDENTIFY_TIMEOUT, identify(stream)).await {
                Ok(Ok((stream, kind))) => match routes.get(kind) {
                    Some(sink) => {
                        if let Err(e) = sink.open(stream, peer, kind) {
                            tracing::warn!(peer = %peer, kind = %kind, error = %e, "Multiplexer unavailable");
                        }
                    }
                    None => tracing::warn!(peer = %peer, kind = %kind, "No route for channel kind"),
                },
                Ok(Err(e)) => tracing::debug!(peer = %peer, error = %e, "Connection rejected"),
                Err(_) => tracing::debug!(peer = %peer, "Connection did not identify in time"),
            }
        });
    }

    tracing::info!("Acceptor stopped");
}

/// Read exactly the identifier frame, leaving any following bytes in the socket.
async fn identify(mut stream: TcpStream) -> Result<(TcpStream, ChannelKind)> {
    let len = stream.read_u32().await? as usize;
    if len != 4 {
        return Err(GridError::protocol(format!(
            "identifier frame of {len} bytes"
        )));
    }
    let mut id = [0u8; 4];
    stream.read_exact(&mut id).await?;
    let kind = ChannelKind::parse_identifier(&id)?;
    Ok((stream, kind))
}
