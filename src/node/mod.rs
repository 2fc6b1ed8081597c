//! Executor node: connects to the driver, runs dispatched bundles and streams results back.

pub mod execution;
pub mod resources;
pub mod task;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::{SplitStream, StreamExt};
use futures::SinkExt;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::{GridError, Result};
use crate::protocol::{
    decode_json, encode_json, BundleHeader, BundleKind, BundleParams, ChannelKind, FrameCodec,
    SystemInfo, MAX_PREALLOCATED_UNITS,
};
use crate::scheduler::job::Unit;

pub use execution::{ExecutionBundle, ExecutionManager};
pub use resources::ResourceClient;
pub use task::{ResourceAccess, Task, TaskContext, TaskRegistry};

type FrameStream = SplitStream<Framed<TcpStream, FrameCodec>>;

/// Frames waiting for the writer; result senders wait once it fills.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

struct Connection {
    framed: Framed<TcpStream, FrameCodec>,
    driver_uuid: Option<Uuid>,
    resources: Option<Arc<ResourceClient>>,
}

/// An executor attached to one driver.
pub struct Node {
    config: NodeConfig,
    execution: ExecutionManager,
}

impl Node {
    pub fn new(config: NodeConfig, registry: TaskRegistry) -> Self {
        let execution = ExecutionManager::new(&config.execution, Arc::new(registry));
        Self { config, execution }
    }

    pub fn uuid(&self) -> Uuid {
        self.config.uuid
    }

    pub fn execution(&self) -> &ExecutionManager {
        &self.execution
    }

    fn system_info(&self) -> SystemInfo {
        SystemInfo::collect(
            self.execution.thread_pool_size(),
            self.config.properties.clone(),
        )
    }

    /// Serve the driver until shutdown, reconnecting with jittered exponential backoff
    /// whenever the connection drops.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let min_delay = self.config.reconnect_min_ms.max(1);
        let max_delay = self.config.reconnect_max_ms.max(min_delay);
        let mut delay = min_delay;

        while !shutdown.is_cancelled() {
            match self.connect().await {
                Ok(conn) => {
                    delay = min_delay;
                    if let Err(e) = self.serve(conn, &shutdown).await {
                        tracing::warn!(node = %self.config.uuid, error = %e, "Driver connection lost");
                    }
                    let cancelled = self.execution.cancel_all();
                    if cancelled > 0 {
                        tracing::info!(units = cancelled, "Cancelled units of the lost connection");
                    }
                }
                Err(e) => {
                    tracing::debug!(addr = %self.config.driver_addr, error = %e, "Driver not reachable");
                }
            }
            if shutdown.is_cancelled() {
                break;
            }

            let jitter = rand::thread_rng().gen_range(0..=delay / 2);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(delay + jitter)) => {}
            }
            delay = (delay * 2).min(max_delay);
        }

        tracing::info!(node = %self.config.uuid, "Node stopped");
        Ok(())
    }

    async fn connect(&self) -> Result<Connection> {
        let stream = TcpStream::connect(&self.config.driver_addr).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, FrameCodec::new(self.config.max_frame_len));
        framed.send(ChannelKind::NodeJob.identifier_frame()).await?;

        // The driver opens the handshake
        let frame = framed.next().await.ok_or(GridError::ChannelClosed)??;
        let header: BundleHeader = decode_json(&frame)?;
        header.expect_kind(BundleKind::Handshake)?;

        let reply = BundleHeader::new(BundleKind::Handshake).with_params(BundleParams {
            node_uuid: Some(self.config.uuid),
            is_peer: Some(self.config.is_peer),
            system_info: Some(self.system_info()),
            thread_pool_size: Some(self.execution.thread_pool_size()),
            ..BundleParams::default()
        });
        framed.send(encode_json(&reply)?).await?;

        let resources = match ResourceClient::connect(
            &self.config.driver_addr,
            self.config.uuid,
            self.config.max_frame_len,
        )
        .await
        {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!(error = %e, "Resource channel unavailable");
                None
            }
        };

        tracing::info!(
            node = %self.config.uuid,
            driver = ?header.params.driver_uuid,
            threads = self.execution.thread_pool_size(),
            "Connected to driver"
        );
        Ok(Connection {
            framed,
            driver_uuid: header.params.driver_uuid,
            resources,
        })
    }

    async fn serve(&self, conn: Connection, shutdown: &CancellationToken) -> Result<()> {
        let (mut sink, mut stream) = conn.framed.split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_DEPTH);

        // Bundles still running hold senders; the socket must close with this future anyway
        let connection = shutdown.child_token();
        let _close_on_exit = connection.clone().drop_guard();
        let writer = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = connection.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!(error = %e, "Failed to write to driver");
                    break;
                }
            }
        });

        let result = loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => break Err(e),
                    None => break Err(GridError::ChannelClosed),
                },
            };
            let header: BundleHeader = match decode_json(&frame) {
                Ok(header) => header,
                Err(e) => break Err(e),
            };
            let handled = match header.kind {
                BundleKind::Dispatch => self.dispatch(header, &mut stream, &conn.resources, &tx).await,
                BundleKind::Notification => self.notify(&header.params, &tx).await,
                other => Err(GridError::protocol(format!(
                    "unexpected {other:?} header from driver"
                ))),
            };
            if let Err(e) = handled {
                break Err(e);
            }
        };

        tracing::debug!(driver = ?conn.driver_uuid, "Closing driver connection");
        drop(tx);
        writer.abort();
        result
    }

    /// Read the rest of a dispatch and run it in the background.
    async fn dispatch(
        &self,
        header: BundleHeader,
        stream: &mut FrameStream,
        resources: &Option<Arc<ResourceClient>>,
        tx: &mpsc::Sender<Bytes>,
    ) -> Result<()> {
        let job_id = header
            .job_id
            .ok_or_else(|| GridError::protocol("dispatch without job id"))?;
        let data = next_frame(stream).await?;
        let mut units = Vec::with_capacity(header.unit_count.min(MAX_PREALLOCATED_UNITS));
        for _ in 0..header.unit_count {
            units.push(decode_json::<Unit>(&next_frame(stream).await?)?);
        }
        tracing::debug!(
            job_id = %job_id,
            bundle_id = header.bundle_id,
            units = units.len(),
            requeue = header.params.job_requeue,
            "Bundle received"
        );

        let bundle = ExecutionBundle {
            job_id,
            data,
            units,
            resources: match (resources, header.params.client_uuid) {
                (Some(client), Some(submitter)) => {
                    Some(ResourceAccess::new(client.clone(), submitter))
                }
                _ => None,
            },
        };
        let execution = self.execution.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let joined = tokio::spawn({
                let execution = execution.clone();
                async move { execution.execute(bundle).await }
            })
            .await;

            let mut reply = BundleHeader::new(BundleKind::Results);
            reply.bundle_id = header.bundle_id;
            reply.job_id = Some(job_id);
            reply.params.node_bundle_elapsed = Some(started.elapsed().as_millis() as u64);
            let results = match joined {
                Ok(results) => results,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Bundle execution failed");
                    reply.params.node_exception = Some(e.to_string());
                    Vec::new()
                }
            };
            reply.unit_count = results.len();

            let frames: Result<Vec<Bytes>> = std::iter::once(encode_json(&reply))
                .chain(results.iter().map(encode_json))
                .collect();
            match frames {
                Ok(frames) => {
                    for frame in frames {
                        if tx.send(frame).await.is_err() {
                            tracing::debug!(job_id = %job_id, "Connection gone before results were sent");
                            break;
                        }
                    }
                }
                Err(e) => tracing::error!(job_id = %job_id, error = %e, "Failed to encode results"),
            }
        });
        Ok(())
    }

    async fn notify(&self, params: &BundleParams, tx: &mpsc::Sender<Bytes>) -> Result<()> {
        if let Some(job_id) = params.cancel_job {
            let cancelled = self.execution.cancel_job(job_id);
            tracing::info!(job_id = %job_id, units = cancelled, expired = params.job_expired, "Job cancelled by driver");
        }
        if let Some(size) = params.thread_pool_size {
            self.execution.set_thread_pool_size(size);
            let update = BundleHeader::new(BundleKind::Notification).with_params(BundleParams {
                node_uuid: Some(self.config.uuid),
                system_info: Some(self.system_info()),
                thread_pool_size: Some(self.execution.thread_pool_size()),
                ..BundleParams::default()
            });
            tx.send(encode_json(&update)?)
                .await
                .map_err(|_| GridError::ChannelClosed)?;
        }
        Ok(())
    }
}

async fn next_frame(stream: &mut FrameStream) -> Result<Bytes> {
    stream.next().await.ok_or(GridError::ChannelClosed)?
}
