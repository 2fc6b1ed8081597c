//! Submitter library: send jobs to a driver and collect their reports.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{GridError, Result};
use crate::protocol::{
    decode_json, encode_json, BundleParams, ChannelKind, ClientMessage, DriverMessage, FrameCodec,
    ResourceMessage,
};
use crate::scheduler::{Job, JobReport};

type FramedStream = Framed<TcpStream, FrameCodec>;

/// Serves named resources to executors working on this client's jobs.
pub trait ResourceProvider: Send + Sync {
    fn provide(&self, name: &str) -> Option<Vec<u8>>;
}

impl ResourceProvider for HashMap<String, Vec<u8>> {
    fn provide(&self, name: &str) -> Option<Vec<u8>> {
        self.get(name).cloned()
    }
}

struct Submission {
    accepted: Option<oneshot::Sender<Result<bool>>>,
    report: Option<oneshot::Sender<JobReport>>,
}

#[derive(Default)]
struct Pending {
    submissions: HashMap<Uuid, Submission>,
    cancels: HashMap<Uuid, Vec<oneshot::Sender<bool>>>,
}

struct Inner {
    uuid: Uuid,
    driver_uuid: Option<Uuid>,
    writer: mpsc::UnboundedSender<Bytes>,
    pending: Mutex<Pending>,
}

impl Inner {
    fn send(&self, message: &ClientMessage) -> Result<()> {
        self.send_frame(encode_json(message)?)
    }

    fn send_frame(&self, frame: Bytes) -> Result<()> {
        self.writer.send(frame).map_err(|_| GridError::ChannelClosed)
    }
}

/// Connection of one submitter to a driver.
pub struct GridClient {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

impl GridClient {
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let framed = open(&config, ChannelKind::ClientJob).await?;
        let (mut sink, mut stream) = framed.split();

        let frame = stream.next().await.ok_or(GridError::ChannelClosed)??;
        let driver_uuid = match decode_json::<DriverMessage>(&frame)? {
            DriverMessage::Handshake { params } => params.driver_uuid,
            other => {
                return Err(GridError::protocol(format!(
                    "expected driver handshake, got {other:?}"
                )))
            }
        };
        sink.send(encode_json(&ClientMessage::Handshake {
            params: BundleParams {
                client_uuid: Some(config.uuid),
                ..BundleParams::default()
            },
        })?)
        .await?;

        let (writer, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            uuid: config.uuid,
            driver_uuid,
            writer,
            pending: Mutex::new(Pending::default()),
        });
        tracing::info!(client = %config.uuid, driver = ?driver_uuid, "Connected to driver");

        let tasks = vec![
            tokio::spawn(write_loop(sink, rx)),
            tokio::spawn(read_loop(stream, inner.clone())),
        ];
        Ok(Self { inner, tasks })
    }

    /// Connect and also serve resources from `provider` to executors running this
    /// client's units.
    pub async fn connect_with_resources(
        config: ClientConfig,
        provider: Arc<dyn ResourceProvider>,
    ) -> Result<Self> {
        let mut resources = open(&config, ChannelKind::ClientResource).await?;
        resources
            .send(encode_json(&ResourceMessage::Hello { uuid: config.uuid })?)
            .await?;

        let mut client = Self::connect(config).await?;
        client
            .tasks
            .push(tokio::spawn(serve_resources(resources, provider)));
        Ok(client)
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn driver_uuid(&self) -> Option<Uuid> {
        self.inner.driver_uuid
    }

    /// Submit a job and wait for the driver to admit it.
    pub async fn submit(&self, job: Job) -> Result<JobHandle> {
        let job_id = job.id;
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (report_tx, report_rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            if pending.submissions.contains_key(&job_id) {
                return Err(GridError::DuplicateJob(job_id));
            }
            pending.submissions.insert(
                job_id,
                Submission {
                    accepted: Some(accepted_tx),
                    report: Some(report_tx),
                },
            );
        }

        let sent = self.send_job(&job);
        if let Err(e) = sent {
            self.inner.pending.lock().submissions.remove(&job_id);
            return Err(e);
        }

        let pending = accepted_rx.await.map_err(|_| GridError::ChannelClosed)??;
        tracing::debug!(job_id = %job_id, pending, "Job accepted");
        Ok(JobHandle {
            job_id,
            pending,
            report: report_rx,
            inner: self.inner.clone(),
        })
    }

    fn send_job(&self, job: &Job) -> Result<()> {
        self.inner.send(&ClientMessage::Submit {
            header: job.header(),
        })?;
        self.inner.send_frame(Bytes::from(job.data.clone()))?;
        for unit in &job.units {
            self.inner.send_frame(encode_json(unit)?)?;
        }
        Ok(())
    }
}

impl Drop for GridClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// An admitted job.
pub struct JobHandle {
    job_id: Uuid,
    pending: bool,
    report: oneshot::Receiver<JobReport>,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.job_id)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Whether the job was admitted ahead of its start time.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Wait for the job's final report.
    pub async fn wait(self) -> Result<JobReport> {
        self.report.await.map_err(|_| GridError::ChannelClosed)
    }

    /// Cancel the job. The report still arrives through [`JobHandle::wait`] with
    /// `cancelled` set.
    pub async fn cancel(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .cancels
            .entry(self.job_id)
            .or_default()
            .push(tx);
        self.inner.send(&ClientMessage::Cancel {
            job_id: self.job_id,
        })?;
        if rx.await.map_err(|_| GridError::ChannelClosed)? {
            Ok(())
        } else {
            Err(GridError::JobNotFound(self.job_id))
        }
    }
}

async fn open(config: &ClientConfig, kind: ChannelKind) -> Result<FramedStream> {
    let stream = TcpStream::connect(&config.driver_addr).await?;
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, FrameCodec::new(config.max_frame_len));
    framed.send(kind.identifier_frame()).await?;
    Ok(framed)
}

async fn write_loop(
    mut sink: SplitSink<FramedStream, Bytes>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            tracing::warn!(error = %e, "Failed to write to driver");
            return;
        }
    }
}

async fn read_loop(mut stream: SplitStream<FramedStream>, inner: Arc<Inner>) {
    while let Some(frame) = stream.next().await {
        let message = match frame.and_then(|f| decode_json::<DriverMessage>(&f)) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Driver channel failed");
                break;
            }
        };
        let mut pending = inner.pending.lock();
        match message {
            DriverMessage::Accepted { job_id, params } => {
                if let Some(tx) = pending
                    .submissions
                    .get_mut(&job_id)
                    .and_then(|s| s.accepted.take())
                {
                    let _ = tx.send(Ok(params.job_pending));
                }
            }
            DriverMessage::Rejected { job_id, reason } => {
                if let Some(mut submission) = pending.submissions.remove(&job_id) {
                    if let Some(tx) = submission.accepted.take() {
                        let _ = tx.send(Err(GridError::Rejected { job_id, reason }));
                    }
                }
            }
            DriverMessage::CancelAck { job_id, found } => {
                if let Some(waiters) = pending.cancels.remove(&job_id) {
                    for tx in waiters {
                        let _ = tx.send(found);
                    }
                }
            }
            DriverMessage::Report { report } => {
                tracing::debug!(job_id = %report.job_id, cancelled = report.cancelled, "Job report received");
                if let Some(mut submission) = pending.submissions.remove(&report.job_id) {
                    if let Some(tx) = submission.report.take() {
                        let _ = tx.send(report);
                    }
                }
            }
            DriverMessage::Handshake { .. } => {
                tracing::debug!("Ignoring repeated driver handshake");
            }
        }
    }

    // Dropping the senders wakes every waiter with ChannelClosed
    let mut pending = inner.pending.lock();
    pending.submissions.clear();
    pending.cancels.clear();
    tracing::info!(client = %inner.uuid, "Disconnected from driver");
}

async fn serve_resources(mut conn: FramedStream, provider: Arc<dyn ResourceProvider>) {
    while let Some(frame) = conn.next().await {
        let request = match frame.and_then(|f| decode_json::<ResourceMessage>(&f)) {
            Ok(ResourceMessage::Request {
                request_id,
                submitter,
                name,
            }) => (request_id, submitter, name),
            Ok(other) => {
                tracing::debug!(message = ?other, "Ignoring unexpected resource message");
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Resource channel failed");
                return;
            }
        };
        let (request_id, submitter, name) = request;
        let data = provider.provide(&name);
        tracing::debug!(name = %name, found = data.is_some(), "Serving resource");
        let response = ResourceMessage::Response {
            request_id,
            submitter,
            name,
            data,
        };
        let sent = match encode_json(&response) {
            Ok(frame) => conn.send(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "Failed to answer resource request");
            return;
        }
    }
}
