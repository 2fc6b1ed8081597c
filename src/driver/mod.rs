//! The driver: accepts submitters and executors on one port, queues jobs and dispatches
//! their units in bundles.

pub mod client_protocol;
pub mod node_protocol;
pub mod resource_protocol;
pub mod stats;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bundler::BundlerFactory;
use crate::config::DriverConfig;
use crate::error::{GridError, Result};
use crate::management::{self, ManagementHandle};
use crate::protocol::ChannelKind;
use crate::scheduler::{Job, JobQueue, JobReport, ResultsCollector};
use crate::transport::{run_acceptor, Multiplexer, MultiplexerHandle, Routes};

pub use client_protocol::{ClientCommand, ClientProtocol};
pub use node_protocol::{ExecutorSummary, NodeCommand, NodeProtocol};
pub use resource_protocol::ResourceProtocol;
pub use stats::{Statistics, StatsSnapshot};

/// State shared by the driver's multiplexers and its management surface.
#[derive(Debug)]
pub struct DriverState {
    pub uuid: Uuid,
    pub queue: Mutex<JobQueue>,
    pub bundlers: BundlerFactory,
    pub stats: Statistics,
}

impl DriverState {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            uuid: config.uuid,
            queue: Mutex::new(JobQueue::new(config.queue.clone())),
            bundlers: BundlerFactory::new(config.load_balancer.clone()),
            stats: Statistics::default(),
        }
    }

    /// Admit a job into the queue. The collector receives the final report once.
    pub fn admit(
        self: &Arc<Self>,
        job: Job,
        submitter: Option<Uuid>,
        collector: ResultsCollector,
    ) -> Result<()> {
        let state = Arc::downgrade(self);
        let collector: ResultsCollector = Box::new(move |report: JobReport| {
            if let Some(state) = state.upgrade() {
                state.stats.job_finished(report.cancelled);
            }
            collector(report);
        });
        let job_id = job.id;
        self.queue.lock().admit(job, submitter, collector)?;
        self.stats.job_admitted();
        tracing::info!(job_id = %job_id, submitter = ?submitter, "Job queued");
        Ok(())
    }

    /// Cancel a queued job. Returns the executors still holding its units.
    pub fn cancel_job(&self, job_id: Uuid) -> Result<Vec<Uuid>> {
        self.queue.lock().cancel(job_id)
    }
}

/// A running driver.
pub struct DriverHandle {
    local_addr: SocketAddr,
    management_addr: Option<SocketAddr>,
    management: ManagementHandle,
    state: Arc<DriverState>,
    tasks: Vec<JoinHandle<()>>,
}

impl DriverHandle {
    /// Address the acceptor is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn management_addr(&self) -> Option<SocketAddr> {
        self.management_addr
    }

    pub fn management(&self) -> &ManagementHandle {
        &self.management
    }

    pub fn state(&self) -> &Arc<DriverState> {
        &self.state
    }

    /// Wait for every driver task to stop after the shutdown token fires.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

pub struct Driver;

impl Driver {
    /// Bind the listener and start the multiplexers, the acceptor and the management
    /// server. Everything stops when `shutdown` is cancelled.
    pub async fn start(config: DriverConfig, shutdown: CancellationToken) -> Result<DriverHandle> {
        config
            .load_balancer
            .validate()
            .map_err(GridError::InvalidConfig)?;

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| GridError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(DriverState::new(&config));
        let tick = Duration::from_millis(config.tick_interval_ms.max(1));

        let (node_handle, node_inbox) = MultiplexerHandle::<NodeProtocol>::channel();
        let (client_handle, client_inbox) = MultiplexerHandle::<ClientProtocol>::channel();
        let (resource_handle, resource_inbox) = MultiplexerHandle::<ResourceProtocol>::channel();

        let nodes = Multiplexer::new(
            NodeProtocol::new(state.clone()),
            &node_handle,
            config.max_frame_len,
            tick,
        );
        let clients = Multiplexer::new(
            ClientProtocol::new(state.clone(), client_handle.clone(), node_handle.clone()),
            &client_handle,
            config.max_frame_len,
            tick,
        );
        let resources = Multiplexer::new(
            ResourceProtocol::new(),
            &resource_handle,
            config.max_frame_len,
            tick,
        );

        let routes = Routes::new()
            .route(ChannelKind::ClientJob, client_handle)
            .route(ChannelKind::NodeJob, node_handle.clone())
            .route(ChannelKind::ClientResource, resource_handle.clone())
            .route(ChannelKind::NodeResource, resource_handle);

        let mut tasks = vec![
            tokio::spawn(nodes.run(node_inbox, shutdown.clone())),
            tokio::spawn(clients.run(client_inbox, shutdown.clone())),
            tokio::spawn(resources.run(resource_inbox, shutdown.clone())),
            tokio::spawn(run_acceptor(listener, routes, shutdown.clone())),
        ];

        let management = ManagementHandle::new(state.clone(), node_handle);
        let management_addr = match config.management_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|source| GridError::Bind { addr, source })?;
                let bound = listener.local_addr()?;
                tasks.push(tokio::spawn(management::serve(
                    listener,
                    management.clone(),
                    shutdown.clone(),
                )));
                Some(bound)
            }
            None => None,
        };

        tracing::info!(
            driver = %state.uuid,
            addr = %local_addr,
            management = ?management_addr,
            "Driver started"
        );

        Ok(DriverHandle {
            local_addr,
            management_addr,
            management,
            state,
            tasks,
        })
    }
}
