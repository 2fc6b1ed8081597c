//! Test harness for driver/node/client integration tests.
//!
//! Starts a driver on an ephemeral localhost port and attaches executor nodes and
//! clients to it.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use grid_lite::config::{ClientConfig, DriverConfig, LoadBalancerConfig, NodeConfig};
use grid_lite::management::ManagementHandle;
use grid_lite::{Driver, DriverHandle, GridClient, Node, TaskRegistry};

/// Driver configuration with a short tick for faster tests
pub fn test_driver_config(load_balancer: LoadBalancerConfig) -> DriverConfig {
    let mut config = DriverConfig::new("127.0.0.1:0".parse().unwrap())
        .with_load_balancer(load_balancer);
    config.tick_interval_ms = 20;
    config
}

/// Handle to a running executor node
pub struct TestNode {
    pub uuid: Uuid,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl TestNode {
    /// Drop the connection without any goodbye, as a crashed executor would
    pub fn kill(self) {
        self.handle.abort();
    }

    #[allow(dead_code)]
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A driver plus the nodes attached to it
pub struct TestGrid {
    pub driver: DriverHandle,
    pub nodes: Vec<TestNode>,
    shutdown: CancellationToken,
}

impl TestGrid {
    pub async fn start(config: DriverConfig) -> Self {
        let shutdown = CancellationToken::new();
        let driver = Driver::start(config, shutdown.clone())
            .await
            .expect("driver starts");
        Self {
            driver,
            nodes: Vec::new(),
            shutdown,
        }
    }

    /// Driver with a fixed bundle size
    pub async fn fixed(size: usize) -> Self {
        Self::start(test_driver_config(LoadBalancerConfig::Fixed { size })).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.driver.local_addr()
    }

    pub fn management(&self) -> &ManagementHandle {
        self.driver.management()
    }

    pub fn node_config(&self, threads: usize) -> NodeConfig {
        let mut config = NodeConfig::new(self.addr().to_string()).with_threads(threads);
        config.reconnect_min_ms = 50;
        config.reconnect_max_ms = 200;
        config
    }

    /// Attach a node with the builtin tasks
    pub async fn add_node(&mut self, threads: usize) -> Uuid {
        self.add_custom_node(self.node_config(threads), TaskRegistry::with_builtins())
            .await
    }

    /// Attach a node and wait until the driver lists it
    pub async fn add_custom_node(&mut self, config: NodeConfig, registry: TaskRegistry) -> Uuid {
        let uuid = config.uuid;
        let shutdown = self.shutdown.child_token();
        let node = Node::new(config, registry);
        let run = node.run(shutdown.clone());
        let handle = tokio::spawn(async move {
            let _ = run.await;
        });
        self.nodes.push(TestNode {
            uuid,
            shutdown,
            handle,
        });

        let management = self.management().clone();
        assert_eventually(
            || {
                let management = management.clone();
                async move {
                    management
                        .list_executors()
                        .await
                        .map(|list| list.iter().any(|e| e.uuid == uuid))
                        .unwrap_or(false)
                }
            },
            Duration::from_secs(5),
            "node should connect to the driver",
        )
        .await;
        uuid
    }

    pub fn take_node(&mut self, uuid: Uuid) -> Option<TestNode> {
        let index = self.nodes.iter().position(|n| n.uuid == uuid)?;
        Some(self.nodes.remove(index))
    }

    pub async fn client(&self) -> GridClient {
        GridClient::connect(ClientConfig::new(self.addr().to_string()))
            .await
            .expect("client connects")
    }

    pub async fn executor_count(&self) -> usize {
        self.management()
            .list_executors()
            .await
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

impl Drop for TestGrid {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Wait for a condition to become true
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "Condition not met within timeout: {}", message);
}
