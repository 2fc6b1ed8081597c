use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::frame::DEFAULT_MAX_FRAME_LEN;

/// Job queue behavior.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of jobs held at once; admissions beyond this are rejected.
    pub max_jobs: usize,
    /// Rotate equal-priority jobs after each dispatch so one job cannot hold the head
    /// of its priority band. When false, equal priorities are served in strict FIFO order.
    pub fair_rotation: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_jobs: 10_000,
            fair_rotation: true,
        }
    }
}

/// Settings for the adaptive bundler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProportionalSettings {
    /// Upper bound of any recommendation.
    pub max_size: usize,
    /// Recommendation used before the first feedback.
    pub initial_size: usize,
    /// Per-unit latency the bundle size is steered toward.
    pub target_latency_ms: u64,
    /// Maximum number of samples kept in the sliding window.
    pub window_size: usize,
    /// Samples older than this are discarded.
    pub max_sample_age_ms: u64,
    /// Weight of the newest estimate in the moving average, in (0, 1].
    pub smoothing: f64,
}

impl Default for ProportionalSettings {
    fn default() -> Self {
        Self {
            max_size: 100,
            initial_size: 5,
            target_latency_ms: 100,
            window_size: 20,
            max_sample_age_ms: 60_000,
            smoothing: 0.3,
        }
    }
}

/// Load-balancing algorithm and its parameters.
///
/// Replaced at runtime through the management channel; each replacement bumps the
/// bundler factory generation so channels pick up fresh bundlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LoadBalancerConfig {
    Fixed { size: usize },
    Proportional(ProportionalSettings),
    NodeThreads { multiplier: usize, max_size: usize },
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        LoadBalancerConfig::Proportional(ProportionalSettings::default())
    }
}

impl LoadBalancerConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            LoadBalancerConfig::Fixed { size } if *size == 0 => {
                Err("fixed bundle size must be at least 1".to_string())
            }
            LoadBalancerConfig::Proportional(s) => {
                if s.max_size == 0 || s.initial_size == 0 || s.window_size == 0 {
                    Err("proportional sizes and window must be at least 1".to_string())
                } else if !(s.smoothing > 0.0 && s.smoothing <= 1.0) {
                    Err("smoothing must be in (0, 1]".to_string())
                } else if s.target_latency_ms == 0 {
                    Err("target latency must be positive".to_string())
                } else {
                    Ok(())
                }
            }
            LoadBalancerConfig::NodeThreads {
                multiplier,
                max_size,
            } if *multiplier == 0 || *max_size == 0 => {
                Err("node threads multiplier and max size must be at least 1".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub uuid: Uuid,
    /// Single port shared by every channel family.
    pub listen_addr: SocketAddr,
    /// HTTP management endpoint, disabled when `None`.
    pub management_addr: Option<SocketAddr>,
    pub queue: QueueConfig,
    pub load_balancer: LoadBalancerConfig,
    pub max_frame_len: usize,
    /// Period of the housekeeping tick of every multiplexer loop.
    pub tick_interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 11111)),
            management_addr: None,
            queue: QueueConfig::default(),
            load_balancer: LoadBalancerConfig::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            tick_interval_ms: 100,
        }
    }
}

impl DriverConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_management(mut self, addr: SocketAddr) -> Self {
        self.management_addr = Some(addr);
        self
    }

    pub fn with_load_balancer(mut self, load_balancer: LoadBalancerConfig) -> Self {
        self.load_balancer = load_balancer;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

/// Executor-side execution settings.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Size of the worker pool.
    pub processing_threads: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            processing_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub uuid: Uuid,
    /// Driver acceptor address, host:port.
    pub driver_addr: String,
    pub execution: ExecutionConfig,
    /// Announce this executor as another dispatcher rather than a leaf executor.
    pub is_peer: bool,
    /// Free-form properties reported in the system information snapshot.
    pub properties: HashMap<String, String>,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_frame_len: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            driver_addr: "127.0.0.1:11111".to_string(),
            execution: ExecutionConfig::default(),
            is_peer: false,
            properties: HashMap::new(),
            reconnect_min_ms: 200,
            reconnect_max_ms: 2_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl NodeConfig {
    pub fn new(driver_addr: impl Into<String>) -> Self {
        Self {
            driver_addr: driver_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.execution.processing_threads = threads.max(1);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub uuid: Uuid,
    pub driver_addr: String,
    pub max_frame_len: usize,
}

impl ClientConfig {
    pub fn new(driver_addr: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            driver_addr: driver_addr.into(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}
