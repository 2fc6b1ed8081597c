//! Load balancing: how many units go to an executor in one bundle.
//!
//! Every channel owns one bundler. The shared [`BundlerFactory`] holds the active
//! configuration; replacing it bumps the factory generation, and the dispatch layer swaps
//! out any bundler created under an older generation before asking it for a size.

mod fixed;
mod node_threads;
mod proportional;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::LoadBalancerConfig;
use crate::error::{GridError, Result};
use crate::scheduler::policy::ExecutorInfo;

pub use fixed::FixedBundler;
pub use node_threads::NodeThreadsBundler;
pub use proportional::ProportionalBundler;

pub trait Bundler: Send + fmt::Debug {
    /// Recommended number of units for the next bundle. Depends only on stored history.
    fn compute_size(&self) -> usize;

    /// Record that a bundle of `size` units took `elapsed` on the executor.
    fn feedback(&mut self, size: usize, elapsed: Duration);

    /// Factory generation this bundler was created under.
    fn generation(&self) -> u64;

    fn name(&self) -> &'static str;
}

/// Final bundle size: the recommendation capped by the job's SLA override and the number
/// of units that can actually be dispatched, never below 1.
pub fn clamp_size(recommended: usize, max_bundle_size: Option<usize>, dispatchable: usize) -> usize {
    let mut size = recommended;
    if let Some(max) = max_bundle_size {
        size = size.min(max);
    }
    size.min(dispatchable).max(1)
}

#[derive(Debug)]
pub struct BundlerFactory {
    config: RwLock<LoadBalancerConfig>,
    generation: AtomicU64,
}

impl BundlerFactory {
    pub fn new(config: LoadBalancerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            generation: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn config(&self) -> LoadBalancerConfig {
        self.config.read().clone()
    }

    pub fn create(&self, executor: &ExecutorInfo) -> Box<dyn Bundler> {
        let config = self.config.read();
        let generation = self.generation();
        match &*config {
            LoadBalancerConfig::Fixed { size } => Box::new(FixedBundler::new(*size, generation)),
            LoadBalancerConfig::Proportional(settings) => {
                Box::new(ProportionalBundler::new(settings.clone(), generation))
            }
            LoadBalancerConfig::NodeThreads {
                multiplier,
                max_size,
            } => Box::new(NodeThreadsBundler::new(
                executor.system_info.processing_threads,
                *multiplier,
                *max_size,
                generation,
            )),
        }
    }

    /// Swap the active configuration. Returns the new generation.
    pub fn replace(&self, config: LoadBalancerConfig) -> Result<u64> {
        config.validate().map_err(GridError::InvalidConfig)?;
        let mut current = self.config.write();
        *current = config;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(generation, "Load balancer configuration replaced");
        Ok(generation)
    }

    pub fn is_stale(&self, bundler: &dyn Bundler) -> bool {
        bundler.generation() != self.generation()
    }
}
