use std::time::Duration;

use super::Bundler;

/// Sizes bundles from the executor's reported worker pool: threads × multiplier.
#[derive(Debug, Clone)]
pub struct NodeThreadsBundler {
    size: usize,
    generation: u64,
}

impl NodeThreadsBundler {
    pub fn new(threads: usize, multiplier: usize, max_size: usize, generation: u64) -> Self {
        let size = threads
            .max(1)
            .saturating_mul(multiplier)
            .clamp(1, max_size.max(1));
        Self { size, generation }
    }
}

impl Bundler for NodeThreadsBundler {
    fn compute_size(&self) -> usize {
        self.size
    }

    fn feedback(&mut self, _size: usize, _elapsed: Duration) {}

    fn generation(&self) -> u64 {
        self.generation
    }

    fn name(&self) -> &'static str {
        "node_threads"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threads_times_multiplier() {
        assert_eq!(NodeThreadsBundler::new(4, 3, 100, 0).compute_size(), 12);
    }

    #[test]
    fn capped_and_floored() {
        assert_eq!(NodeThreadsBundler::new(64, 4, 50, 0).compute_size(), 50);
        // Executors that report no threads still get one unit
        assert_eq!(NodeThreadsBundler::new(0, 1, 50, 0).compute_size(), 1);
    }
}
