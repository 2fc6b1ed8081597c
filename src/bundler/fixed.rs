use std::time::Duration;

use super::Bundler;

/// Always recommends the same size.
#[derive(Debug, Clone)]
pub struct FixedBundler {
    size: usize,
    generation: u64,
}

impl FixedBundler {
    pub fn new(size: usize, generation: u64) -> Self {
        Self {
            size: size.max(1),
            generation,
        }
    }
}

impl Bundler for FixedBundler {
    fn compute_size(&self) -> usize {
        self.size
    }

    fn feedback(&mut self, _size: usize, _elapsed: Duration) {}

    fn generation(&self) -> u64 {
        self.generation
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}
