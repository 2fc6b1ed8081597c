use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::Bundler;
use crate::config::ProportionalSettings;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    size: usize,
    elapsed: Duration,
}

/// Adapts the bundle size to the per-unit latency its executor reports.
///
/// Each observation scales the current size by `target_latency / mean_latency_per_unit`,
/// the mean taken over a sliding window bounded by sample count and age. The scaled
/// estimate is clamped to `[1, max_size]` and folded into the current size through an
/// exponential moving average, so sizes grow while units finish faster than the target
/// and shrink once executors fall behind it.
#[derive(Debug, Clone)]
pub struct ProportionalBundler {
    settings: ProportionalSettings,
    generation: u64,
    samples: VecDeque<Sample>,
    current: f64,
}

impl ProportionalBundler {
    pub fn new(settings: ProportionalSettings, generation: u64) -> Self {
        let current = settings.initial_size.clamp(1, settings.max_size.max(1)) as f64;
        Self {
            settings,
            generation,
            samples: VecDeque::new(),
            current,
        }
    }

    /// Same as [`Bundler::feedback`] with an explicit observation instant.
    pub fn feedback_at(&mut self, size: usize, elapsed: Duration, now: Instant) {
        if size == 0 {
            return;
        }
        self.samples.push_back(Sample {
            at: now,
            size,
            elapsed,
        });
        self.prune(now);
        self.recompute();
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    fn max(&self) -> f64 {
        self.settings.max_size.max(1) as f64
    }

    fn prune(&mut self, now: Instant) {
        while self.samples.len() > self.settings.window_size.max(1) {
            self.samples.pop_front();
        }
        let max_age = Duration::from_millis(self.settings.max_sample_age_ms);
        while self
            .samples
            .front()
            .is_some_and(|s| now.saturating_duration_since(s.at) > max_age)
        {
            self.samples.pop_front();
        }
    }

    fn recompute(&mut self) {
        let units: usize = self.samples.iter().map(|s| s.size).sum();
        if units == 0 {
            return;
        }
        let total: f64 = self.samples.iter().map(|s| s.elapsed.as_secs_f64()).sum();
        let per_unit = total / units as f64;
        let target = Duration::from_millis(self.settings.target_latency_ms).as_secs_f64();

        let estimate = if per_unit <= f64::EPSILON {
            self.max()
        } else {
            (self.current * target / per_unit).clamp(1.0, self.max())
        };
        let alpha = self.settings.smoothing;
        self.current = (alpha * estimate + (1.0 - alpha) * self.current).clamp(1.0, self.max());
    }
}

impl Bundler for ProportionalBundler {
    fn compute_size(&self) -> usize {
        (self.current.round() as usize).clamp(1, self.settings.max_size.max(1))
    }

    fn feedback(&mut self, size: usize, elapsed: Duration) {
        self.feedback_at(size, elapsed, Instant::now());
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn name(&self) -> &'static str {
        "proportional"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundler() -> ProportionalBundler {
        ProportionalBundler::new(ProportionalSettings::default(), 0)
    }

    #[test]
    fn starts_at_initial_size() {
        assert_eq!(bundler().compute_size(), 5);
    }

    #[test]
    fn window_is_bounded_by_count() {
        let mut b = bundler();
        let now = Instant::now();
        for _ in 0..50 {
            b.feedback_at(5, Duration::from_millis(100), now);
        }
        assert_eq!(b.sample_count(), 20);
    }

    #[test]
    fn old_samples_are_discarded() {
        let mut b = bundler();
        let start = Instant::now();
        b.feedback_at(5, Duration::from_millis(100), start);
        b.feedback_at(5, Duration::from_millis(100), start + Duration::from_secs(61));
        assert_eq!(b.sample_count(), 1);
    }

    #[test]
    fn zero_size_feedback_ignored() {
        let mut b = bundler();
        b.feedback(0, Duration::from_secs(1));
        assert_eq!(b.sample_count(), 0);
        assert_eq!(b.compute_size(), 5);
    }

    fn unsmoothed(target_latency_ms: u64) -> ProportionalBundler {
        ProportionalBundler::new(
            ProportionalSettings {
                target_latency_ms,
                smoothing: 1.0,
                ..ProportionalSettings::default()
            },
            0,
        )
    }

    #[test]
    fn scales_current_size_by_latency_ratio() {
        let mut b = unsmoothed(100);
        let now = Instant::now();
        // 50ms per unit against a 100ms target doubles the size
        b.feedback_at(5, Duration::from_millis(250), now);
        assert_eq!(b.compute_size(), 10);
        b.feedback_at(10, Duration::from_millis(500), now);
        assert_eq!(b.compute_size(), 20);
    }

    #[test]
    fn slower_units_shrink_the_size() {
        let mut b = unsmoothed(100);
        // 400ms per unit against a 100ms target quarters it
        b.feedback_at(5, Duration::from_secs(2), Instant::now());
        assert_eq!(b.compute_size(), 1);

        let mut b = unsmoothed(100);
        b.current = 40.0;
        b.feedback_at(5, Duration::from_secs(1), Instant::now());
        assert_eq!(b.compute_size(), 20);
    }

    #[test]
    fn smoothing_moves_part_way() {
        let mut b = ProportionalBundler::new(
            ProportionalSettings {
                target_latency_ms: 100,
                smoothing: 0.5,
                ..ProportionalSettings::default()
            },
            0,
        );
        // Estimate 10 from a current size of 5, halfway there is 7.5
        b.feedback_at(5, Duration::from_millis(250), Instant::now());
        assert_eq!(b.compute_size(), 8);
    }

    #[test]
    fn settles_when_latency_matches_target() {
        let mut b = unsmoothed(100);
        let now = Instant::now();
        for _ in 0..10 {
            b.feedback_at(5, Duration::from_millis(500), now);
        }
        assert_eq!(b.compute_size(), 5);
    }
}
