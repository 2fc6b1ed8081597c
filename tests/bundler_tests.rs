use std::time::{Duration, Instant};

use rand::Rng;
use uuid::Uuid;

use grid_lite::bundler::{clamp_size, Bundler, BundlerFactory, ProportionalBundler};
use grid_lite::config::{LoadBalancerConfig, ProportionalSettings};
use grid_lite::error::GridError;
use grid_lite::scheduler::ExecutorInfo;

fn settings(max_size: usize) -> ProportionalSettings {
    ProportionalSettings {
        max_size,
        ..ProportionalSettings::default()
    }
}

#[test]
fn test_proportional_stays_within_bounds_for_any_history() {
    let mut rng = rand::thread_rng();
    for max_size in [1, 7, 100] {
        let mut bundler = ProportionalBundler::new(settings(max_size), 0);
        let now = Instant::now();
        for _ in 0..500 {
            let size = rng.gen_range(0..50);
            let elapsed = match rng.gen_range(0..4) {
                0 => Duration::ZERO,
                1 => Duration::from_secs(3600),
                _ => Duration::from_micros(rng.gen_range(0..5_000_000)),
            };
            bundler.feedback_at(size, elapsed, now);
            let recommended = bundler.compute_size();
            assert!(
                (1..=max_size).contains(&recommended),
                "size {recommended} outside [1, {max_size}]"
            );
        }
    }
}

#[test]
fn test_proportional_zero_latency_goes_to_max() {
    let mut bundler = ProportionalBundler::new(settings(40), 0);
    let now = Instant::now();
    for _ in 0..60 {
        bundler.feedback_at(5, Duration::ZERO, now);
    }
    assert_eq!(bundler.compute_size(), 40);
}

#[test]
fn test_proportional_slow_executor_shrinks_to_one() {
    let mut bundler = ProportionalBundler::new(settings(100), 0);
    let now = Instant::now();
    // 10s per unit against a 1s target
    for _ in 0..60 {
        bundler.feedback_at(2, Duration::from_secs(20), now);
    }
    assert_eq!(bundler.compute_size(), 1);
}

#[test]
fn test_clamp_never_exceeds_dispatchable() {
    for recommended in 0..20 {
        for dispatchable in 1..20 {
            for max in [None, Some(1), Some(5)] {
                let size = clamp_size(recommended, max, dispatchable);
                assert!(size >= 1);
                assert!(size <= dispatchable);
                if let Some(max) = max {
                    assert!(size <= max);
                }
            }
        }
    }
}

#[test]
fn test_factory_builds_configured_algorithm() {
    let executor = ExecutorInfo::new(Uuid::new_v4(), 6);

    let factory = BundlerFactory::new(LoadBalancerConfig::Fixed { size: 3 });
    let fixed = factory.create(&executor);
    assert_eq!(fixed.name(), "fixed");
    assert_eq!(fixed.compute_size(), 3);

    factory
        .replace(LoadBalancerConfig::NodeThreads {
            multiplier: 2,
            max_size: 100,
        })
        .unwrap();
    assert!(factory.is_stale(fixed.as_ref()));

    let threads = factory.create(&executor);
    assert_eq!(threads.name(), "node_threads");
    assert_eq!(threads.compute_size(), 12);
    assert!(!factory.is_stale(threads.as_ref()));
}

#[test]
fn test_factory_rejects_invalid_config() {
    let factory = BundlerFactory::new(LoadBalancerConfig::default());
    let before = factory.generation();

    let err = factory
        .replace(LoadBalancerConfig::Proportional(ProportionalSettings {
            smoothing: 0.0,
            ..ProportionalSettings::default()
        }))
        .unwrap_err();
    assert!(matches!(err, GridError::InvalidConfig(_)));
    assert_eq!(factory.generation(), before);
    assert_eq!(factory.config(), LoadBalancerConfig::default());
}

#[test]
fn test_load_balancer_config_json_shape() {
    let config: LoadBalancerConfig =
        serde_json::from_str(r#"{"algorithm":"fixed","size":8}"#).unwrap();
    assert_eq!(config, LoadBalancerConfig::Fixed { size: 8 });

    let json = serde_json::to_value(LoadBalancerConfig::NodeThreads {
        multiplier: 2,
        max_size: 10,
    })
    .unwrap();
    assert_eq!(json["algorithm"], "node_threads");
    assert_eq!(json["multiplier"], 2);
}
