//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;

use satflow::pipeline::WorkerSettings;
use std::time::Duration;

/// Generous upper bound for anything the tests wait on
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Worker settings with short polls so tests stop quickly
pub fn fast_settings(use_lock: bool) -> WorkerSettings {
    WorkerSettings {
        use_lock,
        poll_timeout: Duration::from_millis(10),
        baton_timeout: Some(Duration::from_secs(5)),
        idle_retry: Duration::from_millis(5),
    }
}

/// Expected chain output when the head stage emits `bursts[i]` items for
/// input `i` and every later stage passes items through.
pub fn expected_output(bursts: &[usize]) -> Vec<(u32, u32)> {
    bursts
        .iter()
        .enumerate()
        .flat_map(|(src, &len)| (0..len as u32).map(move |k| (src as u32, k)))
        .collect()
}

/// Assert the source indices in `items` never go backwards
pub fn assert_sources_ordered(stage: &str, items: &[(u32, u32)]) {
    for pair in items.windows(2) {
        assert!(
            pair[0] <= pair[1],
            "stage '{}' saw {:?} before {:?}",
            stage,
            pair[0],
            pair[1]
        );
    }
}

/// Poll `cond` until it holds or [`test_timeout`] passes
pub fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
    let deadline = std::time::Instant::now() + test_timeout();
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
