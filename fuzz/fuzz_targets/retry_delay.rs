#![no_main]

use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use playlift::retry::{RetryConfig, calculate_delay, delay_for};

fuzz_target!(|data: (u32, u64, u64, u8, u64)| {
    let (attempt, initial_ms, max_ms, jitter_byte, hint_ms) = data;

    // Clamp values to reasonable ranges
    let initial_delay = Duration::from_millis(initial_ms % 10_000 + 1);
    let max_delay = Duration::from_millis(max_ms % 300_000 + 100);
    let jitter = (jitter_byte as f64) / 255.0;

    let config = RetryConfig {
        max_attempts: 3,
        initial_delay,
        max_delay,
        jitter,
    };

    let delay = calculate_delay(&config, attempt);

    // Invariants:
    // 1. The jitter band bounds every computed delay.
    let ceiling_ms = (max_delay.as_millis() as f64 * (1.0 + jitter)).ceil() as u64 + 1;
    assert!(delay <= Duration::from_millis(ceiling_ms));

    // 2. A server hint always wins, clamped to the cap.
    let hint = Duration::from_millis(hint_ms % 600_000);
    assert_eq!(delay_for(&config, attempt, Some(hint)), hint.min(max_delay));
});
