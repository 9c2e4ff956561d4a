#![no_main]

use chrono::Utc;
use libfuzzer_sys::fuzz_target;
use playlift::retry::parse_retry_after;

fuzz_target!(|data: &str| {
    // Must never panic on arbitrary header values; accepted values are
    // always finite, non-negative durations.
    if let Some(delay) = parse_retry_after(data, Utc::now()) {
        assert!(delay.as_secs() < u64::MAX);
    }
});
