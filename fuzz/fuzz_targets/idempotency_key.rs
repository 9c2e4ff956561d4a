#![no_main]

use libfuzzer_sys::fuzz_target;
use playlift::idempotency::IdempotencyStore;

fuzz_target!(|data: (&str, &str, &str)| {
    let (op, pkg, content) = data;

    let key = IdempotencyStore::generate_key(op, pkg, content);

    // Invariants:
    // 1. Keys are 64 lowercase hex characters regardless of input.
    assert_eq!(key.len(), 64);
    assert!(key
        .chars()
        .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

    // 2. Derivation is deterministic.
    assert_eq!(key, IdempotencyStore::generate_key(op, pkg, content));
});
