#![no_main]

use libfuzzer_sys::fuzz_target;
use playlift::types::Edit;

fuzz_target!(|data: &[u8]| {
    // Deserializing arbitrary bytes must never panic; a valid record must
    // survive a roundtrip.
    if let Ok(edit) = serde_json::from_slice::<Edit>(data) {
        let json = serde_json::to_vec(&edit).expect("serialize");
        let again: Edit = serde_json::from_slice(&json).expect("roundtrip");
        assert_eq!(edit.handle, again.handle);
        assert_eq!(edit.state, again.state);
    }
});
