#![no_main]

use libfuzzer_sys::fuzz_target;

use ngc_core::state::SignedSharedState;

// Shared state is the one object every peer installs from an untrusted
// sender before any signature is checked against a pinned founder key;
// the wire decoder alone must never panic or allocate unboundedly.
fuzz_target!(|data: &[u8]| {
    if let Ok(signed) = SignedSharedState::from_wire(data) {
        let re_encoded = signed.to_wire();
        let _ = SignedSharedState::from_wire(&re_encoded);
    }
});
