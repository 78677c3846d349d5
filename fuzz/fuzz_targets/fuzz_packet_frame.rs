#![no_main]

use libfuzzer_sys::fuzz_target;

use ngc_core::packet::OuterHeader;

// Fuzz target for outer-frame parsing.
//
// Every frame that reaches a group arrives from the network before any
// session key is known, so the outer header must parse (or reject)
// cleanly on fully adversarial bytes.
fuzz_target!(|data: &[u8]| {
    let _ = OuterHeader::parse(data);
    let _ = ngc_core::packet::peek_chat_hash(data);
});
