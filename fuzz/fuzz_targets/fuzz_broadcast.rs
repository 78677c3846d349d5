#![no_main]

use libfuzzer_sys::fuzz_target;

use ngc_core::broadcast::Broadcast;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Broadcast::parse(data) {
        let _ = frame.payload.len();
    }
});
