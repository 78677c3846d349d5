#![no_main]

use libfuzzer_sys::fuzz_target;

use ngc_core::state::Topic;

fuzz_target!(|data: &[u8]| {
    if let Ok(topic) = Topic::from_wire(data) {
        let re_encoded = topic.to_wire();
        let _ = Topic::from_wire(&re_encoded);
    }
});
