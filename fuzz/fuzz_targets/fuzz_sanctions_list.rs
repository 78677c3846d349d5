#![no_main]

use libfuzzer_sys::fuzz_target;

use ngc_core::state::SanctionsList;

fuzz_target!(|data: &[u8]| {
    let _ = SanctionsList::parse_wire(data);
});
