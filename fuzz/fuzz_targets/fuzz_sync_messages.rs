#![no_main]

use libfuzzer_sys::fuzz_target;

use ngc_core::sync::{InviteRequest, PeerAnnounce, SyncResponse};

// Join/sync messages are the ones exchanged before a peer is confirmed,
// i.e. before role checks or rate limiting have had a chance to narrow
// who is allowed to send them.
fuzz_target!(|data: &[u8]| {
    let _ = InviteRequest::parse(data);
    let _ = SyncResponse::parse(data);
    let _ = PeerAnnounce::parse(data);
});
