// Copyright (c) 2024 Botho Foundation

//! Per-peer reliable stream and transport-path selection.
//!
//! Each confirmed peer gets an independent 64-bit monotonic message-id
//! stream in each direction. The sender keeps a bounded ring of
//! unacknowledged frames; the receiver keeps a ring of frames that arrived
//! ahead of the next expected id. Retransmission and path selection are
//! driven by the periodic driver, not by this module directly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Ring capacity for both the send and receive windows. Chosen generously
/// above the per-tick burst size the driver can plausibly produce.
pub const RING_SIZE: usize = 256;

/// Frames added within this window of "now" are skipped by retransmission,
/// to avoid firing a duplicate immediately after the original send.
pub const RETRANSMIT_GRACE: Duration = Duration::from_secs(1);
/// Minimum time between retransmission attempts for the same frame.
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
struct SendSlot {
    message_id: u64,
    frame: Vec<u8>,
    time_added: Instant,
    last_send_try: Instant,
}

/// Outcome of handing a freshly-received (message_id, payload) pair to the
/// reliable stream.
#[derive(Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Deliver these payloads to the application, in order.
    Deliver(Vec<Vec<u8>>),
    /// Already delivered or already buffered; ack but do not re-deliver.
    Duplicate,
    /// Arrived ahead of `next_expected`; buffered, and the given id should
    /// be requested via `MessageAck(request=...)`.
    OutOfOrder { request_id: u64 },
}

/// The bidirectional reliable-delivery state for one connection.
pub struct ReliableStream {
    next_send_id: u64,
    send_ring: HashMap<u64, SendSlot>,
    next_expected_recv: u64,
    recv_buffer: HashMap<u64, Vec<u8>>,
}

impl ReliableStream {
    pub fn new() -> Self {
        Self {
            next_send_id: 1,
            send_ring: HashMap::new(),
            next_expected_recv: 1,
            recv_buffer: HashMap::new(),
        }
    }

    /// Reserve the next message id without yet recording a sent frame for
    /// it, for callers that must seal a frame (which embeds the id) before
    /// they have anything to hand to [`Self::record_sent`].
    pub fn next_message_id(&mut self) -> u64 {
        let message_id = self.next_send_id;
        self.next_send_id += 1;
        message_id
    }

    /// Arm `message_id` (already reserved via [`Self::next_message_id`])
    /// for retransmission, recording the already-sealed `frame`.
    pub fn record_sent(&mut self, message_id: u64, frame: Vec<u8>, now: Instant) {
        if self.send_ring.len() >= RING_SIZE {
            // Ring exhausted: drop the oldest unacked entry rather than grow
            // unbounded. The peer is presumably unreachable; the group
            // timeout will eventually reap it.
            if let Some(&oldest) = self
                .send_ring
                .keys()
                .min_by_key(|id| self.send_ring[*id].time_added)
            {
                self.send_ring.remove(&oldest);
            }
        }
        self.send_ring.insert(
            message_id,
            SendSlot {
                message_id,
                frame,
                time_added: now,
                last_send_try: now,
            },
        );
    }

    /// Queue `frame` for sending, assigning it the next message id. The
    /// caller is responsible for actually transmitting `frame` immediately;
    /// this only arms it for retransmission.
    pub fn queue_send(&mut self, frame: Vec<u8>, now: Instant) -> u64 {
        let message_id = self.next_message_id();
        self.record_sent(message_id, frame, now);
        message_id
    }

    /// A read-receipt acknowledging all ids up to and including `id`
    /// arrived: drop the corresponding ring entries.
    pub fn on_read_ack(&mut self, id: u64) {
        self.send_ring.retain(|&msg_id, _| msg_id > id);
    }

    /// The peer explicitly requested `id` via `MessageAck(request=id)`:
    /// hand back the still-held frame for immediate retransmission, and
    /// reset its retransmit clock so the periodic sweep doesn't also
    /// resend it a moment later.
    pub fn frame_for_retransmit(&mut self, id: u64, now: Instant) -> Option<Vec<u8>> {
        let slot = self.send_ring.get_mut(&id)?;
        slot.last_send_try = now;
        Some(slot.frame.clone())
    }

    /// Frames due for retransmission: `last_send_try` older than the
    /// retransmit interval, excluding frames added within the grace window.
    pub fn due_for_retransmit(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let mut due = Vec::new();
        for slot in self.send_ring.values_mut() {
            if now.duration_since(slot.time_added) < RETRANSMIT_GRACE {
                continue;
            }
            if now.duration_since(slot.last_send_try) >= RETRANSMIT_INTERVAL {
                slot.last_send_try = now;
                due.push(slot.frame.clone());
            }
        }
        due
    }

    /// Accept an incoming (message_id, payload): deliver in order, buffer
    /// out-of-order arrivals, or report a duplicate.
    pub fn on_receive(&mut self, message_id: u64, payload: Vec<u8>) -> ReceiveOutcome {
        if message_id < self.next_expected_recv || self.recv_buffer.contains_key(&message_id) {
            return ReceiveOutcome::Duplicate;
        }
        if message_id > self.next_expected_recv {
            if self.recv_buffer.len() < RING_SIZE {
                self.recv_buffer.insert(message_id, payload);
            }
            return ReceiveOutcome::OutOfOrder {
                request_id: self.next_expected_recv,
            };
        }
        let mut delivered = vec![payload];
        self.next_expected_recv += 1;
        while let Some(buffered) = self.recv_buffer.remove(&self.next_expected_recv) {
            delivered.push(buffered);
            self.next_expected_recv += 1;
        }
        ReceiveOutcome::Deliver(delivered)
    }

    pub fn next_expected_recv(&self) -> u64 {
        self.next_expected_recv
    }
}

impl Default for ReliableStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Which path a connection currently uses to send frames. Selection is
/// recomputed periodically, never per-frame: every frame goes out on the
/// currently selected path only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPath {
    DirectUdp,
    TcpRelay,
}

/// How recently a direct receive must have happened for a direct address
/// to be considered reachable.
pub const DIRECT_RECENCY_WINDOW: Duration = Duration::from_secs(30);

/// Choose the transport path for a connection: direct UDP only if an
/// address is known and a recent direct receive proves the path is
/// reachable; otherwise the TCP relay. A peer with no known address
/// (IP family zero) always routes through the relay rather than guessing.
pub fn select_path(
    has_known_addr: bool,
    last_direct_recv: Option<Instant>,
    now: Instant,
) -> TransportPath {
    match (has_known_addr, last_direct_recv) {
        (true, Some(last)) if now.duration_since(last) <= DIRECT_RECENCY_WINDOW => {
            TransportPath::DirectUdp
        }
        _ => TransportPath::TcpRelay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_receive_delivers_immediately() {
        let mut stream = ReliableStream::new();
        let outcome = stream.on_receive(1, b"a".to_vec());
        assert_eq!(outcome, ReceiveOutcome::Deliver(vec![b"a".to_vec()]));
        assert_eq!(stream.next_expected_recv(), 2);
    }

    #[test]
    fn out_of_order_receive_buffers_and_requests_missing_id() {
        let mut stream = ReliableStream::new();
        let outcome = stream.on_receive(3, b"c".to_vec());
        assert_eq!(outcome, ReceiveOutcome::OutOfOrder { request_id: 1 });
        assert_eq!(stream.next_expected_recv(), 1);
    }

    #[test]
    fn buffered_out_of_order_frames_flush_once_gap_fills() {
        let mut stream = ReliableStream::new();
        stream.on_receive(2, b"b".to_vec());
        stream.on_receive(3, b"c".to_vec());
        let outcome = stream.on_receive(1, b"a".to_vec());
        assert_eq!(
            outcome,
            ReceiveOutcome::Deliver(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()])
        );
        assert_eq!(stream.next_expected_recv(), 4);
    }

    #[test]
    fn duplicate_already_delivered_id_is_reported() {
        let mut stream = ReliableStream::new();
        stream.on_receive(1, b"a".to_vec());
        assert_eq!(stream.on_receive(1, b"a".to_vec()), ReceiveOutcome::Duplicate);
    }

    #[test]
    fn duplicate_already_buffered_id_is_reported() {
        let mut stream = ReliableStream::new();
        stream.on_receive(4, b"d".to_vec());
        assert_eq!(stream.on_receive(4, b"d".to_vec()), ReceiveOutcome::Duplicate);
    }

    #[test]
    fn read_ack_removes_acknowledged_send_ring_entries() {
        let mut stream = ReliableStream::new();
        let now = Instant::now();
        stream.queue_send(b"one".to_vec(), now);
        stream.queue_send(b"two".to_vec(), now);
        stream.queue_send(b"three".to_vec(), now);
        stream.on_read_ack(2);
        let later = now + RETRANSMIT_GRACE + RETRANSMIT_INTERVAL;
        let due = stream.due_for_retransmit(later);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0], b"three".to_vec());
    }

    #[test]
    fn frame_for_retransmit_returns_the_held_frame_once() {
        let mut stream = ReliableStream::new();
        let now = Instant::now();
        stream.queue_send(b"one".to_vec(), now);
        assert_eq!(stream.frame_for_retransmit(1, now), Some(b"one".to_vec()));
        assert_eq!(stream.frame_for_retransmit(2, now), None);
    }

    #[test]
    fn frames_within_grace_window_are_not_retransmitted() {
        let mut stream = ReliableStream::new();
        let now = Instant::now();
        stream.queue_send(b"fresh".to_vec(), now);
        assert!(stream.due_for_retransmit(now).is_empty());
    }

    #[test]
    fn path_selection_prefers_direct_when_recently_reachable() {
        let now = Instant::now();
        assert_eq!(
            select_path(true, Some(now), now),
            TransportPath::DirectUdp
        );
    }

    #[test]
    fn path_selection_falls_back_to_relay_without_known_address() {
        let now = Instant::now();
        assert_eq!(select_path(false, None, now), TransportPath::TcpRelay);
    }

    #[test]
    fn path_selection_falls_back_to_relay_when_direct_recv_stale() {
        let now = Instant::now();
        let stale = now - DIRECT_RECENCY_WINDOW - Duration::from_secs(1);
        assert_eq!(select_path(true, Some(stale), now), TransportPath::TcpRelay);
    }
}
