// Copyright (c) 2024 Botho Foundation

//! The periodic driver: the single entry point that advances every
//! per-connection timer. Nothing in this crate spontaneously wakes up on
//! its own; a caller (the session's event loop) calls [`Driver::tick`]
//! on a fixed cadence and acts on what comes back.

use crate::connection::ReliableStream;
use crate::handshake::ConnectionMeter;
use crate::peer::{PeerId, PeerTable};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How often a confirmed peer should receive a keepalive ping carrying our
/// view of the group's versioned state, so divergence is caught even
/// without an intervening mutation.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

/// A ping payload: the sender's current counts, used by the receiver to
/// notice it has fallen behind and should request a resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingSnapshot {
    pub confirmed_peer_count: u32,
    pub shared_state_version: u32,
    pub sanctions_credentials_version: u32,
    pub topic_version: u32,
}

/// Everything the driver decided should happen this tick. The caller is
/// responsible for actually transmitting `retransmits` and `pings`
/// through the transport layer and for deleting `timed_out_peers` from
/// the peer table and stream map.
#[derive(Debug, Default)]
pub struct TickOutput {
    /// (peer, frame) pairs due for retransmission this tick.
    pub retransmits: Vec<(PeerId, Vec<u8>)>,
    /// Peer indices whose last-seen time exceeded their timeout.
    pub timed_out_peers: Vec<usize>,
    /// Peers due for a keepalive ping, with the snapshot to stamp it.
    pub pings: Vec<PeerId>,
}

/// Owns the state that spans ticks: the new-connection rate limiter and
/// per-peer last-ping timestamps. The reliable streams and peer table
/// themselves are owned by the caller (typically the enclosing `Group`)
/// and passed in by reference, since they are also touched outside the
/// tick path (e.g. on every incoming frame).
pub struct Driver {
    pub meter: ConnectionMeter,
    last_ping: HashMap<PeerId, Instant>,
    ping_interval: Duration,
}

impl Driver {
    pub fn new(ping_interval: Duration) -> Self {
        Self {
            meter: ConnectionMeter::new(),
            last_ping: HashMap::new(),
            ping_interval,
        }
    }

    /// Drop bookkeeping for a peer that left the table, so it does not
    /// leak across reconnects with a different peer id.
    pub fn forget(&mut self, peer_id: PeerId) {
        self.last_ping.remove(&peer_id);
    }

    /// Advance all per-connection timers: collect due retransmissions from
    /// every live stream, collect timed-out peer indices from the table,
    /// and decide which confirmed peers are due a ping.
    pub fn tick(
        &mut self,
        table: &PeerTable,
        streams: &mut HashMap<PeerId, ReliableStream>,
        now: Instant,
    ) -> TickOutput {
        let mut output = TickOutput::default();

        for peer in table.iter().skip(1) {
            if !peer.confirmed() {
                continue;
            }
            if let Some(stream) = streams.get_mut(&peer.peer_id) {
                for frame in stream.due_for_retransmit(now) {
                    output.retransmits.push((peer.peer_id, frame));
                }
            }
            let due = match self.last_ping.get(&peer.peer_id) {
                Some(last) => now.duration_since(*last) >= self.ping_interval,
                None => true,
            };
            if due {
                self.last_ping.insert(peer.peer_id, now);
                output.pings.push(peer.peer_id);
            }
        }

        output.timed_out_peers = table.timed_out(now);
        for &index in &output.timed_out_peers {
            if let Some(peer) = table.by_index(index) {
                self.forget(peer.peer_id);
            }
        }

        output
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new(DEFAULT_PING_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ExtSecretKey;
    use crate::peer::{self, Role};
    use rand::rngs::OsRng;

    fn table_with_one_confirmed_peer() -> (PeerTable, PeerId) {
        let mut rng = OsRng;
        let (self_pk, _) = ExtSecretKey::generate(&mut rng);
        let me = peer::self_record(&self_pk, b"me".to_vec(), Role::Founder, Instant::now());
        let mut table = PeerTable::new(&mut rng, me);
        let (pk, _) = ExtSecretKey::generate(&mut rng);
        let id = table
            .add(&mut rng, *pk.enc_key(), *pk.sig_key(), None, Instant::now())
            .unwrap();
        let index = table.find_by_peer_id(id).unwrap();
        table.by_index_mut(index).unwrap().state = crate::peer::ConnectionState::Confirmed;
        (table, id)
    }

    #[test]
    fn first_tick_pings_every_confirmed_peer() {
        let (table, id) = table_with_one_confirmed_peer();
        let mut driver = Driver::new(Duration::from_secs(60));
        let mut streams = HashMap::new();
        let output = driver.tick(&table, &mut streams, Instant::now());
        assert_eq!(output.pings, vec![id]);
    }

    #[test]
    fn ping_is_not_repeated_before_interval_elapses() {
        let (table, id) = table_with_one_confirmed_peer();
        let mut driver = Driver::new(Duration::from_secs(60));
        let mut streams = HashMap::new();
        let now = Instant::now();
        driver.tick(&table, &mut streams, now);
        let output = driver.tick(&table, &mut streams, now + Duration::from_secs(1));
        assert!(output.pings.is_empty());
        let _ = id;
    }

    #[test]
    fn due_retransmits_are_collected_per_peer() {
        let (table, id) = table_with_one_confirmed_peer();
        let mut driver = Driver::new(Duration::from_secs(60));
        let mut streams = HashMap::new();
        let mut stream = ReliableStream::new();
        let t0 = Instant::now();
        stream.queue_send(b"hello".to_vec(), t0);
        streams.insert(id, stream);
        let later = t0
            + crate::connection::RETRANSMIT_GRACE
            + crate::connection::RETRANSMIT_INTERVAL;
        let output = driver.tick(&table, &mut streams, later);
        assert_eq!(output.retransmits, vec![(id, b"hello".to_vec())]);
    }

    #[test]
    fn timed_out_peers_are_reported_and_forgotten() {
        let mut rng = OsRng;
        let (self_pk, _) = ExtSecretKey::generate(&mut rng);
        let me = peer::self_record(&self_pk, b"me".to_vec(), Role::Founder, Instant::now());
        let mut table = PeerTable::new(&mut rng, me);
        let (pk, _) = ExtSecretKey::generate(&mut rng);
        let stale = Instant::now() - peer::UNCONFIRMED_TIMEOUT - Duration::from_secs(1);
        table
            .add(&mut rng, *pk.enc_key(), *pk.sig_key(), None, stale)
            .unwrap();
        let mut driver = Driver::new(Duration::from_secs(60));
        let mut streams = HashMap::new();
        let output = driver.tick(&table, &mut streams, Instant::now());
        assert_eq!(output.timed_out_peers, vec![1]);
    }
}
