// Copyright (c) 2024 Botho Foundation

//! Collaborator interfaces the core drives but does not own: chat
//! discovery (DHT) and message delivery (TCP relay multiplex).
//!
//! ```text
//!            ┌──────────────┐   bootstrap/announce/lookup   ┌──────────┐
//!            │  Group core  │ ─────────────────────────────▶│ DhtClient│
//!            │  (tick-      │                                └──────────┘
//!            │   driven)    │   new_channel/send/send_oob    ┌──────────────┐
//!            │              │ ─────────────────────────────▶│TcpRelayClient│
//!            │              │◀───────────────────────────────│              │
//!            └──────────────┘   poll_incoming (drained        └──────────────┘
//!                                 once per tick, never awaited)
//! ```
//!
//! The core never suspends mid-operation: every method here is a plain
//! synchronous call that returns or fails immediately, and inbound data is
//! collected by the collaborator and handed back through `poll_incoming`
//! rather than pushed through a callback or an async stream. A tick calls
//! `poll_incoming` once, processes whatever is queued, and returns; nothing
//! in the core blocks waiting on network I/O.

use crate::crypto::ExtPublicKey;
use crate::wire::RelayNode;
use thiserror::Error;

/// An opaque handle naming one multiplexed relay channel to a specific
/// peer. Meaningless outside the `TcpRelayClient` implementation that
/// issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u32);

#[derive(Debug, Error)]
pub enum DhtError {
    /// the DHT has no route table entries yet
    #[error("DHT not bootstrapped")]
    NotBootstrapped,
    /// the lookup timed out with no results
    #[error("DHT lookup timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum RelayError {
    /// no relay connection is currently usable for this channel
    #[error("no route to relay channel")]
    NoRoute,
    /// the channel handle is unknown to this client
    #[error("unknown relay channel")]
    UnknownChannel,
    /// the outbound queue for this channel is full
    #[error("relay outbound queue full")]
    QueueFull,
}

/// One confirmed route to a chat found by a DHT lookup: the peer's
/// long-term encryption key plus whatever TCP relays it announced itself
/// as reachable through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtPeerRoute {
    pub enc_key: ExtPublicKey,
    pub relays: Vec<RelayNode>,
}

/// Announces a chat's existence to the DHT and resolves other announcers.
/// A group announces itself under its chat id so other peers holding an
/// invite can find a rendezvous point, and looks the chat id back up to
/// discover who else is already in it.
pub trait DhtClient {
    /// Join the DHT's routing mesh. Implementations may no-op if already
    /// bootstrapped.
    ///
    /// # Errors
    /// Returns [`DhtError::Timeout`] if no bootstrap node answered.
    fn bootstrap(&mut self) -> Result<(), DhtError>;

    /// Publish this node as reachable for the given chat id.
    fn announce(&mut self, chat_id: [u8; 32]) -> Result<(), DhtError>;

    /// Resolve other peers currently announced under the given chat id.
    ///
    /// # Errors
    /// Returns [`DhtError::NotBootstrapped`] if called before
    /// [`DhtClient::bootstrap`], or [`DhtError::Timeout`] if the lookup
    /// produced no results within the implementation's deadline.
    fn lookup(&mut self, chat_id: [u8; 32]) -> Result<Vec<DhtPeerRoute>, DhtError>;
}

/// One packet delivered to us, either over a direct channel or out of band
/// via a relay, as drained from [`TcpRelayClient::poll_incoming`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingEvent {
    /// A frame received on an established channel.
    Channel { channel: ChannelId, bytes: Vec<u8> },
    /// A frame relayed from a peer with no established channel, routed
    /// purely by the sender's encryption key (the out-of-band path used
    /// before a connection's handshake has completed).
    OutOfBand { from_enc_key: [u8; 32], bytes: Vec<u8> },
}

/// Multiplexed delivery to peers, over a direct path when the collaborator
/// has one and a TCP relay otherwise. Channels are opened once per peer and
/// reused for the life of the connection.
pub trait TcpRelayClient {
    /// Open (or return an already-open) channel to a peer.
    fn new_channel(&mut self, peer_key: [u8; 32]) -> Result<ChannelId, RelayError>;

    /// Send bytes over an established channel.
    ///
    /// # Errors
    /// Returns [`RelayError::UnknownChannel`] if `channel` was never
    /// returned by [`TcpRelayClient::new_channel`], or
    /// [`RelayError::QueueFull`] if the implementation is backpressured.
    fn send(&mut self, channel: ChannelId, bytes: &[u8]) -> Result<(), RelayError>;

    /// Send bytes to a peer with no established channel, routed through a
    /// specific relay hint. Used for the OOB path: a peer announced only
    /// through a relay hint, never confirmed direct.
    fn send_oob(&mut self, via_relay: &RelayNode, to_peer_key: [u8; 32], bytes: &[u8]) -> Result<(), RelayError>;

    /// Toggle whether a channel prefers a direct path (`false`) or is
    /// pinned to TCP relay (`true`). Mirrors the direct-vs-relay choice
    /// computed by [`crate::connection::select_path`].
    fn set_status(&mut self, channel: ChannelId, use_tcp: bool) -> Result<(), RelayError>;

    /// Tear down a channel. Idempotent; unknown channels are ignored.
    fn kill(&mut self, channel: ChannelId);

    /// Drain everything received since the last call. Called at most once
    /// per tick; never blocks.
    fn poll_incoming(&mut self) -> Vec<IncomingEvent>;
}

/// Monotonic wall-clock source, abstracted so the periodic driver and its
/// tests can substitute a controllable clock.
pub trait Clock {
    fn now_secs(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct FakeRelay {
        next_channel: u32,
        channels: Vec<(ChannelId, [u8; 32])>,
        incoming: VecDeque<IncomingEvent>,
    }

    impl FakeRelay {
        fn new() -> Self {
            Self {
                next_channel: 0,
                channels: Vec::new(),
                incoming: VecDeque::new(),
            }
        }
    }

    impl TcpRelayClient for FakeRelay {
        fn new_channel(&mut self, peer_key: [u8; 32]) -> Result<ChannelId, RelayError> {
            if let Some((id, _)) = self.channels.iter().find(|(_, k)| *k == peer_key) {
                return Ok(*id);
            }
            let id = ChannelId(self.next_channel);
            self.next_channel += 1;
            self.channels.push((id, peer_key));
            Ok(id)
        }

        fn send(&mut self, channel: ChannelId, _bytes: &[u8]) -> Result<(), RelayError> {
            if self.channels.iter().any(|(id, _)| *id == channel) {
                Ok(())
            } else {
                Err(RelayError::UnknownChannel)
            }
        }

        fn send_oob(&mut self, _via_relay: &RelayNode, _to_peer_key: [u8; 32], _bytes: &[u8]) -> Result<(), RelayError> {
            Ok(())
        }

        fn set_status(&mut self, channel: ChannelId, _use_tcp: bool) -> Result<(), RelayError> {
            if self.channels.iter().any(|(id, _)| *id == channel) {
                Ok(())
            } else {
                Err(RelayError::UnknownChannel)
            }
        }

        fn kill(&mut self, channel: ChannelId) {
            self.channels.retain(|(id, _)| *id != channel);
        }

        fn poll_incoming(&mut self) -> Vec<IncomingEvent> {
            self.incoming.drain(..).collect()
        }
    }

    #[test]
    fn new_channel_is_idempotent_per_peer_key() {
        let mut relay = FakeRelay::new();
        let a = relay.new_channel([1u8; 32]).unwrap();
        let b = relay.new_channel([1u8; 32]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn send_on_unknown_channel_fails() {
        let mut relay = FakeRelay::new();
        assert!(matches!(
            relay.send(ChannelId(99), b"hi"),
            Err(RelayError::UnknownChannel)
        ));
    }

    #[test]
    fn kill_then_send_fails() {
        let mut relay = FakeRelay::new();
        let ch = relay.new_channel([2u8; 32]).unwrap();
        relay.kill(ch);
        assert!(matches!(relay.send(ch, b"hi"), Err(RelayError::UnknownChannel)));
    }

    #[test]
    fn poll_incoming_drains_queue() {
        let mut relay = FakeRelay::new();
        relay.incoming.push_back(IncomingEvent::OutOfBand {
            from_enc_key: [3u8; 32],
            bytes: vec![1, 2, 3],
        });
        let events = relay.poll_incoming();
        assert_eq!(events.len(), 1);
        assert!(relay.poll_incoming().is_empty());
    }
}
