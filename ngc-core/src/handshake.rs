// Copyright (c) 2024 Botho Foundation

//! Two-way handshake for establishing a per-connection session key.
//!
//! This module implements the plaintext handshake payload, the flow that
//! carries a Request into a Response and a lossless acknowledgement, the
//! version tiebreak that decides which side drives the post-handshake
//! invite, and the per-group rate limiter ("new-connection meter") that
//! bounds how many handshakes a group accepts.

use crate::crypto::{self, CryptoError, SharedKey, HALF_KEY_LEN};
use crate::wire::RelayNode;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Instant;
use thiserror::Error;
use x25519_dalek::{PublicKey as XPublic, StaticSecret as XSecret};

/// Plaintext handshake message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    Request,
    Response,
}

impl HandshakeKind {
    fn to_byte(self) -> u8 {
        match self {
            HandshakeKind::Request => 0,
            HandshakeKind::Response => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(HandshakeKind::Request),
            1 => Some(HandshakeKind::Response),
            _ => None,
        }
    }
}

/// What the initiator intends to do once the handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    InviteRequest,
    PeerInfoExchange,
}

impl RequestKind {
    fn to_byte(self) -> u8 {
        match self {
            RequestKind::InviteRequest => 0,
            RequestKind::PeerInfoExchange => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(RequestKind::InviteRequest),
            1 => Some(RequestKind::PeerInfoExchange),
            _ => None,
        }
    }
}

/// Whether the group being joined requires a password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Public,
    Private,
}

impl JoinKind {
    fn to_byte(self) -> u8 {
        match self {
            JoinKind::Public => 0,
            JoinKind::Private => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(JoinKind::Public),
            1 => Some(JoinKind::Private),
            _ => None,
        }
    }
}

/// Sentinel meaning "no shared state has been received yet" in the
/// last-known-version field, also used as the initial value of
/// `self_sent_shared_state_version` on a fresh connection.
pub const NO_SHARED_STATE_VERSION: u32 = u32::MAX;

/// The plaintext handshake payload: present on both Request and Response.
#[derive(Debug, Clone)]
pub struct HandshakePayload {
    pub kind: HandshakeKind,
    pub sender_hash: u32,
    pub sender_session_pk: [u8; HALF_KEY_LEN],
    pub sender_sig_pk: [u8; HALF_KEY_LEN],
    pub request_kind: RequestKind,
    pub join_kind: JoinKind,
    pub sender_shared_state_version: u32,
    pub relay_hint: Option<RelayNode>,
}

/// Errors raised while parsing or processing a handshake payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// payload shorter than the fixed handshake header
    #[error("payload shorter than the fixed handshake header")]
    TooShort,
    /// unknown handshake type byte
    #[error("unknown handshake type byte")]
    UnknownKind,
    /// unknown request kind byte
    #[error("unknown request kind byte")]
    UnknownRequestKind,
    /// unknown join kind byte
    #[error("unknown join kind byte")]
    UnknownJoinKind,
    /// trailing bytes after a well-formed relay hint
    #[error("trailing bytes after a well-formed relay hint")]
    TrailingBytes,
    /// the request was rejected by the group's rate limiter
    #[error("request rejected by the new-connection rate limiter")]
    RateLimited,
    /// the requester's IP is on the sanctions list and it is not a moderator
    #[error("requester IP is banned")]
    Banned,
}

const FIXED_LEN: usize = 1 + 4 + HALF_KEY_LEN + HALF_KEY_LEN + 1 + 1 + 4;

impl HandshakePayload {
    pub fn parse(buf: &[u8]) -> Result<Self, HandshakeError> {
        if buf.len() < FIXED_LEN {
            return Err(HandshakeError::TooShort);
        }
        let kind = HandshakeKind::from_byte(buf[0]).ok_or(HandshakeError::UnknownKind)?;
        let sender_hash = u32::from_be_bytes(buf[1..5].try_into().unwrap());
        let mut sender_session_pk = [0u8; HALF_KEY_LEN];
        sender_session_pk.copy_from_slice(&buf[5..5 + HALF_KEY_LEN]);
        let mut sender_sig_pk = [0u8; HALF_KEY_LEN];
        let sig_start = 5 + HALF_KEY_LEN;
        sender_sig_pk.copy_from_slice(&buf[sig_start..sig_start + HALF_KEY_LEN]);
        let after_keys = sig_start + HALF_KEY_LEN;
        let request_kind =
            RequestKind::from_byte(buf[after_keys]).ok_or(HandshakeError::UnknownRequestKind)?;
        let join_kind =
            JoinKind::from_byte(buf[after_keys + 1]).ok_or(HandshakeError::UnknownJoinKind)?;
        let version_start = after_keys + 2;
        let sender_shared_state_version =
            u32::from_be_bytes(buf[version_start..version_start + 4].try_into().unwrap());
        let rest = &buf[version_start + 4..];
        let relay_hint = if rest.is_empty() {
            None
        } else {
            let (node, tail) =
                RelayNode::parse(rest).ok_or(HandshakeError::TooShort)?;
            if !tail.is_empty() {
                return Err(HandshakeError::TrailingBytes);
            }
            Some(node)
        };
        Ok(Self {
            kind,
            sender_hash,
            sender_session_pk,
            sender_sig_pk,
            request_kind,
            join_kind,
            sender_shared_state_version,
            relay_hint,
        })
    }

    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_LEN + 64);
        out.push(self.kind.to_byte());
        out.extend_from_slice(&self.sender_hash.to_be_bytes());
        out.extend_from_slice(&self.sender_session_pk);
        out.extend_from_slice(&self.sender_sig_pk);
        out.push(self.request_kind.to_byte());
        out.push(self.join_kind.to_byte());
        out.extend_from_slice(&self.sender_shared_state_version.to_be_bytes());
        if let Some(node) = &self.relay_hint {
            node.write(&mut out);
        }
        out
    }
}

/// Outcome of completing a handshake: the computed session shared key plus
/// the peer's session public key, ready to hand to the connection layer.
/// The peer's signature key is already known from the parsed payload and
/// is not duplicated here.
pub struct Accepted {
    pub shared_key: SharedKey,
    pub peer_session_pk: XPublic,
}

/// Precompute the session shared key for a handshake, combining our
/// session secret with the peer's session public key.
pub fn precompute(my_session_secret: &XSecret, peer_session_pk: &[u8; HALF_KEY_LEN]) -> Accepted {
    let peer_pub = XPublic::from(*peer_session_pk);
    let shared_key = crypto::precompute_shared_key(my_session_secret, &peer_pub);
    Accepted {
        shared_key,
        peer_session_pk: peer_pub,
    }
}

/// Decide which side of a version mismatch should drive the post-handshake
/// invite request: the side with the strictly higher locally-sent shared
/// state version, or on a tie, the side with the lexicographically higher
/// signature public key.
pub fn should_initiate_invite(
    my_shared_state_version: u32,
    my_sig_pk: &[u8; HALF_KEY_LEN],
    their_shared_state_version: u32,
    their_sig_pk: &[u8; HALF_KEY_LEN],
) -> bool {
    match my_shared_state_version.cmp(&their_shared_state_version) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => my_sig_pk > their_sig_pk,
    }
}

/// Reject a handshake request whose source IP is sanctioned, unless the
/// requester's signature key appears in the moderator list (moderators are
/// exempt from IP bans, which would otherwise let a banned relay operator
/// silence a moderator transitively).
pub fn check_banned(
    requester_ip: IpAddr,
    banned_ips: &HashSet<IpAddr>,
    requester_sig_pk: &[u8; HALF_KEY_LEN],
    moderators: &HashSet<[u8; HALF_KEY_LEN]>,
) -> Result<(), HandshakeError> {
    if banned_ips.contains(&requester_ip) && !moderators.contains(requester_sig_pk) {
        return Err(HandshakeError::Banned);
    }
    Ok(())
}

/// Per-group token bucket bounding how many handshake requests are
/// accepted per second: incremented by one on each acceptance, drained by
/// one per elapsed wall-clock second, blocking new acceptances once it
/// crosses the threshold.
#[derive(Debug)]
pub struct ConnectionMeter {
    level: u32,
    threshold: u32,
    last_drain: Instant,
}

impl ConnectionMeter {
    pub const DEFAULT_THRESHOLD: u32 = 10;

    pub fn new() -> Self {
        Self::with_threshold(Self::DEFAULT_THRESHOLD)
    }

    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            level: 0,
            threshold,
            last_drain: Instant::now(),
        }
    }

    fn drain(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_drain).as_secs();
        if elapsed > 0 {
            self.level = self.level.saturating_sub(elapsed as u32);
            self.last_drain = now;
        }
    }

    /// Admit one more handshake acceptance, returning `false` once the
    /// meter is at or above the threshold.
    pub fn try_admit(&mut self) -> bool {
        self.drain();
        if self.level >= self.threshold {
            return false;
        }
        self.level += 1;
        true
    }

    pub fn level(&self) -> u32 {
        self.level
    }
}

impl Default for ConnectionMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl From<CryptoError> for HandshakeError {
    fn from(_: CryptoError) -> Self {
        HandshakeError::UnknownKind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ExtSecretKey;
    use rand::rngs::OsRng;
    use std::net::Ipv4Addr;

    fn sample_payload(relay_hint: Option<RelayNode>) -> HandshakePayload {
        HandshakePayload {
            kind: HandshakeKind::Request,
            sender_hash: 0xaabbccdd,
            sender_session_pk: [3u8; HALF_KEY_LEN],
            sender_sig_pk: [4u8; HALF_KEY_LEN],
            request_kind: RequestKind::InviteRequest,
            join_kind: JoinKind::Private,
            sender_shared_state_version: 7,
            relay_hint,
        }
    }

    #[test]
    fn payload_round_trips_without_relay_hint() {
        let payload = sample_payload(None);
        let bytes = payload.write();
        let parsed = HandshakePayload::parse(&bytes).unwrap();
        assert_eq!(parsed.kind, payload.kind);
        assert_eq!(parsed.sender_hash, payload.sender_hash);
        assert_eq!(parsed.request_kind, payload.request_kind);
        assert_eq!(parsed.join_kind, payload.join_kind);
        assert!(parsed.relay_hint.is_none());
    }

    #[test]
    fn payload_round_trips_with_relay_hint() {
        let hint = RelayNode {
            pk: [9u8; 32],
            addr: crate::wire::IpPort::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 33445),
        };
        let payload = sample_payload(Some(hint));
        let bytes = payload.write();
        let parsed = HandshakePayload::parse(&bytes).unwrap();
        assert_eq!(parsed.relay_hint, payload.relay_hint);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        assert_eq!(
            HandshakePayload::parse(&[0u8; 4]).unwrap_err(),
            HandshakeError::TooShort
        );
    }

    #[test]
    fn version_tiebreak_prefers_higher_version() {
        let lo = [1u8; HALF_KEY_LEN];
        let hi = [2u8; HALF_KEY_LEN];
        assert!(should_initiate_invite(5, &lo, 3, &hi));
        assert!(!should_initiate_invite(3, &hi, 5, &lo));
    }

    #[test]
    fn version_tiebreak_falls_back_to_key_comparison_on_equal_version() {
        let lo = [1u8; HALF_KEY_LEN];
        let hi = [2u8; HALF_KEY_LEN];
        assert!(should_initiate_invite(5, &hi, 5, &lo));
        assert!(!should_initiate_invite(5, &lo, 5, &hi));
    }

    #[test]
    fn moderators_are_exempt_from_ip_ban() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let mut banned = HashSet::new();
        banned.insert(ip);
        let sig_pk = [5u8; HALF_KEY_LEN];
        let mut moderators = HashSet::new();
        moderators.insert(sig_pk);
        assert!(check_banned(ip, &banned, &sig_pk, &moderators).is_ok());

        let empty_mods: HashSet<[u8; HALF_KEY_LEN]> = HashSet::new();
        assert_eq!(
            check_banned(ip, &banned, &sig_pk, &empty_mods).unwrap_err(),
            HandshakeError::Banned
        );
    }

    #[test]
    fn connection_meter_blocks_above_threshold() {
        let mut meter = ConnectionMeter::with_threshold(3);
        assert!(meter.try_admit());
        assert!(meter.try_admit());
        assert!(meter.try_admit());
        assert!(!meter.try_admit());
        assert_eq!(meter.level(), 3);
    }

    #[test]
    fn precompute_is_symmetric_between_peers() {
        let mut rng = OsRng;
        let (_, sk_a) = ExtSecretKey::generate(&mut rng);
        let (pk_b, sk_b) = ExtSecretKey::generate(&mut rng);
        let accepted_a = precompute(sk_a.x25519_secret(), pk_b.enc_key());
        let accepted_b = precompute(sk_b.x25519_secret(), sk_a.public().enc_key());
        assert_eq!(
            accepted_a.shared_key.as_bytes(),
            accepted_b.shared_key.as_bytes()
        );
    }
}
