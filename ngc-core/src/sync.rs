// Copyright (c) 2024 Botho Foundation

//! Join/sync protocol: invite request and response, the ordered sync
//! response emission, and peer announcements.

use crate::crypto::HALF_KEY_LEN;
use crate::peer::Role;
use crate::wire::RelayNode;
use thiserror::Error;

pub const MAX_NICK_LEN: usize = 32;
pub const MAX_PASSWORD_LEN: usize = 32;

/// Encode a role as the single byte carried in peer-info exchange messages.
pub fn role_to_byte(role: Role) -> u8 {
    match role {
        Role::Observer => 0,
        Role::User => 1,
        Role::Moderator => 2,
        Role::Founder => 3,
    }
}

/// Decode a role byte, rejecting anything outside the four known values.
pub fn role_from_byte(b: u8) -> Option<Role> {
    match b {
        0 => Some(Role::Observer),
        1 => Some(Role::User),
        2 => Some(Role::Moderator),
        3 => Some(Role::Founder),
        _ => None,
    }
}

/// Reason a joiner's invite was rejected, carried in `InviteResponseReject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    GroupFull,
    InvalidPassword,
    NickTaken,
    JoinPublicAsPrivate,
}

impl RejectReason {
    fn to_byte(self) -> u8 {
        match self {
            RejectReason::GroupFull => 0,
            RejectReason::InvalidPassword => 1,
            RejectReason::NickTaken => 2,
            RejectReason::JoinPublicAsPrivate => 3,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(RejectReason::GroupFull),
            1 => Some(RejectReason::InvalidPassword),
            2 => Some(RejectReason::NickTaken),
            3 => Some(RejectReason::JoinPublicAsPrivate),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    /// payload shorter than required
    #[error("payload shorter than required")]
    TooShort,
    /// a length-prefixed field claimed more bytes than were available
    #[error("length-prefixed field claimed more bytes than were available")]
    Truncated,
    /// unknown reject reason byte
    #[error("unknown reject reason byte")]
    UnknownReason,
    /// unknown role byte
    #[error("unknown role byte")]
    UnknownRole,
}

/// An InviteRequest: nick plus an optional literal password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteRequest {
    pub nick: Vec<u8>,
    pub password: Vec<u8>,
}

impl InviteRequest {
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.nick.len() + self.password.len());
        out.push(self.nick.len() as u8);
        out.extend_from_slice(&self.nick);
        out.push(self.password.len() as u8);
        out.extend_from_slice(&self.password);
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, SyncError> {
        if buf.is_empty() {
            return Err(SyncError::TooShort);
        }
        let nick_len = buf[0] as usize;
        if buf.len() < 1 + nick_len + 1 {
            return Err(SyncError::Truncated);
        }
        let nick = buf[1..1 + nick_len].to_vec();
        let pw_len_idx = 1 + nick_len;
        let pw_len = buf[pw_len_idx] as usize;
        if buf.len() != pw_len_idx + 1 + pw_len {
            return Err(SyncError::Truncated);
        }
        let password = buf[pw_len_idx + 1..].to_vec();
        Ok(Self { nick, password })
    }
}

/// A PeerInfoExchange request: an already-known-elsewhere peer introduces
/// itself directly (nick plus the role it claims to hold), so the
/// responder can validate the claim against its own replicated state
/// before admitting the connection, per the role-impostor check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfoRequest {
    pub nick: Vec<u8>,
    pub claimed_role: Role,
}

impl PeerInfoRequest {
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.nick.len());
        out.push(self.nick.len() as u8);
        out.extend_from_slice(&self.nick);
        out.push(role_to_byte(self.claimed_role));
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, SyncError> {
        if buf.is_empty() {
            return Err(SyncError::TooShort);
        }
        let nick_len = buf[0] as usize;
        if buf.len() < 1 + nick_len + 1 {
            return Err(SyncError::Truncated);
        }
        let nick = buf[1..1 + nick_len].to_vec();
        let claimed_role = role_from_byte(buf[1 + nick_len]).ok_or(SyncError::UnknownRole)?;
        Ok(Self { nick, claimed_role })
    }
}

/// The mirrored reply to a [`PeerInfoRequest`]: same shape, carried back
/// by the side that was contacted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfoResponse {
    pub nick: Vec<u8>,
    pub claimed_role: Role,
}

impl PeerInfoResponse {
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.nick.len());
        out.push(self.nick.len() as u8);
        out.extend_from_slice(&self.nick);
        out.push(role_to_byte(self.claimed_role));
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, SyncError> {
        if buf.is_empty() {
            return Err(SyncError::TooShort);
        }
        let nick_len = buf[0] as usize;
        if buf.len() < 1 + nick_len + 1 {
            return Err(SyncError::Truncated);
        }
        let nick = buf[1..1 + nick_len].to_vec();
        let claimed_role = role_from_byte(buf[1 + nick_len]).ok_or(SyncError::UnknownRole)?;
        Ok(Self { nick, claimed_role })
    }
}

/// Check whether an invite's literal password bytes match the group's
/// configured password (length and prefix compared exactly; no password
/// set means any request, including an empty one, is accepted).
pub fn password_matches(configured: Option<&[u8]>, offered: &[u8]) -> bool {
    match configured {
        None => true,
        Some(expected) => expected == offered,
    }
}

/// One entry of a sync response's peer list: a hint for reaching a
/// currently-confirmed peer, paired with its encryption key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPeerEntry {
    pub relay: RelayNode,
    pub enc_key: [u8; HALF_KEY_LEN],
}

impl SyncPeerEntry {
    fn packed_len(&self) -> usize {
        self.relay.packed_len() + HALF_KEY_LEN
    }

    fn write(&self, out: &mut Vec<u8>) {
        self.relay.write(out);
        out.extend_from_slice(&self.enc_key);
    }

    fn parse(buf: &[u8]) -> Option<(Self, &[u8])> {
        let (relay, rest) = RelayNode::parse(buf)?;
        if rest.len() < HALF_KEY_LEN {
            return None;
        }
        let mut enc_key = [0u8; HALF_KEY_LEN];
        enc_key.copy_from_slice(&rest[..HALF_KEY_LEN]);
        Some((Self { relay, enc_key }, &rest[HALF_KEY_LEN..]))
    }
}

/// The final message of the sync sequence: the list of currently-confirmed
/// peers (other than self and the joiner) with relay hints, used by the
/// joiner to install peer records and arm pending PeerInfoExchange
/// handshakes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncResponse {
    pub peers: Vec<SyncPeerEntry>,
}

impl SyncResponse {
    pub fn write(&self) -> Vec<u8> {
        let total: usize = self.peers.iter().map(SyncPeerEntry::packed_len).sum();
        let mut out = Vec::with_capacity(2 + total);
        out.extend_from_slice(&(self.peers.len() as u16).to_be_bytes());
        for entry in &self.peers {
            entry.write(&mut out);
        }
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, SyncError> {
        if buf.len() < 2 {
            return Err(SyncError::TooShort);
        }
        let count = u16::from_be_bytes(buf[..2].try_into().unwrap()) as usize;
        let mut rest = &buf[2..];
        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            let (entry, tail) = SyncPeerEntry::parse(rest).ok_or(SyncError::Truncated)?;
            peers.push(entry);
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(SyncError::Truncated);
        }
        Ok(Self { peers })
    }
}

/// A PeerAnnounce: tells existing peers a joiner exists, with enough of a
/// relay hint to start a handshake even before the sync response finishes
/// (the announcement itself always carries the relay, per design note).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAnnounce {
    pub enc_key: [u8; HALF_KEY_LEN],
    pub relay: RelayNode,
}

impl PeerAnnounce {
    pub fn write(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HALF_KEY_LEN + self.relay.packed_len());
        out.extend_from_slice(&self.enc_key);
        self.relay.write(&mut out);
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, SyncError> {
        if buf.len() < HALF_KEY_LEN {
            return Err(SyncError::TooShort);
        }
        let mut enc_key = [0u8; HALF_KEY_LEN];
        enc_key.copy_from_slice(&buf[..HALF_KEY_LEN]);
        let (relay, rest) = RelayNode::parse(&buf[HALF_KEY_LEN..]).ok_or(SyncError::Truncated)?;
        if !rest.is_empty() {
            return Err(SyncError::Truncated);
        }
        Ok(Self { enc_key, relay })
    }
}

pub fn write_reject(reason: RejectReason) -> [u8; 1] {
    [reason.to_byte()]
}

pub fn parse_reject(buf: &[u8]) -> Result<RejectReason, SyncError> {
    let byte = *buf.first().ok_or(SyncError::TooShort)?;
    RejectReason::from_byte(byte).ok_or(SyncError::UnknownReason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::IpPort;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn invite_request_round_trips() {
        let req = InviteRequest {
            nick: b"alice".to_vec(),
            password: b"hunter2".to_vec(),
        };
        let parsed = InviteRequest::parse(&req.write()).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn peer_info_request_and_response_round_trip() {
        use crate::peer::Role;
        let req = PeerInfoRequest {
            nick: b"carol".to_vec(),
            claimed_role: Role::Moderator,
        };
        assert_eq!(PeerInfoRequest::parse(&req.write()).unwrap(), req);

        let resp = PeerInfoResponse {
            nick: b"dave".to_vec(),
            claimed_role: Role::Founder,
        };
        assert_eq!(PeerInfoResponse::parse(&resp.write()).unwrap(), resp);
    }

    #[test]
    fn unknown_role_byte_is_rejected() {
        let mut bytes = PeerInfoRequest {
            nick: b"x".to_vec(),
            claimed_role: Role::User,
        }
        .write();
        *bytes.last_mut().unwrap() = 0xff;
        assert_eq!(PeerInfoRequest::parse(&bytes).unwrap_err(), SyncError::UnknownRole);
    }

    #[test]
    fn password_check_matches_s2_scenario() {
        assert!(!password_matches(Some(b"hunter2"), b"wrong"));
        assert!(password_matches(Some(b"hunter2"), b"hunter2"));
        assert!(password_matches(None, b""));
    }

    #[test]
    fn sync_response_round_trips_with_multiple_peers() {
        let relay = RelayNode {
            pk: [1u8; 32],
            addr: IpPort::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 1234),
        };
        let response = SyncResponse {
            peers: vec![
                SyncPeerEntry {
                    relay: relay.clone(),
                    enc_key: [2u8; HALF_KEY_LEN],
                },
                SyncPeerEntry {
                    relay,
                    enc_key: [3u8; HALF_KEY_LEN],
                },
            ],
        };
        let parsed = SyncResponse::parse(&response.write()).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn empty_sync_response_round_trips() {
        let response = SyncResponse::default();
        let parsed = SyncResponse::parse(&response.write()).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn peer_announce_round_trips() {
        let announce = PeerAnnounce {
            enc_key: [5u8; HALF_KEY_LEN],
            relay: RelayNode {
                pk: [6u8; 32],
                addr: IpPort::NONE,
            },
        };
        let parsed = PeerAnnounce::parse(&announce.write()).unwrap();
        assert_eq!(parsed, announce);
    }

    #[test]
    fn reject_reason_round_trips() {
        let bytes = write_reject(RejectReason::InvalidPassword);
        assert_eq!(parse_reject(&bytes).unwrap(), RejectReason::InvalidPassword);
    }
}
