// Copyright (c) 2024 Botho Foundation

//! Broadcast frames: status/nick/message/moderation events sent to every
//! confirmed peer (or, for private messages, to one connection only).

use thiserror::Error;

/// The broadcast type byte. Values are stable protocol numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastType {
    Status,
    Nick,
    PlainMessage,
    ActionMessage,
    PrivateMessage,
    PeerExit,
    RemovePeer,
    RemoveBan,
    SetMod,
    SetObserver,
}

impl BroadcastType {
    fn to_byte(self) -> u8 {
        use BroadcastType::*;
        match self {
            Status => 0,
            Nick => 1,
            PlainMessage => 2,
            ActionMessage => 3,
            PrivateMessage => 4,
            PeerExit => 5,
            RemovePeer => 6,
            RemoveBan => 7,
            SetMod => 8,
            SetObserver => 9,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        use BroadcastType::*;
        Some(match b {
            0 => Status,
            1 => Nick,
            2 => PlainMessage,
            3 => ActionMessage,
            4 => PrivateMessage,
            5 => PeerExit,
            6 => RemovePeer,
            7 => RemoveBan,
            8 => SetMod,
            9 => SetObserver,
            _ => return None,
        })
    }

    /// Broadcasts that are point-to-point rather than fanned out to every
    /// confirmed peer.
    pub fn is_targeted(self) -> bool {
        matches!(self, BroadcastType::PrivateMessage)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BroadcastError {
    /// payload shorter than the fixed broadcast header
    #[error("payload shorter than the fixed broadcast header")]
    TooShort,
    /// unknown broadcast type byte
    #[error("unknown broadcast type byte")]
    UnknownType,
}

const HEADER_LEN: usize = 1 + 4 + 8;

/// A decoded broadcast frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast<'a> {
    pub kind: BroadcastType,
    pub sender_hash: u32,
    pub sender_timestamp: u64,
    pub payload: &'a [u8],
}

impl<'a> Broadcast<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, BroadcastError> {
        if buf.len() < HEADER_LEN {
            return Err(BroadcastError::TooShort);
        }
        let kind = BroadcastType::from_byte(buf[0]).ok_or(BroadcastError::UnknownType)?;
        let sender_hash = u32::from_be_bytes(buf[1..5].try_into().unwrap());
        let sender_timestamp = u64::from_be_bytes(buf[5..13].try_into().unwrap());
        Ok(Self {
            kind,
            sender_hash,
            sender_timestamp,
            payload: &buf[HEADER_LEN..],
        })
    }

    pub fn write(kind: BroadcastType, sender_hash: u32, sender_timestamp: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(kind.to_byte());
        out.extend_from_slice(&sender_hash.to_be_bytes());
        out.extend_from_slice(&sender_timestamp.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_payload() {
        let frame = Broadcast::write(BroadcastType::PlainMessage, 0x1234, 999, b"hi");
        let parsed = Broadcast::parse(&frame).unwrap();
        assert_eq!(parsed.kind, BroadcastType::PlainMessage);
        assert_eq!(parsed.sender_hash, 0x1234);
        assert_eq!(parsed.sender_timestamp, 999);
        assert_eq!(parsed.payload, b"hi");
    }

    #[test]
    fn too_short_is_rejected() {
        assert_eq!(Broadcast::parse(&[0u8; 5]).unwrap_err(), BroadcastError::TooShort);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut frame = Broadcast::write(BroadcastType::Status, 0, 0, b"");
        frame[0] = 200;
        assert_eq!(Broadcast::parse(&frame).unwrap_err(), BroadcastError::UnknownType);
    }

    #[test]
    fn private_message_is_targeted_others_are_broadcast() {
        assert!(BroadcastType::PrivateMessage.is_targeted());
        assert!(!BroadcastType::PlainMessage.is_targeted());
    }
}
