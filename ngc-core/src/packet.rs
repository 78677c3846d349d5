// Copyright (c) 2024 Botho Foundation

//! Wire framing for group packets: the outer plaintext header shared by
//! every frame, and the padded cleartext layout carried inside the
//! authenticated ciphertext of Lossless/Lossy frames.

use crate::crypto::{self, CryptoError, ExtPublicKey, SharedKey, HALF_KEY_LEN, MAC_LEN, NONCE_LEN};
use thiserror::Error;

/// Largest frame the transport will carry.
pub const MAX_FRAME_SIZE: usize = 65507;

/// Outer, never-encrypted discriminator placed on every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OuterKind {
    Handshake,
    Lossless,
    Lossy,
}

impl OuterKind {
    fn to_byte(self) -> u8 {
        match self {
            OuterKind::Handshake => 0,
            OuterKind::Lossless => 1,
            OuterKind::Lossy => 2,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(OuterKind::Handshake),
            1 => Some(OuterKind::Lossless),
            2 => Some(OuterKind::Lossy),
            _ => None,
        }
    }
}

/// Length of the plaintext outer header: kind(1) + chat hash(4) + sender
/// encryption key(32) + nonce(24).
pub const OUTER_HEADER_LEN: usize = 1 + 4 + HALF_KEY_LEN + NONCE_LEN;

/// Smallest legal plaintext payload inside a Lossless frame:
/// type(1) + message id(8).
pub const MIN_LOSSLESS_PLAINTEXT: usize = 1 + 8;
/// Smallest legal plaintext payload inside a Lossy frame: type(1).
pub const MIN_LOSSY_PLAINTEXT: usize = 1;

/// Errors from wrapping/unwrapping a frame. All are "drop silently" per the
/// taxonomy; none carry enough detail to help an attacker iterate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// frame shorter than the outer header
    #[error("frame shorter than the outer header")]
    TooShortForHeader,
    /// unknown outer kind byte
    #[error("unknown outer kind byte")]
    UnknownOuterKind,
    /// frame exceeds the maximum on-wire size
    #[error("frame exceeds the maximum on-wire size")]
    TooLarge,
    /// authenticated decryption failed
    #[error("authenticated decryption failed")]
    DecryptFailed,
    /// cleartext payload shorter than the inner type requires
    #[error("cleartext payload shorter than the inner type requires")]
    TooShortForInner,
    /// cleartext was all zero padding with no type byte
    #[error("cleartext was all zero padding with no type byte")]
    NoInnerType,
    /// the sender's claimed key does not hash to the claimed sender hash
    #[error("sender hash mismatch")]
    SenderHashMismatch,
}

impl From<CryptoError> for PacketError {
    fn from(_: CryptoError) -> Self {
        PacketError::DecryptFailed
    }
}

/// The plaintext outer header common to every frame.
#[derive(Debug, Clone, Copy)]
pub struct OuterHeader {
    pub kind: OuterKind,
    pub chat_hash: u32,
    pub sender_enc_key: [u8; HALF_KEY_LEN],
    pub nonce: [u8; NONCE_LEN],
}

impl OuterHeader {
    pub fn parse(frame: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if frame.len() < OUTER_HEADER_LEN {
            return Err(PacketError::TooShortForHeader);
        }
        let kind = OuterKind::from_byte(frame[0]).ok_or(PacketError::UnknownOuterKind)?;
        let chat_hash = u32::from_be_bytes(frame[1..5].try_into().unwrap());
        let mut sender_enc_key = [0u8; HALF_KEY_LEN];
        sender_enc_key.copy_from_slice(&frame[5..5 + HALF_KEY_LEN]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&frame[5 + HALF_KEY_LEN..OUTER_HEADER_LEN]);
        Ok((
            Self {
                kind,
                chat_hash,
                sender_enc_key,
                nonce,
            },
            &frame[OUTER_HEADER_LEN..],
        ))
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.kind.to_byte());
        out.extend_from_slice(&self.chat_hash.to_be_bytes());
        out.extend_from_slice(&self.sender_enc_key);
        out.extend_from_slice(&self.nonce);
    }
}

/// An inner packet type: the first cleartext byte found after padding is
/// stripped. Values are stable protocol numbers; unknown ones are dropped
/// by the caller with a warning, not treated as an error here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerType(pub u8);

pub mod inner {
    use super::InnerType;
    // Padding is zero bytes, and the type byte is recovered as "the first
    // non-zero byte after padding" (see `strip_padding`), so 0 is not a
    // legal type value: it would be indistinguishable from padding for any
    // frame whose real payload happens to start at the type byte.
    pub const SYNC_REQUEST: InnerType = InnerType(1);
    pub const SYNC_RESPONSE: InnerType = InnerType(2);
    pub const INVITE_REQUEST: InnerType = InnerType(3);
    pub const INVITE_RESPONSE: InnerType = InnerType(4);
    pub const PEER_INFO_REQUEST: InnerType = InnerType(5);
    pub const PEER_INFO_RESPONSE: InnerType = InnerType(6);
    pub const PEER_ANNOUNCE: InnerType = InnerType(7);
    pub const SHARED_STATE: InnerType = InnerType(8);
    pub const MOD_LIST: InnerType = InnerType(9);
    pub const SANCTIONS_LIST: InnerType = InnerType(10);
    pub const TOPIC: InnerType = InnerType(11);
    pub const HS_RESPONSE_ACK: InnerType = InnerType(12);
    pub const BROADCAST: InnerType = InnerType(13);
    pub const MESSAGE_ACK: InnerType = InnerType(14);
    pub const PING: InnerType = InnerType(15);
    pub const INVITE_RESPONSE_REJECT: InnerType = InnerType(16);
    pub const TCP_RELAYS: InnerType = InnerType(17);
    pub const IP_PORT: InnerType = InnerType(18);
    pub const CUSTOM_PACKET: InnerType = InnerType(19);
}

/// A decoded Lossless frame: inner type, 64-bit message id, and payload.
pub struct LosslessPlaintext<'a> {
    pub inner_type: InnerType,
    pub message_id: u64,
    pub payload: &'a [u8],
}

/// A decoded Lossy frame: inner type and payload, no message id.
pub struct LossyPlaintext<'a> {
    pub inner_type: InnerType,
    pub payload: &'a [u8],
}

/// Strip leading zero padding bytes and return the first non-zero byte
/// (the inner type) plus everything after it.
fn strip_padding(cleartext: &[u8]) -> Result<(u8, &[u8]), PacketError> {
    let mut idx = 0;
    while idx < cleartext.len() && cleartext[idx] == 0 {
        idx += 1;
    }
    if idx == cleartext.len() {
        return Err(PacketError::NoInnerType);
    }
    Ok((cleartext[idx], &cleartext[idx + 1..]))
}

/// Pad `body` (type byte + payload, already concatenated) to the next
/// multiple of 8 with leading zero bytes, up to `max_len`.
fn pad_to_multiple_of_8(body: &[u8], max_len: usize) -> Vec<u8> {
    let padded_len = body.len().div_ceil(8) * 8;
    let padded_len = padded_len.min(max_len.max(body.len()));
    let pad = padded_len.saturating_sub(body.len());
    let mut out = Vec::with_capacity(pad + body.len());
    out.resize(pad, 0);
    out.extend_from_slice(body);
    out
}

/// Unwrap a Lossless frame: parse the outer header, verify the sender
/// hash, decrypt with `shared_key`, and split padding/type/message
/// id/payload.
pub fn unwrap_lossless<'a>(
    frame: &'a [u8],
    sender_pk: &ExtPublicKey,
    shared_key: &SharedKey,
    scratch: &'a mut Vec<u8>,
) -> Result<LosslessPlaintext<'a>, PacketError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(PacketError::TooLarge);
    }
    let (header, ciphertext) = OuterHeader::parse(frame)?;
    if header.kind != OuterKind::Lossless {
        return Err(PacketError::UnknownOuterKind);
    }
    verify_sender_hash(&header, sender_pk)?;
    *scratch = crypto::open(shared_key, &header.nonce, ciphertext)?;
    if scratch.len() < MIN_LOSSLESS_PLAINTEXT {
        return Err(PacketError::TooShortForInner);
    }
    let (ty, rest) = strip_padding(scratch)?;
    if rest.len() < 8 {
        return Err(PacketError::TooShortForInner);
    }
    let message_id = u64::from_be_bytes(rest[..8].try_into().unwrap());
    Ok(LosslessPlaintext {
        inner_type: InnerType(ty),
        message_id,
        payload: &rest[8..],
    })
}

/// Unwrap a Lossy frame: same as [`unwrap_lossless`] but without a message id.
pub fn unwrap_lossy<'a>(
    frame: &'a [u8],
    sender_pk: &ExtPublicKey,
    shared_key: &SharedKey,
    scratch: &'a mut Vec<u8>,
) -> Result<LossyPlaintext<'a>, PacketError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(PacketError::TooLarge);
    }
    let (header, ciphertext) = OuterHeader::parse(frame)?;
    if header.kind != OuterKind::Lossy {
        return Err(PacketError::UnknownOuterKind);
    }
    verify_sender_hash(&header, sender_pk)?;
    *scratch = crypto::open(shared_key, &header.nonce, ciphertext)?;
    if scratch.len() < MIN_LOSSY_PLAINTEXT {
        return Err(PacketError::TooShortForInner);
    }
    let (ty, rest) = strip_padding(scratch)?;
    Ok(LossyPlaintext {
        inner_type: InnerType(ty),
        payload: rest,
    })
}

fn verify_sender_hash(header: &OuterHeader, claimed_sender: &ExtPublicKey) -> Result<(), PacketError> {
    if header.sender_enc_key != *claimed_sender.enc_key() {
        return Err(PacketError::SenderHashMismatch);
    }
    Ok(())
}

/// Build a Lossless frame: pad(type + message_id + payload), encrypt under
/// `shared_key`/`nonce`, and prefix the outer header.
pub fn wrap_lossless(
    chat_hash: u32,
    self_enc_key: [u8; HALF_KEY_LEN],
    nonce: [u8; NONCE_LEN],
    shared_key: &SharedKey,
    inner_type: InnerType,
    message_id: u64,
    payload: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + 8 + payload.len());
    body.push(inner_type.0);
    body.extend_from_slice(&message_id.to_be_bytes());
    body.extend_from_slice(payload);
    let cleartext = pad_to_multiple_of_8(&body, MAX_FRAME_SIZE);
    let ciphertext = crypto::seal(shared_key, &nonce, &cleartext);
    finish_frame(OuterKind::Lossless, chat_hash, self_enc_key, nonce, ciphertext)
}

/// Build a Lossy frame: pad(type + payload), encrypt, prefix header.
pub fn wrap_lossy(
    chat_hash: u32,
    self_enc_key: [u8; HALF_KEY_LEN],
    nonce: [u8; NONCE_LEN],
    shared_key: &SharedKey,
    inner_type: InnerType,
    payload: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + payload.len());
    body.push(inner_type.0);
    body.extend_from_slice(payload);
    let cleartext = pad_to_multiple_of_8(&body, MAX_FRAME_SIZE);
    let ciphertext = crypto::seal(shared_key, &nonce, &cleartext);
    finish_frame(OuterKind::Lossy, chat_hash, self_enc_key, nonce, ciphertext)
}

/// Seal a handshake payload as an `OuterKind::Handshake` frame. Unlike
/// Lossless/Lossy frames, there is no padding or inner type byte: the
/// ciphertext is exactly the handshake payload's own wire encoding, and the
/// AEAD key is the static long-term shared key between the two peers'
/// encryption keys rather than a per-connection session key.
pub fn wrap_handshake(
    chat_hash: u32,
    self_enc_key: [u8; HALF_KEY_LEN],
    nonce: [u8; NONCE_LEN],
    static_shared_key: &SharedKey,
    payload: &[u8],
) -> Vec<u8> {
    let ciphertext = crypto::seal(static_shared_key, &nonce, payload);
    finish_frame(OuterKind::Handshake, chat_hash, self_enc_key, nonce, ciphertext)
}

/// Unwrap an `OuterKind::Handshake` frame, decrypting under the static
/// shared key precomputed from the two peers' long-term encryption keys.
/// There is no sender-hash header check here (no table entry exists yet to
/// compare against); the handshake payload's own `sender_hash` field is the
/// forgery check, applied by the caller once the payload is parsed.
pub fn unwrap_handshake(frame: &[u8], static_shared_key: &SharedKey) -> Result<(OuterHeader, Vec<u8>), PacketError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(PacketError::TooLarge);
    }
    let (header, ciphertext) = OuterHeader::parse(frame)?;
    if header.kind != OuterKind::Handshake {
        return Err(PacketError::UnknownOuterKind);
    }
    let plaintext = crypto::open(static_shared_key, &header.nonce, ciphertext)?;
    Ok((header, plaintext))
}

fn finish_frame(
    kind: OuterKind,
    chat_hash: u32,
    sender_enc_key: [u8; HALF_KEY_LEN],
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
) -> Vec<u8> {
    let header = OuterHeader {
        kind,
        chat_hash,
        sender_enc_key,
        nonce,
    };
    let mut out = Vec::with_capacity(OUTER_HEADER_LEN + ciphertext.len());
    header.write(&mut out);
    out.extend_from_slice(&ciphertext);
    out
}

/// Peek the chat hash id out of any frame without decrypting, to select
/// which group should handle it.
pub fn peek_chat_hash(frame: &[u8]) -> Result<u32, PacketError> {
    Ok(OuterHeader::parse(frame)?.0.chat_hash)
}

const _: () = assert!(MAC_LEN == 16);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{precompute_shared_key, ExtSecretKey};
    use rand::rngs::OsRng;

    fn pair() -> (ExtPublicKey, ExtSecretKey, ExtPublicKey, ExtSecretKey) {
        let mut rng = OsRng;
        let (pk_a, sk_a) = ExtSecretKey::generate(&mut rng);
        let (pk_b, sk_b) = ExtSecretKey::generate(&mut rng);
        (pk_a, sk_a, pk_b, sk_b)
    }

    #[test]
    fn lossless_round_trip() {
        let (pk_a, sk_a, pk_b, sk_b) = pair();
        let key_a = precompute_shared_key(sk_a.x25519_secret(), &pk_b.x25519());
        let key_b = precompute_shared_key(sk_b.x25519_secret(), &pk_a.x25519());
        let nonce = crypto::random_nonce(&mut OsRng);
        let frame = wrap_lossless(
            0xdead_beef,
            *pk_a.enc_key(),
            nonce,
            &key_a,
            inner::PING,
            42,
            b"payload",
        );
        let mut scratch = Vec::new();
        let decoded = unwrap_lossless(&frame, &pk_a, &key_b, &mut scratch).unwrap();
        assert_eq!(decoded.inner_type, inner::PING);
        assert_eq!(decoded.message_id, 42);
        assert_eq!(decoded.payload, b"payload");
    }

    #[test]
    fn lossy_round_trip_empty_payload() {
        let (pk_a, sk_a, pk_b, sk_b) = pair();
        let key_a = precompute_shared_key(sk_a.x25519_secret(), &pk_b.x25519());
        let key_b = precompute_shared_key(sk_b.x25519_secret(), &pk_a.x25519());
        let nonce = crypto::random_nonce(&mut OsRng);
        let frame = wrap_lossy(1, *pk_a.enc_key(), nonce, &key_a, inner::MESSAGE_ACK, &[]);
        let mut scratch = Vec::new();
        let decoded = unwrap_lossy(&frame, &pk_a, &key_b, &mut scratch).unwrap();
        assert_eq!(decoded.inner_type, inner::MESSAGE_ACK);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn too_short_frame_is_rejected() {
        let junk = [0u8; 4];
        assert_eq!(
            OuterHeader::parse(&junk).unwrap_err(),
            PacketError::TooShortForHeader
        );
    }

    #[test]
    fn unknown_outer_kind_is_rejected() {
        let mut frame = vec![0xff; OUTER_HEADER_LEN + 20];
        frame[0] = 99;
        assert!(matches!(
            OuterHeader::parse(&frame),
            Err(PacketError::UnknownOuterKind)
        ));
    }

    #[test]
    fn sender_hash_mismatch_is_rejected() {
        let (pk_a, sk_a, pk_b, sk_b) = pair();
        let key_a = precompute_shared_key(sk_a.x25519_secret(), &pk_b.x25519());
        let key_b = precompute_shared_key(sk_b.x25519_secret(), &pk_a.x25519());
        let nonce = crypto::random_nonce(&mut OsRng);
        let frame = wrap_lossy(1, *pk_a.enc_key(), nonce, &key_a, inner::PING, b"x");
        let mut scratch = Vec::new();
        // Claim the frame came from pk_b while the header actually carries pk_a's key.
        let err = unwrap_lossy(&frame, &pk_b, &key_b, &mut scratch).unwrap_err();
        assert_eq!(err, PacketError::SenderHashMismatch);
    }

    #[test]
    fn decryption_failure_with_wrong_key_is_rejected() {
        let (pk_a, sk_a, pk_b, _sk_b) = pair();
        let (_pk_c, sk_c) = {
            let mut rng = OsRng;
            ExtSecretKey::generate(&mut rng)
        };
        let key_a = precompute_shared_key(sk_a.x25519_secret(), &pk_b.x25519());
        let wrong_key = precompute_shared_key(sk_c.x25519_secret(), &pk_a.x25519());
        let nonce = crypto::random_nonce(&mut OsRng);
        let frame = wrap_lossy(1, *pk_a.enc_key(), nonce, &key_a, inner::PING, b"x");
        let mut scratch = Vec::new();
        assert!(unwrap_lossy(&frame, &pk_a, &wrong_key, &mut scratch).is_err());
    }

    #[test]
    fn padding_always_pads_to_multiple_of_8() {
        for len in 0..20 {
            let body = vec![1u8; len];
            let padded = pad_to_multiple_of_8(&body, MAX_FRAME_SIZE);
            assert_eq!(padded.len() % 8, 0);
            assert!(padded.len() >= body.len());
        }
    }

    #[test]
    fn handshake_round_trip_uses_the_static_key_not_a_session_key() {
        let (pk_a, sk_a, pk_b, sk_b) = pair();
        let static_a = precompute_shared_key(sk_a.x25519_secret(), &pk_b.x25519());
        let static_b = precompute_shared_key(sk_b.x25519_secret(), &pk_a.x25519());
        let nonce = crypto::random_nonce(&mut OsRng);
        let frame = wrap_handshake(0xabcd, *pk_a.enc_key(), nonce, &static_a, b"hello handshake");
        let (header, plaintext) = unwrap_handshake(&frame, &static_b).unwrap();
        assert_eq!(header.kind, OuterKind::Handshake);
        assert_eq!(header.sender_enc_key, *pk_a.enc_key());
        assert_eq!(plaintext, b"hello handshake");
    }

    #[test]
    fn handshake_frame_rejected_by_lossless_unwrap() {
        let (pk_a, sk_a, pk_b, sk_b) = pair();
        let static_a = precompute_shared_key(sk_a.x25519_secret(), &pk_b.x25519());
        let static_b = precompute_shared_key(sk_b.x25519_secret(), &pk_a.x25519());
        let nonce = crypto::random_nonce(&mut OsRng);
        let frame = wrap_handshake(1, *pk_a.enc_key(), nonce, &static_a, b"x");
        let mut scratch = Vec::new();
        assert!(unwrap_lossless(&frame, &pk_a, &static_b, &mut scratch).is_err());
    }

    #[test]
    fn peek_chat_hash_does_not_require_decryption() {
        let (pk_a, sk_a, pk_b, _) = pair();
        let key_a = precompute_shared_key(sk_a.x25519_secret(), &pk_b.x25519());
        let nonce = crypto::random_nonce(&mut OsRng);
        let frame = wrap_lossy(0x1234_5678, *pk_a.enc_key(), nonce, &key_a, inner::PING, b"x");
        assert_eq!(peek_chat_hash(&frame).unwrap(), 0x1234_5678);
    }
}
