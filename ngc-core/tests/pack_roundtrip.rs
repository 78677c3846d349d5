// Copyright (c) 2024 Botho Foundation
//
//! Pack/unpack round-trip coverage at the crate's public API boundary:
//! every wire-format codec the protocol defines should hand back exactly
//! what was packed, whether that's an encrypted frame or one of the
//! replicated-state inner payloads carried inside one.

use ngc_core::crypto::{self, precompute_shared_key, verify, ExtSecretKey};
use ngc_core::packet::{self, inner};
use ngc_core::state::moderators::ModList;
use ngc_core::state::sanctions::{SanctionEntry, SanctionKind, SanctionsList};
use ngc_core::state::shared_state::{PrivacyState, SharedState, SignedSharedState};
use ngc_core::state::topic::Topic;
use rand::rngs::OsRng;

fn keypair() -> (ngc_core::crypto::ExtPublicKey, ExtSecretKey) {
    let mut rng = OsRng;
    ExtSecretKey::generate(&mut rng)
}

#[test]
fn lossless_frame_round_trips_through_wrap_and_unwrap() {
    let (pk_a, sk_a) = keypair();
    let (pk_b, sk_b) = keypair();
    let key_a = precompute_shared_key(sk_a.x25519_secret(), &pk_b.x25519());
    let key_b = precompute_shared_key(sk_b.x25519_secret(), &pk_a.x25519());
    let nonce = crypto::random_nonce(&mut OsRng);

    let frame = packet::wrap_lossless(0x1122_3344, *pk_a.enc_key(), nonce, &key_a, inner::BROADCAST, 7, b"hello group");

    let mut scratch = Vec::new();
    let decoded = packet::unwrap_lossless(&frame, &pk_a, &key_b, &mut scratch).unwrap();
    assert_eq!(decoded.inner_type, inner::BROADCAST);
    assert_eq!(decoded.message_id, 7);
    assert_eq!(decoded.payload, b"hello group");
}

#[test]
fn lossy_frame_round_trips_with_every_declared_inner_type() {
    let (pk_a, sk_a) = keypair();
    let (pk_b, sk_b) = keypair();
    let key_a = precompute_shared_key(sk_a.x25519_secret(), &pk_b.x25519());
    let key_b = precompute_shared_key(sk_b.x25519_secret(), &pk_a.x25519());

    let types = [
        inner::SYNC_REQUEST,
        inner::SYNC_RESPONSE,
        inner::INVITE_REQUEST,
        inner::INVITE_RESPONSE,
        inner::INVITE_RESPONSE_REJECT,
        inner::PEER_INFO_REQUEST,
        inner::PEER_INFO_RESPONSE,
        inner::PEER_ANNOUNCE,
        inner::SHARED_STATE,
        inner::MOD_LIST,
        inner::SANCTIONS_LIST,
        inner::TOPIC,
        inner::HS_RESPONSE_ACK,
        inner::MESSAGE_ACK,
        inner::PING,
        inner::TCP_RELAYS,
        inner::IP_PORT,
        inner::CUSTOM_PACKET,
    ];

    for ty in types {
        let nonce = crypto::random_nonce(&mut OsRng);
        let frame = packet::wrap_lossy(42, *pk_a.enc_key(), nonce, &key_a, ty, b"payload bytes");
        let mut scratch = Vec::new();
        let decoded = packet::unwrap_lossy(&frame, &pk_a, &key_b, &mut scratch).unwrap();
        assert_eq!(decoded.inner_type, ty);
        assert_eq!(decoded.payload, b"payload bytes");
    }
}

#[test]
fn handshake_frame_round_trips_under_the_static_shared_key() {
    let (pk_a, sk_a) = keypair();
    let (pk_b, sk_b) = keypair();
    let static_a = precompute_shared_key(sk_a.x25519_secret(), &pk_b.x25519());
    let static_b = precompute_shared_key(sk_b.x25519_secret(), &pk_a.x25519());
    let nonce = crypto::random_nonce(&mut OsRng);

    let frame = packet::wrap_handshake(0x99, *pk_a.enc_key(), nonce, &static_a, b"handshake payload bytes");
    let (header, plaintext) = packet::unwrap_handshake(&frame, &static_b).unwrap();
    assert_eq!(header.sender_enc_key, *pk_a.enc_key());
    assert_eq!(plaintext, b"handshake payload bytes");
}

#[test]
fn ext_secret_key_round_trips_through_its_persistable_seed() {
    let (pk, sk) = keypair();
    let rebuilt = ExtSecretKey::from_seed(sk.to_seed());
    assert_eq!(rebuilt.public(), pk);
    let msg = b"seed round trip";
    assert!(verify(pk.sig_key(), msg, &rebuilt.sign(msg)));
}

#[test]
fn signed_shared_state_round_trips_through_its_wire_encoding() {
    let (founder_pk, founder_sk) = keypair();
    let state = SharedState {
        founder: founder_pk,
        max_peers: 64,
        name: b"roundtrip group".to_vec(),
        privacy: PrivacyState::Private,
        password: Some(b"hunter2".to_vec()),
        mod_list_hash: [7u8; 32],
        version: 3,
    };
    let signed = SignedSharedState::sign(state.clone(), |msg| founder_sk.sign(msg));
    assert!(signed.verify(founder_pk.sig_key()));

    let wire = signed.to_wire();
    let parsed = SignedSharedState::from_wire(&wire).unwrap();
    assert_eq!(parsed.state, state);
    assert!(parsed.verify(founder_pk.sig_key()));
}

#[test]
fn mod_list_round_trips_through_its_wire_encoding() {
    let (_, sk_a) = keypair();
    let (_, sk_b) = keypair();
    let mut list = ModList::new();
    list.add(sk_a.public().sig_key().to_owned());
    list.add(sk_b.public().sig_key().to_owned());

    let bytes = list.to_bytes();
    let parsed = ModList::from_bytes(&bytes).unwrap();
    assert_eq!(parsed.len(), list.len());
    for key in list.iter() {
        assert!(parsed.contains(key));
    }
    assert_eq!(parsed.hash(), list.hash());
}

#[test]
fn sanctions_list_round_trips_through_its_wire_encoding() {
    let (_, founder_sk) = keypair();
    let (target_pk, _target_sk) = keypair();

    let mut list = SanctionsList::new();
    let entry = SanctionEntry {
        timestamp: 1_700_000_000,
        target_enc_key: *target_pk.enc_key(),
        target_ip: None,
        kind: SanctionKind::Ban,
        signer_sig_key: *founder_sk.public().sig_key(),
        signature: [0u8; 64],
    };
    list.append_signed(entry, |msg| founder_sk.sign(msg)).unwrap();

    let wire = list.to_wire();
    let (entries, version, hash) = SanctionsList::parse_wire(&wire).unwrap();
    assert_eq!(entries.len(), list.entries().len());
    assert_eq!(entries[0].target_enc_key, *target_pk.enc_key());
    assert_eq!(version, list.credentials_version());
    assert_eq!(hash, list.credentials_hash());
}

#[test]
fn topic_round_trips_through_its_wire_encoding() {
    let (_, founder_sk) = keypair();
    let topic = Topic::sign(b"what are we talking about".to_vec(), 1, *founder_sk.public().sig_key(), |msg| {
        founder_sk.sign(msg)
    });

    let wire = topic.to_wire();
    let parsed = Topic::from_wire(&wire).unwrap();
    assert_eq!(parsed, topic);
}
