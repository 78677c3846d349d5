// Copyright (c) 2024 Botho Foundation

//! Cryptographic primitives used by the group runtime.
//!
//! This module is the concrete implementation of the "Crypto" collaborator
//! interface named in the protocol: random bytes, Ed25519 sign/verify,
//! Ed25519 -> X25519 conversion, and an authenticated symmetric box. Every
//! other module reaches cryptography only through the types defined here.
//!
//! # Security
//!
//! Secret material implements [`Zeroize`]/[`ZeroizeOnDrop`] so it does not
//! linger in memory after a connection or key is dropped. `Debug` on secret
//! types never prints key bytes.

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey as XPublic, StaticSecret as XSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of an encryption or signature public key half, in bytes.
pub const HALF_KEY_LEN: usize = 32;
/// Length of a 64-byte extended public/secret key.
pub const EXT_KEY_LEN: usize = 64;
/// Length of an Ed25519 signature, in bytes.
pub const SIGNATURE_LEN: usize = 64;
/// Length of the handshake/session nonce, in bytes.
pub const NONCE_LEN: usize = 24;
/// Length of the Poly1305 authentication tag appended to every box.
pub const MAC_LEN: usize = 16;

const HKDF_INFO: &[u8] = b"ngc-session-key-v1";

/// Errors raised by the crypto layer. These never carry key material.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// a key or signature had the wrong length
    #[error("wrong length: expected {expected}, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    /// a public key did not decode to a valid curve point
    #[error("invalid public key encoding")]
    InvalidPoint,
    /// signature verification failed
    #[error("signature verification failed")]
    BadSignature,
    /// authenticated decryption failed (wrong key, tampered ciphertext, or bad nonce)
    #[error("authenticated decryption failed")]
    DecryptFailed,
}

/// A 64-byte extended public key: 32-byte X25519 encryption key followed by
/// a 32-byte Ed25519 signature key. Identifies a chat or a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtPublicKey {
    enc: [u8; HALF_KEY_LEN],
    sig: [u8; HALF_KEY_LEN],
}

impl ExtPublicKey {
    pub fn from_halves(enc: [u8; HALF_KEY_LEN], sig: [u8; HALF_KEY_LEN]) -> Self {
        Self { enc, sig }
    }

    /// Derive the full extended public key from a signature key alone,
    /// converting it to its X25519 encryption counterpart.
    pub fn from_sig_key(sig: [u8; HALF_KEY_LEN]) -> Result<Self, CryptoError> {
        let enc = ed25519_pk_to_x25519(&sig)?;
        Ok(Self { enc, sig })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != EXT_KEY_LEN {
            return Err(CryptoError::WrongLength {
                expected: EXT_KEY_LEN,
                actual: bytes.len(),
            });
        }
        let mut enc = [0u8; HALF_KEY_LEN];
        let mut sig = [0u8; HALF_KEY_LEN];
        enc.copy_from_slice(&bytes[..HALF_KEY_LEN]);
        sig.copy_from_slice(&bytes[HALF_KEY_LEN..]);
        Ok(Self { enc, sig })
    }

    pub fn to_bytes(self) -> [u8; EXT_KEY_LEN] {
        let mut out = [0u8; EXT_KEY_LEN];
        out[..HALF_KEY_LEN].copy_from_slice(&self.enc);
        out[HALF_KEY_LEN..].copy_from_slice(&self.sig);
        out
    }

    #[inline]
    pub fn enc_key(&self) -> &[u8; HALF_KEY_LEN] {
        &self.enc
    }

    #[inline]
    pub fn sig_key(&self) -> &[u8; HALF_KEY_LEN] {
        &self.sig
    }

    pub fn x25519(&self) -> XPublic {
        XPublic::from(self.enc)
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.sig).map_err(|_| CryptoError::InvalidPoint)
    }

    /// The 32-bit hash id used to demultiplex packets without decryption.
    pub fn hash_id(&self) -> u32 {
        hash_id(&self.sig)
    }
}

impl fmt::Debug for ExtPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtPublicKey(sig:{})", hex::encode(&self.sig[..8]))
    }
}

/// A 64-byte extended secret key: an X25519 static secret and an Ed25519
/// signing key derived from the same seed.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ExtSecretKey {
    #[zeroize(skip)]
    enc: XSecret,
    sig_bytes: [u8; HALF_KEY_LEN],
}

impl ExtSecretKey {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> (ExtPublicKey, Self) {
        let signing_key = SigningKey::generate(rng);
        let sig_bytes = signing_key.to_bytes();
        let enc = ed25519_sk_to_x25519(&signing_key);
        let pk = ExtPublicKey {
            enc: *XPublic::from(&enc).as_bytes(),
            sig: signing_key.verifying_key().to_bytes(),
        };
        (pk, Self { enc, sig_bytes })
    }

    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.sig_bytes)
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key().sign(msg).to_bytes()
    }

    pub fn x25519_secret(&self) -> &XSecret {
        &self.enc
    }

    /// Rebuild the full extended secret key from just the Ed25519 signing
    /// seed: the X25519 half is always re-derived from it, never stored
    /// independently, so the seed alone is sufficient for persistence.
    pub fn from_seed(sig_bytes: [u8; HALF_KEY_LEN]) -> Self {
        let signing_key = SigningKey::from_bytes(&sig_bytes);
        let enc = ed25519_sk_to_x25519(&signing_key);
        Self { enc, sig_bytes }
    }

    /// The Ed25519 signing seed this key was generated from, suitable for
    /// [`Self::from_seed`] to reconstruct it later.
    pub fn to_seed(&self) -> [u8; HALF_KEY_LEN] {
        self.sig_bytes
    }

    pub fn public(&self) -> ExtPublicKey {
        ExtPublicKey {
            enc: *XPublic::from(&self.enc).as_bytes(),
            sig: self.signing_key().verifying_key().to_bytes(),
        }
    }
}

impl fmt::Debug for ExtSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtSecretKey(..)")
    }
}

/// Convert an Ed25519 signature public key into its X25519 encryption
/// counterpart (birationally-equivalent Montgomery u-coordinate).
pub fn ed25519_pk_to_x25519(sig_pk: &[u8; HALF_KEY_LEN]) -> Result<[u8; HALF_KEY_LEN], CryptoError> {
    let compressed = CompressedEdwardsY(*sig_pk);
    let point = compressed.decompress().ok_or(CryptoError::InvalidPoint)?;
    Ok(point.to_montgomery().to_bytes())
}

/// Convert an Ed25519 signing key into the X25519 static secret used for
/// the chat/peer's long-term encryption identity.
pub fn ed25519_sk_to_x25519(signing_key: &SigningKey) -> XSecret {
    let expanded = Sha512::digest(signing_key.to_bytes());
    let mut clamped = [0u8; HALF_KEY_LEN];
    clamped.copy_from_slice(&expanded[..HALF_KEY_LEN]);
    XSecret::from(clamped)
}

/// Verify a detached Ed25519 signature under `pk` over `msg`.
pub fn verify(pk: &[u8; HALF_KEY_LEN], msg: &[u8], sig: &[u8; SIGNATURE_LEN]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(pk) else {
        return false;
    };
    let signature = Signature::from_bytes(sig);
    vk.verify(msg, &signature).is_ok()
}

/// A precomputed shared secret between a local session key and a peer's
/// session public key, used to encrypt/decrypt a whole connection's worth
/// of frames without re-running Diffie-Hellman per packet.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Rebuild a shared key from raw bytes, e.g. to hold a copy alongside
    /// a borrow of the map it was read out of.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hash = Sha256::digest(self.0);
        write!(f, "SharedKey(sha256:{})", hex::encode(&hash[..4]))
    }
}

/// Precompute the shared key between `my_secret` and `their_public`,
/// combining X25519 Diffie-Hellman with an HKDF-SHA256 extraction so the
/// resulting key is uniform even if the DH output is not.
pub fn precompute_shared_key(my_secret: &XSecret, their_public: &XPublic) -> SharedKey {
    let dh = my_secret.diffie_hellman(their_public);
    let hk = Hkdf::<Sha256>::new(None, dh.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    SharedKey(okm)
}

/// Generate a fresh random nonce for use with [`seal`]/[`open`].
pub fn random_nonce<R: RngCore + CryptoRng>(rng: &mut R) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    nonce
}

/// Authenticated-encrypt `plaintext` under `key` and `nonce`, returning
/// ciphertext with the 16-byte MAC appended.
pub fn seal(key: &SharedKey, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Vec<u8> {
    use chacha20poly1305::{
        aead::{Aead, KeyInit},
        Key, XChaCha20Poly1305, XNonce,
    };
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .expect("encryption with a fixed-size key/nonce never fails")
}

/// Authenticated-decrypt `ciphertext` (MAC included) under `key` and
/// `nonce`. Any tampering, wrong key, or truncation is reported as
/// [`CryptoError::DecryptFailed`], never a panic.
pub fn open(
    key: &SharedKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    use chacha20poly1305::{
        aead::{Aead, KeyInit},
        Key, XChaCha20Poly1305, XNonce,
    };
    if ciphertext.len() < MAC_LEN {
        return Err(CryptoError::DecryptFailed);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Jenkins one-at-a-time hash, truncated to 32 bits. Used only for cheap,
/// non-cryptographic demultiplexing (the "hash id" of the glossary) -
/// never for authentication.
pub fn hash_id(data: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &byte in data {
        hash = hash.wrapping_add(byte as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash = hash.wrapping_add(hash << 15);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn ed25519_to_x25519_roundtrip_matches_static_secret() {
        let mut rng = OsRng;
        let signing_key = SigningKey::generate(&mut rng);
        let derived_sk = ed25519_sk_to_x25519(&signing_key);
        let derived_pk_from_sk = XPublic::from(&derived_sk);
        let derived_pk_from_pk =
            ed25519_pk_to_x25519(&signing_key.verifying_key().to_bytes()).unwrap();
        assert_eq!(derived_pk_from_sk.as_bytes(), &derived_pk_from_pk);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let mut rng = OsRng;
        let (pk, sk) = ExtSecretKey::generate(&mut rng);
        let msg = b"shared state v1";
        let sig = sk.sign(msg);
        assert!(verify(pk.sig_key(), msg, &sig));
        assert!(!verify(pk.sig_key(), b"tampered", &sig));
    }

    #[test]
    fn seal_open_roundtrip() {
        let mut rng = OsRng;
        let (_, sk_a) = ExtSecretKey::generate(&mut rng);
        let (pk_b, sk_b) = ExtSecretKey::generate(&mut rng);
        let key_a = precompute_shared_key(sk_a.x25519_secret(), &pk_b.x25519());
        let key_b = precompute_shared_key(sk_b.x25519_secret(), &sk_a.public().x25519());
        let nonce = random_nonce(&mut rng);
        let ct = seal(&key_a, &nonce, b"hello group");
        let pt = open(&key_b, &nonce, &ct).unwrap();
        assert_eq!(pt, b"hello group");
    }

    #[test]
    fn open_rejects_tampered_ciphertext() {
        let mut rng = OsRng;
        let (_, sk_a) = ExtSecretKey::generate(&mut rng);
        let (pk_b, _) = ExtSecretKey::generate(&mut rng);
        let key = precompute_shared_key(sk_a.x25519_secret(), &pk_b.x25519());
        let nonce = random_nonce(&mut rng);
        let mut ct = seal(&key, &nonce, b"hello");
        let last = ct.len() - 1;
        ct[last] ^= 0xff;
        assert!(open(&key, &nonce, &ct).is_err());
    }

    #[test]
    fn hash_id_is_deterministic_and_differs_for_different_input() {
        assert_eq!(hash_id(b"abc"), hash_id(b"abc"));
        assert_ne!(hash_id(b"abc"), hash_id(b"abd"));
    }

    #[test]
    fn ext_public_key_bytes_roundtrip() {
        let mut rng = OsRng;
        let (pk, _) = ExtSecretKey::generate(&mut rng);
        let bytes = pk.to_bytes();
        let pk2 = ExtPublicKey::from_bytes(&bytes).unwrap();
        assert_eq!(pk, pk2);
    }

    #[test]
    fn ext_secret_key_seed_roundtrip_reproduces_both_halves() {
        let mut rng = OsRng;
        let (pk, sk) = ExtSecretKey::generate(&mut rng);
        let rebuilt = ExtSecretKey::from_seed(sk.to_seed());
        assert_eq!(rebuilt.public(), pk);
        let msg = b"persisted and reloaded";
        assert!(verify(pk.sig_key(), msg, &rebuilt.sign(msg)));
    }
}
