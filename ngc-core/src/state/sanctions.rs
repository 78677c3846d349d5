// Copyright (c) 2024 Botho Foundation

//! The sanctions list: an append-only, chained-credentials log of Ban and
//! Observer entries, each signed by the moderator or founder that issued
//! it.

use crate::crypto::{verify, SIGNATURE_LEN};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

pub const MAX_SANCTIONS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanctionKind {
    Ban,
    Observer,
}

impl SanctionKind {
    fn to_byte(self) -> u8 {
        match self {
            SanctionKind::Ban => 0,
            SanctionKind::Observer => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(SanctionKind::Ban),
            1 => Some(SanctionKind::Observer),
            _ => None,
        }
    }
}

/// One signed entry in the sanctions list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanctionEntry {
    pub timestamp: u64,
    pub target_enc_key: [u8; 32],
    pub target_ip: Option<IpAddr>,
    pub kind: SanctionKind,
    pub signer_sig_key: [u8; 32],
    pub signature: [u8; SIGNATURE_LEN],
}

impl SanctionEntry {
    /// The signable body: everything but the signature itself.
    fn body_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.target_enc_key);
        match self.target_ip {
            None => out.push(0),
            Some(IpAddr::V4(v4)) => {
                out.push(4);
                out.extend_from_slice(&v4.octets());
            }
            Some(IpAddr::V6(v6)) => {
                out.push(6);
                out.extend_from_slice(&v6.octets());
            }
        }
        out.push(self.kind.to_byte());
        out.extend_from_slice(&self.signer_sig_key);
        out
    }

    /// Pack a full on-wire entry: signable body plus the detached signature.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.body_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    /// Parse one on-wire entry from the front of `buf`, returning the
    /// remainder for the next entry.
    fn parse(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < 8 + 32 + 1 {
            return None;
        }
        let timestamp = u64::from_be_bytes(buf[..8].try_into().ok()?);
        let mut target_enc_key = [0u8; 32];
        target_enc_key.copy_from_slice(&buf[8..40]);
        let family = buf[40];
        let mut idx = 41;
        let target_ip = match family {
            0 => None,
            4 => {
                if buf.len() < idx + 4 {
                    return None;
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[idx..idx + 4]);
                idx += 4;
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            6 => {
                if buf.len() < idx + 16 {
                    return None;
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[idx..idx + 16]);
                idx += 16;
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => return None,
        };
        if buf.len() < idx + 1 + 32 + SIGNATURE_LEN {
            return None;
        }
        let kind = SanctionKind::from_byte(buf[idx])?;
        idx += 1;
        let mut signer_sig_key = [0u8; 32];
        signer_sig_key.copy_from_slice(&buf[idx..idx + 32]);
        idx += 32;
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&buf[idx..idx + SIGNATURE_LEN]);
        idx += SIGNATURE_LEN;
        Some((
            Self {
                timestamp,
                target_enc_key,
                target_ip,
                kind,
                signer_sig_key,
                signature,
            },
            &buf[idx..],
        ))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SanctionsError {
    /// the list exceeds the maximum entry count
    #[error("sanctions list exceeds the maximum entry count")]
    TooManyEntries,
    /// an entry's signature does not verify
    #[error("sanction entry signature does not verify")]
    BadSignature,
    /// the chained credentials hash does not match
    #[error("chained credentials hash does not match")]
    CredentialsMismatch,
    /// a new credentials version was not strictly greater than the held one
    #[error("credentials version did not strictly advance")]
    VersionNotAdvanced,
}

/// The sanctions list plus its chained credentials: a running hash over
/// the ordered entries, and a strictly-advancing version counter.
#[derive(Debug, Clone, Default)]
pub struct SanctionsList {
    entries: Vec<SanctionEntry>,
    credentials_version: u32,
    credentials_hash: [u8; 32],
}

impl SanctionsList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[SanctionEntry] {
        &self.entries
    }

    pub fn credentials_version(&self) -> u32 {
        self.credentials_version
    }

    pub fn credentials_hash(&self) -> [u8; 32] {
        self.credentials_hash
    }

    pub fn is_banned(&self, enc_key: &[u8; 32]) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind == SanctionKind::Ban && &e.target_enc_key == enc_key)
    }

    pub fn is_observer(&self, enc_key: &[u8; 32]) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind == SanctionKind::Observer && &e.target_enc_key == enc_key)
    }

    fn chain(previous_hash: &[u8; 32], entry: &SanctionEntry) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(previous_hash);
        hasher.update(entry.body_bytes());
        hasher.finalize().into()
    }

    /// Append a locally-issued entry: signs over (previous credentials
    /// hash, entry body) and advances the chain.
    pub fn append_signed(
        &mut self,
        mut entry: SanctionEntry,
        sign: impl FnOnce(&[u8]) -> [u8; SIGNATURE_LEN],
    ) -> Result<(), SanctionsError> {
        if self.entries.len() >= MAX_SANCTIONS {
            return Err(SanctionsError::TooManyEntries);
        }
        let mut msg = self.credentials_hash.to_vec();
        msg.extend_from_slice(&entry.body_bytes());
        entry.signature = sign(&msg);
        self.credentials_hash = Self::chain(&self.credentials_hash, &entry);
        self.credentials_version = self.credentials_version.saturating_add(1);
        self.entries.push(entry);
        Ok(())
    }

    /// Pack the whole list for transmission as a `SanctionsList` inner
    /// packet: entry count, entries, credentials version, credentials hash.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.entries.len() as u16).to_be_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.to_bytes());
        }
        out.extend_from_slice(&self.credentials_version.to_be_bytes());
        out.extend_from_slice(&self.credentials_hash);
        out
    }

    /// Parse an on-wire sanctions list into its raw parts, leaving
    /// verification (and thus installation) to [`Self::verify_and_replace`].
    pub fn parse_wire(buf: &[u8]) -> Result<(Vec<SanctionEntry>, u32, [u8; 32]), SanctionsError> {
        if buf.len() < 2 {
            return Err(SanctionsError::TooManyEntries);
        }
        let count = u16::from_be_bytes(buf[..2].try_into().unwrap()) as usize;
        if count > MAX_SANCTIONS {
            return Err(SanctionsError::TooManyEntries);
        }
        let mut rest = &buf[2..];
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let (entry, tail) = SanctionEntry::parse(rest).ok_or(SanctionsError::TooManyEntries)?;
            entries.push(entry);
            rest = tail;
        }
        if rest.len() < 4 + 32 {
            return Err(SanctionsError::TooManyEntries);
        }
        let version = u32::from_be_bytes(rest[..4].try_into().unwrap());
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&rest[4..36]);
        Ok((entries, version, hash))
    }

    /// Rebuild the list under a single signer, re-signing every retained
    /// entry and recomputing the chain from scratch. Reattributing or
    /// dropping any entry changes the chain input for everything after it,
    /// so a partial re-sign is not expressible; the caller (always the
    /// founder, re-rooting credentials after a ban removal or a demoted
    /// moderator's entries) re-signs the whole retained set at once.
    pub fn rebuild_signed(
        &mut self,
        entries: Vec<SanctionEntry>,
        signer_sig_key: [u8; 32],
        mut sign: impl FnMut(&[u8]) -> [u8; SIGNATURE_LEN],
    ) -> Result<(), SanctionsError> {
        if entries.len() > MAX_SANCTIONS {
            return Err(SanctionsError::TooManyEntries);
        }
        let mut rebuilt = SanctionsList::new();
        for mut entry in entries {
            entry.signer_sig_key = signer_sig_key;
            rebuilt.append_signed(entry, |msg| sign(msg))?;
        }
        *self = rebuilt;
        Ok(())
    }

    /// Verify and install a full incoming list (e.g. from a sync
    /// response): recompute the credentials chain from scratch and verify
    /// every entry's signature, then require the new version to strictly
    /// exceed what we hold.
    pub fn verify_and_replace(
        &mut self,
        entries: Vec<SanctionEntry>,
        claimed_version: u32,
        claimed_hash: [u8; 32],
    ) -> Result<(), SanctionsError> {
        if entries.len() > MAX_SANCTIONS {
            return Err(SanctionsError::TooManyEntries);
        }
        if claimed_version <= self.credentials_version && !self.entries.is_empty() {
            return Err(SanctionsError::VersionNotAdvanced);
        }
        let mut running = [0u8; 32];
        for entry in &entries {
            let mut msg = running.to_vec();
            msg.extend_from_slice(&entry.body_bytes());
            if !verify(&entry.signer_sig_key, &msg, &entry.signature) {
                return Err(SanctionsError::BadSignature);
            }
            running = Self::chain(&running, entry);
        }
        if running != claimed_hash {
            return Err(SanctionsError::CredentialsMismatch);
        }
        self.entries = entries;
        self.credentials_version = claimed_version;
        self.credentials_hash = claimed_hash;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ExtSecretKey;
    use rand::rngs::OsRng;

    fn ban_entry(target: [u8; 32], signer: [u8; 32]) -> SanctionEntry {
        SanctionEntry {
            timestamp: 1000,
            target_enc_key: target,
            target_ip: None,
            kind: SanctionKind::Ban,
            signer_sig_key: signer,
            signature: [0u8; SIGNATURE_LEN],
        }
    }

    #[test]
    fn append_then_verify_round_trips() {
        let mut rng = OsRng;
        let (signer_pk, signer_sk) = ExtSecretKey::generate(&mut rng);
        let mut list = SanctionsList::new();
        list.append_signed(ban_entry([7u8; 32], *signer_pk.sig_key()), |msg| {
            signer_sk.sign(msg)
        })
        .unwrap();
        assert_eq!(list.credentials_version(), 1);
        assert!(list.is_banned(&[7u8; 32]));

        let mut mirrored = SanctionsList::new();
        mirrored
            .verify_and_replace(
                list.entries().to_vec(),
                list.credentials_version(),
                list.credentials_hash(),
            )
            .unwrap();
        assert!(mirrored.is_banned(&[7u8; 32]));
    }

    #[test]
    fn tampered_entry_fails_signature_check() {
        let mut rng = OsRng;
        let (signer_pk, signer_sk) = ExtSecretKey::generate(&mut rng);
        let mut list = SanctionsList::new();
        list.append_signed(ban_entry([7u8; 32], *signer_pk.sig_key()), |msg| {
            signer_sk.sign(msg)
        })
        .unwrap();
        let mut tampered = list.entries().to_vec();
        tampered[0].target_enc_key = [8u8; 32];

        let mut mirrored = SanctionsList::new();
        let err = mirrored
            .verify_and_replace(tampered, list.credentials_version(), list.credentials_hash())
            .unwrap_err();
        assert_eq!(err, SanctionsError::BadSignature);
    }

    #[test]
    fn wire_round_trips() {
        let mut rng = OsRng;
        let (signer_pk, signer_sk) = ExtSecretKey::generate(&mut rng);
        let mut list = SanctionsList::new();
        list.append_signed(ban_entry([7u8; 32], *signer_pk.sig_key()), |msg| {
            signer_sk.sign(msg)
        })
        .unwrap();
        let wire = list.to_wire();
        let (entries, version, hash) = SanctionsList::parse_wire(&wire).unwrap();
        assert_eq!(entries, list.entries());
        assert_eq!(version, list.credentials_version());
        assert_eq!(hash, list.credentials_hash());
    }

    #[test]
    fn rebuild_signed_reattributes_entries_and_advances_credentials() {
        let mut rng = OsRng;
        let (mod_pk, mod_sk) = ExtSecretKey::generate(&mut rng);
        let (founder_pk, founder_sk) = ExtSecretKey::generate(&mut rng);
        let mut list = SanctionsList::new();
        list.append_signed(ban_entry([7u8; 32], *mod_pk.sig_key()), |msg| mod_sk.sign(msg))
            .unwrap();
        let old_hash = list.credentials_hash();

        let entries = list.entries().to_vec();
        list.rebuild_signed(entries, *founder_pk.sig_key(), |msg| founder_sk.sign(msg))
            .unwrap();

        assert!(list.is_banned(&[7u8; 32]));
        assert_eq!(list.entries()[0].signer_sig_key, *founder_pk.sig_key());
        assert_ne!(list.credentials_hash(), old_hash);

        let mut mirrored = SanctionsList::new();
        mirrored
            .verify_and_replace(list.entries().to_vec(), list.credentials_version(), list.credentials_hash())
            .unwrap();
        assert!(mirrored.is_banned(&[7u8; 32]));
    }

    #[test]
    fn credentials_version_must_strictly_advance() {
        let mut rng = OsRng;
        let (signer_pk, signer_sk) = ExtSecretKey::generate(&mut rng);
        let mut list = SanctionsList::new();
        list.append_signed(ban_entry([1u8; 32], *signer_pk.sig_key()), |msg| {
            signer_sk.sign(msg)
        })
        .unwrap();

        let mut held = list.clone();
        let err = held
            .verify_and_replace(list.entries().to_vec(), list.credentials_version(), list.credentials_hash())
            .unwrap_err();
        assert_eq!(err, SanctionsError::VersionNotAdvanced);
    }
}
