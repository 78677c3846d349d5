// Copyright (c) 2024 Botho Foundation

//! The group topic: settable by the founder or any current moderator,
//! version-monotone, with the held value winning ties to avoid churn.

use crate::crypto::{verify, SIGNATURE_LEN};
use crate::state::moderators::ModList;
use crate::state::InstallOutcome;
use thiserror::Error;

pub const MAX_TOPIC_LEN: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub bytes: Vec<u8>,
    pub signer_sig_key: [u8; 32],
    pub version: u32,
    pub signature: [u8; SIGNATURE_LEN],
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    /// topic text exceeded the maximum length
    #[error("topic text exceeded the maximum length")]
    TooLong,
}

impl Topic {
    fn signing_bytes(bytes: &[u8], version: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes.len() + 4);
        out.extend_from_slice(&version.to_be_bytes());
        out.extend_from_slice(bytes);
        out
    }

    pub fn sign(
        bytes: Vec<u8>,
        version: u32,
        signer_sig_key: [u8; 32],
        sign: impl FnOnce(&[u8]) -> [u8; SIGNATURE_LEN],
    ) -> Result<Self, TopicError> {
        if bytes.len() > MAX_TOPIC_LEN {
            return Err(TopicError::TooLong);
        }
        let signature = sign(&Self::signing_bytes(&bytes, version));
        Ok(Self {
            bytes,
            signer_sig_key,
            version,
            signature,
        })
    }

    fn signer_is_authorized(&self, moderators: &ModList, founder_sig_key: &[u8; 32]) -> bool {
        &self.signer_sig_key == founder_sig_key || moderators.contains(&self.signer_sig_key)
    }

    pub fn verify(&self, moderators: &ModList, founder_sig_key: &[u8; 32]) -> bool {
        self.bytes.len() <= MAX_TOPIC_LEN
            && self.signer_is_authorized(moderators, founder_sig_key)
            && verify(
                &self.signer_sig_key,
                &Self::signing_bytes(&self.bytes, self.version),
                &self.signature,
            )
    }

    /// Pack for transmission as a `Topic` inner packet: 2-byte text length,
    /// text, signer signature key, 4-byte version, signature.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.bytes.len() + 32 + 4 + SIGNATURE_LEN);
        out.extend_from_slice(&(self.bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.bytes);
        out.extend_from_slice(&self.signer_sig_key);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self, TopicError> {
        if buf.len() < 2 {
            return Err(TopicError::TooLong);
        }
        let len = u16::from_be_bytes(buf[..2].try_into().unwrap()) as usize;
        let rest = &buf[2..];
        if len > MAX_TOPIC_LEN || rest.len() < len + 32 + 4 + SIGNATURE_LEN {
            return Err(TopicError::TooLong);
        }
        let bytes = rest[..len].to_vec();
        let mut idx = len;
        let mut signer_sig_key = [0u8; 32];
        signer_sig_key.copy_from_slice(&rest[idx..idx + 32]);
        idx += 32;
        let version = u32::from_be_bytes(rest[idx..idx + 4].try_into().unwrap());
        idx += 4;
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&rest[idx..idx + SIGNATURE_LEN]);
        Ok(Self {
            bytes,
            signer_sig_key,
            version,
            signature,
        })
    }

    /// Install policy: reject unless signed by the founder or a current
    /// moderator; ignore versions behind what we hold; on an equal
    /// version the held topic wins, and skip the change callback if the
    /// text is actually unchanged.
    pub fn try_install(
        current: Option<&Topic>,
        incoming: Topic,
        moderators: &ModList,
        founder_sig_key: &[u8; 32],
    ) -> (InstallOutcome, Option<Topic>) {
        if !incoming.verify(moderators, founder_sig_key) {
            return (InstallOutcome::Rejected, None);
        }
        match current {
            None => (InstallOutcome::Installed, Some(incoming)),
            Some(cur) => match incoming.version.cmp(&cur.version) {
                std::cmp::Ordering::Less => (InstallOutcome::Stale, None),
                std::cmp::Ordering::Equal => (InstallOutcome::HeldWins, None),
                std::cmp::Ordering::Greater => (InstallOutcome::Installed, Some(incoming)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ExtSecretKey;
    use rand::rngs::OsRng;

    #[test]
    fn founder_signed_topic_installs_over_nothing() {
        let mut rng = OsRng;
        let (founder_pk, founder_sk) = ExtSecretKey::generate(&mut rng);
        let topic = Topic::sign(b"hello".to_vec(), 1, *founder_pk.sig_key(), |msg| {
            founder_sk.sign(msg)
        })
        .unwrap();
        let (outcome, installed) =
            Topic::try_install(None, topic, &ModList::new(), founder_pk.sig_key());
        assert_eq!(outcome, InstallOutcome::Installed);
        assert_eq!(installed.unwrap().bytes, b"hello");
    }

    #[test]
    fn moderator_signed_topic_is_accepted() {
        let mut rng = OsRng;
        let (founder_pk, _) = ExtSecretKey::generate(&mut rng);
        let (mod_pk, mod_sk) = ExtSecretKey::generate(&mut rng);
        let mut mods = ModList::new();
        mods.add(*mod_pk.sig_key());
        let topic = Topic::sign(b"world".to_vec(), 2, *mod_pk.sig_key(), |msg| mod_sk.sign(msg))
            .unwrap();
        let (outcome, _) = Topic::try_install(None, topic, &mods, founder_pk.sig_key());
        assert_eq!(outcome, InstallOutcome::Installed);
    }

    #[test]
    fn non_moderator_signer_is_rejected() {
        let mut rng = OsRng;
        let (founder_pk, _) = ExtSecretKey::generate(&mut rng);
        let (outsider_pk, outsider_sk) = ExtSecretKey::generate(&mut rng);
        let topic = Topic::sign(b"squatter".to_vec(), 1, *outsider_pk.sig_key(), |msg| {
            outsider_sk.sign(msg)
        })
        .unwrap();
        let (outcome, _) = Topic::try_install(None, topic, &ModList::new(), founder_pk.sig_key());
        assert_eq!(outcome, InstallOutcome::Rejected);
    }

    #[test]
    fn wire_round_trips() {
        let mut rng = OsRng;
        let (founder_pk, founder_sk) = ExtSecretKey::generate(&mut rng);
        let topic = Topic::sign(b"hello".to_vec(), 1, *founder_pk.sig_key(), |msg| {
            founder_sk.sign(msg)
        })
        .unwrap();
        let parsed = Topic::from_wire(&topic.to_wire()).unwrap();
        assert_eq!(parsed, topic);
    }

    #[test]
    fn equal_version_is_won_by_held_topic() {
        let mut rng = OsRng;
        let (founder_pk, founder_sk) = ExtSecretKey::generate(&mut rng);
        let held = Topic::sign(b"world".to_vec(), 2, *founder_pk.sig_key(), |msg| {
            founder_sk.sign(msg)
        })
        .unwrap();
        let resend = Topic::sign(b"hello".to_vec(), 1, *founder_pk.sig_key(), |msg| {
            founder_sk.sign(msg)
        })
        .unwrap();
        let (outcome, installed) =
            Topic::try_install(Some(&held), resend, &ModList::new(), founder_pk.sig_key());
        assert_eq!(outcome, InstallOutcome::Stale);
        assert!(installed.is_none());
    }
}
