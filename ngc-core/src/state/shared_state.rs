// Copyright (c) 2024 Botho Foundation

//! The founder-signed shared state: group name, peer cap, privacy mode,
//! password, and the hash binding the moderator list to this state.

use crate::crypto::{verify, ExtPublicKey, HALF_KEY_LEN, SIGNATURE_LEN};
use crate::state::InstallOutcome;
use thiserror::Error;

pub const MAX_GROUP_NAME_LEN: usize = 48;
pub const MAX_PASSWORD_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivacyState {
    Public,
    Private,
}

impl PrivacyState {
    fn to_byte(self) -> u8 {
        match self {
            PrivacyState::Public => 0,
            PrivacyState::Private => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PrivacyState::Public),
            1 => Some(PrivacyState::Private),
            _ => None,
        }
    }
}

/// The shared state proper, before signing. Every mutation is performed
/// by the founder alone and bumps `version` (saturating, never wraps).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedState {
    pub founder: ExtPublicKey,
    pub max_peers: u16,
    pub name: Vec<u8>,
    pub privacy: PrivacyState,
    pub password: Option<Vec<u8>>,
    pub mod_list_hash: [u8; 32],
    pub version: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SharedStateError {
    /// payload shorter than the fixed shared-state header
    #[error("payload shorter than the fixed shared-state header")]
    TooShort,
    /// a bounded field exceeded its maximum length
    #[error("bounded field exceeded its maximum length")]
    FieldTooLong,
    /// unknown privacy byte
    #[error("unknown privacy byte")]
    UnknownPrivacy,
    /// trailing bytes after a well-formed shared state
    #[error("trailing bytes after a well-formed shared state")]
    TrailingBytes,
}

impl SharedState {
    /// Bump the version for a new mutation, saturating rather than
    /// wrapping at `u32::MAX`.
    pub fn bump_version(&mut self) {
        self.version = self.version.saturating_add(1);
    }

    fn check_bounds(&self) -> Result<(), SharedStateError> {
        if self.name.len() > MAX_GROUP_NAME_LEN {
            return Err(SharedStateError::FieldTooLong);
        }
        if let Some(pw) = &self.password {
            if pw.len() > MAX_PASSWORD_LEN {
                return Err(SharedStateError::FieldTooLong);
            }
        }
        Ok(())
    }

    /// Pack the signable body: everything except the signature itself.
    pub fn to_signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.founder.to_bytes());
        out.extend_from_slice(&self.max_peers.to_be_bytes());
        out.push(self.name.len() as u8);
        out.extend_from_slice(&self.name);
        out.push(self.privacy.to_byte());
        match &self.password {
            None => out.push(0),
            Some(pw) => {
                out.push(pw.len() as u8);
                out.extend_from_slice(pw);
            }
        }
        out.extend_from_slice(&self.mod_list_hash);
        out.extend_from_slice(&self.version.to_be_bytes());
        out
    }

    pub fn from_signing_bytes(buf: &[u8]) -> Result<Self, SharedStateError> {
        const EXT_KEY_LEN: usize = 64;
        if buf.len() < EXT_KEY_LEN + 2 + 1 {
            return Err(SharedStateError::TooShort);
        }
        let founder = ExtPublicKey::from_bytes(&buf[..EXT_KEY_LEN])
            .map_err(|_| SharedStateError::TooShort)?;
        let mut idx = EXT_KEY_LEN;
        let max_peers = u16::from_be_bytes(buf[idx..idx + 2].try_into().unwrap());
        idx += 2;
        let name_len = *buf.get(idx).ok_or(SharedStateError::TooShort)? as usize;
        idx += 1;
        if name_len > MAX_GROUP_NAME_LEN || buf.len() < idx + name_len + 1 {
            return Err(SharedStateError::FieldTooLong);
        }
        let name = buf[idx..idx + name_len].to_vec();
        idx += name_len;
        let privacy =
            PrivacyState::from_byte(buf[idx]).ok_or(SharedStateError::UnknownPrivacy)?;
        idx += 1;
        let pw_len = *buf.get(idx).ok_or(SharedStateError::TooShort)? as usize;
        idx += 1;
        let password = if pw_len == 0 {
            None
        } else {
            if pw_len > MAX_PASSWORD_LEN || buf.len() < idx + pw_len {
                return Err(SharedStateError::FieldTooLong);
            }
            let pw = buf[idx..idx + pw_len].to_vec();
            idx += pw_len;
            Some(pw)
        };
        if buf.len() < idx + 32 + 4 {
            return Err(SharedStateError::TooShort);
        }
        let mut mod_list_hash = [0u8; 32];
        mod_list_hash.copy_from_slice(&buf[idx..idx + 32]);
        idx += 32;
        let version = u32::from_be_bytes(buf[idx..idx + 4].try_into().unwrap());
        idx += 4;
        if idx != buf.len() {
            return Err(SharedStateError::TrailingBytes);
        }
        let state = Self {
            founder,
            max_peers,
            name,
            privacy,
            password,
            mod_list_hash,
            version,
        };
        state.check_bounds()?;
        Ok(state)
    }
}

/// A shared state together with the founder's signature over its signable
/// bytes.
#[derive(Debug, Clone)]
pub struct SignedSharedState {
    pub state: SharedState,
    pub signature: [u8; SIGNATURE_LEN],
}

impl SignedSharedState {
    pub fn sign(
        state: SharedState,
        founder_sign: impl FnOnce(&[u8]) -> [u8; SIGNATURE_LEN],
    ) -> Self {
        let signature = founder_sign(&state.to_signing_bytes());
        Self { state, signature }
    }

    pub fn verify(&self, founder_sig_pk: &[u8; HALF_KEY_LEN]) -> bool {
        verify(founder_sig_pk, &self.state.to_signing_bytes(), &self.signature)
    }

    /// Pack for transmission as a `SharedState` inner packet: the signable
    /// bytes followed by the detached signature.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = self.state.to_signing_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self, SharedStateError> {
        if buf.len() < SIGNATURE_LEN {
            return Err(SharedStateError::TooShort);
        }
        let split = buf.len() - SIGNATURE_LEN;
        let state = SharedState::from_signing_bytes(&buf[..split])?;
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&buf[split..]);
        Ok(Self { state, signature })
    }

    /// Apply §4.6's install policy: only the founder's signature is ever
    /// trusted, versions strictly behind current are ignored, and an equal
    /// version supersedes only if its own signature verifies (it always
    /// does, by construction, once we reach that check).
    pub fn try_install(
        current: Option<&SignedSharedState>,
        incoming: SignedSharedState,
        founder_sig_pk: &[u8; HALF_KEY_LEN],
    ) -> (InstallOutcome, Option<SignedSharedState>) {
        if incoming.state.check_bounds().is_err() || !incoming.verify(founder_sig_pk) {
            return (InstallOutcome::Rejected, None);
        }
        match current {
            None => (InstallOutcome::Installed, Some(incoming)),
            Some(cur) => match incoming.state.version.cmp(&cur.state.version) {
                std::cmp::Ordering::Less => (InstallOutcome::Stale, None),
                std::cmp::Ordering::Equal | std::cmp::Ordering::Greater => {
                    (InstallOutcome::Installed, Some(incoming))
                }
            },
        }
    }
}
