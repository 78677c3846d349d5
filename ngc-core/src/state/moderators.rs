// Copyright (c) 2024 Botho Foundation

//! The moderator list: an ordered set of signature public keys whose hash
//! is embedded in the shared state, binding the two together.

use sha2::{Digest, Sha256};

pub const MAX_MODERATORS: usize = 64;

/// An ordered list of moderator signature public keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModList(Vec<[u8; 32]>);

impl ModList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn contains(&self, sig_key: &[u8; 32]) -> bool {
        self.0.iter().any(|k| k == sig_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8; 32]> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn add(&mut self, sig_key: [u8; 32]) -> bool {
        if self.0.len() >= MAX_MODERATORS || self.contains(&sig_key) {
            return false;
        }
        self.0.push(sig_key);
        true
    }

    pub fn remove(&mut self, sig_key: &[u8; 32]) -> bool {
        let before = self.0.len();
        self.0.retain(|k| k != sig_key);
        self.0.len() != before
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.0.len() * 32);
        out.extend_from_slice(&(self.0.len() as u16).to_be_bytes());
        for key in &self.0 {
            out.extend_from_slice(key);
        }
        out
    }

    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < 2 {
            return None;
        }
        let count = u16::from_be_bytes(buf[..2].try_into().ok()?) as usize;
        if count > MAX_MODERATORS || buf.len() != 2 + count * 32 {
            return None;
        }
        let mut list = Vec::with_capacity(count);
        for i in 0..count {
            let start = 2 + i * 32;
            let mut key = [0u8; 32];
            key.copy_from_slice(&buf[start..start + 32]);
            list.push(key);
        }
        Some(Self(list))
    }

    /// The hash that must match `SharedState::mod_list_hash`.
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(self.to_bytes()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip() {
        let mut list = ModList::new();
        list.add([1u8; 32]);
        list.add([2u8; 32]);
        let bytes = list.to_bytes();
        let parsed = ModList::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, list);
    }

    #[test]
    fn hash_changes_when_membership_changes() {
        let mut list = ModList::new();
        let empty_hash = list.hash();
        list.add([9u8; 32]);
        assert_ne!(list.hash(), empty_hash);
    }

    #[test]
    fn add_rejects_duplicates() {
        let mut list = ModList::new();
        assert!(list.add([1u8; 32]));
        assert!(!list.add([1u8; 32]));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn truncated_bytes_are_rejected() {
        assert!(ModList::from_bytes(&[0, 2, 1, 2, 3]).is_none());
    }
}
