// Copyright (c) 2024 Botho Foundation

//! Peer table and per-connection lifecycle state.
//!
//! The table is a contiguous, insertion-ordered vector where index 0 is
//! always self. Entries are addressed two ways: by *peer index*, which is
//! volatile and shifts on deletion, and by *peer id*, a stable 32-bit
//! random value unique within this local view. Public API deals only in
//! peer ids; internal hot paths use indices.

use crate::crypto::{ExtPublicKey, HALF_KEY_LEN};
use crate::wire::IpPort;
use rand::RngCore;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Stable, randomly-allocated identifier for a peer within one local view.
/// Never reused for a different key while the table is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u32);

/// Role assigned to a peer by the shared-state/moderator/sanctions model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Observer,
    User,
    Moderator,
    Founder,
}

/// Per-connection state machine, per the coroutine-style handshake flow
/// modeled as explicit states rather than callback chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Fresh,
    HandshakeSent,
    Handshaked,
    PeerInfoSent,
    Confirmed,
}

/// How long a confirmed peer may go unheard-from before it is timed out.
pub const CONFIRMED_TIMEOUT: Duration = Duration::from_secs(60);
/// How long an unconfirmed (still handshaking) peer may go unheard-from.
pub const UNCONFIRMED_TIMEOUT: Duration = Duration::from_secs(10);
/// Number of recently-confirmed peer encryption keys retained to admit
/// reconnects to a private chat without a fresh invite.
pub const RECENTLY_CONFIRMED_RING_SIZE: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerTableError {
    /// a peer with this encryption key is already present
    #[error("peer with this encryption key is already present")]
    AlreadyPresent,
    /// the index does not name a live entry
    #[error("index does not name a live entry")]
    BadIndex,
    /// a confirmed peer already uses this nick
    #[error("confirmed peer at index {attacker_index} already uses this nick")]
    DuplicateNick { attacker_index: usize },
}

/// A single entry in the peer table.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub enc_key: [u8; HALF_KEY_LEN],
    pub sig_key: [u8; HALF_KEY_LEN],
    pub nick: Vec<u8>,
    pub role: Role,
    pub status: u8,
    pub addr: Option<IpPort>,
    pub state: ConnectionState,
    pub last_seen: Instant,
    /// A relay hint learned from a sync response or peer announcement,
    /// used as a fallback path when no direct address is known. `None`
    /// until one arrives; there is no guarantee the hinted relay is still
    /// reachable.
    pub relay_hint: Option<crate::wire::RelayNode>,
}

impl PeerRecord {
    pub fn confirmed(&self) -> bool {
        self.state == ConnectionState::Confirmed
    }
}

/// The peer table for one group. Index 0 is always self.
pub struct PeerTable {
    entries: Vec<PeerRecord>,
    recently_confirmed: VecDeque<[u8; HALF_KEY_LEN]>,
}

impl PeerTable {
    pub fn new<R: RngCore>(rng: &mut R, self_record: PeerRecord) -> Self {
        let mut entries = Vec::new();
        entries.push(self_record);
        let _ = rng;
        Self {
            entries,
            recently_confirmed: VecDeque::with_capacity(RECENTLY_CONFIRMED_RING_SIZE),
        }
    }

    pub fn self_entry(&self) -> &PeerRecord {
        &self.entries[0]
    }

    pub fn self_entry_mut(&mut self) -> &mut PeerRecord {
        &mut self.entries[0]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn by_index(&self, index: usize) -> Option<&PeerRecord> {
        self.entries.get(index)
    }

    pub fn by_index_mut(&mut self, index: usize) -> Option<&mut PeerRecord> {
        self.entries.get_mut(index)
    }

    pub fn find_by_peer_id(&self, id: PeerId) -> Option<usize> {
        self.entries.iter().position(|p| p.peer_id == id)
    }

    pub fn find_by_enc_key(&self, enc_key: &[u8; HALF_KEY_LEN]) -> Option<usize> {
        self.entries.iter().position(|p| &p.enc_key == enc_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.entries.iter()
    }

    pub fn was_recently_confirmed(&self, enc_key: &[u8; HALF_KEY_LEN]) -> bool {
        self.recently_confirmed.contains(enc_key)
    }

    /// Add a new peer keyed by its encryption key. Rejects if the key is
    /// already present (self or another peer).
    pub fn add<R: RngCore>(
        &mut self,
        rng: &mut R,
        enc_key: [u8; HALF_KEY_LEN],
        sig_key: [u8; HALF_KEY_LEN],
        addr: Option<IpPort>,
        now: Instant,
    ) -> Result<PeerId, PeerTableError> {
        if self.entries.iter().any(|p| p.enc_key == enc_key) {
            return Err(PeerTableError::AlreadyPresent);
        }
        let peer_id = self.fresh_peer_id(rng);
        self.entries.push(PeerRecord {
            peer_id,
            enc_key,
            sig_key,
            nick: Vec::new(),
            role: Role::User,
            status: 0,
            addr,
            state: ConnectionState::Fresh,
            last_seen: now,
            relay_hint: None,
        });
        Ok(peer_id)
    }

    /// Record (or update) the relay hint learned for a peer, e.g. from a
    /// sync response entry or a peer announcement.
    pub fn set_relay_hint(&mut self, index: usize, hint: crate::wire::RelayNode) -> Result<(), PeerTableError> {
        self.entries.get_mut(index).ok_or(PeerTableError::BadIndex)?.relay_hint = Some(hint);
        Ok(())
    }

    fn fresh_peer_id<R: RngCore>(&self, rng: &mut R) -> PeerId {
        loop {
            let candidate = PeerId(rng.next_u32());
            if !self.entries.iter().any(|p| p.peer_id == candidate) {
                return candidate;
            }
        }
    }

    /// Update a peer's nick, rejecting (and reporting the offending index)
    /// if another confirmed peer already holds that nick.
    pub fn update_nick(&mut self, index: usize, nick: Vec<u8>) -> Result<(), PeerTableError> {
        if index >= self.entries.len() {
            return Err(PeerTableError::BadIndex);
        }
        if let Some(attacker_index) = self
            .entries
            .iter()
            .enumerate()
            .position(|(i, p)| i != index && p.confirmed() && p.nick == nick)
        {
            return Err(PeerTableError::DuplicateNick { attacker_index });
        }
        self.entries[index].nick = nick;
        Ok(())
    }

    /// Delete the entry at `index` by swapping in the last entry and
    /// truncating, matching the move-from-end compaction the spec
    /// prescribes. Index 0 (self) can never be deleted.
    pub fn delete(&mut self, index: usize) -> Result<PeerRecord, PeerTableError> {
        if index == 0 || index >= self.entries.len() {
            return Err(PeerTableError::BadIndex);
        }
        let removed = self.entries.swap_remove(index);
        if removed.confirmed() {
            if self.recently_confirmed.len() == RECENTLY_CONFIRMED_RING_SIZE {
                self.recently_confirmed.pop_front();
            }
            self.recently_confirmed.push_back(removed.enc_key);
        }
        Ok(removed)
    }

    /// Collect indices of peers whose last_seen exceeds their state's
    /// timeout, for the periodic driver to delete.
    pub fn timed_out(&self, now: Instant) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(i, p)| {
                let limit = if p.confirmed() {
                    CONFIRMED_TIMEOUT
                } else {
                    UNCONFIRMED_TIMEOUT
                };
                if now.duration_since(p.last_seen) > limit {
                    Some(i)
                } else {
                    None
                }
            })
            .collect()
    }
}

pub fn self_record(pk: &ExtPublicKey, nick: Vec<u8>, role: Role, now: Instant) -> PeerRecord {
    PeerRecord {
        peer_id: PeerId(0),
        enc_key: *pk.enc_key(),
        sig_key: *pk.sig_key(),
        nick,
        role,
        status: 0,
        addr: None,
        state: ConnectionState::Confirmed,
        last_seen: now,
        relay_hint: None,
    }
}
