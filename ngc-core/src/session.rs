// Copyright (c) 2024 Botho Foundation

//! Multi-group container: one process can hold many joined chats at once,
//! each keyed by its chat hash. This is the routing layer an integrator
//! sits on top of the transport collaborators in [`crate::transport`];
//! it demultiplexes inbound frames to the right [`Group`] without
//! decrypting them first.

use crate::error::GroupError;
use crate::group::{Group, HandleOutput};
use crate::packet;
use crate::peer::PeerId;
use crate::wire::IpPort;
use std::collections::HashMap;
use std::time::Instant;

/// Owns every [`Group`] this process currently participates in, indexed by
/// chat hash for frame routing.
#[derive(Default)]
pub struct Session {
    groups: HashMap<u32, Group>,
}

impl Session {
    pub fn new() -> Self {
        Self { groups: HashMap::new() }
    }

    /// Insert an already-constructed group (from [`Group::found`] or
    /// [`Group::join`]), keyed by its own chat hash.
    pub fn insert(&mut self, group: Group) {
        self.groups.insert(group.chat_hash(), group);
    }

    pub fn remove(&mut self, chat_hash: u32) -> Option<Group> {
        self.groups.remove(&chat_hash)
    }

    pub fn get(&self, chat_hash: u32) -> Option<&Group> {
        self.groups.get(&chat_hash)
    }

    pub fn get_mut(&mut self, chat_hash: u32) -> Option<&mut Group> {
        self.groups.get_mut(&chat_hash)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Group> {
        self.groups.values_mut()
    }

    /// Peek the chat hash out of an inbound frame without decrypting it,
    /// and route it to the owning group's [`Group::handle_frame`]. Unknown
    /// chat hashes and malformed outer headers are reported rather than
    /// panicking, since both arrive from the network unauthenticated.
    pub fn route_frame(&mut self, peer_id: PeerId, frame: &[u8], now: Instant) -> Result<HandleOutput, GroupError> {
        let chat_hash = packet::peek_chat_hash(frame).map_err(|_| GroupError::Malformed("frame"))?;
        let group = self.groups.get_mut(&chat_hash).ok_or(GroupError::BadGroupNumber)?;
        group.handle_frame(peer_id, frame, now)
    }

    /// Route an inbound `OuterKind::Handshake` frame. Unlike
    /// [`Self::route_frame`], no `PeerId` is available yet: the sender is
    /// only identified by the chat hash and its own claimed encryption key,
    /// both of which [`Group::handle_handshake_frame`] reads out of the
    /// frame itself.
    pub fn route_handshake_frame(
        &mut self,
        from_addr: Option<IpPort>,
        frame: &[u8],
        now: Instant,
    ) -> Result<HandleOutput, GroupError> {
        let chat_hash = packet::peek_chat_hash(frame).map_err(|_| GroupError::Malformed("frame"))?;
        let group = self.groups.get_mut(&chat_hash).ok_or(GroupError::BadGroupNumber)?;
        group.handle_handshake_frame(from_addr, frame, now)
    }
}
