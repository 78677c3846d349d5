// Copyright (c) 2024 Botho Foundation

//! Core runtime for a decentralized, peer-to-peer group chat protocol.
//!
//! This crate owns the wire format, the handshake and reliable-delivery
//! layers, peer lifecycle, role/permission model, and the founder-signed
//! replicated state (shared state, moderator list, sanctions list, topic)
//! that every member of a group keeps in sync. It has no opinion on
//! transport: callers plug in their own DHT/relay/clock collaborators
//! through the traits in [`transport`] and drive everything else through
//! [`group::Group`].

#![deny(clippy::print_stdout)]

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod driver;
pub mod error;
pub mod group;
pub mod handshake;
pub mod packet;
pub mod peer;
pub mod roles;
pub mod session;
pub mod state;
pub mod sync;
pub mod transport;
pub mod wire;

pub use error::GroupError;
pub use group::{Group, GroupEvent, GroupState, HandleOutput};
pub use peer::{PeerId, Role};
