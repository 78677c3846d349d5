// Copyright (c) 2024 Botho Foundation

//! Founder-signed, monotonically versioned group state: shared state, the
//! moderator list bound into it, the append-only sanctions list, and the
//! topic. Each sub-module owns its own wire format and install policy;
//! this module just re-exports them.

pub mod moderators;
pub mod sanctions;
pub mod shared_state;
pub mod topic;

pub use moderators::ModList;
pub use sanctions::{SanctionEntry, SanctionKind, SanctionsList};
pub use shared_state::{PrivacyState, SharedState, SignedSharedState};
pub use topic::Topic;

/// Outcome of attempting to install an incoming signed/versioned object
/// over whatever is currently held. Shared by shared state, mod list,
/// sanctions, and topic so the sync and broadcast layers can react
/// uniformly (§4.6: stale/equal/installed/rejected all drive the same
/// "malicious sender" recovery policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Installed; version advanced (or, for topic, was accepted).
    Installed,
    /// Version was behind what we hold; silently ignored.
    Stale,
    /// Equal version, but the held value wins (used by topic to avoid churn).
    HeldWins,
    /// Signature or structural check failed; treat the sender as malicious.
    Rejected,
}
