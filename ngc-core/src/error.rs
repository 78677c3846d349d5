// Copyright (c) 2024 Botho Foundation

//! The crate-wide error type, organized by failure *kind* rather than by
//! call site, matching the recovery policy each kind gets: malformed and
//! auth failures are dropped silently by the caller, policy violations and
//! divergence are actionable, and fatal errors abort the operation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthFailure {
    /// signature verification failed
    #[error("signature verification failed")]
    BadSignature,
    /// sanctions or mod-list credentials chain did not verify
    #[error("credentials chain did not verify")]
    BadCredentials,
    /// the frame's claimed sender key does not match the connection's
    #[error("sender hash does not match claimed key")]
    SenderHashMismatch,
    /// authenticated decryption failed
    #[error("authenticated decryption failed")]
    DecryptFailed,
}

#[derive(Debug, Error)]
pub enum PolicyViolation {
    /// source IP is on the sanctions list
    #[error("source IP is banned")]
    BannedIp,
    /// the group is at its peer cap
    #[error("group is at its peer cap")]
    GroupFull,
    /// invite or peer-info password did not match
    #[error("wrong password")]
    WrongPassword,
    /// the actor's role does not permit this action
    #[error("role does not permit this action")]
    RoleInsufficient,
    /// another confirmed peer already holds this nick
    #[error("duplicate nick")]
    DuplicateNick,
    /// attempted to join a public-only chat with a private join kind
    #[error("cannot join a public chat as private")]
    JoinPublicAsPrivate,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// the direct UDP send failed
    #[error("direct UDP send failed")]
    DirectSendFailed,
    /// the TCP relay send failed
    #[error("TCP relay send failed")]
    RelaySendFailed,
    /// no relay channel is available for this peer
    #[error("no relay channel available for this peer")]
    NoChannel,
}

#[derive(Debug, Error)]
pub enum DivergenceKind {
    /// the incoming version is behind what we hold
    #[error("incoming version is stale")]
    Stale,
    /// we hold no valid baseline for this object yet
    #[error("no valid baseline held yet")]
    NoBaseline,
}

/// The crate-wide error type. Every fallible public operation returns
/// `Result<T, GroupError>`; internal modules raise their own narrower enum
/// and convert with `#[from]`.
#[derive(Debug, Error)]
pub enum GroupError {
    /// malformed input: {0}
    #[error("malformed input: {0}")]
    Malformed(&'static str),
    /// authentication failure
    #[error("authentication failure: {0}")]
    Auth(#[from] AuthFailure),
    /// policy violation
    #[error("policy violation: {0}")]
    Policy(#[from] PolicyViolation),
    /// transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// state divergence
    #[error("state divergence: {0}")]
    Divergence(#[from] DivergenceKind),
    /// fatal: {0}
    #[error("fatal: {0}")]
    Fatal(&'static str),
    /// bad groupnumber
    #[error("bad groupnumber")]
    BadGroupNumber,
    /// bad peer id
    #[error("bad peer id")]
    BadPeerId,
    /// bad argument: {0}
    #[error("bad argument: {0}")]
    BadArgument(&'static str),
}

impl GroupError {
    /// Whether this error is the "drop silently, never reply" class from
    /// the error taxonomy: malformed input and authentication failures.
    pub fn is_silent(&self) -> bool {
        matches!(self, GroupError::Malformed(_) | GroupError::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_and_auth_errors_are_silent() {
        assert!(GroupError::Malformed("short").is_silent());
        assert!(GroupError::Auth(AuthFailure::BadSignature).is_silent());
        assert!(!GroupError::Policy(PolicyViolation::BannedIp).is_silent());
    }
}
