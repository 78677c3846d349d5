// Copyright (c) 2024 Botho Foundation

//! Role and permission model: who may promote, demote, kick, or ban whom,
//! and the impostor check that demotes a peer claiming a role it cannot
//! back up.

use crate::peer::Role;
use crate::state::moderators::ModList;
use crate::state::shared_state::SharedState;

/// An action a peer might attempt, gated by its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SetModerator,
    KickOrBan,
    PromoteUserToObserver,
    SetOwnNick,
    SetOwnStatus,
    SendMessage,
    ToggleIgnore,
    SetGroupState,
}

/// Whether `actor` is permitted to perform `action`, per §4.7's table.
/// Founder can do everything; Moderator is restricted to the
/// user/observer boundary; User and Observer are restricted to
/// self-management (Observer additionally cannot send messages).
pub fn is_permitted(actor: Role, action: Action) -> bool {
    use Action::*;
    use Role::*;
    match actor {
        Founder => true,
        Moderator => matches!(
            action,
            KickOrBan | PromoteUserToObserver | SetOwnNick | SetOwnStatus | SendMessage | ToggleIgnore
        ),
        User => matches!(
            action,
            SetOwnNick | SetOwnStatus | SendMessage | ToggleIgnore
        ),
        Observer => matches!(action, SetOwnNick | SetOwnStatus | ToggleIgnore),
    }
}

/// Outcome of validating a peer's claimed role against the state we
/// actually hold for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleValidation {
    Ok,
    /// Claimed Founder but its encryption key does not match shared state;
    /// demote to User.
    ImpostorFounder,
    /// Claimed Moderator but is absent from the moderator list; demote to
    /// User.
    ImpostorModerator,
}

/// Validate a peer's claimed role against the held shared state and
/// moderator list, demoting impostors per §4.7: a peer claiming Founder
/// whose encryption key does not match the shared state's founder key, or
/// claiming Moderator without a moderator-list entry, is not who it says.
pub fn validate_claimed_role(
    claimed: Role,
    claimant_enc_key: &[u8; 32],
    claimant_sig_key: &[u8; 32],
    shared_state: &SharedState,
    moderators: &ModList,
) -> RoleValidation {
    match claimed {
        Role::Founder => {
            if shared_state.founder.enc_key() == claimant_enc_key {
                RoleValidation::Ok
            } else {
                RoleValidation::ImpostorFounder
            }
        }
        Role::Moderator => {
            if moderators.contains(claimant_sig_key) {
                RoleValidation::Ok
            } else {
                RoleValidation::ImpostorModerator
            }
        }
        Role::User | Role::Observer => RoleValidation::Ok,
    }
}

/// The role an impersonation check demotes to: always User, the protocol's
/// neutral default.
pub fn demoted_role() -> Role {
    Role::User
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ExtSecretKey;
    use crate::state::shared_state::PrivacyState;
    use rand::rngs::OsRng;

    fn state_with_founder(founder_enc_key_pk: crate::crypto::ExtPublicKey) -> SharedState {
        SharedState {
            founder: founder_enc_key_pk,
            max_peers: 50,
            name: b"g".to_vec(),
            privacy: PrivacyState::Public,
            password: None,
            mod_list_hash: [0u8; 32],
            version: 1,
        }
    }

    #[test]
    fn founder_may_do_everything() {
        assert!(is_permitted(Role::Founder, Action::SetModerator));
        assert!(is_permitted(Role::Founder, Action::SetGroupState));
    }

    #[test]
    fn observer_cannot_send_messages() {
        assert!(!is_permitted(Role::Observer, Action::SendMessage));
        assert!(is_permitted(Role::Observer, Action::SetOwnNick));
    }

    #[test]
    fn moderator_cannot_set_group_state() {
        assert!(!is_permitted(Role::Moderator, Action::SetGroupState));
        assert!(is_permitted(Role::Moderator, Action::KickOrBan));
    }

    #[test]
    fn founder_claim_with_mismatched_key_is_impostor() {
        let mut rng = OsRng;
        let (real_founder, _) = ExtSecretKey::generate(&mut rng);
        let (impostor, _) = ExtSecretKey::generate(&mut rng);
        let state = state_with_founder(real_founder);
        let result = validate_claimed_role(
            Role::Founder,
            impostor.enc_key(),
            impostor.sig_key(),
            &state,
            &ModList::new(),
        );
        assert_eq!(result, RoleValidation::ImpostorFounder);
    }

    #[test]
    fn moderator_claim_without_list_entry_is_impostor() {
        let mut rng = OsRng;
        let (founder, _) = ExtSecretKey::generate(&mut rng);
        let (claimant, _) = ExtSecretKey::generate(&mut rng);
        let state = state_with_founder(founder);
        let result = validate_claimed_role(
            Role::Moderator,
            claimant.enc_key(),
            claimant.sig_key(),
            &state,
            &ModList::new(),
        );
        assert_eq!(result, RoleValidation::ImpostorModerator);
    }

    #[test]
    fn listed_moderator_validates_ok() {
        let mut rng = OsRng;
        let (founder, _) = ExtSecretKey::generate(&mut rng);
        let (mod_pk, _) = ExtSecretKey::generate(&mut rng);
        let mut mods = ModList::new();
        mods.add(*mod_pk.sig_key());
        let state = state_with_founder(founder);
        let result = validate_claimed_role(
            Role::Moderator,
            mod_pk.enc_key(),
            mod_pk.sig_key(),
            &state,
            &mods,
        );
        assert_eq!(result, RoleValidation::Ok);
    }
}
