// Copyright (c) 2024 Botho Foundation

//! The `Group` runtime: the single type an integrator holds per joined
//! chat, wiring the peer table, per-connection sessions, replicated
//! state, role model, and periodic driver together behind one API.
//!
//! Every public method that mutates replicated state funnels through the
//! role check in [`roles::is_permitted`] before touching anything, and
//! every entry point opens `self.span` so inner log lines are
//! attributable to one group without threading an id through every call.

use crate::broadcast::{Broadcast, BroadcastType};
use crate::config::GroupLimits;
use crate::connection::{ReceiveOutcome, ReliableStream};
use crate::crypto::{self, ExtPublicKey, ExtSecretKey, SharedKey, HALF_KEY_LEN, SIGNATURE_LEN};
use crate::driver::{Driver, PingSnapshot, TickOutput};
use crate::error::{AuthFailure, GroupError, PolicyViolation};
use crate::handshake::{self, HandshakeError, HandshakePayload, NO_SHARED_STATE_VERSION};
use crate::packet::{self, inner, InnerType};
use crate::peer::{self, ConnectionState, PeerId, PeerTable, Role};
use crate::roles::{self, Action};
use crate::state::shared_state::{PrivacyState, SharedState, SignedSharedState};
use crate::state::{InstallOutcome, ModList, SanctionEntry, SanctionKind, SanctionsList, Topic};
use crate::sync;
use crate::transport::ChannelId;
use crate::wire::{IpPort, RelayNode};
use rand::rngs::OsRng;
use rand_core::RngCore;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Instant;
use tracing::{debug, trace, warn};
use x25519_dalek::{PublicKey as XPublic, StaticSecret as XSecret};

/// Per-connection crypto and delivery state, distinct from the
/// lifecycle/identity fields kept in [`peer::PeerRecord`].
pub struct PeerSession {
    pub shared_key: SharedKey,
    pub stream: ReliableStream,
    pub last_direct_recv: Option<Instant>,
    pub relay_channel: Option<ChannelId>,
    /// Armed when a ping from this peer claims to be ahead of us in any
    /// dimension. A second such ping (the next tick's worth) triggers a
    /// `SyncRequestDue` event rather than firing on the first sighting, so
    /// a single transient race does not storm the network with resyncs.
    pending_sync_flag: bool,
}

impl PeerSession {
    fn new(shared_key: SharedKey) -> Self {
        Self {
            shared_key,
            stream: ReliableStream::new(),
            last_direct_recv: None,
            relay_channel: None,
            pending_sync_flag: false,
        }
    }
}

/// State kept for a handshake we initiated, between sending the Request
/// and receiving its Response: the ephemeral session secret can't be
/// recovered from anything in the peer table (the table has no entry for
/// this peer yet), so it has to live here, keyed by the target's
/// encryption key until the Response arrives.
struct PendingHandshake {
    session_secret: XSecret,
    request_kind: handshake::RequestKind,
    nick: Vec<u8>,
    password: Vec<u8>,
    addr: Option<IpPort>,
    relay_hint: Option<RelayNode>,
}

/// Group-wide lifecycle state (distinct from each connection's own
/// [`ConnectionState`]). `None` (no `Group` constructed yet) has no
/// variant here since it is simply the absence of a `Group` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Failed,
}

/// A lifecycle notification the caller should surface to its own
/// callback surface (§6's "public C-style callback surface" collaborator,
/// here just a returned enum since the core has no callback registry of
/// its own).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    PeerJoined { peer_id: PeerId },
    PeerLeft { peer_id: PeerId },
    PeerTimedOut { peer_id: PeerId },
    NickChanged { peer_id: PeerId, nick: Vec<u8> },
    StatusChanged { peer_id: PeerId, status: u8 },
    TopicChanged,
    Message { peer_id: PeerId, action: bool, text: Vec<u8> },
    PrivateMessage { peer_id: PeerId, text: Vec<u8> },
    SelfDemoted,
    /// A peer's ping advertised a second time that it holds more advanced
    /// state than we do; the caller should send it a SyncRequest.
    SyncRequestDue { peer_id: PeerId },
    /// A peer's role changed by founder or moderator action (promotion,
    /// demotion, or an impostor check demoting it locally).
    RoleChanged { peer_id: PeerId, role: Role },
    /// Our own invite request was rejected by the group we tried to join.
    JoinRejected { reason: sync::RejectReason },
}

/// One joined (or founded) chat.
pub struct Group {
    self_secret: ExtSecretKey,
    self_pk: ExtPublicKey,
    chat_hash: u32,
    /// The chat's long-term signing key, pinned at founding or join time.
    /// Never re-derived from an incoming packet: an embedded `founder`
    /// field inside a `SharedState` packet is only trusted once its
    /// signature verifies under *this* key, not under whatever key the
    /// packet itself claims.
    founder_sig_key: [u8; HALF_KEY_LEN],
    limits: GroupLimits,
    table: PeerTable,
    sessions: std::collections::HashMap<PeerId, PeerSession>,
    shared_state: Option<SignedSharedState>,
    moderators: ModList,
    sanctions: SanctionsList,
    topic: Option<Topic>,
    banned_ips: HashSet<IpAddr>,
    ignored: HashSet<PeerId>,
    driver: Driver,
    /// Highest shared-state version we have sent out, or
    /// [`NO_SHARED_STATE_VERSION`] before the first send. Drives the
    /// handshake version tiebreak.
    self_sent_shared_state_version: u32,
    /// Handshakes we initiated, awaiting a Response, keyed by the target's
    /// encryption key.
    pending_handshakes: HashMap<[u8; HALF_KEY_LEN], PendingHandshake>,
    /// Our own relay hint, advertised to a joiner in a handshake Response
    /// or sync response so it can reach us when no direct address works.
    self_relay_hint: Option<RelayNode>,
    /// Peers learned via a sync response or peer announcement but not yet
    /// handshaked with: `SyncPeerEntry`/`PeerAnnounce` carry only an
    /// encryption key, never a signature key, so these cannot become real
    /// `PeerTable` entries until a `PeerInfoExchange` handshake completes.
    known_peers_pending_handshake: HashMap<[u8; HALF_KEY_LEN], Option<RelayNode>>,
    state: GroupState,
    span: tracing::Span,
}

/// Everything [`Group::export_state`]/[`Group::import_state`] round-trip
/// through a restart: the persisted-state field list named by the
/// protocol (founder identity, self identity and seed, replicated state,
/// last-known peer addresses). Serializing this to and from a byte
/// stream on disk is left to the outer messenger; this crate only owns
/// the shape of the data.
pub struct PersistedGroup {
    pub self_seed: [u8; HALF_KEY_LEN],
    pub chat_hash: u32,
    pub founder_sig_key: [u8; HALF_KEY_LEN],
    pub limits: GroupLimits,
    pub shared_state: Option<SignedSharedState>,
    pub moderators: ModList,
    pub sanctions: SanctionsList,
    pub topic: Option<Topic>,
    pub self_nick: Vec<u8>,
    pub self_role: Role,
    pub self_status: u8,
    pub known_peers: Vec<PersistedPeer>,
}

/// A single last-known peer address entry within [`PersistedGroup`].
pub struct PersistedPeer {
    pub enc_key: [u8; HALF_KEY_LEN],
    pub sig_key: [u8; HALF_KEY_LEN],
    pub addr: Option<IpPort>,
    pub relay_hint: Option<RelayNode>,
}

impl Group {
    /// Found a brand new public or private group as its own founder.
    pub fn found(nick: Vec<u8>, name: Vec<u8>, privacy: PrivacyState, password: Option<Vec<u8>>, limits: GroupLimits) -> Self {
        let mut rng = OsRng;
        let (self_pk, self_secret) = ExtSecretKey::generate(&mut rng);
        let chat_hash = self_pk.hash_id();
        let span = tracing::info_span!("group", chat_hash = %format!("{:08x}", chat_hash));
        let _enter = span.enter();

        let self_record = peer::self_record(&self_pk, nick, Role::Founder, Instant::now());
        let table = PeerTable::new(&mut rng, self_record);

        let state = SharedState {
            founder: self_pk,
            max_peers: limits.max_peers,
            name,
            privacy,
            password,
            mod_list_hash: ModList::new().hash(),
            version: 1,
        };
        let signed = SignedSharedState::sign(state, |msg| self_secret.sign(msg));
        debug!("founded new group");
        drop(_enter);

        Self {
            self_secret,
            self_pk,
            chat_hash,
            founder_sig_key: *self_pk.sig_key(),
            limits,
            table,
            sessions: std::collections::HashMap::new(),
            shared_state: Some(signed),
            moderators: ModList::new(),
            sanctions: SanctionsList::new(),
            topic: None,
            banned_ips: HashSet::new(),
            ignored: HashSet::new(),
            driver: Driver::default(),
            self_sent_shared_state_version: NO_SHARED_STATE_VERSION,
            pending_handshakes: HashMap::new(),
            self_relay_hint: None,
            known_peers_pending_handshake: HashMap::new(),
            state: GroupState::Connected,
            span,
        }
    }

    /// Start joining a group identified by `founder_pk`, known out of band
    /// (e.g. via an invite link). No shared state, moderator list, or
    /// topic is held until the sync exchange delivers them; the group
    /// stays `Connecting` until then.
    pub fn join(nick: Vec<u8>, founder_pk: ExtPublicKey, limits: GroupLimits) -> Self {
        let mut rng = OsRng;
        let (self_pk, self_secret) = ExtSecretKey::generate(&mut rng);
        let chat_hash = founder_pk.hash_id();
        let span = tracing::info_span!("group", chat_hash = %format!("{:08x}", chat_hash));
        let _enter = span.enter();

        let self_record = peer::self_record(&self_pk, nick, Role::User, Instant::now());
        let table = PeerTable::new(&mut rng, self_record);
        debug!("joining group");
        drop(_enter);

        Self {
            self_secret,
            self_pk,
            chat_hash,
            founder_sig_key: *founder_pk.sig_key(),
            limits,
            table,
            sessions: std::collections::HashMap::new(),
            shared_state: None,
            moderators: ModList::new(),
            sanctions: SanctionsList::new(),
            topic: None,
            banned_ips: HashSet::new(),
            ignored: HashSet::new(),
            driver: Driver::default(),
            self_sent_shared_state_version: NO_SHARED_STATE_VERSION,
            pending_handshakes: HashMap::new(),
            self_relay_hint: None,
            known_peers_pending_handshake: HashMap::new(),
            state: GroupState::Connecting,
            span,
        }
    }

    /// Everything needed to reconstruct this group without a network round
    /// trip: founder and self identity, replicated state, and last-known
    /// peer addresses with their relay hints. The actual serialization
    /// format (how this gets to and from disk) is the outer messenger's
    /// concern, not this crate's; this only assembles the fields spec'd
    /// for persistence into one owned value.
    pub fn export_state(&self) -> PersistedGroup {
        let self_entry = self.table.self_entry();
        let known_peers = self
            .table
            .iter()
            .skip(1)
            .map(|p| PersistedPeer {
                enc_key: p.enc_key,
                sig_key: p.sig_key,
                addr: p.addr,
                relay_hint: p.relay_hint,
            })
            .collect();
        PersistedGroup {
            self_seed: self.self_secret.to_seed(),
            chat_hash: self.chat_hash,
            founder_sig_key: self.founder_sig_key,
            limits: self.limits.clone(),
            shared_state: self.shared_state.clone(),
            moderators: self.moderators.clone(),
            sanctions: self.sanctions.clone(),
            topic: self.topic.clone(),
            self_nick: self_entry.nick.clone(),
            self_role: self_entry.role,
            self_status: self_entry.status,
            known_peers,
        }
    }

    /// Rebuild a group from a value previously produced by
    /// [`Self::export_state`]. No peer starts confirmed: every known
    /// address/relay hint is carried over as a hint only, and each peer
    /// must re-handshake before it is trusted again.
    pub fn import_state(persisted: PersistedGroup) -> Self {
        let mut rng = OsRng;
        let self_secret = ExtSecretKey::from_seed(persisted.self_seed);
        let self_pk = self_secret.public();
        let chat_hash = persisted.chat_hash;
        let span = tracing::info_span!("group", chat_hash = %format!("{:08x}", chat_hash));
        let _enter = span.enter();

        let self_record = peer::self_record(&self_pk, persisted.self_nick, persisted.self_role, Instant::now());
        let mut table = PeerTable::new(&mut rng, self_record);
        table.self_entry_mut().status = persisted.self_status;
        for known in persisted.known_peers {
            if table.add(&mut rng, known.enc_key, known.sig_key, known.addr, Instant::now()).is_ok() {
                if let Some(hint) = known.relay_hint {
                    let index = table.find_by_enc_key(&known.enc_key).unwrap();
                    table.set_relay_hint(index, hint).ok();
                }
            }
        }

        let state = if persisted.shared_state.is_some() {
            GroupState::Connected
        } else {
            GroupState::Connecting
        };
        debug!("restored group from persisted state");
        drop(_enter);

        Self {
            self_secret,
            self_pk,
            chat_hash,
            founder_sig_key: persisted.founder_sig_key,
            limits: persisted.limits,
            table,
            sessions: std::collections::HashMap::new(),
            shared_state: persisted.shared_state,
            moderators: persisted.moderators,
            sanctions: persisted.sanctions,
            topic: persisted.topic,
            banned_ips: HashSet::new(),
            ignored: HashSet::new(),
            driver: Driver::default(),
            self_sent_shared_state_version: NO_SHARED_STATE_VERSION,
            pending_handshakes: HashMap::new(),
            self_relay_hint: None,
            known_peers_pending_handshake: HashMap::new(),
            state,
            span,
        }
    }

    pub fn chat_hash(&self) -> u32 {
        self.chat_hash
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn founder_sig_key(&self) -> &[u8; HALF_KEY_LEN] {
        &self.founder_sig_key
    }

    pub fn self_peer_id(&self) -> PeerId {
        self.table.self_entry().peer_id
    }

    pub fn self_role(&self) -> Role {
        self.table.self_entry().role
    }

    pub fn peer_count(&self) -> usize {
        self.table.len() - 1
    }

    pub fn confirmed_peer_count(&self) -> usize {
        self.table.iter().skip(1).filter(|p| p.confirmed()).count()
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.table.iter().skip(1).map(|p| p.peer_id)
    }

    pub fn shared_state(&self) -> Option<&SignedSharedState> {
        self.shared_state.as_ref()
    }

    pub fn topic(&self) -> Option<&Topic> {
        self.topic.as_ref()
    }

    fn require_permission(&self, action: Action) -> Result<(), GroupError> {
        if roles::is_permitted(self.self_role(), action) {
            Ok(())
        } else {
            warn!(?action, "self role does not permit action");
            Err(GroupError::Policy(PolicyViolation::RoleInsufficient))
        }
    }

    /// Set the local nick. Visible immediately via the returned event,
    /// without a round trip, matching the local-only nick behavior before
    /// any peer has confirmed.
    pub fn set_self_nick(&mut self, nick: Vec<u8>) -> Result<GroupEvent, GroupError> {
        self.require_permission(Action::SetOwnNick)?;
        self.table.self_entry_mut().nick = nick.clone();
        Ok(GroupEvent::NickChanged {
            peer_id: self.self_peer_id(),
            nick,
        })
    }

    pub fn set_self_status(&mut self, status: u8) -> Result<GroupEvent, GroupError> {
        self.require_permission(Action::SetOwnStatus)?;
        self.table.self_entry_mut().status = status;
        Ok(GroupEvent::StatusChanged {
            peer_id: self.self_peer_id(),
            status,
        })
    }

    /// Set the group topic, signing as founder or moderator. Reuses the
    /// role check that governs `SetGroupState` for founder-only fields,
    /// but topic is explicitly also a moderator action per §4.6.
    pub fn set_topic(&mut self, text: Vec<u8>) -> Result<GroupEvent, GroupError> {
        let role = self.self_role();
        if role != Role::Founder && role != Role::Moderator {
            return Err(GroupError::Policy(PolicyViolation::RoleInsufficient));
        }
        let next_version = self.topic.as_ref().map_or(1, |t| t.version.saturating_add(1));
        let sig_key = *self.self_pk.sig_key();
        let topic = Topic::sign(text, next_version, sig_key, |msg| self.self_secret.sign(msg))
            .map_err(|_| GroupError::Malformed("topic too long"))?;
        self.topic = Some(topic);
        debug!(version = next_version, "topic updated locally");
        Ok(GroupEvent::TopicChanged)
    }

    /// Local-only: toggling ignore never produces a broadcast, per the
    /// per-local-peer (not replicated) nature of the ignore list.
    pub fn toggle_ignore(&mut self, peer_id: PeerId) -> bool {
        if self.ignored.remove(&peer_id) {
            false
        } else {
            self.ignored.insert(peer_id);
            true
        }
    }

    pub fn is_ignored(&self, peer_id: PeerId) -> bool {
        self.ignored.contains(&peer_id)
    }

    /// Re-hash the moderator list into the shared state, bump its version,
    /// and re-sign as founder. Called after any moderator-list mutation
    /// per §4.6's "founder-only mutation... re-hashes the list, writes the
    /// hash into the shared state, re-signs and re-broadcasts both".
    fn resign_shared_state_for_mod_list_change(&mut self) -> Result<(), GroupError> {
        let mut state = self
            .shared_state
            .as_ref()
            .ok_or(GroupError::Fatal("no shared state held"))?
            .state
            .clone();
        state.mod_list_hash = self.moderators.hash();
        state.bump_version();
        let secret = &self.self_secret;
        self.shared_state = Some(SignedSharedState::sign(state, |msg| secret.sign(msg)));
        Ok(())
    }

    /// If the held topic was signed by `sig_key`, have the founder re-sign
    /// it under its own key with a bumped version so it keeps propagating.
    /// Per §4.6, this runs after demoting the moderator who set it.
    fn resign_topic_if_signed_by(&mut self, sig_key: &[u8; HALF_KEY_LEN]) {
        let signed_by_target = matches!(&self.topic, Some(t) if &t.signer_sig_key == sig_key);
        if !signed_by_target {
            return;
        }
        let (text, next_version) = {
            let topic = self.topic.as_ref().unwrap();
            (topic.bytes.clone(), topic.version.saturating_add(1))
        };
        let founder_sig_key = *self.self_pk.sig_key();
        let secret = &self.self_secret;
        match Topic::sign(text, next_version, founder_sig_key, |msg| secret.sign(msg)) {
            Ok(resigned) => {
                self.topic = Some(resigned);
                debug!("topic re-signed by founder after moderator demotion");
            }
            Err(_) => warn!("failed to re-sign topic after moderator demotion"),
        }
    }

    /// Promote a peer to Moderator. Founder-only per §4.7.
    pub fn promote_to_moderator(&mut self, peer_id: PeerId) -> Result<GroupEvent, GroupError> {
        let _enter = self.span.enter();
        self.require_permission(Action::SetModerator)?;
        let index = self.table.find_by_peer_id(peer_id).ok_or(GroupError::BadPeerId)?;
        let sig_key = self.table.by_index(index).unwrap().sig_key;
        if !self.moderators.add(sig_key) {
            return Err(GroupError::BadArgument("already a moderator, or moderator list full"));
        }
        self.table.by_index_mut(index).unwrap().role = Role::Moderator;
        self.resign_shared_state_for_mod_list_change()?;
        debug!(?peer_id, "promoted to moderator");
        Ok(GroupEvent::RoleChanged { peer_id, role: Role::Moderator })
    }

    /// Demote a Moderator back to User. Founder-only per §4.7. Re-signs
    /// the shared state (new mod-list hash) and, per §4.6, has the founder
    /// re-sign any topic the demoted moderator had set so it keeps
    /// propagating under valid authority.
    pub fn demote_moderator(&mut self, peer_id: PeerId) -> Result<GroupEvent, GroupError> {
        let _enter = self.span.enter();
        self.require_permission(Action::SetModerator)?;
        let index = self.table.find_by_peer_id(peer_id).ok_or(GroupError::BadPeerId)?;
        let sig_key = self.table.by_index(index).unwrap().sig_key;
        if !self.moderators.remove(&sig_key) {
            return Err(GroupError::BadArgument("peer is not a moderator"));
        }
        self.table.by_index_mut(index).unwrap().role = Role::User;
        self.resign_shared_state_for_mod_list_change()?;
        self.resign_topic_if_signed_by(&sig_key);
        debug!(?peer_id, "demoted from moderator");
        Ok(GroupEvent::RoleChanged { peer_id, role: Role::User })
    }

    /// Remove a peer from the table without a sanction entry: a plain
    /// kick, available to founder and moderators alike per §4.7.
    pub fn kick_peer(&mut self, peer_id: PeerId) -> Result<GroupEvent, GroupError> {
        let _enter = self.span.enter();
        self.require_permission(Action::KickOrBan)?;
        let index = self.table.find_by_peer_id(peer_id).ok_or(GroupError::BadPeerId)?;
        self.table.delete(index).ok();
        self.driver.forget(peer_id);
        self.sessions.remove(&peer_id);
        debug!(?peer_id, "kicked peer");
        Ok(GroupEvent::PeerLeft { peer_id })
    }

    /// Ban a peer: append a signed sanction entry (advancing the
    /// credentials chain), optionally recording its last-known IP, then
    /// remove it from the table exactly like a kick. Available to founder
    /// and moderators alike per §4.7.
    pub fn ban_peer(&mut self, peer_id: PeerId, also_ban_ip: bool, now_unix: u64) -> Result<GroupEvent, GroupError> {
        let _enter = self.span.enter();
        self.require_permission(Action::KickOrBan)?;
        let index = self.table.find_by_peer_id(peer_id).ok_or(GroupError::BadPeerId)?;
        let record = self.table.by_index(index).unwrap();
        let target_enc_key = record.enc_key;
        let target_ip = if also_ban_ip {
            record.addr.and_then(|addr| addr.addr)
        } else {
            None
        };
        let entry = SanctionEntry {
            timestamp: now_unix,
            target_enc_key,
            target_ip,
            kind: SanctionKind::Ban,
            signer_sig_key: *self.self_pk.sig_key(),
            signature: [0u8; SIGNATURE_LEN],
        };
        let secret = &self.self_secret;
        self.sanctions
            .append_signed(entry, |msg| secret.sign(msg))
            .map_err(|_| GroupError::Fatal("sanctions list full"))?;
        if let Some(ip) = target_ip {
            self.banned_ips.insert(ip);
        }
        self.table.delete(index).ok();
        self.driver.forget(peer_id);
        self.sessions.remove(&peer_id);
        debug!(?peer_id, "banned peer");
        Ok(GroupEvent::PeerLeft { peer_id })
    }

    /// Lift a ban. Removing an entry invalidates the chained credentials
    /// for everything after it, so the founder rebuilds and re-signs the
    /// whole retained sanctions list under its own key rather than
    /// patching the chain in place; per §4.6 this is broadcast as just the
    /// new credentials. Founder-only: a moderator's own secret cannot
    /// re-root credentials it did not originate.
    pub fn remove_ban(&mut self, target_enc_key: [u8; 32]) -> Result<(), GroupError> {
        let _enter = self.span.enter();
        if self.self_role() != Role::Founder {
            return Err(GroupError::Policy(PolicyViolation::RoleInsufficient));
        }
        let before = self.sanctions.entries().len();
        let lifted_ips: Vec<IpAddr> = self
            .sanctions
            .entries()
            .iter()
            .filter(|e| e.kind == SanctionKind::Ban && e.target_enc_key == target_enc_key)
            .filter_map(|e| e.target_ip)
            .collect();
        let retained: Vec<SanctionEntry> = self
            .sanctions
            .entries()
            .iter()
            .filter(|e| !(e.kind == SanctionKind::Ban && e.target_enc_key == target_enc_key))
            .cloned()
            .collect();
        if retained.len() == before {
            return Err(GroupError::BadArgument("target is not currently banned"));
        }
        let founder_sig_key = *self.self_pk.sig_key();
        let secret = &self.self_secret;
        self.sanctions
            .rebuild_signed(retained, founder_sig_key, |msg| secret.sign(msg))
            .map_err(|_| GroupError::Fatal("sanctions rebuild failed"))?;
        for ip in lifted_ips {
            if !self.sanctions.entries().iter().any(|e| e.target_ip == Some(ip)) {
                self.banned_ips.remove(&ip);
            }
        }
        debug!("ban lifted, sanctions credentials rebuilt under founder signature");
        Ok(())
    }

    /// Admit a newly-confirmed peer into the table and arm its session
    /// crypto, used once a handshake has produced a shared key.
    pub fn admit_peer(
        &mut self,
        enc_key: [u8; 32],
        sig_key: [u8; 32],
        addr: Option<IpPort>,
        shared_key: SharedKey,
        now: Instant,
    ) -> Result<GroupEvent, GroupError> {
        let _enter = self.span.enter();
        let mut rng = OsRng;
        let peer_id = self
            .table
            .add(&mut rng, enc_key, sig_key, addr, now)
            .map_err(|_| GroupError::Policy(PolicyViolation::GroupFull))?;
        self.sessions.insert(peer_id, PeerSession::new(shared_key));
        debug!(?peer_id, "peer admitted");
        Ok(GroupEvent::PeerJoined { peer_id })
    }

    /// Mark a peer's connection state, e.g. advancing it to `Confirmed`
    /// once the post-handshake sync completes.
    pub fn set_peer_state(&mut self, peer_id: PeerId, state: ConnectionState) -> Result<(), GroupError> {
        let index = self.table.find_by_peer_id(peer_id).ok_or(GroupError::BadPeerId)?;
        self.table.by_index_mut(index).unwrap().state = state;
        Ok(())
    }

    /// Advertise a relay hint for ourselves to joiners and sync peers, e.g.
    /// once a TCP relay connection has been established locally.
    pub fn set_self_relay_hint(&mut self, hint: Option<RelayNode>) {
        self.self_relay_hint = hint;
    }

    fn moderator_sig_keys(&self) -> HashSet<[u8; HALF_KEY_LEN]> {
        self.moderators.iter().copied().collect()
    }

    fn join_kind_for_self(&self) -> handshake::JoinKind {
        match &self.shared_state {
            Some(s) if s.state.privacy == PrivacyState::Private => handshake::JoinKind::Private,
            _ => handshake::JoinKind::Public,
        }
    }

    /// Start a handshake with a peer known by its encryption key: generate
    /// a fresh ephemeral session keypair, seal a Request under the static
    /// long-term key shared with that peer, and remember the ephemeral
    /// secret (keyed by the target's encryption key, since no table entry
    /// exists for it yet) so the eventual Response can complete the session.
    pub fn begin_handshake(
        &mut self,
        peer_enc_key: [u8; HALF_KEY_LEN],
        addr: Option<IpPort>,
        relay_hint: Option<RelayNode>,
        request_kind: handshake::RequestKind,
        nick: Vec<u8>,
        password: Vec<u8>,
    ) -> Vec<u8> {
        let _enter = self.span.enter();
        let mut rng = OsRng;
        let session_secret = XSecret::random_from_rng(&mut rng);
        let session_pk = XPublic::from(&session_secret);
        let payload = HandshakePayload {
            kind: handshake::HandshakeKind::Request,
            sender_hash: crypto::hash_id(self.self_pk.sig_key()),
            sender_session_pk: *session_pk.as_bytes(),
            sender_sig_pk: *self.self_pk.sig_key(),
            request_kind,
            join_kind: self.join_kind_for_self(),
            sender_shared_state_version: self.self_sent_shared_state_version,
            relay_hint: self.self_relay_hint,
        };
        let static_key = crypto::precompute_shared_key(self.self_secret.x25519_secret(), &XPublic::from(peer_enc_key));
        let nonce = crypto::random_nonce(&mut rng);
        let frame = packet::wrap_handshake(self.chat_hash, *self.self_pk.enc_key(), nonce, &static_key, &payload.write());
        self.pending_handshakes.insert(
            peer_enc_key,
            PendingHandshake {
                session_secret,
                request_kind,
                nick,
                password,
                addr,
                relay_hint,
            },
        );
        debug!(?request_kind, "sent handshake request");
        frame
    }

    /// Drain the set of peers we've learned about (via a sync response or
    /// a peer announcement) but have not yet started a handshake with. The
    /// caller is expected to call [`Self::begin_handshake`] with
    /// `RequestKind::PeerInfoExchange` for each.
    pub fn take_pending_handshake_targets(&mut self) -> Vec<([u8; HALF_KEY_LEN], Option<RelayNode>)> {
        self.known_peers_pending_handshake.drain().collect()
    }

    /// Handle an incoming `OuterKind::Handshake` frame. Unlike
    /// [`Self::handle_frame`], this does not require an already-known
    /// `PeerId`: the caller demultiplexes by chat hash only
    /// (`packet::peek_chat_hash`) and hands every Handshake frame here
    /// regardless of whether the sender is in the table yet.
    pub fn handle_handshake_frame(
        &mut self,
        from_addr: Option<IpPort>,
        frame: &[u8],
        now: Instant,
    ) -> Result<HandleOutput, GroupError> {
        let _enter = self.span.enter();
        let mut out = HandleOutput::default();
        let (pre_header, _) = packet::OuterHeader::parse(frame).map_err(|_| GroupError::Malformed("frame"))?;
        let static_key = crypto::precompute_shared_key(
            self.self_secret.x25519_secret(),
            &XPublic::from(pre_header.sender_enc_key),
        );
        let (header, plaintext) = match packet::unwrap_handshake(frame, &static_key) {
            Ok(v) => v,
            Err(_) => return Ok(out),
        };
        let payload = match HandshakePayload::parse(&plaintext) {
            Ok(p) => p,
            Err(_) => return Ok(out),
        };

        // Forgery check: no table entry exists yet to compare against, so
        // the claimed signature key must itself hash to `sender_hash` and
        // birationally derive the claimed encryption key. A forged enc key
        // cannot also satisfy the derivation.
        if crypto::hash_id(&payload.sender_sig_pk) != payload.sender_hash {
            warn!("handshake sender hash does not match claimed signature key, dropping");
            return Ok(out);
        }
        match crypto::ed25519_pk_to_x25519(&payload.sender_sig_pk) {
            Ok(derived) if derived == header.sender_enc_key => {}
            _ => {
                warn!("handshake claimed signature key does not derive the claimed encryption key, dropping");
                return Ok(out);
            }
        }

        match payload.kind {
            handshake::HandshakeKind::Request => {
                self.handle_handshake_request(&header, &payload, from_addr, now, &mut out)?;
            }
            handshake::HandshakeKind::Response => {
                self.handle_handshake_response(&header, &payload, from_addr, now, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Responder side of a handshake: validate the banned-IP and rate
    /// limit gates, admit (or refresh) the table entry, compute the session
    /// shared key from a freshly generated ephemeral keypair, and seal the
    /// mirrored Response.
    fn handle_handshake_request(
        &mut self,
        header: &packet::OuterHeader,
        payload: &HandshakePayload,
        from_addr: Option<IpPort>,
        now: Instant,
        out: &mut HandleOutput,
    ) -> Result<(), GroupError> {
        if let Some(ip) = from_addr.and_then(|a| a.addr) {
            let moderators = self.moderator_sig_keys();
            if handshake::check_banned(ip, &self.banned_ips, &payload.sender_sig_pk, &moderators).is_err() {
                warn!("rejecting handshake request from banned IP");
                return Ok(());
            }
        }
        if !self.driver.meter.try_admit() {
            warn!("new-connection rate limit reached, dropping handshake request");
            return Ok(());
        }

        let mut rng = OsRng;
        let peer_id = match self.table.find_by_enc_key(&header.sender_enc_key) {
            Some(index) => self.table.by_index(index).unwrap().peer_id,
            None => match self.table.add(&mut rng, header.sender_enc_key, payload.sender_sig_pk, from_addr, now) {
                Ok(id) => id,
                Err(_) => {
                    warn!("group full, rejecting handshake request");
                    return Ok(());
                }
            },
        };

        let session_secret = XSecret::random_from_rng(&mut rng);
        let session_pk = XPublic::from(&session_secret);
        let accepted = handshake::precompute(&session_secret, &payload.sender_session_pk);
        self.sessions.insert(peer_id, PeerSession::new(accepted.shared_key));

        if let Some(index) = self.table.find_by_peer_id(peer_id) {
            let record = self.table.by_index_mut(index).unwrap();
            record.state = ConnectionState::Handshaked;
            record.last_seen = now;
            if record.addr.is_none() {
                record.addr = from_addr;
            }
            if let Some(hint) = payload.relay_hint {
                record.relay_hint = Some(hint);
            }
        }

        let response = HandshakePayload {
            kind: handshake::HandshakeKind::Response,
            sender_hash: crypto::hash_id(self.self_pk.sig_key()),
            sender_session_pk: *session_pk.as_bytes(),
            sender_sig_pk: *self.self_pk.sig_key(),
            request_kind: payload.request_kind,
            join_kind: self.join_kind_for_self(),
            sender_shared_state_version: self.self_sent_shared_state_version,
            relay_hint: self.self_relay_hint,
        };
        let static_key = crypto::precompute_shared_key(
            self.self_secret.x25519_secret(),
            &XPublic::from(header.sender_enc_key),
        );
        let nonce = crypto::random_nonce(&mut rng);
        let frame = packet::wrap_handshake(self.chat_hash, *self.self_pk.enc_key(), nonce, &static_key, &response.write());
        out.outgoing.push((peer_id, frame));
        debug!(?peer_id, "accepted handshake request");

        if payload.request_kind == handshake::RequestKind::PeerInfoExchange {
            let request = sync::PeerInfoRequest {
                nick: self.table.self_entry().nick.clone(),
                claimed_role: self.self_role(),
            };
            let frame = self.seal_lossless(peer_id, inner::PEER_INFO_REQUEST, &request.write(), now)?;
            out.outgoing.push((peer_id, frame));
            if let Some(index) = self.table.find_by_peer_id(peer_id) {
                self.table.by_index_mut(index).unwrap().state = ConnectionState::PeerInfoSent;
            }
        }
        Ok(())
    }

    /// Initiator side of a handshake: complete the session from the
    /// matching `PendingHandshake`, admit the peer, and drive the next
    /// step of whichever flow the Request was for.
    fn handle_handshake_response(
        &mut self,
        header: &packet::OuterHeader,
        payload: &HandshakePayload,
        from_addr: Option<IpPort>,
        now: Instant,
        out: &mut HandleOutput,
    ) -> Result<(), GroupError> {
        let pending = match self.pending_handshakes.remove(&header.sender_enc_key) {
            Some(p) => p,
            None => {
                trace!("handshake response for a peer we did not request, dropping");
                return Ok(());
            }
        };
        let accepted = handshake::precompute(&pending.session_secret, &payload.sender_session_pk);
        let addr = pending.addr.or(from_addr);

        let mut rng = OsRng;
        let peer_id = match self.table.find_by_enc_key(&header.sender_enc_key) {
            Some(index) => self.table.by_index(index).unwrap().peer_id,
            None => match self.table.add(&mut rng, header.sender_enc_key, payload.sender_sig_pk, addr, now) {
                Ok(id) => id,
                Err(_) => {
                    warn!("group full, dropping completed handshake");
                    return Ok(());
                }
            },
        };
        self.sessions.insert(peer_id, PeerSession::new(accepted.shared_key));
        if let Some(index) = self.table.find_by_peer_id(peer_id) {
            let record = self.table.by_index_mut(index).unwrap();
            record.state = ConnectionState::Handshaked;
            record.last_seen = now;
            if record.addr.is_none() {
                record.addr = addr;
            }
            if let Some(hint) = payload.relay_hint.or(pending.relay_hint) {
                record.relay_hint = Some(hint);
            }
        }

        let ack = self.seal_lossless(peer_id, inner::HS_RESPONSE_ACK, &[], now)?;
        out.outgoing.push((peer_id, ack));
        debug!(?peer_id, "handshake completed, session established");

        match pending.request_kind {
            handshake::RequestKind::InviteRequest => {
                let mine = effective_version(self.self_sent_shared_state_version);
                let theirs = effective_version(payload.sender_shared_state_version);
                let we_should_invite =
                    handshake::should_initiate_invite(mine, self.self_pk.sig_key(), theirs, &payload.sender_sig_pk);
                if we_should_invite {
                    let invite = sync::InviteRequest {
                        nick: pending.nick.clone(),
                        password: pending.password.clone(),
                    };
                    let frame = self.seal_lossless(peer_id, inner::INVITE_REQUEST, &invite.write(), now)?;
                    out.outgoing.push((peer_id, frame));
                }
            }
            handshake::RequestKind::PeerInfoExchange => {
                let request = sync::PeerInfoRequest {
                    nick: pending.nick.clone(),
                    claimed_role: self.self_role(),
                };
                let frame = self.seal_lossless(peer_id, inner::PEER_INFO_REQUEST, &request.write(), now)?;
                out.outgoing.push((peer_id, frame));
                if let Some(index) = self.table.find_by_peer_id(peer_id) {
                    self.table.by_index_mut(index).unwrap().state = ConnectionState::PeerInfoSent;
                }
            }
        }
        Ok(())
    }

    /// A joiner, already past the handshake, asks to be admitted to the
    /// group: validate capacity, nick uniqueness, and password, then reply
    /// with acceptance or a typed rejection. Acceptance does not confirm
    /// the connection yet; that happens once the sync exchange completes.
    fn handle_invite_request(
        &mut self,
        peer_id: PeerId,
        payload: &[u8],
        now: Instant,
        out: &mut HandleOutput,
    ) -> Result<(), GroupError> {
        let request = sync::InviteRequest::parse(payload).map_err(|_| GroupError::Malformed("invite request"))?;
        let reject = if self.peer_count() >= self.limits.max_peers as usize {
            Some(sync::RejectReason::GroupFull)
        } else if self
            .table
            .iter()
            .skip(1)
            .any(|p| p.peer_id != peer_id && p.confirmed() && p.nick == request.nick)
        {
            Some(sync::RejectReason::NickTaken)
        } else {
            let configured = self.shared_state.as_ref().and_then(|s| s.state.password.as_deref());
            if !sync::password_matches(configured, &request.password) {
                Some(sync::RejectReason::InvalidPassword)
            } else {
                None
            }
        };

        if let Some(reason) = reject {
            let frame = self.seal_lossless(peer_id, inner::INVITE_RESPONSE_REJECT, &sync::write_reject(reason), now)?;
            out.outgoing.push((peer_id, frame));
            warn!(?peer_id, ?reason, "rejected invite request");
            return Ok(());
        }

        let index = self.table.find_by_peer_id(peer_id).ok_or(GroupError::BadPeerId)?;
        self.table
            .update_nick(index, request.nick.clone())
            .map_err(|_| GroupError::Policy(PolicyViolation::DuplicateNick))?;
        let frame = self.seal_lossless(peer_id, inner::INVITE_RESPONSE, &[], now)?;
        out.outgoing.push((peer_id, frame));
        debug!(?peer_id, "accepted invite request, awaiting sync request");
        Ok(())
    }

    /// The joiner's invite was accepted: immediately ask for a full sync.
    fn handle_invite_response(&mut self, peer_id: PeerId, now: Instant, out: &mut HandleOutput) -> Result<(), GroupError> {
        let frame = self.seal_lossless(peer_id, inner::SYNC_REQUEST, &[], now)?;
        out.outgoing.push((peer_id, frame));
        debug!(?peer_id, "invite accepted, requesting sync");
        Ok(())
    }

    /// The joiner's invite was rejected: tear the connection down locally
    /// and surface why.
    fn handle_invite_reject(&mut self, peer_id: PeerId, payload: &[u8], out: &mut HandleOutput) -> Result<(), GroupError> {
        let reason = sync::parse_reject(payload).map_err(|_| GroupError::Malformed("invite reject"))?;
        warn!(?peer_id, ?reason, "our invite request was rejected");
        if let Some(index) = self.table.find_by_peer_id(peer_id) {
            self.table.delete(index).ok();
        }
        self.driver.forget(peer_id);
        self.sessions.remove(&peer_id);
        out.events.push(GroupEvent::JoinRejected { reason });
        Ok(())
    }

    /// Emit the full replicated-state sequence to a just-accepted joiner,
    /// in the fixed order shared state, moderator list, sanctions list,
    /// topic, then the peer list, and let every other confirmed peer know
    /// the joiner exists via a broadcast `PeerAnnounce`.
    fn handle_sync_request(&mut self, peer_id: PeerId, now: Instant, out: &mut HandleOutput) -> Result<(), GroupError> {
        let index = self.table.find_by_peer_id(peer_id).ok_or(GroupError::BadPeerId)?;

        if let Some(state) = &self.shared_state {
            let frame = self.seal_lossless(peer_id, inner::SHARED_STATE, &state.to_wire(), now)?;
            out.outgoing.push((peer_id, frame));
        }
        let mod_list_bytes = self.moderators.to_bytes();
        let frame = self.seal_lossless(peer_id, inner::MOD_LIST, &mod_list_bytes, now)?;
        out.outgoing.push((peer_id, frame));
        let sanctions_bytes = self.sanctions.to_wire();
        let frame = self.seal_lossless(peer_id, inner::SANCTIONS_LIST, &sanctions_bytes, now)?;
        out.outgoing.push((peer_id, frame));
        if let Some(topic) = &self.topic {
            let frame = self.seal_lossless(peer_id, inner::TOPIC, &topic.to_wire(), now)?;
            out.outgoing.push((peer_id, frame));
        }

        let peers: Vec<sync::SyncPeerEntry> = self
            .table
            .iter()
            .skip(1)
            .filter(|p| p.peer_id != peer_id && p.confirmed())
            .filter_map(|p| p.relay_hint.map(|relay| sync::SyncPeerEntry { relay, enc_key: p.enc_key }))
            .collect();
        let response = sync::SyncResponse { peers };
        let frame = self.seal_lossless(peer_id, inner::SYNC_RESPONSE, &response.write(), now)?;
        out.outgoing.push((peer_id, frame));

        self.table.by_index_mut(index).unwrap().state = ConnectionState::Confirmed;
        out.events.push(GroupEvent::PeerJoined { peer_id });
        debug!(?peer_id, "synced joiner, now confirmed");

        let joiner_enc_key = self.table.by_index(index).unwrap().enc_key;
        let announce_relay = self
            .table
            .by_index(index)
            .unwrap()
            .relay_hint
            .or(self.self_relay_hint)
            .unwrap_or(RelayNode { pk: [0u8; 32], addr: IpPort::NONE });
        let announce = sync::PeerAnnounce { enc_key: joiner_enc_key, relay: announce_relay };
        let announce_bytes = announce.write();
        let others: Vec<PeerId> = self
            .table
            .iter()
            .skip(1)
            .filter(|p| p.peer_id != peer_id && p.confirmed())
            .map(|p| p.peer_id)
            .collect();
        for other in others {
            let frame = self.seal_lossless(other, inner::PEER_ANNOUNCE, &announce_bytes, now)?;
            out.outgoing.push((other, frame));
        }
        Ok(())
    }

    /// The terminal message of the sync sequence: mark the side we just
    /// synced with as confirmed, then install every peer entry it listed
    /// as a pending handshake target. [`Self::take_pending_handshake_targets`]
    /// surfaces those for the caller to drive a PeerInfoExchange handshake.
    /// The table entry for each listed peer is not created until that
    /// handshake completes and supplies a real signature key.
    fn handle_sync_response(&mut self, peer_id: PeerId, payload: &[u8], out: &mut HandleOutput) -> Result<(), GroupError> {
        let response = sync::SyncResponse::parse(payload).map_err(|_| GroupError::Malformed("sync response"))?;
        if let Some(index) = self.table.find_by_peer_id(peer_id) {
            self.table.by_index_mut(index).unwrap().state = ConnectionState::Confirmed;
            out.events.push(GroupEvent::PeerJoined { peer_id });
        }
        for entry in response.peers {
            if self.table.find_by_enc_key(&entry.enc_key).is_some() {
                continue;
            }
            self.known_peers_pending_handshake.insert(entry.enc_key, Some(entry.relay));
        }
        Ok(())
    }

    /// An already-confirmed peer learns of a joiner it hasn't met yet.
    fn handle_peer_announce(&mut self, payload: &[u8]) -> Result<(), GroupError> {
        let announce = sync::PeerAnnounce::parse(payload).map_err(|_| GroupError::Malformed("peer announce"))?;
        if self.table.find_by_enc_key(&announce.enc_key).is_none() {
            self.known_peers_pending_handshake.insert(announce.enc_key, Some(announce.relay));
        }
        Ok(())
    }

    fn handle_peer_info_request(
        &mut self,
        peer_id: PeerId,
        payload: &[u8],
        now: Instant,
        out: &mut HandleOutput,
    ) -> Result<(), GroupError> {
        let request = sync::PeerInfoRequest::parse(payload).map_err(|_| GroupError::Malformed("peer info request"))?;
        let index = self.table.find_by_peer_id(peer_id).ok_or(GroupError::BadPeerId)?;
        let already_replied = self.table.by_index(index).unwrap().state == ConnectionState::PeerInfoSent;

        self.install_peer_info(index, peer_id, &request.nick, request.claimed_role, out)?;

        if !already_replied {
            let response = sync::PeerInfoResponse {
                nick: self.table.self_entry().nick.clone(),
                claimed_role: self.self_role(),
            };
            let frame = self.seal_lossless(peer_id, inner::PEER_INFO_RESPONSE, &response.write(), now)?;
            out.outgoing.push((peer_id, frame));
        }
        Ok(())
    }

    fn handle_peer_info_response(&mut self, peer_id: PeerId, payload: &[u8], out: &mut HandleOutput) -> Result<(), GroupError> {
        let response = sync::PeerInfoResponse::parse(payload).map_err(|_| GroupError::Malformed("peer info response"))?;
        let index = self.table.find_by_peer_id(peer_id).ok_or(GroupError::BadPeerId)?;
        self.install_peer_info(index, peer_id, &response.nick, response.claimed_role, out)
    }

    /// Validate a peer's claimed role per §4.7's impostor check (demoting
    /// to User if it cannot back a Founder or Moderator claim), install its
    /// nick and validated role, and confirm the connection.
    fn install_peer_info(
        &mut self,
        index: usize,
        peer_id: PeerId,
        nick: &[u8],
        claimed_role: Role,
        out: &mut HandleOutput,
    ) -> Result<(), GroupError> {
        let enc_key = self.table.by_index(index).unwrap().enc_key;
        let sig_key = self.table.by_index(index).unwrap().sig_key;
        let role = match &self.shared_state {
            Some(state) => {
                match roles::validate_claimed_role(claimed_role, &enc_key, &sig_key, &state.state, &self.moderators) {
                    roles::RoleValidation::Ok => claimed_role,
                    roles::RoleValidation::ImpostorFounder | roles::RoleValidation::ImpostorModerator => {
                        warn!(?peer_id, ?claimed_role, "peer claimed a role it cannot back, demoting");
                        roles::demoted_role()
                    }
                }
            }
            None => claimed_role,
        };
        self.table.update_nick(index, nick.to_vec()).ok();
        let record = self.table.by_index_mut(index).unwrap();
        record.role = role;
        record.state = ConnectionState::Confirmed;
        out.events.push(GroupEvent::RoleChanged { peer_id, role });
        out.events.push(GroupEvent::PeerJoined { peer_id });
        Ok(())
    }

    /// Handle an incoming broadcast frame already decrypted and
    /// demultiplexed to this peer's connection. Applies the role check
    /// implied by the broadcast type, demoting impostors to `User` rather
    /// than trusting the sender's self-reported role.
    pub fn handle_broadcast(&mut self, sender_peer_id: PeerId, frame: &Broadcast<'_>) -> Result<Option<GroupEvent>, GroupError> {
        let _enter = self.span.enter();
        let index = self
            .table
            .find_by_peer_id(sender_peer_id)
            .ok_or(GroupError::BadPeerId)?;

        if self.ignored.contains(&sender_peer_id) && frame.kind != BroadcastType::PeerExit {
            return Ok(None);
        }

        let sender_role = self.table.by_index(index).unwrap().role;
        let action = match frame.kind {
            BroadcastType::Nick => Action::SetOwnNick,
            BroadcastType::Status => Action::SetOwnStatus,
            BroadcastType::PlainMessage | BroadcastType::ActionMessage | BroadcastType::PrivateMessage => {
                Action::SendMessage
            }
            BroadcastType::SetMod | BroadcastType::SetObserver => Action::SetModerator,
            BroadcastType::RemovePeer | BroadcastType::RemoveBan => Action::KickOrBan,
            BroadcastType::PeerExit => {
                self.table.delete(index).ok();
                self.driver.forget(sender_peer_id);
                self.sessions.remove(&sender_peer_id);
                return Ok(Some(GroupEvent::PeerLeft { peer_id: sender_peer_id }));
            }
        };

        if !roles::is_permitted(sender_role, action) {
            warn!(?sender_peer_id, ?action, "peer attempted action its role does not permit");
            return Err(GroupError::Auth(AuthFailure::BadCredentials));
        }

        match frame.kind {
            BroadcastType::Nick => {
                let nick = frame.payload.to_vec();
                match self.table.update_nick(index, nick.clone()) {
                    Ok(()) => Ok(Some(GroupEvent::NickChanged {
                        peer_id: sender_peer_id,
                        nick,
                    })),
                    Err(_) => Err(GroupError::Policy(PolicyViolation::DuplicateNick)),
                }
            }
            BroadcastType::Status => {
                let status = *frame.payload.first().unwrap_or(&0);
                self.table.by_index_mut(index).unwrap().status = status;
                Ok(Some(GroupEvent::StatusChanged {
                    peer_id: sender_peer_id,
                    status,
                }))
            }
            BroadcastType::PlainMessage => Ok(Some(GroupEvent::Message {
                peer_id: sender_peer_id,
                action: false,
                text: frame.payload.to_vec(),
            })),
            BroadcastType::ActionMessage => Ok(Some(GroupEvent::Message {
                peer_id: sender_peer_id,
                action: true,
                text: frame.payload.to_vec(),
            })),
            BroadcastType::PrivateMessage => Ok(Some(GroupEvent::PrivateMessage {
                peer_id: sender_peer_id,
                text: frame.payload.to_vec(),
            })),
            _ => Ok(None),
        }
    }

    /// Seal `payload` as a Lossless frame addressed to `peer_id`, reserving
    /// the next message id on that peer's stream and arming it for
    /// retransmission. The caller transmits the returned frame as-is.
    fn seal_lossless(
        &mut self,
        peer_id: PeerId,
        inner_type: InnerType,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<u8>, GroupError> {
        let chat_hash = self.chat_hash;
        let self_enc_key = *self.self_pk.enc_key();
        let session = self.sessions.get_mut(&peer_id).ok_or(GroupError::BadPeerId)?;
        let message_id = session.stream.next_message_id();
        let nonce = crypto::random_nonce(&mut OsRng);
        let frame = packet::wrap_lossless(chat_hash, self_enc_key, nonce, &session.shared_key, inner_type, message_id, payload);
        session.stream.record_sent(message_id, frame.clone(), now);
        Ok(frame)
    }

    /// Seal `payload` as a Lossy frame addressed to `peer_id`. Lossy frames
    /// carry no message id and are never retransmitted.
    fn seal_lossy(&self, peer_id: PeerId, inner_type: InnerType, payload: &[u8]) -> Result<Vec<u8>, GroupError> {
        let session = self.sessions.get(&peer_id).ok_or(GroupError::BadPeerId)?;
        let nonce = crypto::random_nonce(&mut OsRng);
        Ok(packet::wrap_lossy(
            self.chat_hash,
            *self.self_pk.enc_key(),
            nonce,
            &session.shared_key,
            inner_type,
            payload,
        ))
    }

    /// Seal a `MessageAck` addressed to `peer_id`: one discriminator byte
    /// (request vs. read) followed by the 64-bit message id it names.
    fn seal_message_ack(&self, peer_id: PeerId, kind: MessageAckKind, id: u64) -> Result<Vec<u8>, GroupError> {
        let mut payload = Vec::with_capacity(9);
        payload.push(kind.to_byte());
        payload.extend_from_slice(&id.to_be_bytes());
        self.seal_lossy(peer_id, inner::MESSAGE_ACK, &payload)
    }

    /// Send a plain or action message to every confirmed peer, wrapped as a
    /// Lossless `Broadcast` per §4.5. `action` selects `ActionMessage`
    /// (e.g. a "/me" line) over `PlainMessage`. Observers cannot send
    /// messages, gated the same as `custom_packet_to_all`/`_to_one`.
    pub fn send_message(
        &mut self,
        text: Vec<u8>,
        action: bool,
        now: Instant,
        now_unix: u64,
    ) -> Result<Vec<(PeerId, Vec<u8>)>, GroupError> {
        self.require_permission(Action::SendMessage)?;
        let kind = if action { BroadcastType::ActionMessage } else { BroadcastType::PlainMessage };
        let sender_hash = self.self_pk.hash_id();
        let body = Broadcast::write(kind, sender_hash, now_unix, &text);
        let targets: Vec<PeerId> = self.table.iter().skip(1).filter(|p| p.confirmed()).map(|p| p.peer_id).collect();
        let mut out = Vec::with_capacity(targets.len());
        for peer_id in targets {
            out.push((peer_id, self.seal_lossless(peer_id, inner::BROADCAST, &body, now)?));
        }
        Ok(out)
    }

    /// Send a private message to exactly one peer: a single Lossless
    /// `Broadcast(PrivateMessage)` aimed at that connection only, per §4.5.
    pub fn send_private_message(
        &mut self,
        peer_id: PeerId,
        text: Vec<u8>,
        now: Instant,
        now_unix: u64,
    ) -> Result<Vec<u8>, GroupError> {
        self.require_permission(Action::SendMessage)?;
        self.table.find_by_peer_id(peer_id).ok_or(GroupError::BadPeerId)?;
        let sender_hash = self.self_pk.hash_id();
        let body = Broadcast::write(BroadcastType::PrivateMessage, sender_hash, now_unix, &text);
        self.seal_lossless(peer_id, inner::BROADCAST, &body, now)
    }

    /// Broadcast a custom application packet, sealed lossless or lossy as
    /// requested, to every confirmed peer. Gated the same as a plain
    /// message: Observers may not send custom packets either.
    pub fn custom_packet_to_all(
        &mut self,
        payload: &[u8],
        lossless: bool,
        now: Instant,
    ) -> Result<Vec<(PeerId, Vec<u8>)>, GroupError> {
        self.require_permission(Action::SendMessage)?;
        let targets: Vec<PeerId> = self.table.iter().skip(1).filter(|p| p.confirmed()).map(|p| p.peer_id).collect();
        let mut out = Vec::with_capacity(targets.len());
        for peer_id in targets {
            let frame = if lossless {
                self.seal_lossless(peer_id, inner::CUSTOM_PACKET, payload, now)?
            } else {
                self.seal_lossy(peer_id, inner::CUSTOM_PACKET, payload)?
            };
            out.push((peer_id, frame));
        }
        Ok(out)
    }

    /// Send a custom application packet to exactly one peer, sealed
    /// lossless or lossy as requested.
    pub fn custom_packet_to_one(
        &mut self,
        peer_id: PeerId,
        payload: &[u8],
        lossless: bool,
        now: Instant,
    ) -> Result<Vec<u8>, GroupError> {
        self.require_permission(Action::SendMessage)?;
        self.table.find_by_peer_id(peer_id).ok_or(GroupError::BadPeerId)?;
        if lossless {
            self.seal_lossless(peer_id, inner::CUSTOM_PACKET, payload, now)
        } else {
            self.seal_lossy(peer_id, inner::CUSTOM_PACKET, payload)
        }
    }

    /// Explicit self-exit: broadcast `PeerExit` to every confirmed peer
    /// before tearing down locally, distinct from a forced teardown.
    pub fn leave(&mut self) -> Vec<PeerId> {
        let _enter = self.span.enter();
        let targets: Vec<PeerId> = self
            .table
            .iter()
            .skip(1)
            .filter(|p| p.confirmed())
            .map(|p| p.peer_id)
            .collect();
        debug!(count = targets.len(), "leaving group, notifying confirmed peers");
        self.teardown();
        targets
    }

    /// Forced teardown: releases every session without a network round
    /// trip, for when the outer messenger is shutting down rather than
    /// the user explicitly leaving.
    pub fn teardown(&mut self) {
        self.sessions.clear();
        for index in (1..self.table.len()).rev() {
            self.table.delete(index).ok();
        }
    }

    /// Advance every per-connection timer: retransmission, pings, and
    /// timeouts. Each session's stream is temporarily taken out of its
    /// session so the driver can work with a plain map, then put back.
    pub fn tick(&mut self, now: Instant) -> TickOutput {
        let _enter = self.span.enter();
        let mut streams: std::collections::HashMap<PeerId, ReliableStream> = self
            .sessions
            .iter_mut()
            .map(|(id, session)| (*id, std::mem::replace(&mut session.stream, ReliableStream::new())))
            .collect();
        let output = self.driver.tick(&self.table, &mut streams, now);
        for (id, stream) in streams {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.stream = stream;
            }
        }
        for &index in &output.timed_out_peers {
            if let Some(peer_id) = self.table.by_index(index).map(|p| p.peer_id) {
                self.sessions.remove(&peer_id);
            }
        }
        output
    }

    pub fn banned_ips(&self) -> &HashSet<IpAddr> {
        &self.banned_ips
    }

    pub fn sanctions(&self) -> &SanctionsList {
        &self.sanctions
    }

    pub fn moderators(&self) -> &ModList {
        &self.moderators
    }

    pub fn self_pk(&self) -> &ExtPublicKey {
        &self.self_pk
    }

    pub fn self_secret(&self) -> &ExtSecretKey {
        &self.self_secret
    }

    pub fn self_sent_shared_state_version(&self) -> u32 {
        self.self_sent_shared_state_version
    }

    pub fn mark_shared_state_sent(&mut self, version: u32) {
        self.self_sent_shared_state_version = version;
    }

    /// Our own snapshot of versioned state, stamped into the pings we send.
    pub fn own_ping_snapshot(&self) -> PingSnapshot {
        PingSnapshot {
            confirmed_peer_count: self.confirmed_peer_count() as u32,
            shared_state_version: self.shared_state.as_ref().map_or(0, |s| s.state.version),
            sanctions_credentials_version: self.sanctions.credentials_version(),
            topic_version: self.topic.as_ref().map_or(0, |t| t.version),
        }
    }

    /// Handle an incoming ping's version snapshot per §4.9's two-step
    /// arm/trigger: a peer that appears strictly more advanced in any
    /// dimension arms `pending_sync_flag` on its first such ping, and only
    /// a *second* consecutive advanced ping fires `SyncRequestDue`. Any
    /// ping that does not show the peer ahead disarms the flag.
    pub fn handle_ping(&mut self, peer_id: PeerId, snapshot: PingSnapshot) -> Option<GroupEvent> {
        let mine = self.own_ping_snapshot();
        let ahead = snapshot.confirmed_peer_count > mine.confirmed_peer_count
            || snapshot.shared_state_version > mine.shared_state_version
            || snapshot.sanctions_credentials_version > mine.sanctions_credentials_version
            || snapshot.topic_version > mine.topic_version;
        let session = self.sessions.get_mut(&peer_id)?;
        if !ahead {
            session.pending_sync_flag = false;
            return None;
        }
        if session.pending_sync_flag {
            session.pending_sync_flag = false;
            trace!(?peer_id, "peer appears ahead on second consecutive ping, requesting sync");
            Some(GroupEvent::SyncRequestDue { peer_id })
        } else {
            session.pending_sync_flag = true;
            None
        }
    }

    /// Treat a malicious/structurally-invalid replicated object as a fatal
    /// divergence: drop the offending peer, and if we hold no valid
    /// baseline for the object in question and no peers remain, there is
    /// nowhere left to recover state from.
    fn on_divergence_rejected(&mut self, sender_peer_id: PeerId, have_baseline: bool) {
        if let Some(index) = self.table.find_by_peer_id(sender_peer_id) {
            warn!(?sender_peer_id, "rejecting replicated state from sender, dropping connection");
            self.table.delete(index).ok();
            self.driver.forget(sender_peer_id);
            self.sessions.remove(&sender_peer_id);
        }
        if !have_baseline && self.confirmed_peer_count() == 0 {
            self.state = GroupState::Disconnected;
        }
    }

    /// Decode and dispatch one already-demultiplexed frame addressed to
    /// `peer_id`'s connection, driving every inner packet type named in
    /// §6 through the owning sub-module. Returns the events the caller
    /// should surface plus any reply frames already sealed and ready to
    /// transmit to their respective recipients.
    pub fn handle_frame(&mut self, peer_id: PeerId, frame: &[u8], now: Instant) -> Result<HandleOutput, GroupError> {
        let _enter = self.span.enter();
        let index = self.table.find_by_peer_id(peer_id).ok_or(GroupError::BadPeerId)?;
        let sender_pk = ExtPublicKey::from_halves(
            self.table.by_index(index).unwrap().enc_key,
            self.table.by_index(index).unwrap().sig_key,
        );
        let shared_key_bytes = *self
            .sessions
            .get(&peer_id)
            .ok_or(GroupError::BadPeerId)?
            .shared_key
            .as_bytes();
        let shared_key = SharedKey::from_bytes(shared_key_bytes);

        let mut scratch = Vec::new();
        let (header, _) = packet::OuterHeader::parse(frame).map_err(|_| GroupError::Malformed("frame"))?;
        let mut out = HandleOutput::default();
        match header.kind {
            packet::OuterKind::Lossless => {
                let decoded = packet::unwrap_lossless(frame, &sender_pk, &shared_key, &mut scratch)
                    .map_err(|_| GroupError::Auth(AuthFailure::DecryptFailed))?;
                match self.table.by_index_mut(index) {
                    Some(rec) => rec.last_seen = now,
                    None => return Err(GroupError::BadPeerId),
                }
                let message_id = decoded.message_id;
                let inner_type = decoded.inner_type;
                let payload = decoded.payload.to_vec();
                let outcome = self
                    .sessions
                    .get_mut(&peer_id)
                    .map(|s| s.stream.on_receive(message_id, payload));
                match outcome {
                    Some(ReceiveOutcome::Duplicate) => return Ok(out),
                    Some(ReceiveOutcome::OutOfOrder { request_id }) => {
                        if let Ok(frame) = self.seal_message_ack(peer_id, MessageAckKind::Request, request_id) {
                            out.outgoing.push((peer_id, frame));
                        }
                        return Ok(out);
                    }
                    Some(ReceiveOutcome::Deliver(payloads)) => {
                        let read_id = self
                            .sessions
                            .get(&peer_id)
                            .map(|s| s.stream.next_expected_recv().saturating_sub(1));
                        for payload in payloads {
                            self.dispatch_inner(peer_id, inner_type, &payload, now, &mut out)?;
                        }
                        if let Some(read_id) = read_id {
                            if let Ok(frame) = self.seal_message_ack(peer_id, MessageAckKind::Read, read_id) {
                                out.outgoing.push((peer_id, frame));
                            }
                        }
                    }
                    None => return Err(GroupError::BadPeerId),
                }
            }
            packet::OuterKind::Lossy => {
                let decoded = packet::unwrap_lossy(frame, &sender_pk, &shared_key, &mut scratch)
                    .map_err(|_| GroupError::Auth(AuthFailure::DecryptFailed))?;
                if let Some(rec) = self.table.by_index_mut(index) {
                    rec.last_seen = now;
                }
                let inner_type = decoded.inner_type;
                let payload = decoded.payload.to_vec();
                self.dispatch_inner(peer_id, inner_type, &payload, now, &mut out)?;
            }
            packet::OuterKind::Handshake => return Err(GroupError::Malformed("handshake frame routed to handle_frame")),
        }
        Ok(out)
    }

    fn dispatch_inner(
        &mut self,
        peer_id: PeerId,
        inner_type: InnerType,
        payload: &[u8],
        now: Instant,
        out: &mut HandleOutput,
    ) -> Result<(), GroupError> {
        if inner_type == inner::SHARED_STATE {
            let incoming = SignedSharedState::from_wire(payload).map_err(|_| GroupError::Malformed("shared state"))?;
            let had_baseline = self.shared_state.is_some();
            let (outcome, installed) =
                SignedSharedState::try_install(self.shared_state.as_ref(), incoming, &self.founder_sig_key);
            match outcome {
                InstallOutcome::Installed => {
                    self.shared_state = installed;
                    self.state = GroupState::Connected;
                    debug!(?peer_id, "installed incoming shared state");
                }
                InstallOutcome::Stale | InstallOutcome::HeldWins => {}
                InstallOutcome::Rejected => self.on_divergence_rejected(peer_id, had_baseline),
            }
        } else if inner_type == inner::MOD_LIST {
            let incoming = ModList::from_bytes(payload).ok_or(GroupError::Malformed("mod list"))?;
            match &self.shared_state {
                Some(state) if state.state.mod_list_hash == incoming.hash() => {
                    self.moderators = incoming;
                    debug!(?peer_id, "installed incoming moderator list");
                }
                Some(_) => self.on_divergence_rejected(peer_id, true),
                None => {}
            }
        } else if inner_type == inner::SANCTIONS_LIST {
            let (entries, version, hash) =
                SanctionsList::parse_wire(payload).map_err(|_| GroupError::Malformed("sanctions list"))?;
            let had_baseline = !self.sanctions.entries().is_empty();
            match self.sanctions.verify_and_replace(entries, version, hash) {
                Ok(()) => debug!(?peer_id, "installed incoming sanctions list"),
                Err(_) => self.on_divergence_rejected(peer_id, had_baseline),
            }
        } else if inner_type == inner::TOPIC {
            let incoming = Topic::from_wire(payload).map_err(|_| GroupError::Malformed("topic"))?;
            let had_baseline = self.topic.is_some();
            let changed = self.topic.as_ref().map(|t| t.bytes != incoming.bytes).unwrap_or(true);
            let (outcome, installed) =
                Topic::try_install(self.topic.as_ref(), incoming, &self.moderators, &self.founder_sig_key);
            match outcome {
                InstallOutcome::Installed => {
                    self.topic = installed;
                    if changed {
                        out.events.push(GroupEvent::TopicChanged);
                    }
                }
                InstallOutcome::Stale | InstallOutcome::HeldWins => {}
                InstallOutcome::Rejected => self.on_divergence_rejected(peer_id, had_baseline),
            }
        } else if inner_type == inner::BROADCAST {
            let frame = Broadcast::parse(payload).map_err(|_| GroupError::Malformed("broadcast"))?;
            if let Some(event) = self.handle_broadcast(peer_id, &frame)? {
                out.events.push(event);
            }
        } else if inner_type == inner::PING {
            let snapshot = parse_ping_snapshot(payload).ok_or(GroupError::Malformed("ping"))?;
            if let Some(event) = self.handle_ping(peer_id, snapshot) {
                out.events.push(event);
            }
        } else if inner_type == inner::CUSTOM_PACKET {
            // Custom application packets are opaque to the core; surfacing
            // them is the integrator's job via its own callback surface,
            // not a `GroupEvent` variant this crate defines.
            trace!(?peer_id, len = payload.len(), "received custom packet");
        } else if inner_type == inner::MESSAGE_ACK {
            if let Some((kind, id)) = MessageAckKind::parse(payload) {
                match kind {
                    // Read-receipt: advance the send window past everything
                    // up to the acknowledged id.
                    MessageAckKind::Read => {
                        if let Some(session) = self.sessions.get_mut(&peer_id) {
                            session.stream.on_read_ack(id);
                        }
                    }
                    // The peer is missing `id`: hand back the still-held
                    // frame for immediate retransmission rather than
                    // waiting out the periodic retransmit interval.
                    MessageAckKind::Request => {
                        if let Some(session) = self.sessions.get_mut(&peer_id) {
                            if let Some(frame) = session.stream.frame_for_retransmit(id, now) {
                                out.outgoing.push((peer_id, frame));
                            }
                        }
                    }
                }
            }
        } else if inner_type == inner::INVITE_REQUEST {
            self.handle_invite_request(peer_id, payload, now, out)?;
        } else if inner_type == inner::INVITE_RESPONSE {
            self.handle_invite_response(peer_id, now, out)?;
        } else if inner_type == inner::INVITE_RESPONSE_REJECT {
            self.handle_invite_reject(peer_id, payload, out)?;
        } else if inner_type == inner::SYNC_REQUEST {
            self.handle_sync_request(peer_id, now, out)?;
        } else if inner_type == inner::SYNC_RESPONSE {
            self.handle_sync_response(peer_id, payload, out)?;
        } else if inner_type == inner::PEER_ANNOUNCE {
            self.handle_peer_announce(payload)?;
        } else if inner_type == inner::PEER_INFO_REQUEST {
            self.handle_peer_info_request(peer_id, payload, now, out)?;
        } else if inner_type == inner::PEER_INFO_RESPONSE {
            self.handle_peer_info_response(peer_id, payload, out)?;
        } else if inner_type == inner::HS_RESPONSE_ACK {
            trace!(?peer_id, "handshake response acknowledged");
        } else {
            trace!(?peer_id, ty = inner_type.0, "ignoring inner packet type not handled post-confirmation");
        }
        Ok(())
    }
}

/// Treat the "no shared state yet" sentinel as version 0 before running
/// the handshake invite tiebreak, so a founder who never sent any shared
/// state yet doesn't spuriously outrank every peer that has.
fn effective_version(version: u32) -> u32 {
    if version == NO_SHARED_STATE_VERSION {
        0
    } else {
        version
    }
}

/// Which of the two `MessageAck` meanings a given frame carries: a
/// request for retransmission of a missing id, or a read-receipt
/// advancing the sender's window past everything up to and including id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageAckKind {
    Request,
    Read,
}

impl MessageAckKind {
    fn to_byte(self) -> u8 {
        match self {
            MessageAckKind::Request => 0,
            MessageAckKind::Read => 1,
        }
    }

    fn parse(payload: &[u8]) -> Option<(Self, u64)> {
        if payload.len() < 9 {
            return None;
        }
        let kind = match payload[0] {
            0 => MessageAckKind::Request,
            1 => MessageAckKind::Read,
            _ => return None,
        };
        let id = u64::from_be_bytes(payload[1..9].try_into().ok()?);
        Some((kind, id))
    }
}

/// Decode a `Ping` inner payload into its four counters.
fn parse_ping_snapshot(buf: &[u8]) -> Option<PingSnapshot> {
    if buf.len() < 16 {
        return None;
    }
    Some(PingSnapshot {
        confirmed_peer_count: u32::from_be_bytes(buf[0..4].try_into().ok()?),
        shared_state_version: u32::from_be_bytes(buf[4..8].try_into().ok()?),
        sanctions_credentials_version: u32::from_be_bytes(buf[8..12].try_into().ok()?),
        topic_version: u32::from_be_bytes(buf[12..16].try_into().ok()?),
    })
}

/// Encode a `Ping` inner payload from its four counters.
pub fn write_ping_snapshot(snapshot: &PingSnapshot) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&snapshot.confirmed_peer_count.to_be_bytes());
    out.extend_from_slice(&snapshot.shared_state_version.to_be_bytes());
    out.extend_from_slice(&snapshot.sanctions_credentials_version.to_be_bytes());
    out.extend_from_slice(&snapshot.topic_version.to_be_bytes());
    out
}

/// Lifecycle events plus any reply frames produced while handling one
/// inbound frame, already sealed and addressed, ready for the caller to
/// hand to its transport collaborator.
#[derive(Debug, Default)]
pub struct HandleOutput {
    pub events: Vec<GroupEvent>,
    /// (recipient, sealed wire frame) pairs ready to transmit as-is.
    pub outgoing: Vec<(PeerId, Vec<u8>)>,
}
