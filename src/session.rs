//! Per-connection session state
//!
//! A `Session` lives on the game thread from `Connected` to `Disconnected`.
//! It tracks where the client is in the login lifecycle, the flood-control
//! timestamps per message family, and the authenticated identity.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::network::{ClientLink, ConnectionId, Family, PacketBuilder};
use crate::timer::Timestamp;
use crate::world::CharacterId;

/// Default session cap when none is configured
pub const MAX_SESSIONS: usize = 1024;

/// Error types for session operations
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found: conn={0}")]
    SessionNotFound(ConnectionId),

    #[error("Session already exists: conn={0}")]
    DuplicateSession(ConnectionId),

    #[error("Maximum sessions exceeded (limit: {0})")]
    MaxSessionsExceeded(usize),

    #[error("Illegal state transition: {from} -> {to}")]
    IllegalTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("Session is not authenticated")]
    NotAuthenticated,
}

/// Connection lifecycle. Moves forward only, except logout back to `Menu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Unestablished,
    Menu,
    CharacterMenu,
    Playing,
}

impl SessionState {
    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Set of states a handler accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateSet(u8);

impl StateSet {
    pub const NONE: StateSet = StateSet(0);
    pub const ANY: StateSet = StateSet(0b1111);
    pub const UNESTABLISHED: StateSet = StateSet(0b0001);
    pub const MENU: StateSet = StateSet(0b0010);
    pub const CHARACTER_MENU: StateSet = StateSet(0b0100);
    pub const PLAYING: StateSet = StateSet(0b1000);
    /// Connected and past the handshake.
    pub const ESTABLISHED: StateSet = StateSet(0b1110);

    pub fn of(states: &[SessionState]) -> Self {
        StateSet(states.iter().fold(0, |acc, s| acc | s.bit()))
    }

    pub fn contains(self, state: SessionState) -> bool {
        self.0 & state.bit() != 0
    }

    pub fn union(self, other: StateSet) -> Self {
        StateSet(self.0 | other.0)
    }
}

/// Who is behind the connection once authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub account: String,
    pub character: Option<CharacterId>,
}

/// Session state for a single client connection
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    addr: SocketAddr,
    link: ClientLink,
    state: SessionState,
    identity: Option<Identity>,
    last_invocation: HashMap<Family, Timestamp>,
    connected_at: Timestamp,
    /// Label of a background job (password hash/verify) still in flight
    pending: Option<&'static str>,
}

impl Session {
    pub fn new(id: ConnectionId, addr: SocketAddr, link: ClientLink, now: Timestamp) -> Self {
        Self {
            id,
            addr,
            link,
            state: SessionState::Unestablished,
            identity: None,
            last_invocation: HashMap::new(),
            connected_at: now,
            pending: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn link(&self) -> &ClientLink {
        &self.link
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connected_at(&self) -> Timestamp {
        self.connected_at
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn account(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.account.as_str())
    }

    pub fn character(&self) -> Option<CharacterId> {
        self.identity.as_ref().and_then(|i| i.character)
    }

    /// Move to a later state. Backwards or same-state moves are rejected.
    pub fn advance(&mut self, next: SessionState) -> Result<(), SessionError> {
        if next <= self.state {
            return Err(SessionError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!("[session] conn={} {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Record a successful login and move to the character menu.
    pub fn authenticate(&mut self, account: &str) -> Result<(), SessionError> {
        self.advance(SessionState::CharacterMenu)?;
        self.identity = Some(Identity {
            account: account.to_string(),
            character: None,
        });
        Ok(())
    }

    /// Bind the playing character and move to `Playing`.
    pub fn enter_world(&mut self, character: CharacterId) -> Result<(), SessionError> {
        let Some(identity) = self.identity.as_mut() else {
            return Err(SessionError::NotAuthenticated);
        };
        if self.state != SessionState::CharacterMenu {
            return Err(SessionError::IllegalTransition {
                from: self.state,
                to: SessionState::Playing,
            });
        }
        identity.character = Some(character);
        self.state = SessionState::Playing;
        tracing::debug!("[session] conn={} CharacterMenu -> Playing", self.id);
        Ok(())
    }

    /// Back to `Menu`, dropping the identity. Returns the character that was playing.
    pub fn logout(&mut self) -> Option<CharacterId> {
        let character = self.character();
        if self.state > SessionState::Menu {
            tracing::debug!("[session] conn={} {} -> Menu", self.id, self.state);
            self.state = SessionState::Menu;
        }
        self.identity = None;
        self.pending = None;
        character
    }

    /// Flood control. Returns true and records `now` when the family's last
    /// accepted message is at least `interval` old.
    pub fn throttle(&mut self, family: Family, interval: Duration, now: Timestamp) -> bool {
        if !interval.is_zero() {
            if let Some(last) = self.last_invocation.get(&family) {
                if now.saturating_since(*last) < interval {
                    return false;
                }
            }
        }
        self.last_invocation.insert(family, now);
        true
    }

    pub fn last_invocation(&self, family: Family) -> Option<Timestamp> {
        self.last_invocation.get(&family).copied()
    }

    pub fn pending(&self) -> Option<&'static str> {
        self.pending
    }

    pub fn set_pending(&mut self, job: Option<&'static str>) {
        self.pending = job;
    }

    pub fn send(&self, packet: &PacketBuilder) -> bool {
        self.link.send(packet)
    }
}

/// Owns every live session, keyed by connection.
#[derive(Debug)]
pub struct SessionManager {
    sessions: HashMap<ConnectionId, Session>,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
        }
    }

    pub fn insert(&mut self, session: Session) -> Result<(), SessionError> {
        if self.sessions.len() >= self.max_sessions {
            return Err(SessionError::MaxSessionsExceeded(self.max_sessions));
        }
        if self.sessions.contains_key(&session.id) {
            return Err(SessionError::DuplicateSession(session.id));
        }
        self.sessions.insert(session.id, session);
        Ok(())
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Result<Session, SessionError> {
        self.sessions
            .remove(&id)
            .ok_or(SessionError::SessionNotFound(id))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn set_max_sessions(&mut self, max_sessions: usize) {
        self.max_sessions = max_sessions;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Connection already logged into `account` (case-insensitive).
    pub fn find_by_account(&self, account: &str) -> Option<ConnectionId> {
        self.sessions
            .values()
            .find(|s| s.account().is_some_and(|a| a.eq_ignore_ascii_case(account)))
            .map(|s| s.id)
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(MAX_SESSIONS)
    }
}
