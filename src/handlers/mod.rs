//! Opcode dispatch.
//!
//! Every client message is routed by its (family, action) pair to one
//! handler. A route also names the session states it is valid in and the
//! minimum interval between accepted messages of its family. Messages that
//! miss any of these checks are dropped without a reply.

pub mod account;
pub mod book;
pub mod connection;
pub mod login;
pub mod party;
pub mod trade;

use std::collections::HashMap;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::network::{Action, ConnectionId, Family, Packet, PacketBuilder, PacketError, PacketReader};
use crate::persistence::PersistError;
use crate::servers::world::Game;
use crate::session::{Session, SessionError, StateSet};
use crate::timer::{Timestamp, TimerScheduler};
use crate::world::{CharacterId, PartyError, TradeError, WorldError};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Trade(#[from] TradeError),

    #[error(transparent)]
    Party(#[from] PartyError),

    #[error(transparent)]
    World(#[from] WorldError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("invalid field: {0}")]
    Invalid(&'static str),

    #[error("no session for conn={0}")]
    NoSession(ConnectionId),

    #[error("conn={0} has no character in the world")]
    NoCharacter(ConnectionId),
}

/// What a handler gets to work with.
pub struct Context<'a> {
    pub game: &'a mut Game,
    pub timers: &'a mut TimerScheduler<Game>,
    pub conn: ConnectionId,
}

impl Context<'_> {
    pub fn now(&self) -> Timestamp {
        self.timers.now()
    }

    pub fn session(&self) -> Result<&Session, HandlerError> {
        self.game
            .sessions
            .get(self.conn)
            .ok_or(HandlerError::NoSession(self.conn))
    }

    pub fn session_mut(&mut self) -> Result<&mut Session, HandlerError> {
        self.game
            .sessions
            .get_mut(self.conn)
            .ok_or(HandlerError::NoSession(self.conn))
    }

    /// The character this connection is playing.
    pub fn character_id(&self) -> Result<CharacterId, HandlerError> {
        self.session()?
            .character()
            .ok_or(HandlerError::NoCharacter(self.conn))
    }

    pub fn reply(&self, packet: &PacketBuilder) -> bool {
        self.game
            .sessions
            .get(self.conn)
            .is_some_and(|s| s.send(packet))
    }
}

pub type Handler = fn(&mut Context<'_>, &mut PacketReader<'_>) -> Result<(), HandlerError>;

#[derive(Clone, Copy)]
struct Route {
    name: &'static str,
    handler: Handler,
    states: StateSet,
    default_interval: Duration,
    interval: Duration,
}

/// Outcome of one dispatch. Only `Handled` means the handler ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Unknown,
    WrongState,
    Throttled,
    Handled,
    Failed,
}

#[derive(Default)]
pub struct HandlerRegistry {
    routes: HashMap<(Family, Action), Route>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every handler the world server speaks, flood
    /// intervals taken from `config`.
    pub fn standard(config: &ServerConfig) -> Self {
        let mut registry = Self::new();
        connection::register(&mut registry);
        account::register(&mut registry);
        login::register(&mut registry);
        trade::register(&mut registry);
        party::register(&mut registry);
        book::register(&mut registry);
        registry.apply_flood(config);
        tracing::debug!("[handlers] {} routes registered", registry.len());
        registry
    }

    /// Add a route.
    ///
    /// # Panics
    /// When the opcode pair already has a handler.
    pub fn register(
        &mut self,
        family: Family,
        action: Action,
        name: &'static str,
        handler: Handler,
        states: StateSet,
        min_interval: Duration,
    ) {
        let route = Route {
            name,
            handler,
            states,
            default_interval: min_interval,
            interval: min_interval,
        };
        if let Some(existing) = self.routes.insert((family, action), route) {
            panic!(
                "duplicate handler for {}/{}: {} and {}",
                family, action, existing.name, name
            );
        }
    }

    /// Reset every interval to its registered default, then apply the
    /// `flood` overrides from `config`.
    pub fn apply_flood(&mut self, config: &ServerConfig) {
        for ((family, action), route) in self.routes.iter_mut() {
            let family = family.to_string();
            let action = action.to_string();
            route.interval = config
                .flood_override(&family, &action)
                .unwrap_or(route.default_interval);
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn contains(&self, family: Family, action: Action) -> bool {
        self.routes.contains_key(&(family, action))
    }

    pub fn interval(&self, family: Family, action: Action) -> Option<Duration> {
        self.routes.get(&(family, action)).map(|r| r.interval)
    }

    /// Route one decoded message from `conn`.
    pub fn dispatch(
        &self,
        game: &mut Game,
        timers: &mut TimerScheduler<Game>,
        conn: ConnectionId,
        packet: &Packet,
    ) -> Dispatch {
        let opcodes = Family::from_u8(packet.family).zip(Action::from_u8(packet.action));
        let Some(((family, action), route)) =
            opcodes.and_then(|key| self.routes.get(&key).map(|route| (key, route)))
        else {
            tracing::trace!(
                "[handlers] conn={} unknown opcode {}/{}",
                conn,
                packet.family,
                packet.action
            );
            return Dispatch::Unknown;
        };

        let now = timers.now();
        let Some(session) = game.sessions.get_mut(conn) else {
            tracing::trace!("[handlers] conn={} has no session", conn);
            return Dispatch::Unknown;
        };
        if !route.states.contains(session.state()) {
            tracing::trace!(
                "[handlers] conn={} {} not valid in {}",
                conn,
                route.name,
                session.state()
            );
            return Dispatch::WrongState;
        }
        if !session.throttle(family, route.interval, now) {
            tracing::trace!("[handlers] conn={} {} throttled", conn, route.name);
            return Dispatch::Throttled;
        }

        tracing::trace!("[handlers] conn={} {}/{} -> {}", conn, family, action, route.name);
        let mut ctx = Context { game, timers, conn };
        let mut reader = packet.reader();
        match (route.handler)(&mut ctx, &mut reader) {
            Ok(()) => Dispatch::Handled,
            Err(e) => {
                tracing::debug!("[handlers] conn={} {} dropped: {}", conn, route.name, e);
                Dispatch::Failed
            }
        }
    }
}

/// 0.5 seconds, the common flood interval
pub(crate) const HALF_SECOND: Duration = Duration::from_millis(500);

/// 1 second
pub(crate) const ONE_SECOND: Duration = Duration::from_secs(1);

/// Account and character names: ASCII letters and digits only.
pub(crate) fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric())
}
