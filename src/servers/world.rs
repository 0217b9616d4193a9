//! The world server: game state and the loop that drives it.
//!
//! [`Game`] is everything the handlers and timers operate on. [`WorldServer`]
//! owns a `Game` together with its scheduler and handler registry, pulls
//! events off the inbound channel and ticks the scheduler. All of it lives
//! on one thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;

use super::checkin::{self, CheckinState};
use crate::bridge::{Deadline, WorkerBridge};
use crate::config::ServerConfig;
use crate::core::{self, ServerClock, SharedServerState, MAX_TICK};
use crate::handlers::HandlerRegistry;
use crate::network::{ClientLink, ConnectionId, Inbound};
use crate::persistence::Persistence;
use crate::session::{Session, SessionManager};
use crate::timer::{TimerHandle, TimerScheduler, Timestamp};
use crate::world::{CharacterId, World};

/// Budget for writing the store to disk.
const FLUSH_BUDGET: Duration = Duration::from_secs(10);

pub struct Game {
    pub config: Arc<ServerConfig>,
    pub sessions: SessionManager,
    pub world: World,
    pub store: Box<dyn Persistence>,
    pub bridge: WorkerBridge<Game>,
    pub(crate) checkin: CheckinState,
    /// Disconnected characters waiting to be saved and removed
    lingering: HashMap<CharacterId, TimerHandle>,
    flushing: bool,
}

impl Game {
    pub fn new(config: Arc<ServerConfig>, store: Box<dyn Persistence>, bridge: WorkerBridge<Game>) -> Self {
        let mut world = World::new();
        world.set_lore_items(&config.trade.lore_items);
        Self {
            sessions: SessionManager::new(config.max_connections),
            checkin: CheckinState::new(config.checkin.period_secs),
            config,
            world,
            store,
            bridge,
            lingering: HashMap::new(),
            flushing: false,
        }
    }

    /// Open a session for a new connection. Dropping the link on refusal
    /// closes the socket.
    pub fn connect(&mut self, id: ConnectionId, addr: SocketAddr, link: ClientLink, now: Timestamp) {
        if let Err(e) = self.sessions.insert(Session::new(id, addr, link, now)) {
            tracing::warn!("[world] conn={} from {} refused: {}", id, addr, e);
        }
    }

    /// Drop the connection's session. A playing character is unwound from
    /// its trade and party and lingers unreachable for `logout_linger`.
    pub fn disconnect(&mut self, timers: &mut TimerScheduler<Game>, conn: ConnectionId) {
        let Ok(session) = self.sessions.remove(conn) else {
            return;
        };
        let Some(id) = session.character() else {
            tracing::debug!("[world] conn={} disconnected", conn);
            return;
        };

        self.world.detach(id);
        let linger = self.config.logout_linger();
        let handle = timers.schedule(linger, move |game: &mut Game, _timers: &mut TimerScheduler<Game>, _| {
            game.linger_expired(id);
        });
        if let Some(old) = self.lingering.insert(id, handle) {
            timers.cancel(old);
        }
        tracing::info!(
            "[world] conn={} dropped, {} lingers for {}ms",
            conn,
            id,
            linger.as_millis()
        );
    }

    fn linger_expired(&mut self, id: CharacterId) {
        self.lingering.remove(&id);
        let Some(character) = self.world.character(id) else {
            return;
        };
        if character.is_reachable() {
            return;
        }
        self.save_character(id);
        self.world.remove(id);
    }

    /// Stop a pending linger, e.g. because the player came back.
    pub fn cancel_linger(&mut self, timers: &mut TimerScheduler<Game>, id: CharacterId) -> bool {
        match self.lingering.remove(&id) {
            Some(handle) => {
                timers.cancel(handle);
                tracing::debug!("[world] {} linger cancelled", id);
                true
            }
            None => false,
        }
    }

    pub fn is_lingering(&self, id: CharacterId) -> bool {
        self.lingering.contains_key(&id)
    }

    /// Save and remove a character right away.
    pub fn logout_character(&mut self, timers: &mut TimerScheduler<Game>, id: CharacterId) {
        self.cancel_linger(timers, id);
        self.save_character(id);
        self.world.remove(id);
    }

    fn save_character(&mut self, id: CharacterId) -> bool {
        let Some(character) = self.world.character(id) else {
            return false;
        };
        match self.store.save_character(character.to_record()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("[world] save {} failed: {}", id, e);
                false
            }
        }
    }

    /// Save every character changed since the last pass. Returns how many were saved.
    pub fn save_dirty(&mut self) -> usize {
        let dirty = self.world.take_dirty();
        dirty.into_iter().filter(|id| self.save_character(*id)).count()
    }

    /// Save every online character.
    pub fn save_all(&mut self) -> usize {
        let ids: Vec<CharacterId> = self.world.characters().map(|c| c.id()).collect();
        self.world.take_dirty();
        ids.into_iter().filter(|id| self.save_character(*id)).count()
    }

    /// Write the store to disk on a worker. At most one write runs at a time;
    /// changes made meanwhile go out with the next flush.
    pub fn flush(&mut self) {
        if self.flushing {
            return;
        }
        let job = match self.store.flush_job() {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("[store] serialize failed: {}", e);
                return;
            }
        };
        self.flushing = true;
        self.bridge.run(
            "flush",
            FLUSH_BUDGET,
            move |deadline| job.write(deadline),
            |game: &mut Game, _timers: &mut TimerScheduler<Game>, result| {
                game.flushing = false;
                match result {
                    Ok(bytes) => tracing::debug!("[store] flushed {} bytes", bytes),
                    Err(e) => tracing::warn!("[store] flush failed: {}", e),
                }
            },
        );
    }

    /// Save everyone and write the store on this thread.
    pub fn shutdown(&mut self) {
        let saved = self.save_all();
        match self.store.flush_job() {
            Ok(Some(job)) => {
                let path = job.path().display().to_string();
                match job.write(Deadline::after(FLUSH_BUDGET)) {
                    Ok(bytes) => tracing::info!("[store] wrote {} bytes to {}", bytes, path),
                    Err(e) => tracing::error!("[store] final write to {} failed: {}", path, e),
                }
            }
            Ok(None) => {}
            Err(e) => tracing::error!("[store] serialize failed: {}", e),
        }
        tracing::info!("[world] shutdown: saved {} characters", saved);
    }

    /// Swap in a new configuration snapshot.
    pub fn rehash(&mut self, config: Arc<ServerConfig>) {
        self.sessions.set_max_sessions(config.max_connections);
        self.world.set_lore_items(&config.trade.lore_items);
        self.config = config;
    }
}

pub struct WorldServer {
    game: Game,
    timers: TimerScheduler<Game>,
    registry: HandlerRegistry,
    inbound: UnboundedReceiver<Inbound>,
    clock: ServerClock,
    state: SharedServerState,
}

impl WorldServer {
    /// Build the server. `runtime` runs bridge work; the server itself must
    /// stay on the thread that calls [`WorldServer::run`].
    pub fn new(
        config: Arc<ServerConfig>,
        store: Box<dyn Persistence>,
        runtime: Handle,
        inbound: UnboundedReceiver<Inbound>,
        state: SharedServerState,
    ) -> Self {
        let mut timers = TimerScheduler::new();
        let bridge = WorkerBridge::new(runtime, timers.remote());
        let registry = HandlerRegistry::standard(&config);
        let mut game = Game::new(Arc::clone(&config), store, bridge);

        let save_interval = config.save_interval();
        timers.schedule_repeating(save_interval, save_interval, |game: &mut Game, _timers: &mut TimerScheduler<Game>, _| {
            let saved = game.save_dirty();
            if saved > 0 {
                tracing::debug!("[world] saved {} characters", saved);
            }
            game.flush();
        });
        checkin::start(&mut game, &mut timers);

        Self {
            game,
            timers,
            registry,
            inbound,
            clock: ServerClock::start(),
            state,
        }
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut Game {
        &mut self.game
    }

    pub fn timers(&self) -> &TimerScheduler<Game> {
        &self.timers
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn handle(&mut self, event: Inbound) {
        match event {
            Inbound::Connected { id, addr, link } => {
                let now = self.timers.now();
                self.game.connect(id, addr, link, now);
            }
            Inbound::Message { id, packet } => {
                self.registry.dispatch(&mut self.game, &mut self.timers, id, &packet);
            }
            Inbound::Disconnected { id } => self.game.disconnect(&mut self.timers, id),
            Inbound::Rehash(config) => self.rehash(config),
        }
    }

    /// Drain pending events, then fire due timers. Returns the number of events handled.
    pub fn step(&mut self, now: Timestamp) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.inbound.try_recv() {
            self.handle(event);
            handled += 1;
        }
        self.timers.tick(now, &mut self.game);
        handled
    }

    pub fn rehash(&mut self, config: Arc<ServerConfig>) {
        self.registry.apply_flood(&config);
        self.game.rehash(config);
        checkin::start(&mut self.game, &mut self.timers);
        tracing::info!("[world] configuration reloaded");
    }

    /// Run until shutdown is requested, then save everything.
    pub fn run(mut self) {
        tracing::info!("[world] game loop started");
        while !core::shutdown_requested(&self.state) {
            let started = Instant::now();
            let now = self.clock.now();
            self.step(now);

            let tick = self.game.config.tick().min(MAX_TICK);
            if let Some(rest) = tick.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
        tracing::info!("[world] game loop stopping");
        self.game.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::create_server_state;
    use crate::handlers::testing::{config, Harness};
    use crate::network::{Action, Family, PacketBuilder};
    use crate::persistence::MemoryStore;
    use crate::session::SessionState;
    use tokio::sync::mpsc;

    fn server(config: ServerConfig) -> (tokio::runtime::Runtime, WorldServer, mpsc::UnboundedSender<Inbound>) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let server = WorldServer::new(
            Arc::new(config),
            Box::new(MemoryStore::new()),
            runtime.handle().clone(),
            rx,
            create_server_state(),
        );
        (runtime, server, tx)
    }

    fn message(packet: PacketBuilder) -> crate::network::Packet {
        crate::network::Packet::decode(&packet.finish()).unwrap()
    }

    #[test]
    fn test_events_reach_handlers() {
        let (_rt, mut server, tx) = server(config());
        let (link, mut rx) = ClientLink::channel(7);
        let addr = "127.0.0.1:5000".parse().unwrap();
        tx.send(Inbound::Connected { id: 7, addr, link }).unwrap();
        tx.send(Inbound::Message {
            id: 7,
            packet: message(PacketBuilder::new(Family::Connection, Action::Init).add_u32(1)),
        })
        .unwrap();

        assert_eq!(server.step(Timestamp::from_millis(10)), 2);
        assert_eq!(
            server.game().sessions.get(7).map(Session::state),
            Some(SessionState::Menu)
        );
        assert!(rx.try_recv().is_ok());

        tx.send(Inbound::Disconnected { id: 7 }).unwrap();
        server.step(Timestamp::from_millis(20));
        assert!(server.game().sessions.is_empty());
    }

    #[test]
    fn test_rehash_updates_flood_and_limits() {
        let (_rt, mut server, tx) = server(config());
        let mut cfg = config();
        cfg.flood.insert("party.request".to_string(), 3000);
        cfg.max_connections = 3;
        tx.send(Inbound::Rehash(Arc::new(cfg))).unwrap();
        server.step(Timestamp::from_millis(1));

        assert_eq!(
            server.registry().interval(Family::Party, Action::Request),
            Some(Duration::from_secs(3))
        );
        assert_eq!(server.game().config.max_connections, 3);
    }

    #[test]
    fn test_rehash_reloads_lore_items() {
        let mut cfg = config();
        cfg.trade.lore_items = vec![10];
        let mut h = Harness::new(cfg);
        assert!(!h.game.world.is_tradeable(10));

        let mut cfg = config();
        cfg.trade.lore_items = vec![11];
        h.game.rehash(Arc::new(cfg));
        assert!(h.game.world.is_tradeable(10));
        assert!(!h.game.world.is_tradeable(11));
    }

    #[test]
    fn test_linger_saves_and_removes() {
        let mut h = Harness::new(config());
        let (_alice, a) = h.playing(1, "Alice");
        h.game.world.character_mut(a).unwrap().inventory.add(5, 3);

        h.game.disconnect(&mut h.timers, 1);
        assert!(h.game.is_lingering(a));
        assert!(h.game.world.character(a).is_some());

        let linger = h.game.config.logout_linger();
        h.advance(linger + Duration::from_millis(1));
        assert!(h.game.world.character(a).is_none());
        assert!(!h.game.is_lingering(a));
        assert_eq!(h.game.store.character(a).unwrap().inventory.len(), 1);
    }

    #[test]
    fn test_relog_during_linger_keeps_character() {
        let mut h = Harness::new(config());
        let (_alice, a) = h.playing(1, "Alice");
        h.game.disconnect(&mut h.timers, 1);

        let _peer = h.logged_in(2, "Alice", "secret1");
        h.send(2, PacketBuilder::new(Family::Welcome, Action::Request).add_u32(a.0));
        assert_eq!(h.state(2), Some(SessionState::Playing));
        assert!(!h.game.is_lingering(a));

        let linger = h.game.config.logout_linger();
        h.advance(linger * 2);
        let alice = h.game.world.character(a).unwrap();
        assert!(alice.is_reachable());
        assert_eq!(alice.connection(), Some(2));
    }

    #[test]
    fn test_save_all_on_shutdown() {
        let mut h = Harness::new(config());
        let (_alice, a) = h.playing(1, "Alice");
        h.game.world.character_mut(a).unwrap().progression.exp = 77;
        h.game.shutdown();
        assert_eq!(h.game.store.character(a).unwrap().exp, 77);
    }

    #[test]
    fn test_run_exits_on_shutdown() {
        let (_rt, server, _tx) = server(config());
        let state = server.state.clone();
        core::request_shutdown(&state);
        server.run();
    }
}
