//! Core server lifecycle
//!
//! This module provides:
//! - Shutdown state shared between signal handlers, the listener and the game loop
//! - The monotonic server clock the scheduler runs on

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::timer::Timestamp;

/// Upper bound on how long the game loop sleeps between ticks,
/// whatever `tick_ms` is configured to.
pub const MAX_TICK: Duration = Duration::from_millis(100);

/// Type alias for termination callback functions
/// These run once when shutdown is requested
pub type TermFunc = Box<dyn Fn() + Send + 'static>;

/// Global server state
pub struct ServerState {
    /// Flag indicating if shutdown has been requested
    pub shutdown_requested: bool,
    /// Optional termination callback
    pub term_func: Option<TermFunc>,
}

impl ServerState {
    pub fn new() -> Self {
        ServerState {
            shutdown_requested: false,
            term_func: None,
        }
    }

    /// Request server shutdown. The termination callback runs on the first request only.
    pub fn request_shutdown(&mut self) {
        if !self.shutdown_requested {
            self.shutdown_requested = true;
            if let Some(ref func) = self.term_func {
                func();
            }
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_requested
    }

    pub fn set_term_func<F>(&mut self, func: F)
    where
        F: Fn() + Send + 'static,
    {
        self.term_func = Some(Box::new(func));
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe server state
/// Signal handlers, the listener and the game thread all hold a clone
pub type SharedServerState = Arc<Mutex<ServerState>>;

pub fn create_server_state() -> SharedServerState {
    Arc::new(Mutex::new(ServerState::new()))
}

/// Poisoned state counts as "shut down".
pub fn shutdown_requested(state: &SharedServerState) -> bool {
    state.lock().map(|s| s.should_shutdown()).unwrap_or(true)
}

pub fn request_shutdown(state: &SharedServerState) {
    if let Ok(mut s) = state.lock() {
        s.request_shutdown();
    }
}

/// Milliseconds since the server started, as scheduler timestamps.
#[derive(Debug, Clone, Copy)]
pub struct ServerClock {
    started: Instant,
}

impl ServerClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn now(&self) -> Timestamp {
        let ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Timestamp::from_millis(ms)
    }

    pub fn started(&self) -> Instant {
        self.started
    }
}
