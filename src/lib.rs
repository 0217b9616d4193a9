//! Ember - world server core
//!
//! A single-threaded game loop owning the world (characters, parties,
//! trades), fed by tokio connection tasks and a worker bridge for blocking
//! work such as password hashing and disk writes.

// ============================================
// Runtime
// ============================================

/// Shutdown state and the server clock
pub mod core;
/// Game-thread event scheduler
pub mod timer;
/// Worker pool to game thread handoff
pub mod bridge;
/// Server configuration (YAML)
pub mod config;

// ============================================
// Protocol
// ============================================

/// Framing, packet codec and the TCP listener
pub mod network;
/// Per-connection session state and flood control
pub mod session;
/// Opcode dispatch and message handlers
pub mod handlers;

// ============================================
// Game
// ============================================

/// Characters, parties and trades
pub mod world;
/// Account and character storage
pub mod persistence;
/// The world server and its loop
pub mod servers;
