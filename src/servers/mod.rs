//! The world server process: game state, its loop, and the server-list check-in.

pub mod checkin;
pub mod world;
