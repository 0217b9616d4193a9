//! Handshake and keepalive.

use std::time::Duration;

use super::{Context, HandlerError, HandlerRegistry};
use crate::network::{Action, Family, PacketBuilder, PacketReader};
use crate::session::{SessionState, StateSet};

/// Init reply status
pub const INIT_OK: u8 = 1;

/// Client hello: `u32 version`. Answered with the connection id.
fn init(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let version = reader.get_u32()?;
    let conn = ctx.conn;
    let session = ctx.session_mut()?;
    session.advance(SessionState::Menu)?;
    tracing::debug!("[connection] conn={} handshake version={}", conn, version);

    ctx.reply(
        &PacketBuilder::new(Family::Init, Action::Init)
            .add_u8(INIT_OK)
            .add_u32(conn),
    );
    Ok(())
}

/// empty body
fn ping(ctx: &mut Context<'_>, _reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    ctx.reply(&PacketBuilder::new(Family::Connection, Action::Pong));
    Ok(())
}

pub fn register(registry: &mut HandlerRegistry) {
    registry.register(
        Family::Connection,
        Action::Init,
        "Connection_Init",
        init,
        StateSet::UNESTABLISHED,
        Duration::ZERO,
    );
    registry.register(
        Family::Connection,
        Action::Ping,
        "Connection_Ping",
        ping,
        StateSet::ESTABLISHED,
        Duration::ZERO,
    );
}
