//! Party messages and party chat.

use std::time::Duration;

use super::{Context, HandlerError, HandlerRegistry, HALF_SECOND};
use crate::network::{Action, Family, PacketReader};
use crate::session::StateSet;
use crate::world::{CharacterId, PartyRequestKind};

/// Longest party chat line
const CHAT_MAX: usize = 128;

fn request_kind(reader: &mut PacketReader<'_>) -> Result<PartyRequestKind, HandlerError> {
    PartyRequestKind::from_u8(reader.get_u8()?).ok_or(HandlerError::Invalid("party request kind"))
}

/// `u8 kind, u32 target`
fn request(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let kind = request_kind(reader)?;
    let target = CharacterId(reader.get_u32()?);
    let me = ctx.character_id()?;
    ctx.game.world.party_request(me, target, kind)?;
    Ok(())
}

/// `u8 kind, u32 requester`
fn accept(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let kind = request_kind(reader)?;
    let requester = CharacterId(reader.get_u32()?);
    let me = ctx.character_id()?;
    ctx.game.world.party_accept(me, requester, kind)?;
    Ok(())
}

/// `u32 member`: yourself to leave, anyone else to kick.
fn remove(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let target = CharacterId(reader.get_u32()?);
    let me = ctx.character_id()?;
    if target == me {
        ctx.game.world.party_leave(me)?;
    } else {
        ctx.game.world.party_kick(me, target)?;
    }
    Ok(())
}

/// empty body; resends the member list
fn take(ctx: &mut Context<'_>, _reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let me = ctx.character_id()?;
    ctx.game.world.party_refresh(me)?;
    Ok(())
}

/// Party chat: `end string message`
fn talk(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let message = reader.get_end_string()?;
    if message.is_empty() || message.len() > CHAT_MAX {
        return Err(HandlerError::Invalid("chat length"));
    }
    let me = ctx.character_id()?;
    ctx.game.world.party_message(me, &message)?;
    Ok(())
}

pub fn register(registry: &mut HandlerRegistry) {
    let routes: [(Action, &'static str, super::Handler, Duration); 4] = [
        (Action::Request, "Party_Request", request, HALF_SECOND),
        (Action::Accept, "Party_Accept", accept, Duration::ZERO),
        (Action::Remove, "Party_Remove", remove, Duration::ZERO),
        (Action::Take, "Party_Take", take, HALF_SECOND),
    ];
    for (action, name, handler, interval) in routes {
        registry.register(Family::Party, action, name, handler, StateSet::PLAYING, interval);
    }
    registry.register(
        Family::Talk,
        Action::Open,
        "Talk_Open",
        talk,
        StateSet::PLAYING,
        Duration::ZERO,
    );
}
