//! Trade messages. All of them need a character in the world.

use std::time::Duration;

use super::{Context, HandlerError, HandlerRegistry, HALF_SECOND};
use crate::network::{Action, Family, PacketReader};
use crate::session::StateSet;
use crate::world::CharacterId;

/// `u32 target`
fn request(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let target = CharacterId(reader.get_u32()?);
    let me = ctx.character_id()?;
    let config = ctx.game.config.clone();
    ctx.game.world.trade_request(me, target, &config.trade)?;
    Ok(())
}

/// `u32 requester`
fn accept(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let requester = CharacterId(reader.get_u32()?);
    let me = ctx.character_id()?;
    let config = ctx.game.config.clone();
    ctx.game.world.trade_accept(me, requester, &config.trade)?;
    Ok(())
}

/// `u16 item, u32 amount`
fn add(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let item = reader.get_u16()?;
    let amount = reader.get_u32()?;
    let me = ctx.character_id()?;
    let config = ctx.game.config.clone();
    ctx.game.world.trade_add(me, item, amount, &config.trade)?;
    Ok(())
}

/// `u16 item`
fn remove(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let item = reader.get_u16()?;
    let me = ctx.character_id()?;
    ctx.game.world.trade_remove(me, item)?;
    Ok(())
}

/// `u8 agree` (0 withdraws)
fn agree(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let agree = reader.get_u8()? != 0;
    let me = ctx.character_id()?;
    let config = ctx.game.config.clone();
    ctx.game.world.trade_agree(me, agree, &config.trade)?;
    Ok(())
}

/// empty body
fn close(ctx: &mut Context<'_>, _reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let me = ctx.character_id()?;
    ctx.game.world.trade_close(me)?;
    Ok(())
}

pub fn register(registry: &mut HandlerRegistry) {
    let routes: [(Action, &'static str, super::Handler, Duration); 6] = [
        (Action::Request, "Trade_Request", request, HALF_SECOND),
        (Action::Accept, "Trade_Accept", accept, Duration::ZERO),
        (Action::Add, "Trade_Add", add, Duration::ZERO),
        (Action::Remove, "Trade_Remove", remove, Duration::ZERO),
        (Action::Agree, "Trade_Agree", agree, Duration::ZERO),
        (Action::Close, "Trade_Close", close, Duration::ZERO),
    ];
    for (action, name, handler, interval) in routes {
        registry.register(Family::Trade, action, name, handler, StateSet::PLAYING, interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{config, Harness};
    use crate::handlers::Dispatch;
    use crate::network::PacketBuilder;
    use crate::persistence::Persistence;

    #[test]
    fn test_trade_over_the_wire() {
        let mut h = Harness::new(config());
        let (mut alice, a) = h.playing(1, "Alice");
        let (mut bob, b) = h.playing(2, "Bobby");
        h.game.world.character_mut(a).unwrap().inventory.add(10, 4);
        h.game.world.character_mut(b).unwrap().inventory.add(20, 1);

        assert_eq!(
            h.send(1, PacketBuilder::new(Family::Trade, Action::Request).add_u32(b.0)),
            Dispatch::Handled
        );
        assert_eq!(
            h.send(2, PacketBuilder::new(Family::Trade, Action::Accept).add_u32(a.0)),
            Dispatch::Handled
        );
        h.send(1, PacketBuilder::new(Family::Trade, Action::Add).add_u16(10).add_u32(4));
        h.send(2, PacketBuilder::new(Family::Trade, Action::Add).add_u16(20).add_u32(1));
        h.send(1, PacketBuilder::new(Family::Trade, Action::Agree).add_u8(1));
        h.send(2, PacketBuilder::new(Family::Trade, Action::Agree).add_u8(1));

        let world = &h.game.world;
        assert_eq!(world.character(a).unwrap().inventory.amount(20), 1);
        assert_eq!(world.character(b).unwrap().inventory.amount(10), 4);
        assert!(alice.opcodes().contains(&(Family::Trade.as_u8(), Action::Use.as_u8())));
        assert!(bob.opcodes().contains(&(Family::Trade.as_u8(), Action::Use.as_u8())));
        world.check_invariants().unwrap();

        // Saved on the next pass.
        assert!(h.game.save_dirty() >= 2);
        assert_eq!(h.game.store.character(a).unwrap().inventory.len(), 1);
    }

    #[test]
    fn test_configured_lore_item_cannot_be_offered() {
        let mut cfg = config();
        cfg.trade.lore_items = vec![10];
        let mut h = Harness::new(cfg);
        let (_alice, a) = h.playing(1, "Alice");
        let (_bob, b) = h.playing(2, "Bobby");
        h.game.world.character_mut(a).unwrap().inventory.add(10, 4);
        h.game.world.character_mut(a).unwrap().inventory.add(11, 1);

        h.send(1, PacketBuilder::new(Family::Trade, Action::Request).add_u32(b.0));
        h.send(2, PacketBuilder::new(Family::Trade, Action::Accept).add_u32(a.0));
        assert_eq!(
            h.send(1, PacketBuilder::new(Family::Trade, Action::Add).add_u16(10).add_u32(4)),
            Dispatch::Failed
        );

        let world = &h.game.world;
        let id = world.character(a).unwrap().trade().unwrap();
        assert!(world.trade_session(id).unwrap().side(a).unwrap().offer.is_empty());
        assert_eq!(world.character(a).unwrap().inventory.amount(10), 4);

        // Other items still go through.
        assert_eq!(
            h.send(1, PacketBuilder::new(Family::Trade, Action::Add).add_u16(11).add_u32(1)),
            Dispatch::Handled
        );
    }

    #[test]
    fn test_rejection_is_dropped() {
        let mut h = Harness::new(config());
        let (_alice, _a) = h.playing(1, "Alice");
        assert_eq!(
            h.send(1, PacketBuilder::new(Family::Trade, Action::Request).add_u32(999)),
            Dispatch::Failed
        );
        assert_eq!(
            h.send(1, PacketBuilder::new(Family::Trade, Action::Close)),
            Dispatch::Failed
        );
    }

    #[test]
    fn test_request_is_flood_limited() {
        let mut h = Harness::new(config());
        let (_alice, _a) = h.playing(1, "Alice");
        let (_bob, b) = h.playing(2, "Bobby");

        let request = || PacketBuilder::new(Family::Trade, Action::Request).add_u32(b.0);
        assert_eq!(h.send(1, request()), Dispatch::Handled);
        assert_eq!(h.send(1, request()), Dispatch::Throttled);
        h.advance(HALF_SECOND);
        assert_eq!(h.send(1, request()), Dispatch::Handled);
    }
}
