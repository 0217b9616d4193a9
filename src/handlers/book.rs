//! Character profile ("book") lookups.

use super::{Context, HandlerError, HandlerRegistry, HALF_SECOND};
use crate::network::{Action, Family, PacketBuilder, PacketReader};
use crate::session::StateSet;
use crate::world::{AdminLevel, Character, CharacterId};

pub const ICON_NORMAL: u8 = 1;
pub const ICON_GM: u8 = 4;
pub const ICON_HGM: u8 = 5;
pub const ICON_PARTY: u8 = 6;
pub const ICON_GM_PARTY: u8 = 9;
pub const ICON_HGM_PARTY: u8 = 10;

/// Paperdoll icon from staff tier and party membership.
pub fn icon(character: &Character) -> u8 {
    let in_party = character.party().is_some();
    match (character.admin, in_party) {
        (AdminLevel::HighGameMaster, true) => ICON_HGM_PARTY,
        (AdminLevel::HighGameMaster, false) => ICON_HGM,
        (AdminLevel::Player, true) => ICON_PARTY,
        (AdminLevel::Player, false) => ICON_NORMAL,
        (_, true) => ICON_GM_PARTY,
        (_, false) => ICON_GM,
    }
}

/// `u32 target`; a target that is not online shows your own book.
fn request(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let wanted = CharacterId(reader.get_u32()?);
    let me = ctx.character_id()?;
    let world = &ctx.game.world;
    let target = world
        .character(wanted)
        .or_else(|| world.character(me))
        .ok_or(HandlerError::NoCharacter(ctx.conn))?;

    let reply = PacketBuilder::new(Family::Book, Action::Reply)
        .add_break_string(target.name())
        .add_break_string(&target.title)
        .add_u32(target.id().0)
        .add_u8(target.progression.level)
        .add_u8(target.appearance.gender)
        .add_u8(icon(target))
        .add_break();
    ctx.reply(&reply);
    Ok(())
}

pub fn register(registry: &mut HandlerRegistry) {
    registry.register(
        Family::Book,
        Action::Request,
        "Book_Request",
        request,
        StateSet::PLAYING,
        HALF_SECOND,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{config, Harness};

    #[test]
    fn test_icons() {
        let mut c = Character::new(CharacterId(1), "Zed", "zed");
        assert_eq!(icon(&c), ICON_NORMAL);
        c.admin = AdminLevel::Guardian;
        assert_eq!(icon(&c), ICON_GM);
        c.admin = AdminLevel::HighGameMaster;
        assert_eq!(icon(&c), ICON_HGM);
    }

    #[test]
    fn test_book_shows_party_icon() {
        let mut h = Harness::new(config());
        let (mut alice, a) = h.playing(1, "Alice");
        let (_bob, b) = h.playing(2, "Bobby");
        h.game.world.character_mut(b).unwrap().title = "Brave".to_string();
        h.game.world.party_create(a, b).unwrap();
        alice.packets();

        h.send(1, PacketBuilder::new(Family::Book, Action::Request).add_u32(b.0));
        let packets = alice.packets();
        let mut reader = packets[0].reader();
        assert_eq!(reader.get_break_string().unwrap(), "Bobby");
        assert_eq!(reader.get_break_string().unwrap(), "Brave");
        assert_eq!(reader.get_u32().unwrap(), b.0);
        reader.get_u8().unwrap();
        reader.get_u8().unwrap();
        assert_eq!(reader.get_u8().unwrap(), ICON_PARTY);
    }

    #[test]
    fn test_unknown_target_shows_own_book() {
        let mut h = Harness::new(config());
        let (mut alice, _a) = h.playing(1, "Alice");
        h.send(1, PacketBuilder::new(Family::Book, Action::Request).add_u32(0));
        let packets = alice.packets();
        assert_eq!(packets[0].reader().get_break_string().unwrap(), "Alice");
    }
}
