//! Login, character selection and entering the world.

use std::time::Duration;

use super::{valid_name, Context, HandlerError, HandlerRegistry, HALF_SECOND, ONE_SECOND};
use crate::bridge::WorkResult;
use crate::network::{Action, ConnectionId, Family, PacketBuilder, PacketReader};
use crate::persistence::{CharacterRecord, Persistence};
use crate::servers::world::Game;
use crate::session::{SessionState, StateSet};
use crate::timer::TimerScheduler;
use crate::world::{Appearance, Character, CharacterId};

pub const LOGIN_WRONG_USER: u16 = 1;
pub const LOGIN_WRONG_PASSWORD: u16 = 2;
pub const LOGIN_OK: u16 = 3;
pub const LOGIN_LOGGED_IN: u16 = 5;

pub const CHARACTER_EXISTS: u16 = 1;
pub const CHARACTER_FULL: u16 = 2;
pub const CHARACTER_NOT_APPROVED: u16 = 4;
pub const CHARACTER_OK: u16 = 5;

/// u8 count, then per character: u32 id, u8 level, u8 admin, appearance, break name
fn add_character_list(builder: PacketBuilder, store: &dyn Persistence, account: &str) -> PacketBuilder {
    let characters = store.characters_of(account);
    let count = u8::try_from(characters.len()).unwrap_or(u8::MAX);
    characters
        .into_iter()
        .take(usize::from(count))
        .fold(builder.add_u8(count), |builder, c: &CharacterRecord| {
            builder
                .add_u32(c.id)
                .add_u8(c.level)
                .add_u8(c.admin.tier())
                .add_u8(c.appearance.gender)
                .add_u8(c.appearance.hair_style)
                .add_u8(c.appearance.hair_color)
                .add_u8(c.appearance.skin)
                .add_break_string(&c.name)
        })
}

fn login_reply(code: u16) -> PacketBuilder {
    PacketBuilder::new(Family::Login, Action::Reply).add_u16(code)
}

/// Runs on the game thread once the password check is back.
fn login_verified(game: &mut Game, conn: ConnectionId, username: &str, result: WorkResult<bool>) {
    let Some(session) = game.sessions.get_mut(conn) else {
        return;
    };
    session.set_pending(None);

    let verified = match result {
        Ok(verified) => verified,
        Err(e) => {
            tracing::warn!("[login] conn={} verify for {} failed: {}", conn, username, e);
            false
        }
    };
    if !verified {
        tracing::debug!("[login] conn={} wrong password for {}", conn, username);
        session.send(&login_reply(LOGIN_WRONG_PASSWORD));
        return;
    }

    // Someone else may have logged in while the hash was being checked.
    if game.sessions.find_by_account(username).is_some() {
        if let Some(session) = game.sessions.get(conn) {
            session.send(&login_reply(LOGIN_LOGGED_IN));
        }
        return;
    }

    let Some(session) = game.sessions.get_mut(conn) else {
        return;
    };
    if let Err(e) = session.authenticate(username) {
        tracing::debug!("[login] conn={} {}", conn, e);
        return;
    }
    tracing::info!("[login] conn={} logged in as {}", conn, username);
    let reply = add_character_list(login_reply(LOGIN_OK), game.store.as_ref(), username);
    session.send(&reply);
}

/// `break username, break password`
fn request(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let username = reader.get_break_string()?.to_ascii_lowercase();
    let password = reader.get_break_string()?;

    let limits = &ctx.game.config.account;
    if !(limits.min_username..=limits.max_username).contains(&username.len())
        || !(limits.min_password..=limits.max_password).contains(&password.len())
    {
        return Err(HandlerError::Invalid("login field length"));
    }
    if ctx.session()?.pending().is_some() {
        return Err(HandlerError::Invalid("request already pending"));
    }

    let Some(stored) = ctx.game.store.account(&username).map(|a| a.password_hash.clone()) else {
        ctx.reply(&login_reply(LOGIN_WRONG_USER));
        return Ok(());
    };
    if ctx.game.sessions.find_by_account(&username).is_some() {
        ctx.reply(&login_reply(LOGIN_LOGGED_IN));
        return Ok(());
    }

    ctx.session_mut()?.set_pending(Some("login"));
    let conn = ctx.conn;
    ctx.game.bridge.run(
        "login",
        ctx.game.config.login_deadline(),
        move |deadline| {
            deadline.check()?;
            Ok(bcrypt::verify(&password, &stored).unwrap_or(false))
        },
        move |game: &mut Game, _timers: &mut TimerScheduler<Game>, result: WorkResult<bool>| {
            login_verified(game, conn, &username, result);
        },
    );
    Ok(())
}

/// Leave the world (or the character menu) and go back to the main menu.
fn remove(ctx: &mut Context<'_>, _reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let conn = ctx.conn;
    let character = ctx.session_mut()?.logout();
    if let Some(id) = character {
        ctx.game.logout_character(ctx.timers, id);
    }
    tracing::info!("[login] conn={} logged out", conn);
    ctx.reply(&PacketBuilder::new(Family::Login, Action::Remove).add_u8(1));
    Ok(())
}

/// `u8 gender, u8 hair style, u8 hair color, u8 skin, break name`
fn create_character(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let appearance = Appearance {
        gender: reader.get_u8()?,
        hair_style: reader.get_u8()?,
        hair_color: reader.get_u8()?,
        skin: reader.get_u8()?,
    };
    let name = reader.get_break_string()?;

    let limits = &ctx.game.config.account;
    if !(limits.min_character_name..=limits.max_character_name).contains(&name.len()) {
        return Err(HandlerError::Invalid("character name length"));
    }
    let account = ctx
        .session()?
        .account()
        .ok_or(HandlerError::Invalid("not logged in"))?
        .to_string();

    let reply = PacketBuilder::new(Family::Character, Action::Reply);
    if !valid_name(&name) {
        ctx.reply(&reply.add_u16(CHARACTER_NOT_APPROVED));
        return Ok(());
    }
    if ctx.game.store.characters_of(&account).len() >= limits.max_characters {
        ctx.reply(&reply.add_u16(CHARACTER_FULL));
        return Ok(());
    }
    if ctx.game.store.character_by_name(&name).is_some() {
        ctx.reply(&reply.add_u16(CHARACTER_EXISTS));
        return Ok(());
    }

    let start = ctx.game.config.start_point;
    let record = ctx
        .game
        .store
        .create_character(&account, &name, appearance, start)?;
    tracing::info!("[login] [character] {} created {} ({})", account, record.name, record.id);

    let reply = add_character_list(reply.add_u16(CHARACTER_OK), ctx.game.store.as_ref(), &account);
    ctx.reply(&reply);
    Ok(())
}

/// Enter the world: `u32 character id`
fn welcome(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let id = CharacterId(reader.get_u32()?);
    let session = ctx.session()?;
    let account = session
        .account()
        .ok_or(HandlerError::Invalid("not logged in"))?
        .to_string();
    let link = session.link().clone();

    let record = ctx
        .game
        .store
        .character(id)
        .filter(|r| r.account.eq_ignore_ascii_case(&account))
        .cloned()
        .ok_or(HandlerError::Invalid("character not on this account"))?;

    if ctx.game.world.character(id).is_some() {
        // Still lingering from a dropped connection: pick it back up.
        ctx.game.cancel_linger(ctx.timers, id);
        ctx.game.world.attach(id, link)?;
    } else {
        ctx.game.world.enter(Character::from_record(&record), Some(link))?;
    }
    ctx.session_mut()?.enter_world(id)?;

    let Some(character) = ctx.game.world.character(id) else {
        return Err(HandlerError::NoCharacter(ctx.conn));
    };
    let reply = PacketBuilder::new(Family::Welcome, Action::Reply)
        .add_u32(id.0)
        .add_break_string(character.name())
        .add_break_string(&character.title)
        .add_u16(character.position.m)
        .add_u16(character.position.x)
        .add_u16(character.position.y)
        .add_u8(character.progression.level)
        .add_u16(character.vitals.hp)
        .add_u16(character.vitals.max_hp)
        .add_u8(character.admin.tier());
    character.send(&reply);
    tracing::info!("[login] conn={} {} entered the world", ctx.conn, character.name());
    Ok(())
}

pub fn register(registry: &mut HandlerRegistry) {
    registry.register(
        Family::Login,
        Action::Request,
        "Login_Request",
        request,
        StateSet::MENU,
        ONE_SECOND,
    );
    registry.register(
        Family::Login,
        Action::Remove,
        "Login_Remove",
        remove,
        StateSet::of(&[SessionState::CharacterMenu, SessionState::Playing]),
        Duration::ZERO,
    );
    registry.register(
        Family::Character,
        Action::Create,
        "Character_Create",
        create_character,
        StateSet::CHARACTER_MENU,
        ONE_SECOND,
    );
    registry.register(
        Family::Welcome,
        Action::Request,
        "Welcome_Request",
        welcome,
        StateSet::CHARACTER_MENU,
        HALF_SECOND,
    );
}
