//! Account registration and password changes.
//!
//! Password hashing runs through the worker bridge; the session is marked
//! pending until the result comes back so a client cannot stack requests.

use chrono::Utc;

use super::{valid_name, Context, HandlerError, HandlerRegistry, HALF_SECOND, ONE_SECOND};
use crate::bridge::{WorkError, WorkResult};
use crate::network::{Action, ConnectionId, Family, PacketBuilder, PacketReader};
use crate::persistence::{AccountRecord, Persistence};
use crate::servers::world::Game;
use crate::session::StateSet;
use crate::timer::TimerScheduler;

pub const ACCOUNT_EXISTS: u16 = 1;
pub const ACCOUNT_NOT_APPROVED: u16 = 2;
pub const ACCOUNT_CREATED: u16 = 3;
pub const ACCOUNT_CHANGE_FAILED: u16 = 5;
pub const ACCOUNT_CHANGED: u16 = 6;
pub const ACCOUNT_DENIED: u16 = 7;
pub const ACCOUNT_CONTINUE: u16 = 1000;

/// Longest accepted real name, location or email.
const PROFILE_FIELD_MAX: usize = 64;

fn account_reply(code: u16) -> PacketBuilder {
    let text = match code {
        ACCOUNT_CREATED | ACCOUNT_CHANGED | ACCOUNT_CONTINUE => "OK",
        _ => "NO",
    };
    PacketBuilder::new(Family::Account, Action::Reply)
        .add_u16(code)
        .add_string(text)
}

fn reply_to(game: &mut Game, conn: ConnectionId, code: u16) {
    if let Some(session) = game.sessions.get_mut(conn) {
        session.set_pending(None);
        session.send(&account_reply(code));
    }
}

fn hash_password(password: &str, cost: u32) -> WorkResult<String> {
    bcrypt::hash(password, cost).map_err(|e| WorkError::Failed(e.to_string()))
}

/// Name availability check: `end string username`.
fn request(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let username = reader.get_end_string()?.to_ascii_lowercase();
    let limits = &ctx.game.config.account;

    let code = if !ctx.game.config.registration {
        ACCOUNT_DENIED
    } else if !valid_name(&username)
        || !(limits.min_username..=limits.max_username).contains(&username.len())
    {
        ACCOUNT_NOT_APPROVED
    } else if ctx.game.store.account(&username).is_some() {
        ACCOUNT_EXISTS
    } else {
        ACCOUNT_CONTINUE
    };

    ctx.reply(&account_reply(code));
    if code == ACCOUNT_DENIED {
        tracing::debug!("[account] conn={} registration closed", ctx.conn);
        ctx.game.disconnect(ctx.timers, ctx.conn);
    }
    Ok(())
}

/// `break username, break password, break real name, break location, break email`
fn create(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let username = reader.get_break_string()?.to_ascii_lowercase();
    let password = reader.get_break_string()?;
    let real_name = reader.get_break_string()?;
    let location = reader.get_break_string()?;
    let email = reader.get_break_string()?;

    let config = ctx.game.config.clone();
    let limits = &config.account;
    if !config.registration {
        return Err(HandlerError::Invalid("registration closed"));
    }
    if !(limits.min_username..=limits.max_username).contains(&username.len())
        || !(limits.min_password..=limits.max_password).contains(&password.len())
        || [&real_name, &location, &email]
            .iter()
            .any(|f| f.len() > PROFILE_FIELD_MAX)
    {
        return Err(HandlerError::Invalid("account field length"));
    }
    if ctx.session()?.pending().is_some() {
        return Err(HandlerError::Invalid("request already pending"));
    }

    if !valid_name(&username) {
        ctx.reply(&account_reply(ACCOUNT_NOT_APPROVED));
        return Ok(());
    }
    if ctx.game.store.account(&username).is_some() {
        ctx.reply(&account_reply(ACCOUNT_EXISTS));
        return Ok(());
    }

    ctx.session_mut()?.set_pending(Some("account create"));
    let conn = ctx.conn;
    let cost = config.bcrypt_cost;
    ctx.game.bridge.run(
        "account create",
        config.login_deadline(),
        move |deadline| {
            deadline.check()?;
            hash_password(&password, cost)
        },
        move |game: &mut Game, _timers: &mut TimerScheduler<Game>, result: WorkResult<String>| {
            let code = match result {
                Ok(password_hash) => {
                    let record = AccountRecord {
                        username: username.clone(),
                        password_hash,
                        real_name,
                        location,
                        email,
                        created: Utc::now(),
                    };
                    match game.store.create_account(record) {
                        Ok(()) => {
                            tracing::info!("[account] [create] {}", username);
                            ACCOUNT_CREATED
                        }
                        Err(e) => {
                            tracing::debug!("[account] [create] {}: {}", username, e);
                            ACCOUNT_EXISTS
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("[account] [create] {} hashing failed: {}", username, e);
                    ACCOUNT_NOT_APPROVED
                }
            };
            reply_to(game, conn, code);
        },
    );
    Ok(())
}

/// Password change: `break username, break old password, break new password`
fn agree(ctx: &mut Context<'_>, reader: &mut PacketReader<'_>) -> Result<(), HandlerError> {
    let username = reader.get_break_string()?.to_ascii_lowercase();
    let old_password = reader.get_break_string()?;
    let new_password = reader.get_break_string()?;

    let config = ctx.game.config.clone();
    let limits = &config.account;
    let passwords_ok = [&old_password, &new_password]
        .iter()
        .all(|p| (limits.min_password..=limits.max_password).contains(&p.len()));
    if !passwords_ok {
        return Err(HandlerError::Invalid("password length"));
    }

    let session = ctx.session()?;
    if session.pending().is_some() {
        return Err(HandlerError::Invalid("request already pending"));
    }
    if !session
        .account()
        .is_some_and(|a| a.eq_ignore_ascii_case(&username))
    {
        ctx.reply(&account_reply(ACCOUNT_CHANGE_FAILED));
        return Ok(());
    }
    let Some(stored) = ctx.game.store.account(&username).map(|a| a.password_hash.clone()) else {
        return Err(HandlerError::Invalid("account vanished"));
    };

    ctx.session_mut()?.set_pending(Some("password change"));
    let conn = ctx.conn;
    let cost = config.bcrypt_cost;
    ctx.game.bridge.run(
        "password change",
        config.login_deadline(),
        move |deadline| {
            let verified = bcrypt::verify(&old_password, &stored).unwrap_or(false);
            if !verified {
                return Ok(None);
            }
            deadline.check()?;
            hash_password(&new_password, cost).map(Some)
        },
        move |game: &mut Game, _timers: &mut TimerScheduler<Game>, result: WorkResult<Option<String>>| {
            let code = match result {
                Ok(Some(hash)) => match game.store.set_password(&username, hash) {
                    Ok(()) => {
                        tracing::info!("[account] [password] {} changed", username);
                        ACCOUNT_CHANGED
                    }
                    Err(e) => {
                        tracing::warn!("[account] [password] {}: {}", username, e);
                        ACCOUNT_CHANGE_FAILED
                    }
                },
                Ok(None) => ACCOUNT_CHANGE_FAILED,
                Err(e) => {
                    tracing::warn!("[account] [password] {} failed: {}", username, e);
                    ACCOUNT_CHANGE_FAILED
                }
            };
            reply_to(game, conn, code);
        },
    );
    Ok(())
}

pub fn register(registry: &mut HandlerRegistry) {
    registry.register(
        Family::Account,
        Action::Request,
        "Account_Request",
        request,
        StateSet::MENU,
        HALF_SECOND,
    );
    registry.register(
        Family::Account,
        Action::Create,
        "Account_Create",
        create,
        StateSet::MENU,
        ONE_SECOND,
    );
    registry.register(
        Family::Account,
        Action::Agree,
        "Account_Agree",
        agree,
        StateSet::CHARACTER_MENU,
        ONE_SECOND,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{config, Harness, Peer};
    use crate::handlers::Dispatch;
    use crate::network::Packet;
    use std::time::Duration;

    fn reply_code(packets: &[Packet]) -> Option<u16> {
        packets
            .iter()
            .rev()
            .find(|p| p.family == Family::Account.as_u8() && p.action == Action::Reply.as_u8())
            .and_then(|p| p.reader().get_u16().ok())
    }

    fn handshake(h: &mut Harness, conn: ConnectionId) -> Peer {
        let mut peer = h.connect(conn);
        h.send(conn, PacketBuilder::new(Family::Connection, Action::Init).add_u32(1));
        peer.packets();
        peer
    }

    fn create_packet(name: &str, password: &str) -> PacketBuilder {
        PacketBuilder::new(Family::Account, Action::Create)
            .add_break_string(name)
            .add_break_string(password)
            .add_break_string("Real Name")
            .add_break_string("Somewhere")
            .add_break_string("a@b.c")
    }

    #[test]
    fn test_request_reports_availability() {
        let mut h = Harness::new(config());
        let mut peer = handshake(&mut h, 1);

        h.send(1, PacketBuilder::new(Family::Account, Action::Request).add_string("alice"));
        assert_eq!(reply_code(&peer.packets()), Some(ACCOUNT_CONTINUE));

        h.advance(Duration::from_secs(1));
        h.send(1, PacketBuilder::new(Family::Account, Action::Request).add_string("a b"));
        assert_eq!(reply_code(&peer.packets()), Some(ACCOUNT_NOT_APPROVED));
    }

    #[test]
    fn test_registration_closed_disconnects() {
        let mut cfg = config();
        cfg.registration = false;
        let mut h = Harness::new(cfg);
        let mut peer = handshake(&mut h, 1);

        h.send(1, PacketBuilder::new(Family::Account, Action::Request).add_string("alice"));
        assert_eq!(reply_code(&peer.packets()), Some(ACCOUNT_DENIED));
        assert!(h.game.sessions.get(1).is_none());
    }

    #[test]
    fn test_create_hashes_off_thread() {
        let mut h = Harness::new(config());
        let mut peer = handshake(&mut h, 1);

        assert_eq!(h.send(1, create_packet("alice", "secret1")), Dispatch::Handled);
        assert_eq!(h.game.sessions.get(1).unwrap().pending(), Some("account create"));
        assert!(h.pump_until(|g| g.store.account("alice").is_some()));

        assert_eq!(reply_code(&peer.packets()), Some(ACCOUNT_CREATED));
        let record = h.game.store.account("alice").unwrap();
        assert!(bcrypt::verify("secret1", &record.password_hash).unwrap());
        assert_eq!(record.email, "a@b.c");
        assert!(h.game.sessions.get(1).unwrap().pending().is_none());

        // Taken now.
        h.advance(Duration::from_secs(2));
        h.send(1, create_packet("ALICE", "secret2"));
        assert_eq!(reply_code(&peer.packets()), Some(ACCOUNT_EXISTS));
    }

    #[test]
    fn test_create_rejects_bad_lengths() {
        let mut h = Harness::new(config());
        let mut peer = handshake(&mut h, 1);

        assert_eq!(h.send(1, create_packet("al", "secret1")), Dispatch::Failed);
        h.advance(Duration::from_secs(2));
        assert_eq!(h.send(1, create_packet("alice", "abc")), Dispatch::Failed);
        assert!(peer.packets().is_empty());
    }

    #[test]
    fn test_password_change() {
        let mut h = Harness::new(config());
        let mut peer = h.logged_in(1, "alice", "secret1");

        let change = |user: &str, old: &str, new: &str| {
            PacketBuilder::new(Family::Account, Action::Agree)
                .add_break_string(user)
                .add_break_string(old)
                .add_break_string(new)
        };

        // Someone else's account.
        h.send(1, change("bob", "secret1", "secret2"));
        assert_eq!(reply_code(&peer.packets()), Some(ACCOUNT_CHANGE_FAILED));

        h.advance(Duration::from_secs(2));
        h.send(1, change("alice", "wrongpw", "secret2"));
        assert!(h.pump_until(|g| g.sessions.get(1).unwrap().pending().is_none()));
        assert_eq!(reply_code(&peer.packets()), Some(ACCOUNT_CHANGE_FAILED));

        h.advance(Duration::from_secs(2));
        h.send(1, change("alice", "secret1", "secret2"));
        assert!(h.pump_until(|g| g.sessions.get(1).unwrap().pending().is_none()));
        assert_eq!(reply_code(&peer.packets()), Some(ACCOUNT_CHANGED));
        let hash = &h.game.store.account("alice").unwrap().password_hash;
        assert!(bcrypt::verify("secret2", hash).unwrap());
    }
}
