//! Party rosters.
//!
//! A party has a fixed leader and at least two members. There is no
//! succession: when the leader leaves, or when a departure would leave a
//! single member, the whole party is dissolved.

use std::collections::HashMap;

use super::{Character, CharacterId, PartyId, World};
use crate::config::ExpConfig;
use crate::network::{Action, Family, PacketBuilder};
use crate::timer::Timestamp;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PartyError {
    #[error("cannot party with yourself")]
    SelfRequest,

    #[error("character {0} is not online")]
    NotFound(CharacterId),

    #[error("character {0} cannot join parties")]
    CannotInteract(CharacterId),

    #[error("character {0} is already in a party")]
    AlreadyInParty(CharacterId),

    #[error("no party request from {0}")]
    NoRequest(CharacterId),

    #[error("character {0} is not in a party")]
    NotInParty(CharacterId),

    #[error("character {0} does not lead the party")]
    NotLeader(CharacterId),

    #[error("character {0} is not a member of {1}")]
    NotMember(CharacterId, PartyId),

    #[error("{0} does not exist")]
    NoSuchParty(PartyId),
}

/// How shared experience is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShareMode {
    Equal = 1,
    LevelWeighted = 2,
}

impl ShareMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ShareMode::Equal),
            2 => Some(ShareMode::LevelWeighted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PartyRequestKind {
    /// Requester asks to join the target's party
    Join = 0,
    /// Requester invites the target into theirs
    Invite = 1,
}

impl PartyRequestKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PartyRequestKind::Join),
            1 => Some(PartyRequestKind::Invite),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    Removed,
    /// The party is gone; these were its members
    Dissolved(Vec<CharacterId>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    id: PartyId,
    leader: CharacterId,
    members: Vec<CharacterId>,
}

impl Party {
    pub fn id(&self) -> PartyId {
        self.id
    }

    pub fn leader(&self) -> CharacterId {
        self.leader
    }

    /// Members in join order, leader first.
    pub fn members(&self) -> &[CharacterId] {
        &self.members
    }

    pub fn contains(&self, who: CharacterId) -> bool {
        self.members.contains(&who)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Parties {
    parties: HashMap<PartyId, Party>,
    next_id: u32,
}

impl Parties {
    fn create(&mut self, leader: CharacterId, member: CharacterId) -> PartyId {
        self.next_id = self.next_id.wrapping_add(1);
        let id = PartyId(self.next_id);
        self.parties.insert(
            id,
            Party {
                id,
                leader,
                members: vec![leader, member],
            },
        );
        id
    }

    pub fn get(&self, id: PartyId) -> Option<&Party> {
        self.parties.get(&id)
    }

    fn get_mut(&mut self, id: PartyId) -> Option<&mut Party> {
        self.parties.get_mut(&id)
    }

    fn remove(&mut self, id: PartyId) -> Option<Party> {
        self.parties.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Party> {
        self.parties.values()
    }

    pub fn len(&self) -> usize {
        self.parties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
    }
}

/// id, leader flag, level, hp%, name
fn add_member(builder: PacketBuilder, party: &Party, character: &Character) -> PacketBuilder {
    builder
        .add_u32(character.id().0)
        .add_u8(u8::from(party.leader == character.id()))
        .add_u8(character.progression.level)
        .add_u8(character.vitals.percent())
        .add_break_string(character.name())
}

impl World {
    fn roster(&self, party: &Party, action: Action) -> PacketBuilder {
        party
            .members
            .iter()
            .filter_map(|id| self.character(*id))
            .fold(PacketBuilder::new(Family::Party, action), |builder, c| {
                add_member(builder, party, c)
            })
    }

    fn party_broadcast(&self, party: &Party, packet: &PacketBuilder, except: Option<CharacterId>) {
        for member in &party.members {
            if Some(*member) != except {
                self.send_to(*member, packet);
            }
        }
    }

    fn party_of(&self, who: CharacterId) -> Result<&Party, PartyError> {
        let character = self.character(who).ok_or(PartyError::NotFound(who))?;
        let pid = character.party().ok_or(PartyError::NotInParty(who))?;
        self.parties.get(pid).ok_or(PartyError::NoSuchParty(pid))
    }

    /// Record that `from` wants to party with `to`, and ask `to`.
    pub fn party_request(
        &mut self,
        from: CharacterId,
        to: CharacterId,
        kind: PartyRequestKind,
    ) -> Result<(), PartyError> {
        if from == to {
            return Err(PartyError::SelfRequest);
        }
        let requester = self.character(from).ok_or(PartyError::NotFound(from))?;
        let target = self
            .character(to)
            .filter(|c| c.is_reachable())
            .ok_or(PartyError::NotFound(to))?;

        for c in [requester, target] {
            if !c.can_interact_party() {
                return Err(PartyError::CannotInteract(c.id()));
            }
        }
        match kind {
            PartyRequestKind::Join if requester.party().is_some() => {
                return Err(PartyError::AlreadyInParty(from));
            }
            PartyRequestKind::Invite if target.party().is_some() => {
                return Err(PartyError::AlreadyInParty(to));
            }
            _ => {}
        }

        let packet = PacketBuilder::new(Family::Party, Action::Request)
            .add_u8(kind.as_u8())
            .add_u32(from.0)
            .add_string(requester.name());
        target.send(&packet);

        if let Some(requester) = self.character_mut(from) {
            requester.relations.party_request = Some((to, kind));
        }
        tracing::debug!("[party] [request] {} -> {} ({:?})", from, to, kind);
        Ok(())
    }

    /// `acceptor` answers the request `requester` made earlier.
    pub fn party_accept(
        &mut self,
        acceptor: CharacterId,
        requester: CharacterId,
        kind: PartyRequestKind,
    ) -> Result<PartyId, PartyError> {
        let pending = self
            .character(requester)
            .and_then(Character::party_request);
        if pending != Some((acceptor, kind)) {
            return Err(PartyError::NoRequest(requester));
        }
        if let Some(c) = self.character_mut(requester) {
            c.relations.party_request = None;
        }

        // Whoever is being asked to come along joins the other's party.
        let (host, guest) = match kind {
            PartyRequestKind::Join => (acceptor, requester),
            PartyRequestKind::Invite => (requester, acceptor),
        };
        match self.character(host).and_then(Character::party) {
            Some(pid) => {
                self.party_join(pid, guest)?;
                Ok(pid)
            }
            None => self.party_create(host, guest),
        }
    }

    /// New party led by `leader` with `member` as its second member.
    pub fn party_create(&mut self, leader: CharacterId, member: CharacterId) -> Result<PartyId, PartyError> {
        if leader == member {
            return Err(PartyError::SelfRequest);
        }
        for who in [leader, member] {
            let c = self.character(who).ok_or(PartyError::NotFound(who))?;
            if c.party().is_some() {
                return Err(PartyError::AlreadyInParty(who));
            }
        }

        let pid = self.parties.create(leader, member);
        for who in [leader, member] {
            if let Some(c) = self.character_mut(who) {
                c.relations.party = Some(pid);
            }
        }

        if let Some(party) = self.parties.get(pid) {
            let roster = self.roster(party, Action::Create);
            self.party_broadcast(party, &roster, None);
        }
        tracing::info!("[party] [create] {} led by {}", pid, leader);
        Ok(pid)
    }

    /// Add `who` to an existing party.
    pub fn party_join(&mut self, pid: PartyId, who: CharacterId) -> Result<(), PartyError> {
        let character = self.character(who).ok_or(PartyError::NotFound(who))?;
        if character.party().is_some() {
            return Err(PartyError::AlreadyInParty(who));
        }
        let party = self.parties.get_mut(pid).ok_or(PartyError::NoSuchParty(pid))?;
        party.members.push(who);
        if let Some(c) = self.character_mut(who) {
            c.relations.party = Some(pid);
        }

        if let (Some(party), Some(character)) = (self.parties.get(pid), self.character(who)) {
            let delta = add_member(PacketBuilder::new(Family::Party, Action::Add), party, character);
            self.party_broadcast(party, &delta, Some(who));
            let roster = self.roster(party, Action::Create);
            self.send_to(who, &roster);
        }
        tracing::debug!("[party] [join] {} joined {}", who, pid);
        Ok(())
    }

    /// Take `who` out of their party, dissolving it when needed.
    pub fn party_leave(&mut self, who: CharacterId) -> Result<LeaveOutcome, PartyError> {
        let party = self.party_of(who)?;
        let pid = party.id;

        if party.len() > 2 && party.leader != who {
            let party = self.parties.get_mut(pid).ok_or(PartyError::NoSuchParty(pid))?;
            party.members.retain(|m| *m != who);
            if let Some(c) = self.character_mut(who) {
                c.relations.party = None;
            }

            if let Some(party) = self.parties.get(pid) {
                let removal = PacketBuilder::new(Family::Party, Action::Remove).add_u32(who.0);
                self.party_broadcast(party, &removal, None);
            }
            self.send_to(who, &PacketBuilder::new(Family::Party, Action::Close).add_u8(255));
            tracing::debug!("[party] [leave] {} left {}", who, pid);
            return Ok(LeaveOutcome::Removed);
        }

        Ok(LeaveOutcome::Dissolved(self.party_dissolve(pid)))
    }

    /// Leader removes `target` from the party.
    pub fn party_kick(&mut self, leader: CharacterId, target: CharacterId) -> Result<LeaveOutcome, PartyError> {
        let party = self.party_of(leader)?;
        if party.leader != leader {
            return Err(PartyError::NotLeader(leader));
        }
        if !party.contains(target) {
            return Err(PartyError::NotMember(target, party.id));
        }
        self.party_leave(target)
    }

    /// Destroy a party. Every member loses the back-reference and is told.
    pub fn party_dissolve(&mut self, pid: PartyId) -> Vec<CharacterId> {
        let Some(party) = self.parties.remove(pid) else {
            return Vec::new();
        };
        let close = PacketBuilder::new(Family::Party, Action::Close).add_u8(255);
        for member in &party.members {
            if let Some(c) = self.character_mut(*member) {
                c.relations.party = None;
                c.send(&close);
            }
        }
        tracing::info!("[party] [dissolve] {} ({} members)", pid, party.len());
        party.members
    }

    /// Re-send the full roster to `who`.
    pub fn party_refresh(&self, who: CharacterId) -> Result<(), PartyError> {
        let party = self.party_of(who)?;
        self.send_to(who, &self.roster(party, Action::List));
        Ok(())
    }

    /// Party chat to every other member.
    pub fn party_message(&self, who: CharacterId, message: &str) -> Result<usize, PartyError> {
        let party = self.party_of(who)?;
        let packet = PacketBuilder::new(Family::Talk, Action::Open)
            .add_u32(who.0)
            .add_string(message);
        let delivered = party
            .members
            .iter()
            .filter(|m| **m != who && self.send_to(**m, &packet))
            .count();
        Ok(delivered)
    }

    /// Tell the party `who`'s current HP percentage.
    pub fn party_update_hp(&self, who: CharacterId) -> Result<(), PartyError> {
        let party = self.party_of(who)?;
        let percent = self.character(who).map_or(0, |c| c.vitals.percent());
        let packet = PacketBuilder::new(Family::Party, Action::Agree)
            .add_u32(who.0)
            .add_u8(percent);
        self.party_broadcast(party, &packet, None);
        Ok(())
    }

    /// Split `amount` experience among members on `map` and apply it.
    ///
    /// Returns each recipient with the experience actually granted.
    pub fn share_exp(
        &mut self,
        pid: PartyId,
        amount: u64,
        mode: ShareMode,
        map: u16,
        config: &ExpConfig,
        now: Timestamp,
    ) -> Vec<(CharacterId, u64)> {
        let Some(party) = self.parties.get(pid) else {
            return Vec::new();
        };

        let eligible: Vec<(CharacterId, u64)> = party
            .members
            .iter()
            .filter_map(|id| self.character(*id))
            .filter(|c| c.map() == map && c.is_reachable() && c.can_interact_combat())
            .map(|c| (c.id(), u64::from(c.progression.level.max(1))))
            .collect();

        let count = eligible.len() as u64;
        let weight: u64 = eligible.iter().map(|(_, w)| w).sum();
        if amount == 0 || count == 0 || weight == 0 {
            return Vec::new();
        }

        let mut granted = Vec::with_capacity(eligible.len());
        for (id, level) in eligible {
            let share = match mode {
                ShareMode::Equal => amount.div_ceil(count),
                ShareMode::LevelWeighted => {
                    let scaled = u128::from(amount) * u128::from(level);
                    u64::try_from(scaled.div_ceil(u128::from(weight))).unwrap_or(u64::MAX)
                }
            };

            let Some(character) = self.character_mut(id) else {
                continue;
            };
            let multiplier = config.tier_multiplier(character.progression.tier)
                * character.progression.boost_multiplier(now);
            let grant = (share as f64 * multiplier).floor();
            let grant = if grant.is_finite() && grant > 0.0 {
                (grant as u64).min(config.max_exp)
            } else {
                0
            };

            let progression = &mut character.progression;
            progression.exp = progression.exp.saturating_add(grant).min(config.max_exp);
            self.mark_dirty(id);
            granted.push((id, grant));
        }

        tracing::trace!("[party] [share] {} amount={} {:?} -> {:?}", pid, amount, mode, granted);
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::testing::{join, Client};
    use crate::world::{ExpBoost, NoInteract};

    const PARTY: u8 = 28;

    fn trio() -> (World, Client, Client, Client, PartyId) {
        let mut world = World::new();
        let mut a = join(&mut world, 1, "Alice");
        let mut b = join(&mut world, 2, "Bob");
        let mut c = join(&mut world, 3, "Cid");
        let pid = world.party_create(a.id, b.id).unwrap();
        world.party_join(pid, c.id).unwrap();
        a.frames();
        b.frames();
        c.frames();
        (world, a, b, c, pid)
    }

    #[test]
    fn test_invite_and_accept_creates_party() {
        let mut world = World::new();
        let mut a = join(&mut world, 1, "Alice");
        let mut b = join(&mut world, 2, "Bob");

        world.party_request(a.id, b.id, PartyRequestKind::Invite).unwrap();
        assert_eq!(b.opcodes(), vec![(PARTY, Action::Request.as_u8())]);

        // Wrong kind or wrong side does not match the pending request.
        assert_eq!(
            world.party_accept(b.id, a.id, PartyRequestKind::Join),
            Err(PartyError::NoRequest(a.id))
        );
        assert_eq!(
            world.party_accept(a.id, b.id, PartyRequestKind::Invite),
            Err(PartyError::NoRequest(b.id))
        );

        let pid = world.party_accept(b.id, a.id, PartyRequestKind::Invite).unwrap();
        let party = world.party(pid).unwrap();
        assert_eq!(party.leader(), a.id);
        assert_eq!(party.members(), &[a.id, b.id]);
        assert!(world.character(a.id).unwrap().party_request().is_none());
        assert_eq!(a.opcodes(), vec![(PARTY, Action::Create.as_u8())]);
        assert_eq!(b.opcodes(), vec![(PARTY, Action::Create.as_u8())]);
        world.check_invariants().unwrap();
    }

    #[test]
    fn test_join_request_enters_existing_party() {
        let (mut world, mut a, mut b, _c, pid) = trio();
        let mut d = join(&mut world, 4, "Dot");

        // Dot asks Bob (not the leader) to join his party.
        world.party_request(d.id, b.id, PartyRequestKind::Join).unwrap();
        assert_eq!(world.party_accept(b.id, d.id, PartyRequestKind::Join), Ok(pid));

        assert_eq!(world.party(pid).unwrap().members().len(), 4);
        assert_eq!(d.opcodes(), vec![(PARTY, Action::Create.as_u8())]);
        assert_eq!(a.opcodes(), vec![(PARTY, Action::Add.as_u8())]);
        assert!(b.opcodes().contains(&(PARTY, Action::Add.as_u8())));
        world.check_invariants().unwrap();
    }

    #[test]
    fn test_request_rejections() {
        let (mut world, a, b, _c, _pid) = trio();
        let d = join(&mut world, 4, "Dot");

        assert_eq!(
            world.party_request(a.id, a.id, PartyRequestKind::Invite),
            Err(PartyError::SelfRequest)
        );
        assert_eq!(
            world.party_request(d.id, b.id, PartyRequestKind::Invite),
            Err(PartyError::AlreadyInParty(b.id))
        );
        assert_eq!(
            world.party_request(a.id, d.id, PartyRequestKind::Join),
            Err(PartyError::AlreadyInParty(a.id))
        );

        world.character_mut(d.id).unwrap().no_interact.insert(NoInteract::PARTY);
        assert_eq!(
            world.party_request(a.id, d.id, PartyRequestKind::Invite),
            Err(PartyError::CannotInteract(d.id))
        );
    }

    #[test]
    fn test_member_leaves_large_party() {
        let (mut world, mut a, mut b, mut c, pid) = trio();

        assert_eq!(world.party_leave(c.id), Ok(LeaveOutcome::Removed));
        assert_eq!(world.party(pid).unwrap().members(), &[a.id, b.id]);
        assert!(world.character(c.id).unwrap().party().is_none());
        assert_eq!(a.opcodes(), vec![(PARTY, Action::Remove.as_u8())]);
        assert_eq!(b.opcodes(), vec![(PARTY, Action::Remove.as_u8())]);
        assert_eq!(c.opcodes(), vec![(PARTY, Action::Close.as_u8())]);
        world.check_invariants().unwrap();
    }

    #[test]
    fn test_leave_from_pair_dissolves() {
        let mut world = World::new();
        let mut a = join(&mut world, 1, "Alice");
        let b = join(&mut world, 2, "Bob");
        let pid = world.party_create(a.id, b.id).unwrap();
        a.frames();

        let outcome = world.party_leave(b.id).unwrap();
        assert_eq!(outcome, LeaveOutcome::Dissolved(vec![a.id, b.id]));
        assert!(world.party(pid).is_none());
        assert!(world.character(a.id).unwrap().party().is_none());
        assert_eq!(a.opcodes(), vec![(PARTY, Action::Close.as_u8())]);
        world.check_invariants().unwrap();
    }

    #[test]
    fn test_leader_leaving_dissolves() {
        let (mut world, mut a, mut b, mut c, pid) = trio();

        assert!(matches!(world.party_leave(a.id), Ok(LeaveOutcome::Dissolved(_))));
        assert!(world.party(pid).is_none());
        assert!(world.parties().next().is_none());
        for client in [&mut a, &mut b, &mut c] {
            assert!(world.character(client.id).unwrap().party().is_none());
            assert_eq!(client.opcodes(), vec![(PARTY, Action::Close.as_u8())]);
        }
        world.check_invariants().unwrap();
    }

    #[test]
    fn test_kick_requires_leader() {
        let (mut world, a, b, c, _pid) = trio();
        let d = join(&mut world, 4, "Dot");

        assert_eq!(world.party_kick(b.id, c.id), Err(PartyError::NotLeader(b.id)));
        assert!(matches!(
            world.party_kick(a.id, d.id),
            Err(PartyError::NotMember(id, _)) if id == d.id
        ));
        assert_eq!(world.party_kick(a.id, c.id), Ok(LeaveOutcome::Removed));
        world.check_invariants().unwrap();
    }

    #[test]
    fn test_disconnect_unwinds_party() {
        let (mut world, a, mut b, _c, pid) = trio();

        // Leader drops: the party cannot survive.
        world.detach(a.id);
        assert!(world.party(pid).is_none());
        assert!(world.character(b.id).unwrap().party().is_none());
        assert!(!world.character(a.id).unwrap().is_reachable());
        assert_eq!(b.opcodes(), vec![(PARTY, Action::Close.as_u8())]);
        world.check_invariants().unwrap();
    }

    #[test]
    fn test_chat_hp_and_refresh() {
        let (mut world, mut a, mut b, mut c, _pid) = trio();

        assert_eq!(world.party_message(a.id, "hello"), Ok(2));
        assert!(a.opcodes().is_empty());
        assert_eq!(b.opcodes(), vec![(18, Action::Open.as_u8())]);
        c.frames();

        world.character_mut(b.id).unwrap().vitals.hp = 5;
        world.party_update_hp(b.id).unwrap();
        let frames = c.frames();
        assert_eq!(frames.len(), 1);
        // family, action, id (4 bytes), percent
        assert_eq!(frames[0][3..], [PARTY, Action::Agree.as_u8(), 0, 0, 0, 2, 50]);

        world.party_refresh(a.id).unwrap();
        assert_eq!(a.opcodes(), vec![(PARTY, Action::List.as_u8())]);

        let loner = join(&mut world, 9, "Loner");
        assert_eq!(world.party_refresh(loner.id), Err(PartyError::NotInParty(loner.id)));
    }

    #[test]
    fn test_share_equal_rounds_up() {
        let (mut world, a, b, c, pid) = trio();
        let cfg = ExpConfig::default();

        let granted = world.share_exp(pid, 100, ShareMode::Equal, 1, &cfg, Timestamp::ZERO);
        assert_eq!(granted.len(), 3);
        assert!(granted.iter().all(|(_, exp)| *exp == 34));
        for id in [a.id, b.id, c.id] {
            assert_eq!(world.character(id).unwrap().progression.exp, 34);
            assert!(world.is_dirty(id));
        }
    }

    #[test]
    fn test_share_level_weighted() {
        let mut world = World::new();
        let a = join(&mut world, 1, "Alice");
        let b = join(&mut world, 2, "Bob");
        world.character_mut(a.id).unwrap().progression.level = 100;
        world.character_mut(b.id).unwrap().progression.level = 200;
        let pid = world.party_create(a.id, b.id).unwrap();

        let mut granted = world.share_exp(
            pid,
            300,
            ShareMode::LevelWeighted,
            1,
            &ExpConfig::default(),
            Timestamp::ZERO,
        );
        granted.sort();
        assert_eq!(granted, vec![(a.id, 100), (b.id, 200)]);

        world.character_mut(a.id).unwrap().progression.level = 10;
        world.character_mut(b.id).unwrap().progression.level = 20;
        let mut granted = world.share_exp(
            pid,
            300,
            ShareMode::LevelWeighted,
            1,
            &ExpConfig::default(),
            Timestamp::ZERO,
        );
        granted.sort();
        assert_eq!(granted, vec![(a.id, 100), (b.id, 200)]);
    }

    #[test]
    fn test_share_level_zero_weighs_as_one() {
        let mut world = World::new();
        let a = join(&mut world, 1, "Alice");
        let b = join(&mut world, 2, "Bob");
        world.character_mut(a.id).unwrap().progression.level = 0;
        world.character_mut(b.id).unwrap().progression.level = 3;
        let pid = world.party_create(a.id, b.id).unwrap();

        // Weights 1 and 3 over 4, each share rounded up.
        let mut granted = world.share_exp(
            pid,
            10,
            ShareMode::LevelWeighted,
            1,
            &ExpConfig::default(),
            Timestamp::ZERO,
        );
        granted.sort();
        assert_eq!(granted, vec![(a.id, 3), (b.id, 8)]);
    }

    #[test]
    fn test_share_skips_ineligible_members() {
        let (mut world, a, b, c, pid) = trio();
        world.character_mut(b.id).unwrap().position.m = 7;
        world.character_mut(c.id).unwrap().no_interact.insert(NoInteract::COMBAT);

        let granted = world.share_exp(pid, 10, ShareMode::Equal, 1, &ExpConfig::default(), Timestamp::ZERO);
        assert_eq!(granted, vec![(a.id, 10)]);

        // Nobody on the map: nothing happens.
        let granted = world.share_exp(pid, 10, ShareMode::Equal, 42, &ExpConfig::default(), Timestamp::ZERO);
        assert!(granted.is_empty());
        assert_eq!(world.character(b.id).unwrap().progression.exp, 0);
    }

    #[test]
    fn test_share_applies_multipliers_and_cap() {
        let mut world = World::new();
        let a = join(&mut world, 1, "Alice");
        let b = join(&mut world, 2, "Bob");
        let pid = world.party_create(a.id, b.id).unwrap();

        world.character_mut(a.id).unwrap().progression.tier = 1;
        world.character_mut(b.id).unwrap().progression.boost = Some(ExpBoost {
            multiplier: 3.0,
            expires: Timestamp::from_secs(10),
        });
        world.character_mut(b.id).unwrap().progression.exp = 990;

        let cfg = ExpConfig {
            max_exp: 1000,
            tier_multipliers: vec![1.0, 1.5],
        };
        let mut granted = world.share_exp(pid, 20, ShareMode::Equal, 1, &cfg, Timestamp::from_secs(1));
        granted.sort();
        assert_eq!(granted, vec![(a.id, 15), (b.id, 30)]);
        assert_eq!(world.character(a.id).unwrap().progression.exp, 15);
        assert_eq!(world.character(b.id).unwrap().progression.exp, 1000);
    }
}
