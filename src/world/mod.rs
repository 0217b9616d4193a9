//! World state: the arena of online characters, parties and trades.
//!
//! Everything here is owned by the game thread. Entities refer to each other
//! by id, never by reference. The relationship fields (party membership,
//! open trade, pending requests) are private to this module tree so only the
//! trade and party code can change them, which keeps both directions of each
//! link in step.

pub mod party;
pub mod trade;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::Point;
use crate::network::{ClientLink, ConnectionId, PacketBuilder};
use crate::persistence::CharacterRecord;
use crate::timer::Timestamp;

pub use party::{LeaveOutcome, Parties, Party, PartyError, PartyRequestKind, ShareMode};
pub use trade::{AgreeOutcome, TradeError, TradeReceipt, TradeSession, TradeSide, Trades};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacterId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartyId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TradeId(pub u32);

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "party#{}", self.0)
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trade#{}", self.0)
    }
}

pub type ItemId = u16;

/// Staff tier, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum AdminLevel {
    #[default]
    Player = 0,
    Guide = 1,
    Guardian = 2,
    GameMaster = 3,
    HighGameMaster = 4,
}

impl AdminLevel {
    pub fn tier(self) -> u8 {
        self as u8
    }
}

/// Per-character interaction bans (jail, frozen, spectating staff).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NoInteract(u8);

impl NoInteract {
    pub const NONE: NoInteract = NoInteract(0);
    pub const ITEMS: NoInteract = NoInteract(0x01);
    pub const COMBAT: NoInteract = NoInteract(0x02);
    pub const PARTY: NoInteract = NoInteract(0x04);

    pub fn contains(self, other: NoInteract) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: NoInteract) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: NoInteract) {
        self.0 &= !other.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemStack {
    pub id: ItemId,
    pub amount: u32,
}

impl ItemStack {
    pub fn new(id: ItemId, amount: u32) -> Self {
        Self { id, amount }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ItemSpecial {
    #[default]
    Normal,
    /// Bound to its owner; never tradeable
    Lore,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemInfo {
    pub name: String,
    #[serde(default)]
    pub special: ItemSpecial,
}

/// Item id -> amount held.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    items: BTreeMap<ItemId, u32>,
}

impl Inventory {
    pub fn from_stacks(stacks: &[ItemStack]) -> Self {
        let mut inventory = Self::default();
        for stack in stacks {
            inventory.add(stack.id, stack.amount);
        }
        inventory
    }

    pub fn to_stacks(&self) -> Vec<ItemStack> {
        self.items
            .iter()
            .map(|(&id, &amount)| ItemStack { id, amount })
            .collect()
    }

    pub fn amount(&self, id: ItemId) -> u32 {
        self.items.get(&id).copied().unwrap_or(0)
    }

    pub fn add(&mut self, id: ItemId, amount: u32) {
        if amount == 0 {
            return;
        }
        let held = self.items.entry(id).or_insert(0);
        *held = held.saturating_add(amount);
    }

    /// Take `amount` of `id`. Nothing changes when not enough is held.
    pub fn remove(&mut self, id: ItemId, amount: u32) -> bool {
        let held = self.amount(id);
        if held < amount {
            return false;
        }
        if held == amount {
            self.items.remove(&id);
        } else {
            self.items.insert(id, held - amount);
        }
        true
    }

    /// Whether every stack (summed per item) is covered.
    pub fn holds(&self, stacks: &[ItemStack]) -> bool {
        let mut wanted: BTreeMap<ItemId, u64> = BTreeMap::new();
        for stack in stacks {
            *wanted.entry(stack.id).or_insert(0) += u64::from(stack.amount);
        }
        wanted
            .into_iter()
            .all(|(id, amount)| u64::from(self.amount(id)) >= amount)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpBoost {
    pub multiplier: f64,
    pub expires: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Progression {
    pub level: u8,
    pub exp: u64,
    /// Subscription tier, indexes `exp.tier_multipliers`
    pub tier: u8,
    pub boost: Option<ExpBoost>,
}

impl Progression {
    /// Active boost multiplier, 1.0 when none is running.
    pub fn boost_multiplier(&self, now: Timestamp) -> f64 {
        match self.boost {
            Some(boost) if boost.expires > now && boost.multiplier > 0.0 => boost.multiplier,
            _ => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vitals {
    pub hp: u16,
    pub max_hp: u16,
}

impl Vitals {
    pub fn percent(&self) -> u8 {
        if self.max_hp == 0 {
            return 0;
        }
        let pct = u32::from(self.hp) * 100 / u32::from(self.max_hp);
        pct.min(100) as u8
    }
}

impl Default for Vitals {
    fn default() -> Self {
        Self { hp: 10, max_hp: 10 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Appearance {
    pub gender: u8,
    pub hair_style: u8,
    pub hair_color: u8,
    pub skin: u8,
}

/// Links to other entities. Only `world` code touches these.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Relations {
    party: Option<PartyId>,
    trade: Option<TradeId>,
    /// Outgoing trade request (this character asked `target`)
    trade_request: Option<CharacterId>,
    /// Outgoing party request
    party_request: Option<(CharacterId, PartyRequestKind)>,
}

#[derive(Debug, Clone)]
pub struct Character {
    id: CharacterId,
    name: String,
    account: String,
    pub title: String,
    pub admin: AdminLevel,
    pub appearance: Appearance,
    pub position: Point,
    pub vitals: Vitals,
    pub inventory: Inventory,
    pub progression: Progression,
    pub no_interact: NoInteract,
    link: Option<ClientLink>,
    relations: Relations,
}

impl Character {
    pub fn new(id: CharacterId, name: &str, account: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            account: account.to_string(),
            title: String::new(),
            admin: AdminLevel::Player,
            appearance: Appearance::default(),
            position: Point::default(),
            vitals: Vitals::default(),
            inventory: Inventory::default(),
            progression: Progression {
                level: 1,
                ..Progression::default()
            },
            no_interact: NoInteract::NONE,
            link: None,
            relations: Relations::default(),
        }
    }

    pub fn from_record(record: &CharacterRecord) -> Self {
        let mut character = Self::new(CharacterId(record.id), &record.name, &record.account);
        character.title = record.title.clone();
        character.admin = record.admin;
        character.appearance = record.appearance;
        character.position = record.position;
        character.vitals = Vitals {
            hp: record.hp.min(record.max_hp),
            max_hp: record.max_hp,
        };
        character.inventory = Inventory::from_stacks(&record.inventory);
        character.progression.level = record.level;
        character.progression.exp = record.exp;
        character.progression.tier = record.tier;
        character
    }

    pub fn to_record(&self) -> CharacterRecord {
        CharacterRecord {
            id: self.id.0,
            account: self.account.clone(),
            name: self.name.clone(),
            title: self.title.clone(),
            admin: self.admin,
            appearance: self.appearance,
            position: self.position,
            level: self.progression.level,
            exp: self.progression.exp,
            tier: self.progression.tier,
            hp: self.vitals.hp,
            max_hp: self.vitals.max_hp,
            inventory: self.inventory.to_stacks(),
        }
    }

    pub fn id(&self) -> CharacterId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn map(&self) -> u16 {
        self.position.m
    }

    pub fn link(&self) -> Option<&ClientLink> {
        self.link.as_ref()
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.link.as_ref().map(ClientLink::id)
    }

    /// Online and attached to a live connection.
    pub fn is_reachable(&self) -> bool {
        self.link.as_ref().is_some_and(|l| !l.is_closed())
    }

    pub fn send(&self, packet: &PacketBuilder) -> bool {
        self.link.as_ref().is_some_and(|l| l.send(packet))
    }

    pub fn party(&self) -> Option<PartyId> {
        self.relations.party
    }

    pub fn trade(&self) -> Option<TradeId> {
        self.relations.trade
    }

    pub fn is_trading(&self) -> bool {
        self.relations.trade.is_some()
    }

    pub fn trade_request(&self) -> Option<CharacterId> {
        self.relations.trade_request
    }

    pub fn party_request(&self) -> Option<(CharacterId, PartyRequestKind)> {
        self.relations.party_request
    }

    pub fn can_interact_items(&self) -> bool {
        !self.no_interact.contains(NoInteract::ITEMS)
    }

    pub fn can_interact_combat(&self) -> bool {
        !self.no_interact.contains(NoInteract::COMBAT)
    }

    pub fn can_interact_party(&self) -> bool {
        !self.no_interact.contains(NoInteract::PARTY)
    }
}

/// Re-evaluates quest/achievement rules after a character's items change.
pub trait RuleHook {
    fn inventory_changed(&mut self, character: &Character);
}

/// Rule hook that does nothing.
#[derive(Debug, Default)]
pub struct NoRules;

impl RuleHook for NoRules {
    fn inventory_changed(&mut self, _character: &Character) {}
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WorldError {
    #[error("character {0} is already in the world")]
    AlreadyOnline(CharacterId),

    #[error("character {0} is not in the world")]
    NotOnline(CharacterId),
}

pub struct World {
    characters: HashMap<CharacterId, Character>,
    by_connection: HashMap<ConnectionId, CharacterId>,
    by_name: HashMap<String, CharacterId>,
    parties: Parties,
    trades: Trades,
    items: HashMap<ItemId, ItemInfo>,
    rules: Box<dyn RuleHook>,
    dirty: BTreeSet<CharacterId>,
}

impl World {
    pub fn new() -> Self {
        Self::with_rules(Box::new(NoRules))
    }

    pub fn with_rules(rules: Box<dyn RuleHook>) -> Self {
        Self {
            characters: HashMap::new(),
            by_connection: HashMap::new(),
            by_name: HashMap::new(),
            parties: Parties::default(),
            trades: Trades::default(),
            items: HashMap::new(),
            rules,
            dirty: BTreeSet::new(),
        }
    }

    // ============================================
    // Content
    // ============================================

    pub fn set_item(&mut self, id: ItemId, info: ItemInfo) {
        self.items.insert(id, info);
    }

    /// Flag exactly the listed items as lore. Items flagged earlier but no
    /// longer listed go back to normal, so a rehash can lift a flag.
    pub fn set_lore_items(&mut self, ids: &[ItemId]) {
        for (id, info) in self.items.iter_mut() {
            if !ids.contains(id) {
                info.special = ItemSpecial::Normal;
            }
        }
        for id in ids {
            self.items.entry(*id).or_default().special = ItemSpecial::Lore;
        }
    }

    /// Unknown items count as ordinary tradeable items.
    pub fn is_tradeable(&self, id: ItemId) -> bool {
        self.items
            .get(&id)
            .is_none_or(|info| info.special != ItemSpecial::Lore)
    }

    pub fn item_name(&self, id: ItemId) -> &str {
        self.items.get(&id).map(|i| i.name.as_str()).unwrap_or("")
    }

    // ============================================
    // Lookup
    // ============================================

    pub fn character(&self, id: CharacterId) -> Option<&Character> {
        self.characters.get(&id)
    }

    pub fn character_mut(&mut self, id: CharacterId) -> Option<&mut Character> {
        self.characters.get_mut(&id)
    }

    pub fn character_by_connection(&self, conn: ConnectionId) -> Option<&Character> {
        self.by_connection
            .get(&conn)
            .and_then(|id| self.characters.get(id))
    }

    pub fn character_by_name(&self, name: &str) -> Option<&Character> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .and_then(|id| self.characters.get(id))
    }

    pub fn characters(&self) -> impl Iterator<Item = &Character> {
        self.characters.values()
    }

    pub fn parties(&self) -> impl Iterator<Item = &Party> {
        self.parties.iter()
    }

    pub fn party(&self, id: PartyId) -> Option<&Party> {
        self.parties.get(id)
    }

    pub fn trade_session(&self, id: TradeId) -> Option<&TradeSession> {
        self.trades.get(id)
    }

    pub fn len(&self) -> usize {
        self.characters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    pub fn send_to(&self, id: CharacterId, packet: &PacketBuilder) -> bool {
        self.characters.get(&id).is_some_and(|c| c.send(packet))
    }

    /// Two distinct characters, mutably.
    fn pair_mut(&mut self, a: CharacterId, b: CharacterId) -> Option<(&mut Character, &mut Character)> {
        if a == b {
            return None;
        }
        match self.characters.get_disjoint_mut([&a, &b]) {
            [Some(x), Some(y)] => Some((x, y)),
            _ => None,
        }
    }

    // ============================================
    // Presence
    // ============================================

    /// Put a loaded character into the world, attached to `link` if given.
    pub fn enter(&mut self, mut character: Character, link: Option<ClientLink>) -> Result<CharacterId, WorldError> {
        let id = character.id;
        if self.characters.contains_key(&id) {
            return Err(WorldError::AlreadyOnline(id));
        }
        if let Some(link) = &link {
            self.by_connection.insert(link.id(), id);
        }
        character.link = link;
        character.relations = Relations::default();
        self.by_name.insert(character.name.to_ascii_lowercase(), id);
        tracing::info!("[world] {} ({}) entered", character.name, id);
        self.characters.insert(id, character);
        Ok(id)
    }

    /// Re-attach a lingering character to a new connection.
    pub fn attach(&mut self, id: CharacterId, link: ClientLink) -> Result<(), WorldError> {
        let character = self.characters.get_mut(&id).ok_or(WorldError::NotOnline(id))?;
        if let Some(old) = character.link.take() {
            self.by_connection.remove(&old.id());
        }
        self.by_connection.insert(link.id(), id);
        character.link = Some(link);
        tracing::debug!("[world] {} re-attached", id);
        Ok(())
    }

    /// Cut a character off from its connection and unwind its trade and party.
    ///
    /// The character stays in the world (unreachable) until `remove`.
    pub fn detach(&mut self, id: CharacterId) {
        if !self.characters.contains_key(&id) {
            return;
        }

        if let Err(e) = self.trade_close(id) {
            tracing::trace!("[world] detach {}: {}", id, e);
        }
        if self.characters.get(&id).is_some_and(|c| c.party().is_some()) {
            if let Err(e) = self.party_leave(id) {
                tracing::debug!("[world] detach {} party: {}", id, e);
            }
        }

        // Requests to or from this character are stale now.
        for other in self.characters.values_mut() {
            if other.relations.trade_request == Some(id) {
                other.relations.trade_request = None;
            }
            if other.relations.party_request.is_some_and(|(target, _)| target == id) {
                other.relations.party_request = None;
            }
        }

        if let Some(character) = self.characters.get_mut(&id) {
            character.relations.trade_request = None;
            character.relations.party_request = None;
            if let Some(link) = character.link.take() {
                self.by_connection.remove(&link.id());
            }
            tracing::debug!("[world] {} detached", character.name);
        }
    }

    /// Detach and drop a character. Returns it for saving.
    pub fn remove(&mut self, id: CharacterId) -> Option<Character> {
        self.detach(id);
        let character = self.characters.remove(&id)?;
        self.by_name.remove(&character.name.to_ascii_lowercase());
        self.dirty.remove(&id);
        tracing::info!("[world] {} ({}) left", character.name, id);
        Some(character)
    }

    // ============================================
    // Change tracking
    // ============================================

    pub fn mark_dirty(&mut self, id: CharacterId) {
        if self.characters.contains_key(&id) {
            self.dirty.insert(id);
        }
    }

    pub fn is_dirty(&self, id: CharacterId) -> bool {
        self.dirty.contains(&id)
    }

    /// Drain the set of characters changed since the last call.
    pub fn take_dirty(&mut self) -> Vec<CharacterId> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    /// Run the rule hook and mark for saving after an inventory change.
    fn inventory_changed(&mut self, id: CharacterId) {
        if let Some(character) = self.characters.get(&id) {
            self.rules.inventory_changed(character);
            self.dirty.insert(id);
        }
    }

    // ============================================
    // Consistency
    // ============================================

    /// Verify every two-way link. Used by tests after each operation.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (conn, id) in &self.by_connection {
            let Some(character) = self.characters.get(id) else {
                return Err(format!("connection {} maps to missing {}", conn, id));
            };
            if character.connection() != Some(*conn) {
                return Err(format!("connection {} not held by {}", conn, id));
            }
        }

        for character in self.characters.values() {
            if let Some(pid) = character.relations.party {
                let party = self
                    .parties
                    .get(pid)
                    .ok_or_else(|| format!("{} points at missing {}", character.id, pid))?;
                if !party.members().contains(&character.id) {
                    return Err(format!("{} not listed in {}", character.id, pid));
                }
            }
            if let Some(tid) = character.relations.trade {
                let session = self
                    .trades
                    .get(tid)
                    .ok_or_else(|| format!("{} points at missing {}", character.id, tid))?;
                if session.side(character.id).is_none() {
                    return Err(format!("{} not a side of {}", character.id, tid));
                }
            }
        }

        for party in self.parties.iter() {
            if party.members().len() < 2 {
                return Err(format!("{} has {} members", party.id(), party.members().len()));
            }
            if !party.members().contains(&party.leader()) {
                return Err(format!("{} leader is not a member", party.id()));
            }
            let unique: BTreeSet<_> = party.members().iter().collect();
            if unique.len() != party.members().len() {
                return Err(format!("{} lists a member twice", party.id()));
            }
            for member in party.members() {
                let back = self.characters.get(member).and_then(|c| c.relations.party);
                if back != Some(party.id()) {
                    return Err(format!("{} member {} does not point back", party.id(), member));
                }
            }
        }

        for session in self.trades.iter() {
            let [a, b] = session.characters();
            if a == b {
                return Err(format!("{} trades with itself", session.id()));
            }
            for who in [a, b] {
                let back = self.characters.get(&who).and_then(|c| c.relations.trade);
                if back != Some(session.id()) {
                    return Err(format!("{} side {} does not point back", session.id(), who));
                }
            }
        }

        Ok(())
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::join;
    use super::*;

    #[test]
    fn test_inventory_add_remove() {
        let mut inv = Inventory::default();
        inv.add(1, 10);
        inv.add(1, 5);
        inv.add(2, 0);
        assert_eq!(inv.amount(1), 15);
        assert_eq!(inv.len(), 1);

        assert!(!inv.remove(1, 16));
        assert_eq!(inv.amount(1), 15);
        assert!(inv.remove(1, 15));
        assert!(inv.is_empty());
    }

    #[test]
    fn test_inventory_holds_sums_duplicates() {
        let inv = Inventory::from_stacks(&[ItemStack::new(1, 10)]);
        assert!(inv.holds(&[ItemStack::new(1, 6), ItemStack::new(1, 4)]));
        assert!(!inv.holds(&[ItemStack::new(1, 6), ItemStack::new(1, 5)]));
        assert!(!inv.holds(&[ItemStack::new(2, 1)]));
        assert!(inv.holds(&[]));
    }

    #[test]
    fn test_vitals_percent() {
        assert_eq!(Vitals { hp: 5, max_hp: 10 }.percent(), 50);
        assert_eq!(Vitals { hp: 0, max_hp: 0 }.percent(), 0);
        assert_eq!(Vitals { hp: 30, max_hp: 10 }.percent(), 100);
    }

    #[test]
    fn test_boost_multiplier_expires() {
        let mut progression = Progression::default();
        assert_eq!(progression.boost_multiplier(Timestamp::ZERO), 1.0);

        progression.boost = Some(ExpBoost {
            multiplier: 2.0,
            expires: Timestamp::from_secs(60),
        });
        assert_eq!(progression.boost_multiplier(Timestamp::from_secs(59)), 2.0);
        assert_eq!(progression.boost_multiplier(Timestamp::from_secs(60)), 1.0);
    }

    #[test]
    fn test_no_interact_flags() {
        let mut flags = NoInteract::NONE;
        flags.insert(NoInteract::ITEMS);
        flags.insert(NoInteract::COMBAT);
        assert!(flags.contains(NoInteract::ITEMS));
        flags.remove(NoInteract::ITEMS);
        assert!(!flags.contains(NoInteract::ITEMS));
        assert!(flags.contains(NoInteract::COMBAT));
    }

    #[test]
    fn test_enter_and_lookup() {
        let mut world = World::new();
        let _alice = join(&mut world, 1, "Alice");

        assert_eq!(world.character_by_name("alice").map(Character::id), Some(CharacterId(1)));
        assert_eq!(world.character_by_connection(1).map(Character::id), Some(CharacterId(1)));
        assert!(world.character(CharacterId(1)).is_some_and(Character::is_reachable));

        let again = Character::new(CharacterId(1), "Alice", "alice");
        assert_eq!(world.enter(again, None), Err(WorldError::AlreadyOnline(CharacterId(1))));
        world.check_invariants().unwrap();
    }

    #[test]
    fn test_detach_leaves_character_unreachable() {
        let mut world = World::new();
        let _alice = join(&mut world, 1, "Alice");

        world.detach(CharacterId(1));
        let alice = world.character(CharacterId(1)).unwrap();
        assert!(!alice.is_reachable());
        assert!(world.character_by_connection(1).is_none());
        world.check_invariants().unwrap();

        let (link, _rx) = ClientLink::channel(42);
        world.attach(CharacterId(1), link).unwrap();
        assert_eq!(world.character_by_connection(42).map(Character::id), Some(CharacterId(1)));
        world.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_clears_indexes() {
        let mut world = World::new();
        let _alice = join(&mut world, 1, "Alice");
        world.mark_dirty(CharacterId(1));

        let gone = world.remove(CharacterId(1)).unwrap();
        assert_eq!(gone.name(), "Alice");
        assert!(world.character_by_name("Alice").is_none());
        assert!(world.take_dirty().is_empty());
        assert!(world.remove(CharacterId(1)).is_none());
    }

    #[test]
    fn test_record_round_trip_keeps_inventory() {
        let mut character = Character::new(CharacterId(9), "Zed", "zed");
        character.inventory.add(4, 20);
        character.progression.level = 12;
        character.admin = AdminLevel::Guide;

        let restored = Character::from_record(&character.to_record());
        assert_eq!(restored.inventory, character.inventory);
        assert_eq!(restored.progression.level, 12);
        assert_eq!(restored.admin, AdminLevel::Guide);
    }

    #[test]
    fn test_lore_items_not_tradeable() {
        let mut world = World::new();
        world.set_item(
            5,
            ItemInfo {
                name: "Heirloom".to_string(),
                special: ItemSpecial::Lore,
            },
        );
        assert!(!world.is_tradeable(5));
        assert!(world.is_tradeable(6));
        assert_eq!(world.item_name(5), "Heirloom");
    }

    #[test]
    fn test_set_lore_items_replaces_flags() {
        let mut world = World::new();
        world.set_lore_items(&[5, 7]);
        assert!(!world.is_tradeable(5));
        assert!(!world.is_tradeable(7));

        world.set_lore_items(&[7]);
        assert!(world.is_tradeable(5));
        assert!(!world.is_tradeable(7));

        world.set_lore_items(&[]);
        assert!(world.is_tradeable(7));
    }
}
