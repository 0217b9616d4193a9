//! Two-party trade negotiation.
//!
//! `request` records an outgoing request on the requester. `accept` by the
//! target opens a session with empty offers. Every offer change clears both
//! agreement flags. When both sides agree, the offers are checked against
//! current inventories and swapped in one step; if either check fails nothing
//! moves and the trade is closed.

use std::collections::HashMap;

use super::{Character, CharacterId, ItemId, ItemStack, TradeId, World};
use crate::config::TradeConfig;
use crate::network::{Action, Family, PacketBuilder};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TradeError {
    #[error("cannot trade with yourself")]
    SelfTrade,

    #[error("character {0} is not online")]
    NotFound(CharacterId),

    #[error("character {0} is already trading")]
    Busy(CharacterId),

    #[error("characters are on different maps")]
    DifferentMap,

    #[error("character {0} cannot interact with items")]
    CannotInteract(CharacterId),

    #[error("character {0} is barred from trading by admin protection")]
    Protected(CharacterId),

    #[error("no trade request from {0}")]
    NoRequest(CharacterId),

    #[error("character {0} is not trading")]
    NotTrading(CharacterId),

    #[error("item {0} cannot be traded")]
    NotTradeable(ItemId),

    #[error("offer already holds the maximum of {0} stacks")]
    TooManyStacks(usize),

    #[error("item {0} is not held in the required amount")]
    NotHeld(ItemId),

    #[error("item {0} is not in the offer")]
    NotOffered(ItemId),

    #[error("cannot agree to an empty offer")]
    EmptyOffer,

    #[error("offer from {0} no longer matches the inventory")]
    OfferInvalid(CharacterId),
}

/// One side of an open trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeSide {
    pub character: CharacterId,
    pub offer: Vec<ItemStack>,
    pub agreed: bool,
}

impl TradeSide {
    fn new(character: CharacterId) -> Self {
        Self {
            character,
            offer: Vec::new(),
            agreed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeSession {
    id: TradeId,
    sides: [TradeSide; 2],
}

impl TradeSession {
    pub fn id(&self) -> TradeId {
        self.id
    }

    pub fn characters(&self) -> [CharacterId; 2] {
        [self.sides[0].character, self.sides[1].character]
    }

    pub fn side(&self, who: CharacterId) -> Option<&TradeSide> {
        self.sides.iter().find(|s| s.character == who)
    }

    fn side_mut(&mut self, who: CharacterId) -> Option<&mut TradeSide> {
        self.sides.iter_mut().find(|s| s.character == who)
    }

    pub fn partner_of(&self, who: CharacterId) -> Option<CharacterId> {
        match self.characters() {
            [a, b] if a == who => Some(b),
            [a, b] if b == who => Some(a),
            _ => None,
        }
    }

    fn reset_agreement(&mut self) {
        for side in &mut self.sides {
            side.agreed = false;
        }
    }

    fn both_agreed(&self) -> bool {
        self.sides.iter().all(|s| s.agreed)
    }
}

/// Result of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeReceipt {
    pub id: TradeId,
    /// Each side with what it gave away
    pub given: [(CharacterId, Vec<ItemStack>); 2],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgreeOutcome {
    Agreed,
    Withdrawn,
    Committed(TradeReceipt),
}

#[derive(Debug, Default)]
pub struct Trades {
    sessions: HashMap<TradeId, TradeSession>,
    next_id: u32,
}

impl Trades {
    fn open(&mut self, a: CharacterId, b: CharacterId) -> TradeId {
        self.next_id = self.next_id.wrapping_add(1);
        let id = TradeId(self.next_id);
        self.sessions.insert(
            id,
            TradeSession {
                id,
                sides: [TradeSide::new(a), TradeSide::new(b)],
            },
        );
        id
    }

    pub fn get(&self, id: TradeId) -> Option<&TradeSession> {
        self.sessions.get(&id)
    }

    fn get_mut(&mut self, id: TradeId) -> Option<&mut TradeSession> {
        self.sessions.get_mut(&id)
    }

    fn remove(&mut self, id: TradeId) -> Option<TradeSession> {
        self.sessions.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TradeSession> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn add_offer(builder: PacketBuilder, side: &TradeSide) -> PacketBuilder {
    add_given(builder, side.character, &side.offer)
}

/// `who`, then (u16 item, u32 amount) pairs, then a break.
fn add_given(builder: PacketBuilder, who: CharacterId, items: &[ItemStack]) -> PacketBuilder {
    let mut builder = builder.add_u32(who.0);
    for stack in items {
        builder = builder.add_u16(stack.id).add_u32(stack.amount);
    }
    builder.add_break()
}

fn describe(world: &World, items: &[ItemStack]) -> String {
    items
        .iter()
        .map(|s| format!("{} {} (ID: {})", s.amount, world.item_name(s.id), s.id))
        .collect::<Vec<_>>()
        .join(", ")
}

impl World {
    fn trade_eligible(&self, who: &Character, config: &TradeConfig) -> Result<(), TradeError> {
        if who.is_trading() {
            return Err(TradeError::Busy(who.id()));
        }
        if !who.can_interact_items() {
            return Err(TradeError::CannotInteract(who.id()));
        }
        if config.protects(who.admin.tier()) {
            return Err(TradeError::Protected(who.id()));
        }
        Ok(())
    }

    fn trade_of(&self, who: CharacterId) -> Result<TradeId, TradeError> {
        let character = self.character(who).ok_or(TradeError::NotFound(who))?;
        character.trade().ok_or(TradeError::NotTrading(who))
    }

    /// `from` asks `to` to trade.
    pub fn trade_request(
        &mut self,
        from: CharacterId,
        to: CharacterId,
        config: &TradeConfig,
    ) -> Result<(), TradeError> {
        if from == to {
            return Err(TradeError::SelfTrade);
        }
        let requester = self.character(from).ok_or(TradeError::NotFound(from))?;
        let target = self
            .character(to)
            .filter(|c| c.is_reachable())
            .ok_or(TradeError::NotFound(to))?;

        self.trade_eligible(target, config)?;
        self.trade_eligible(requester, config)?;
        if requester.map() != target.map() {
            return Err(TradeError::DifferentMap);
        }

        let packet = PacketBuilder::new(Family::Trade, Action::Request)
            .add_u32(from.0)
            .add_string(requester.name());
        target.send(&packet);

        if let Some(requester) = self.character_mut(from) {
            requester.relations.trade_request = Some(to);
        }
        tracing::debug!("[trade] [request] {} -> {}", from, to);
        Ok(())
    }

    /// `acceptor` takes up the request `requester` sent earlier.
    pub fn trade_accept(
        &mut self,
        acceptor: CharacterId,
        requester: CharacterId,
        config: &TradeConfig,
    ) -> Result<TradeId, TradeError> {
        if acceptor == requester {
            return Err(TradeError::SelfTrade);
        }
        let a = self.character(requester).ok_or(TradeError::NotFound(requester))?;
        let b = self.character(acceptor).ok_or(TradeError::NotFound(acceptor))?;

        if a.trade_request() != Some(acceptor) || !a.is_reachable() {
            return Err(TradeError::NoRequest(requester));
        }
        self.trade_eligible(a, config)?;
        self.trade_eligible(b, config)?;
        if a.map() != b.map() {
            return Err(TradeError::DifferentMap);
        }

        let id = self.trades.open(requester, acceptor);
        let (a, b) = self
            .pair_mut(requester, acceptor)
            .ok_or(TradeError::NotFound(acceptor))?;
        for side in [&mut *a, &mut *b] {
            side.relations.trade = Some(id);
            side.relations.trade_request = None;
        }

        let to_b = PacketBuilder::new(Family::Trade, Action::Open)
            .add_u32(a.id().0)
            .add_break_string(a.name())
            .add_u32(b.id().0)
            .add_break_string(b.name());
        let to_a = PacketBuilder::new(Family::Trade, Action::Open)
            .add_u32(b.id().0)
            .add_break_string(b.name())
            .add_u32(a.id().0)
            .add_break_string(a.name());
        b.send(&to_b);
        a.send(&to_a);

        tracing::debug!("[trade] [open] {} {} <-> {}", id, requester, acceptor);
        Ok(id)
    }

    /// Send both offers to both sides.
    fn trade_broadcast(&self, id: TradeId, who: CharacterId, action: Action) {
        let Some(session) = self.trades.get(id) else {
            return;
        };
        let Some(partner) = session.partner_of(who) else {
            return;
        };
        let (Some(mine), Some(theirs)) = (session.side(who), session.side(partner)) else {
            return;
        };
        let packet = add_offer(add_offer(PacketBuilder::new(Family::Trade, action), mine), theirs);
        self.send_to(who, &packet);
        self.send_to(partner, &packet);
    }

    /// Put `amount` of `item` into `who`'s offer.
    ///
    /// The offered total is clamped to what `who` holds.
    pub fn trade_add(
        &mut self,
        who: CharacterId,
        item: ItemId,
        amount: u32,
        config: &TradeConfig,
    ) -> Result<(), TradeError> {
        let id = self.trade_of(who)?;
        if !self.is_tradeable(item) {
            return Err(TradeError::NotTradeable(item));
        }
        let held = self.character(who).map_or(0, |c| c.inventory.amount(item));
        if amount == 0 || held == 0 {
            return Err(TradeError::NotHeld(item));
        }

        let session = self.trades.get_mut(id).ok_or(TradeError::NotTrading(who))?;
        let side = session.side_mut(who).ok_or(TradeError::NotTrading(who))?;
        match side.offer.iter_mut().find(|s| s.id == item) {
            Some(stack) => {
                if stack.amount >= held {
                    return Err(TradeError::NotHeld(item));
                }
                stack.amount = stack.amount.saturating_add(amount).min(held);
            }
            None => {
                if side.offer.len() >= config.max_stacks {
                    return Err(TradeError::TooManyStacks(config.max_stacks));
                }
                side.offer.push(ItemStack::new(item, amount.min(held)));
            }
        }
        session.reset_agreement();

        self.trade_broadcast(id, who, Action::Reply);
        tracing::trace!("[trade] [add] {} item={} amount={}", who, item, amount);
        Ok(())
    }

    /// Take `item` out of `who`'s offer.
    pub fn trade_remove(&mut self, who: CharacterId, item: ItemId) -> Result<(), TradeError> {
        let id = self.trade_of(who)?;
        let session = self.trades.get_mut(id).ok_or(TradeError::NotTrading(who))?;
        let side = session.side_mut(who).ok_or(TradeError::NotTrading(who))?;

        let before = side.offer.len();
        side.offer.retain(|s| s.id != item);
        if side.offer.len() == before {
            return Err(TradeError::NotOffered(item));
        }
        session.reset_agreement();

        self.trade_broadcast(id, who, Action::Reply);
        tracing::trace!("[trade] [remove] {} item={}", who, item);
        Ok(())
    }

    /// Set or clear `who`'s agreement. Commits when both sides agree.
    pub fn trade_agree(
        &mut self,
        who: CharacterId,
        agree: bool,
        config: &TradeConfig,
    ) -> Result<AgreeOutcome, TradeError> {
        let id = self.trade_of(who)?;
        let session = self.trades.get_mut(id).ok_or(TradeError::NotTrading(who))?;
        let partner = session.partner_of(who).ok_or(TradeError::NotTrading(who))?;
        let side = session.side_mut(who).ok_or(TradeError::NotTrading(who))?;

        if agree && side.offer.is_empty() {
            return Err(TradeError::EmptyOffer);
        }
        side.agreed = agree;

        if agree && session.both_agreed() {
            return self.trade_commit(id, config).map(AgreeOutcome::Committed);
        }

        let flag = u8::from(agree);
        self.send_to(who, &PacketBuilder::new(Family::Trade, Action::Spec).add_u8(flag));
        self.send_to(
            partner,
            &PacketBuilder::new(Family::Trade, Action::Agree)
                .add_u32(who.0)
                .add_u8(flag),
        );

        if agree {
            tracing::trace!("[trade] [agree] {} in {}", who, id);
            Ok(AgreeOutcome::Agreed)
        } else {
            tracing::trace!("[trade] [disagree] {} in {}", who, id);
            Ok(AgreeOutcome::Withdrawn)
        }
    }

    /// Validate both offers, then swap them in one step.
    fn trade_commit(&mut self, id: TradeId, config: &TradeConfig) -> Result<TradeReceipt, TradeError> {
        let [left, right] = match self.trades.get(id) {
            Some(session) => session.sides.clone(),
            None => return Err(TradeError::OfferInvalid(CharacterId(0))),
        };

        for side in [&left, &right] {
            let holds = self
                .character(side.character)
                .is_some_and(|c| c.inventory.holds(&side.offer));
            if !holds {
                tracing::debug!("[trade] [commit] {} aborted, {} offer stale", id, side.character);
                self.trade_end(id, None);
                return Err(TradeError::OfferInvalid(side.character));
            }
        }

        let (a, b) = self
            .pair_mut(left.character, right.character)
            .ok_or(TradeError::NotFound(right.character))?;
        for stack in &left.offer {
            a.inventory.remove(stack.id, stack.amount);
            b.inventory.add(stack.id, stack.amount);
        }
        for stack in &right.offer {
            b.inventory.remove(stack.id, stack.amount);
            a.inventory.add(stack.id, stack.amount);
        }
        for side in [&mut *a, &mut *b] {
            side.relations.trade = None;
            side.relations.trade_request = None;
        }

        let packet = add_given(
            add_given(PacketBuilder::new(Family::Trade, Action::Use), left.character, &left.offer),
            right.character,
            &right.offer,
        );
        a.send(&packet);
        b.send(&packet);

        self.trades.remove(id);
        self.inventory_changed(left.character);
        self.inventory_changed(right.character);

        let (a_name, b_name) = (
            self.character(left.character).map(|c| c.name().to_string()).unwrap_or_default(),
            self.character(right.character).map(|c| c.name().to_string()).unwrap_or_default(),
        );
        tracing::info!("[trade] [commit] {} {} <-> {}", id, a_name, b_name);
        if config.log_trades {
            tracing::info!(
                target: "trade",
                "{} trading with {}; {} received: {}; {} received: {}",
                a_name,
                b_name,
                b_name,
                describe(self, &left.offer),
                a_name,
                describe(self, &right.offer)
            );
        }

        Ok(TradeReceipt {
            id,
            given: [
                (left.character, left.offer),
                (right.character, right.offer),
            ],
        })
    }

    /// Close `who`'s trade without moving any items.
    pub fn trade_close(&mut self, who: CharacterId) -> Result<(), TradeError> {
        let id = self.trade_of(who)?;
        self.trade_end(id, Some(who));
        tracing::debug!("[trade] [close] {} by {}", id, who);
        Ok(())
    }

    /// Destroy a session and clear both links. Everyone but `ended_by` is told.
    fn trade_end(&mut self, id: TradeId, ended_by: Option<CharacterId>) {
        let Some(session) = self.trades.remove(id) else {
            return;
        };
        for who in session.characters() {
            if let Some(character) = self.character_mut(who) {
                character.relations.trade = None;
            }
        }
        for who in session.characters() {
            let closer = ended_by.unwrap_or(who);
            let packet = PacketBuilder::new(Family::Trade, Action::Close).add_u32(closer.0);
            if Some(who) != ended_by {
                self.send_to(who, &packet);
            }
        }
    }
}
