//! Event model - typed, immutable events flowing through the bus.
//!
//! Every variant carries wall-clock and monotonic timestamps plus its
//! user/strategy scope. Events are constructed once and never mutated;
//! components communicate only by publishing and reacting to them.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

use crate::core::types::{
    ClientOrderId, Fill, MarketSnapshot, Order, Price, Side, StrategyId, Symbol, UserId,
};
use crate::risk::BlockReason;

/// Process-start anchor for monotonic timestamps.
static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Identity and timing shared by every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub id: Uuid,
    /// Wall-clock time of construction
    pub occurred_at: DateTime<Utc>,
    /// Nanoseconds since process start; monotonic, unaffected by clock steps
    pub monotonic_ns: u64,
}

impl EventMeta {
    pub fn now() -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            monotonic_ns: PROCESS_START.elapsed().as_nanos() as u64,
        }
    }
}

/// Event kind, the bus routing topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Market,
    Signal,
    Order,
    Fill,
    RiskBlock,
    KillSwitch,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Market => "MARKET",
            EventKind::Signal => "SIGNAL",
            EventKind::Order => "ORDER",
            EventKind::Fill => "FILL",
            EventKind::RiskBlock => "RISK_BLOCK",
            EventKind::KillSwitch => "KILL_SWITCH",
        };
        write!(f, "{}", s)
    }
}

/// A market tick scoped to one active strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    pub meta: EventMeta,
    pub user_id: UserId,
    pub strategy_id: StrategyId,
    pub symbol: Symbol,
    pub last_price: Price,
    pub snapshot: MarketSnapshot,
}

/// Derived trade intent, prior to risk approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvent {
    pub meta: EventMeta,
    pub user_id: UserId,
    pub strategy_id: StrategyId,
    pub symbol: Symbol,
    pub side: Side,
    pub reference_price: Price,
    /// Name of the rule that fired
    pub rule_name: String,
}

/// A risk-approved order entering (or re-entering, for an open remainder)
/// the execution layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub meta: EventMeta,
    pub user_id: UserId,
    pub strategy_id: StrategyId,
    pub order: Order,
}

/// An execution result applied to an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub meta: EventMeta,
    pub user_id: UserId,
    pub strategy_id: StrategyId,
    pub symbol: Symbol,
    pub side: Side,
    pub fill: Fill,
}

/// A signal vetoed by the gatekeeper. First-class outcome, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskBlockEvent {
    pub meta: EventMeta,
    pub user_id: UserId,
    pub strategy_id: StrategyId,
    pub symbol: Symbol,
    pub side: Side,
    pub reason: BlockReason,
}

/// Kill switch scope: one strategy or the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KillScope {
    Global,
    Strategy(StrategyId),
}

/// Kill switch toggled (engaged or cleared), for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchEvent {
    pub meta: EventMeta,
    pub user_id: UserId,
    pub scope: KillScope,
    pub engaged: bool,
}

/// The event tagged union. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Market(MarketEvent),
    Signal(SignalEvent),
    Order(OrderEvent),
    Fill(FillEvent),
    RiskBlock(RiskBlockEvent),
    KillSwitch(KillSwitchEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Market(_) => EventKind::Market,
            Event::Signal(_) => EventKind::Signal,
            Event::Order(_) => EventKind::Order,
            Event::Fill(_) => EventKind::Fill,
            Event::RiskBlock(_) => EventKind::RiskBlock,
            Event::KillSwitch(_) => EventKind::KillSwitch,
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            Event::Market(e) => &e.meta,
            Event::Signal(e) => &e.meta,
            Event::Order(e) => &e.meta,
            Event::Fill(e) => &e.meta,
            Event::RiskBlock(e) => &e.meta,
            Event::KillSwitch(e) => &e.meta,
        }
    }

    /// Strategy scope; None only for a global kill switch.
    pub fn strategy_id(&self) -> Option<StrategyId> {
        match self {
            Event::Market(e) => Some(e.strategy_id),
            Event::Signal(e) => Some(e.strategy_id),
            Event::Order(e) => Some(e.strategy_id),
            Event::Fill(e) => Some(e.strategy_id),
            Event::RiskBlock(e) => Some(e.strategy_id),
            Event::KillSwitch(e) => match e.scope {
                KillScope::Strategy(id) => Some(id),
                KillScope::Global => None,
            },
        }
    }

    /// Convenience for fills: the client order id the fill applies to.
    pub fn client_order_id(&self) -> Option<&ClientOrderId> {
        match self {
            Event::Order(e) => Some(&e.order.client_order_id),
            Event::Fill(e) => Some(&e.fill.client_order_id),
            _ => None,
        }
    }
}
