//! Trading engine - wires market data to execution through the event bus.
//!
//! The pipeline is MARKET -> SIGNAL -> ORDER -> FILL, with the risk
//! gatekeeper standing between signal and order. Each stage is a bus
//! handler holding only the components it needs; stages communicate
//! exclusively by publishing events. A partially filled order re-enters
//! the pipeline as a fresh ORDER event under the same client order id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::bus::{EventBus, EventHandler};
use crate::core::config::{Config, RiskLimits, RunMode};
use crate::core::traits::{BrokerClient, ExecutionHandler, ExecutionOutcome};
use crate::core::types::{
    ClientOrderId, Fill, MarketSnapshot, Order, OrderStatus, Price, Quantity, Side, StrategyId,
    Symbol, UserId,
};
use crate::core::Result;
use crate::events::{
    Event, EventKind, EventMeta, FillEvent, KillScope, KillSwitchEvent, MarketEvent, OrderEvent,
    RiskBlockEvent, SignalEvent,
};
use crate::execution::{LiveExecutor, PaperExecutor};
use crate::orders::OrderStore;
use crate::risk::{RiskDecision, RiskGatekeeper, RiskSnapshot};
use crate::rules::{self, RuleDefinition, SignalAction};

/// Everything needed to register a strategy. Rule text is parsed and
/// validated here; a strategy with a rejected rule set never becomes
/// active.
#[derive(Debug, Clone)]
pub struct StrategySpec {
    pub strategy_id: StrategyId,
    pub user_id: UserId,
    pub symbol: Symbol,
    /// Fixed order size per signal
    pub order_quantity: Quantity,
    /// Rule documents, JSON text
    pub rules: Vec<String>,
    /// Per-strategy limits; falls back to the configured defaults
    pub limits: Option<RiskLimits>,
}

/// Average-cost position book for realized P&L. Buy commissions are
/// capitalized into the cost basis; sell commissions reduce the realized
/// amount.
#[derive(Debug, Default)]
struct PositionBook {
    quantity: Decimal,
    avg_cost: Decimal,
}

impl PositionBook {
    /// Apply a fill, returning the realized P&L it produced.
    fn apply(&mut self, side: Side, fill: &Fill) -> Decimal {
        let qty = fill.fill_quantity.as_decimal();
        let price = fill.fill_price.as_decimal();

        match side {
            Side::Buy => {
                let total_cost = self.quantity * self.avg_cost + qty * price + fill.commission;
                self.quantity += qty;
                if self.quantity > Decimal::ZERO {
                    self.avg_cost = total_cost / self.quantity;
                }
                Decimal::ZERO
            }
            Side::Sell => {
                // Only the held quantity realizes against the cost basis.
                let sold = qty.min(self.quantity);
                let realized = (price - self.avg_cost) * sold - fill.commission;
                self.quantity -= sold;
                if self.quantity.is_zero() {
                    self.avg_cost = Decimal::ZERO;
                }
                realized
            }
        }
    }
}

/// Active strategy: validated rules plus the per-strategy state the
/// pipeline maintains (previous snapshot for crossings, position book
/// for P&L).
struct StrategyState {
    user_id: UserId,
    symbol: Symbol,
    order_quantity: Quantity,
    rules: Vec<RuleDefinition>,
    last_snapshot: Mutex<Option<MarketSnapshot>>,
    book: Mutex<PositionBook>,
}

#[derive(Default)]
struct StrategyRegistry {
    strategies: RwLock<HashMap<StrategyId, Arc<StrategyState>>>,
}

impl StrategyRegistry {
    fn get(&self, strategy_id: &StrategyId) -> Option<Arc<StrategyState>> {
        self.strategies.read().get(strategy_id).cloned()
    }

    fn insert(&self, strategy_id: StrategyId, state: StrategyState) {
        self.strategies.write().insert(strategy_id, Arc::new(state));
    }
}

/// MARKET stage: evaluate the strategy's rules against the tick and emit
/// a SIGNAL for the first rule that fires. An unresolvable indicator
/// degrades that rule to a hold for this tick, never into a trade.
struct MarketHandler {
    strategies: Arc<StrategyRegistry>,
    bus: Arc<EventBus>,
}

#[async_trait]
impl EventHandler for MarketHandler {
    fn name(&self) -> &str {
        "market"
    }

    async fn handle(&self, event: Event) -> Result<()> {
        let Event::Market(market) = event else {
            return Ok(());
        };

        let Some(state) = self.strategies.get(&market.strategy_id) else {
            trace!(strategy_id = %market.strategy_id, "tick for unknown strategy dropped");
            return Ok(());
        };
        if state.symbol != market.symbol {
            return Ok(());
        }

        let previous = state.last_snapshot.lock().clone();

        let mut fired: Vec<(String, Side)> = vec![];
        for rule in &state.rules {
            match rules::evaluate(rule, &market.snapshot, previous.as_ref()) {
                Ok(SignalAction::Hold) => {}
                Ok(SignalAction::Buy) => fired.push((rule.name.clone(), Side::Buy)),
                Ok(SignalAction::Sell) => fired.push((rule.name.clone(), Side::Sell)),
                Err(e) => {
                    // Fail closed: this rule holds for the tick.
                    warn!(rule = %rule.name, error = %e, "rule evaluation degraded to hold");
                }
            }
        }

        *state.last_snapshot.lock() = Some(market.snapshot.clone());

        // Contradictory BUY and SELL on the same tick cancel out.
        if fired.iter().any(|(_, s)| *s == Side::Buy) && fired.iter().any(|(_, s)| *s == Side::Sell)
        {
            warn!(
                strategy_id = %market.strategy_id,
                "buy and sell rules fired on the same tick, no signal emitted"
            );
            return Ok(());
        }

        if let Some((rule_name, side)) = fired.into_iter().next() {
            debug!(strategy_id = %market.strategy_id, rule = %rule_name, %side, "rule fired");
            self.bus.publish(Event::Signal(SignalEvent {
                meta: EventMeta::now(),
                user_id: market.user_id,
                strategy_id: market.strategy_id,
                symbol: market.symbol,
                side,
                reference_price: market.last_price,
                rule_name,
            }));
        }
        Ok(())
    }
}

/// SIGNAL stage: the risk gate. Approval creates and publishes an order;
/// a veto publishes a RISK_BLOCK event carrying the reason.
struct SignalHandler {
    strategies: Arc<StrategyRegistry>,
    risk: Arc<RiskGatekeeper>,
    orders: Arc<OrderStore>,
    bus: Arc<EventBus>,
}

#[async_trait]
impl EventHandler for SignalHandler {
    fn name(&self) -> &str {
        "signal"
    }

    async fn handle(&self, event: Event) -> Result<()> {
        let Event::Signal(signal) = event else {
            return Ok(());
        };

        let Some(state) = self.strategies.get(&signal.strategy_id) else {
            warn!(strategy_id = %signal.strategy_id, "signal for unknown strategy dropped");
            return Ok(());
        };

        let quantity = state.order_quantity;
        let notional = quantity.as_decimal() * signal.reference_price.as_decimal();

        match self.risk.validate(signal.strategy_id, signal.side, notional) {
            RiskDecision::Approved => {
                let order = Order::new(
                    ClientOrderId::generate(signal.strategy_id),
                    signal.user_id,
                    signal.strategy_id,
                    signal.symbol.clone(),
                    signal.side,
                    quantity,
                    signal.reference_price,
                );
                let order = self.orders.insert(order);
                info!(
                    client_order_id = %order.client_order_id,
                    strategy_id = %signal.strategy_id,
                    side = %signal.side,
                    rule = %signal.rule_name,
                    "signal approved, order created"
                );
                self.bus.publish(Event::Order(OrderEvent {
                    meta: EventMeta::now(),
                    user_id: signal.user_id,
                    strategy_id: signal.strategy_id,
                    order,
                }));
            }
            RiskDecision::Blocked(reason) => {
                info!(
                    strategy_id = %signal.strategy_id,
                    side = %signal.side,
                    %reason,
                    "signal blocked by risk gate"
                );
                self.bus.publish(Event::RiskBlock(RiskBlockEvent {
                    meta: EventMeta::now(),
                    user_id: signal.user_id,
                    strategy_id: signal.strategy_id,
                    symbol: signal.symbol,
                    side: signal.side,
                    reason,
                }));
            }
        }
        Ok(())
    }
}

/// ORDER stage: mark the order submitted and hand it to the execution
/// layer. Fills are published; rejections close the order with the
/// venue's reason. The kill switch gates every submission here, so a
/// remainder re-entering after a partial fill cannot outrun it.
struct OrderHandler {
    risk: Arc<RiskGatekeeper>,
    orders: Arc<OrderStore>,
    executor: Arc<dyn ExecutionHandler>,
    bus: Arc<EventBus>,
}

#[async_trait]
impl EventHandler for OrderHandler {
    fn name(&self) -> &str {
        "order"
    }

    async fn handle(&self, event: Event) -> Result<()> {
        let Event::Order(oe) = event else {
            return Ok(());
        };

        if self.risk.is_killed(oe.strategy_id) {
            warn!(
                client_order_id = %oe.order.client_order_id,
                strategy_id = %oe.strategy_id,
                "kill switch engaged, open order cancelled"
            );
            self.orders.cancel(&oe.order.client_order_id)?;
            self.executor.release(&oe.order.client_order_id);
            return Ok(());
        }

        // Read the order fresh: for a re-entering remainder the store holds
        // the accumulated fill state, not the event's snapshot.
        let order = self
            .orders
            .mark_submitted(&oe.order.client_order_id, None)?;

        match self.executor.execute(&order).await? {
            ExecutionOutcome::Fill {
                fill,
                broker_order_id,
            } => {
                if broker_order_id.is_some() {
                    self.orders
                        .mark_submitted(&order.client_order_id, broker_order_id)?;
                }
                self.bus.publish(Event::Fill(FillEvent {
                    meta: EventMeta::now(),
                    user_id: oe.user_id,
                    strategy_id: oe.strategy_id,
                    symbol: order.symbol.clone(),
                    side: order.side,
                    fill,
                }));
            }
            ExecutionOutcome::Rejected { reason } => {
                warn!(
                    client_order_id = %order.client_order_id,
                    reason,
                    "order rejected by execution layer"
                );
                self.orders.reject(&order.client_order_id, &reason)?;
                self.executor.release(&order.client_order_id);
            }
            ExecutionOutcome::Cancelled => {
                warn!(
                    client_order_id = %order.client_order_id,
                    "order cancelled at the venue"
                );
                self.orders.cancel(&order.client_order_id)?;
                self.executor.release(&order.client_order_id);
            }
        }
        Ok(())
    }
}

/// FILL stage: apply the fill to the order store, realize P&L into the
/// risk counters, and re-enter any open remainder into the pipeline.
struct FillHandler {
    strategies: Arc<StrategyRegistry>,
    risk: Arc<RiskGatekeeper>,
    orders: Arc<OrderStore>,
    bus: Arc<EventBus>,
}

#[async_trait]
impl EventHandler for FillHandler {
    fn name(&self) -> &str {
        "fill"
    }

    async fn handle(&self, event: Event) -> Result<()> {
        let Event::Fill(fe) = event else {
            return Ok(());
        };

        let order = self.orders.apply_fill(&fe.fill)?;

        let realized = match self.strategies.get(&fe.strategy_id) {
            Some(state) => state.book.lock().apply(fe.side, &fe.fill),
            None => Decimal::ZERO,
        };
        self.risk
            .record_fill(fe.strategy_id, fe.side, fe.fill.notional(), realized);

        debug!(
            client_order_id = %fe.fill.client_order_id,
            qty = %fe.fill.fill_quantity,
            price = %fe.fill.fill_price,
            realized = %realized,
            "fill recorded"
        );

        if order.status == OrderStatus::PartiallyFilled {
            // Continue the same order; the client order id carries over.
            self.bus.publish(Event::Order(OrderEvent {
                meta: EventMeta::now(),
                user_id: fe.user_id,
                strategy_id: fe.strategy_id,
                order,
            }));
        }
        Ok(())
    }
}

pub struct TradingEngine {
    config: Config,
    bus: Arc<EventBus>,
    risk: Arc<RiskGatekeeper>,
    orders: Arc<OrderStore>,
    strategies: Arc<StrategyRegistry>,
    executor: Arc<dyn ExecutionHandler>,
}

impl TradingEngine {
    /// Build an engine with an explicit execution layer.
    pub fn new(config: Config, executor: Arc<dyn ExecutionHandler>) -> Self {
        Self {
            config,
            bus: Arc::new(EventBus::new()),
            risk: Arc::new(RiskGatekeeper::new()),
            orders: Arc::new(OrderStore::new()),
            strategies: Arc::new(StrategyRegistry::default()),
            executor,
        }
    }

    /// Paper engine: simulated execution, no network.
    pub fn paper(config: Config) -> Self {
        let executor = Arc::new(PaperExecutor::new(config.paper.clone()));
        Self::new(config, executor)
    }

    /// Live engine over the given broker connection.
    pub fn live(config: Config, broker: Arc<dyn BrokerClient>) -> Self {
        let executor = Arc::new(LiveExecutor::new(broker, config.broker.clone()));
        Self::new(config, executor)
    }

    pub fn mode(&self) -> RunMode {
        self.config.app.mode
    }

    /// Subscribe the pipeline stages to the bus. Must run inside a tokio
    /// runtime; call once before injecting market data.
    pub fn start(&self) {
        self.bus.subscribe(
            EventKind::Market,
            Arc::new(MarketHandler {
                strategies: self.strategies.clone(),
                bus: self.bus.clone(),
            }),
        );
        self.bus.subscribe(
            EventKind::Signal,
            Arc::new(SignalHandler {
                strategies: self.strategies.clone(),
                risk: self.risk.clone(),
                orders: self.orders.clone(),
                bus: self.bus.clone(),
            }),
        );
        self.bus.subscribe(
            EventKind::Order,
            Arc::new(OrderHandler {
                risk: self.risk.clone(),
                orders: self.orders.clone(),
                executor: self.executor.clone(),
                bus: self.bus.clone(),
            }),
        );
        self.bus.subscribe(
            EventKind::Fill,
            Arc::new(FillHandler {
                strategies: self.strategies.clone(),
                risk: self.risk.clone(),
                orders: self.orders.clone(),
                bus: self.bus.clone(),
            }),
        );
        info!(executor = self.executor.name(), "trading engine started");
    }

    /// Register a strategy: parse and validate its rules, reject BUY/SELL
    /// rule sets that can fire on the same tick, and arm its risk limits.
    pub fn register_strategy(&self, spec: StrategySpec) -> Result<()> {
        let rules = spec
            .rules
            .iter()
            .map(|text| RuleDefinition::parse(text))
            .collect::<Result<Vec<_>>>()?;
        rules::check_conflicts(&rules)?;

        let limits = spec
            .limits
            .unwrap_or_else(|| self.config.risk_defaults.clone());
        self.risk.register(spec.strategy_id, limits);

        self.strategies.insert(
            spec.strategy_id,
            StrategyState {
                user_id: spec.user_id,
                symbol: spec.symbol.clone(),
                order_quantity: spec.order_quantity,
                rules,
                last_snapshot: Mutex::new(None),
                book: Mutex::new(PositionBook::default()),
            },
        );
        info!(strategy_id = %spec.strategy_id, symbol = %spec.symbol, "strategy registered");
        Ok(())
    }

    /// Feed one tick into the pipeline.
    pub fn inject_market_data(
        &self,
        strategy_id: StrategyId,
        symbol: Symbol,
        last_price: Price,
        snapshot: MarketSnapshot,
    ) {
        let Some(state) = self.strategies.get(&strategy_id) else {
            warn!(%strategy_id, "market data for unregistered strategy dropped");
            return;
        };
        self.bus.publish(Event::Market(MarketEvent {
            meta: EventMeta::now(),
            user_id: state.user_id,
            strategy_id,
            symbol,
            last_price,
            snapshot,
        }));
    }

    /// Engage the kill switch for one strategy or the whole process.
    pub fn kill_switch(&self, user_id: UserId, scope: KillScope) {
        match scope {
            KillScope::Global => self.risk.kill(None),
            KillScope::Strategy(id) => self.risk.kill(Some(id)),
        }
        self.bus.publish(Event::KillSwitch(KillSwitchEvent {
            meta: EventMeta::now(),
            user_id,
            scope,
            engaged: true,
        }));
    }

    /// Clear a previously engaged kill switch.
    pub fn clear_kill_switch(&self, user_id: UserId, scope: KillScope) {
        match scope {
            KillScope::Global => self.risk.clear_kill(None),
            KillScope::Strategy(id) => self.risk.clear_kill(Some(id)),
        }
        self.bus.publish(Event::KillSwitch(KillSwitchEvent {
            meta: EventMeta::now(),
            user_id,
            scope,
            engaged: false,
        }));
    }

    /// Day-boundary reset of the risk counters. Manual kill switches
    /// survive; daily-loss auto-halts are lifted.
    pub fn reset_day(&self) {
        self.risk.reset_day();
    }

    /// Wildcard feed over every event, for audit logging and observers.
    pub fn audit(&self) -> mpsc::UnboundedReceiver<Event> {
        self.bus.tap()
    }

    pub fn order(&self, client_order_id: &ClientOrderId) -> Option<Order> {
        self.orders.get(client_order_id)
    }

    pub fn orders(&self) -> Vec<Order> {
        self.orders.all()
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.orders.open()
    }

    pub fn risk_snapshot(&self, strategy_id: StrategyId) -> Option<RiskSnapshot> {
        self.risk.snapshot(strategy_id)
    }

    pub fn invalid_transitions(&self) -> u64 {
        self.orders.invalid_transitions()
    }
}
