//! Risk gatekeeper - the mandatory gate between signals and orders.
//!
//! Per-strategy counters live behind one mutex each, so validation and the
//! optimistic counter increment are a single atomic step; a burst of
//! concurrent signals cannot all pass a stale counter. Cross-strategy state
//! is fully independent. The global kill switch is the only process-wide
//! flag.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::config::RiskLimits;
use crate::core::types::{Side, StrategyId};

/// Why a signal was vetoed. A first-class outcome, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    KillSwitch,
    TradeLimit,
    DailyLossLimit,
    PositionLimit,
    NotRegistered,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::KillSwitch => "kill_switch",
            BlockReason::TradeLimit => "trade_limit",
            BlockReason::DailyLossLimit => "daily_loss_limit",
            BlockReason::PositionLimit => "position_limit",
            BlockReason::NotRegistered => "not_registered",
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Gatekeeper verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskDecision {
    Approved,
    Blocked(BlockReason),
}

/// Stable read-only view of a strategy's risk state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub strategy_id: StrategyId,
    pub trades_today: u32,
    pub realized_pnl_today: Decimal,
    pub open_exposure: Decimal,
    pub kill_switch: bool,
    pub auto_halted: bool,
}

/// Per-strategy limits plus mutable daily counters. Exclusively owned by
/// the gatekeeper; reached only through its serialization point.
struct StrategyRisk {
    limits: RiskLimits,
    trades_today: u32,
    realized_pnl_today: Decimal,
    open_exposure: Decimal,
    /// User-initiated halt for this strategy; cleared explicitly
    kill_switch: bool,
    /// Daily-loss auto-halt; cleared only by the day-boundary reset
    auto_halted: bool,
}

impl StrategyRisk {
    fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            trades_today: 0,
            realized_pnl_today: Decimal::ZERO,
            open_exposure: Decimal::ZERO,
            kill_switch: false,
            auto_halted: false,
        }
    }

    fn realized_loss(&self) -> Decimal {
        if self.realized_pnl_today < Decimal::ZERO {
            -self.realized_pnl_today
        } else {
            Decimal::ZERO
        }
    }
}

/// Validates every signal before it may become an order.
pub struct RiskGatekeeper {
    global_kill: AtomicBool,
    strategies: RwLock<HashMap<StrategyId, Arc<Mutex<StrategyRisk>>>>,
}

impl RiskGatekeeper {
    pub fn new() -> Self {
        Self {
            global_kill: AtomicBool::new(false),
            strategies: RwLock::new(HashMap::new()),
        }
    }

    /// Register a strategy with its limits. Re-registration replaces the
    /// limits but keeps the day's counters.
    pub fn register(&self, strategy_id: StrategyId, limits: RiskLimits) {
        let mut strategies = self.strategies.write();
        match strategies.get(&strategy_id) {
            Some(entry) => entry.lock().limits = limits,
            None => {
                strategies.insert(strategy_id, Arc::new(Mutex::new(StrategyRisk::new(limits))));
            }
        }
        info!(%strategy_id, "strategy registered with risk limits");
    }

    /// Validate a signal. On approval the trade counter is incremented and
    /// (for buys) the notional booked against exposure in the same critical
    /// section - validation and increment are one atomic step.
    pub fn validate(&self, strategy_id: StrategyId, side: Side, notional: Decimal) -> RiskDecision {
        if self.global_kill.load(Ordering::SeqCst) {
            return RiskDecision::Blocked(BlockReason::KillSwitch);
        }

        let entry = match self.strategies.read().get(&strategy_id) {
            Some(e) => e.clone(),
            None => return RiskDecision::Blocked(BlockReason::NotRegistered),
        };

        let mut risk = entry.lock();

        if risk.kill_switch || risk.auto_halted {
            return RiskDecision::Blocked(BlockReason::KillSwitch);
        }

        if risk.trades_today >= risk.limits.max_trades_per_day {
            return RiskDecision::Blocked(BlockReason::TradeLimit);
        }

        if risk.realized_loss() >= risk.limits.max_daily_loss {
            // Breaching the daily loss limit halts the strategy for the
            // rest of the day; only the day-boundary reset clears it.
            risk.auto_halted = true;
            warn!(%strategy_id, "daily loss limit breached, strategy auto-halted");
            return RiskDecision::Blocked(BlockReason::DailyLossLimit);
        }

        if side == Side::Buy && risk.open_exposure + notional > risk.limits.max_position_size {
            return RiskDecision::Blocked(BlockReason::PositionLimit);
        }

        risk.trades_today += 1;
        if side == Side::Buy {
            risk.open_exposure += notional;
        }

        RiskDecision::Approved
    }

    /// Record a fill's realized P&L (commission included) and release
    /// exposure for sells. Does not halt by itself: the halt is engaged at
    /// the next validation so the blocking signal carries the loss reason.
    pub fn record_fill(
        &self,
        strategy_id: StrategyId,
        side: Side,
        notional: Decimal,
        realized_pnl: Decimal,
    ) {
        let entry = match self.strategies.read().get(&strategy_id) {
            Some(e) => e.clone(),
            None => {
                warn!(%strategy_id, "fill recorded for unregistered strategy");
                return;
            }
        };

        let mut risk = entry.lock();
        risk.realized_pnl_today += realized_pnl;
        if side == Side::Sell {
            risk.open_exposure = (risk.open_exposure - notional).max(Decimal::ZERO);
        }
    }

    /// Engage the kill switch: one strategy, or globally with `None`.
    pub fn kill(&self, scope: Option<StrategyId>) {
        match scope {
            None => {
                self.global_kill.store(true, Ordering::SeqCst);
                warn!("global kill switch engaged");
            }
            Some(strategy_id) => {
                if let Some(entry) = self.strategies.read().get(&strategy_id) {
                    entry.lock().kill_switch = true;
                    warn!(%strategy_id, "strategy kill switch engaged");
                }
            }
        }
    }

    /// Clear a user-initiated kill switch. The daily-loss auto-halt is not
    /// clearable here; it lasts until the day-boundary reset.
    pub fn clear_kill(&self, scope: Option<StrategyId>) {
        match scope {
            None => {
                self.global_kill.store(false, Ordering::SeqCst);
                info!("global kill switch cleared");
            }
            Some(strategy_id) => {
                if let Some(entry) = self.strategies.read().get(&strategy_id) {
                    entry.lock().kill_switch = false;
                    info!(%strategy_id, "strategy kill switch cleared");
                }
            }
        }
    }

    pub fn is_killed(&self, strategy_id: StrategyId) -> bool {
        if self.global_kill.load(Ordering::SeqCst) {
            return true;
        }
        self.strategies
            .read()
            .get(&strategy_id)
            .map(|e| {
                let risk = e.lock();
                risk.kill_switch || risk.auto_halted
            })
            .unwrap_or(false)
    }

    /// Day-boundary reset: zero the daily counters and lift auto-halts for
    /// every strategy. Manual kill switches survive the boundary.
    pub fn reset_day(&self) {
        for entry in self.strategies.read().values() {
            let mut risk = entry.lock();
            risk.trades_today = 0;
            risk.realized_pnl_today = Decimal::ZERO;
            risk.auto_halted = false;
        }
        info!("daily risk counters reset");
    }

    /// Stable snapshot of one strategy's state, taken under its lock.
    pub fn snapshot(&self, strategy_id: StrategyId) -> Option<RiskSnapshot> {
        self.strategies.read().get(&strategy_id).map(|entry| {
            let risk = entry.lock();
            RiskSnapshot {
                strategy_id,
                trades_today: risk.trades_today,
                realized_pnl_today: risk.realized_pnl_today,
                open_exposure: risk.open_exposure,
                kill_switch: risk.kill_switch,
                auto_halted: risk.auto_halted,
            }
        })
    }
}

impl Default for RiskGatekeeper {
    fn default() -> Self {
        Self::new()
    }
}
