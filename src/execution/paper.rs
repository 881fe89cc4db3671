//! Paper execution - simulates a real venue without touching a network.
//!
//! Applies adverse slippage, an artificial delay, an optional partial fill,
//! and a commission fraction. All randomness flows from one seedable RNG so
//! runs are reproducible.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngExt, SeedableRng};
use rust_decimal::Decimal;
use tracing::debug;

use crate::core::config::PaperConfig;
use crate::core::traits::{ExecutionHandler, ExecutionOutcome};
use crate::core::types::{ClientOrderId, Fill, Order, Price, Quantity, Side};
use crate::core::Result;

pub struct PaperExecutor {
    config: PaperConfig,
    rng: Mutex<StdRng>,
    /// Open remainder per client order id. A resubmission for a partially
    /// filled order continues the same order instead of starting a new one.
    remainders: Mutex<HashMap<ClientOrderId, Decimal>>,
}

impl PaperExecutor {
    pub fn new(config: PaperConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(rand::random()),
        };
        Self {
            config,
            rng: Mutex::new(rng),
            remainders: Mutex::new(HashMap::new()),
        }
    }

    /// Fill price with slippage applied adverse to the trader.
    fn slipped_price(&self, side: Side, reference: Price) -> Price {
        let factor = match side {
            Side::Buy => Decimal::ONE + self.config.slippage,
            Side::Sell => Decimal::ONE - self.config.slippage,
        };
        Price::new(reference.as_decimal() * factor)
    }
}

#[async_trait]
impl ExecutionHandler for PaperExecutor {
    async fn execute(&self, order: &Order) -> Result<ExecutionOutcome> {
        let remaining = {
            let remainders = self.remainders.lock();
            remainders
                .get(&order.client_order_id)
                .copied()
                .unwrap_or_else(|| order.remaining().as_decimal())
        };

        if remaining <= Decimal::ZERO {
            return Ok(ExecutionOutcome::Rejected {
                reason: "no open quantity".to_string(),
            });
        }

        // Sample everything up front: the RNG guard must not live across
        // the simulated-delay await.
        let (delay_ms, fill_qty) = {
            let mut rng = self.rng.lock();
            let delay_ms = if self.config.max_delay_ms > self.config.min_delay_ms {
                rng.random_range(self.config.min_delay_ms..=self.config.max_delay_ms)
            } else {
                self.config.min_delay_ms
            };

            let partial = rng.random_bool(self.config.partial_fill_prob.clamp(0.0, 1.0));
            let fill_qty = if partial {
                let fraction = Decimal::try_from(rng.random_range(0.5..0.9))
                    .unwrap_or(Decimal::new(5, 1));
                let qty = (remaining * fraction).round_dp(8);
                if qty <= Decimal::ZERO || qty >= remaining {
                    remaining
                } else {
                    qty
                }
            } else {
                remaining
            };
            (delay_ms, fill_qty)
        };

        tokio::time::sleep(Duration::from_millis(delay_ms)).await;

        let fill_price = self.slipped_price(order.side, order.price);
        let commission = fill_qty * fill_price.as_decimal() * self.config.commission;
        let is_partial = fill_qty < remaining;

        {
            let mut remainders = self.remainders.lock();
            if is_partial {
                remainders.insert(order.client_order_id.clone(), remaining - fill_qty);
            } else {
                remainders.remove(&order.client_order_id);
            }
        }

        debug!(
            client_order_id = %order.client_order_id,
            qty = %fill_qty,
            price = %fill_price,
            is_partial,
            "paper fill"
        );

        Ok(ExecutionOutcome::Fill {
            fill: Fill {
                client_order_id: order.client_order_id.clone(),
                fill_quantity: Quantity::new(fill_qty),
                fill_price,
                commission,
                is_partial,
                filled_at: Utc::now(),
            },
            broker_order_id: None,
        })
    }

    fn release(&self, client_order_id: &ClientOrderId) {
        self.remainders.lock().remove(client_order_id);
    }

    fn name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{StrategyId, Symbol, UserId};

    fn config(partial_fill_prob: f64, seed: u64) -> PaperConfig {
        PaperConfig {
            slippage: Decimal::new(5, 4),   // 0.05%
            commission: Decimal::new(5, 4), // 0.05%
            partial_fill_prob,
            min_delay_ms: 0,
            max_delay_ms: 0,
            seed: Some(seed),
        }
    }

    fn order(side: Side, qty: i64, price: f64) -> Order {
        Order::new(
            ClientOrderId::new("p-1"),
            UserId(1),
            StrategyId(1),
            Symbol::new("TEST"),
            side,
            Quantity::new(qty),
            Price::from_f64(price),
        )
    }

    #[tokio::test]
    async fn buy_slippage_and_commission_are_adverse() {
        let exec = PaperExecutor::new(config(0.0, 42));
        let order = order(Side::Buy, 100, 580.50);

        let outcome = exec.execute(&order).await.unwrap();
        let fill = match outcome {
            ExecutionOutcome::Fill { fill, .. } => fill,
            other => panic!("expected fill, got {:?}", other),
        };

        // 580.50 * 1.0005 = 580.79025, adverse to the buyer
        assert_eq!(fill.fill_price.as_decimal(), "580.790250".parse().unwrap());
        assert_eq!(fill.fill_quantity, Quantity::new(100));
        // 0.05% of fill notional
        assert_eq!(fill.commission, "29.03951250".parse().unwrap());
        assert!(!fill.is_partial);
    }

    #[tokio::test]
    async fn sell_slippage_lowers_the_price() {
        let exec = PaperExecutor::new(config(0.0, 42));
        let order = order(Side::Sell, 10, 580.50);

        let outcome = exec.execute(&order).await.unwrap();
        if let ExecutionOutcome::Fill { fill, .. } = outcome {
            // 580.50 * 0.9995
            assert_eq!(fill.fill_price.as_decimal(), "580.209750".parse().unwrap());
        } else {
            panic!("expected fill");
        }
    }

    #[tokio::test]
    async fn partial_fills_continue_until_complete() {
        let exec = PaperExecutor::new(config(1.0, 7));
        let mut order = order(Side::Buy, 100, 50.0);

        let mut total = Decimal::ZERO;
        let mut last_partial = true;
        for _ in 0..64 {
            let outcome = exec.execute(&order).await.unwrap();
            let fill = match outcome {
                ExecutionOutcome::Fill { fill, .. } => fill,
                other => panic!("expected fill, got {:?}", other),
            };
            total += fill.fill_quantity.as_decimal();
            order.filled_quantity = Quantity::new(total);
            last_partial = fill.is_partial;
            if !last_partial {
                break;
            }
        }

        assert!(!last_partial, "order never completed");
        assert_eq!(total, Decimal::from(100));
    }

    #[tokio::test]
    async fn seeded_runs_are_reproducible() {
        let a = PaperExecutor::new(config(1.0, 99));
        let b = PaperExecutor::new(config(1.0, 99));
        let ord = order(Side::Buy, 100, 50.0);

        let fa = match a.execute(&ord).await.unwrap() {
            ExecutionOutcome::Fill { fill, .. } => fill,
            _ => panic!(),
        };
        let fb = match b.execute(&ord).await.unwrap() {
            ExecutionOutcome::Fill { fill, .. } => fill,
            _ => panic!(),
        };
        assert_eq!(fa.fill_quantity, fb.fill_quantity);
        assert_eq!(fa.fill_price, fb.fill_price);
    }

    #[tokio::test]
    async fn fully_filled_order_is_not_refilled() {
        let exec = PaperExecutor::new(config(0.0, 1));
        let mut ord = order(Side::Buy, 10, 50.0);
        ord.filled_quantity = Quantity::new(10);

        match exec.execute(&ord).await.unwrap() {
            ExecutionOutcome::Rejected { .. } => {}
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn released_order_forgets_its_remainder() {
        let exec = PaperExecutor::new(config(1.0, 7));
        let ord = order(Side::Buy, 100, 50.0);

        let first = match exec.execute(&ord).await.unwrap() {
            ExecutionOutcome::Fill { fill, .. } => fill,
            other => panic!("expected fill, got {:?}", other),
        };
        assert!(first.is_partial);

        exec.release(&ord.client_order_id);

        // With the remainder dropped, a fresh execution for the id starts
        // from the order's own open quantity again.
        let second = match exec.execute(&ord).await.unwrap() {
            ExecutionOutcome::Fill { fill, .. } => fill,
            other => panic!("expected fill, got {:?}", other),
        };
        assert!(
            second.fill_quantity.as_decimal()
                > Decimal::from(100) - first.fill_quantity.as_decimal()
        );
    }
}
