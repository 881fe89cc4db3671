//! Order state machine - lifecycle tracking from creation to terminal state.
//!
//! One order per client order id, ever. Transition attempts from a terminal
//! state (and over-fills) are refused with `InvalidTransition`, counted and
//! logged - they signal a bug or a duplicate/late event, and must never
//! corrupt state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::core::types::{ClientOrderId, Fill, Order, OrderStatus};
use crate::core::{Error, Result};

pub struct OrderStore {
    orders: RwLock<HashMap<ClientOrderId, Order>>,
    invalid_transitions: AtomicU64,
}

impl OrderStore {
    pub fn new() -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            invalid_transitions: AtomicU64::new(0),
        }
    }

    /// Track a new order. Inserting an id that already exists returns the
    /// existing order unchanged - the id is the idempotency key.
    pub fn insert(&self, order: Order) -> Order {
        let mut orders = self.orders.write();
        if let Some(existing) = orders.get(&order.client_order_id) {
            warn!(client_order_id = %order.client_order_id, "duplicate order insert ignored");
            return existing.clone();
        }
        orders.insert(order.client_order_id.clone(), order.clone());
        order
    }

    pub fn get(&self, client_order_id: &ClientOrderId) -> Option<Order> {
        self.orders.read().get(client_order_id).cloned()
    }

    pub fn all(&self) -> Vec<Order> {
        self.orders.read().values().cloned().collect()
    }

    pub fn open(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect()
    }

    /// How many invalid transition attempts were refused so far.
    pub fn invalid_transitions(&self) -> u64 {
        self.invalid_transitions.load(Ordering::Relaxed)
    }

    /// NEW -> SUBMITTED. Re-marking an already submitted order only updates
    /// the broker order id (idempotent resubmission of an open remainder).
    pub fn mark_submitted(
        &self,
        client_order_id: &ClientOrderId,
        broker_order_id: Option<String>,
    ) -> Result<Order> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(client_order_id)
            .ok_or_else(|| self.refused(client_order_id, OrderStatus::New, "submit unknown order"))?;

        match order.status {
            OrderStatus::New => {
                order.status = OrderStatus::Submitted;
                order.submitted_at = Some(Utc::now());
            }
            OrderStatus::Submitted | OrderStatus::PartiallyFilled => {}
            from => return Err(self.refused(client_order_id, from, "submit")),
        }

        if broker_order_id.is_some() {
            order.broker_order_id = broker_order_id;
        }
        Ok(order.clone())
    }

    /// Apply a fill. A fill equal to the remainder completes the order; a
    /// smaller one keeps it partially filled; a larger one is refused.
    pub fn apply_fill(&self, fill: &Fill) -> Result<Order> {
        let mut orders = self.orders.write();
        let order = orders.get_mut(&fill.client_order_id).ok_or_else(|| {
            self.refused(&fill.client_order_id, OrderStatus::New, "fill unknown order")
        })?;

        match order.status {
            OrderStatus::Submitted | OrderStatus::PartiallyFilled => {}
            from => return Err(self.refused(&fill.client_order_id, from, "fill")),
        }

        let qty = fill.fill_quantity.as_decimal();
        let remaining = order.remaining().as_decimal();
        if qty <= rust_decimal::Decimal::ZERO || qty > remaining {
            let from = order.status;
            return Err(self.refused(&fill.client_order_id, from, "over-fill"));
        }

        order.filled_quantity =
            crate::core::types::Quantity::new(order.filled_quantity.as_decimal() + qty);

        if order.remaining().is_zero() {
            order.status = OrderStatus::Filled;
            order.closed_at = Some(fill.filled_at);
        } else {
            order.status = OrderStatus::PartiallyFilled;
        }

        debug!(
            client_order_id = %fill.client_order_id,
            status = ?order.status,
            filled = %order.filled_quantity,
            "fill applied"
        );
        Ok(order.clone())
    }

    /// SUBMITTED -> REJECTED, preserving the broker's reason.
    pub fn reject(&self, client_order_id: &ClientOrderId, reason: &str) -> Result<Order> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(client_order_id)
            .ok_or_else(|| self.refused(client_order_id, OrderStatus::New, "reject unknown order"))?;

        match order.status {
            OrderStatus::Submitted => {
                order.status = OrderStatus::Rejected;
                order.reject_reason = Some(reason.to_string());
                order.closed_at = Some(Utc::now());
                Ok(order.clone())
            }
            from => Err(self.refused(client_order_id, from, "reject")),
        }
    }

    /// {NEW, SUBMITTED, PARTIALLY_FILLED} -> CANCELLED.
    pub fn cancel(&self, client_order_id: &ClientOrderId) -> Result<Order> {
        let mut orders = self.orders.write();
        let order = orders
            .get_mut(client_order_id)
            .ok_or_else(|| self.refused(client_order_id, OrderStatus::New, "cancel unknown order"))?;

        match order.status {
            OrderStatus::New | OrderStatus::Submitted | OrderStatus::PartiallyFilled => {
                order.status = OrderStatus::Cancelled;
                order.closed_at = Some(Utc::now());
                Ok(order.clone())
            }
            from => Err(self.refused(client_order_id, from, "cancel")),
        }
    }

    fn refused(
        &self,
        client_order_id: &ClientOrderId,
        from: OrderStatus,
        attempted: &'static str,
    ) -> Error {
        self.invalid_transitions.fetch_add(1, Ordering::Relaxed);
        warn!(%client_order_id, ?from, attempted, "invalid order transition refused");
        Error::InvalidTransition {
            client_order_id: client_order_id.to_string(),
            from,
            attempted,
        }
    }
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Price, Quantity, Side, StrategyId, Symbol, UserId};
    use rust_decimal::Decimal;

    fn order(id: &str, qty: i64) -> Order {
        Order::new(
            ClientOrderId::new(id),
            UserId(1),
            StrategyId(1),
            Symbol::new("TEST"),
            Side::Buy,
            Quantity::new(qty),
            Price::from_f64(100.0),
        )
    }

    fn fill(id: &str, qty: i64, partial: bool) -> Fill {
        Fill {
            client_order_id: ClientOrderId::new(id),
            fill_quantity: Quantity::new(qty),
            fill_price: Price::from_f64(100.0),
            commission: Decimal::ZERO,
            is_partial: partial,
            filled_at: Utc::now(),
        }
    }

    #[test]
    fn full_lifecycle_new_submitted_filled() {
        let store = OrderStore::new();
        store.insert(order("a", 10));

        let o = store.mark_submitted(&ClientOrderId::new("a"), Some("brk-1".into())).unwrap();
        assert_eq!(o.status, OrderStatus::Submitted);
        assert_eq!(o.broker_order_id.as_deref(), Some("brk-1"));

        let o = store.apply_fill(&fill("a", 10, false)).unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert!(o.closed_at.is_some());
    }

    #[test]
    fn partial_fills_accumulate_to_filled() {
        let store = OrderStore::new();
        store.insert(order("a", 10));
        store.mark_submitted(&ClientOrderId::new("a"), None).unwrap();

        let o = store.apply_fill(&fill("a", 4, true)).unwrap();
        assert_eq!(o.status, OrderStatus::PartiallyFilled);

        let o = store.apply_fill(&fill("a", 3, true)).unwrap();
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        assert_eq!(o.remaining(), Quantity::new(3));

        let o = store.apply_fill(&fill("a", 3, false)).unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.filled_quantity, Quantity::new(10));
    }

    #[test]
    fn over_fill_is_refused_and_counted() {
        let store = OrderStore::new();
        store.insert(order("a", 10));
        store.mark_submitted(&ClientOrderId::new("a"), None).unwrap();
        store.apply_fill(&fill("a", 8, true)).unwrap();

        let err = store.apply_fill(&fill("a", 5, false)).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(store.invalid_transitions(), 1);

        // State untouched by the refused fill
        let o = store.get(&ClientOrderId::new("a")).unwrap();
        assert_eq!(o.filled_quantity, Quantity::new(8));
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn no_fill_accepted_after_terminal_state() {
        let store = OrderStore::new();
        store.insert(order("a", 5));
        store.mark_submitted(&ClientOrderId::new("a"), None).unwrap();
        store.apply_fill(&fill("a", 5, false)).unwrap();

        let err = store.apply_fill(&fill("a", 1, true)).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(store.invalid_transitions(), 1);
        assert_eq!(
            store.get(&ClientOrderId::new("a")).unwrap().filled_quantity,
            Quantity::new(5)
        );
    }

    #[test]
    fn fill_before_submission_is_refused() {
        let store = OrderStore::new();
        store.insert(order("a", 5));
        assert!(store.apply_fill(&fill("a", 5, false)).is_err());
    }

    #[test]
    fn reject_only_from_submitted() {
        let store = OrderStore::new();
        store.insert(order("a", 5));
        assert!(store.reject(&ClientOrderId::new("a"), "nope").is_err());

        store.mark_submitted(&ClientOrderId::new("a"), None).unwrap();
        let o = store.reject(&ClientOrderId::new("a"), "insufficient margin").unwrap();
        assert_eq!(o.status, OrderStatus::Rejected);
        assert_eq!(o.reject_reason.as_deref(), Some("insufficient margin"));

        // Terminal: cancel afterwards is refused
        assert!(store.cancel(&ClientOrderId::new("a")).is_err());
    }

    #[test]
    fn cancel_from_partially_filled() {
        let store = OrderStore::new();
        store.insert(order("a", 10));
        store.mark_submitted(&ClientOrderId::new("a"), None).unwrap();
        store.apply_fill(&fill("a", 4, true)).unwrap();

        let o = store.cancel(&ClientOrderId::new("a")).unwrap();
        assert_eq!(o.status, OrderStatus::Cancelled);
        assert_eq!(o.filled_quantity, Quantity::new(4));
    }

    #[test]
    fn duplicate_insert_returns_existing_order() {
        let store = OrderStore::new();
        store.insert(order("a", 10));
        store.mark_submitted(&ClientOrderId::new("a"), None).unwrap();

        let returned = store.insert(order("a", 99));
        assert_eq!(returned.quantity, Quantity::new(10));
        assert_eq!(returned.status, OrderStatus::Submitted);
        assert_eq!(store.all().len(), 1);
    }
}
