//! Core traits - seams for execution and broker connectivity

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::types::{ClientOrderId, Fill, Order, Price, Quantity, Side, Symbol};
use crate::core::Result;

/// Outcome of an execution attempt. Rejections and cancellations are
/// terminal; the reason is carried so downstream state is never ambiguous.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Fill {
        fill: Fill,
        /// Broker-side id when the venue assigned one on acceptance
        broker_order_id: Option<String>,
    },
    Rejected {
        reason: String,
    },
    /// Cancelled at the venue - terminal, distinct from a rejection
    Cancelled,
}

/// Execution seam - Paper and Live are interchangeable behind this trait.
/// Callers never branch on which implementation is active.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    /// Execute an approved order, producing a fill or a terminal rejection.
    /// Safe to call again for the same `client_order_id` with an open
    /// remainder: implementations must never create duplicate exposure.
    async fn execute(&self, order: &Order) -> Result<ExecutionOutcome>;

    /// Forget any per-order execution state once the order leaves the
    /// pipeline without completing (cancel, reject). Default: nothing held.
    fn release(&self, _client_order_id: &ClientOrderId) {}

    /// Implementation name, for logs
    fn name(&self) -> &str;
}

/// Broker-side acknowledgement of a submission keyed by `client_order_id`.
#[derive(Debug, Clone)]
pub enum SubmitAck {
    Accepted { broker_order_id: String },
    /// The broker already holds an order for this client order id.
    /// Not an error: the caller reconciles against the existing order.
    AlreadyExists,
}

/// Broker-side order state as reported by a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOrderState {
    Open,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
}

/// Snapshot of a broker-side order, used for reconciliation.
#[derive(Debug, Clone)]
pub struct BrokerOrderStatus {
    pub broker_order_id: String,
    pub state: BrokerOrderState,
    pub filled_quantity: Quantity,
    pub avg_fill_price: Option<Price>,
    /// Commission charged for the fills reported so far
    pub commission: rust_decimal::Decimal,
    pub reject_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Broker capability consumed by live execution. Token/session lifecycle is
/// the implementor's concern, not this crate's.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Submit an order. `client_order_id` is the idempotency key; a repeat
    /// submission for a known id must yield `SubmitAck::AlreadyExists`.
    /// A rejection surfaces as `Error::BrokerRejected` with the reason.
    async fn submit_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: Quantity,
        client_order_id: &ClientOrderId,
    ) -> Result<SubmitAck>;

    /// Query order status by client order id. `None` means the broker has
    /// no record of the id (submission never landed).
    async fn order_status(&self, client_order_id: &ClientOrderId)
    -> Result<Option<BrokerOrderStatus>>;

    /// Cancel a broker-side order.
    async fn cancel_order(&self, broker_order_id: &str) -> Result<()>;

    /// Broker name, for logs
    fn name(&self) -> &str;
}
