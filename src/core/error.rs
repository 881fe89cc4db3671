//! Error handling - crate-wide error hierarchy

use thiserror::Error;

use crate::core::types::OrderStatus;

pub type Result<T> = std::result::Result<T, Error>;

/// OrderGate error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or unsafe rule document, rejected at registration
    #[error("Rule parse error: {0}")]
    RuleParse(String),

    /// Indicator missing from a market snapshot at evaluation time
    #[error("Unknown indicator: {0}")]
    UnknownIndicator(String),

    /// Transient broker transport failure (timeout, connection loss)
    #[error("Broker transport error: {0}")]
    BrokerTransport(String),

    /// Terminal broker rejection, reason preserved for audit
    #[error("Broker rejected order: {0}")]
    BrokerRejected(String),

    /// Order lifecycle violation - a bug or a duplicate/late event
    #[error("Invalid transition for order {client_order_id}: {from:?} -> {attempted}")]
    InvalidTransition {
        client_order_id: String,
        from: OrderStatus,
        attempted: &'static str,
    },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Transient errors may be retried after reconciliation; all others are final.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::BrokerTransport(_))
    }
}
