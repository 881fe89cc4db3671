//! OrderGate - Event-driven trading core
//! Routes trading intent from strategy rules to the broker through gated,
//! auditable steps.

// Public modules
pub mod core;
pub mod events;
pub mod bus;
pub mod rules;
pub mod risk;
pub mod orders;
pub mod execution;
pub mod engine;

// Re-exports
pub use core::{Config, Error, Result};
pub use engine::{StrategySpec, TradingEngine};
