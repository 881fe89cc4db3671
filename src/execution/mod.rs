//! Execution layer - turns approved orders into fills.
//!
//! Two interchangeable implementations behind `ExecutionHandler`: a paper
//! venue simulation and a live broker path. Callers never branch on which
//! one is active.

pub mod live;
pub mod paper;

pub use live::LiveExecutor;
pub use paper::PaperExecutor;
