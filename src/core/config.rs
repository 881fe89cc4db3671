//! Configuration - type-safe, validated config

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application settings
    pub app: AppConfig,

    /// Paper execution simulation
    pub paper: PaperConfig,

    /// Broker call budgets for live execution
    pub broker: BrokerConfig,

    /// Default risk limits applied when a strategy registers without its own
    pub risk_defaults: RiskLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Run mode: paper or live
    pub mode: RunMode,

    /// Log level
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Paper,
    Live,
}

/// Paper venue simulation knobs. All randomness flows from `seed` so test
/// runs are reproducible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    /// Slippage fraction, adverse to the trader (0.0005 = 0.05%)
    pub slippage: Decimal,

    /// Commission fraction of fill notional
    pub commission: Decimal,

    /// Probability of a partial fill per execution attempt (0.0-1.0)
    pub partial_fill_prob: f64,

    /// Simulated network delay bounds, milliseconds
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,

    /// RNG seed; None seeds from entropy
    pub seed: Option<u64>,
}

/// Live broker call budgets. Attempts are always bounded; a timeout is
/// followed by reconciliation, never a blind resubmit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Per-call timeout, milliseconds
    pub call_timeout_ms: u64,

    /// Max submission attempts (after reconciliation confirms non-existence)
    pub max_submit_attempts: u32,

    /// Max status polls while waiting for a fill
    pub max_status_polls: u32,

    /// Backoff base delay, milliseconds
    pub base_delay_ms: u64,

    /// Backoff ceiling, milliseconds
    pub max_delay_ms: u64,

    /// Jitter as a fraction of the computed delay
    pub jitter_factor: f64,
}

/// Per-strategy risk limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Max realized loss per day (currency)
    pub max_daily_loss: Decimal,

    /// Max trades per day
    pub max_trades_per_day: u32,

    /// Max open position size (currency notional)
    pub max_position_size: Decimal,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig {
                mode: RunMode::Paper,
                log_level: "info".to_string(),
            },
            paper: PaperConfig {
                slippage: Decimal::new(5, 4),   // 0.05%
                commission: Decimal::new(5, 4), // 0.05%
                partial_fill_prob: 0.10,
                min_delay_ms: 10,
                max_delay_ms: 50,
                seed: None,
            },
            broker: BrokerConfig {
                call_timeout_ms: 2_000,
                max_submit_attempts: 3,
                max_status_polls: 5,
                base_delay_ms: 100,
                max_delay_ms: 5_000,
                jitter_factor: 0.3,
            },
            risk_defaults: RiskLimits {
                max_daily_loss: Decimal::from(5_000),
                max_trades_per_day: 50,
                max_position_size: Decimal::from(100_000),
            },
        }
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: &PathBuf) -> crate::core::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::core::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::core::Error::Config(format!("Failed to parse config: {}", e)))
    }
}
