//! Configuration management for the hedging engine.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Step mode of the hysteresis band around the target delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// `step_size` is in underlying units.
    Absolute,
    /// `step_size` is a fraction of the portfolio notional in underlying
    /// units.
    Percentage,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Exchange API credentials
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Directory holding one JSON snapshot per portfolio
    #[serde(default = "default_portfolios_dir")]
    pub portfolios_dir: PathBuf,
    /// Default hedging parameters (per-portfolio overrides are applied at
    /// hedger start)
    #[serde(default)]
    pub hedging: HedgingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// API key for authentication
    #[serde(default)]
    pub key: String,
    /// Secret for signing the auth handshake
    #[serde(default)]
    pub secret: String,
    /// Use testnet instead of production
    #[serde(default = "default_testnet")]
    pub testnet: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HedgingConfig {
    /// Target net delta in underlying units
    #[serde(default)]
    pub target_delta: f64,
    /// Absolute delta threshold below which no hedge fires
    #[serde(default = "default_min_trigger_delta")]
    pub min_trigger_delta: f64,
    /// Hysteresis step mode
    #[serde(default = "default_step_mode")]
    pub step_mode: StepMode,
    /// Hysteresis step size (units depend on step_mode)
    #[serde(default = "default_step_size")]
    pub step_size: f64,
    /// Re-evaluation cadence when no tick arrives, in seconds
    #[serde(default = "default_price_check_interval")]
    pub price_check_interval: f64,
    /// Minimum USD notional per hedge order
    #[serde(default = "default_min_hedge_usd")]
    pub min_hedge_usd: Decimal,
    /// Post-fill cooldown in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// At most this many hedge orders in flight per portfolio
    #[serde(default = "default_max_concurrent_hedges")]
    pub max_concurrent_hedges: usize,
    /// Fallback annualized volatility when the ticker carries no IV
    #[serde(default = "default_volatility_fallback")]
    pub volatility_fallback: f64,
    /// Risk-free rate for the fallback pricer
    #[serde(default)]
    pub risk_free_rate: f64,
    /// Minimum seconds between PnL publishes per portfolio
    #[serde(default = "default_pnl_publish_interval")]
    pub pnl_publish_interval: f64,
    /// PnL ring buffer depth per portfolio
    #[serde(default = "default_pnl_history_depth")]
    pub pnl_history_depth: usize,
}

// Default value functions
fn default_portfolios_dir() -> PathBuf {
    PathBuf::from("portfolios")
}

fn default_testnet() -> bool {
    true
}

fn default_min_trigger_delta() -> f64 {
    0.01
}

fn default_step_mode() -> StepMode {
    StepMode::Absolute
}

fn default_step_size() -> f64 {
    0.01
}

fn default_price_check_interval() -> f64 {
    2.0
}

fn default_min_hedge_usd() -> Decimal {
    Decimal::new(10, 0) // $10
}

fn default_cooldown_ms() -> u64 {
    500
}

fn default_max_concurrent_hedges() -> usize {
    1
}

fn default_volatility_fallback() -> f64 {
    0.8
}

fn default_pnl_publish_interval() -> f64 {
    1.0
}

fn default_pnl_history_depth() -> usize {
    crate::events::DEFAULT_PNL_DEPTH
}

impl Config {
    /// Load configuration from environment variables and config files.
    ///
    /// Precedence, lowest to highest: `config.*` file, `DDH__`-prefixed
    /// environment, then the dedicated `EXCHANGE_KEY` / `EXCHANGE_SECRET` /
    /// `EXCHANGE_TESTNET` overrides.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("DDH"),
            )
            .build()
            .context("Failed to build configuration")?;

        let mut config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        if let Ok(key) = std::env::var("EXCHANGE_KEY") {
            config.exchange.key = key;
        }
        if let Ok(secret) = std::env::var("EXCHANGE_SECRET") {
            config.exchange.secret = secret;
        }
        if let Ok(testnet) = std::env::var("EXCHANGE_TESTNET") {
            config.exchange.testnet = testnet
                .parse()
                .context("EXCHANGE_TESTNET must be true or false")?;
        }

        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.hedging.min_trigger_delta >= 0.0,
            "min_trigger_delta must be non-negative"
        );

        anyhow::ensure!(
            self.hedging.step_size > 0.0,
            "step_size must be positive"
        );

        anyhow::ensure!(
            self.hedging.price_check_interval > 0.0,
            "price_check_interval must be positive"
        );

        anyhow::ensure!(
            self.hedging.min_hedge_usd >= Decimal::ZERO,
            "min_hedge_usd must be non-negative"
        );

        anyhow::ensure!(
            self.hedging.max_concurrent_hedges == 1,
            "max_concurrent_hedges other than 1 is not supported"
        );

        anyhow::ensure!(
            self.hedging.volatility_fallback > 0.0,
            "volatility_fallback must be positive"
        );

        anyhow::ensure!(
            self.hedging.pnl_history_depth > 0,
            "pnl_history_depth must be positive"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            portfolios_dir: default_portfolios_dir(),
            hedging: HedgingConfig::default(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            secret: String::new(),
            testnet: default_testnet(),
        }
    }
}

impl Default for HedgingConfig {
    fn default() -> Self {
        Self {
            target_delta: 0.0,
            min_trigger_delta: default_min_trigger_delta(),
            step_mode: default_step_mode(),
            step_size: default_step_size(),
            price_check_interval: default_price_check_interval(),
            min_hedge_usd: default_min_hedge_usd(),
            cooldown_ms: default_cooldown_ms(),
            max_concurrent_hedges: default_max_concurrent_hedges(),
            volatility_fallback: default_volatility_fallback(),
            risk_free_rate: 0.0,
            pnl_publish_interval: default_pnl_publish_interval(),
            pnl_history_depth: default_pnl_history_depth(),
        }
    }
}
