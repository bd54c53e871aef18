//! # Deribit Delta Hedger
//!
//! An automated delta-hedging engine for options portfolios on Deribit-family
//! venues. Each registered portfolio is kept at its target net delta by an
//! independent hedger that offsets option exposure with a futures/perpetual
//! position on the same underlying.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Venue client (WebSocket JSON-RPC) and the mock venue
//! - `market`: Reference-counted fan-out of instrument tick streams
//! - `portfolio`: Portfolio model and the file-backed store
//! - `pricing`: Black-Scholes fallback pricer behind a capability trait
//! - `hedging`: The per-portfolio hedger state machine and its manager
//! - `events`: In-process event bus and PnL sample publishing

pub mod config;
pub mod events;
pub mod exchange;
pub mod hedging;
pub mod market;
pub mod portfolio;
pub mod pricing;

pub use config::Config;
