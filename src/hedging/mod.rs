//! Dynamic delta hedging.
//!
//! - `hedger`: the per-portfolio state machine that watches ticks and places
//!   offsetting orders on the hedge instrument.
//! - `manager`: lifecycle of hedger tasks (start/stop/restart/stats) and
//!   process shutdown ordering.

mod hedger;
mod manager;

pub use hedger::{
    ticker_channel, DynamicDeltaHedger, HedgerConfig, HedgerState, HedgerStats,
};
pub use manager::{HedgeInstrumentResolver, HedgingManager};
