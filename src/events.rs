//! In-process event bus and PnL sample publishing.
//!
//! External collaborators (the HTTP/WebSocket shell) subscribe to the bus to
//! observe portfolio mutations, hedger lifecycle transitions and throttled
//! PnL history updates. Publishing never blocks: the bus is a bounded
//! broadcast channel and slow subscribers simply lag.

use crate::hedging::HedgerState;
use crate::portfolio::Portfolio;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::debug;

const BUS_CAPACITY: usize = 256;

/// Default depth of the per-portfolio PnL ring buffer.
pub const DEFAULT_PNL_DEPTH: usize = 1024;

/// A single PnL observation.
#[derive(Debug, Clone, Serialize)]
pub struct PnlSample {
    pub portfolio_id: String,
    pub ts: DateTime<Utc>,
    /// Cumulative realized cash (the portfolio balance, funding included).
    pub realized: Decimal,
    /// Mark-vs-entry over all legs, in quote currency.
    pub unrealized: Decimal,
    pub net_delta: f64,
}

/// Events published on the bus.
#[derive(Debug, Clone)]
pub enum Event {
    PortfolioUpdated {
        id: String,
        portfolio: Arc<Portfolio>,
    },
    PortfolioDeleted {
        id: String,
    },
    HedgerStateChanged {
        id: String,
        from: HedgerState,
        to: HedgerState,
        reason: String,
    },
    PnlUpdate {
        id: String,
        history: Vec<PnlSample>,
    },
}

/// Cloneable handle to the process-wide event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event; a bus with no subscribers swallows it.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

struct PortfolioPnl {
    samples: VecDeque<PnlSample>,
    unpublished: usize,
}

/// Bounded per-portfolio PnL history with a throttled publisher.
///
/// `record` is cheap and unconditional; the publisher task flushes the
/// unpublished tail of each ring at most once per `publish_interval`.
pub struct PnlRecorder {
    depth: usize,
    publish_interval: Duration,
    rings: Mutex<HashMap<String, PortfolioPnl>>,
    bus: EventBus,
}

impl PnlRecorder {
    pub fn new(bus: EventBus, depth: usize, publish_interval: Duration) -> Self {
        Self {
            depth,
            publish_interval,
            rings: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Append a sample, evicting the oldest once the ring is full.
    pub async fn record(&self, sample: PnlSample) {
        let mut rings = self.rings.lock().await;
        let ring = rings
            .entry(sample.portfolio_id.clone())
            .or_insert_with(|| PortfolioPnl {
                samples: VecDeque::new(),
                unpublished: 0,
            });
        if ring.samples.len() == self.depth {
            ring.samples.pop_front();
        }
        ring.samples.push_back(sample);
        ring.unpublished = (ring.unpublished + 1).min(self.depth);
    }

    /// Current history snapshot for a portfolio.
    pub async fn history(&self, portfolio_id: &str) -> Vec<PnlSample> {
        let rings = self.rings.lock().await;
        rings
            .get(portfolio_id)
            .map(|r| r.samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn forget(&self, portfolio_id: &str) {
        self.rings.lock().await.remove(portfolio_id);
    }

    /// Flush unpublished tails onto the bus. Returns how many portfolios
    /// published.
    pub async fn flush(&self) -> usize {
        let mut rings = self.rings.lock().await;
        let mut published = 0;
        for (id, ring) in rings.iter_mut() {
            if ring.unpublished == 0 {
                continue;
            }
            let tail: Vec<PnlSample> = ring
                .samples
                .iter()
                .skip(ring.samples.len() - ring.unpublished)
                .cloned()
                .collect();
            ring.unpublished = 0;
            self.bus.publish(Event::PnlUpdate {
                id: id.clone(),
                history: tail,
            });
            published += 1;
        }
        published
    }

    /// Run the publisher loop until `stop` flips.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.publish_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let n = self.flush().await;
                    if n > 0 {
                        debug!(portfolios = n, "Published PnL updates");
                    }
                }
                _ = stop.changed() => break,
            }
        }
        // Final flush so subscribers see the last samples on shutdown.
        self.flush().await;
    }
}
