//! Venue-agnostic trait for the exchange session.
//!
//! The hedging engine and the subscription manager consume this seam rather
//! than the concrete client, which keeps hedger fleets testable against the
//! mock venue.

use super::types::{
    AccountSummary, ConnectionState, ExchangeError, InstrumentInfo, MarketTick, OrderAck,
    OrderRequest, VenuePosition,
};
use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

/// Authenticated duplex exchange session.
///
/// Implementations guarantee at-most-once order semantics keyed by the
/// request `label`, and a single writer to the underlying socket.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Subscribe to a server-side channel; the returned receiver observes
    /// the channel's FIFO tick stream. Subscribing twice to the same channel
    /// returns a second receiver on the same upstream subscription.
    async fn subscribe(&self, channel: &str)
        -> Result<broadcast::Receiver<MarketTick>, ExchangeError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), ExchangeError>;

    /// Place an order. Refuses with `Transport { retryable: true }` while the
    /// session is reconnecting so no duplicate order can be created.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError>;

    /// Look up an order by its idempotency label; `None` if the venue never
    /// saw it.
    async fn get_order(&self, label: &str) -> Result<Option<OrderAck>, ExchangeError>;

    async fn get_position(&self, instrument: &str) -> Result<VenuePosition, ExchangeError>;

    async fn get_account_summary(&self, currency: &str)
        -> Result<AccountSummary, ExchangeError>;

    async fn get_open_orders(&self) -> Result<Vec<OrderAck>, ExchangeError>;

    async fn get_instrument(&self, instrument: &str) -> Result<InstrumentInfo, ExchangeError>;

    /// Watch connection transitions; hedgers fall back to warm-up and
    /// reconcile when the session drops.
    fn connection_events(&self) -> watch::Receiver<ConnectionState>;

    /// Tear the session down for process shutdown.
    async fn close(&self);
}
