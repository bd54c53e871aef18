//! Mock venue for tests.
//!
//! Implements [`ExchangeApi`] over in-memory state: ticks are injected with
//! [`MockExchange::push_tick`], order outcomes follow a scripted queue
//! (default: instant fill at the scripted price), and idempotency labels are
//! honored the way the real venue honors them: replaying a label returns
//! the original order instead of creating a new one.

use super::traits::ExchangeApi;
use super::types::*;
use crate::portfolio::SettlementStyle;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::debug;

const MOCK_STREAM_CAPACITY: usize = 64;

/// Scripted outcome for the next `place_order` call.
#[derive(Debug, Clone)]
pub enum PlannedOutcome {
    /// Fill the full quantity at this price.
    Fill { price: Decimal },
    /// Fill only part of the quantity, cancel the rest.
    PartialFill { price: Decimal, filled: Decimal },
    /// Venue rejects the order.
    Reject { retryable: bool },
    /// The transport drops before an ack arrives.
    TransportError,
    /// The order reaches the venue but the ack is withheld for `delay_ms`;
    /// a caller that gives up observes the fill via `get_order`.
    DelayedFill { price: Decimal, delay_ms: u64 },
}

#[derive(Default)]
struct MockState {
    streams: HashMap<String, broadcast::Sender<MarketTick>>,
    subscribe_calls: HashMap<String, u32>,
    unsubscribe_calls: HashMap<String, u32>,
    orders_by_label: HashMap<String, OrderAck>,
    order_log: Vec<OrderRequest>,
    outcomes: VecDeque<PlannedOutcome>,
    positions: HashMap<String, VenuePosition>,
    instruments: HashMap<String, InstrumentInfo>,
    prices: HashMap<String, Decimal>,
}

/// In-memory venue double.
pub struct MockExchange {
    state: Arc<RwLock<MockState>>,
    order_counter: AtomicU64,
    conn_tx: watch::Sender<ConnectionState>,
}

impl MockExchange {
    pub fn new() -> Self {
        let (conn_tx, _) = watch::channel(ConnectionState::Connected);
        Self {
            state: Arc::new(RwLock::new(MockState::default())),
            order_counter: AtomicU64::new(1),
            conn_tx,
        }
    }

    /// Register instrument metadata used for hedge sizing.
    pub async fn set_instrument(
        &self,
        name: &str,
        lot_size: Decimal,
        settlement: SettlementStyle,
    ) {
        self.state.write().await.instruments.insert(
            name.to_string(),
            InstrumentInfo {
                instrument: name.to_string(),
                lot_size,
                tick_size: Decimal::ZERO,
                settlement,
            },
        );
    }

    /// Last-trade price used to fill orders with no scripted price.
    pub async fn set_price(&self, instrument: &str, price: Decimal) {
        self.state
            .write()
            .await
            .prices
            .insert(instrument.to_string(), price);
    }

    pub async fn set_position(&self, instrument: &str, size: Decimal, avg_price: Decimal) {
        self.state.write().await.positions.insert(
            instrument.to_string(),
            VenuePosition {
                instrument: instrument.to_string(),
                size,
                average_price: avg_price,
            },
        );
    }

    /// Queue a scripted outcome for an upcoming order.
    pub async fn plan_outcome(&self, outcome: PlannedOutcome) {
        self.state.write().await.outcomes.push_back(outcome);
    }

    /// Inject a tick into a channel's stream.
    pub async fn push_tick(&self, channel: &str, tick: MarketTick) {
        if let Some(tx) = self.state.read().await.streams.get(channel) {
            let _ = tx.send(tick);
        }
    }

    /// Flip the reported connection state (reconnect tests).
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.conn_tx.send_replace(state);
    }

    pub async fn subscribe_calls(&self, channel: &str) -> u32 {
        self.state
            .read()
            .await
            .subscribe_calls
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    pub async fn unsubscribe_calls(&self, channel: &str) -> u32 {
        self.state
            .read()
            .await
            .unsubscribe_calls
            .get(channel)
            .copied()
            .unwrap_or(0)
    }

    pub async fn is_subscribed(&self, channel: &str) -> bool {
        self.state.read().await.streams.contains_key(channel)
    }

    /// All order requests the venue has seen, in submission order.
    pub async fn order_log(&self) -> Vec<OrderRequest> {
        self.state.read().await.order_log.clone()
    }

    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders_by_label.len()
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<broadcast::Receiver<MarketTick>, ExchangeError> {
        let mut state = self.state.write().await;
        *state.subscribe_calls.entry(channel.to_string()).or_insert(0) += 1;
        let tx = state
            .streams
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(MOCK_STREAM_CAPACITY).0);
        Ok(tx.subscribe())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.write().await;
        *state
            .unsubscribe_calls
            .entry(channel.to_string())
            .or_insert(0) += 1;
        state.streams.remove(channel);
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        if *self.conn_tx.borrow() != ConnectionState::Connected {
            return Err(ExchangeError::transport("reconnecting, order refused"));
        }

        let mut state = self.state.write().await;

        // Idempotency: a replayed label never creates a second venue order.
        if let Some(existing) = state.orders_by_label.get(&request.label) {
            debug!(label = %request.label, "Replayed label, returning existing order");
            return Ok(existing.clone());
        }

        let outcome = state
            .outcomes
            .pop_front()
            .unwrap_or(PlannedOutcome::Fill {
                price: state
                    .prices
                    .get(&request.instrument)
                    .copied()
                    .unwrap_or(Decimal::ONE),
            });

        state.order_log.push(request.clone());

        let (fill_state, filled, price, delay) = match outcome {
            PlannedOutcome::Fill { price } => (OrderState::Filled, request.quantity, price, None),
            PlannedOutcome::PartialFill { price, filled } => {
                (OrderState::Cancelled, filled, price, None)
            }
            PlannedOutcome::DelayedFill { price, delay_ms } => (
                OrderState::Filled,
                request.quantity,
                price,
                Some(std::time::Duration::from_millis(delay_ms)),
            ),
            PlannedOutcome::Reject { retryable } => {
                return Err(ExchangeError::Rejected {
                    code: if retryable { 10041 } else { 10009 },
                    msg: "scripted rejection".to_string(),
                    retryable,
                });
            }
            PlannedOutcome::TransportError => {
                return Err(ExchangeError::transport("scripted transport failure"));
            }
        };

        let ack = OrderAck {
            order_id: format!("mock-{}", self.order_counter.fetch_add(1, Ordering::SeqCst)),
            label: request.label.clone(),
            instrument: request.instrument.clone(),
            side: request.side,
            state: fill_state,
            quantity: request.quantity,
            filled_quantity: filled,
            avg_price: Some(price),
        };

        // Keep the venue position in sync with fills.
        let signed = match request.side {
            Side::Buy => filled,
            Side::Sell => -filled,
        };
        let position = state
            .positions
            .entry(request.instrument.clone())
            .or_insert_with(|| VenuePosition {
                instrument: request.instrument.clone(),
                size: Decimal::ZERO,
                average_price: Decimal::ZERO,
            });
        position.size += signed;
        position.average_price = price;

        state
            .orders_by_label
            .insert(request.label.clone(), ack.clone());
        drop(state);

        // The fill is already venue-visible; only the ack is withheld.
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ack)
    }

    async fn get_order(&self, label: &str) -> Result<Option<OrderAck>, ExchangeError> {
        Ok(self.state.read().await.orders_by_label.get(label).cloned())
    }

    async fn get_position(&self, instrument: &str) -> Result<VenuePosition, ExchangeError> {
        Ok(self
            .state
            .read()
            .await
            .positions
            .get(instrument)
            .cloned()
            .unwrap_or_else(|| VenuePosition {
                instrument: instrument.to_string(),
                size: Decimal::ZERO,
                average_price: Decimal::ZERO,
            }))
    }

    async fn get_account_summary(
        &self,
        currency: &str,
    ) -> Result<AccountSummary, ExchangeError> {
        Ok(AccountSummary {
            currency: currency.to_string(),
            equity: Decimal::ZERO,
            available_funds: Decimal::ZERO,
        })
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderAck>, ExchangeError> {
        Ok(self
            .state
            .read()
            .await
            .orders_by_label
            .values()
            .filter(|ack| ack.state == OrderState::Open)
            .cloned()
            .collect())
    }

    async fn get_instrument(&self, instrument: &str) -> Result<InstrumentInfo, ExchangeError> {
        self.state
            .read()
            .await
            .instruments
            .get(instrument)
            .cloned()
            .ok_or_else(|| ExchangeError::Rejected {
                code: 11010,
                msg: format!("instrument not found: {instrument}"),
                retryable: false,
            })
    }

    fn connection_events(&self) -> watch::Receiver<ConnectionState> {
        self.conn_tx.subscribe()
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(label: &str, quantity: Decimal) -> OrderRequest {
        OrderRequest {
            instrument: "BTC-PERPETUAL".to_string(),
            side: Side::Buy,
            quantity,
            order_type: OrderType::Market,
            price: None,
            reduce_only: false,
            label: label.to_string(),
        }
    }

    #[tokio::test]
    async fn fills_at_scripted_price_and_tracks_position() {
        let venue = MockExchange::new();
        venue.set_price("BTC-PERPETUAL", dec!(30000)).await;

        let ack = venue.place_order(&order("h:p1:1", dec!(5))).await.unwrap();
        assert_eq!(ack.state, OrderState::Filled);
        assert_eq!(ack.filled_quantity, dec!(5));
        assert_eq!(ack.avg_price, Some(dec!(30000)));

        let position = venue.get_position("BTC-PERPETUAL").await.unwrap();
        assert_eq!(position.size, dec!(5));
    }

    #[tokio::test]
    async fn replayed_label_never_creates_second_order() {
        let venue = MockExchange::new();
        venue.set_price("BTC-PERPETUAL", dec!(30000)).await;

        let first = venue.place_order(&order("h:p1:1", dec!(5))).await.unwrap();
        let second = venue.place_order(&order("h:p1:1", dec!(5))).await.unwrap();

        assert_eq!(first.order_id, second.order_id);
        assert_eq!(venue.order_count().await, 1);
        // Position reflects a single fill.
        let position = venue.get_position("BTC-PERPETUAL").await.unwrap();
        assert_eq!(position.size, dec!(5));
    }

    #[tokio::test]
    async fn scripted_rejection_and_recovery() {
        let venue = MockExchange::new();
        venue.set_price("BTC-PERPETUAL", dec!(30000)).await;
        venue
            .plan_outcome(PlannedOutcome::Reject { retryable: true })
            .await;

        let err = venue.place_order(&order("h:p1:1", dec!(1))).await.unwrap_err();
        assert!(err.is_retryable());

        // Next attempt under a fresh label succeeds.
        let ack = venue.place_order(&order("h:p1:2", dec!(1))).await.unwrap();
        assert_eq!(ack.state, OrderState::Filled);
    }

    #[tokio::test]
    async fn refuses_orders_while_reconnecting() {
        let venue = MockExchange::new();
        venue.set_connection_state(ConnectionState::Reconnecting);
        let err = venue.place_order(&order("h:p1:1", dec!(1))).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Transport { .. }));
    }

    #[tokio::test]
    async fn tick_injection_reaches_subscribers() {
        let venue = MockExchange::new();
        let mut rx = venue.subscribe("ticker.BTC-PERPETUAL.100ms").await.unwrap();
        venue
            .push_tick(
                "ticker.BTC-PERPETUAL.100ms",
                MarketTick {
                    instrument: "BTC-PERPETUAL".to_string(),
                    mark_price: dec!(30000),
                    index_price: dec!(30000),
                    bid: None,
                    ask: None,
                    timestamp_ms: 1,
                    delta: None,
                    iv: None,
                    closed: false,
                },
            )
            .await;
        assert_eq!(rx.recv().await.unwrap().mark_price, dec!(30000));
    }
}
