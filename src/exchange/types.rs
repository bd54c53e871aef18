//! Type definitions for the venue wire protocol (JSON-RPC over WebSocket).

use crate::portfolio::SettlementStyle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Exchange failure taxonomy.
///
/// `Transport { retryable: true }` covers everything that a reconnect or a
/// later retry can fix; auth failures are fatal and surface to the host.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExchangeError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("authentication required")]
    AuthRequired,
    #[error("rejected by venue ({code}): {msg}")]
    Rejected { code: i64, msg: String, retryable: bool },
    #[error("transport failure (retryable: {retryable}): {msg}")]
    Transport { retryable: bool, msg: String },
}

impl ExchangeError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            retryable: true,
            msg: msg.into(),
        }
    }

    /// Whether a later retry of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::RateLimited => true,
            Self::AuthRequired => false,
            Self::Rejected { retryable, .. } => *retryable,
            Self::Transport { retryable, .. } => *retryable,
        }
    }

    /// Map a JSON-RPC error object to the taxonomy.
    pub fn from_rpc(code: i64, msg: String) -> Self {
        match code {
            13004 | 13009 | 13010 | 13777 => Self::AuthRequired,
            10028 | 10047 => Self::RateLimited,
            // Order-book unavailable, settlement in progress, price moved:
            // worth retrying the same order.
            10041 | 10043 | 10044 | 11044 => Self::Rejected {
                code,
                msg,
                retryable: true,
            },
            _ => Self::Rejected {
                code,
                msg,
                retryable: false,
            },
        }
    }
}

/// Connection state observed by consumers of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

/// Order type; hedge orders default to market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Venue-side order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Open,
    Filled,
    Cancelled,
    Rejected,
}

/// An order to submit.
///
/// `label` is the client-generated idempotency token, round-tripped on all
/// order-state events; replaying the same label never creates a second venue
/// order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: Side,
    pub quantity: Decimal,
    pub order_type: OrderType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    pub reduce_only: bool,
    pub label: String,
}

/// Acknowledged order status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub label: String,
    pub instrument: String,
    pub side: Side,
    pub state: OrderState,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_price: Option<Decimal>,
}

/// Normalized market-data tick for one instrument.
///
/// Ticks are FIFO within a single instrument stream; `delta`/`iv` are only
/// present for option instruments.
#[derive(Debug, Clone)]
pub struct MarketTick {
    pub instrument: String,
    pub mark_price: Decimal,
    pub index_price: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub timestamp_ms: i64,
    pub delta: Option<f64>,
    pub iv: Option<f64>,
    /// The venue reported the instrument de-listed (expired).
    pub closed: bool,
}

/// Venue-reported position.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VenuePosition {
    #[serde(rename = "instrument_name")]
    pub instrument: String,
    /// Signed size in underlying units.
    #[serde(default)]
    pub size: Decimal,
    #[serde(default)]
    pub average_price: Decimal,
}

/// Venue-reported account summary.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountSummary {
    pub currency: String,
    #[serde(default)]
    pub equity: Decimal,
    #[serde(default)]
    pub available_funds: Decimal,
}

/// Static instrument metadata needed for hedge sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentInfo {
    #[serde(rename = "instrument_name")]
    pub instrument: String,
    /// Minimum tradeable quantity increment, in underlying units.
    #[serde(rename = "min_trade_amount")]
    pub lot_size: Decimal,
    #[serde(default)]
    pub tick_size: Decimal,
    #[serde(default = "default_settlement")]
    pub settlement: SettlementStyle,
}

fn default_settlement() -> SettlementStyle {
    SettlementStyle::Linear
}

// ---------------------------------------------------------------------------
// JSON-RPC framing
// ---------------------------------------------------------------------------

/// Outbound JSON-RPC request frame.
#[derive(Debug, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// Inbound frame: either a correlated response or a subscription push.
#[derive(Debug, Deserialize)]
pub struct RpcInbound {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<RpcErrorObject>,
    pub method: Option<String>,
    pub params: Option<SubscriptionParams>,
}

#[derive(Debug, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionParams {
    pub channel: String,
    pub data: Value,
}

/// Ticker channel payload, as pushed by the venue.
#[derive(Debug, Deserialize)]
pub struct TickerData {
    pub instrument_name: String,
    pub mark_price: Decimal,
    #[serde(default)]
    pub index_price: Decimal,
    #[serde(default)]
    pub best_bid_price: Option<Decimal>,
    #[serde(default)]
    pub best_ask_price: Option<Decimal>,
    pub timestamp: i64,
    #[serde(default)]
    pub greeks: Option<TickerGreeks>,
    /// Percent IV (80.0 = 80%).
    #[serde(default)]
    pub mark_iv: Option<f64>,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TickerGreeks {
    pub delta: f64,
}

impl From<TickerData> for MarketTick {
    fn from(data: TickerData) -> Self {
        let closed = data.state.as_deref() == Some("closed");
        MarketTick {
            instrument: data.instrument_name,
            mark_price: data.mark_price,
            index_price: data.index_price,
            bid: data.best_bid_price,
            ask: data.best_ask_price,
            timestamp_ms: data.timestamp,
            delta: data.greeks.map(|g| g.delta),
            iv: data.mark_iv.map(|iv| if iv > 3.0 { iv / 100.0 } else { iv }),
            closed,
        }
    }
}

/// Order payload inside `private/buy`/`private/sell` responses and
/// `get_order_state` results.
#[derive(Debug, Deserialize)]
pub struct OrderData {
    pub order_id: String,
    #[serde(default)]
    pub label: String,
    pub instrument_name: String,
    pub direction: Side,
    pub order_state: OrderState,
    pub amount: Decimal,
    #[serde(default)]
    pub filled_amount: Decimal,
    #[serde(default)]
    pub average_price: Option<Decimal>,
}

impl From<OrderData> for OrderAck {
    fn from(data: OrderData) -> Self {
        OrderAck {
            order_id: data.order_id,
            label: data.label,
            instrument: data.instrument_name,
            side: data.direction,
            state: data.order_state,
            quantity: data.amount,
            filled_quantity: data.filled_amount,
            avg_price: data.average_price,
        }
    }
}
