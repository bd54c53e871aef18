//! Deribit WebSocket JSON-RPC client.
//!
//! A single duplex session carries both correlated request/response calls and
//! server-pushed subscription streams. Exactly one task writes to the socket;
//! a dispatcher routes inbound frames to pending calls (by correlation id) or
//! to stream broadcasters (by channel name). A supervisor reconnects with
//! jittered exponential backoff, re-authenticates, re-subscribes every active
//! channel and runs a reconciliation sweep before the session is reported
//! healthy again.

use super::traits::ExchangeApi;
use super::types::*;
use crate::config::ExchangeConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

const MAINNET_WS_URL: &str = "wss://www.deribit.com/ws/api/v2";
const TESTNET_WS_URL: &str = "wss://test.deribit.com/ws/api/v2";

const CALL_TIMEOUT: Duration = Duration::from_secs(10);
const ORDER_TIMEOUT: Duration = Duration::from_secs(15);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_MISSED_HEARTBEATS: u32 = 2;
const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
/// Outstanding call table bound; overflow fails new calls fast.
const MAX_PENDING_CALLS: usize = 256;
const STREAM_CAPACITY: usize = 512;

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

struct ClientShared {
    url: String,
    key: String,
    secret: String,
    next_id: AtomicU64,
    pending: StdMutex<HashMap<u64, oneshot::Sender<Result<Value, ExchangeError>>>>,
    /// Channel broadcasters survive reconnects so downstream receivers stay
    /// valid across a transport flap.
    streams: StdMutex<HashMap<String, broadcast::Sender<MarketTick>>>,
    writer: StdMutex<Option<mpsc::Sender<Message>>>,
    conn_tx: watch::Sender<ConnectionState>,
    shutdown: AtomicBool,
}

/// Deribit-family venue client.
pub struct DeribitClient {
    shared: Arc<ClientShared>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl DeribitClient {
    pub fn new(config: &ExchangeConfig) -> Self {
        let url = if config.testnet {
            TESTNET_WS_URL.to_string()
        } else {
            MAINNET_WS_URL.to_string()
        };
        let (conn_tx, _) = watch::channel(ConnectionState::Reconnecting);
        Self {
            shared: Arc::new(ClientShared {
                url,
                key: config.key.clone(),
                secret: config.secret.clone(),
                next_id: AtomicU64::new(1),
                pending: StdMutex::new(HashMap::new()),
                streams: StdMutex::new(HashMap::new()),
                writer: StdMutex::new(None),
                conn_tx,
                shutdown: AtomicBool::new(false),
            }),
            supervisor: StdMutex::new(None),
        }
    }

    /// Establish the session and start the reconnect supervisor.
    ///
    /// The first connection and auth handshake happen inline so a bad key
    /// surfaces to the caller instead of looping forever in the background.
    pub async fn connect(&self) -> Result<(), ExchangeError> {
        let session = Session::open(self.shared.clone()).await?;
        self.shared
            .conn_tx
            .send_replace(ConnectionState::Connected);
        info!(url = %self.shared.url, "Exchange session established");

        let shared = self.shared.clone();
        let handle = tokio::spawn(supervise(shared, session));
        *self.supervisor.lock().expect("supervisor lock") = Some(handle);
        Ok(())
    }
}

/// Session lifecycle: run until the reader or the heartbeat dies, then
/// reconnect with jittered backoff, re-auth, re-subscribe, reconcile.
async fn supervise(shared: Arc<ClientShared>, first: Session) {
    let mut session = first;
    let mut backoff = RECONNECT_INITIAL;

    loop {
        session.run().await;
        drop_writer(&shared);
        fail_pending(&shared, "connection lost");

        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        shared
            .conn_tx
            .send_replace(ConnectionState::Reconnecting);
        warn!("Exchange session lost, reconnecting");

        loop {
            let jitter = {
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(0..250))
            };
            tokio::time::sleep(backoff + jitter).await;
            backoff = (backoff * 2).min(RECONNECT_CAP);

            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }

            match Session::open(shared.clone()).await {
                Ok(next) => match restore(&shared).await {
                    Ok(()) => {
                        backoff = RECONNECT_INITIAL;
                        shared.conn_tx.send_replace(ConnectionState::Connected);
                        info!("Exchange session re-established");
                        session = next;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to restore subscriptions after reconnect");
                        next.shutdown();
                        drop_writer(&shared);
                    }
                },
                Err(e) => {
                    error!(error = %e, backoff_ms = backoff.as_millis() as u64, "Reconnect attempt failed");
                }
            }
        }
    }
}

/// Re-subscribe active channels and sweep venue state so local bookkeeping
/// can converge before hedgers leave warm-up.
async fn restore(shared: &Arc<ClientShared>) -> Result<(), ExchangeError> {
    let channels: Vec<String> = shared
        .streams
        .lock()
        .expect("streams lock")
        .keys()
        .cloned()
        .collect();
    if !channels.is_empty() {
        raw_call(
            shared,
            "public/subscribe",
            json!({ "channels": channels.clone() }),
            CALL_TIMEOUT,
        )
        .await?;
        info!(channels = channels.len(), "Re-subscribed active channels");
    }

    let open_orders = raw_call(shared, "private/get_open_orders", json!({}), CALL_TIMEOUT).await?;
    let positions = raw_call(shared, "private/get_positions", json!({}), CALL_TIMEOUT).await?;
    debug!(
        open_orders = open_orders.as_array().map(|a| a.len()).unwrap_or(0),
        positions = positions.as_array().map(|a| a.len()).unwrap_or(0),
        "Reconciliation sweep complete"
    );
    Ok(())
}

fn drop_writer(shared: &Arc<ClientShared>) {
    *shared.writer.lock().expect("writer lock") = None;
}

fn fail_pending(shared: &Arc<ClientShared>, reason: &str) {
    let mut pending = shared.pending.lock().expect("pending lock");
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(ExchangeError::transport(reason)));
    }
}

struct Session {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl Session {
    /// Connect, start the writer/reader/heartbeat tasks and authenticate.
    async fn open(shared: Arc<ClientShared>) -> Result<Self, ExchangeError> {
        let (ws, _) = connect_async(&shared.url)
            .await
            .map_err(|e| ExchangeError::transport(format!("connect failed: {e}")))?;
        let (sink, mut stream) = ws.split();

        let (write_tx, write_rx) = mpsc::channel::<Message>(64);
        let writer = tokio::spawn(write_loop(write_rx, sink));

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => dispatch(&reader_shared, &text),
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => {
                        debug!("Server closed the websocket");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Websocket read error");
                        break;
                    }
                    _ => {}
                }
            }
        });

        *shared.writer.lock().expect("writer lock") = Some(write_tx);

        if let Err(e) = authenticate(&shared).await {
            reader.abort();
            writer.abort();
            *shared.writer.lock().expect("writer lock") = None;
            return Err(e);
        }

        let heartbeat = tokio::spawn(heartbeat_loop(shared.clone()));

        Ok(Self {
            reader,
            writer,
            heartbeat,
        })
    }

    /// Wait until the reader or the heartbeat gives up, then stop everything.
    async fn run(mut self) {
        tokio::select! {
            _ = &mut self.reader => {}
            _ = &mut self.heartbeat => {}
        }
        self.shutdown();
    }

    fn shutdown(self) {
        self.reader.abort();
        self.writer.abort();
        self.heartbeat.abort();
    }
}

async fn write_loop(mut rx: mpsc::Receiver<Message>, mut sink: WsSink) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            warn!(error = %e, "Websocket write error");
            break;
        }
    }
    let _ = sink.close().await;
}

/// Client-initiated ping; two consecutive misses tear the session down.
async fn heartbeat_loop(shared: Arc<ClientShared>) {
    let mut missed: u32 = 0;
    loop {
        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
        match raw_call(&shared, "public/test", json!({}), HEARTBEAT_TIMEOUT).await {
            Ok(_) => missed = 0,
            Err(e) => {
                missed += 1;
                warn!(missed, error = %e, "Heartbeat missed");
                if missed >= MAX_MISSED_HEARTBEATS {
                    error!("Heartbeat dead, tearing session down");
                    return;
                }
            }
        }
    }
}

/// Route an inbound frame to the pending call table or a stream broadcaster.
fn dispatch(shared: &Arc<ClientShared>, text: &str) {
    let inbound: RpcInbound = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "Unparseable frame");
            return;
        }
    };

    if let Some(id) = inbound.id {
        let waiter = shared.pending.lock().expect("pending lock").remove(&id);
        if let Some(tx) = waiter {
            let outcome = match (inbound.result, inbound.error) {
                (_, Some(err)) => Err(ExchangeError::from_rpc(err.code, err.message)),
                (Some(value), None) => Ok(value),
                (None, None) => Ok(Value::Null),
            };
            let _ = tx.send(outcome);
        }
        return;
    }

    if inbound.method.as_deref() == Some("subscription") {
        let Some(params) = inbound.params else { return };
        if !params.channel.starts_with("ticker.") {
            return;
        }
        match serde_json::from_value::<TickerData>(params.data) {
            Ok(data) => {
                let tick = MarketTick::from(data);
                if let Some(tx) = shared
                    .streams
                    .lock()
                    .expect("streams lock")
                    .get(&params.channel)
                {
                    let _ = tx.send(tick);
                }
            }
            Err(e) => debug!(channel = %params.channel, error = %e, "Unparseable ticker payload"),
        }
    }
}

/// Send one correlated request and await its response.
async fn raw_call(
    shared: &Arc<ClientShared>,
    method: &str,
    params: Value,
    timeout: Duration,
) -> Result<Value, ExchangeError> {
    let writer = shared
        .writer
        .lock()
        .expect("writer lock")
        .clone()
        .ok_or_else(|| ExchangeError::transport("not connected"))?;

    let (tx, rx) = oneshot::channel();
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    {
        let mut pending = shared.pending.lock().expect("pending lock");
        if pending.len() >= MAX_PENDING_CALLS {
            return Err(ExchangeError::RateLimited);
        }
        pending.insert(id, tx);
    }

    let frame = serde_json::to_string(&RpcRequest::new(id, method, params))
        .map_err(|e| ExchangeError::transport(format!("encode failed: {e}")))?;
    if writer.send(Message::Text(frame)).await.is_err() {
        shared.pending.lock().expect("pending lock").remove(&id);
        return Err(ExchangeError::transport("writer closed"));
    }

    match tokio::time::timeout(timeout, rx).await {
        Err(_) => {
            shared.pending.lock().expect("pending lock").remove(&id);
            Err(ExchangeError::Timeout)
        }
        Ok(Err(_)) => Err(ExchangeError::transport("connection lost")),
        Ok(Ok(result)) => result,
    }
}

/// `client_signature` grant: HMAC-SHA256 over `timestamp\nnonce\n`.
async fn authenticate(shared: &Arc<ClientShared>) -> Result<(), ExchangeError> {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let nonce: String = {
        let mut rng = rand::thread_rng();
        (0..8).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
    };
    let signature = sign(&shared.secret, &format!("{timestamp}\n{nonce}\n"));

    let params = json!({
        "grant_type": "client_signature",
        "client_id": shared.key,
        "timestamp": timestamp,
        "nonce": nonce,
        "data": "",
        "signature": signature,
    });

    match raw_call(shared, "public/auth", params, CALL_TIMEOUT).await {
        Ok(_) => {
            debug!("Authenticated");
            Ok(())
        }
        Err(e @ ExchangeError::Timeout) | Err(e @ ExchangeError::Transport { .. }) => Err(e),
        Err(_) => Err(ExchangeError::AuthRequired),
    }
}

fn sign(secret: &str, payload: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[derive(serde::Deserialize)]
struct OrderPlacement {
    order: OrderData,
}

#[async_trait]
impl ExchangeApi for DeribitClient {
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<broadcast::Receiver<MarketTick>, ExchangeError> {
        let (is_new, rx) = {
            let mut streams = self.shared.streams.lock().expect("streams lock");
            match streams.get(channel) {
                Some(tx) => (false, tx.subscribe()),
                None => {
                    let (tx, rx) = broadcast::channel(STREAM_CAPACITY);
                    streams.insert(channel.to_string(), tx);
                    (true, rx)
                }
            }
        };

        if is_new {
            if let Err(e) = raw_call(
                &self.shared,
                "public/subscribe",
                json!({ "channels": [channel] }),
                CALL_TIMEOUT,
            )
            .await
            {
                self.shared
                    .streams
                    .lock()
                    .expect("streams lock")
                    .remove(channel);
                return Err(e);
            }
            debug!(%channel, "Subscribed");
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), ExchangeError> {
        let removed = self
            .shared
            .streams
            .lock()
            .expect("streams lock")
            .remove(channel)
            .is_some();
        if removed {
            raw_call(
                &self.shared,
                "public/unsubscribe",
                json!({ "channels": [channel] }),
                CALL_TIMEOUT,
            )
            .await?;
            debug!(%channel, "Unsubscribed");
        }
        Ok(())
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        // No orders while reconnecting: a lost ack could otherwise turn into
        // a duplicate on retry.
        if *self.shared.conn_tx.borrow() != ConnectionState::Connected {
            return Err(ExchangeError::transport("reconnecting, order refused"));
        }

        let method = match request.side {
            Side::Buy => "private/buy",
            Side::Sell => "private/sell",
        };
        let mut params = json!({
            "instrument_name": request.instrument,
            "amount": request.quantity,
            "type": request.order_type,
            "label": request.label,
        });
        if let Some(price) = request.price {
            params["price"] = json!(price);
        }
        if request.reduce_only {
            params["reduce_only"] = json!(true);
        }

        match raw_call(&self.shared, method, params, ORDER_TIMEOUT).await {
            Ok(value) => {
                let placement: OrderPlacement = serde_json::from_value(value).map_err(|e| {
                    ExchangeError::transport(format!("malformed order response: {e}"))
                })?;
                Ok(placement.order.into())
            }
            // The order may have reached the venue even though the response
            // was lost; reconcile by label before reporting failure.
            Err(ExchangeError::Timeout) => match self.get_order(&request.label).await? {
                Some(ack) => Ok(ack),
                None => Err(ExchangeError::Timeout),
            },
            Err(e) => Err(e),
        }
    }

    async fn get_order(&self, label: &str) -> Result<Option<OrderAck>, ExchangeError> {
        let value = raw_call(
            &self.shared,
            "private/get_order_state_by_label",
            json!({ "label": label }),
            CALL_TIMEOUT,
        )
        .await?;
        let orders: Vec<OrderData> = serde_json::from_value(value)
            .map_err(|e| ExchangeError::transport(format!("malformed order state: {e}")))?;
        Ok(orders.into_iter().next().map(OrderAck::from))
    }

    async fn get_position(&self, instrument: &str) -> Result<VenuePosition, ExchangeError> {
        let value = raw_call(
            &self.shared,
            "private/get_position",
            json!({ "instrument_name": instrument }),
            CALL_TIMEOUT,
        )
        .await?;
        serde_json::from_value(value)
            .map_err(|e| ExchangeError::transport(format!("malformed position: {e}")))
    }

    async fn get_account_summary(
        &self,
        currency: &str,
    ) -> Result<AccountSummary, ExchangeError> {
        let value = raw_call(
            &self.shared,
            "private/get_account_summary",
            json!({ "currency": currency }),
            CALL_TIMEOUT,
        )
        .await?;
        serde_json::from_value(value)
            .map_err(|e| ExchangeError::transport(format!("malformed account summary: {e}")))
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderAck>, ExchangeError> {
        let value = raw_call(
            &self.shared,
            "private/get_open_orders",
            json!({}),
            CALL_TIMEOUT,
        )
        .await?;
        let orders: Vec<OrderData> = serde_json::from_value(value)
            .map_err(|e| ExchangeError::transport(format!("malformed open orders: {e}")))?;
        Ok(orders.into_iter().map(OrderAck::from).collect())
    }

    async fn get_instrument(&self, instrument: &str) -> Result<InstrumentInfo, ExchangeError> {
        let value = raw_call(
            &self.shared,
            "public/get_instrument",
            json!({ "instrument_name": instrument }),
            CALL_TIMEOUT,
        )
        .await?;
        serde_json::from_value(value)
            .map_err(|e| ExchangeError::transport(format!("malformed instrument: {e}")))
    }

    fn connection_events(&self) -> watch::Receiver<ConnectionState> {
        self.shared.conn_tx.subscribe()
    }

    async fn close(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.lock().expect("supervisor lock").take() {
            handle.abort();
        }
        drop_writer(&self.shared);
        fail_pending(&self.shared, "client closed");
        info!("Exchange client closed");
    }
}
