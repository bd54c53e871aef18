//! Per-portfolio dynamic delta hedger.
//!
//! One hedger owns one portfolio's hedging loop: it consumes the instrument
//! tick streams, recomputes net delta, and places offsetting orders on the
//! hedge instrument whenever the position drifts a full hysteresis step away
//! from the last hedged level. The loop is an explicit state machine driven
//! by a `select!` over the tick funnel, the cadence timer, connection
//! transitions, portfolio updates and the stop signal; tick processing,
//! trigger evaluation, order submission and state update are strictly
//! sequential.

use crate::config::{HedgingConfig, StepMode};
use crate::events::{Event, EventBus, PnlRecorder, PnlSample};
use crate::exchange::{
    ConnectionState, ExchangeApi, ExchangeError, InstrumentInfo, MarketTick, OrderRequest,
    OrderState, OrderType, Side,
};
use crate::market::{MarketStream, SubscriptionManager, TickEvent};
use crate::portfolio::{ContractKind, LegPosition, Portfolio, PortfolioStore, SettlementStyle};
use crate::pricing::{Pricer, PricingInputs};
use chrono::Utc;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const MS_PER_YEAR: f64 = 365.25 * 24.0 * 3600.0 * 1000.0;
const RETRY_BASE: Duration = Duration::from_millis(250);
const MAX_SUBMIT_RETRIES: u32 = 5;
const MAX_RETRYABLE_REJECTS: u32 = 3;
const STORE_RETRIES: u32 = 3;
const FUNNEL_DEPTH: usize = 256;

/// Ticker channel for an instrument.
pub fn ticker_channel(instrument: &str) -> String {
    format!("ticker.{instrument}.100ms")
}

/// Hedger lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HedgerState {
    Idle,
    Warming,
    Armed,
    Hedging,
    Cooldown,
    Failed,
    Stopped,
}

impl std::fmt::Display for HedgerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Warming => "warming",
            Self::Armed => "armed",
            Self::Hedging => "hedging",
            Self::Cooldown => "cooldown",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Runtime hedger configuration (per portfolio, seeded from the global
/// defaults).
#[derive(Debug, Clone)]
pub struct HedgerConfig {
    pub target_delta: f64,
    pub min_trigger_delta: f64,
    pub step_mode: StepMode,
    pub step_size: f64,
    pub price_check_interval: Duration,
    pub min_hedge_usd: Decimal,
    pub cooldown: Duration,
    pub volatility_fallback: f64,
    pub risk_free_rate: f64,
}

impl HedgerConfig {
    pub fn from_settings(settings: &HedgingConfig) -> Self {
        Self {
            target_delta: settings.target_delta,
            min_trigger_delta: settings.min_trigger_delta,
            step_mode: settings.step_mode,
            step_size: settings.step_size,
            price_check_interval: Duration::from_secs_f64(settings.price_check_interval),
            min_hedge_usd: settings.min_hedge_usd,
            cooldown: Duration::from_millis(settings.cooldown_ms),
            volatility_fallback: settings.volatility_fallback,
            risk_free_rate: settings.risk_free_rate,
        }
    }
}

/// Stats snapshot polled by the manager.
#[derive(Debug, Clone, Serialize)]
pub struct HedgerStats {
    pub state: HedgerState,
    pub current_delta: f64,
    pub last_hedged_delta: f64,
    pub last_tick_ts: Option<i64>,
    pub orders_sent: u64,
    pub fills: u64,
    pub errors: u64,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub pending_order_label: Option<String>,
}

impl HedgerStats {
    fn new(target_delta: f64) -> Self {
        Self {
            state: HedgerState::Idle,
            current_delta: target_delta,
            last_hedged_delta: target_delta,
            last_tick_ts: None,
            orders_sent: 0,
            fills: 0,
            errors: 0,
            consecutive_errors: 0,
            last_error: None,
            pending_order_label: None,
        }
    }
}

#[derive(Debug, Clone)]
struct MarkState {
    mark: Decimal,
    index: Decimal,
    delta: Option<f64>,
    iv: Option<f64>,
}

enum SubmitOutcome {
    /// Fully filled.
    Filled { quantity: Decimal, avg_price: Decimal },
    /// Partially filled, remainder cancelled.
    Partial { quantity: Decimal, avg_price: Decimal },
    /// Retries exhausted without a venue-confirmed order.
    NoFill,
    /// Unrecoverable for this hedger.
    Fatal(String),
}

struct RelayHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The per-portfolio hedging state machine.
pub struct DynamicDeltaHedger {
    portfolio_id: String,
    config: HedgerConfig,
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<dyn PortfolioStore>,
    subscriptions: Arc<SubscriptionManager>,
    pricer: Arc<dyn Pricer>,
    bus: EventBus,
    pnl: Arc<PnlRecorder>,
    hedge_info: InstrumentInfo,
    hedge_kind: ContractKind,

    portfolio: Arc<Portfolio>,
    marks: HashMap<String, MarkState>,
    state: HedgerState,
    label_seq: u64,
    consecutive_errors: u32,
    stats: HedgerStats,
    stats_tx: watch::Sender<HedgerStats>,
    last_tick_at: Option<Instant>,

    funnel_tx: mpsc::Sender<(String, TickEvent)>,
    funnel_rx: Option<mpsc::Receiver<(String, TickEvent)>>,
    relays: HashMap<String, RelayHandle>,
}

impl DynamicDeltaHedger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        portfolio: Arc<Portfolio>,
        config: HedgerConfig,
        hedge_info: InstrumentInfo,
        exchange: Arc<dyn ExchangeApi>,
        store: Arc<dyn PortfolioStore>,
        subscriptions: Arc<SubscriptionManager>,
        pricer: Arc<dyn Pricer>,
        bus: EventBus,
        pnl: Arc<PnlRecorder>,
    ) -> (Self, watch::Receiver<HedgerStats>) {
        let stats = HedgerStats::new(config.target_delta);
        let (stats_tx, stats_rx) = watch::channel(stats.clone());
        let (funnel_tx, funnel_rx) = mpsc::channel(FUNNEL_DEPTH);

        let hedge_kind = if hedge_info.instrument.contains("PERPETUAL") {
            ContractKind::Perpetual
        } else {
            ContractKind::Future
        };

        let hedger = Self {
            portfolio_id: portfolio.id.clone(),
            config,
            exchange,
            store,
            subscriptions,
            pricer,
            bus,
            pnl,
            hedge_info,
            hedge_kind,
            portfolio,
            marks: HashMap::new(),
            state: HedgerState::Idle,
            label_seq: 0,
            consecutive_errors: 0,
            stats,
            stats_tx,
            last_tick_at: None,
            funnel_tx,
            funnel_rx: Some(funnel_rx),
            relays: HashMap::new(),
        };
        (hedger, stats_rx)
    }

    /// Run the hedging loop until stopped or failed-and-stopped.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut funnel = self.funnel_rx.take().expect("hedger run called once");
        let mut bus_rx = self.bus.subscribe();
        let mut conn_rx = self.exchange.connection_events();
        let mut cadence = tokio::time::interval(self.config.price_check_interval);
        cadence.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        self.enter_state(HedgerState::Warming, "started").await;
        self.sync_subscriptions().await;

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                event = funnel.recv() => match event {
                    Some((_, TickEvent::Tick(tick))) => self.on_tick(tick).await,
                    Some((channel, TickEvent::StaleWarning { missed })) => {
                        warn!(
                            portfolio = %self.portfolio_id,
                            %channel,
                            missed,
                            "Consumer fell behind, ticks dropped"
                        );
                    }
                    None => break,
                },
                _ = cadence.tick() => self.on_self_tick().await,
                changed = conn_rx.changed() => {
                    if changed.is_ok() {
                        let state = *conn_rx.borrow();
                        self.on_connection_change(state).await;
                    }
                }
                event = bus_rx.recv() => {
                    if let Ok(event) = event {
                        self.on_bus_event(event).await;
                    }
                }
            }

            if self.state == HedgerState::Stopped {
                break;
            }
        }

        if self.state != HedgerState::Stopped {
            self.enter_state(HedgerState::Stopped, "stop requested").await;
        }
        self.teardown().await;
    }

    /// Stop every relay and wait for subscriptions to be released.
    async fn teardown(&mut self) {
        for (_, relay) in self.relays.drain() {
            let _ = relay.stop.send(true);
            let _ = relay.task.await;
        }
        debug!(portfolio = %self.portfolio_id, "Hedger torn down");
    }

    async fn on_tick(&mut self, tick: MarketTick) {
        self.last_tick_at = Some(Instant::now());
        self.stats.last_tick_ts = Some(tick.timestamp_ms);

        if tick.closed {
            self.on_instrument_closed(&tick.instrument).await;
            self.publish_stats();
            return;
        }

        self.marks.insert(
            tick.instrument.clone(),
            MarkState {
                mark: tick.mark_price,
                index: tick.index_price,
                delta: tick.delta,
                iv: tick.iv,
            },
        );

        match self.state {
            HedgerState::Warming => {
                if self.warmed_up() {
                    self.enter_state(HedgerState::Armed, "all legs priced").await;
                    self.evaluate().await;
                }
            }
            HedgerState::Armed => self.evaluate().await,
            _ => {}
        }
        self.publish_stats();
    }

    /// Self-tick: re-evaluate from the last known marks when the market has
    /// gone quiet for a full cadence interval.
    async fn on_self_tick(&mut self) {
        let quiet = self
            .last_tick_at
            .map(|at| at.elapsed() >= self.config.price_check_interval)
            .unwrap_or(true);
        if !quiet {
            return;
        }

        match self.state {
            HedgerState::Warming => {
                debug!(portfolio = %self.portfolio_id, "Warming, awaiting first ticks");
                if self.warmed_up() {
                    self.enter_state(HedgerState::Armed, "all legs priced").await;
                    self.evaluate().await;
                }
            }
            HedgerState::Armed => {
                debug!(portfolio = %self.portfolio_id, "Self-tick from last known marks");
                self.evaluate().await;
            }
            _ => {}
        }
        self.publish_stats();
    }

    async fn on_connection_change(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Reconnecting => {
                // Streams do not replay missed ticks; treat everything as
                // stale until fresh coverage arrives.
                self.marks.clear();
                if self.state == HedgerState::Armed {
                    self.enter_state(HedgerState::Warming, "transport lost").await;
                }
            }
            ConnectionState::Connected => {
                if self.state == HedgerState::Warming {
                    self.reconcile_hedge_position().await;
                }
            }
        }
    }

    /// Adopt venue truth for the hedge position after a transport flap.
    async fn reconcile_hedge_position(&mut self) {
        let venue = match self
            .exchange
            .get_position(&self.hedge_info.instrument)
            .await
        {
            Ok(position) => position,
            Err(e) => {
                warn!(portfolio = %self.portfolio_id, error = %e, "Reconciliation read failed");
                return;
            }
        };

        let local = self
            .portfolio
            .hedge_position
            .as_ref()
            .map(|h| h.quantity)
            .unwrap_or(Decimal::ZERO);
        if venue.size == local {
            return;
        }

        warn!(
            portfolio = %self.portfolio_id,
            local = %local,
            venue = %venue.size,
            "Hedge position diverged from venue, adopting venue truth"
        );
        let instrument = self.hedge_info.instrument.clone();
        let kind = self.hedge_kind;
        let size = venue.size;
        let avg = venue.average_price;
        let result = self
            .save_with_retry(move |p: &mut Portfolio| {
                let hedge = p
                    .hedge_position
                    .get_or_insert_with(|| LegPosition::hedge(instrument.clone(), kind));
                hedge.quantity = size;
                if avg > Decimal::ZERO {
                    hedge.avg_entry_price = avg;
                }
            })
            .await;
        match result {
            Some(snapshot) => self.portfolio = snapshot,
            None => self.fail("storage failure during reconciliation").await,
        }
    }

    async fn on_instrument_closed(&mut self, instrument: &str) {
        let is_live_option = self
            .portfolio
            .positions
            .get(instrument)
            .map(|leg| leg.is_option() && !leg.expired)
            .unwrap_or(false);
        if !is_live_option {
            return;
        }

        info!(portfolio = %self.portfolio_id, %instrument, "Instrument expired, zeroing leg delta");
        let name = instrument.to_string();
        let result = self
            .save_with_retry(move |p: &mut Portfolio| {
                p.expire_leg(&name);
            })
            .await;
        match result {
            Some(snapshot) => {
                self.portfolio = snapshot;
                self.marks.remove(instrument);
                // Drop the dead stream.
                if let Some(relay) = self.relays.remove(&ticker_channel(instrument)) {
                    let _ = relay.stop.send(true);
                }
            }
            None => self.fail("storage failure recording expiry").await,
        }
    }

    async fn on_bus_event(&mut self, event: Event) {
        match event {
            Event::PortfolioUpdated { id, portfolio } if id == self.portfolio_id => {
                if portfolio.updated_at <= self.portfolio.updated_at {
                    return;
                }
                self.portfolio = portfolio;
                self.sync_subscriptions().await;
                if self.state == HedgerState::Armed && !self.warmed_up() {
                    self.enter_state(HedgerState::Warming, "awaiting marks for new legs")
                        .await;
                }
            }
            Event::PortfolioDeleted { id } if id == self.portfolio_id => {
                info!(portfolio = %self.portfolio_id, "Portfolio deleted, stopping hedger");
                self.enter_state(HedgerState::Stopped, "portfolio deleted").await;
            }
            _ => {}
        }
    }

    /// Acquire streams for new instruments, drop streams for removed ones.
    /// The hedge instrument is always watched, even before a hedge position
    /// exists.
    async fn sync_subscriptions(&mut self) {
        let mut wanted: Vec<String> = self
            .portfolio
            .instruments()
            .iter()
            .map(|i| ticker_channel(i))
            .collect();
        let hedge_channel = ticker_channel(&self.hedge_info.instrument);
        if !wanted.contains(&hedge_channel) {
            wanted.push(hedge_channel);
        }

        for channel in &wanted {
            if self.relays.contains_key(channel) {
                continue;
            }
            match self.subscriptions.acquire(channel).await {
                Ok(stream) => self.spawn_relay(channel.clone(), stream),
                Err(e) => {
                    self.stats.errors += 1;
                    self.stats.last_error = Some(e.to_string());
                    warn!(portfolio = %self.portfolio_id, %channel, error = %e, "Failed to acquire stream");
                }
            }
        }

        let stale: Vec<String> = self
            .relays
            .keys()
            .filter(|channel| !wanted.contains(*channel))
            .cloned()
            .collect();
        for channel in stale {
            if let Some(relay) = self.relays.remove(&channel) {
                let _ = relay.stop.send(true);
            }
        }
    }

    fn spawn_relay(&mut self, channel: String, stream: MarketStream) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let funnel = self.funnel_tx.clone();
        let subscriptions = self.subscriptions.clone();
        let name = channel.clone();

        let task = tokio::spawn(async move {
            let mut stream = stream;
            loop {
                tokio::select! {
                    event = stream.recv() => match event {
                        Some(event) => {
                            if funnel.send((name.clone(), event)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = stop_rx.changed() => break,
                }
            }
            subscriptions.release(stream).await;
        });

        self.relays.insert(channel, RelayHandle { stop: stop_tx, task });
    }

    /// Warm-up is complete when every live option leg and the hedge
    /// instrument have been priced.
    fn warmed_up(&self) -> bool {
        if !self.marks.contains_key(&self.hedge_info.instrument) {
            return false;
        }
        self.portfolio
            .positions
            .values()
            .filter(|leg| leg.is_option() && !leg.expired)
            .all(|leg| self.marks.contains_key(&leg.instrument))
    }

    fn underlying_price(&self) -> Option<f64> {
        let mark = self.marks.get(&self.hedge_info.instrument)?;
        let index = mark.index.to_f64().filter(|v| *v > 0.0);
        index.or_else(|| mark.mark.to_f64().filter(|v| *v > 0.0))
    }

    /// Delta of one leg in units of underlying.
    fn leg_delta(&self, leg: &LegPosition, spot: f64) -> f64 {
        if leg.expired {
            return 0.0;
        }
        let quantity = leg.quantity.to_f64().unwrap_or(0.0);
        match leg.contract_kind {
            ContractKind::Option => {
                let mark = self.marks.get(&leg.instrument);
                let per_contract = match mark.and_then(|m| m.delta) {
                    Some(delta) => delta,
                    None => self.fallback_delta(leg, spot, mark.and_then(|m| m.iv)),
                };
                quantity * per_contract
            }
            // Non-hedge futures legs are carried linear.
            ContractKind::Future | ContractKind::Perpetual => quantity,
        }
    }

    fn fallback_delta(&self, leg: &LegPosition, spot: f64, iv: Option<f64>) -> f64 {
        let (Some(strike), Some(expiry), Some(option_type)) =
            (leg.strike, leg.expiry, leg.option_type)
        else {
            return 0.0;
        };
        let years = (expiry - Utc::now()).num_milliseconds() as f64 / MS_PER_YEAR;
        let sigma = iv
            .or(leg.last_iv)
            .unwrap_or(self.config.volatility_fallback);
        let (_, delta) = self.pricer.price_and_delta(&PricingInputs {
            spot,
            strike: strike.to_f64().unwrap_or(0.0),
            years_to_expiry: years,
            volatility: sigma,
            risk_free_rate: self.config.risk_free_rate,
            option_type,
        });
        delta
    }

    /// Net portfolio delta in units of underlying.
    fn net_delta(&self, spot: f64) -> f64 {
        let mut net = 0.0;
        for leg in self.portfolio.positions.values() {
            net += self.leg_delta(leg, spot);
        }
        if let Some(hedge) = &self.portfolio.hedge_position {
            let quantity = hedge.quantity.to_f64().unwrap_or(0.0);
            net += self.hedge_contribution(quantity, spot);
        }
        net
    }

    fn hedge_contribution(&self, quantity: f64, spot: f64) -> f64 {
        match self.hedge_info.settlement {
            SettlementStyle::Linear => quantity,
            SettlementStyle::Inverse => {
                if spot > 0.0 {
                    quantity * (-1.0 / spot)
                } else {
                    0.0
                }
            }
        }
    }

    /// Hysteresis step in underlying units.
    fn step_in_underlying(&self) -> f64 {
        match self.config.step_mode {
            StepMode::Absolute => self.config.step_size,
            StepMode::Percentage => {
                let mut notional = 0.0;
                for leg in self.portfolio.positions.values() {
                    if leg.expired {
                        continue;
                    }
                    if let Some(mark) = self.marks.get(&leg.instrument) {
                        let quantity = leg.quantity.to_f64().unwrap_or(0.0);
                        let mark_price = mark.mark.to_f64().unwrap_or(0.0);
                        let index = mark.index.to_f64().unwrap_or(0.0);
                        if index > 0.0 {
                            notional += quantity * mark_price / index;
                        }
                    }
                }
                self.config.step_size * notional.abs()
            }
        }
    }

    /// Recompute delta, record a PnL sample and fire a hedge if the trigger
    /// rule is satisfied.
    async fn evaluate(&mut self) {
        let Some(spot) = self.underlying_price() else {
            return;
        };
        let net = self.net_delta(spot);
        self.stats.current_delta = net;
        self.record_pnl(net).await;

        let deviation = net - self.config.target_delta;
        let step = self.step_in_underlying();
        let threshold = self.config.min_trigger_delta.max(step);
        let anchor = self.stats.last_hedged_delta - self.config.target_delta;

        if deviation.abs() >= threshold && (deviation - anchor).abs() >= step {
            self.submit_hedge(net, spot).await;
        }
    }

    async fn submit_hedge(&mut self, net: f64, spot: f64) {
        let deviation = net - self.config.target_delta;
        let Some(raw_qty) = Decimal::from_f64(-deviation) else {
            return;
        };
        let quantity = round_to_lot(raw_qty, self.hedge_info.lot_size);
        if quantity.is_zero() {
            debug!(portfolio = %self.portfolio_id, deviation, "Hedge rounds to zero lots");
            return;
        }

        let price = self
            .marks
            .get(&self.hedge_info.instrument)
            .map(|m| m.mark)
            .unwrap_or_else(|| Decimal::from_f64(spot).unwrap_or(Decimal::ZERO));
        let notional = quantity.abs() * price;
        if notional < self.config.min_hedge_usd {
            info!(
                portfolio = %self.portfolio_id,
                notional = %notional,
                min = %self.config.min_hedge_usd,
                "Hedge notional below minimum, skipping"
            );
            return;
        }

        self.label_seq += 1;
        let label = format!("h:{}:{}", self.portfolio_id, self.label_seq);
        let request = OrderRequest {
            instrument: self.hedge_info.instrument.clone(),
            side: if quantity > Decimal::ZERO {
                Side::Buy
            } else {
                Side::Sell
            },
            quantity: quantity.abs(),
            order_type: OrderType::Market,
            price: None,
            reduce_only: false,
            label: label.clone(),
        };

        self.stats.pending_order_label = Some(label.clone());
        self.enter_state(HedgerState::Hedging, "delta trigger").await;
        self.stats.orders_sent += 1;
        info!(
            portfolio = %self.portfolio_id,
            side = ?request.side,
            quantity = %request.quantity,
            net_delta = net,
            %label,
            "Submitting hedge order"
        );

        let outcome = self.drive_order(&request).await;
        self.stats.pending_order_label = None;

        match outcome {
            SubmitOutcome::Filled { quantity, avg_price } => {
                let signed = signed_quantity(request.side, quantity);
                self.apply_fill(signed, avg_price).await;
                if self.state == HedgerState::Failed {
                    return;
                }
                let hedged = self.hedge_contribution(signed.to_f64().unwrap_or(0.0), spot);
                self.stats.last_hedged_delta = net + hedged;
                self.consecutive_errors = 0;
                self.stats.consecutive_errors = 0;
                self.stats.fills += 1;
                self.cooldown().await;
            }
            SubmitOutcome::Partial { quantity, avg_price } => {
                warn!(
                    portfolio = %self.portfolio_id,
                    filled = %quantity,
                    requested = %request.quantity,
                    "Partial fill, remainder cancelled"
                );
                let signed = signed_quantity(request.side, quantity);
                self.apply_fill(signed, avg_price).await;
                if self.state == HedgerState::Failed {
                    return;
                }
                let hedged = self.hedge_contribution(signed.to_f64().unwrap_or(0.0), spot);
                self.stats.last_hedged_delta = net + hedged;
                self.consecutive_errors = 0;
                self.stats.consecutive_errors = 0;
                self.stats.fills += 1;
                self.cooldown().await;
            }
            SubmitOutcome::NoFill => {
                self.enter_state(HedgerState::Armed, "submission retries exhausted")
                    .await;
            }
            SubmitOutcome::Fatal(reason) => {
                self.fail(&reason).await;
            }
        }
    }

    /// Place the order, retrying retryable failures with exponential backoff
    /// and reconciling by label when the transport drops mid-flight.
    async fn drive_order(&mut self, request: &OrderRequest) -> SubmitOutcome {
        let mut attempt: u32 = 0;
        loop {
            match self.exchange.place_order(request).await {
                Ok(ack) => return self.classify_ack(ack),
                Err(e) => {
                    self.stats.errors += 1;
                    self.stats.last_error = Some(e.to_string());
                    match e {
                        ExchangeError::Rejected { retryable: true, .. }
                        | ExchangeError::RateLimited => {
                            self.consecutive_errors += 1;
                            self.stats.consecutive_errors = self.consecutive_errors;
                            if self.consecutive_errors >= MAX_RETRYABLE_REJECTS {
                                return SubmitOutcome::Fatal(
                                    "order rejected repeatedly".to_string(),
                                );
                            }
                        }
                        ExchangeError::Timeout
                        | ExchangeError::Transport { retryable: true, .. } => {
                            // The order may have landed; reconcile by label
                            // before retrying so at-most-once holds.
                            match self.exchange.get_order(&request.label).await {
                                Ok(Some(ack)) => return self.classify_ack(ack),
                                Ok(None) => {}
                                Err(err) => {
                                    debug!(error = %err, "Label reconciliation failed");
                                }
                            }
                        }
                        other => {
                            return SubmitOutcome::Fatal(other.to_string());
                        }
                    }

                    if attempt >= MAX_SUBMIT_RETRIES {
                        warn!(
                            portfolio = %self.portfolio_id,
                            label = %request.label,
                            "Submission retries exhausted"
                        );
                        return SubmitOutcome::NoFill;
                    }
                    let backoff = RETRY_BASE * 2u32.pow(attempt);
                    debug!(
                        portfolio = %self.portfolio_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Retrying hedge submission"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    fn classify_ack(&self, ack: crate::exchange::OrderAck) -> SubmitOutcome {
        let avg_price = ack.avg_price.unwrap_or(Decimal::ZERO);
        match ack.state {
            OrderState::Filled => SubmitOutcome::Filled {
                quantity: ack.filled_quantity,
                avg_price,
            },
            OrderState::Rejected => SubmitOutcome::Fatal("order rejected by venue".to_string()),
            OrderState::Open | OrderState::Cancelled => {
                if ack.filled_quantity > Decimal::ZERO {
                    SubmitOutcome::Partial {
                        quantity: ack.filled_quantity,
                        avg_price,
                    }
                } else {
                    SubmitOutcome::NoFill
                }
            }
        }
    }

    async fn apply_fill(&mut self, signed_quantity: Decimal, avg_price: Decimal) {
        let instrument = self.hedge_info.instrument.clone();
        let kind = self.hedge_kind;
        let style = self.hedge_info.settlement;
        let mark_updates: Vec<(String, MarkState)> = self
            .marks
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let result = self
            .save_with_retry(move |p: &mut Portfolio| {
                p.apply_hedge_fill(&instrument, kind, style, signed_quantity, avg_price);
                for (name, mark) in &mark_updates {
                    if let Some(leg) = p.positions.get_mut(name) {
                        leg.last_mark = Some(mark.mark);
                        if mark.delta.is_some() {
                            leg.last_delta = mark.delta;
                        }
                        if mark.iv.is_some() {
                            leg.last_iv = mark.iv;
                        }
                    }
                }
            })
            .await;

        match result {
            Some(snapshot) => {
                info!(
                    portfolio = %self.portfolio_id,
                    quantity = %signed_quantity,
                    avg_price = %avg_price,
                    balance = %snapshot.balance,
                    "Hedge fill applied"
                );
                self.portfolio = snapshot;
            }
            // Diverging from venue truth is worse than halting this hedger.
            None => self.fail("storage failure applying fill").await,
        }
    }

    /// Persist through the store, retrying transient storage failures with
    /// backoff. `None` after the last attempt means the hedger must fail
    /// rather than diverge from venue truth.
    async fn save_with_retry(
        &mut self,
        mutator: impl Fn(&mut Portfolio) + Send + Sync,
    ) -> Option<Arc<Portfolio>> {
        for attempt in 0..STORE_RETRIES {
            match self.store.save(&self.portfolio_id, &mutator).await {
                Ok(snapshot) => return Some(snapshot),
                Err(e) => {
                    self.stats.errors += 1;
                    self.stats.last_error = Some(e.to_string());
                    error!(
                        portfolio = %self.portfolio_id,
                        attempt,
                        error = %e,
                        "Portfolio save failed"
                    );
                    if attempt + 1 < STORE_RETRIES {
                        tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1)))
                            .await;
                    }
                }
            }
        }
        None
    }

    async fn cooldown(&mut self) {
        self.enter_state(HedgerState::Cooldown, "hedge settled").await;
        tokio::time::sleep(self.config.cooldown).await;
        if self.state == HedgerState::Cooldown {
            self.enter_state(HedgerState::Armed, "cooldown elapsed").await;
        }
    }

    async fn record_pnl(&self, net_delta: f64) {
        let sample = PnlSample {
            portfolio_id: self.portfolio_id.clone(),
            ts: Utc::now(),
            realized: self.portfolio.balance,
            unrealized: self.unrealized_pnl(),
            net_delta,
        };
        self.pnl.record(sample).await;
    }

    /// Mark-vs-entry over all legs, in quote currency. Option marks are in
    /// underlying units and convert at the leg's index price.
    fn unrealized_pnl(&self) -> Decimal {
        let mut total = Decimal::ZERO;
        for leg in self.portfolio.positions.values() {
            if leg.expired {
                continue;
            }
            let Some(mark) = self.marks.get(&leg.instrument) else {
                continue;
            };
            match leg.contract_kind {
                ContractKind::Option => {
                    total += leg.quantity * (mark.mark - leg.avg_entry_price) * mark.index;
                }
                ContractKind::Future | ContractKind::Perpetual => {
                    total += leg.quantity * (mark.mark - leg.avg_entry_price);
                }
            }
        }
        if let Some(hedge) = &self.portfolio.hedge_position {
            if let Some(mark) = self.marks.get(&hedge.instrument) {
                match self.hedge_info.settlement {
                    SettlementStyle::Linear => {
                        total += hedge.quantity * (mark.mark - hedge.avg_entry_price);
                    }
                    SettlementStyle::Inverse => {
                        if hedge.avg_entry_price > Decimal::ZERO {
                            total += hedge.quantity * (mark.mark - hedge.avg_entry_price)
                                / hedge.avg_entry_price;
                        }
                    }
                }
            }
        }
        total
    }

    async fn fail(&mut self, reason: &str) {
        error!(portfolio = %self.portfolio_id, reason, "Hedger failed");
        self.stats.last_error = Some(reason.to_string());
        self.enter_state(HedgerState::Failed, reason).await;
    }

    async fn enter_state(&mut self, to: HedgerState, reason: &str) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.stats.state = to;
        info!(
            portfolio = %self.portfolio_id,
            %from,
            %to,
            reason,
            "Hedger state changed"
        );
        self.bus.publish(Event::HedgerStateChanged {
            id: self.portfolio_id.clone(),
            from,
            to,
            reason: reason.to_string(),
        });
        self.publish_stats();
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(self.stats.clone());
    }
}

fn signed_quantity(side: Side, quantity: Decimal) -> Decimal {
    match side {
        Side::Buy => quantity,
        Side::Sell => -quantity,
    }
}

/// Round toward zero to a multiple of `lot`.
fn round_to_lot(quantity: Decimal, lot: Decimal) -> Decimal {
    if lot <= Decimal::ZERO {
        return quantity;
    }
    (quantity / lot).trunc() * lot
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn lot_rounding_truncates_toward_zero() {
        assert_eq!(round_to_lot(dec!(5.0004), dec!(0.001)), dec!(5.000));
        assert_eq!(round_to_lot(dec!(-5.0004), dec!(0.001)), dec!(-5.000));
        assert_eq!(round_to_lot(dec!(0.0009), dec!(0.001)), dec!(0.000));
        assert_eq!(round_to_lot(dec!(-0.0009), dec!(0.001)), dec!(0.000));
        // Degenerate lot size leaves the quantity untouched.
        assert_eq!(round_to_lot(dec!(1.5), Decimal::ZERO), dec!(1.5));
    }

    #[test]
    fn signed_quantity_follows_side() {
        assert_eq!(signed_quantity(Side::Buy, dec!(5)), dec!(5));
        assert_eq!(signed_quantity(Side::Sell, dec!(5)), dec!(-5));
    }

    #[test]
    fn ticker_channel_format() {
        assert_eq!(
            ticker_channel("BTC-PERPETUAL"),
            "ticker.BTC-PERPETUAL.100ms"
        );
    }

    #[test]
    fn hedger_config_from_settings_converts_durations() {
        let settings = crate::config::HedgingConfig::default();
        let config = HedgerConfig::from_settings(&settings);
        assert_eq!(config.price_check_interval, Duration::from_secs(2));
        assert_eq!(config.cooldown, Duration::from_millis(500));
        assert_eq!(config.min_hedge_usd, dec!(10));
    }
}
