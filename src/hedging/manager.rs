//! Hedger lifecycle management.
//!
//! The manager exclusively owns the hedger handles: it resolves the hedge
//! instrument for a portfolio, spawns the hedger task, and drains it again on
//! stop. A hedger that cannot drain within `stop_timeout` is aborted and any
//! order it left in flight is reconciled against the venue by a bounded
//! fire-and-forget task, so venue state stays convergent.

use super::hedger::{DynamicDeltaHedger, HedgerConfig, HedgerStats};
use crate::events::{EventBus, PnlRecorder};
use crate::exchange::{ExchangeApi, InstrumentInfo, OrderState, Side};
use crate::market::SubscriptionManager;
use crate::portfolio::{ContractKind, Portfolio, PortfolioStore};
use crate::pricing::Pricer;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const RECONCILE_ATTEMPTS: u32 = 5;
const RECONCILE_BACKOFF: Duration = Duration::from_millis(500);

/// Rule mapping an underlying to its hedge instrument.
pub type HedgeInstrumentResolver = Box<dyn Fn(&str) -> String + Send + Sync>;

fn default_resolver() -> HedgeInstrumentResolver {
    Box::new(|underlying| format!("{underlying}-PERPETUAL"))
}

struct HedgerEntry {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats_rx: watch::Receiver<HedgerStats>,
    hedge_info: InstrumentInfo,
}

/// Runs one [`DynamicDeltaHedger`] per portfolio.
pub struct HedgingManager {
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<dyn PortfolioStore>,
    subscriptions: Arc<SubscriptionManager>,
    pricer: Arc<dyn Pricer>,
    bus: EventBus,
    pnl: Arc<PnlRecorder>,
    default_config: HedgerConfig,
    resolver: HedgeInstrumentResolver,
    hedgers: Mutex<HashMap<String, HedgerEntry>>,
    stop_timeout: Duration,
}

impl HedgingManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        store: Arc<dyn PortfolioStore>,
        subscriptions: Arc<SubscriptionManager>,
        pricer: Arc<dyn Pricer>,
        bus: EventBus,
        pnl: Arc<PnlRecorder>,
        default_config: HedgerConfig,
    ) -> Self {
        Self {
            exchange,
            store,
            subscriptions,
            pricer,
            bus,
            pnl,
            default_config,
            resolver: default_resolver(),
            hedgers: Mutex::new(HashMap::new()),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_resolver(mut self, resolver: HedgeInstrumentResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Start a hedger for a portfolio. Idempotent: a second start while the
    /// hedger is alive is a no-op.
    pub async fn start_hedger(
        &self,
        portfolio_id: &str,
        config: Option<HedgerConfig>,
    ) -> Result<()> {
        let mut hedgers = self.hedgers.lock().await;
        if let Some(entry) = hedgers.get(portfolio_id) {
            if !entry.join.is_finished() {
                debug!(portfolio = %portfolio_id, "Hedger already running");
                return Ok(());
            }
            hedgers.remove(portfolio_id);
        }

        let portfolio = self
            .store
            .load(portfolio_id)
            .await
            .with_context(|| format!("loading portfolio {portfolio_id}"))?;

        let hedge_instrument = (self.resolver)(&portfolio.underlying);
        let hedge_info = self
            .exchange
            .get_instrument(&hedge_instrument)
            .await
            .with_context(|| format!("resolving hedge instrument {hedge_instrument}"))?;

        let config = config.unwrap_or_else(|| self.default_config.clone());
        let (hedger, stats_rx) = DynamicDeltaHedger::new(
            portfolio,
            config,
            hedge_info.clone(),
            self.exchange.clone(),
            self.store.clone(),
            self.subscriptions.clone(),
            self.pricer.clone(),
            self.bus.clone(),
            self.pnl.clone(),
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(hedger.run(stop_rx));
        hedgers.insert(
            portfolio_id.to_string(),
            HedgerEntry {
                stop_tx,
                join,
                stats_rx,
                hedge_info,
            },
        );

        info!(portfolio = %portfolio_id, hedge_instrument = %hedge_instrument, "Hedger started");
        Ok(())
    }

    /// Stop a portfolio's hedger, draining it up to `stop_timeout`.
    pub async fn stop_hedger(&self, portfolio_id: &str) -> Result<()> {
        let Some(entry) = self.hedgers.lock().await.remove(portfolio_id) else {
            debug!(portfolio = %portfolio_id, "No hedger to stop");
            return Ok(());
        };
        self.drain_entry(portfolio_id, entry).await;
        Ok(())
    }

    async fn drain_entry(&self, portfolio_id: &str, mut entry: HedgerEntry) {
        let _ = entry.stop_tx.send(true);
        match tokio::time::timeout(self.stop_timeout, &mut entry.join).await {
            Ok(_) => {
                info!(portfolio = %portfolio_id, "Hedger stopped");
            }
            Err(_) => {
                warn!(portfolio = %portfolio_id, "Hedger did not drain in time, aborting");
                entry.join.abort();

                // An in-flight order is never cancelled client-side; resolve
                // its outcome asynchronously so venue state converges.
                let pending = entry.stats_rx.borrow().pending_order_label.clone();
                if let Some(label) = pending {
                    let exchange = self.exchange.clone();
                    let store = self.store.clone();
                    let id = portfolio_id.to_string();
                    let hedge_info = entry.hedge_info.clone();
                    tokio::spawn(async move {
                        reconcile_orphan_order(exchange, store, id, label, hedge_info).await;
                    });
                }
            }
        }
    }

    /// Stop and immediately restart a hedger with fresh config.
    pub async fn restart_hedger(
        &self,
        portfolio_id: &str,
        config: Option<HedgerConfig>,
    ) -> Result<()> {
        self.stop_hedger(portfolio_id).await?;
        self.start_hedger(portfolio_id, config).await
    }

    pub async fn get_hedger_stats(&self, portfolio_id: &str) -> Option<HedgerStats> {
        let hedgers = self.hedgers.lock().await;
        hedgers
            .get(portfolio_id)
            .map(|entry| entry.stats_rx.borrow().clone())
    }

    pub async fn list_hedgers(&self) -> Vec<(String, HedgerStats)> {
        let hedgers = self.hedgers.lock().await;
        hedgers
            .iter()
            .map(|(id, entry)| (id.clone(), entry.stats_rx.borrow().clone()))
            .collect()
    }

    /// Start hedgers for every stored portfolio.
    pub async fn start_all(&self) -> Result<()> {
        for portfolio in self.store.list().await? {
            if let Err(e) = self.start_hedger(&portfolio.id, None).await {
                error!(portfolio = %portfolio.id, error = %e, "Failed to start hedger");
            }
        }
        Ok(())
    }

    /// Apply a venue-reported funding settlement to a portfolio's balance.
    pub async fn apply_funding(&self, portfolio_id: &str, amount: Decimal) -> Result<()> {
        self.store
            .save(portfolio_id, &move |p: &mut Portfolio| {
                p.apply_funding(amount);
            })
            .await
            .with_context(|| format!("applying funding to {portfolio_id}"))?;
        info!(portfolio = %portfolio_id, amount = %amount, "Funding settlement applied");
        Ok(())
    }

    /// Stop all hedgers in parallel, then the subscription manager, then the
    /// exchange client.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, HedgerEntry)> =
            self.hedgers.lock().await.drain().collect();
        let stops = entries
            .into_iter()
            .map(|(id, entry)| async move { self.drain_entry(&id, entry).await });
        futures_util::future::join_all(stops).await;

        self.subscriptions.shutdown().await;
        self.exchange.close().await;
        info!("Hedging manager shut down");
    }
}

/// Resolve the outcome of an order abandoned by an aborted hedger and fold
/// any fill into the portfolio.
async fn reconcile_orphan_order(
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<dyn PortfolioStore>,
    portfolio_id: String,
    label: String,
    hedge_info: InstrumentInfo,
) {
    for attempt in 0..RECONCILE_ATTEMPTS {
        match exchange.get_order(&label).await {
            Ok(Some(ack)) => {
                if ack.filled_quantity > Decimal::ZERO
                    && matches!(ack.state, OrderState::Filled | OrderState::Cancelled)
                {
                    let signed = match ack.side {
                        Side::Buy => ack.filled_quantity,
                        Side::Sell => -ack.filled_quantity,
                    };
                    let avg_price = ack.avg_price.unwrap_or(Decimal::ZERO);
                    let kind = if hedge_info.instrument.contains("PERPETUAL") {
                        ContractKind::Perpetual
                    } else {
                        ContractKind::Future
                    };
                    let instrument = hedge_info.instrument.clone();
                    let style = hedge_info.settlement;
                    let result = store
                        .save(&portfolio_id, &move |p: &mut Portfolio| {
                            p.apply_hedge_fill(&instrument, kind, style, signed, avg_price);
                        })
                        .await;
                    match result {
                        Ok(_) => info!(
                            portfolio = %portfolio_id,
                            %label,
                            filled = %ack.filled_quantity,
                            "Orphan order reconciled"
                        ),
                        Err(e) => error!(
                            portfolio = %portfolio_id,
                            %label,
                            error = %e,
                            "Failed to persist orphan fill"
                        ),
                    }
                } else {
                    debug!(portfolio = %portfolio_id, %label, state = ?ack.state, "Orphan order had no fill");
                }
                return;
            }
            Ok(None) => {
                debug!(portfolio = %portfolio_id, %label, "Orphan order never reached venue");
                return;
            }
            Err(e) => {
                warn!(portfolio = %portfolio_id, %label, attempt, error = %e, "Orphan reconciliation failed");
                tokio::time::sleep(RECONCILE_BACKOFF).await;
            }
        }
    }
    error!(portfolio = %portfolio_id, %label, "Orphan order could not be reconciled");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepMode;
    use crate::hedging::ticker_channel;
    use crate::events::{Event, EventBus};
    use crate::exchange::{
        ConnectionState, MarketTick, MockExchange, PlannedOutcome,
    };
    use crate::hedging::HedgerState;
    use crate::portfolio::{FilePortfolioStore, LegPosition, OptionType, SettlementStyle};
    use crate::pricing::BlackScholesPricer;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;

    const PERP: &str = "BTC-PERPETUAL";
    const CALL: &str = "BTC-28JUN24-30000-C";

    fn perp_channel() -> String {
        ticker_channel(PERP)
    }

    fn call_channel() -> String {
        ticker_channel(CALL)
    }

    struct TestRig {
        venue: Arc<MockExchange>,
        store: Arc<FilePortfolioStore>,
        subscriptions: Arc<SubscriptionManager>,
        bus: EventBus,
        manager: HedgingManager,
        _dir: tempfile::TempDir,
    }

    fn test_config() -> HedgerConfig {
        HedgerConfig {
            target_delta: 0.0,
            min_trigger_delta: 0.01,
            step_mode: StepMode::Absolute,
            step_size: 0.01,
            price_check_interval: Duration::from_millis(50),
            min_hedge_usd: dec!(10),
            cooldown: Duration::from_millis(10),
            volatility_fallback: 0.8,
            risk_free_rate: 0.0,
        }
    }

    async fn rig(config: HedgerConfig) -> TestRig {
        let venue = Arc::new(MockExchange::new());
        venue
            .set_instrument(PERP, dec!(0.001), SettlementStyle::Linear)
            .await;
        venue.set_price(PERP, dec!(30000)).await;

        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let store =
            Arc::new(FilePortfolioStore::open(dir.path(), bus.clone()).unwrap());
        let subscriptions = Arc::new(SubscriptionManager::with_linger(
            venue.clone(),
            Duration::from_millis(50),
        ));
        let pnl = Arc::new(PnlRecorder::new(bus.clone(), 64, Duration::from_secs(1)));

        let manager = HedgingManager::new(
            venue.clone(),
            store.clone(),
            subscriptions.clone(),
            Arc::new(BlackScholesPricer),
            bus.clone(),
            pnl,
            config,
        )
        .with_stop_timeout(Duration::from_millis(300));

        TestRig {
            venue,
            store,
            subscriptions,
            bus,
            manager,
            _dir: dir,
        }
    }

    async fn create_short_call_portfolio(rig: &TestRig, quantity: Decimal) {
        let mut portfolio = Portfolio::new("p1", "BTC", dec!(1000000));
        portfolio.upsert_leg(LegPosition::option(
            CALL,
            quantity,
            dec!(0.05),
            OptionType::Call,
            dec!(30000),
            Utc::now() + ChronoDuration::days(30),
        ));
        rig.store.create(portfolio).await.unwrap();
    }

    fn perp_tick(mark: Decimal, ts: i64) -> MarketTick {
        MarketTick {
            instrument: PERP.to_string(),
            mark_price: mark,
            index_price: mark,
            bid: None,
            ask: None,
            timestamp_ms: ts,
            delta: None,
            iv: None,
            closed: false,
        }
    }

    fn call_tick(delta: f64, ts: i64) -> MarketTick {
        MarketTick {
            instrument: CALL.to_string(),
            mark_price: dec!(0.052),
            index_price: dec!(30000),
            bid: None,
            ask: None,
            timestamp_ms: ts,
            delta: Some(delta),
            iv: Some(0.72),
            closed: false,
        }
    }

    async fn wait_until<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if check().await {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_subscribed(rig: &TestRig) {
        let venue = rig.venue.clone();
        wait_until("subscriptions", || {
            let venue = venue.clone();
            async move {
                venue.is_subscribed(&perp_channel()).await
                    && venue.is_subscribed(&call_channel()).await
            }
        })
        .await;
    }

    async fn warm_up(rig: &TestRig, delta: f64) {
        wait_subscribed(rig).await;
        rig.venue.push_tick(&call_channel(), call_tick(delta, 1)).await;
        rig.venue.push_tick(&perp_channel(), perp_tick(dec!(30000), 2)).await;
    }

    // Scenario A: a single short call, hedged with a long perp position.
    #[tokio::test]
    async fn hedges_short_call_with_perp_buy() {
        let rig = rig(test_config()).await;
        create_short_call_portfolio(&rig, dec!(-10)).await;
        rig.manager.start_hedger("p1", None).await.unwrap();

        // qty -10, delta 0.5 per contract => net delta -5.
        warm_up(&rig, 0.5).await;

        let manager = &rig.manager;
        wait_until("hedge fill", || async move {
            manager
                .get_hedger_stats("p1")
                .await
                .map(|s| s.fills >= 1)
                .unwrap_or(false)
        })
        .await;

        let log = rig.venue.order_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].side, Side::Buy);
        assert_eq!(log[0].quantity, dec!(5.000));
        assert_eq!(log[0].label, "h:p1:1");

        let stats = rig.manager.get_hedger_stats("p1").await.unwrap();
        assert!(stats.last_hedged_delta.abs() < 1e-9);

        let portfolio = rig.store.load("p1").await.unwrap();
        let hedge = portfolio.hedge_position.as_ref().unwrap();
        assert_eq!(hedge.quantity, dec!(5.000));
        // Bought 5 BTC at 30000: cash accounting.
        assert_eq!(portfolio.balance, dec!(1000000) - dec!(150000));

        rig.manager.shutdown().await;
    }

    // Scenario B: hysteresis; only a drift of a full step triggers.
    #[tokio::test]
    async fn hysteresis_band_suppresses_small_drift() {
        let mut config = test_config();
        config.step_size = 0.5;
        let rig = rig(config).await;
        // qty 1: net delta equals the ticker's per-contract delta.
        create_short_call_portfolio(&rig, dec!(1)).await;
        rig.manager.start_hedger("p1", None).await.unwrap();
        wait_subscribed(&rig).await;

        rig.venue.push_tick(&perp_channel(), perp_tick(dec!(30000), 1)).await;
        for (i, delta) in [0.3, -0.4, 0.49].iter().enumerate() {
            rig.venue
                .push_tick(&call_channel(), call_tick(*delta, i as i64 + 2))
                .await;
        }
        // Let all three evaluations run: none may trigger.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.venue.order_log().await.len(), 0);

        rig.venue.push_tick(&call_channel(), call_tick(0.51, 10)).await;
        let manager = &rig.manager;
        wait_until("hedge fill", || async move {
            manager
                .get_hedger_stats("p1")
                .await
                .map(|s| s.fills >= 1)
                .unwrap_or(false)
        })
        .await;

        let log = rig.venue.order_log().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].side, Side::Sell);
        assert_eq!(log[0].quantity, dec!(0.510));

        rig.manager.shutdown().await;
    }

    // Scenario C: a stalled market self-ticks without producing new hedges.
    #[tokio::test]
    async fn quiescent_market_self_ticks_without_hedging() {
        let rig = rig(test_config()).await;
        create_short_call_portfolio(&rig, dec!(-10)).await;
        rig.manager.start_hedger("p1", None).await.unwrap();
        warm_up(&rig, 0.5).await;

        let manager = &rig.manager;
        wait_until("initial hedge", || async move {
            manager
                .get_hedger_stats("p1")
                .await
                .map(|s| s.fills >= 1)
                .unwrap_or(false)
        })
        .await;

        // No ticks for several cadence intervals: self-ticks re-evaluate from
        // the unchanged marks and must not place anything new.
        tokio::time::sleep(Duration::from_millis(250)).await;

        let stats = rig.manager.get_hedger_stats("p1").await.unwrap();
        assert_eq!(stats.state, HedgerState::Armed);
        assert_eq!(stats.fills, 1);
        assert_eq!(rig.venue.order_log().await.len(), 1);

        rig.manager.shutdown().await;
    }

    // Scenario D: retryable rejects are retried with backoff; a fill resets
    // the consecutive error counter.
    #[tokio::test]
    async fn retryable_reject_retries_then_fill_resets_errors() {
        let rig = rig(test_config()).await;
        create_short_call_portfolio(&rig, dec!(-10)).await;
        rig.venue
            .plan_outcome(PlannedOutcome::Reject { retryable: true })
            .await;
        rig.venue
            .plan_outcome(PlannedOutcome::Reject { retryable: true })
            .await;
        // Third attempt falls through to the default fill.

        rig.manager.start_hedger("p1", None).await.unwrap();
        warm_up(&rig, 0.5).await;

        let manager = &rig.manager;
        wait_until("fill after retries", || async move {
            manager
                .get_hedger_stats("p1")
                .await
                .map(|s| s.fills >= 1)
                .unwrap_or(false)
        })
        .await;

        let stats = rig.manager.get_hedger_stats("p1").await.unwrap();
        assert_eq!(stats.consecutive_errors, 0);
        assert_eq!(stats.errors, 2);
        // Same label across all three attempts: at most one venue order.
        let log = rig.venue.order_log().await;
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|o| o.label == "h:p1:1"));
        assert_eq!(rig.venue.order_count().await, 1);

        rig.manager.shutdown().await;
    }

    // A third consecutive retryable reject fails the hedger.
    #[tokio::test]
    async fn three_consecutive_rejects_fail_the_hedger() {
        let rig = rig(test_config()).await;
        create_short_call_portfolio(&rig, dec!(-10)).await;
        for _ in 0..3 {
            rig.venue
                .plan_outcome(PlannedOutcome::Reject { retryable: true })
                .await;
        }

        rig.manager.start_hedger("p1", None).await.unwrap();
        warm_up(&rig, 0.5).await;

        let manager = &rig.manager;
        wait_until("failed state", || async move {
            manager
                .get_hedger_stats("p1")
                .await
                .map(|s| s.state == HedgerState::Failed)
                .unwrap_or(false)
        })
        .await;

        assert_eq!(rig.venue.order_count().await, 0);
        rig.manager.shutdown().await;
    }

    // Scenario E: stop while an order is in flight; the orphan fill is
    // reconciled and persisted after the hedger is gone.
    #[tokio::test]
    async fn stop_during_hedging_reconciles_orphan_fill() {
        let rig = rig(test_config()).await;
        create_short_call_portfolio(&rig, dec!(-10)).await;
        rig.venue
            .plan_outcome(PlannedOutcome::DelayedFill {
                price: dec!(30000),
                delay_ms: 5_000,
            })
            .await;

        rig.manager.start_hedger("p1", None).await.unwrap();
        warm_up(&rig, 0.5).await;

        let manager = &rig.manager;
        wait_until("order in flight", || async move {
            manager
                .get_hedger_stats("p1")
                .await
                .map(|s| s.pending_order_label.is_some())
                .unwrap_or(false)
        })
        .await;

        // Drain times out (300 ms < 5 s ack delay) and the orphan
        // reconciliation task folds the venue fill into the portfolio.
        rig.manager.stop_hedger("p1").await.unwrap();

        let store = rig.store.clone();
        wait_until("orphan fill persisted", || {
            let store = store.clone();
            async move {
                store
                    .load("p1")
                    .await
                    .ok()
                    .and_then(|p| p.hedge_position.as_ref().map(|h| h.quantity == dec!(5.000)))
                    .unwrap_or(false)
            }
        })
        .await;

        assert!(rig.manager.get_hedger_stats("p1").await.is_none());
        rig.manager.shutdown().await;
    }

    // Scenario F: two hedgers share one upstream subscription.
    #[tokio::test]
    async fn two_hedgers_share_one_upstream_subscription() {
        let rig = rig(test_config()).await;
        create_short_call_portfolio(&rig, dec!(-10)).await;
        let mut second = Portfolio::new("p2", "BTC", dec!(500000));
        second.upsert_leg(LegPosition::option(
            CALL,
            dec!(-2),
            dec!(0.05),
            OptionType::Call,
            dec!(30000),
            Utc::now() + ChronoDuration::days(30),
        ));
        rig.store.create(second).await.unwrap();

        rig.manager.start_hedger("p1", None).await.unwrap();
        rig.manager.start_hedger("p2", None).await.unwrap();
        wait_subscribed(&rig).await;

        let subscriptions = rig.subscriptions.clone();
        wait_until("both refs", || {
            let subscriptions = subscriptions.clone();
            async move { subscriptions.ref_count(&perp_channel()).await == 2 }
        })
        .await;
        // One upstream subscribe despite two consumers.
        assert_eq!(rig.venue.subscribe_calls(&perp_channel()).await, 1);

        // Stopping one hedger leaves the other's stream intact.
        rig.manager.stop_hedger("p1").await.unwrap();
        wait_until("ref dropped", || {
            let subscriptions = subscriptions.clone();
            async move { subscriptions.ref_count(&perp_channel()).await == 1 }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.venue.unsubscribe_calls(&perp_channel()).await, 0);

        // Stopping the second releases upstream after the linger.
        rig.manager.stop_hedger("p2").await.unwrap();
        wait_until("upstream released", || {
            let venue = rig.venue.clone();
            async move { venue.unsubscribe_calls(&perp_channel()).await == 1 }
        })
        .await;
        assert_eq!(subscriptions.ref_count(&perp_channel()).await, 0);

        rig.manager.shutdown().await;
    }

    #[tokio::test]
    async fn partial_fill_applies_filled_portion_only() {
        let rig = rig(test_config()).await;
        create_short_call_portfolio(&rig, dec!(-10)).await;
        rig.venue
            .plan_outcome(PlannedOutcome::PartialFill {
                price: dec!(30000),
                filled: dec!(2),
            })
            .await;

        rig.manager.start_hedger("p1", None).await.unwrap();
        warm_up(&rig, 0.5).await;

        let manager = &rig.manager;
        wait_until("partial fill", || async move {
            manager
                .get_hedger_stats("p1")
                .await
                .map(|s| s.fills >= 1)
                .unwrap_or(false)
        })
        .await;

        let portfolio = rig.store.load("p1").await.unwrap();
        assert_eq!(
            portfolio.hedge_position.as_ref().unwrap().quantity,
            dec!(2)
        );

        rig.manager.shutdown().await;
    }

    #[tokio::test]
    async fn expired_instrument_zeroes_leg_and_persists() {
        let rig = rig(test_config()).await;
        create_short_call_portfolio(&rig, dec!(-10)).await;
        rig.manager.start_hedger("p1", None).await.unwrap();
        warm_up(&rig, 0.5).await;

        let manager = &rig.manager;
        wait_until("initial hedge", || async move {
            manager
                .get_hedger_stats("p1")
                .await
                .map(|s| s.fills >= 1)
                .unwrap_or(false)
        })
        .await;

        let mut closed = call_tick(0.5, 100);
        closed.closed = true;
        rig.venue.push_tick(&call_channel(), closed).await;

        let store = rig.store.clone();
        wait_until("expiry persisted", || {
            let store = store.clone();
            async move {
                store
                    .load("p1")
                    .await
                    .map(|p| p.positions[CALL].expired)
                    .unwrap_or(false)
            }
        })
        .await;

        let portfolio = rig.store.load("p1").await.unwrap();
        assert_eq!(portfolio.positions[CALL].last_delta, Some(0.0));

        rig.manager.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_drops_to_warming_and_reconciles() {
        let rig = rig(test_config()).await;
        create_short_call_portfolio(&rig, dec!(-10)).await;
        rig.manager.start_hedger("p1", None).await.unwrap();
        warm_up(&rig, 0.5).await;

        let manager = &rig.manager;
        wait_until("initial hedge", || async move {
            manager
                .get_hedger_stats("p1")
                .await
                .map(|s| s.fills >= 1)
                .unwrap_or(false)
        })
        .await;

        // Someone traded on the venue account behind our back while the
        // transport was down.
        rig.venue.set_position(PERP, dec!(7), dec!(30100)).await;
        rig.venue.set_connection_state(ConnectionState::Reconnecting);
        wait_until("warming", || async move {
            manager
                .get_hedger_stats("p1")
                .await
                .map(|s| s.state == HedgerState::Warming)
                .unwrap_or(false)
        })
        .await;

        rig.venue.set_connection_state(ConnectionState::Connected);
        let store = rig.store.clone();
        wait_until("venue truth adopted", || {
            let store = store.clone();
            async move {
                store
                    .load("p1")
                    .await
                    .ok()
                    .and_then(|p| p.hedge_position.as_ref().map(|h| h.quantity == dec!(7)))
                    .unwrap_or(false)
            }
        })
        .await;

        rig.manager.shutdown().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_and_restart_recovers() {
        let rig = rig(test_config()).await;
        create_short_call_portfolio(&rig, dec!(-10)).await;

        rig.manager.start_hedger("p1", None).await.unwrap();
        rig.manager.start_hedger("p1", None).await.unwrap();
        assert_eq!(rig.manager.list_hedgers().await.len(), 1);

        rig.manager.restart_hedger("p1", None).await.unwrap();
        assert_eq!(rig.manager.list_hedgers().await.len(), 1);

        rig.manager.shutdown().await;
        assert!(rig.manager.list_hedgers().await.is_empty());
    }

    #[tokio::test]
    async fn funding_settlement_flows_into_balance_and_events() {
        let rig = rig(test_config()).await;
        create_short_call_portfolio(&rig, dec!(-10)).await;
        let mut events = rig.bus.subscribe();

        rig.manager.apply_funding("p1", dec!(-25)).await.unwrap();
        let portfolio = rig.store.load("p1").await.unwrap();
        assert_eq!(portfolio.balance, dec!(1000000) - dec!(25));

        // One portfolio_updated per mutation.
        let mut saw_update = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, Event::PortfolioUpdated { ref id, .. } if id == "p1") {
                saw_update = true;
            }
        }
        assert!(saw_update);
    }
}
