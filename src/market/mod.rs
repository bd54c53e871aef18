//! Reference-counted market-data subscriptions.
//!
//! Many hedgers can watch the same instrument; the [`SubscriptionManager`]
//! keeps one upstream subscription per channel and fans ticks out to every
//! holder. The upstream subscription is taken on the 0→1 acquire and dropped
//! on the 1→0 release, after a linger so a stop/start cycle does not thrash
//! the venue. Each consumer reads through a bounded queue; a consumer that
//! falls behind loses the oldest ticks and sees a `StaleWarning` instead,
//! and upstream delivery is never blocked.

use crate::exchange::{ExchangeApi, ExchangeError, MarketTick};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default delay between the last release and the upstream unsubscribe.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(5);

/// Per-consumer queue depth, in ticks.
const CONSUMER_QUEUE_DEPTH: usize = 64;

/// What a consumer observes on its stream.
#[derive(Debug, Clone)]
pub enum TickEvent {
    Tick(MarketTick),
    /// The consumer fell behind and `missed` ticks were dropped.
    StaleWarning { missed: u64 },
}

/// A handle on one channel's tick stream.
///
/// Dropping the stream without calling [`SubscriptionManager::release`]
/// leaks the channel's ref count; hedgers always release on their exit path.
pub struct MarketStream {
    channel: String,
    rx: broadcast::Receiver<MarketTick>,
}

impl MarketStream {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next event, or `None` once the channel is gone (manager shutdown).
    pub async fn recv(&mut self) -> Option<TickEvent> {
        match self.rx.recv().await {
            Ok(tick) => Some(TickEvent::Tick(tick)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Some(TickEvent::StaleWarning { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

struct ChannelEntry {
    refs: usize,
    tx: broadcast::Sender<MarketTick>,
    relay: JoinHandle<()>,
    linger: Option<JoinHandle<()>>,
}

/// Ref-counted fan-out of instrument streams over one exchange session.
pub struct SubscriptionManager {
    exchange: Arc<dyn ExchangeApi>,
    linger: Duration,
    entries: Arc<Mutex<HashMap<String, ChannelEntry>>>,
}

impl SubscriptionManager {
    pub fn new(exchange: Arc<dyn ExchangeApi>) -> Self {
        Self::with_linger(exchange, DEFAULT_LINGER)
    }

    pub fn with_linger(exchange: Arc<dyn ExchangeApi>, linger: Duration) -> Self {
        Self {
            exchange,
            linger,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire a stream for `channel`, subscribing upstream on first use.
    pub async fn acquire(&self, channel: &str) -> Result<MarketStream, ExchangeError> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(channel) {
            entry.refs += 1;
            if let Some(linger) = entry.linger.take() {
                linger.abort();
                debug!(%channel, "Linger cancelled by re-acquire");
            }
            debug!(%channel, refs = entry.refs, "Subscription acquired (shared)");
            return Ok(MarketStream {
                channel: channel.to_string(),
                rx: entry.tx.subscribe(),
            });
        }

        let mut upstream = self.exchange.subscribe(channel).await?;
        let (tx, rx) = broadcast::channel(CONSUMER_QUEUE_DEPTH);

        let relay_tx = tx.clone();
        let relay_channel = channel.to_string();
        let relay = tokio::spawn(async move {
            loop {
                match upstream.recv().await {
                    Ok(tick) => {
                        let _ = relay_tx.send(tick);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(channel = %relay_channel, missed, "Relay lagged behind upstream");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        entries.insert(
            channel.to_string(),
            ChannelEntry {
                refs: 1,
                tx,
                relay,
                linger: None,
            },
        );
        info!(%channel, "Subscribed upstream");

        Ok(MarketStream {
            channel: channel.to_string(),
            rx,
        })
    }

    /// Release a stream; the last release unsubscribes upstream after the
    /// linger elapses without a re-acquire.
    pub async fn release(&self, stream: MarketStream) {
        let MarketStream { channel, rx } = stream;
        drop(rx);

        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&channel) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        debug!(%channel, refs = entry.refs, "Subscription released");
        if entry.refs > 0 {
            return;
        }

        let exchange = self.exchange.clone();
        let entries_map = self.entries.clone();
        let linger = self.linger;
        let linger_channel = channel.clone();
        entry.linger = Some(tokio::spawn(async move {
            tokio::time::sleep(linger).await;

            let mut entries = entries_map.lock().await;
            let Some(entry) = entries.get(&linger_channel) else {
                return;
            };
            if entry.refs > 0 {
                return;
            }
            let entry = entries.remove(&linger_channel).expect("checked above");
            entry.relay.abort();
            drop(entries);

            if let Err(e) = exchange.unsubscribe(&linger_channel).await {
                warn!(channel = %linger_channel, error = %e, "Upstream unsubscribe failed");
            } else {
                info!(channel = %linger_channel, "Unsubscribed upstream after linger");
            }
        }));
    }

    /// Current ref count for a channel (0 when unknown).
    pub async fn ref_count(&self, channel: &str) -> usize {
        self.entries
            .lock()
            .await
            .get(channel)
            .map(|e| e.refs)
            .unwrap_or(0)
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    /// Drop every channel and unsubscribe upstream immediately.
    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        let drained: Vec<(String, ChannelEntry)> = entries.drain().collect();
        drop(entries);

        for (channel, entry) in drained {
            entry.relay.abort();
            if let Some(linger) = entry.linger {
                linger.abort();
            }
            if let Err(e) = self.exchange.unsubscribe(&channel).await {
                warn!(%channel, error = %e, "Unsubscribe on shutdown failed");
            }
        }
        info!("Subscription manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchange;
    use rust_decimal_macros::dec;

    const CHANNEL: &str = "ticker.BTC-PERPETUAL.100ms";

    fn tick(n: i64) -> MarketTick {
        MarketTick {
            instrument: "BTC-PERPETUAL".to_string(),
            mark_price: dec!(30000),
            index_price: dec!(30000),
            bid: None,
            ask: None,
            timestamp_ms: n,
            delta: None,
            iv: None,
            closed: false,
        }
    }

    #[tokio::test]
    async fn shared_channel_subscribes_upstream_once() {
        let venue = Arc::new(MockExchange::new());
        let manager = SubscriptionManager::with_linger(venue.clone(), Duration::from_millis(10));

        let mut a = manager.acquire(CHANNEL).await.unwrap();
        let mut b = manager.acquire(CHANNEL).await.unwrap();
        assert_eq!(venue.subscribe_calls(CHANNEL).await, 1);
        assert_eq!(manager.ref_count(CHANNEL).await, 2);

        venue.push_tick(CHANNEL, tick(1)).await;
        assert!(matches!(a.recv().await, Some(TickEvent::Tick(_))));
        assert!(matches!(b.recv().await, Some(TickEvent::Tick(_))));
    }

    #[tokio::test]
    async fn release_unsubscribes_after_linger_only_when_last() {
        let venue = Arc::new(MockExchange::new());
        let manager = SubscriptionManager::with_linger(venue.clone(), Duration::from_millis(20));

        let a = manager.acquire(CHANNEL).await.unwrap();
        let b = manager.acquire(CHANNEL).await.unwrap();

        manager.release(a).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        // One holder remains: no unsubscribe.
        assert_eq!(venue.unsubscribe_calls(CHANNEL).await, 0);
        assert_eq!(manager.ref_count(CHANNEL).await, 1);

        manager.release(b).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(venue.unsubscribe_calls(CHANNEL).await, 1);
        assert_eq!(manager.ref_count(CHANNEL).await, 0);
    }

    #[tokio::test]
    async fn reacquire_during_linger_keeps_subscription() {
        let venue = Arc::new(MockExchange::new());
        let manager = SubscriptionManager::with_linger(venue.clone(), Duration::from_millis(50));

        let a = manager.acquire(CHANNEL).await.unwrap();
        manager.release(a).await;

        // Re-acquire before the linger fires.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut b = manager.acquire(CHANNEL).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(venue.unsubscribe_calls(CHANNEL).await, 0);
        assert_eq!(venue.subscribe_calls(CHANNEL).await, 1);

        // Stream still live.
        venue.push_tick(CHANNEL, tick(2)).await;
        assert!(matches!(b.recv().await, Some(TickEvent::Tick(_))));
    }

    #[tokio::test]
    async fn slow_consumer_sees_stale_warning_not_blockage() {
        let venue = Arc::new(MockExchange::new());
        let manager = SubscriptionManager::with_linger(venue.clone(), Duration::from_millis(10));

        let mut stream = manager.acquire(CHANNEL).await.unwrap();

        // Overflow the consumer queue without reading: push in batches and
        // yield so the relay drains upstream between them.
        for batch in 0..3 {
            for n in 0..CONSUMER_QUEUE_DEPTH as i64 {
                venue.push_tick(CHANNEL, tick(batch * 100 + n)).await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        match stream.recv().await {
            Some(TickEvent::StaleWarning { missed }) => assert!(missed >= 1),
            other => panic!("expected StaleWarning, got {other:?}"),
        }
        // After the warning the consumer resumes from the oldest retained tick.
        assert!(matches!(stream.recv().await, Some(TickEvent::Tick(_))));
    }

    #[tokio::test]
    async fn shutdown_clears_all_counts() {
        let venue = Arc::new(MockExchange::new());
        let manager = SubscriptionManager::with_linger(venue.clone(), Duration::from_secs(30));

        let _a = manager.acquire(CHANNEL).await.unwrap();
        let _b = manager.acquire("ticker.ETH-PERPETUAL.100ms").await.unwrap();

        manager.shutdown().await;
        assert_eq!(manager.ref_count(CHANNEL).await, 0);
        assert!(manager.active_channels().await.is_empty());
        assert_eq!(venue.unsubscribe_calls(CHANNEL).await, 1);
    }
}
