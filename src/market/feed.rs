use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::engine::EvaluationQueue;
use crate::error::FeedError;
use crate::indicators::{IndicatorCache, IndicatorConfig};
use crate::models::Tick;
use crate::retry::RetryPolicy;

pub type TickStream = BoxStream<'static, Result<Tick, FeedError>>;

/// Live source of normalized ticks, one connection per symbol
#[async_trait]
pub trait TickSource: Send + Sync {
    async fn connect(&self, symbol: &str) -> Result<TickStream, FeedError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub stream_url: String,
    pub channel_capacity: usize,
    pub sweep_interval_ms: u64, // Closes candles when ticks stop arriving
    pub reconnect: RetryPolicy,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            stream_url: super::binance_ws::FUTURES_WS_URL.to_string(),
            channel_capacity: 1_024,
            sweep_interval_ms: 1_000,
            reconnect: RetryPolicy::feed(),
        }
    }
}

/// Outcome of checking a tick's sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    InOrder,
    Gap { missing: u64 },
    Stale,
}

/// Per-symbol sequence filter; survives reconnects
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    last: Option<u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, sequence: u64) -> SequenceCheck {
        match self.last {
            Some(last) if sequence <= last => SequenceCheck::Stale,
            Some(last) if sequence > last + 1 => {
                self.last = Some(sequence);
                SequenceCheck::Gap {
                    missing: sequence - last - 1,
                }
            }
            _ => {
                self.last = Some(sequence);
                SequenceCheck::InOrder
            }
        }
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }
}

/// What the stream task hands to the ingest task
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Tick(Tick),
    Gap { at: DateTime<Utc>, missing: u64 },
}

/// Latest traded price per symbol
#[derive(Debug, Default, Clone)]
pub struct PriceBoard {
    prices: Arc<RwLock<HashMap<String, (f64, DateTime<Utc>)>>>,
}

impl PriceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update(&self, symbol: &str, price: f64, at: DateTime<Utc>) {
        self.prices.write().await.insert(symbol.to_string(), (price, at));
    }

    pub async fn get(&self, symbol: &str) -> Option<f64> {
        self.prices.read().await.get(symbol).map(|(p, _)| *p)
    }

    pub async fn all(&self) -> HashMap<String, f64> {
        self.prices
            .read()
            .await
            .iter()
            .map(|(s, (p, _))| (s.clone(), *p))
            .collect()
    }
}

/// Running feed: shared caches plus the spawned tasks
pub struct FeedHandles {
    pub caches: HashMap<String, Arc<Mutex<IndicatorCache>>>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// One live subscription per symbol feeding its IndicatorCache
pub struct MarketDataFeed {
    source: Arc<dyn TickSource>,
    config: FeedConfig,
    indicators: IndicatorConfig,
}

impl MarketDataFeed {
    pub fn new(source: Arc<dyn TickSource>, config: FeedConfig, indicators: IndicatorConfig) -> Self {
        Self {
            source,
            config,
            indicators,
        }
    }

    /// Spawn a stream task and an ingest task per symbol
    ///
    /// Symbols are independent: one failing stream never blocks the others.
    pub fn subscribe(
        &self,
        symbols: &[String],
        queue: Arc<EvaluationQueue>,
        prices: PriceBoard,
        shutdown: watch::Receiver<bool>,
    ) -> FeedHandles {
        let mut caches = HashMap::new();
        let mut tasks = Vec::new();

        for symbol in symbols {
            let cache = Arc::new(Mutex::new(IndicatorCache::new(symbol.clone(), self.indicators.clone())));
            let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));

            tasks.push(tokio::spawn(run_stream(
                symbol.clone(),
                self.source.clone(),
                self.config.reconnect.clone(),
                tx,
                shutdown.clone(),
            )));
            tasks.push(tokio::spawn(run_ingest(
                symbol.clone(),
                cache.clone(),
                rx,
                queue.clone(),
                prices.clone(),
                Duration::from_millis(self.config.sweep_interval_ms.max(1)),
            )));

            tracing::info!(symbol = %symbol, "Subscribed to market data");
            caches.insert(symbol.clone(), cache);
        }

        FeedHandles { caches, tasks }
    }
}

async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

/// Connect, filter sequences, forward events; reconnect with backoff forever
pub async fn run_stream(
    symbol: String,
    source: Arc<dyn TickSource>,
    retry: RetryPolicy,
    tx: mpsc::Sender<FeedEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tracker = SequenceTracker::new();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut stream = match source.connect(&symbol).await {
            Ok(stream) => stream,
            Err(e) => {
                if attempt >= retry.max_retries {
                    tracing::error!(symbol = %symbol, error = %e, "Giving up on market data stream");
                    break;
                }
                let delay = retry.delay_for(attempt);
                attempt = attempt.saturating_add(1);
                tracing::warn!(
                    symbol = %symbol,
                    error = %e,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Market data connect failed, retrying"
                );
                if wait_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };

        if attempt > 0 {
            tracing::info!(symbol = %symbol, attempts = attempt, "Market data reconnected");
        }

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = shutdown.changed() => return,
            };

            let tick = match item {
                Some(Ok(tick)) => tick,
                Some(Err(FeedError::Decode(msg))) => {
                    tracing::debug!(symbol = %symbol, error = %msg, "Dropping malformed message");
                    continue;
                }
                Some(Err(e)) => {
                    tracing::warn!(symbol = %symbol, error = %e, "Market data stream failed");
                    break;
                }
                None => {
                    tracing::warn!(symbol = %symbol, "Market data stream ended");
                    break;
                }
            };
            // A healthy connection resets the backoff
            attempt = 0;

            let event = match tracker.observe(tick.sequence) {
                SequenceCheck::Stale => {
                    tracing::debug!(symbol = %symbol, sequence = tick.sequence, "Dropping stale tick");
                    continue;
                }
                SequenceCheck::Gap { missing } => {
                    tracing::warn!(
                        symbol = %symbol,
                        missing = missing,
                        sequence = tick.sequence,
                        "Sequence gap, discarding open candle"
                    );
                    Some(FeedEvent::Gap {
                        at: tick.timestamp,
                        missing,
                    })
                }
                SequenceCheck::InOrder => None,
            };

            for event in event.into_iter().chain(std::iter::once(FeedEvent::Tick(tick))) {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }

        let delay = retry.delay_for(attempt);
        attempt = attempt.saturating_add(1);
        if wait_or_shutdown(delay, &mut shutdown).await {
            break;
        }
    }

    tracing::info!(symbol = %symbol, "Market data stream stopped");
}

/// Single writer of one symbol's IndicatorCache
pub async fn run_ingest(
    symbol: String,
    cache: Arc<Mutex<IndicatorCache>>,
    mut rx: mpsc::Receiver<FeedEvent>,
    queue: Arc<EvaluationQueue>,
    prices: PriceBoard,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + sweep_interval, sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let closed = tokio::select! {
            event = rx.recv() => match event {
                Some(FeedEvent::Tick(tick)) => {
                    prices.update(&symbol, tick.price, tick.timestamp).await;
                    cache.lock().await.apply_tick(&tick)
                }
                Some(FeedEvent::Gap { at, .. }) => {
                    cache.lock().await.discard_open(at);
                    false
                }
                None => break,
            },
            _ = sweep.tick() => cache.lock().await.close_elapsed(Utc::now()),
        };

        if closed {
            queue.request(&symbol);
        }
    }

    tracing::debug!(symbol = %symbol, "Ingest task stopped");
}
