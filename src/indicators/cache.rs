use super::candle_buffer::CandleSeries;
use super::moving_average::Ema;
use super::rsi::RollingRsi;
use crate::models::{Candle, IndicatorSnapshot, IndicatorState, Tick, Timeframe, Trend};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::VecDeque;

/// Indicator periods and windows
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub primary_timeframe: Timeframe,
    pub secondary_timeframe: Option<Timeframe>,
    pub ema_fast_period: usize,
    pub ema_slow_period: usize,
    pub rsi_period: usize,
    pub trend_lookback: usize,  // N candles for "both EMAs rising"
    pub sr_lookback: usize,     // Closes used for support/resistance
    pub rsi_history_len: usize, // RSI values kept for cross detection
    pub max_candles: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            primary_timeframe: Timeframe::M15,
            secondary_timeframe: Some(Timeframe::H1),
            ema_fast_period: 8,
            ema_slow_period: 21,
            rsi_period: 14,
            trend_lookback: 5,
            sr_lookback: 20,
            rsi_history_len: 6,
            max_candles: 200,
        }
    }
}

/// Candles plus incremental indicators for one timeframe
#[derive(Debug, Clone)]
struct TimeframeIndicators {
    candles: CandleSeries,
    ema_fast: Ema,
    ema_slow: Ema,
    rsi: RollingRsi,
    ema_history: VecDeque<(f64, f64)>,
    rsi_history: VecDeque<f64>,
    trend: Trend,
}

impl TimeframeIndicators {
    fn new(timeframe: Timeframe, config: &IndicatorConfig) -> Self {
        Self {
            candles: CandleSeries::new(timeframe, config.max_candles),
            ema_fast: Ema::new(config.ema_fast_period),
            ema_slow: Ema::new(config.ema_slow_period),
            rsi: RollingRsi::new(config.rsi_period),
            ema_history: VecDeque::new(),
            rsi_history: VecDeque::new(),
            trend: Trend::Flat,
        }
    }

    /// Feed a freshly closed candle into the indicators
    fn on_close(&mut self, candle: &Candle, config: &IndicatorConfig) {
        let fast = self.ema_fast.update(candle.close);
        let slow = self.ema_slow.update(candle.close);

        if let (Some(fast), Some(slow)) = (fast, slow) {
            self.ema_history.push_back((fast, slow));
            while self.ema_history.len() > config.trend_lookback + 1 {
                self.ema_history.pop_front();
            }
        }

        if let Some(rsi) = self.rsi.update(candle.close) {
            self.rsi_history.push_back(rsi);
            while self.rsi_history.len() > config.rsi_history_len.max(2) {
                self.rsi_history.pop_front();
            }
        }

        self.trend = classify_trend(&self.ema_history, config.trend_lookback);
    }
}

/// UP when the fast EMA stayed above the slow EMA over the last `lookback`
/// samples and both rose across them; DOWN is the mirror; FLAT otherwise.
pub fn classify_trend(history: &VecDeque<(f64, f64)>, lookback: usize) -> Trend {
    let lookback = lookback.max(1);
    if history.len() < lookback + 1 {
        return Trend::Flat;
    }

    let window: Vec<&(f64, f64)> = history.iter().rev().take(lookback + 1).rev().collect();
    let (first_fast, first_slow) = *window[0];
    let (last_fast, last_slow) = *window[lookback];
    let recent = &window[1..];

    if recent.iter().all(|(f, s)| f > s) && last_fast > first_fast && last_slow > first_slow {
        Trend::Up
    } else if recent.iter().all(|(f, s)| f < s) && last_fast < first_fast && last_slow < first_slow
    {
        Trend::Down
    } else {
        Trend::Flat
    }
}

/// Per-symbol indicator cache
///
/// Updated tick by tick by the symbol's ingest task, which is its only writer.
/// Indicators are computed from closed candles only; the in-progress candle
/// never feeds them.
#[derive(Debug, Clone)]
pub struct IndicatorCache {
    symbol: String,
    config: IndicatorConfig,
    primary: TimeframeIndicators,
    secondary: Option<TimeframeIndicators>,
}

impl IndicatorCache {
    pub fn new(symbol: impl Into<String>, config: IndicatorConfig) -> Self {
        let primary = TimeframeIndicators::new(config.primary_timeframe, &config);
        let secondary = config
            .secondary_timeframe
            .filter(|tf| *tf != config.primary_timeframe)
            .map(|tf| TimeframeIndicators::new(tf, &config));

        Self {
            symbol: symbol.into(),
            config,
            primary,
            secondary,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Apply a tick; returns true when a primary-timeframe candle closed
    pub fn apply_tick(&mut self, tick: &Tick) -> bool {
        if let Some(secondary) = self.secondary.as_mut() {
            if let Some(candle) = secondary.candles.apply_tick(tick) {
                secondary.on_close(&candle, &self.config);
            }
        }

        match self.primary.candles.apply_tick(tick) {
            Some(candle) => {
                self.primary.on_close(&candle, &self.config);
                tracing::debug!(
                    symbol = %self.symbol,
                    close = candle.close,
                    open_time = %candle.open_time,
                    "Primary candle closed"
                );
                true
            }
            None => false,
        }
    }

    /// Close candles whose period elapsed with no further ticks
    pub fn close_elapsed(&mut self, now: DateTime<Utc>) -> bool {
        if let Some(secondary) = self.secondary.as_mut() {
            if let Some(candle) = secondary.candles.close_elapsed(now) {
                secondary.on_close(&candle, &self.config);
            }
        }

        match self.primary.candles.close_elapsed(now) {
            Some(candle) => {
                self.primary.on_close(&candle, &self.config);
                true
            }
            None => false,
        }
    }

    /// Drop the in-progress candles after a sequence gap
    ///
    /// Closed history and indicator state are untouched.
    pub fn discard_open(&mut self, at: DateTime<Utc>) {
        let dropped = self.primary.candles.discard_open(at).is_some();
        if let Some(secondary) = self.secondary.as_mut() {
            secondary.candles.discard_open(at);
        }
        tracing::warn!(
            symbol = %self.symbol,
            dropped_open_candle = dropped,
            "Sequence gap: discarded in-progress candle"
        );
    }

    /// Current indicator state, once enough closed candles exist
    pub fn state(&self) -> Option<IndicatorState> {
        let ema8 = self.primary.ema_fast.value()?;
        let ema21 = self.primary.ema_slow.value()?;
        let rsi14 = self.primary.rsi.value()?;

        let closes = self.primary.candles.recent_closes(self.config.sr_lookback);
        let support_level = closes.iter().copied().fold(f64::INFINITY, f64::min);
        let resistance_level = closes.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Some(IndicatorState {
            ema8,
            ema21,
            rsi14,
            trend: self.primary.trend,
            support_level,
            resistance_level,
        })
    }

    /// Everything the signal engine needs for one evaluation
    pub fn snapshot(&self) -> Option<IndicatorSnapshot> {
        let state = self.state()?;
        let last = self.primary.candles.last_closed()?;
        let secondary_trend = self
            .secondary
            .as_ref()
            .filter(|s| s.ema_slow.value().is_some())
            .map(|s| s.trend);

        Some(IndicatorSnapshot {
            symbol: self.symbol.clone(),
            state,
            secondary_trend,
            rsi_history: self.primary.rsi_history.iter().copied().collect(),
            last_close: last.close,
            candle_open_time: last.open_time,
        })
    }

    pub fn primary_timeframe(&self) -> Timeframe {
        self.config.primary_timeframe
    }

    pub fn closed_candles(&self, n: usize) -> Vec<Candle> {
        self.primary.candles.get_recent_candles(n)
    }

    pub fn open_candle(&self) -> Option<&Candle> {
        self.primary.candles.open_candle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{calculate_ema, calculate_rsi};
    use chrono::{Duration, TimeZone};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn config() -> IndicatorConfig {
        IndicatorConfig {
            primary_timeframe: Timeframe::M1,
            secondary_timeframe: Some(Timeframe::M5),
            ..Default::default()
        }
    }

    /// One tick per minute at the given closes, plus a final tick to close the last one
    fn feed_closes(cache: &mut IndicatorCache, closes: &[f64]) -> u64 {
        let mut seq = 0;
        for (i, close) in closes.iter().chain(std::iter::once(closes.last().unwrap())).enumerate() {
            seq += 1;
            cache.apply_tick(&Tick {
                symbol: "ETHUSDT".to_string(),
                price: *close,
                volume: 1.0,
                timestamp: base_time() + Duration::minutes(i as i64) + Duration::seconds(1),
                sequence: seq,
            });
        }
        seq
    }

    #[test]
    fn test_classify_trend() {
        let up: VecDeque<(f64, f64)> = (0..6).map(|i| (101.0 + i as f64, 100.0 + i as f64 * 0.5)).collect();
        assert_eq!(classify_trend(&up, 5), Trend::Up);

        let down: VecDeque<(f64, f64)> = (0..6).map(|i| (99.0 - i as f64, 100.0 - i as f64 * 0.5)).collect();
        assert_eq!(classify_trend(&down, 5), Trend::Down);

        let short: VecDeque<(f64, f64)> = up.iter().take(3).copied().collect();
        assert_eq!(classify_trend(&short, 5), Trend::Flat);

        // Fast above slow but slow EMA falling
        let mixed: VecDeque<(f64, f64)> = (0..6).map(|i| (110.0 + i as f64, 100.0 - i as f64)).collect();
        assert_eq!(classify_trend(&mixed, 5), Trend::Flat);
    }

    #[test]
    fn test_no_state_until_warmed_up() {
        let mut cache = IndicatorCache::new("ETHUSDT", config());
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        feed_closes(&mut cache, &closes);
        assert!(cache.state().is_none());
        assert!(cache.snapshot().is_none());
    }

    #[test]
    fn test_uptrend_state_matches_batch_indicators() {
        let mut cache = IndicatorCache::new("ETHUSDT", config());
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64 * 0.5).collect();
        feed_closes(&mut cache, &closes);

        let state = cache.state().unwrap();
        assert!((state.ema8 - calculate_ema(&closes, 8).unwrap()).abs() < 1e-9);
        assert!((state.ema21 - calculate_ema(&closes, 21).unwrap()).abs() < 1e-9);
        assert!((state.rsi14 - calculate_rsi(&closes, 14).unwrap()).abs() < 1e-9);
        assert_eq!(state.trend, Trend::Up);
        assert_eq!(state.resistance_level, 119.5);
        assert_eq!(state.support_level, 110.0); // min of last 20 closes

        let snapshot = cache.snapshot().unwrap();
        assert_eq!(snapshot.last_close, 119.5);
        assert_eq!(snapshot.rsi_history.len(), 6);
        assert_eq!(snapshot.secondary_trend, None); // only 8 five-minute candles closed
    }

    #[test]
    fn test_downtrend_detected() {
        let mut cache = IndicatorCache::new("ETHUSDT", config());
        let closes: Vec<f64> = (0..40).map(|i| 200.0 - i as f64).collect();
        feed_closes(&mut cache, &closes);

        assert_eq!(cache.state().unwrap().trend, Trend::Down);
    }

    #[test]
    fn test_open_candle_does_not_feed_indicators() {
        let mut cache = IndicatorCache::new("ETHUSDT", config());
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let seq = feed_closes(&mut cache, &closes);
        let before = cache.state().unwrap();

        // Wild tick inside the open candle
        cache.apply_tick(&Tick {
            symbol: "ETHUSDT".to_string(),
            price: 10_000.0,
            volume: 1.0,
            timestamp: base_time() + Duration::minutes(30) + Duration::seconds(20),
            sequence: seq + 1,
        });

        assert_eq!(cache.state().unwrap(), before);
    }

    #[test]
    fn test_gap_discards_open_candle_without_corrupting_history() {
        let mut cache = IndicatorCache::new("ETHUSDT", config());
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        feed_closes(&mut cache, &closes);
        let before = cache.state().unwrap();
        let history_before = cache.closed_candles(100).len();

        let gap_at = base_time() + Duration::minutes(30) + Duration::seconds(40);
        cache.discard_open(gap_at);
        assert!(cache.open_candle().is_none());

        // Rest of the tainted minute is ignored
        let closed = cache.apply_tick(&Tick {
            symbol: "ETHUSDT".to_string(),
            price: 50.0,
            volume: 1.0,
            timestamp: gap_at + Duration::seconds(5),
            sequence: 100,
        });
        assert!(!closed);
        assert_eq!(cache.state().unwrap(), before);
        assert_eq!(cache.closed_candles(100).len(), history_before);

        // Next period opens, and its close is the next indicator update
        cache.apply_tick(&Tick {
            symbol: "ETHUSDT".to_string(),
            price: 131.0,
            volume: 1.0,
            timestamp: base_time() + Duration::minutes(31) + Duration::seconds(1),
            sequence: 101,
        });
        let closed = cache.close_elapsed(base_time() + Duration::minutes(32));
        assert!(closed);

        let mut expected = closes.clone();
        expected.push(131.0);
        let state = cache.state().unwrap();
        assert!((state.ema8 - calculate_ema(&expected, 8).unwrap()).abs() < 1e-9);
        assert!((state.rsi14 - calculate_rsi(&expected, 14).unwrap()).abs() < 1e-9);
    }
}
