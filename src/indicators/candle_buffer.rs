use crate::models::{Candle, Tick, Timeframe};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Rolling candle window for one (symbol, timeframe)
///
/// Holds at most one open candle. Closed candles are immutable and kept in a
/// bounded history; the oldest is evicted when the window is full.
#[derive(Debug, Clone)]
pub struct CandleSeries {
    timeframe: Timeframe,
    open: Option<Candle>,
    history: VecDeque<Candle>,
    max_candles: usize,
    // Candle building is suspended until this time after a gap
    skip_until: Option<DateTime<Utc>>,
}

impl CandleSeries {
    /// Create a new candle series
    ///
    /// # Arguments
    /// * `max_candles` - Maximum number of closed candles to keep
    pub fn new(timeframe: Timeframe, max_candles: usize) -> Self {
        Self {
            timeframe,
            open: None,
            history: VecDeque::with_capacity(max_candles.max(1)),
            max_candles: max_candles.max(1),
            skip_until: None,
        }
    }

    /// Apply a tick to the open candle
    ///
    /// Returns the candle that was closed, if the tick crossed a boundary.
    pub fn apply_tick(&mut self, tick: &Tick) -> Option<Candle> {
        let bucket = self.timeframe.bucket_start(tick.timestamp);

        if let Some(skip_until) = self.skip_until {
            if bucket < skip_until {
                return None;
            }
            self.skip_until = None;
        }

        let mut closed = None;
        match self.open.as_mut() {
            Some(candle) if candle.open_time == bucket => {
                candle.high = candle.high.max(tick.price);
                candle.low = candle.low.min(tick.price);
                candle.close = tick.price;
                candle.volume += tick.volume;
                return None;
            }
            Some(candle) if candle.open_time > bucket => {
                // Late tick for an already-closed period
                return None;
            }
            Some(_) => {
                closed = self.close_open();
            }
            None => {}
        }

        self.open = Some(Candle::open_from(tick, self.timeframe));
        closed
    }

    /// Close the open candle if its period has fully elapsed at `now`
    pub fn close_elapsed(&mut self, now: DateTime<Utc>) -> Option<Candle> {
        match &self.open {
            Some(candle) if candle.close_time() <= now => self.close_open(),
            _ => None,
        }
    }

    /// Drop the in-progress candle and ignore the rest of its period
    ///
    /// `at` is the time the gap was observed; the period containing it is
    /// considered tainted as well.
    pub fn discard_open(&mut self, at: DateTime<Utc>) -> Option<Candle> {
        let tainted_until = self.timeframe.bucket_start(at) + self.timeframe.duration();
        let dropped = self.open.take();
        let open_until = dropped.as_ref().map(|c| c.close_time());

        self.skip_until = Some(match open_until {
            Some(until) if until > tainted_until => until,
            _ => tainted_until,
        });

        dropped
    }

    fn close_open(&mut self) -> Option<Candle> {
        let mut candle = self.open.take()?;
        candle.closed = true;

        self.history.push_back(candle.clone());
        while self.history.len() > self.max_candles {
            self.history.pop_front();
        }

        Some(candle)
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn open_candle(&self) -> Option<&Candle> {
        self.open.as_ref()
    }

    /// Get the N most recent closed candles (oldest first)
    pub fn get_recent_candles(&self, n: usize) -> Vec<Candle> {
        self.history.iter().rev().take(n).rev().cloned().collect()
    }

    /// Closes of the N most recent closed candles (oldest first)
    pub fn recent_closes(&self, n: usize) -> Vec<f64> {
        self.history.iter().rev().take(n).rev().map(|c| c.close).collect()
    }

    pub fn last_closed(&self) -> Option<&Candle> {
        self.history.back()
    }

    pub fn candle_count(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn tick(seconds: i64, price: f64, sequence: u64) -> Tick {
        Tick {
            symbol: "ETHUSDT".to_string(),
            price,
            volume: 1.0,
            timestamp: base_time() + Duration::seconds(seconds),
            sequence,
        }
    }

    #[test]
    fn test_ticks_update_open_candle() {
        let mut series = CandleSeries::new(Timeframe::M1, 10);

        assert!(series.apply_tick(&tick(0, 100.0, 1)).is_none());
        assert!(series.apply_tick(&tick(10, 103.0, 2)).is_none());
        assert!(series.apply_tick(&tick(20, 99.0, 3)).is_none());
        assert!(series.apply_tick(&tick(30, 101.0, 4)).is_none());

        let open = series.open_candle().unwrap();
        assert_eq!(open.open, 100.0);
        assert_eq!(open.high, 103.0);
        assert_eq!(open.low, 99.0);
        assert_eq!(open.close, 101.0);
        assert_eq!(open.volume, 4.0);
        assert!(!open.closed);
        assert_eq!(series.candle_count(), 0);
    }

    #[test]
    fn test_boundary_closes_candle() {
        let mut series = CandleSeries::new(Timeframe::M1, 10);

        series.apply_tick(&tick(0, 100.0, 1));
        series.apply_tick(&tick(30, 102.0, 2));
        let closed = series.apply_tick(&tick(61, 104.0, 3)).unwrap();

        assert!(closed.closed);
        assert_eq!(closed.close, 102.0);
        assert_eq!(closed.open_time, base_time());
        assert_eq!(series.candle_count(), 1);
        assert_eq!(series.open_candle().unwrap().open, 104.0);
    }

    #[test]
    fn test_max_candles_limit() {
        let mut series = CandleSeries::new(Timeframe::M1, 5);

        for i in 0..11 {
            series.apply_tick(&tick(i * 60, 100.0 + i as f64, i as u64));
        }

        let candles = series.get_recent_candles(100);
        assert_eq!(candles.len(), 5); // Should only keep last 5
        assert_eq!(candles[0].close, 105.0);
        assert_eq!(candles[4].close, 109.0);
    }

    #[test]
    fn test_close_elapsed_without_new_tick() {
        let mut series = CandleSeries::new(Timeframe::M1, 10);
        series.apply_tick(&tick(5, 100.0, 1));

        assert!(series.close_elapsed(base_time() + Duration::seconds(59)).is_none());
        let closed = series.close_elapsed(base_time() + Duration::seconds(60));
        assert!(closed.is_some());
        assert!(series.open_candle().is_none());
    }

    #[test]
    fn test_discard_open_skips_rest_of_period() {
        let mut series = CandleSeries::new(Timeframe::M1, 10);
        series.apply_tick(&tick(0, 100.0, 1));
        series.apply_tick(&tick(60, 101.0, 2)); // closes 10:00

        let dropped = series.discard_open(base_time() + Duration::seconds(75));
        assert!(dropped.is_some());
        assert!(series.open_candle().is_none());

        // Same period after the gap: ignored, no back-fill
        assert!(series.apply_tick(&tick(90, 150.0, 10)).is_none());
        assert!(series.open_candle().is_none());

        // Next period starts cleanly
        series.apply_tick(&tick(120, 102.0, 11));
        assert_eq!(series.open_candle().unwrap().open, 102.0);
        assert_eq!(series.candle_count(), 1);
        assert_eq!(series.recent_closes(5), vec![100.0]);
    }

    #[test]
    fn test_late_tick_is_ignored() {
        let mut series = CandleSeries::new(Timeframe::M1, 10);
        series.apply_tick(&tick(0, 100.0, 1));
        series.apply_tick(&tick(65, 101.0, 2));

        assert!(series.apply_tick(&tick(30, 500.0, 3)).is_none());
        assert_eq!(series.open_candle().unwrap().high, 101.0);
    }
}
