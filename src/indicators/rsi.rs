use std::collections::VecDeque;

/// Calculate Relative Strength Index (RSI)
///
/// RSI measures the magnitude of recent price changes to evaluate
/// overbought or oversold conditions.
///
/// Values:
/// - RSI > 70: Overbought
/// - RSI < 30: Oversold
///
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let mut gains = Vec::new();
    let mut losses = Vec::new();

    // Calculate price changes
    for i in 1..prices.len() {
        let change = prices[i] - prices[i - 1];
        if change > 0.0 {
            gains.push(change);
            losses.push(0.0);
        } else {
            gains.push(0.0);
            losses.push(change.abs());
        }
    }

    // Calculate average gain and loss
    let avg_gain: f64 = gains.iter().rev().take(period).sum::<f64>() / period as f64;
    let avg_loss: f64 = losses.iter().rev().take(period).sum::<f64>() / period as f64;

    Some(rsi_from_averages(avg_gain, avg_loss))
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return if avg_gain == 0.0 { 50.0 } else { 100.0 };
    }

    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// Rolling RSI over the last `period` closed-candle changes
///
/// Keeps running gain/loss sums so each close is O(1); the value matches
/// [`calculate_rsi`] over the same window.
#[derive(Debug, Clone)]
pub struct RollingRsi {
    period: usize,
    last_close: Option<f64>,
    changes: VecDeque<(f64, f64)>, // (gain, loss)
    gain_sum: f64,
    loss_sum: f64,
}

impl RollingRsi {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            last_close: None,
            changes: VecDeque::with_capacity(period + 1),
            gain_sum: 0.0,
            loss_sum: 0.0,
        }
    }

    pub fn update(&mut self, close: f64) -> Option<f64> {
        if let Some(prev) = self.last_close {
            let change = close - prev;
            let (gain, loss) = if change > 0.0 {
                (change, 0.0)
            } else {
                (0.0, -change)
            };
            self.changes.push_back((gain, loss));
            self.gain_sum += gain;
            self.loss_sum += loss;

            while self.changes.len() > self.period {
                if let Some((old_gain, old_loss)) = self.changes.pop_front() {
                    self.gain_sum -= old_gain;
                    self.loss_sum -= old_loss;
                }
            }
        }
        self.last_close = Some(close);
        self.value()
    }

    pub fn value(&self) -> Option<f64> {
        if self.changes.len() < self.period {
            return None;
        }
        // Running sums can drift slightly below zero
        let avg_gain = self.gain_sum.max(0.0) / self.period as f64;
        let avg_loss = self.loss_sum.max(0.0) / self.period as f64;
        let avg_loss = if avg_loss < 1e-12 { 0.0 } else { avg_loss };
        Some(rsi_from_averages(avg_gain, avg_loss))
    }
}
