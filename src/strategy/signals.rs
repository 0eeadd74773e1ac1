use serde::Deserialize;

/// Configuration for signal generation
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub cross_lookback: usize, // K: how recent an RSI threshold cross must be
    pub exit_rsi_long: f64,    // RSI extreme that closes a long
    pub exit_rsi_short: f64,   // RSI extreme that closes a short
    pub confidence: ConfidenceWeights,
    /// Averaging policy; disabled unless explicitly configured
    pub averaging: Option<AveragingConfig>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            cross_lookback: 3,
            exit_rsi_long: 80.0,
            exit_rsi_short: 20.0,
            confidence: ConfidenceWeights::default(),
            averaging: None,
        }
    }
}

impl SignalConfig {
    pub fn max_average_count(&self) -> u32 {
        self.averaging.as_ref().map_or(0, |a| a.max_average_count)
    }
}

/// Averaging policy constants
///
/// No field has a default: the pullback trigger and size decay must come from
/// configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AveragingConfig {
    pub pullback_pct: f64,      // e.g. 0.015 = 1.5% against the position
    pub decay: f64,             // Each average is entry_qty * decay^n
    pub max_average_count: u32,
}

/// Weights and normalizers for the confidence score
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub ema_weight: f64,
    pub rsi_weight: f64,
    pub timeframe_weight: f64,
    pub ema_separation_full: f64, // |ema8 - ema21| / ema21 that scores 1.0
    pub rsi_distance_full: f64,   // RSI points past the threshold that score 1.0
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            ema_weight: 0.4,
            rsi_weight: 0.3,
            timeframe_weight: 0.3,
            ema_separation_full: 0.005,
            rsi_distance_full: 10.0,
        }
    }
}

/// Raw inputs to the confidence score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceFactors {
    pub ema_separation: f64,
    pub rsi_distance: f64,
    pub timeframe_agrees: bool,
}

fn normalized(value: f64, full: f64) -> f64 {
    // NaN carries no evidence; +inf saturates like any value past `full`
    if value.is_nan() || value <= 0.0 {
        return 0.0;
    }
    if full <= 0.0 {
        return 1.0;
    }
    (value / full).min(1.0)
}

/// Weighted confidence in [0, 1]
///
/// Monotonic non-decreasing in each factor: wider EMA separation, a larger RSI
/// distance, or secondary-timeframe agreement never lower the score. The
/// timeframe term scores 1.0 when confirmed and 0.5 otherwise.
pub fn calculate_confidence(factors: &ConfidenceFactors, weights: &ConfidenceWeights) -> f64 {
    let ema_weight = weights.ema_weight.max(0.0);
    let rsi_weight = weights.rsi_weight.max(0.0);
    let timeframe_weight = weights.timeframe_weight.max(0.0);
    let total = ema_weight + rsi_weight + timeframe_weight;
    if total <= 0.0 || !total.is_finite() {
        return 0.0;
    }

    let ema = normalized(factors.ema_separation, weights.ema_separation_full);
    let rsi = normalized(factors.rsi_distance, weights.rsi_distance_full);
    let timeframe = if factors.timeframe_agrees { 1.0 } else { 0.5 };

    let score = (ema_weight * ema + rsi_weight * rsi + timeframe_weight * timeframe) / total;
    score.clamp(0.0, 1.0)
}

/// RSI crossed up through `threshold` within the last `lookback` values and is
/// still at or above it
pub fn crossed_above(rsi_history: &[f64], threshold: f64, lookback: usize) -> bool {
    let Some(&current) = rsi_history.last() else {
        return false;
    };
    if current < threshold || rsi_history.len() < 2 {
        return false;
    }

    let start = rsi_history.len().saturating_sub(lookback.max(1)).max(1);
    (start..rsi_history.len()).any(|i| rsi_history[i - 1] < threshold && rsi_history[i] >= threshold)
}

/// RSI crossed down through `threshold` within the last `lookback` values and
/// is still at or below it
pub fn crossed_below(rsi_history: &[f64], threshold: f64, lookback: usize) -> bool {
    let Some(&current) = rsi_history.last() else {
        return false;
    };
    if current > threshold || rsi_history.len() < 2 {
        return false;
    }

    let start = rsi_history.len().saturating_sub(lookback.max(1)).max(1);
    (start..rsi_history.len()).any(|i| rsi_history[i - 1] > threshold && rsi_history[i] <= threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_confidence_bounds() {
        let weights = ConfidenceWeights::default();

        let weakest = ConfidenceFactors {
            ema_separation: 0.0,
            rsi_distance: 0.0,
            timeframe_agrees: false,
        };
        assert!((calculate_confidence(&weakest, &weights) - 0.15).abs() < 1e-12);

        let strongest = ConfidenceFactors {
            ema_separation: 1.0,
            rsi_distance: 100.0,
            timeframe_agrees: true,
        };
        assert_eq!(calculate_confidence(&strongest, &weights), 1.0);
    }

    #[test]
    fn test_confidence_ignores_nan() {
        let weights = ConfidenceWeights::default();
        let factors = ConfidenceFactors {
            ema_separation: f64::NAN,
            rsi_distance: f64::INFINITY,
            timeframe_agrees: true,
        };
        // NaN EMA term scores nothing, infinite RSI distance scores in full
        let c = calculate_confidence(&factors, &weights);
        assert!((c - 0.6).abs() < 1e-12, "{}", c);

        let factors = ConfidenceFactors {
            ema_separation: f64::INFINITY,
            rsi_distance: f64::NAN,
            timeframe_agrees: true,
        };
        assert!((calculate_confidence(&factors, &weights) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_confidence_saturates_at_extremes() {
        let weights = ConfidenceWeights::default();
        let score = |sep: f64| {
            calculate_confidence(
                &ConfidenceFactors {
                    ema_separation: sep,
                    rsi_distance: 0.0,
                    timeframe_agrees: false,
                },
                &weights,
            )
        };
        assert_eq!(score(1e300), score(f64::INFINITY));
        assert!(score(f64::INFINITY) >= score(f64::MAX));
        assert_eq!(score(f64::NEG_INFINITY), score(0.0));
    }

    #[test]
    fn test_confidence_zero_weights() {
        let weights = ConfidenceWeights {
            ema_weight: 0.0,
            rsi_weight: 0.0,
            timeframe_weight: 0.0,
            ..Default::default()
        };
        let factors = ConfidenceFactors {
            ema_separation: 0.01,
            rsi_distance: 5.0,
            timeframe_agrees: true,
        };
        assert_eq!(calculate_confidence(&factors, &weights), 0.0);
    }

    #[test]
    fn test_crossed_above() {
        assert!(crossed_above(&[25.0, 28.0, 35.0], 30.0, 3));
        assert!(crossed_above(&[28.0, 31.0, 33.0, 36.0], 30.0, 3));
        // Cross too old
        assert!(!crossed_above(&[28.0, 31.0, 33.0, 36.0, 38.0], 30.0, 3));
        // Crossed then fell back
        assert!(!crossed_above(&[28.0, 35.0, 29.0], 30.0, 3));
        assert!(!crossed_above(&[35.0], 30.0, 3));
        assert!(!crossed_above(&[], 30.0, 3));
    }

    #[test]
    fn test_crossed_below() {
        assert!(crossed_below(&[75.0, 72.0, 65.0], 70.0, 3));
        assert!(!crossed_below(&[65.0, 60.0, 55.0], 70.0, 3));
        assert!(!crossed_below(&[75.0, 65.0, 72.0], 70.0, 3));
    }

    proptest! {
        #[test]
        fn prop_confidence_in_unit_interval(
            sep in -1.0f64..1.0,
            dist in -100.0f64..100.0,
            agrees in any::<bool>(),
            w1 in 0.0f64..5.0,
            w2 in 0.0f64..5.0,
            w3 in 0.0f64..5.0,
        ) {
            let weights = ConfidenceWeights {
                ema_weight: w1,
                rsi_weight: w2,
                timeframe_weight: w3,
                ..Default::default()
            };
            let factors = ConfidenceFactors { ema_separation: sep, rsi_distance: dist, timeframe_agrees: agrees };
            let c = calculate_confidence(&factors, &weights);
            prop_assert!((0.0..=1.0).contains(&c));
        }

        #[test]
        fn prop_confidence_monotonic(
            sep in 0.0f64..0.05,
            sep_bump in 0.0f64..0.05,
            dist in 0.0f64..50.0,
            dist_bump in 0.0f64..50.0,
            agrees in any::<bool>(),
        ) {
            let weights = ConfidenceWeights::default();
            let base = ConfidenceFactors { ema_separation: sep, rsi_distance: dist, timeframe_agrees: agrees };
            let c = calculate_confidence(&base, &weights);

            let wider = ConfidenceFactors { ema_separation: sep + sep_bump, ..base };
            prop_assert!(calculate_confidence(&wider, &weights) >= c);

            let further = ConfidenceFactors { rsi_distance: dist + dist_bump, ..base };
            prop_assert!(calculate_confidence(&further, &weights) >= c);

            let confirmed = ConfidenceFactors { timeframe_agrees: true, ..base };
            prop_assert!(calculate_confidence(&confirmed, &weights) >= c);
        }
    }
}
