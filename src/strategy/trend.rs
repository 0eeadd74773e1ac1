use chrono::{DateTime, Utc};

use super::signals::{calculate_confidence, crossed_above, crossed_below, ConfidenceFactors, SignalConfig};
use super::Strategy;
use crate::execution::{Position, PositionState};
use crate::models::{IndicatorSnapshot, Side, Signal, SignalAction, Trend};

/// EMA 8/21 trend following with RSI-cross entries
///
/// Rules, first match wins:
/// 1. Flat, UP trend, RSI crossed up through oversold within K candles -> ENTER_LONG
///    (mirror for ENTER_SHORT)
/// 2. Position in trend direction, pulled back far enough from the average
///    entry without breaking the stop -> AVERAGE
/// 3. Trend reversed against the position, or RSI at an opposing extreme -> EXIT
/// 4. HOLD
pub struct SignalEngine {
    config: SignalConfig,
}

impl SignalEngine {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    fn ema_separation(snapshot: &IndicatorSnapshot) -> f64 {
        let state = &snapshot.state;
        if state.ema21 <= 0.0 {
            return 0.0;
        }
        (state.ema8 - state.ema21).abs() / state.ema21
    }

    fn signal(
        &self,
        snapshot: &IndicatorSnapshot,
        action: SignalAction,
        factors: ConfidenceFactors,
        now: DateTime<Utc>,
        reason: String,
    ) -> Signal {
        Signal {
            symbol: snapshot.symbol.clone(),
            action,
            confidence: calculate_confidence(&factors, &self.config.confidence),
            timestamp: now,
            basis: snapshot.clone(),
            reason,
        }
    }

    fn evaluate_flat(&self, snapshot: &IndicatorSnapshot, now: DateTime<Utc>) -> Signal {
        let cfg = &self.config;
        let state = &snapshot.state;

        match state.trend {
            Trend::Up if crossed_above(&snapshot.rsi_history, cfg.rsi_oversold, cfg.cross_lookback) => {
                let factors = ConfidenceFactors {
                    ema_separation: Self::ema_separation(snapshot),
                    rsi_distance: state.rsi14 - cfg.rsi_oversold,
                    timeframe_agrees: snapshot.secondary_trend == Some(Trend::Up),
                };
                self.signal(
                    snapshot,
                    SignalAction::EnterLong,
                    factors,
                    now,
                    format!("UP trend, RSI crossed above {:.0} ({:.1})", cfg.rsi_oversold, state.rsi14),
                )
            }
            Trend::Down if crossed_below(&snapshot.rsi_history, cfg.rsi_overbought, cfg.cross_lookback) => {
                let factors = ConfidenceFactors {
                    ema_separation: Self::ema_separation(snapshot),
                    rsi_distance: cfg.rsi_overbought - state.rsi14,
                    timeframe_agrees: snapshot.secondary_trend == Some(Trend::Down),
                };
                self.signal(
                    snapshot,
                    SignalAction::EnterShort,
                    factors,
                    now,
                    format!("DOWN trend, RSI crossed below {:.0} ({:.1})", cfg.rsi_overbought, state.rsi14),
                )
            }
            trend => Signal::hold(snapshot.clone(), now, format!("No entry setup ({:?} trend)", trend)),
        }
    }

    fn evaluate_position(&self, snapshot: &IndicatorSnapshot, position: &Position, now: DateTime<Utc>) -> Signal {
        let cfg = &self.config;
        let state = &snapshot.state;
        let price = snapshot.last_close;
        let avg_entry = position.average_entry_price();

        // Averaging
        if let Some(averaging) = &cfg.averaging {
            if state.trend == position.side.trend() && avg_entry > 0.0 {
                let pullback = match position.side {
                    Side::Long => (avg_entry - price) / avg_entry,
                    Side::Short => (price - avg_entry) / avg_entry,
                };
                let stop_intact = match (position.side, position.stop_loss_price) {
                    (Side::Long, Some(stop)) => price > stop,
                    (Side::Short, Some(stop)) => price < stop,
                    (_, None) => true,
                };

                if pullback >= averaging.pullback_pct
                    && stop_intact
                    && position.average_count < averaging.max_average_count
                {
                    let factors = ConfidenceFactors {
                        ema_separation: Self::ema_separation(snapshot),
                        rsi_distance: match position.side {
                            Side::Long => 50.0 - state.rsi14,
                            Side::Short => state.rsi14 - 50.0,
                        },
                        timeframe_agrees: snapshot.secondary_trend == Some(position.side.trend()),
                    };
                    return self.signal(
                        snapshot,
                        SignalAction::Average,
                        factors,
                        now,
                        format!(
                            "Pullback {:.2}% from average entry {:.4} (average #{})",
                            pullback * 100.0,
                            avg_entry,
                            position.average_count + 1
                        ),
                    );
                }
            }
        }

        // Exit
        let (reversed, rsi_extreme) = match position.side {
            Side::Long => (state.trend == Trend::Down, state.rsi14 >= cfg.exit_rsi_long),
            Side::Short => (state.trend == Trend::Up, state.rsi14 <= cfg.exit_rsi_short),
        };

        if reversed || rsi_extreme {
            let factors = ConfidenceFactors {
                ema_separation: Self::ema_separation(snapshot),
                rsi_distance: (state.rsi14 - 50.0).abs(),
                timeframe_agrees: snapshot.secondary_trend.is_some()
                    && snapshot.secondary_trend != Some(position.side.trend()),
            };
            let reason = if reversed {
                format!("Trend reversed to {:?} against {:?} position", state.trend, position.side)
            } else {
                format!("RSI at extreme {:.1} against {:?} position", state.rsi14, position.side)
            };
            return self.signal(snapshot, SignalAction::Exit, factors, now, reason);
        }

        Signal::hold(snapshot.clone(), now, "Position held")
    }
}

impl Strategy for SignalEngine {
    fn evaluate(&self, snapshot: &IndicatorSnapshot, position: Option<&Position>, now: DateTime<Utc>) -> Signal {
        match position {
            None => self.evaluate_flat(snapshot, now),
            Some(p) if p.state == PositionState::Closing => {
                Signal::hold(snapshot.clone(), now, "Exit in progress")
            }
            Some(p) => self.evaluate_position(snapshot, p, now),
        }
    }

    fn name(&self) -> &str {
        "EMA 8/21 Trend + RSI"
    }
}
