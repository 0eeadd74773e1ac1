// Trading strategy module
pub mod signals;
pub mod trend;

pub use signals::{calculate_confidence, AveragingConfig, ConfidenceFactors, ConfidenceWeights, SignalConfig};
pub use trend::SignalEngine;

use chrono::{DateTime, Utc};

use crate::execution::Position;
use crate::models::{IndicatorSnapshot, Signal};

/// Base trait for all trading strategies
pub trait Strategy: Send + Sync {
    /// Decide what to do for one symbol at a primary candle close
    fn evaluate(
        &self,
        snapshot: &IndicatorSnapshot,
        position: Option<&Position>,
        now: DateTime<Utc>,
    ) -> Signal;

    /// Get strategy name
    fn name(&self) -> &str;
}
