// Technical indicators module
// Incremental EMA/RSI over closed candles, multi-timeframe candle aggregation

pub mod cache;
pub mod candle_buffer;
pub mod moving_average;
pub mod rsi;

pub use cache::{classify_trend, IndicatorCache, IndicatorConfig};
pub use candle_buffer::CandleSeries;
pub use moving_average::{calculate_ema, calculate_sma, Ema};
pub use rsi::{calculate_rsi, RollingRsi};
