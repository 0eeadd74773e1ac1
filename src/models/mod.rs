use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A single normalized trade print from the market data feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64, // Strictly increasing per symbol
}

/// Candle aggregation period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn as_secs(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.as_secs())
    }

    /// Start of the candle that contains `ts`
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let start = secs - secs.rem_euclid(self.as_secs());
        Utc.timestamp_opt(start, 0).single().unwrap_or(ts)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("Unknown timeframe '{}'", other)),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

/// OHLCV candlestick for one (symbol, timeframe)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub open_time: DateTime<Utc>,
    pub closed: bool,
}

impl Candle {
    /// Open a fresh candle from the first tick of its period
    pub fn open_from(tick: &Tick, timeframe: Timeframe) -> Self {
        Self {
            symbol: tick.symbol.clone(),
            timeframe,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
            open_time: timeframe.bucket_start(tick.timestamp),
            closed: false,
        }
    }

    pub fn close_time(&self) -> DateTime<Utc> {
        self.open_time + self.timeframe.duration()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Trend {
    Up,
    Down,
    Flat,
}

/// Indicator values derived from closed candles only
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndicatorState {
    pub ema8: f64,
    pub ema21: f64,
    pub rsi14: f64,
    pub trend: Trend,
    pub support_level: f64,
    pub resistance_level: f64,
}

/// Everything the signal engine looks at for one evaluation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndicatorSnapshot {
    pub symbol: String,
    pub state: IndicatorState,
    pub secondary_trend: Option<Trend>,
    pub rsi_history: Vec<f64>, // Oldest first, last element == state.rsi14
    pub last_close: f64,
    pub candle_open_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SignalAction {
    EnterLong,
    EnterShort,
    Average,
    Exit,
    Hold,
}

impl SignalAction {
    /// Actions that add exposure
    pub fn is_entry(&self) -> bool {
        matches!(
            self,
            SignalAction::EnterLong | SignalAction::EnterShort | SignalAction::Average
        )
    }
}

/// Trading signal, immutable once produced
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub symbol: String,
    pub action: SignalAction,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub basis: IndicatorSnapshot,
    pub reason: String,
}

impl Signal {
    pub fn hold(basis: IndicatorSnapshot, timestamp: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            symbol: basis.symbol.clone(),
            action: SignalAction::Hold,
            confidence: 0.0,
            timestamp,
            basis,
            reason: reason.into(),
        }
    }
}

/// Direction of a position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens or adds to this position
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces this position
    pub fn exit_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }

    pub fn trend(&self) -> Trend {
        match self {
            Side::Long => Trend::Up,
            Side::Short => Trend::Down,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderType {
    Market,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    /// Outcome not known (the call timed out); reconciliation decides
    Unknown,
}

impl OrderStatus {
    /// The exchange has definitely accepted (or finished) this order
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            OrderStatus::New | OrderStatus::PartiallyFilled | OrderStatus::Filled
        )
    }
}

/// Why an order is being sent; feeds the deterministic client order id
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OrderIntent {
    EnterLong,
    EnterShort,
    Average(u32),
    Exit,
    StopLoss(u32),
    TakeProfit(u32),
}

impl OrderIntent {
    fn code(&self) -> String {
        match self {
            OrderIntent::EnterLong => "el".to_string(),
            OrderIntent::EnterShort => "es".to_string(),
            OrderIntent::Average(n) => format!("av{}", n),
            OrderIntent::Exit => "ex".to_string(),
            OrderIntent::StopLoss(n) => format!("sl{}", n),
            OrderIntent::TakeProfit(n) => format!("tp{}", n),
        }
    }

    /// Deterministic idempotency key for (symbol, intent, epoch bucket)
    ///
    /// Resubmitting the same intent within the same bucket produces the same id,
    /// so a retry after an ambiguous timeout cannot create a second order.
    pub fn client_order_id(&self, symbol: &str, at: DateTime<Utc>, bucket_secs: i64) -> String {
        let bucket = at.timestamp().div_euclid(bucket_secs.max(1));
        format!("tb-{}-{}-{}", self.code(), symbol, bucket)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(client_order_id: String, symbol: &str, side: OrderSide, quantity: f64) -> Self {
        Self {
            client_order_id,
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            reduce_only: false,
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn protective(
        client_order_id: String,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        stop_price: f64,
    ) -> Self {
        Self {
            client_order_id,
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity,
            price: None,
            stop_price: Some(stop_price),
            reduce_only: true,
        }
    }
}

/// Normalized order outcome; no raw exchange payload leaks past the adapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderResult {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub executed_qty: f64,
    pub avg_price: Option<f64>,
    pub status: OrderStatus,
}

impl OrderResult {
    /// Placeholder for a request whose outcome could not be observed
    pub fn unknown(request: &OrderRequest) -> Self {
        Self {
            client_order_id: request.client_order_id.clone(),
            exchange_order_id: None,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            executed_qty: 0.0,
            avg_price: None,
            status: OrderStatus::Unknown,
        }
    }
}

/// Account balance in the margin asset
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Balance {
    pub wallet: f64,
    pub unrealized_pnl: f64,
    pub available: f64,
}

impl Balance {
    pub fn equity(&self) -> f64 {
        self.wallet + self.unrealized_pnl
    }
}

/// Position as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
}

/// Exchange lot and price grid for a symbol
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SymbolFilters {
    pub step_size: f64,
    pub min_qty: f64,
    pub tick_size: f64,
}

impl Default for SymbolFilters {
    fn default() -> Self {
        Self {
            step_size: 0.001,
            min_qty: 0.001,
            tick_size: 0.01,
        }
    }
}

impl SymbolFilters {
    /// Floor a quantity onto the lot step
    pub fn floor_qty(&self, qty: f64) -> f64 {
        if self.step_size <= 0.0 || !qty.is_finite() || qty <= 0.0 {
            return 0.0;
        }
        // Small epsilon so 0.3 / 0.1 does not floor to 2
        let steps = (qty / self.step_size + 1e-9).floor();
        let floored = snap(steps * self.step_size, self.step_size);
        if floored > qty {
            snap((steps - 1.0).max(0.0) * self.step_size, self.step_size)
        } else {
            floored
        }
    }

    /// Round a price to the nearest tick
    pub fn round_price(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 || !price.is_finite() {
            return price;
        }
        snap((price / self.tick_size).round() * self.tick_size, self.tick_size)
    }
}

/// Strip float noise below the increment's precision (0.30000000000000004 -> 0.3)
fn snap(value: f64, increment: f64) -> f64 {
    let decimals = (-increment.log10()).ceil().clamp(0.0, 12.0) as i32;
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeKind {
    Open,
    Average,
    Close,
}

/// Trade execution record handed to the persistence layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub kind: TradeKind,
    pub price: f64,
    pub quantity: f64,
    pub pnl: Option<f64>,
    pub client_order_id: Option<String>,
    pub confidence: Option<f64>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_bucket_start() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 10, 17, 42).unwrap();
        assert_eq!(
            Timeframe::M15.bucket_start(ts),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap()
        );
        assert_eq!(
            Timeframe::H1.bucket_start(ts),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_round_price_has_tick_precision() {
        let filters = SymbolFilters::default();
        // 3.1415 * 0.97 = 3.047255 lands off the 0.01 grid
        let stop = filters.round_price(3.1415 * 0.97);
        assert_eq!(format!("{}", stop), "3.05");
        assert_eq!(format!("{}", filters.round_price(3.1415 * 1.06)), "3.33");

        let coarse = SymbolFilters {
            tick_size: 0.1,
            ..Default::default()
        };
        assert_eq!(format!("{}", coarse.round_price(2063.47)), "2063.5");
        assert_eq!(format!("{}", coarse.round_price(0.7 * 3.0)), "2.1");
    }

    #[test]
    fn test_timeframe_parse() {
        assert_eq!("4h".parse::<Timeframe>(), Ok(Timeframe::H4));
        assert!("7m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_client_order_id_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 17, 42).unwrap();
        let later = at + Duration::seconds(30);

        let a = OrderIntent::EnterLong.client_order_id("ETHUSDT", at, 900);
        let b = OrderIntent::EnterLong.client_order_id("ETHUSDT", later, 900);
        assert_eq!(a, b);

        let c = OrderIntent::StopLoss(0).client_order_id("ETHUSDT", at, 900);
        assert_ne!(a, c);
        assert!(a.len() <= 36); // Binance limit
    }

    #[test]
    fn test_floor_qty_to_step() {
        let filters = SymbolFilters {
            step_size: 0.1,
            min_qty: 0.1,
            tick_size: 0.01,
        };
        assert!((filters.floor_qty(0.3) - 0.3).abs() < 1e-12);
        assert!((filters.floor_qty(1.27) - 1.2).abs() < 1e-12);
        assert_eq!(filters.floor_qty(0.05), 0.0);
        assert_eq!(filters.floor_qty(-1.0), 0.0);
    }

    #[test]
    fn test_round_price_to_tick() {
        let filters = SymbolFilters::default();
        assert!((filters.round_price(1940.004) - 1940.0).abs() < 1e-9);
        assert!((filters.round_price(1940.006) - 1940.01).abs() < 1e-9);
    }

    #[test]
    fn test_balance_equity() {
        let balance = Balance {
            wallet: 1000.0,
            unrealized_pnl: -25.0,
            available: 900.0,
        };
        assert_eq!(balance.equity(), 975.0);
    }
}
