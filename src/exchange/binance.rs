use async_trait::async_trait;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::Exchange;
use crate::error::ExchangeError;
use crate::models::{
    Balance, ExchangePosition, OrderRequest, OrderResult, OrderSide, OrderStatus, OrderType, Side, SymbolFilters,
};

const BINANCE_FUTURES_BASE: &str = "https://fapi.binance.com";
const MARGIN_ASSET: &str = "USDT";

// Binance error codes
const ERR_DUPLICATE_CLIENT_ID: i64 = -4116;
const ERR_INSUFFICIENT_MARGIN: i64 = -2019;
const ERR_INSUFFICIENT_BALANCE: i64 = -2018;
const ERR_ORDER_NOT_FOUND: i64 = -2013;
const ERR_UNKNOWN_ORDER: i64 = -2011;
const ERR_BACKEND_TIMEOUT: i64 = -1007;
const ERR_TOO_MANY_REQUESTS: i64 = -1003;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BinanceConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub request_timeout_ms: u64,
    pub requests_per_minute: u32,
    pub recv_window_ms: u64,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            base_url: BINANCE_FUTURES_BASE.to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            request_timeout_ms: 10_000,
            requests_per_minute: 1_200, // Binance futures request weight limit
            recv_window_ms: 5_000,
        }
    }
}

/// Signed Binance USD-M futures REST client
///
/// Cloneable; clones share the rate limiter and the symbol filter cache.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    client: Client,
    config: BinanceConfig,
    rate_limiter: Arc<BinanceRateLimiter>,
    filters: Arc<RwLock<HashMap<String, SymbolFilters>>>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    order_id: i64,
    client_order_id: String,
    symbol: String,
    status: String,
    #[serde(rename = "type")]
    order_type: String,
    side: String,
    orig_qty: String,
    executed_qty: String,
    #[serde(default)]
    avg_price: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBalance {
    asset: String,
    balance: String,
    cross_un_pnl: String,
    available_balance: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    symbol: String,
    position_amt: String,
    entry_price: String,
}

#[derive(Debug, Deserialize)]
struct RawExchangeInfo {
    symbols: Vec<RawSymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct RawSymbolInfo {
    symbol: String,
    filters: Vec<serde_json::Value>,
}

fn parse_f64(field: &str, value: &str) -> Result<f64, ExchangeError> {
    value
        .parse::<f64>()
        .map_err(|_| ExchangeError::Decode(format!("invalid {} '{}'", field, value)))
}

fn parse_status(status: &str) -> Result<OrderStatus, ExchangeError> {
    match status {
        "NEW" => Ok(OrderStatus::New),
        "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
        "FILLED" => Ok(OrderStatus::Filled),
        "CANCELED" => Ok(OrderStatus::Canceled),
        "REJECTED" => Ok(OrderStatus::Rejected),
        "EXPIRED" | "EXPIRED_IN_MATCH" => Ok(OrderStatus::Expired),
        other => Err(ExchangeError::Decode(format!("unknown order status '{}'", other))),
    }
}

fn parse_order_type(order_type: &str) -> Result<OrderType, ExchangeError> {
    match order_type {
        "MARKET" => Ok(OrderType::Market),
        "STOP_MARKET" => Ok(OrderType::StopMarket),
        "TAKE_PROFIT_MARKET" => Ok(OrderType::TakeProfitMarket),
        other => Err(ExchangeError::Decode(format!("unsupported order type '{}'", other))),
    }
}

fn parse_side(side: &str) -> Result<OrderSide, ExchangeError> {
    match side {
        "BUY" => Ok(OrderSide::Buy),
        "SELL" => Ok(OrderSide::Sell),
        other => Err(ExchangeError::Decode(format!("unknown side '{}'", other))),
    }
}

impl TryFrom<RawOrder> for OrderResult {
    type Error = ExchangeError;

    fn try_from(raw: RawOrder) -> Result<Self, Self::Error> {
        let avg_price = match raw.avg_price.as_deref() {
            Some(p) => Some(parse_f64("avgPrice", p)?).filter(|p| *p > 0.0),
            None => None,
        };

        Ok(OrderResult {
            client_order_id: raw.client_order_id,
            exchange_order_id: Some(raw.order_id.to_string()),
            symbol: raw.symbol,
            side: parse_side(&raw.side)?,
            order_type: parse_order_type(&raw.order_type)?,
            quantity: parse_f64("origQty", &raw.orig_qty)?,
            executed_qty: parse_f64("executedQty", &raw.executed_qty)?,
            avg_price,
            status: parse_status(&raw.status)?,
        })
    }
}

/// Map a non-success HTTP response onto the error taxonomy
fn map_api_error(status: StatusCode, retry_after: Option<u64>, body: &str) -> ExchangeError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return ExchangeError::RateLimited {
            retry_after_ms: retry_after.map(|secs| secs * 1_000),
        };
    }
    if status.is_server_error() {
        return ExchangeError::Unavailable(format!("HTTP {}", status.as_u16()));
    }

    match serde_json::from_str::<ApiError>(body) {
        Ok(err) => match err.code {
            ERR_DUPLICATE_CLIENT_ID => ExchangeError::DuplicateClientOrderId(err.msg),
            ERR_INSUFFICIENT_MARGIN | ERR_INSUFFICIENT_BALANCE => ExchangeError::InsufficientBalance(err.msg),
            ERR_ORDER_NOT_FOUND | ERR_UNKNOWN_ORDER => ExchangeError::OrderNotFound(err.msg),
            ERR_BACKEND_TIMEOUT => ExchangeError::Timeout,
            ERR_TOO_MANY_REQUESTS => ExchangeError::RateLimited { retry_after_ms: None },
            -2015 | -2014 | -1022 => ExchangeError::Auth(err.msg),
            code => ExchangeError::Rejected { code, message: err.msg },
        },
        Err(_) => ExchangeError::Rejected {
            code: status.as_u16() as i64,
            message: body.chars().take(200).collect(),
        },
    }
}

fn format_qty(value: f64) -> String {
    // Shortest round-trip repr; quantities are already snapped to the step
    format!("{}", value)
}

impl BinanceFuturesClient {
    pub fn new(config: BinanceConfig) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| ExchangeError::Network(format!("Failed to build HTTP client: {}", e)))?;

        let rpm = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            config,
            rate_limiter,
            filters: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.config.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Auth(e.to_string()))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, ExchangeError> {
        self.rate_limiter.until_ready().await;

        let response = request.send().await?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|e| ExchangeError::Decode(format!("{}: {}", e, body.chars().take(200).collect::<String>())));
        }

        let err = map_api_error(status, retry_after, &body);
        tracing::debug!(status = status.as_u16(), error = %err, "Binance request failed");
        Err(err)
    }

    /// Signed request; parameters are appended with timestamp and signature
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&'static str, String)>,
    ) -> Result<T, ExchangeError> {
        params.push(("recvWindow", self.config.recv_window_ms.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.config.base_url, path, query, signature);

        let request = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.config.api_key);
        self.send(request).await
    }

    async fn public<T: DeserializeOwned>(&self, path: &str) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.config.base_url, path);
        self.send(self.client.get(&url)).await
    }

    async fn load_filters(&self) -> Result<(), ExchangeError> {
        tracing::info!("Loading Binance futures exchange info...");
        let info: RawExchangeInfo = self.public("/fapi/v1/exchangeInfo").await?;

        let mut loaded = HashMap::new();
        for symbol in info.symbols {
            let mut filters = SymbolFilters::default();
            for filter in &symbol.filters {
                let value = |key: &str| filter.get(key).and_then(|v| v.as_str()).and_then(|v| v.parse::<f64>().ok());
                match filter.get("filterType").and_then(|v| v.as_str()) {
                    Some("LOT_SIZE") => {
                        if let Some(step) = value("stepSize") {
                            filters.step_size = step;
                        }
                        if let Some(min) = value("minQty") {
                            filters.min_qty = min;
                        }
                    }
                    Some("PRICE_FILTER") => {
                        if let Some(tick) = value("tickSize") {
                            filters.tick_size = tick;
                        }
                    }
                    _ => {}
                }
            }
            loaded.insert(symbol.symbol, filters);
        }

        tracing::info!("Loaded filters for {} symbols", loaded.len());
        *self.filters.write().await = loaded;
        Ok(())
    }
}

#[async_trait]
impl Exchange for BinanceFuturesClient {
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let mut params = vec![
            ("symbol", request.symbol.clone()),
            ("side", request.side.as_str().to_string()),
            ("type", request.order_type.as_str().to_string()),
            ("quantity", format_qty(request.quantity)),
            ("newClientOrderId", request.client_order_id.clone()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
        if let Some(stop) = request.stop_price {
            params.push(("stopPrice", format_qty(stop)));
            params.push(("workingType", "MARK_PRICE".to_string()));
        }

        match self.signed::<RawOrder>(Method::POST, "/fapi/v1/order", params).await {
            Ok(raw) => raw.try_into(),
            Err(ExchangeError::DuplicateClientOrderId(_)) => {
                tracing::info!(
                    symbol = %request.symbol,
                    client_order_id = %request.client_order_id,
                    "Order already exists, fetching it"
                );
                self.get_order(&request.symbol, &request.client_order_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<OrderResult, ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        let raw: RawOrder = self.signed(Method::DELETE, "/fapi/v1/order", params).await?;
        raw.try_into()
    }

    async fn get_order(&self, symbol: &str, client_order_id: &str) -> Result<OrderResult, ExchangeError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        let raw: RawOrder = self.signed(Method::GET, "/fapi/v1/order", params).await?;
        raw.try_into()
    }

    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        let balances: Vec<RawBalance> = self.signed(Method::GET, "/fapi/v2/balance", Vec::new()).await?;
        let usdt = balances
            .into_iter()
            .find(|b| b.asset == MARGIN_ASSET)
            .ok_or_else(|| ExchangeError::Decode(format!("no {} balance", MARGIN_ASSET)))?;

        Ok(Balance {
            wallet: parse_f64("balance", &usdt.balance)?,
            unrealized_pnl: parse_f64("crossUnPnl", &usdt.cross_un_pnl)?,
            available: parse_f64("availableBalance", &usdt.available_balance)?,
        })
    }

    async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let raw: Vec<RawPosition> = self.signed(Method::GET, "/fapi/v2/positionRisk", Vec::new()).await?;

        let mut positions = Vec::new();
        for p in raw {
            let amount = parse_f64("positionAmt", &p.position_amt)?;
            if amount == 0.0 {
                continue;
            }
            positions.push(ExchangePosition {
                symbol: p.symbol,
                side: if amount > 0.0 { Side::Long } else { Side::Short },
                quantity: amount.abs(),
                entry_price: parse_f64("entryPrice", &p.entry_price)?,
            });
        }
        Ok(positions)
    }

    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        if let Some(filters) = self.filters.read().await.get(symbol) {
            return Ok(*filters);
        }

        self.load_filters().await?;
        self.filters
            .read()
            .await
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Rejected {
                code: -1121,
                message: format!("Invalid symbol {}", symbol),
            })
    }
}
