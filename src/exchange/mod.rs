// Exchange port and adapters
pub mod binance;
pub mod paper;

pub use binance::{BinanceConfig, BinanceFuturesClient};
pub use paper::PaperExchange;

use async_trait::async_trait;

use crate::error::ExchangeError;
use crate::models::{Balance, ExchangePosition, OrderRequest, OrderResult, SymbolFilters};

/// USD-M futures account operations used by the engine
///
/// Implementations normalize raw exchange payloads into these types and map
/// failures into [`ExchangeError`]. `create_order` must be idempotent by
/// client order id: resubmitting an id the exchange already knows returns the
/// existing order instead of creating a second one.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<OrderResult, ExchangeError>;

    async fn get_order(&self, symbol: &str, client_order_id: &str) -> Result<OrderResult, ExchangeError>;

    async fn get_balance(&self) -> Result<Balance, ExchangeError>;

    async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError>;
}
