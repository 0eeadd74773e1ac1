use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

use super::feed::{TickSource, TickStream};
use crate::error::FeedError;
use crate::models::Tick;

pub const FUTURES_WS_URL: &str = "wss://fstream.binance.com/ws";

/// aggTrade payload (only the fields we use)
#[derive(Debug, Deserialize)]
struct AggTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "a")]
    agg_id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

/// Parse one aggTrade frame into a tick
pub fn parse_agg_trade(text: &str) -> Result<Tick, FeedError> {
    let raw: AggTrade = serde_json::from_str(text).map_err(|e| FeedError::Decode(e.to_string()))?;

    let price: f64 = raw
        .price
        .parse()
        .map_err(|_| FeedError::Decode(format!("bad price {}", raw.price)))?;
    let volume: f64 = raw
        .quantity
        .parse()
        .map_err(|_| FeedError::Decode(format!("bad quantity {}", raw.quantity)))?;
    let timestamp = Utc
        .timestamp_millis_opt(raw.trade_time)
        .single()
        .ok_or_else(|| FeedError::Decode(format!("bad trade time {}", raw.trade_time)))?;

    if !price.is_finite() || price <= 0.0 {
        return Err(FeedError::Decode(format!("non-positive price {}", price)));
    }

    Ok(Tick {
        symbol: raw.symbol,
        price,
        volume,
        timestamp,
        sequence: raw.agg_id,
    })
}

/// Binance USD-M aggregate trade stream
#[derive(Debug, Clone)]
pub struct BinanceTradeStream {
    base_url: String,
}

impl BinanceTradeStream {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn stream_url(&self, symbol: &str) -> String {
        format!("{}/{}@aggTrade", self.base_url, symbol.to_lowercase())
    }
}

impl Default for BinanceTradeStream {
    fn default() -> Self {
        Self::new(FUTURES_WS_URL)
    }
}

#[async_trait]
impl TickSource for BinanceTradeStream {
    async fn connect(&self, symbol: &str) -> Result<TickStream, FeedError> {
        let url = self.stream_url(symbol);
        let (ws, _) = connect_async(url.as_str()).await.map_err(|e| FeedError::Connect {
            symbol: symbol.to_string(),
            message: e.to_string(),
        })?;

        tracing::info!(symbol = %symbol, url = %url, "📡 Trade stream connected");

        // Pings are answered by tungstenite while reading; control frames are skipped
        let ticks = ws
            .take_while(|msg| futures::future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(parse_agg_trade(&text)),
                    Ok(_) => None,
                    Err(e) => Some(Err(FeedError::Stream(e.to_string()))),
                }
            });

        Ok(ticks.boxed())
    }
}
