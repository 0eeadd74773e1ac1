use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use crate::error::StoreError;
use crate::execution::Position;
use crate::models::TradeRecord;
use crate::risk::RiskState;

const KEY_STATE: &str = "tb:state";
const KEY_TRADES: &str = "tb:trades";

/// Everything needed to resume after a restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    pub risk: RiskState,
    pub positions: Vec<Position>,
}

/// Durable storage for engine state and the trade journal
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn record_trade(&self, trade: &TradeRecord) -> Result<(), StoreError>;

    async fn save_state(&self, risk: &RiskState, positions: &[Position]) -> Result<(), StoreError>;

    async fn load_state(&self) -> Result<Option<StoredState>, StoreError>;
}

/// Redis-backed store
///
/// State is a single JSON document under `tb:state`; trades go to the
/// `tb:trades` sorted set scored by timestamp.
pub struct RedisStore {
    conn: Mutex<ConnectionManager>,
    prefix: String,
}

impl RedisStore {
    /// Connect to Redis
    ///
    /// # Example
    /// ```no_run
    /// # async fn run() -> Result<(), trendbot::error::StoreError> {
    /// let store = trendbot::persistence::RedisStore::new("redis://127.0.0.1:6379", "").await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;

        let connect_timeout = Duration::from_secs(5);
        let conn = timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn: Mutex::new(conn),
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}:{}", self.prefix, name)
        }
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn record_trade(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        let value = serde_json::to_string(trade)?;
        let score = trade.timestamp.timestamp_millis() as f64;
        self.conn
            .lock()
            .await
            .zadd::<_, _, _, ()>(self.key(KEY_TRADES), value, score)
            .await?;

        tracing::debug!(symbol = %trade.symbol, kind = ?trade.kind, "Trade recorded");
        Ok(())
    }

    async fn save_state(&self, risk: &RiskState, positions: &[Position]) -> Result<(), StoreError> {
        let state = StoredState {
            risk: risk.clone(),
            positions: positions.to_vec(),
        };
        let value = serde_json::to_string(&state)?;
        self.conn
            .lock()
            .await
            .set::<_, _, ()>(self.key(KEY_STATE), value)
            .await?;

        tracing::debug!(positions = positions.len(), "Engine state saved");
        Ok(())
    }

    async fn load_state(&self) -> Result<Option<StoredState>, StoreError> {
        let value: Option<String> = self.conn.lock().await.get(self.key(KEY_STATE)).await?;
        match value {
            Some(json) => {
                let state: StoredState = serde_json::from_str(&json)?;
                tracing::info!(positions = state.positions.len(), "Loaded engine state from Redis");
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }
}

/// In-process store for paper runs and tests
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<Option<StoredState>>,
    trades: Mutex<Vec<TradeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn trades(&self) -> Vec<TradeRecord> {
        self.trades.lock().await.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn record_trade(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        self.trades.lock().await.push(trade.clone());
        Ok(())
    }

    async fn save_state(&self, risk: &RiskState, positions: &[Position]) -> Result<(), StoreError> {
        *self.state.lock().await = Some(StoredState {
            risk: risk.clone(),
            positions: positions.to_vec(),
        });
        Ok(())
    }

    async fn load_state(&self) -> Result<Option<StoredState>, StoreError> {
        Ok(self.state.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PositionTracker;
    use crate::models::{Side, TradeKind};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn trade(symbol: &str) -> TradeRecord {
        TradeRecord {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side: Side::Long,
            kind: TradeKind::Open,
            price: 2000.0,
            quantity: 0.1,
            pnl: None,
            client_order_id: Some("tb-el-ETHUSDT-1".to_string()),
            confidence: Some(0.8),
            reason: "test".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load_state().await.unwrap().is_none());

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let mut tracker = PositionTracker::new(3);
        tracker.on_entry_fill("ETHUSDT", Side::Long, 2000.0, 0.1, now).unwrap();
        let mut risk = RiskState::new(10_000.0, now);
        risk.update_equity(9_500.0);

        tokio_test::assert_ok!(store.save_state(&risk, &tracker.snapshot()).await);
        tokio_test::assert_ok!(store.record_trade(&trade("ETHUSDT")).await);

        let loaded = store.load_state().await.unwrap().unwrap();
        assert_eq!(loaded.risk, risk);
        assert_eq!(loaded.positions, tracker.snapshot());
        assert_eq!(store.trades().await.len(), 1);
    }

    #[test]
    fn test_stored_state_json() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let state = StoredState {
            risk: RiskState::new(1_000.0, now),
            positions: Vec::new(),
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: StoredState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        let result = RedisStore::new("redis://192.0.2.1:6379", "").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_redis_state_round_trip() {
        let store = RedisStore::new("redis://127.0.0.1:6379", "tb-test")
            .await
            .expect("Failed to connect to Redis");

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let risk = RiskState::new(5_000.0, now);
        store.save_state(&risk, &[]).await.unwrap();
        store.record_trade(&trade("BTCUSDT")).await.unwrap();

        let loaded = store.load_state().await.unwrap().unwrap();
        assert_eq!(loaded.risk, risk);
        assert!(loaded.positions.is_empty());
    }
}
