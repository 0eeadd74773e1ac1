use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use super::position_tracker::{Position, ProtectionOrders};
use crate::error::{ExchangeError, ExecutionError};
use crate::exchange::Exchange;
use crate::models::{
    Balance, ExchangePosition, OrderIntent, OrderRequest, OrderResult, OrderStatus, OrderType, Side, SymbolFilters,
};
use crate::retry::{with_retry, RetryPolicy};

// Submitted orders remembered for idempotent resubmission
const SUBMITTED_CACHE_SIZE: usize = 1_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub stop_loss_pct: f64,   // 3% against average entry
    pub take_profit_pct: f64, // 6% in favour of average entry
    pub order_timeout_ms: u64,
    pub id_bucket_secs: i64,
    pub retry: RetryPolicy,
    pub protective_retry: RetryPolicy,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: 0.03,
            take_profit_pct: 0.06,
            order_timeout_ms: 10_000,
            id_bucket_secs: 60,
            retry: RetryPolicy::default(),
            protective_retry: RetryPolicy::protective(),
        }
    }
}

/// Stop/take-profit levels and the orders resting at them
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectionPlan {
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub orders: ProtectionOrders,
}

/// Stop and take-profit prices for a position side, rounded to the tick grid
pub fn protection_prices(
    side: Side,
    entry_price: f64,
    stop_loss_pct: f64,
    take_profit_pct: f64,
    filters: &SymbolFilters,
) -> (f64, f64) {
    let (stop, take_profit) = match side {
        Side::Long => (entry_price * (1.0 - stop_loss_pct), entry_price * (1.0 + take_profit_pct)),
        Side::Short => (entry_price * (1.0 + stop_loss_pct), entry_price * (1.0 - take_profit_pct)),
    };
    (filters.round_price(stop), filters.round_price(take_profit))
}

/// Submits and supervises exchange orders
///
/// Every call runs under a timeout and the configured retry policy. Client
/// order ids are deterministic per (symbol, intent, time bucket) and every
/// result is cached by id, so resubmitting an intent never doubles an order.
/// A call whose outcome stays ambiguous after retries comes back with status
/// `Unknown`; `resolve` settles it later against the exchange.
pub struct OrderExecutor {
    exchange: Arc<dyn Exchange>,
    config: ExecutionConfig,
    submitted: HashMap<String, OrderResult>,
    submitted_order: VecDeque<String>,
    filters: HashMap<String, SymbolFilters>,
}

impl OrderExecutor {
    pub fn new(exchange: Arc<dyn Exchange>, config: ExecutionConfig) -> Self {
        Self {
            exchange,
            config,
            submitted: HashMap::new(),
            submitted_order: VecDeque::new(),
            filters: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.order_timeout_ms.max(1))
    }

    pub fn client_order_id(&self, intent: OrderIntent, symbol: &str, at: DateTime<Utc>) -> String {
        intent.client_order_id(symbol, at, self.config.id_bucket_secs)
    }

    /// Lot/price grid for a symbol, fetched once
    pub async fn filters(&mut self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        if let Some(filters) = self.filters.get(symbol) {
            return Ok(*filters);
        }
        let exchange = self.exchange.clone();
        let timeout = self.timeout();
        let filters = with_retry(&self.config.retry, || {
            let exchange = exchange.clone();
            async move {
                tokio::time::timeout(timeout, exchange.get_symbol_filters(symbol))
                    .await
                    .unwrap_or(Err(ExchangeError::Timeout))
            }
        })
        .await?;
        self.filters.insert(symbol.to_string(), filters);
        Ok(filters)
    }

    pub async fn balance(&self) -> Result<Balance, ExchangeError> {
        let exchange = self.exchange.clone();
        let timeout = self.timeout();
        with_retry(&self.config.retry, || {
            let exchange = exchange.clone();
            async move {
                tokio::time::timeout(timeout, exchange.get_balance())
                    .await
                    .unwrap_or(Err(ExchangeError::Timeout))
            }
        })
        .await
    }

    pub async fn open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let exchange = self.exchange.clone();
        let timeout = self.timeout();
        with_retry(&self.config.retry, || {
            let exchange = exchange.clone();
            async move {
                tokio::time::timeout(timeout, exchange.get_open_positions())
                    .await
                    .unwrap_or(Err(ExchangeError::Timeout))
            }
        })
        .await
    }

    fn remember(&mut self, result: &OrderResult) {
        if self
            .submitted
            .insert(result.client_order_id.clone(), result.clone())
            .is_none()
        {
            self.submitted_order.push_back(result.client_order_id.clone());
        }
        while self.submitted_order.len() > SUBMITTED_CACHE_SIZE {
            if let Some(oldest) = self.submitted_order.pop_front() {
                self.submitted.remove(&oldest);
            }
        }
    }

    /// Last known result for a client order id
    pub fn submitted(&self, client_order_id: &str) -> Option<&OrderResult> {
        self.submitted.get(client_order_id)
    }

    /// Orders whose outcome is still unknown
    pub fn unresolved(&self) -> Vec<OrderResult> {
        let mut unknown: Vec<OrderResult> = self
            .submitted
            .values()
            .filter(|r| r.status == OrderStatus::Unknown)
            .cloned()
            .collect();
        unknown.sort_by(|a, b| a.client_order_id.cmp(&b.client_order_id));
        unknown
    }

    /// Submit with the default order retry policy
    pub async fn submit(&mut self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let policy = self.config.retry.clone();
        self.submit_with(request, &policy).await
    }

    async fn submit_with(&mut self, request: &OrderRequest, policy: &RetryPolicy) -> Result<OrderResult, ExchangeError> {
        if let Some(known) = self.submitted.get(&request.client_order_id) {
            if known.status != OrderStatus::Unknown {
                tracing::debug!(
                    client_order_id = %request.client_order_id,
                    status = ?known.status,
                    "Order already submitted, returning cached result"
                );
                return Ok(known.clone());
            }
        }

        tracing::info!(
            symbol = %request.symbol,
            client_order_id = %request.client_order_id,
            side = request.side.as_str(),
            order_type = request.order_type.as_str(),
            quantity = request.quantity,
            stop_price = ?request.stop_price,
            reduce_only = request.reduce_only,
            "Submitting order"
        );

        let exchange = self.exchange.clone();
        let timeout = self.timeout();
        let outcome = with_retry(policy, || {
            let exchange = exchange.clone();
            async move {
                tokio::time::timeout(timeout, exchange.create_order(request))
                    .await
                    .unwrap_or(Err(ExchangeError::Timeout))
            }
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(e) if e.is_ambiguous() => {
                tracing::warn!(
                    symbol = %request.symbol,
                    client_order_id = %request.client_order_id,
                    error = %e,
                    "⚠️ Order outcome unknown, deferring to reconciliation"
                );
                OrderResult::unknown(request)
            }
            Err(e) => {
                tracing::warn!(
                    symbol = %request.symbol,
                    client_order_id = %request.client_order_id,
                    error = %e,
                    "Order failed"
                );
                return Err(e);
            }
        };

        tracing::info!(
            symbol = %result.symbol,
            client_order_id = %result.client_order_id,
            status = ?result.status,
            executed_qty = result.executed_qty,
            avg_price = ?result.avg_price,
            "✓ Order acknowledged"
        );
        self.remember(&result);
        Ok(result)
    }

    /// Look up an order on the exchange and refresh the local cache
    pub async fn resolve(&mut self, symbol: &str, client_order_id: &str) -> Result<OrderResult, ExchangeError> {
        let exchange = self.exchange.clone();
        let timeout = self.timeout();
        let outcome = with_retry(&self.config.retry, || {
            let exchange = exchange.clone();
            async move {
                tokio::time::timeout(timeout, exchange.get_order(symbol, client_order_id))
                    .await
                    .unwrap_or(Err(ExchangeError::Timeout))
            }
        })
        .await;

        match outcome {
            Ok(result) => {
                if self.submitted.contains_key(client_order_id) {
                    tracing::info!(
                        symbol = %symbol,
                        client_order_id = %client_order_id,
                        status = ?result.status,
                        "Order resolved"
                    );
                }
                self.remember(&result);
                Ok(result)
            }
            Err(ExchangeError::OrderNotFound(id)) => {
                // Never reached the exchange; a later resubmission is safe
                if self.submitted.remove(client_order_id).is_some() {
                    self.submitted_order.retain(|known| known != client_order_id);
                    tracing::info!(symbol = %symbol, client_order_id = %client_order_id, "Unknown order never landed");
                }
                Err(ExchangeError::OrderNotFound(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Market order opening a position
    pub async fn enter(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: f64,
        at: DateTime<Utc>,
    ) -> Result<OrderResult, ExchangeError> {
        let intent = match side {
            Side::Long => OrderIntent::EnterLong,
            Side::Short => OrderIntent::EnterShort,
        };
        let id = self.client_order_id(intent, symbol, at);
        self.submit(&OrderRequest::market(id, symbol, side.entry_order_side(), quantity))
            .await
    }

    /// Market order adding to a position in its own direction
    pub async fn average(
        &mut self,
        position: &Position,
        quantity: f64,
        at: DateTime<Utc>,
    ) -> Result<OrderResult, ExchangeError> {
        let intent = OrderIntent::Average(position.average_count + 1);
        let id = self.client_order_id(intent, &position.symbol, at);
        self.submit(&OrderRequest::market(
            id,
            &position.symbol,
            position.side.entry_order_side(),
            quantity,
        ))
        .await
    }

    /// Place a reduce-only stop-loss and take-profit pair around `entry_price`
    ///
    /// Uses the protective retry policy. An order that cannot be confirmed on
    /// the exchange is a `CriticalProtectionFailure`.
    pub async fn place_protection(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: f64,
        entry_price: f64,
        generation: u32,
        at: DateTime<Utc>,
    ) -> Result<ProtectionPlan, ExecutionError> {
        let critical = |source: ExchangeError| ExecutionError::CriticalProtectionFailure {
            symbol: symbol.to_string(),
            source,
        };

        let filters = self.filters(symbol).await.map_err(critical)?;
        let (stop_loss_price, take_profit_price) = protection_prices(
            side,
            entry_price,
            self.config.stop_loss_pct,
            self.config.take_profit_pct,
            &filters,
        );
        let quantity = filters.floor_qty(quantity);
        let exit_side = side.exit_order_side();

        let stop = OrderRequest::protective(
            self.client_order_id(OrderIntent::StopLoss(generation), symbol, at),
            symbol,
            exit_side,
            OrderType::StopMarket,
            quantity,
            stop_loss_price,
        );
        let take_profit = OrderRequest::protective(
            self.client_order_id(OrderIntent::TakeProfit(generation), symbol, at),
            symbol,
            exit_side,
            OrderType::TakeProfitMarket,
            quantity,
            take_profit_price,
        );

        let stop_result = self.place_protective(&stop).await.map_err(critical)?;
        let take_profit_result = self.place_protective(&take_profit).await.map_err(critical)?;

        tracing::info!(
            symbol = %symbol,
            stop_loss = stop_loss_price,
            take_profit = take_profit_price,
            quantity = quantity,
            "🛡️ Protection placed"
        );

        Ok(ProtectionPlan {
            stop_loss_price,
            take_profit_price,
            orders: ProtectionOrders {
                stop_loss_id: stop_result.client_order_id,
                take_profit_id: take_profit_result.client_order_id,
            },
        })
    }

    async fn place_protective(&mut self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let policy = self.config.protective_retry.clone();
        let result = self.submit_with(request, &policy).await?;
        if result.status != OrderStatus::Unknown {
            return if result.status.is_accepted() {
                Ok(result)
            } else {
                Err(ExchangeError::Rejected {
                    code: 0,
                    message: format!("protective order {} ended {:?}", result.client_order_id, result.status),
                })
            };
        }

        // Ambiguous: the order counts only if the exchange has it
        let resolved = self.resolve(&request.symbol, &request.client_order_id).await?;
        if resolved.status.is_accepted() {
            Ok(resolved)
        } else {
            Err(ExchangeError::Rejected {
                code: 0,
                message: format!("protective order {} ended {:?}", resolved.client_order_id, resolved.status),
            })
        }
    }

    /// Place protection for the position's new size, then cancel the old pair
    pub async fn replace_protection(
        &mut self,
        position: &Position,
        at: DateTime<Utc>,
    ) -> Result<ProtectionPlan, ExecutionError> {
        let plan = self
            .place_protection(
                &position.symbol,
                position.side,
                position.quantity(),
                position.average_entry_price(),
                position.average_count,
                at,
            )
            .await?;

        if let Some(old) = position.protection.as_ref().filter(|old| **old != plan.orders) {
            self.cancel_protection(&position.symbol, old).await;
        }
        Ok(plan)
    }

    /// Cancel a protective pair; orders already gone are fine
    pub async fn cancel_protection(&mut self, symbol: &str, orders: &ProtectionOrders) {
        for id in [&orders.stop_loss_id, &orders.take_profit_id] {
            match self.cancel(symbol, id).await {
                Ok(_) | Err(ExchangeError::OrderNotFound(_)) => {}
                Err(ExchangeError::Rejected { code: -2011, .. }) => {
                    tracing::debug!(symbol = %symbol, client_order_id = %id, "Protective order no longer open");
                }
                Err(e) => {
                    tracing::warn!(symbol = %symbol, client_order_id = %id, error = %e, "Failed to cancel protective order");
                }
            }
        }
    }

    pub async fn cancel(&mut self, symbol: &str, client_order_id: &str) -> Result<OrderResult, ExchangeError> {
        let exchange = self.exchange.clone();
        let timeout = self.timeout();
        let result = with_retry(&self.config.retry, || {
            let exchange = exchange.clone();
            async move {
                tokio::time::timeout(timeout, exchange.cancel_order(symbol, client_order_id))
                    .await
                    .unwrap_or(Err(ExchangeError::Timeout))
            }
        })
        .await?;
        tracing::info!(symbol = %symbol, client_order_id = %client_order_id, "Order canceled");
        self.remember(&result);
        Ok(result)
    }

    /// Flatten with a reduce-only market order, then cancel the protection it replaces
    pub async fn close_position(&mut self, position: &Position, at: DateTime<Utc>) -> Result<OrderResult, ExchangeError> {
        let filters = self.filters(&position.symbol).await?;
        let id = self.client_order_id(OrderIntent::Exit, &position.symbol, at);
        let request = OrderRequest::market(
            id,
            &position.symbol,
            position.side.exit_order_side(),
            filters.floor_qty(position.quantity()).max(filters.min_qty),
        )
        .reduce_only();
        let result = self.submit(&request).await?;

        // Protection stays resting until the exit has actually filled
        if result.status == OrderStatus::Filled {
            if let Some(orders) = &position.protection {
                self.cancel_protection(&position.symbol, orders).await;
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::paper::{Fault, PaperExchange};
    use crate::execution::position_tracker::PositionTracker;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap()
    }

    fn fast_config() -> ExecutionConfig {
        let fast = RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
            jitter: false,
        };
        ExecutionConfig {
            order_timeout_ms: 1_000,
            retry: fast.clone(),
            protective_retry: fast,
            ..Default::default()
        }
    }

    async fn setup() -> (Arc<PaperExchange>, OrderExecutor) {
        let paper = Arc::new(PaperExchange::new(10_000.0));
        paper.set_mark_price("ETHUSDT", 2000.0).await;
        let executor = OrderExecutor::new(paper.clone(), fast_config());
        (paper, executor)
    }

    #[test]
    fn test_protection_prices() {
        let filters = SymbolFilters::default();
        let (stop, tp) = protection_prices(Side::Long, 2000.0, 0.03, 0.06, &filters);
        assert!((stop - 1940.0).abs() < 1e-9);
        assert!((tp - 2120.0).abs() < 1e-9);

        let (stop, tp) = protection_prices(Side::Short, 2000.0, 0.03, 0.06, &filters);
        assert!((stop - 2060.0).abs() < 1e-9);
        assert!((tp - 1880.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_entry_fills() {
        let (paper, mut executor) = setup().await;
        let result = executor.enter("ETHUSDT", Side::Long, 0.1, now()).await.unwrap();

        assert_eq!(result.status, OrderStatus::Filled);
        assert_eq!(result.avg_price, Some(2000.0));
        assert_eq!(paper.fill_count().await, 1);
    }

    #[tokio::test]
    async fn test_timeout_after_accept_never_double_fills() {
        let (paper, mut executor) = setup().await;
        paper.inject_fault(Fault::TimeoutAfterAccept).await;

        let result = executor.enter("ETHUSDT", Side::Long, 0.1, now()).await.unwrap();
        // Retry resubmits the same id and gets the existing order back
        assert_eq!(result.status, OrderStatus::Filled);

        let again = executor.enter("ETHUSDT", Side::Long, 0.1, now()).await.unwrap();
        assert_eq!(again.client_order_id, result.client_order_id);
        assert_eq!(paper.fill_count().await, 1);
    }

    #[tokio::test]
    async fn test_exhausted_timeout_is_unknown_then_resolved() {
        let (paper, mut executor) = setup().await;
        // Accepted on the first attempt, every retry times out
        paper.inject_fault(Fault::TimeoutAfterAccept).await;
        for _ in 0..2 {
            paper.inject_fault(Fault::Fail(ExchangeError::Timeout)).await;
        }

        let result = executor.enter("ETHUSDT", Side::Long, 0.1, now()).await.unwrap();
        assert_eq!(result.status, OrderStatus::Unknown);
        assert_eq!(executor.unresolved().len(), 1);

        let resolved = executor.resolve("ETHUSDT", &result.client_order_id).await.unwrap();
        assert_eq!(resolved.status, OrderStatus::Filled);
        assert!(executor.unresolved().is_empty());
        assert_eq!(paper.fill_count().await, 1);
    }

    #[tokio::test]
    async fn test_rejection_is_terminal() {
        let (paper, mut executor) = setup().await;
        paper
            .inject_fault(Fault::Fail(ExchangeError::InsufficientBalance("margin".into())))
            .await;

        let err = executor.enter("ETHUSDT", Side::Long, 0.1, now()).await.unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientBalance(_)));
        assert_eq!(paper.fill_count().await, 0);
    }

    #[tokio::test]
    async fn test_place_and_replace_protection() {
        let (paper, mut executor) = setup().await;
        let mut tracker = PositionTracker::new(3);
        executor.enter("ETHUSDT", Side::Long, 0.1, now()).await.unwrap();
        tracker.on_entry_fill("ETHUSDT", Side::Long, 2000.0, 0.1, now()).unwrap();

        let plan = executor
            .place_protection("ETHUSDT", Side::Long, 0.1, 2000.0, 0, now())
            .await
            .unwrap();
        assert!((plan.stop_loss_price - 1940.0).abs() < 1e-9);
        assert_eq!(paper.open_orders("ETHUSDT").await.len(), 2);
        tracker
            .set_protection("ETHUSDT", plan.stop_loss_price, plan.take_profit_price, Some(plan.orders.clone()))
            .unwrap();

        paper.set_mark_price("ETHUSDT", 1960.0).await;
        executor.average(tracker.get("ETHUSDT").unwrap(), 0.05, now()).await.unwrap();
        tracker.on_average_fill("ETHUSDT", 1960.0, 0.05, now()).unwrap();

        let position = tracker.get("ETHUSDT").unwrap().clone();
        let replaced = executor.replace_protection(&position, now()).await.unwrap();
        assert_ne!(replaced.orders, plan.orders);

        let open = paper.open_orders("ETHUSDT").await;
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|o| (o.quantity - 0.15).abs() < 1e-9));
        assert_eq!(paper.stop_price(&plan.orders.stop_loss_id).await, Some(1940.0));
    }

    #[tokio::test]
    async fn test_protection_failure_is_critical() {
        let (paper, mut executor) = setup().await;
        executor.enter("ETHUSDT", Side::Long, 0.1, now()).await.unwrap();
        paper
            .inject_fault(Fault::Fail(ExchangeError::Rejected {
                code: -2021,
                message: "Order would immediately trigger.".into(),
            }))
            .await;

        let err = executor
            .place_protection("ETHUSDT", Side::Long, 0.1, 2000.0, 0, now())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::CriticalProtectionFailure { ref symbol, .. } if symbol == "ETHUSDT"));
    }

    #[tokio::test]
    async fn test_close_position_cancels_protection() {
        let (paper, mut executor) = setup().await;
        let mut tracker = PositionTracker::new(3);
        executor.enter("ETHUSDT", Side::Long, 0.1, now()).await.unwrap();
        tracker.on_entry_fill("ETHUSDT", Side::Long, 2000.0, 0.1, now()).unwrap();
        let plan = executor
            .place_protection("ETHUSDT", Side::Long, 0.1, 2000.0, 0, now())
            .await
            .unwrap();
        tracker
            .set_protection("ETHUSDT", plan.stop_loss_price, plan.take_profit_price, Some(plan.orders))
            .unwrap();

        paper.set_mark_price("ETHUSDT", 2050.0).await;
        let position = tracker.get("ETHUSDT").unwrap().clone();
        let exit = executor.close_position(&position, now()).await.unwrap();

        assert_eq!(exit.status, OrderStatus::Filled);
        assert_eq!(exit.avg_price, Some(2050.0));
        assert!(paper.open_orders("ETHUSDT").await.is_empty());
        assert!(paper.get_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_exit_keeps_protection() {
        let (paper, mut executor) = setup().await;
        let mut tracker = PositionTracker::new(3);
        executor.enter("ETHUSDT", Side::Long, 0.1, now()).await.unwrap();
        tracker.on_entry_fill("ETHUSDT", Side::Long, 2000.0, 0.1, now()).unwrap();
        let plan = executor
            .place_protection("ETHUSDT", Side::Long, 0.1, 2000.0, 0, now())
            .await
            .unwrap();
        tracker
            .set_protection("ETHUSDT", plan.stop_loss_price, plan.take_profit_price, Some(plan.orders))
            .unwrap();

        paper
            .inject_fault(Fault::Fail(ExchangeError::Rejected {
                code: -2019,
                message: "Margin is insufficient.".into(),
            }))
            .await;
        let position = tracker.get("ETHUSDT").unwrap().clone();
        let err = executor.close_position(&position, now()).await.unwrap_err();

        assert!(matches!(err, ExchangeError::Rejected { code: -2019, .. }));
        assert_eq!(paper.open_orders("ETHUSDT").await.len(), 2);
        assert_eq!(paper.get_open_positions().await.unwrap().len(), 1);
    }
}
