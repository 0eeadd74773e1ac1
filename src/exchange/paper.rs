use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

use super::Exchange;
use crate::error::ExchangeError;
use crate::models::{
    Balance, ExchangePosition, OrderRequest, OrderResult, OrderSide, OrderStatus, OrderType, Side, SymbolFilters,
};

const DEFAULT_LEVERAGE: f64 = 10.0;

/// Injected failure for the next `create_order` call
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail without touching the account
    Fail(ExchangeError),
    /// Apply the order, then report a timeout to the caller
    TimeoutAfterAccept,
}

#[derive(Debug, Clone, Copy)]
struct PaperPosition {
    side: Side,
    quantity: f64,
    entry_price: f64,
}

#[derive(Debug)]
struct PaperState {
    wallet: f64,
    leverage: f64,
    marks: HashMap<String, f64>,
    orders: HashMap<String, OrderResult>,
    stop_prices: HashMap<String, f64>,
    resting: Vec<String>,
    positions: HashMap<String, PaperPosition>,
    filters: HashMap<String, SymbolFilters>,
    faults: VecDeque<Fault>,
    next_order_id: u64,
    fills: u32,
}

impl PaperState {
    fn next_id(&mut self) -> String {
        self.next_order_id += 1;
        self.next_order_id.to_string()
    }

    fn unrealized(&self) -> f64 {
        self.positions
            .iter()
            .map(|(symbol, p)| {
                let mark = self.marks.get(symbol).copied().unwrap_or(p.entry_price);
                match p.side {
                    Side::Long => (mark - p.entry_price) * p.quantity,
                    Side::Short => (p.entry_price - mark) * p.quantity,
                }
            })
            .sum()
    }

    fn used_margin(&self) -> f64 {
        self.positions
            .values()
            .map(|p| p.entry_price * p.quantity / self.leverage)
            .sum()
    }

    /// Apply a market fill; returns the executed quantity
    fn fill(&mut self, symbol: &str, side: OrderSide, quantity: f64, price: f64, reduce_only: bool) -> Result<f64, ExchangeError> {
        let existing = self.positions.get(symbol).copied();
        let reduces = existing.is_some_and(|p| p.side.exit_order_side() == side);

        if reduce_only && !reduces {
            return Err(ExchangeError::Rejected {
                code: -2022,
                message: "ReduceOnly Order is rejected.".to_string(),
            });
        }

        match existing {
            Some(p) if reduces => {
                let qty = quantity.min(p.quantity);
                let pnl = match p.side {
                    Side::Long => (price - p.entry_price) * qty,
                    Side::Short => (p.entry_price - price) * qty,
                };
                self.wallet += pnl;
                let remaining = p.quantity - qty;
                if remaining <= 1e-12 {
                    self.positions.remove(symbol);
                    self.expire_orphans(symbol);
                } else if let Some(pos) = self.positions.get_mut(symbol) {
                    pos.quantity = remaining;
                }
                self.fills += 1;
                Ok(qty)
            }
            _ => {
                let available = self.wallet + self.unrealized() - self.used_margin();
                if price * quantity / self.leverage > available {
                    return Err(ExchangeError::InsufficientBalance("Margin is insufficient.".to_string()));
                }
                let side = match side {
                    OrderSide::Buy => Side::Long,
                    OrderSide::Sell => Side::Short,
                };
                let pos = self.positions.entry(symbol.to_string()).or_insert(PaperPosition {
                    side,
                    quantity: 0.0,
                    entry_price: price,
                });
                let total = pos.quantity + quantity;
                pos.entry_price = (pos.entry_price * pos.quantity + price * quantity) / total;
                pos.quantity = total;
                self.fills += 1;
                Ok(quantity)
            }
        }
    }

    /// Reduce-only orders left without a position can never fill
    fn expire_orphans(&mut self, symbol: &str) {
        let orders = &mut self.orders;
        self.resting.retain(|id| match orders.get_mut(id) {
            Some(order) if order.symbol == symbol => {
                order.status = OrderStatus::Expired;
                false
            }
            _ => true,
        });
    }

    fn triggered(&self, id: &str, mark: f64) -> bool {
        let (Some(order), Some(&stop)) = (self.orders.get(id), self.stop_prices.get(id)) else {
            return false;
        };
        match (order.order_type, order.side) {
            (OrderType::StopMarket, OrderSide::Sell) | (OrderType::TakeProfitMarket, OrderSide::Buy) => mark <= stop,
            (OrderType::StopMarket, OrderSide::Buy) | (OrderType::TakeProfitMarket, OrderSide::Sell) => mark >= stop,
            (OrderType::Market, _) => false,
        }
    }
}

/// In-memory simulated futures account
///
/// Market orders fill immediately at the mark price; stop-market and
/// take-profit-market orders rest until `set_mark_price` crosses their stop.
/// Orders are idempotent by client order id.
pub struct PaperExchange {
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                wallet: initial_balance,
                leverage: DEFAULT_LEVERAGE,
                marks: HashMap::new(),
                orders: HashMap::new(),
                stop_prices: HashMap::new(),
                resting: Vec::new(),
                positions: HashMap::new(),
                filters: HashMap::new(),
                faults: VecDeque::new(),
                next_order_id: 0,
                fills: 0,
            }),
        }
    }

    pub async fn set_filters(&self, symbol: &str, filters: SymbolFilters) {
        self.state.lock().await.filters.insert(symbol.to_string(), filters);
    }

    /// Adjust wallet balance directly (funding, external transfers)
    pub async fn set_wallet(&self, wallet: f64) {
        self.state.lock().await.wallet = wallet;
    }

    pub async fn inject_fault(&self, fault: Fault) {
        self.state.lock().await.faults.push_back(fault);
    }

    /// Number of executed fills since creation
    pub async fn fill_count(&self) -> u32 {
        self.state.lock().await.fills
    }

    /// Resting protective orders for a symbol
    pub async fn open_orders(&self, symbol: &str) -> Vec<OrderResult> {
        let state = self.state.lock().await;
        state
            .resting
            .iter()
            .filter_map(|id| state.orders.get(id))
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect()
    }

    pub async fn stop_price(&self, client_order_id: &str) -> Option<f64> {
        self.state.lock().await.stop_prices.get(client_order_id).copied()
    }

    /// Update the mark price and trigger any crossed stop orders
    pub async fn set_mark_price(&self, symbol: &str, price: f64) {
        let mut state = self.state.lock().await;
        state.marks.insert(symbol.to_string(), price);

        let triggered: Vec<String> = state
            .resting
            .iter()
            .filter(|id| state.orders.get(*id).is_some_and(|o| o.symbol == symbol))
            .filter(|id| state.triggered(id, price))
            .cloned()
            .collect();

        for id in triggered {
            state.resting.retain(|r| r != &id);
            let Some(order) = state.orders.get(&id).cloned() else {
                continue;
            };
            let outcome = state.fill(symbol, order.side, order.quantity, price, true);
            if let Some(stored) = state.orders.get_mut(&id) {
                match outcome {
                    Ok(qty) => {
                        tracing::info!(symbol = %symbol, client_order_id = %id, price = price, "Paper stop triggered");
                        stored.status = OrderStatus::Filled;
                        stored.executed_qty = qty;
                        stored.avg_price = Some(price);
                    }
                    Err(_) => stored.status = OrderStatus::Expired,
                }
            }
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn create_order(&self, request: &OrderRequest) -> Result<OrderResult, ExchangeError> {
        let mut state = self.state.lock().await;

        let fault = state.faults.pop_front();
        if let Some(Fault::Fail(err)) = fault {
            return Err(err);
        }
        let timeout_after_accept = matches!(fault, Some(Fault::TimeoutAfterAccept));

        if let Some(existing) = state.orders.get(&request.client_order_id) {
            return Ok(existing.clone());
        }

        if !request.quantity.is_finite() || request.quantity <= 0.0 {
            return Err(ExchangeError::Rejected {
                code: -4003,
                message: "Quantity less than or equal to zero.".to_string(),
            });
        }

        let mut result = OrderResult {
            client_order_id: request.client_order_id.clone(),
            exchange_order_id: Some(state.next_id()),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            executed_qty: 0.0,
            avg_price: None,
            status: OrderStatus::New,
        };

        match request.order_type {
            OrderType::Market => {
                let mark = state.marks.get(&request.symbol).copied().ok_or_else(|| ExchangeError::Rejected {
                    code: -1,
                    message: format!("No mark price for {}", request.symbol),
                })?;
                let qty = state.fill(&request.symbol, request.side, request.quantity, mark, request.reduce_only)?;
                result.executed_qty = qty;
                result.avg_price = Some(mark);
                result.status = OrderStatus::Filled;
            }
            OrderType::StopMarket | OrderType::TakeProfitMarket => {
                let stop = request.stop_price.ok_or_else(|| ExchangeError::Rejected {
                    code: -1102,
                    message: "Mandatory parameter 'stopPrice' was not sent.".to_string(),
                })?;
                state.stop_prices.insert(request.client_order_id.clone(), stop);
                state.resting.push(request.client_order_id.clone());
            }
        }

        state.orders.insert(request.client_order_id.clone(), result.clone());

        if timeout_after_accept {
            return Err(ExchangeError::Timeout);
        }
        Ok(result)
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<OrderResult, ExchangeError> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(client_order_id)
            .filter(|o| o.symbol == symbol)
            .ok_or_else(|| ExchangeError::OrderNotFound(client_order_id.to_string()))?;

        if order.status != OrderStatus::New {
            return Err(ExchangeError::Rejected {
                code: -2011,
                message: "Unknown order sent.".to_string(),
            });
        }
        order.status = OrderStatus::Canceled;
        let result = order.clone();
        state.resting.retain(|id| id != client_order_id);
        Ok(result)
    }

    async fn get_order(&self, symbol: &str, client_order_id: &str) -> Result<OrderResult, ExchangeError> {
        let state = self.state.lock().await;
        state
            .orders
            .get(client_order_id)
            .filter(|o| o.symbol == symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(client_order_id.to_string()))
    }

    async fn get_balance(&self) -> Result<Balance, ExchangeError> {
        let state = self.state.lock().await;
        let unrealized = state.unrealized();
        Ok(Balance {
            wallet: state.wallet,
            unrealized_pnl: unrealized,
            available: state.wallet + unrealized - state.used_margin(),
        })
    }

    async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let state = self.state.lock().await;
        let mut positions: Vec<ExchangePosition> = state
            .positions
            .iter()
            .map(|(symbol, p)| ExchangePosition {
                symbol: symbol.clone(),
                side: p.side,
                quantity: p.quantity,
                entry_price: p.entry_price,
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        Ok(self.state.lock().await.filters.get(symbol).copied().unwrap_or_default())
    }
}
