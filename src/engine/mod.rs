// Decision worker: signal -> risk -> sizing -> execution -> tracking
pub mod commands;
pub mod queue;

pub use commands::{channel, EngineCommand, EngineHandle};
pub use queue::EvaluationQueue;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{ExchangeError, ExecutionError};
use crate::exchange::Exchange;
use crate::execution::{ClosedTrade, Discrepancy, OrderExecutor, Position, PositionTracker};
use crate::indicators::IndicatorCache;
use crate::models::{IndicatorSnapshot, OrderResult, OrderStatus, Side, Signal, SignalAction, TradeKind, TradeRecord};
use crate::notify::{Alert, AlertKind, Notifier, Severity};
use crate::persistence::StateStore;
use crate::risk::{PositionSizer, Proposal, RiskGuard, RiskMetrics, Veto};
use crate::strategy::{SignalEngine, Strategy};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub reconcile_interval_secs: u64, // Balance refresh + position reconciliation
    pub command_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 60,
            command_buffer: 32,
        }
    }
}

/// What one evaluation did
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Hold,
    Vetoed(Veto),
    /// No order: sizing or filters ruled it out
    Skipped(String),
    Filled { kind: TradeKind, price: f64, quantity: f64 },
    /// Order outcome unknown; settled by reconciliation
    Pending { client_order_id: String },
    Failed(String),
}

/// External collaborators the engine is wired to
pub struct EngineParts {
    pub exchange: Arc<dyn Exchange>,
    pub store: Arc<dyn StateStore>,
    pub notifier: Arc<dyn Notifier>,
    pub queue: Arc<EvaluationQueue>,
    pub caches: HashMap<String, Arc<Mutex<IndicatorCache>>>,
}

/// Single decision worker
///
/// Owns the risk guard, the position tracker, the sizer and the executor, so
/// evaluations are strictly sequential and every risk decision sees the
/// result of the previous one.
pub struct Engine {
    strategy: Box<dyn Strategy>,
    risk: RiskGuard,
    tracker: PositionTracker,
    sizer: PositionSizer,
    executor: OrderExecutor,
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    queue: Arc<EvaluationQueue>,
    caches: HashMap<String, Arc<Mutex<IndicatorCache>>>,
    config: EngineConfig,
    available_balance: f64,
}

/// Outcome of resolving orders of unknown outcome
#[derive(Debug, Default)]
struct Settlement {
    /// Exit orders that filled, keyed by symbol
    exit_fills: HashMap<String, (f64, OrderResult)>,
    /// Some order turned out to have executed
    landed: bool,
    still_unknown: Vec<String>,
}

impl Engine {
    /// Restore persisted state, read the account, and reconcile once
    pub async fn bootstrap(settings: &Settings, parts: EngineParts) -> anyhow::Result<Self> {
        let now = Utc::now();
        let executor = OrderExecutor::new(parts.exchange, settings.execution.clone());

        let stored = match parts.store.load_state().await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load saved state, starting fresh");
                None
            }
        };

        let balance = executor.balance().await?;
        let equity = balance.equity();
        let available_balance = balance.available;
        let max_averages = settings.signal.max_average_count();

        let (risk, tracker) = match stored {
            Some(stored) => {
                tracing::info!(
                    positions = stored.positions.len(),
                    peak_equity = stored.risk.peak_equity,
                    "Restoring saved state"
                );
                let mut risk = RiskGuard::with_state(settings.risk.clone(), stored.risk, parts.notifier.clone());
                risk.observe_equity(equity, now);
                (risk, PositionTracker::with_positions(max_averages, stored.positions))
            }
            None => (
                RiskGuard::new(settings.risk.clone(), equity, now, parts.notifier.clone()),
                PositionTracker::new(max_averages),
            ),
        };

        let mut engine = Self {
            strategy: Box::new(SignalEngine::new(settings.signal.clone())),
            risk,
            tracker,
            sizer: PositionSizer::new(settings.sizing.clone(), settings.signal.averaging.clone()),
            executor,
            store: parts.store,
            notifier: parts.notifier,
            queue: parts.queue,
            caches: parts.caches,
            config: settings.engine.clone(),
            available_balance,
        };

        tracing::info!(
            equity = equity,
            strategy = engine.strategy.name(),
            symbols = engine.caches.len(),
            "🚀 Engine ready"
        );

        engine.reconcile(now).await;
        Ok(engine)
    }

    pub fn risk(&self) -> &RiskGuard {
        &self.risk
    }

    pub fn tracker(&self) -> &PositionTracker {
        &self.tracker
    }

    pub fn executor(&self) -> &OrderExecutor {
        &self.executor
    }

    /// Swap the decision strategy
    pub fn with_strategy(mut self, strategy: Box<dyn Strategy>) -> Self {
        tracing::info!(strategy = strategy.name(), "Strategy replaced");
        self.strategy = strategy;
        self
    }

    pub fn metrics(&self, now: DateTime<Utc>) -> RiskMetrics {
        self.risk.metrics(self.tracker.exposure(), self.available_balance, now)
    }

    /// Drain evaluations and commands until shutdown, then persist
    pub async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>, mut shutdown: watch::Receiver<bool>) {
        let queue = self.queue.clone();
        let mut refresh = tokio::time::interval(Duration::from_secs(self.config.reconcile_interval_secs.max(1)));
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Bootstrap already reconciled
        refresh.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(command) = commands.recv() => self.handle_command(command, Utc::now()).await,
                symbol = queue.next() => self.evaluate_symbol(&symbol).await,
                _ = refresh.tick() => {
                    let now = Utc::now();
                    self.refresh_equity(now).await;
                    self.reconcile(now).await;
                }
            }
        }

        tracing::info!("Engine shutting down, saving state");
        self.persist().await;
        tracing::info!("👋 Engine stopped");
    }

    pub async fn handle_command(&mut self, command: EngineCommand, now: DateTime<Utc>) {
        tracing::info!(command = ?command, "Operator command");
        match command {
            EngineCommand::Pause => self.risk.pause(),
            EngineCommand::Resume => self.risk.resume(),
            EngineCommand::ResumeSymbol(symbol) => {
                if !self.risk.resume_symbol(&symbol) {
                    tracing::info!(symbol = %symbol, "Symbol was not halted");
                }
            }
            EngineCommand::ForceClose(symbol) => match self.tracker.get(&symbol).cloned() {
                Some(position) => {
                    let decision = self.close(&position, "operator force close", None, now, now).await;
                    tracing::info!(symbol = %symbol, decision = ?decision, "Force close finished");
                }
                None => tracing::warn!(symbol = %symbol, "Force close requested but no position is open"),
            },
            EngineCommand::QueryMetrics(reply) => {
                if reply.send(self.metrics(now)).is_err() {
                    tracing::debug!("Metrics requester went away");
                }
            }
            EngineCommand::SetRiskParam(param) => {
                if let Err(e) = self.risk.set_param(param) {
                    tracing::warn!(error = %e, "Rejected risk parameter");
                    self.notifier
                        .notify(Alert::new(Severity::Warning, AlertKind::Engine, e.to_string()));
                }
            }
        }
    }

    /// Evaluate the latest closed-candle state of one symbol
    pub async fn evaluate_symbol(&mut self, symbol: &str) {
        let Some(cache) = self.caches.get(symbol) else {
            tracing::warn!(symbol = %symbol, "Evaluation requested for unknown symbol");
            return;
        };
        let snapshot = cache.lock().await.snapshot();

        match snapshot {
            Some(snapshot) => {
                let decision = self.evaluate_snapshot(snapshot, Utc::now()).await;
                tracing::debug!(symbol = %symbol, decision = ?decision, "Evaluation done");
            }
            None => tracing::debug!(symbol = %symbol, "Indicators still warming up"),
        }
    }

    /// Run one full decision cycle for a snapshot
    pub async fn evaluate_snapshot(&mut self, snapshot: IndicatorSnapshot, now: DateTime<Utc>) -> Decision {
        if let Some(decision) = self.settle_symbol(&snapshot.symbol, now).await {
            return decision;
        }

        let position = self.tracker.get(&snapshot.symbol).cloned();
        let signal = self.strategy.evaluate(&snapshot, position.as_ref(), now);

        if signal.action != SignalAction::Hold {
            tracing::info!(
                symbol = %signal.symbol,
                action = ?signal.action,
                confidence = signal.confidence,
                rsi = signal.basis.state.rsi14,
                trend = ?signal.basis.state.trend,
                reason = %signal.reason,
                "📊 Signal"
            );
        }

        match (signal.action, position) {
            (SignalAction::Hold, _) => Decision::Hold,
            (SignalAction::EnterLong, None) => self.enter(&signal, Side::Long, now).await,
            (SignalAction::EnterShort, None) => self.enter(&signal, Side::Short, now).await,
            (SignalAction::Average, Some(position)) => self.average(&signal, &position, now).await,
            (SignalAction::Exit, Some(position)) => {
                let at = signal.basis.candle_open_time;
                self.close(&position, &signal.reason, Some(signal.confidence), at, now).await
            }
            (action, _) => Decision::Skipped(format!("{:?} does not apply to current position state", action)),
        }
    }

    async fn enter(&mut self, signal: &Signal, side: Side, now: DateTime<Utc>) -> Decision {
        let symbol = signal.symbol.as_str();
        let price = signal.basis.last_close;
        let at = signal.basis.candle_open_time;

        let filters = match self.executor.filters(symbol).await {
            Ok(filters) => filters,
            Err(e) => return Decision::Skipped(format!("symbol filters unavailable: {}", e)),
        };
        let quantity = match self.sizer.size_entry(
            self.risk.state().current_equity,
            self.risk.allocation_pct(),
            signal.confidence,
            price,
            &filters,
        ) {
            Ok(quantity) => quantity,
            Err(e) => {
                tracing::info!(symbol = %symbol, reason = %e, "No entry order");
                return Decision::Skipped(e.to_string());
            }
        };

        if let Err(veto) = self.approve(symbol, signal.action, quantity * price, now) {
            return Decision::Vetoed(veto);
        }

        let result = match self.executor.enter(symbol, side, quantity, at).await {
            Ok(result) => result,
            Err(e) => return self.order_failed(symbol, "entry", &e.to_string()),
        };
        let Some((fill_price, fill_qty)) = filled(&result) else {
            return self.not_filled(symbol, &result);
        };

        if let Err(e) = self.tracker.on_entry_fill(symbol, side, fill_price, fill_qty, now) {
            return self.order_failed(symbol, "entry bookkeeping", &e.to_string());
        }
        self.risk.record_fill(now);
        self.record_trade(symbol, side, TradeKind::Open, fill_price, fill_qty, &result, signal, now)
            .await;

        tracing::info!(
            symbol = %symbol,
            side = ?side,
            price = fill_price,
            quantity = fill_qty,
            "✓ Position opened"
        );

        match self
            .executor
            .place_protection(symbol, side, fill_qty, fill_price, 0, at)
            .await
        {
            Ok(plan) => {
                if let Err(e) = self.tracker.set_protection(
                    symbol,
                    plan.stop_loss_price,
                    plan.take_profit_price,
                    Some(plan.orders),
                ) {
                    tracing::error!(symbol = %symbol, error = %e, "Could not record protection");
                }
            }
            Err(e) => self.protection_failed(symbol, e),
        }

        self.refresh_equity(now).await;
        self.persist().await;
        Decision::Filled {
            kind: TradeKind::Open,
            price: fill_price,
            quantity: fill_qty,
        }
    }

    async fn average(&mut self, signal: &Signal, position: &Position, now: DateTime<Utc>) -> Decision {
        let symbol = signal.symbol.as_str();
        let price = signal.basis.last_close;
        let at = signal.basis.candle_open_time;

        let filters = match self.executor.filters(symbol).await {
            Ok(filters) => filters,
            Err(e) => return Decision::Skipped(format!("symbol filters unavailable: {}", e)),
        };
        let quantity = match self.sizer.size_average(position, price, &filters) {
            Ok(quantity) => quantity,
            Err(e) => {
                tracing::info!(symbol = %symbol, reason = %e, "No averaging order");
                return Decision::Skipped(e.to_string());
            }
        };

        if let Err(veto) = self.approve(symbol, signal.action, quantity * price, now) {
            return Decision::Vetoed(veto);
        }

        let result = match self.executor.average(position, quantity, at).await {
            Ok(result) => result,
            Err(e) => return self.order_failed(symbol, "average", &e.to_string()),
        };
        let Some((fill_price, fill_qty)) = filled(&result) else {
            return self.not_filled(symbol, &result);
        };

        let count = match self.tracker.on_average_fill(symbol, fill_price, fill_qty, now) {
            Ok(count) => count,
            Err(e) => return self.order_failed(symbol, "average bookkeeping", &e.to_string()),
        };
        self.risk.record_fill(now);
        self.record_trade(symbol, position.side, TradeKind::Average, fill_price, fill_qty, &result, signal, now)
            .await;

        tracing::info!(
            symbol = %symbol,
            price = fill_price,
            quantity = fill_qty,
            average_count = count,
            "✓ Position averaged"
        );

        if let Some(updated) = self.tracker.get(symbol).cloned() {
            match self.executor.replace_protection(&updated, at).await {
                Ok(plan) => {
                    if let Err(e) = self.tracker.set_protection(
                        symbol,
                        plan.stop_loss_price,
                        plan.take_profit_price,
                        Some(plan.orders),
                    ) {
                        tracing::error!(symbol = %symbol, error = %e, "Could not record protection");
                    }
                }
                Err(e) => self.protection_failed(symbol, e),
            }
        }

        self.refresh_equity(now).await;
        self.persist().await;
        Decision::Filled {
            kind: TradeKind::Average,
            price: fill_price,
            quantity: fill_qty,
        }
    }

    /// Exit path shared by signals and operator force-close
    async fn close(
        &mut self,
        position: &Position,
        reason: &str,
        confidence: Option<f64>,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Decision {
        let symbol = position.symbol.as_str();

        // Exits are never vetoed, but the check keeps the day counter rolling
        if let Err(veto) = self.approve(symbol, SignalAction::Exit, position.notional(), now) {
            return Decision::Vetoed(veto);
        }

        if let Err(e) = self.tracker.mark_closing(symbol) {
            return Decision::Failed(e.to_string());
        }

        let result = match self.executor.close_position(position, at).await {
            Ok(result) => result,
            Err(e) => {
                if let Err(revert) = self.tracker.revert_closing(symbol) {
                    tracing::error!(symbol = %symbol, error = %revert, "Could not revert closing state");
                }
                return self.order_failed(symbol, "exit", &e.to_string());
            }
        };
        let Some((exit_price, _)) = filled(&result) else {
            // Still CLOSING; reconciliation settles it
            return self.not_filled(symbol, &result);
        };

        match self.tracker.on_exit_fill(symbol, exit_price, now) {
            Ok(trade) => {
                self.risk.record_fill(now);
                self.risk.record_close(trade.pnl, trade.closed_at);
                self.journal_close(&trade, Some(&result), confidence, reason).await;
                self.refresh_equity(now).await;
                self.persist().await;
                Decision::Filled {
                    kind: TradeKind::Close,
                    price: exit_price,
                    quantity: trade.quantity,
                }
            }
            Err(e) => self.order_failed(symbol, "exit bookkeeping", &e.to_string()),
        }
    }

    fn approve(&mut self, symbol: &str, action: SignalAction, notional: f64, now: DateTime<Utc>) -> Result<(), Veto> {
        let proposal = Proposal {
            symbol,
            action,
            notional,
        };
        let exposure = self.tracker.exposure();
        self.risk.check(&proposal, exposure, now).map_err(|veto| {
            tracing::info!(symbol = %symbol, action = ?action, notional = notional, veto = %veto, "🛑 Vetoed");
            veto
        })
    }

    fn order_failed(&self, symbol: &str, what: &str, error: &str) -> Decision {
        tracing::warn!(symbol = %symbol, error = %error, "⚠️ {} order failed", what);
        self.notifier.notify(
            Alert::new(
                Severity::Warning,
                AlertKind::OrderRejected,
                format!("{} order failed: {}", what, error),
            )
            .for_symbol(symbol),
        );
        Decision::Failed(error.to_string())
    }

    fn not_filled(&self, symbol: &str, result: &OrderResult) -> Decision {
        if result.status == OrderStatus::Unknown {
            tracing::warn!(
                symbol = %symbol,
                client_order_id = %result.client_order_id,
                "Order outcome unknown, waiting for reconciliation"
            );
            return Decision::Pending {
                client_order_id: result.client_order_id.clone(),
            };
        }
        self.order_failed(symbol, "market", &format!("ended {:?} without a fill", result.status))
    }

    fn protection_failed(&mut self, symbol: &str, error: ExecutionError) {
        tracing::error!(symbol = %symbol, error = %error, "Protective orders failed");
        self.notifier.notify(
            Alert::new(
                Severity::Critical,
                AlertKind::ProtectionFailure,
                format!("Position is unprotected: {}", error),
            )
            .for_symbol(symbol),
        );
        self.risk.halt_symbol(symbol, &error.to_string());
    }

    /// Pull the account balance into the equity curve
    pub async fn refresh_equity(&mut self, now: DateTime<Utc>) {
        match self.executor.balance().await {
            Ok(balance) => {
                self.available_balance = balance.available;
                self.risk.observe_equity(balance.equity(), now);
            }
            Err(e) => tracing::warn!(error = %e, "Balance refresh failed"),
        }
    }

    /// Orders of unknown outcome on `symbol` must settle before it trades again
    async fn settle_symbol(&mut self, symbol: &str, now: DateTime<Utc>) -> Option<Decision> {
        let pending: Vec<OrderResult> = self
            .executor
            .unresolved()
            .into_iter()
            .filter(|result| result.symbol == symbol)
            .collect();
        if pending.is_empty() {
            return None;
        }

        let settlement = self.resolve_unknown(pending).await;
        if let Some(client_order_id) = settlement.still_unknown.into_iter().next() {
            return Some(Decision::Pending { client_order_id });
        }
        if !settlement.landed {
            return None;
        }

        self.align_positions(settlement.exit_fills, now).await;
        Some(Decision::Skipped("order of unknown outcome settled by reconciliation".to_string()))
    }

    /// Settle unknown orders, then align positions with the exchange
    pub async fn reconcile(&mut self, now: DateTime<Utc>) {
        let pending = self.executor.unresolved();
        let settlement = self.resolve_unknown(pending).await;
        self.align_positions(settlement.exit_fills, now).await;
    }

    async fn resolve_unknown(&mut self, pending: Vec<OrderResult>) -> Settlement {
        let mut settlement = Settlement::default();
        for pending in pending {
            match self.executor.resolve(&pending.symbol, &pending.client_order_id).await {
                Ok(result) if result.status == OrderStatus::Unknown => {
                    settlement.still_unknown.push(result.client_order_id);
                }
                Ok(result) => {
                    let Some((price, _)) = filled(&result) else {
                        continue;
                    };
                    settlement.landed = true;
                    let closes_local = self
                        .tracker
                        .get(&result.symbol)
                        .is_some_and(|p| p.side.exit_order_side() == result.side);
                    if closes_local {
                        settlement.exit_fills.insert(result.symbol.clone(), (price, result));
                    }
                }
                Err(ExchangeError::OrderNotFound(_)) => {}
                Err(e) => {
                    tracing::info!(
                        client_order_id = %pending.client_order_id,
                        error = %e,
                        "Unknown order not settled"
                    );
                    settlement.still_unknown.push(pending.client_order_id);
                }
            }
        }
        settlement
    }

    async fn align_positions(&mut self, mut exit_fills: HashMap<String, (f64, OrderResult)>, now: DateTime<Utc>) {
        let exchange_positions = match self.executor.open_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                tracing::warn!(error = %e, "Position reconciliation skipped");
                return;
            }
        };

        let discrepancies = self.tracker.reconcile(&exchange_positions, now);
        if discrepancies.is_empty() {
            return;
        }

        for discrepancy in discrepancies {
            let symbol = discrepancy.symbol().to_string();
            self.notifier.notify(
                Alert::new(
                    Severity::Warning,
                    AlertKind::Reconciliation,
                    format!("{:?}", discrepancy),
                )
                .for_symbol(&symbol),
            );

            match discrepancy {
                Discrepancy::Vanished { position } => {
                    let exit = exit_fills.remove(&symbol);
                    self.settle_vanished(position, exit, now).await;
                }
                Discrepancy::Untracked { .. } | Discrepancy::SideMismatch { .. } | Discrepancy::QuantityMismatch { .. } => {
                    self.protect_adopted(&symbol, now).await;
                }
            }
        }

        self.persist().await;
    }

    /// A tracked position disappeared: work out how it closed
    async fn settle_vanished(&mut self, position: Position, exit: Option<(f64, OrderResult)>, now: DateTime<Utc>) {
        let symbol = position.symbol.clone();
        let mut exit_price = exit.as_ref().map(|(price, _)| *price);
        let mut exit_order = exit.map(|(_, result)| result);

        if let Some(orders) = position.protection.clone() {
            if exit_price.is_none() {
                for id in [&orders.stop_loss_id, &orders.take_profit_id] {
                    if let Ok(result) = self.executor.resolve(&symbol, id).await {
                        if let Some((price, _)) = filled(&result) {
                            exit_price = Some(price);
                            exit_order = Some(result);
                            break;
                        }
                    }
                }
            }
            // Leftover half of the pair
            self.executor.cancel_protection(&symbol, &orders).await;
        }

        match exit_price {
            Some(price) => {
                let trade = ClosedTrade {
                    symbol: symbol.clone(),
                    side: position.side,
                    quantity: position.quantity(),
                    entry_price: position.average_entry_price(),
                    exit_price: price,
                    pnl: position.unrealized_pnl(price),
                    average_count: position.average_count,
                    opened_at: position.opened_at,
                    closed_at: now,
                };
                self.risk.record_fill(now);
                self.risk.record_close(trade.pnl, trade.closed_at);
                self.journal_close(&trade, exit_order.as_ref(), None, "closed on exchange").await;
            }
            None => {
                tracing::warn!(symbol = %symbol, "Position closed outside the engine, exit price unknown");
            }
        }
        self.refresh_equity(now).await;
    }

    async fn protect_adopted(&mut self, symbol: &str, now: DateTime<Utc>) {
        let Some(position) = self.tracker.get(symbol).cloned() else {
            return;
        };
        match self.executor.replace_protection(&position, now).await {
            Ok(plan) => {
                if let Err(e) = self.tracker.set_protection(
                    symbol,
                    plan.stop_loss_price,
                    plan.take_profit_price,
                    Some(plan.orders),
                ) {
                    tracing::error!(symbol = %symbol, error = %e, "Could not record protection");
                }
            }
            Err(e) => self.protection_failed(symbol, e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_trade(
        &self,
        symbol: &str,
        side: Side,
        kind: TradeKind,
        price: f64,
        quantity: f64,
        result: &OrderResult,
        signal: &Signal,
        now: DateTime<Utc>,
    ) {
        let record = TradeRecord {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            kind,
            price,
            quantity,
            pnl: None,
            client_order_id: Some(result.client_order_id.clone()),
            confidence: Some(signal.confidence),
            reason: signal.reason.clone(),
            timestamp: now,
        };
        if let Err(e) = self.store.record_trade(&record).await {
            tracing::warn!(symbol = %symbol, error = %e, "Failed to record trade");
        }
    }

    async fn journal_close(
        &self,
        trade: &ClosedTrade,
        result: Option<&OrderResult>,
        confidence: Option<f64>,
        reason: &str,
    ) {
        let record = TradeRecord {
            id: Uuid::new_v4(),
            symbol: trade.symbol.clone(),
            side: trade.side,
            kind: TradeKind::Close,
            price: trade.exit_price,
            quantity: trade.quantity,
            pnl: Some(trade.pnl),
            client_order_id: result.map(|r| r.client_order_id.clone()),
            confidence,
            reason: reason.to_string(),
            timestamp: trade.closed_at,
        };
        if let Err(e) = self.store.record_trade(&record).await {
            tracing::warn!(symbol = %trade.symbol, error = %e, "Failed to record trade");
        }

        let emoji = if trade.pnl >= 0.0 { "💰" } else { "📉" };
        tracing::info!(
            symbol = %trade.symbol,
            entry = trade.entry_price,
            exit = trade.exit_price,
            pnl = trade.pnl,
            "{} Position closed",
            emoji
        );
        self.notifier.notify(
            Alert::new(
                Severity::Info,
                AlertKind::TradeClosed,
                format!(
                    "{:?} {} closed at {:.4} ({}), PnL {:+.2}",
                    trade.side, trade.quantity, trade.exit_price, reason, trade.pnl
                ),
            )
            .for_symbol(&trade.symbol),
        );
    }

    /// Save risk state and positions; failures are logged, never fatal
    pub async fn persist(&self) {
        if let Err(e) = self
            .store
            .save_state(self.risk.state(), &self.tracker.snapshot())
            .await
        {
            tracing::warn!(error = %e, "Failed to save engine state");
        }
    }
}

/// Fill price and quantity of a result that actually executed
fn filled(result: &OrderResult) -> Option<(f64, f64)> {
    match (result.status, result.avg_price) {
        (OrderStatus::Filled | OrderStatus::PartiallyFilled, Some(price)) if result.executed_qty > 0.0 && price > 0.0 => {
            Some((price, result.executed_qty))
        }
        _ => None,
    }
}
