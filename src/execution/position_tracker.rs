use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::TrackerError;
use crate::models::{ExchangePosition, Side};

// Quantities closer than this are considered equal during reconciliation
const QTY_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionState {
    Flat,
    Open,
    Averaging,
    Closing,
}

/// A single confirmed fill that added to a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub price: f64,
    pub quantity: f64,
    pub at: DateTime<Utc>,
}

/// Resting reduce-only orders guarding a position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionOrders {
    pub stop_loss_id: String,
    pub take_profit_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entries: Vec<Fill>,       // Ordered, first fill first
    pub average_count: u32,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub state: PositionState,
    pub opened_at: DateTime<Utc>,
    pub protection: Option<ProtectionOrders>,
}

impl Position {
    pub fn quantity(&self) -> f64 {
        self.entries.iter().map(|f| f.quantity).sum()
    }

    /// Quantity-weighted average entry price
    pub fn average_entry_price(&self) -> f64 {
        let qty = self.quantity();
        if qty <= 0.0 {
            return 0.0;
        }
        self.entries.iter().map(|f| f.price * f.quantity).sum::<f64>() / qty
    }

    /// Quantity of the first fill; the base for averaging sizes
    pub fn first_fill_quantity(&self) -> f64 {
        self.entries.first().map_or(0.0, |f| f.quantity)
    }

    /// Notional at average entry
    pub fn notional(&self) -> f64 {
        self.average_entry_price() * self.quantity()
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        let diff = match self.side {
            Side::Long => price - self.average_entry_price(),
            Side::Short => self.average_entry_price() - price,
        };
        diff * self.quantity()
    }

    fn adopted(exchange: &ExchangePosition, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: exchange.symbol.clone(),
            side: exchange.side,
            entries: vec![Fill {
                price: exchange.entry_price,
                quantity: exchange.quantity,
                at,
            }],
            average_count: 0,
            stop_loss_price: None,
            take_profit_price: None,
            state: PositionState::Open,
            opened_at: at,
            protection: None,
        }
    }
}

/// Result of a completed round trip
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub average_count: u32,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Differences found between local and exchange-reported positions
///
/// Each one has already been corrected in favour of the exchange when it is
/// returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Discrepancy {
    /// Exchange position with no local record; adopted without protection
    Untracked { symbol: String, side: Side, quantity: f64 },
    /// Local record with no exchange position; removed
    Vanished { position: Position },
    QuantityMismatch { symbol: String, local: f64, exchange: f64 },
    SideMismatch { symbol: String, local: Side, exchange: Side },
}

impl Discrepancy {
    pub fn symbol(&self) -> &str {
        match self {
            Discrepancy::Untracked { symbol, .. }
            | Discrepancy::QuantityMismatch { symbol, .. }
            | Discrepancy::SideMismatch { symbol, .. } => symbol,
            Discrepancy::Vanished { position } => &position.symbol,
        }
    }
}

/// Authoritative per-symbol position state machine
///
/// FLAT -> OPEN (first fill) -> AVERAGING (additional fill) -> CLOSING (exit
/// submitted) -> FLAT (exit fill). A symbol with no entry is FLAT.
pub struct PositionTracker {
    positions: HashMap<String, Position>,
    max_average_count: u32,
    realized_pnl: f64,
}

impl PositionTracker {
    pub fn new(max_average_count: u32) -> Self {
        Self {
            positions: HashMap::new(),
            max_average_count,
            realized_pnl: 0.0,
        }
    }

    /// Restore from persisted positions
    pub fn with_positions(max_average_count: u32, positions: Vec<Position>) -> Self {
        let mut tracker = Self::new(max_average_count);
        for position in positions {
            if position.state != PositionState::Flat {
                tracker.positions.insert(position.symbol.clone(), position);
            }
        }

        tracing::info!(
            "Restored {} open positions from persistence",
            tracker.positions.len()
        );

        tracker
    }

    pub fn max_average_count(&self) -> u32 {
        self.max_average_count
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn state(&self, symbol: &str) -> PositionState {
        self.positions
            .get(symbol)
            .map_or(PositionState::Flat, |p| p.state)
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    /// Open positions sorted by symbol
    pub fn open_positions(&self) -> Vec<&Position> {
        let mut positions: Vec<&Position> = self.positions.values().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    /// Snapshot for persistence
    pub fn snapshot(&self) -> Vec<Position> {
        self.open_positions().into_iter().cloned().collect()
    }

    /// Sum of position notionals at average entry
    pub fn exposure(&self) -> f64 {
        self.positions.values().map(|p| p.notional()).sum()
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    /// First fill: FLAT -> OPEN
    pub fn on_entry_fill(
        &mut self,
        symbol: &str,
        side: Side,
        price: f64,
        quantity: f64,
        at: DateTime<Utc>,
    ) -> Result<&Position, TrackerError> {
        validate_fill(symbol, price, quantity)?;
        if self.positions.contains_key(symbol) {
            return Err(TrackerError::AlreadyOpen(symbol.to_string()));
        }

        let position = Position {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            entries: vec![Fill { price, quantity, at }],
            average_count: 0,
            stop_loss_price: None,
            take_profit_price: None,
            state: PositionState::Open,
            opened_at: at,
            protection: None,
        };

        tracing::info!(
            symbol = %symbol,
            side = ?side,
            price = price,
            quantity = quantity,
            "Position opened"
        );

        Ok(self.positions.entry(symbol.to_string()).or_insert(position))
    }

    /// Additional fill: OPEN/AVERAGING -> AVERAGING
    ///
    /// Returns the new average count.
    pub fn on_average_fill(
        &mut self,
        symbol: &str,
        price: f64,
        quantity: f64,
        at: DateTime<Utc>,
    ) -> Result<u32, TrackerError> {
        validate_fill(symbol, price, quantity)?;
        let max = self.max_average_count;
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| TrackerError::NoPosition(symbol.to_string()))?;

        match position.state {
            PositionState::Open | PositionState::Averaging => {}
            state => {
                return Err(TrackerError::InvalidFill {
                    symbol: symbol.to_string(),
                    reason: format!("cannot average in state {:?}", state),
                })
            }
        }

        if position.average_count >= max {
            return Err(TrackerError::MaxAveragesReached {
                symbol: symbol.to_string(),
                max,
            });
        }

        position.entries.push(Fill { price, quantity, at });
        position.average_count += 1;
        position.state = PositionState::Averaging;

        tracing::info!(
            symbol = %symbol,
            price = price,
            quantity = quantity,
            average_entry = position.average_entry_price(),
            average_count = position.average_count,
            "Position averaged"
        );

        Ok(position.average_count)
    }

    /// Record stop/take-profit levels and the order ids guarding them
    pub fn set_protection(
        &mut self,
        symbol: &str,
        stop_loss_price: f64,
        take_profit_price: f64,
        orders: Option<ProtectionOrders>,
    ) -> Result<(), TrackerError> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| TrackerError::NoPosition(symbol.to_string()))?;
        position.stop_loss_price = Some(stop_loss_price);
        position.take_profit_price = Some(take_profit_price);
        position.protection = orders;
        Ok(())
    }

    /// Exit submitted: -> CLOSING
    pub fn mark_closing(&mut self, symbol: &str) -> Result<(), TrackerError> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| TrackerError::NoPosition(symbol.to_string()))?;
        position.state = PositionState::Closing;
        Ok(())
    }

    /// Exit order failed terminally; back to OPEN/AVERAGING
    pub fn revert_closing(&mut self, symbol: &str) -> Result<(), TrackerError> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| TrackerError::NoPosition(symbol.to_string()))?;
        if position.state == PositionState::Closing {
            position.state = if position.average_count > 0 {
                PositionState::Averaging
            } else {
                PositionState::Open
            };
        }
        Ok(())
    }

    /// Exit fill: -> FLAT
    pub fn on_exit_fill(
        &mut self,
        symbol: &str,
        exit_price: f64,
        at: DateTime<Utc>,
    ) -> Result<ClosedTrade, TrackerError> {
        if !exit_price.is_finite() || exit_price <= 0.0 {
            return Err(TrackerError::InvalidFill {
                symbol: symbol.to_string(),
                reason: format!("exit price {}", exit_price),
            });
        }
        let position = self
            .positions
            .remove(symbol)
            .ok_or_else(|| TrackerError::NoPosition(symbol.to_string()))?;

        let pnl = position.unrealized_pnl(exit_price);
        self.realized_pnl += pnl;

        tracing::info!(
            symbol = %symbol,
            exit_price = exit_price,
            pnl = pnl,
            "Position closed"
        );

        Ok(ClosedTrade {
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: position.quantity(),
            entry_price: position.average_entry_price(),
            exit_price,
            pnl,
            average_count: position.average_count,
            opened_at: position.opened_at,
            closed_at: at,
        })
    }

    /// Align local state with exchange-reported positions, trusting the exchange
    pub fn reconcile(
        &mut self,
        exchange_positions: &[ExchangePosition],
        at: DateTime<Utc>,
    ) -> Vec<Discrepancy> {
        let mut discrepancies = Vec::new();
        let reported: HashMap<&str, &ExchangePosition> = exchange_positions
            .iter()
            .filter(|p| p.quantity > QTY_TOLERANCE)
            .map(|p| (p.symbol.as_str(), p))
            .collect();

        // Local records the exchange no longer has
        let mut vanished: Vec<String> = self
            .positions
            .keys()
            .filter(|symbol| !reported.contains_key(symbol.as_str()))
            .cloned()
            .collect();
        vanished.sort();
        for symbol in vanished {
            if let Some(position) = self.positions.remove(&symbol) {
                tracing::warn!(symbol = %symbol, "Tracked position missing on exchange, removing");
                discrepancies.push(Discrepancy::Vanished { position });
            }
        }

        let mut symbols: Vec<&str> = reported.keys().copied().collect();
        symbols.sort();
        for symbol in symbols {
            let exchange = reported[symbol];
            match self.positions.get_mut(symbol) {
                None => {
                    tracing::warn!(
                        symbol = %symbol,
                        side = ?exchange.side,
                        quantity = exchange.quantity,
                        "Untracked exchange position, adopting"
                    );
                    self.positions
                        .insert(symbol.to_string(), Position::adopted(exchange, at));
                    discrepancies.push(Discrepancy::Untracked {
                        symbol: symbol.to_string(),
                        side: exchange.side,
                        quantity: exchange.quantity,
                    });
                }
                Some(local) if local.side != exchange.side => {
                    tracing::warn!(
                        symbol = %symbol,
                        local = ?local.side,
                        exchange = ?exchange.side,
                        "Side mismatch, replacing local position"
                    );
                    let local_side = local.side;
                    *local = Position::adopted(exchange, at);
                    discrepancies.push(Discrepancy::SideMismatch {
                        symbol: symbol.to_string(),
                        local: local_side,
                        exchange: exchange.side,
                    });
                }
                Some(local) => {
                    let local_qty = local.quantity();
                    if (local_qty - exchange.quantity).abs() > QTY_TOLERANCE.max(exchange.quantity * 1e-6) {
                        tracing::warn!(
                            symbol = %symbol,
                            local = local_qty,
                            exchange = exchange.quantity,
                            "Quantity mismatch, trusting exchange"
                        );
                        let first_at = local.entries.first().map_or(at, |f| f.at);
                        local.entries = vec![Fill {
                            price: exchange.entry_price,
                            quantity: exchange.quantity,
                            at: first_at,
                        }];
                        discrepancies.push(Discrepancy::QuantityMismatch {
                            symbol: symbol.to_string(),
                            local: local_qty,
                            exchange: exchange.quantity,
                        });
                    }
                }
            }
        }

        discrepancies
    }
}

fn validate_fill(symbol: &str, price: f64, quantity: f64) -> Result<(), TrackerError> {
    if !price.is_finite() || price <= 0.0 || !quantity.is_finite() || quantity <= 0.0 {
        return Err(TrackerError::InvalidFill {
            symbol: symbol.to_string(),
            reason: format!("price {} quantity {}", price, quantity),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn exchange_position(symbol: &str, side: Side, quantity: f64, entry_price: f64) -> ExchangePosition {
        ExchangePosition {
            symbol: symbol.to_string(),
            side,
            quantity,
            entry_price,
        }
    }

    #[test]
    fn test_open_position() {
        let mut tracker = PositionTracker::new(2);
        assert_eq!(tracker.state("ETHUSDT"), PositionState::Flat);

        let position = tracker
            .on_entry_fill("ETHUSDT", Side::Long, 2000.0, 0.5, now())
            .unwrap();
        assert_eq!(position.state, PositionState::Open);
        assert_eq!(position.quantity(), 0.5);
        assert_eq!(position.average_entry_price(), 2000.0);
        assert_eq!(tracker.exposure(), 1000.0);
    }

    #[test]
    fn test_prevent_duplicate_positions() {
        let mut tracker = PositionTracker::new(2);
        tracker
            .on_entry_fill("ETHUSDT", Side::Long, 2000.0, 0.5, now())
            .unwrap();

        let result = tracker.on_entry_fill("ETHUSDT", Side::Long, 2010.0, 0.5, now());
        assert_eq!(result.unwrap_err(), TrackerError::AlreadyOpen("ETHUSDT".to_string()));
    }

    #[test]
    fn test_average_updates_entry_and_state() {
        let mut tracker = PositionTracker::new(2);
        tracker
            .on_entry_fill("ETHUSDT", Side::Long, 100.0, 1.0, now())
            .unwrap();

        let count = tracker.on_average_fill("ETHUSDT", 94.0, 0.5, now()).unwrap();
        assert_eq!(count, 1);

        let position = tracker.get("ETHUSDT").unwrap();
        assert_eq!(position.state, PositionState::Averaging);
        assert_eq!(position.quantity(), 1.5);
        assert!((position.average_entry_price() - 98.0).abs() < 1e-9);
        assert_eq!(position.first_fill_quantity(), 1.0);
    }

    #[test]
    fn test_average_count_capped() {
        let mut tracker = PositionTracker::new(1);
        tracker
            .on_entry_fill("ETHUSDT", Side::Long, 100.0, 1.0, now())
            .unwrap();
        tracker.on_average_fill("ETHUSDT", 98.0, 0.5, now()).unwrap();

        let result = tracker.on_average_fill("ETHUSDT", 96.0, 0.25, now());
        assert!(matches!(result, Err(TrackerError::MaxAveragesReached { max: 1, .. })));
        assert_eq!(tracker.get("ETHUSDT").unwrap().average_count, 1);
    }

    #[test]
    fn test_cannot_average_while_closing() {
        let mut tracker = PositionTracker::new(3);
        tracker
            .on_entry_fill("ETHUSDT", Side::Long, 100.0, 1.0, now())
            .unwrap();
        tracker.mark_closing("ETHUSDT").unwrap();

        let result = tracker.on_average_fill("ETHUSDT", 98.0, 0.5, now());
        assert!(matches!(result, Err(TrackerError::InvalidFill { .. })));
    }

    #[test]
    fn test_close_position_long() {
        let mut tracker = PositionTracker::new(2);
        tracker
            .on_entry_fill("ETHUSDT", Side::Long, 100.0, 2.0, now())
            .unwrap();
        tracker.mark_closing("ETHUSDT").unwrap();
        assert_eq!(tracker.state("ETHUSDT"), PositionState::Closing);

        let trade = tracker.on_exit_fill("ETHUSDT", 110.0, now()).unwrap();
        assert_eq!(trade.pnl, 20.0); // 2 * (110 - 100)
        assert_eq!(tracker.state("ETHUSDT"), PositionState::Flat);
        assert_eq!(tracker.realized_pnl(), 20.0);
        assert_eq!(tracker.exposure(), 0.0);
    }

    #[test]
    fn test_close_position_short_tracks_loss() {
        let mut tracker = PositionTracker::new(2);
        tracker
            .on_entry_fill("BTCUSDT", Side::Short, 100.0, 2.0, now())
            .unwrap();

        let trade = tracker.on_exit_fill("BTCUSDT", 105.0, now()).unwrap();
        assert_eq!(trade.pnl, -10.0); // 2 * (100 - 105)
    }

    #[test]
    fn test_cannot_close_flat_symbol() {
        let mut tracker = PositionTracker::new(2);
        let result = tracker.on_exit_fill("ETHUSDT", 100.0, now());
        assert_eq!(result.unwrap_err(), TrackerError::NoPosition("ETHUSDT".to_string()));
    }

    #[test]
    fn test_revert_closing_restores_state() {
        let mut tracker = PositionTracker::new(2);
        tracker
            .on_entry_fill("ETHUSDT", Side::Long, 100.0, 1.0, now())
            .unwrap();
        tracker.on_average_fill("ETHUSDT", 98.0, 0.5, now()).unwrap();
        tracker.mark_closing("ETHUSDT").unwrap();
        tracker.revert_closing("ETHUSDT").unwrap();
        assert_eq!(tracker.state("ETHUSDT"), PositionState::Averaging);
    }

    #[test]
    fn test_reconcile_adopts_untracked() {
        let mut tracker = PositionTracker::new(2);
        let found = tracker.reconcile(&[exchange_position("SOLUSDT", Side::Short, 3.0, 150.0)], now());

        assert_eq!(
            found,
            vec![Discrepancy::Untracked {
                symbol: "SOLUSDT".to_string(),
                side: Side::Short,
                quantity: 3.0
            }]
        );
        let adopted = tracker.get("SOLUSDT").unwrap();
        assert_eq!(adopted.state, PositionState::Open);
        assert_eq!(adopted.stop_loss_price, None);
        assert!(adopted.protection.is_none());
    }

    #[test]
    fn test_reconcile_removes_vanished() {
        let mut tracker = PositionTracker::new(2);
        tracker
            .on_entry_fill("ETHUSDT", Side::Long, 100.0, 1.0, now())
            .unwrap();

        let found = tracker.reconcile(&[], now());
        assert_eq!(found.len(), 1);
        assert!(matches!(&found[0], Discrepancy::Vanished { position } if position.symbol == "ETHUSDT"));
        assert!(!tracker.has_position("ETHUSDT"));
    }

    #[test]
    fn test_reconcile_trusts_exchange_quantity_and_side() {
        let mut tracker = PositionTracker::new(2);
        tracker
            .on_entry_fill("ETHUSDT", Side::Long, 100.0, 1.0, now())
            .unwrap();
        tracker
            .on_entry_fill("BTCUSDT", Side::Long, 50_000.0, 0.01, now())
            .unwrap();

        let found = tracker.reconcile(
            &[
                exchange_position("ETHUSDT", Side::Long, 0.6, 101.0),
                exchange_position("BTCUSDT", Side::Short, 0.01, 50_500.0),
            ],
            now(),
        );

        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|d| matches!(d, Discrepancy::SideMismatch { symbol, .. } if symbol == "BTCUSDT")));
        assert!(found.iter().any(|d| matches!(d, Discrepancy::QuantityMismatch { symbol, .. } if symbol == "ETHUSDT")));

        assert_eq!(tracker.get("ETHUSDT").unwrap().quantity(), 0.6);
        assert_eq!(tracker.get("BTCUSDT").unwrap().side, Side::Short);
    }

    #[test]
    fn test_reconcile_matching_state_is_quiet() {
        let mut tracker = PositionTracker::new(2);
        tracker
            .on_entry_fill("ETHUSDT", Side::Long, 100.0, 1.0, now())
            .unwrap();
        tracker.on_average_fill("ETHUSDT", 96.0, 0.5, now()).unwrap();

        let found = tracker.reconcile(&[exchange_position("ETHUSDT", Side::Long, 1.5, 98.67)], now());
        assert!(found.is_empty());
        assert_eq!(tracker.get("ETHUSDT").unwrap().average_count, 1);
    }

    proptest! {
        #[test]
        fn prop_average_count_never_exceeds_max(max in 0u32..5, attempts in 0usize..12) {
            let mut tracker = PositionTracker::new(max);
            tracker.on_entry_fill("ETHUSDT", Side::Long, 100.0, 1.0, Utc::now()).unwrap();
            for i in 0..attempts {
                let _ = tracker.on_average_fill("ETHUSDT", 99.0 - i as f64, 0.5, Utc::now());
            }
            prop_assert!(tracker.get("ETHUSDT").unwrap().average_count <= max);
        }
    }
}
