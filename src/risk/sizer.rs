use serde::Deserialize;

use crate::error::SizingError;
use crate::execution::Position;
use crate::models::SymbolFilters;
use crate::strategy::AveragingConfig;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SizingConfig {
    pub max_symbol_notional: f64, // USDT cap per symbol, entries plus averages
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            max_symbol_notional: 100.0,
        }
    }
}

/// Converts an approved signal into a concrete order quantity
pub struct PositionSizer {
    config: SizingConfig,
    averaging: Option<AveragingConfig>,
}

impl PositionSizer {
    pub fn new(config: SizingConfig, averaging: Option<AveragingConfig>) -> Self {
        Self { config, averaging }
    }

    /// Entry quantity: equity * allocation * confidence / price, floored to the
    /// lot step and capped by the per-symbol notional
    pub fn size_entry(
        &self,
        equity: f64,
        max_allocation_pct: f64,
        confidence: f64,
        price: f64,
        filters: &SymbolFilters,
    ) -> Result<f64, SizingError> {
        validate_price(price)?;
        if !equity.is_finite() || equity <= 0.0 {
            return Err(SizingError::NoEquity(equity));
        }

        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let budget = (equity * max_allocation_pct.max(0.0) * confidence).min(self.config.max_symbol_notional);
        let qty = filters.floor_qty(budget / price);

        check_minimum(qty, filters)
    }

    /// Averaging quantity: first fill * decay^(n+1) for the next average n
    pub fn size_average(&self, position: &Position, price: f64, filters: &SymbolFilters) -> Result<f64, SizingError> {
        validate_price(price)?;
        let averaging = self.averaging.as_ref().ok_or(SizingError::AveragingDisabled)?;

        if position.average_count >= averaging.max_average_count {
            return Err(SizingError::MaxAveragesReached {
                count: position.average_count,
                max: averaging.max_average_count,
            });
        }

        let exponent = (position.average_count + 1) as i32;
        let mut qty = position.first_fill_quantity() * averaging.decay.max(0.0).powi(exponent);

        let headroom = self.config.max_symbol_notional - position.notional();
        if headroom <= 0.0 {
            return Err(SizingError::BelowMinimum {
                qty: 0.0,
                min_qty: filters.min_qty,
            });
        }
        qty = qty.min(headroom / price);

        check_minimum(filters.floor_qty(qty), filters)
    }
}

fn validate_price(price: f64) -> Result<(), SizingError> {
    if !price.is_finite() || price <= 0.0 {
        return Err(SizingError::InvalidPrice(price));
    }
    Ok(())
}

fn check_minimum(qty: f64, filters: &SymbolFilters) -> Result<f64, SizingError> {
    if qty <= 0.0 || qty < filters.min_qty {
        return Err(SizingError::BelowMinimum {
            qty,
            min_qty: filters.min_qty,
        });
    }
    Ok(qty)
}
