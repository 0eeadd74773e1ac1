// Risk management module
pub mod risk_guard;
pub mod sizer;

pub use risk_guard::{Proposal, RiskGuard, RiskLimits, RiskMetrics, RiskParam, RiskState, TradeStats, Veto};
pub use sizer::{PositionSizer, SizingConfig};
