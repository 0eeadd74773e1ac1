// Order execution and position state
pub mod executor;
pub mod position_tracker;

pub use executor::{protection_prices, ExecutionConfig, OrderExecutor, ProtectionPlan};
pub use position_tracker::{
    ClosedTrade, Discrepancy, Fill, Position, PositionState, PositionTracker, ProtectionOrders,
};
