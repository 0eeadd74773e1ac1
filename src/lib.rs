// Core modules
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod market;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod retry;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::Settings;
pub use engine::{Engine, EngineHandle};
pub use models::*;
pub use strategy::Strategy;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
