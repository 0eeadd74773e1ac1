use anyhow::{bail, Context};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::engine::EngineConfig;
use crate::exchange::BinanceConfig;
use crate::execution::ExecutionConfig;
use crate::indicators::IndicatorConfig;
use crate::market::FeedConfig;
use crate::risk::{RiskLimits, SizingConfig};
use crate::strategy::SignalConfig;

const ENV_PREFIX: &str = "TRENDBOT";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>, // None keeps state in memory only
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: "trendbot".to_string(),
        }
    }
}

/// Runtime settings
///
/// Every section has defaults; a TOML file and `TRENDBOT__SECTION__KEY`
/// environment variables override them, in that order.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub symbols: Vec<String>,
    pub paper_balance: f64, // Starting USDT for --paper
    pub indicator: IndicatorConfig,
    pub signal: SignalConfig,
    pub risk: RiskLimits,
    pub sizing: SizingConfig,
    pub execution: ExecutionConfig,
    pub feed: FeedConfig,
    pub engine: EngineConfig,
    pub binance: BinanceConfig,
    pub redis: RedisConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            symbols: vec![
                "ETHUSDT".to_string(),
                "ADAUSDT".to_string(),
                "DOTUSDT".to_string(),
                "LINKUSDT".to_string(),
            ],
            paper_balance: 1_000.0,
            indicator: IndicatorConfig::default(),
            signal: SignalConfig::default(),
            risk: RiskLimits::default(),
            sizing: SizingConfig::default(),
            execution: ExecutionConfig::default(),
            feed: FeedConfig::default(),
            engine: EngineConfig::default(),
            binance: BinanceConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

impl Settings {
    /// Load from an optional TOML file plus environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        } else {
            builder = builder.add_source(File::with_name("trendbot").required(false));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("symbols")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.symbols.is_empty() {
            bail!("at least one symbol is required");
        }
        if self.symbols.iter().any(|s| s.trim().is_empty() || s.chars().any(|c| c.is_lowercase())) {
            bail!("symbols must be upper-case exchange symbols, got {:?}", self.symbols);
        }
        if self.indicator.ema_fast_period == 0 || self.indicator.ema_fast_period >= self.indicator.ema_slow_period {
            bail!(
                "ema_fast_period ({}) must be positive and below ema_slow_period ({})",
                self.indicator.ema_fast_period,
                self.indicator.ema_slow_period
            );
        }
        if self.indicator.rsi_history_len < self.signal.cross_lookback + 1 {
            bail!(
                "rsi_history_len ({}) must cover cross_lookback + 1 ({})",
                self.indicator.rsi_history_len,
                self.signal.cross_lookback + 1
            );
        }
        check_fraction("execution.stop_loss_pct", self.execution.stop_loss_pct)?;
        check_fraction("execution.take_profit_pct", self.execution.take_profit_pct)?;
        check_fraction("risk.max_drawdown_pct", self.risk.max_drawdown_pct)?;
        check_fraction("risk.max_allocation_pct", self.risk.max_allocation_pct)?;
        check_fraction("risk.reduce_risk_factor", self.risk.reduce_risk_factor)?;
        if self.sizing.max_symbol_notional <= 0.0 {
            bail!("sizing.max_symbol_notional must be positive");
        }
        if let Some(averaging) = &self.signal.averaging {
            check_fraction("signal.averaging.pullback_pct", averaging.pullback_pct)?;
            if averaging.decay <= 0.0 || averaging.decay > 1.0 {
                bail!("signal.averaging.decay must be in (0, 1], got {}", averaging.decay);
            }
        }
        Ok(())
    }
}

fn check_fraction(name: &str, value: f64) -> anyhow::Result<()> {
    if !(value > 0.0 && value < 1.0) {
        bail!("{} must be in (0, 1), got {}", name, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.symbols.len(), 4);
        assert!((settings.execution.stop_loss_pct - 0.03).abs() < 1e-12);
        assert!((settings.execution.take_profit_pct - 0.06).abs() < 1e-12);
        assert!(settings.signal.averaging.is_none());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = std::env::temp_dir().join(format!("trendbot-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trendbot.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
symbols = ["BTCUSDT", "SOLUSDT"]

[risk]
max_drawdown_pct = 0.10

[signal.averaging]
pullback_pct = 0.02
decay = 0.5
max_average_count = 2
"#
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.symbols, vec!["BTCUSDT", "SOLUSDT"]);
        assert!((settings.risk.max_drawdown_pct - 0.10).abs() < 1e-12);
        assert_eq!(settings.risk.daily_trade_limit, RiskLimits::default().daily_trade_limit);
        assert_eq!(settings.signal.max_average_count(), 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.execution.stop_loss_pct = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.symbols.clear();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.indicator.ema_fast_period = 30;
        assert!(settings.validate().is_err());
    }
}
