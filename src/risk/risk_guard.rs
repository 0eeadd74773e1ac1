use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::models::SignalAction;
use crate::notify::{Alert, AlertKind, Notifier, Severity};

/// Hard limits applied to every proposed action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskLimits {
    pub max_drawdown_pct: f64,
    pub daily_trade_limit: u32,
    pub max_allocation_pct: f64,
    pub max_total_exposure_pct: f64,
    pub reduce_risk_drawdown_ratio: f64,
    pub reduce_risk_equity_ratio: f64,
    pub reduce_risk_factor: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_drawdown_pct: 0.15,       // -15% from peak
            daily_trade_limit: 50,        // Confirmed fills per UTC day
            max_allocation_pct: 0.02,     // 2% of equity per order
            max_total_exposure_pct: 0.80, // 80% of equity across all positions
            reduce_risk_drawdown_ratio: 0.7, // Reduce at 70% of the max drawdown
            reduce_risk_equity_ratio: 0.5,   // ...or below 50% of starting equity
            reduce_risk_factor: 0.5,         // Allocation multiplier while reducing
        }
    }
}

/// Runtime-adjustable risk parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RiskParam {
    MaxDrawdownPct(f64),
    DailyTradeLimit(u32),
    MaxAllocationPct(f64),
    MaxTotalExposurePct(f64),
}

/// Lifetime results of closed trades
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeStats {
    pub closed_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub total_pnl: f64,
}

impl TradeStats {
    /// Share of closed trades with positive PnL, in [0, 1]
    pub fn win_rate(&self) -> f64 {
        if self.closed_trades == 0 {
            return 0.0;
        }
        self.winning_trades as f64 / self.closed_trades as f64
    }
}

/// Realized PnL of one close, kept for the rolling daily and weekly sums
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClosedPnl {
    pub at: DateTime<Utc>,
    pub pnl: f64,
}

const PNL_WINDOW_DAYS: i64 = 7;

/// Equity curve, daily counters and operator halts; mutated only on
/// confirmed fills, balance refreshes and operator commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub peak_equity: f64,
    pub current_equity: f64,
    pub drawdown_pct: f64,
    pub trades_today: u32,
    pub day_start_utc: NaiveDate,
    #[serde(default)]
    pub initial_equity: f64,
    #[serde(default)]
    pub paused: bool,
    /// Symbols halted after a protection failure; only an operator resume clears them
    #[serde(default)]
    pub halted_symbols: BTreeSet<String>,
    #[serde(default)]
    pub stats: TradeStats,
    #[serde(default)]
    pub recent_closes: VecDeque<ClosedPnl>,
}

impl RiskState {
    pub fn new(initial_equity: f64, now: DateTime<Utc>) -> Self {
        let equity = initial_equity.max(0.0);
        Self {
            peak_equity: equity,
            current_equity: equity,
            drawdown_pct: 0.0,
            trades_today: 0,
            day_start_utc: now.date_naive(),
            initial_equity: equity,
            paused: false,
            halted_symbols: BTreeSet::new(),
            stats: TradeStats::default(),
            recent_closes: VecDeque::new(),
        }
    }

    /// Book a closed trade's realized PnL
    pub fn record_close(&mut self, pnl: f64, at: DateTime<Utc>) {
        if !pnl.is_finite() {
            return;
        }
        self.stats.closed_trades += 1;
        if pnl > 0.0 {
            self.stats.winning_trades += 1;
        } else {
            self.stats.losing_trades += 1;
        }
        self.stats.total_pnl += pnl;

        self.recent_closes.push_back(ClosedPnl { at, pnl });
        self.prune_closes(at);
    }

    fn prune_closes(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::days(PNL_WINDOW_DAYS);
        while self.recent_closes.front().is_some_and(|c| c.at <= cutoff) {
            self.recent_closes.pop_front();
        }
    }

    /// Realized PnL of closes within `window` before `now`
    pub fn realized_since(&self, now: DateTime<Utc>, window: chrono::Duration) -> f64 {
        let cutoff = now - window;
        self.recent_closes
            .iter()
            .filter(|c| c.at > cutoff && c.at <= now)
            .map(|c| c.pnl)
            .sum()
    }

    /// Record an equity observation; the peak never decreases
    pub fn update_equity(&mut self, equity: f64) {
        if !equity.is_finite() {
            return;
        }
        self.current_equity = equity;
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        self.drawdown_pct = if self.peak_equity <= 0.0 {
            0.0
        } else {
            ((self.peak_equity - equity) / self.peak_equity).max(0.0)
        };
    }

    /// Reset the trade counter when a new UTC day has started
    pub fn roll_day(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today != self.day_start_utc {
            self.day_start_utc = today;
            self.trades_today = 0;
            return true;
        }
        false
    }
}

/// Point-in-time risk and performance figures for the operator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskMetrics {
    pub equity: f64,
    pub peak_equity: f64,
    pub drawdown_pct: f64,
    pub available_balance: f64,
    pub total_exposure: f64,
    pub trades_today: u32,
    pub daily_pnl: f64,
    pub weekly_pnl: f64,
    pub total_pnl: f64,
    pub closed_trades: u32,
    pub win_rate: f64,
    pub paused: bool,
    pub halted_symbols: Vec<String>,
    pub reducing_risk: bool,
}

/// A proposed exchange action awaiting approval
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal<'a> {
    pub symbol: &'a str,
    pub action: SignalAction,
    pub notional: f64,
}

/// Why a proposal was refused
#[derive(Debug, Clone, PartialEq)]
pub enum Veto {
    Paused,
    SymbolHalted { symbol: String },
    MaxDrawdown { drawdown_pct: f64, max_pct: f64 },
    DailyTradeLimit { trades: u32, limit: u32 },
    AllocationExceeded { notional: f64, allowed: f64 },
    ExposureExceeded { exposure: f64, allowed: f64 },
}

impl fmt::Display for Veto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Veto::Paused => write!(f, "trading paused by operator"),
            Veto::SymbolHalted { symbol } => write!(f, "{} halted until operator resume", symbol),
            Veto::MaxDrawdown { drawdown_pct, max_pct } => write!(
                f,
                "drawdown {:.2}% >= max {:.2}%",
                drawdown_pct * 100.0,
                max_pct * 100.0
            ),
            Veto::DailyTradeLimit { trades, limit } => {
                write!(f, "daily trade limit reached ({}/{})", trades, limit)
            }
            Veto::AllocationExceeded { notional, allowed } => {
                write!(f, "notional {:.2} exceeds allocation {:.2}", notional, allowed)
            }
            Veto::ExposureExceeded { exposure, allowed } => {
                write!(f, "total exposure {:.2} would exceed {:.2}", exposure, allowed)
            }
        }
    }
}

/// Process-wide gatekeeper for every proposed action
///
/// Exits are always allowed. Entries and averages pass through, in order:
/// operator pause, symbol halt, drawdown, daily trade count, per-order
/// allocation, total exposure.
pub struct RiskGuard {
    limits: RiskLimits,
    state: RiskState,
    drawdown_halted: bool,
    notifier: Arc<dyn Notifier>,
}

impl RiskGuard {
    pub fn new(limits: RiskLimits, initial_equity: f64, now: DateTime<Utc>, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_state(limits, RiskState::new(initial_equity, now), notifier)
    }

    /// Restore from a persisted state
    pub fn with_state(limits: RiskLimits, mut state: RiskState, notifier: Arc<dyn Notifier>) -> Self {
        if state.initial_equity <= 0.0 {
            state.initial_equity = state.peak_equity;
        }
        let drawdown_halted = state.drawdown_pct >= limits.max_drawdown_pct;
        if state.paused || !state.halted_symbols.is_empty() {
            tracing::warn!(
                paused = state.paused,
                halted = ?state.halted_symbols,
                "Restored operator halts, resume required"
            );
        }
        Self {
            limits,
            state,
            drawdown_halted,
            notifier,
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    pub fn is_paused(&self) -> bool {
        self.state.paused
    }

    pub fn is_halted(&self, symbol: &str) -> bool {
        self.state.halted_symbols.contains(symbol)
    }

    /// Drawdown past its share of the limit, or equity below its share of the
    /// starting equity
    pub fn should_reduce_risk(&self) -> bool {
        let state = &self.state;
        if state.drawdown_pct > self.limits.max_drawdown_pct * self.limits.reduce_risk_drawdown_ratio {
            return true;
        }
        state.initial_equity > 0.0
            && state.current_equity < state.initial_equity * self.limits.reduce_risk_equity_ratio
    }

    /// Per-order allocation used for sizing, scaled down while reducing risk
    pub fn allocation_pct(&self) -> f64 {
        if self.should_reduce_risk() {
            self.limits.max_allocation_pct * self.limits.reduce_risk_factor.clamp(0.0, 1.0)
        } else {
            self.limits.max_allocation_pct
        }
    }

    pub fn metrics(&self, total_exposure: f64, available_balance: f64, now: DateTime<Utc>) -> RiskMetrics {
        let state = &self.state;
        RiskMetrics {
            equity: state.current_equity,
            peak_equity: state.peak_equity,
            drawdown_pct: state.drawdown_pct,
            available_balance,
            total_exposure,
            trades_today: if state.day_start_utc == now.date_naive() { state.trades_today } else { 0 },
            daily_pnl: state.realized_since(now, chrono::Duration::days(1)),
            weekly_pnl: state.realized_since(now, chrono::Duration::days(PNL_WINDOW_DAYS)),
            total_pnl: state.stats.total_pnl,
            closed_trades: state.stats.closed_trades,
            win_rate: state.stats.win_rate(),
            paused: state.paused,
            halted_symbols: state.halted_symbols.iter().cloned().collect(),
            reducing_risk: self.should_reduce_risk(),
        }
    }

    /// Approve or veto a proposal given the current open exposure
    pub fn check(&mut self, proposal: &Proposal<'_>, exposure: f64, now: DateTime<Utc>) -> Result<(), Veto> {
        self.state.roll_day(now);

        if !proposal.action.is_entry() {
            return Ok(());
        }

        if self.state.paused {
            return Err(Veto::Paused);
        }

        if self.state.halted_symbols.contains(proposal.symbol) {
            return Err(Veto::SymbolHalted {
                symbol: proposal.symbol.to_string(),
            });
        }

        if self.state.drawdown_pct >= self.limits.max_drawdown_pct {
            return Err(Veto::MaxDrawdown {
                drawdown_pct: self.state.drawdown_pct,
                max_pct: self.limits.max_drawdown_pct,
            });
        }

        if self.state.trades_today >= self.limits.daily_trade_limit {
            return Err(Veto::DailyTradeLimit {
                trades: self.state.trades_today,
                limit: self.limits.daily_trade_limit,
            });
        }

        let equity = self.state.current_equity.max(0.0);
        let allowed = self.limits.max_allocation_pct * equity;
        if proposal.notional > allowed {
            return Err(Veto::AllocationExceeded {
                notional: proposal.notional,
                allowed,
            });
        }

        let allowed_exposure = self.limits.max_total_exposure_pct * equity;
        if exposure + proposal.notional > allowed_exposure {
            return Err(Veto::ExposureExceeded {
                exposure: exposure + proposal.notional,
                allowed: allowed_exposure,
            });
        }

        Ok(())
    }

    /// Balance refresh
    pub fn observe_equity(&mut self, equity: f64, now: DateTime<Utc>) {
        self.state.roll_day(now);
        self.state.update_equity(equity);
        self.update_drawdown_halt();
    }

    fn update_drawdown_halt(&mut self) {
        let over = self.state.drawdown_pct >= self.limits.max_drawdown_pct;
        if over && !self.drawdown_halted {
            self.drawdown_halted = true;
            tracing::error!(
                drawdown_pct = self.state.drawdown_pct,
                max_pct = self.limits.max_drawdown_pct,
                "Max drawdown reached, new entries halted"
            );
            self.notifier.notify(Alert::new(
                Severity::Critical,
                AlertKind::RiskHalt,
                format!(
                    "Drawdown {:.2}% reached limit {:.2}%: new entries halted",
                    self.state.drawdown_pct * 100.0,
                    self.limits.max_drawdown_pct * 100.0
                ),
            ));
        } else if !over && self.drawdown_halted {
            self.drawdown_halted = false;
            tracing::info!(drawdown_pct = self.state.drawdown_pct, "Drawdown recovered, entries allowed");
            self.notifier.notify(Alert::new(
                Severity::Info,
                AlertKind::RiskResumed,
                format!("Drawdown recovered to {:.2}%", self.state.drawdown_pct * 100.0),
            ));
        }
    }

    /// Count a confirmed fill toward today's trades
    pub fn record_fill(&mut self, now: DateTime<Utc>) {
        self.state.roll_day(now);
        self.state.trades_today += 1;
    }

    /// Count a closed trade's realized PnL
    pub fn record_close(&mut self, pnl: f64, at: DateTime<Utc>) {
        self.state.record_close(pnl, at);
    }

    pub fn pause(&mut self) {
        if !self.state.paused {
            self.state.paused = true;
            tracing::warn!("Trading paused by operator");
        }
    }

    pub fn resume(&mut self) {
        if self.state.paused {
            self.state.paused = false;
            tracing::info!("Trading resumed by operator");
        }
    }

    /// Stop new entries for one symbol until the operator resumes it
    pub fn halt_symbol(&mut self, symbol: &str, reason: &str) {
        if self.state.halted_symbols.insert(symbol.to_string()) {
            tracing::error!(symbol = %symbol, reason = %reason, "Symbol halted");
            self.notifier.notify(
                Alert::new(
                    Severity::Critical,
                    AlertKind::RiskHalt,
                    format!("Entries halted: {}", reason),
                )
                .for_symbol(symbol),
            );
        }
    }

    pub fn resume_symbol(&mut self, symbol: &str) -> bool {
        let removed = self.state.halted_symbols.remove(symbol);
        if removed {
            tracing::info!(symbol = %symbol, "Symbol resumed by operator");
            self.notifier.notify(
                Alert::new(Severity::Info, AlertKind::RiskResumed, "Entries resumed").for_symbol(symbol),
            );
        }
        removed
    }

    pub fn set_param(&mut self, param: RiskParam) -> anyhow::Result<()> {
        let pct_ok = |v: f64| v.is_finite() && v > 0.0 && v <= 1.0;
        match param {
            RiskParam::MaxDrawdownPct(v) if pct_ok(v) => self.limits.max_drawdown_pct = v,
            RiskParam::MaxAllocationPct(v) if pct_ok(v) => self.limits.max_allocation_pct = v,
            RiskParam::MaxTotalExposurePct(v) if v.is_finite() && v > 0.0 => {
                self.limits.max_total_exposure_pct = v
            }
            RiskParam::DailyTradeLimit(n) => self.limits.daily_trade_limit = n,
            other => anyhow::bail!("Invalid risk parameter {:?}", other),
        }

        tracing::info!(param = ?param, "Risk parameter updated");
        // Limit change may flip the drawdown halt either way
        self.update_drawdown_halt();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelNotifier;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn guard(equity: f64) -> (RiskGuard, tokio::sync::mpsc::UnboundedReceiver<Alert>) {
        let (notifier, rx) = ChannelNotifier::new();
        (RiskGuard::new(RiskLimits::default(), equity, t0(), Arc::new(notifier)), rx)
    }

    fn entry(notional: f64) -> Proposal<'static> {
        Proposal {
            symbol: "ETHUSDT",
            action: SignalAction::EnterLong,
            notional,
        }
    }

    fn exit() -> Proposal<'static> {
        Proposal {
            symbol: "ETHUSDT",
            action: SignalAction::Exit,
            notional: 5_000.0,
        }
    }

    #[test]
    fn test_entry_within_limits_passes() {
        let (mut guard, _rx) = guard(10_000.0);
        assert!(guard.check(&entry(200.0), 0.0, t0()).is_ok());
    }

    #[test]
    fn test_drawdown_vetoes_entries_but_not_exits() {
        let (mut guard, mut rx) = guard(10_000.0);
        guard.observe_equity(8_400.0, t0()); // 16% from peak

        assert!(matches!(
            guard.check(&entry(100.0), 0.0, t0()),
            Err(Veto::MaxDrawdown { .. })
        ));
        let average = Proposal {
            action: SignalAction::Average,
            ..entry(100.0)
        };
        assert!(guard.check(&average, 0.0, t0()).is_err());
        assert!(guard.check(&exit(), 0.0, t0()).is_ok());

        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.kind, AlertKind::RiskHalt);
    }

    #[test]
    fn test_halt_alert_sent_once_per_transition() {
        let (mut guard, mut rx) = guard(10_000.0);
        guard.observe_equity(8_400.0, t0());
        guard.observe_equity(8_300.0, t0());
        guard.observe_equity(8_200.0, t0());

        assert_eq!(rx.try_recv().unwrap().kind, AlertKind::RiskHalt);
        assert!(rx.try_recv().is_err());

        guard.observe_equity(9_000.0, t0()); // 10% from peak
        assert_eq!(rx.try_recv().unwrap().kind, AlertKind::RiskResumed);
        assert!(guard.check(&entry(100.0), 0.0, t0()).is_ok());
    }

    #[test]
    fn test_daily_trade_limit_resets_at_utc_midnight() {
        let (notifier, _rx) = ChannelNotifier::new();
        let limits = RiskLimits {
            daily_trade_limit: 2,
            ..Default::default()
        };
        let mut guard = RiskGuard::new(limits, 10_000.0, t0(), Arc::new(notifier));

        guard.record_fill(t0());
        guard.record_fill(t0());
        assert!(matches!(
            guard.check(&entry(100.0), 0.0, t0()),
            Err(Veto::DailyTradeLimit { trades: 2, limit: 2 })
        ));

        let next_day = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 1).unwrap();
        assert!(guard.check(&entry(100.0), 0.0, next_day).is_ok());
        assert_eq!(guard.state().trades_today, 0);
    }

    #[test]
    fn test_allocation_and_exposure_vetoes() {
        let (mut guard, _rx) = guard(10_000.0);

        assert!(matches!(
            guard.check(&entry(201.0), 0.0, t0()),
            Err(Veto::AllocationExceeded { .. })
        ));
        assert!(matches!(
            guard.check(&entry(150.0), 7_900.0, t0()),
            Err(Veto::ExposureExceeded { .. })
        ));
    }

    #[test]
    fn test_pause_and_symbol_halt() {
        let (mut guard, mut rx) = guard(10_000.0);

        guard.pause();
        assert_eq!(guard.check(&entry(100.0), 0.0, t0()), Err(Veto::Paused));
        assert!(guard.check(&exit(), 0.0, t0()).is_ok());
        guard.resume();

        guard.halt_symbol("ETHUSDT", "stop-loss placement failed");
        guard.halt_symbol("ETHUSDT", "stop-loss placement failed");
        assert!(matches!(
            guard.check(&entry(100.0), 0.0, t0()),
            Err(Veto::SymbolHalted { .. })
        ));
        assert_eq!(rx.try_recv().unwrap().kind, AlertKind::RiskHalt);
        assert!(rx.try_recv().is_err());

        assert!(guard.resume_symbol("ETHUSDT"));
        assert!(guard.check(&entry(100.0), 0.0, t0()).is_ok());
    }

    #[test]
    fn test_set_param_validates() {
        let (mut guard, _rx) = guard(10_000.0);
        assert!(guard.set_param(RiskParam::MaxAllocationPct(0.05)).is_ok());
        assert_eq!(guard.limits().max_allocation_pct, 0.05);
        assert!(guard.set_param(RiskParam::MaxDrawdownPct(1.5)).is_err());
        assert!(guard.set_param(RiskParam::MaxAllocationPct(f64::NAN)).is_err());
    }

    #[test]
    fn test_halts_survive_restore() {
        let (mut guard, _rx) = guard(10_000.0);
        guard.pause();
        guard.halt_symbol("ETHUSDT", "stop-loss placement failed");

        let json = serde_json::to_string(guard.state()).unwrap();
        let restored: RiskState = serde_json::from_str(&json).unwrap();
        let (notifier, _rx) = ChannelNotifier::new();
        let mut guard = RiskGuard::with_state(RiskLimits::default(), restored, Arc::new(notifier));

        assert!(guard.is_paused());
        assert!(guard.is_halted("ETHUSDT"));
        guard.resume();
        assert!(matches!(
            guard.check(&entry(100.0), 0.0, t0()),
            Err(Veto::SymbolHalted { .. })
        ));
        assert!(guard.resume_symbol("ETHUSDT"));
        assert!(guard.check(&entry(100.0), 0.0, t0()).is_ok());
    }

    #[test]
    fn test_state_without_halt_fields_still_loads() {
        let json = r#"{"peak_equity":100.0,"current_equity":90.0,"drawdown_pct":0.1,"trades_today":3,"day_start_utc":"2024-05-01"}"#;
        let state: RiskState = serde_json::from_str(json).unwrap();
        assert!(!state.paused);
        assert!(state.halted_symbols.is_empty());
        assert_eq!(state.stats, TradeStats::default());
    }

    #[test]
    fn test_reduce_risk_scales_allocation() {
        let (mut guard, _rx) = guard(10_000.0);
        assert!(!guard.should_reduce_risk());
        assert_eq!(guard.allocation_pct(), 0.02);

        // 11% drawdown > 70% of the 15% limit
        guard.observe_equity(8_900.0, t0());
        assert!(guard.should_reduce_risk());
        assert!((guard.allocation_pct() - 0.01).abs() < 1e-12);

        guard.observe_equity(9_500.0, t0());
        assert!(!guard.should_reduce_risk());
    }

    #[test]
    fn test_reduce_risk_below_half_of_starting_equity() {
        let (notifier, _rx) = ChannelNotifier::new();
        let limits = RiskLimits {
            max_drawdown_pct: 1.0,
            reduce_risk_drawdown_ratio: 1.0,
            ..Default::default()
        };
        let mut state = RiskState::new(10_000.0, t0());
        // Peak reset by a restore; the starting equity still counts
        state.peak_equity = 4_000.0;
        state.update_equity(4_000.0);
        let guard = RiskGuard::with_state(limits, state, Arc::new(notifier));
        assert!(guard.should_reduce_risk());
    }

    #[test]
    fn test_metrics_track_closed_trades() {
        let (mut guard, _rx) = guard(10_000.0);
        guard.record_close(50.0, t0() - Duration::days(3));
        guard.record_close(-20.0, t0() - Duration::hours(2));
        guard.record_close(30.0, t0() - Duration::minutes(5));
        guard.pause();

        let metrics = guard.metrics(400.0, 9_000.0, t0());
        assert_eq!(metrics.closed_trades, 3);
        assert!((metrics.win_rate - 2.0 / 3.0).abs() < 1e-12);
        assert!((metrics.total_pnl - 60.0).abs() < 1e-9);
        assert!((metrics.daily_pnl - 10.0).abs() < 1e-9);
        assert!((metrics.weekly_pnl - 60.0).abs() < 1e-9);
        assert_eq!(metrics.total_exposure, 400.0);
        assert_eq!(metrics.available_balance, 9_000.0);
        assert!(metrics.paused);

        // Older than a week drops out of the weekly sum only
        let later = guard.metrics(0.0, 9_000.0, t0() + Duration::days(5));
        assert!((later.weekly_pnl - 10.0).abs() < 1e-9);
        assert!((later.total_pnl - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_peak_has_zero_drawdown() {
        let mut state = RiskState::new(0.0, t0());
        state.update_equity(0.0);
        assert_eq!(state.drawdown_pct, 0.0);
        state.update_equity(-10.0);
        assert_eq!(state.drawdown_pct, 0.0);
    }

    proptest! {
        #[test]
        fn prop_peak_monotonic_and_drawdown_non_negative(
            equities in proptest::collection::vec(-1_000.0f64..50_000.0, 1..50)
        ) {
            let mut state = RiskState::new(10_000.0, t0());
            let mut last_peak = state.peak_equity;
            for equity in equities {
                state.update_equity(equity);
                prop_assert!(state.peak_equity >= last_peak);
                prop_assert!(state.drawdown_pct >= 0.0);
                last_peak = state.peak_equity;
            }
        }

        #[test]
        fn prop_no_entry_while_drawdown_exceeded(
            drop_pct in 0.16f64..0.9,
            notional in 0.0f64..100.0,
            minutes in 0i64..10_000,
        ) {
            let (mut guard, _rx) = guard(10_000.0);
            guard.observe_equity(10_000.0 * (1.0 - drop_pct), t0());
            let at = t0() + Duration::minutes(minutes);
            prop_assert!(guard.check(&entry(notional), 0.0, at).is_err());
            prop_assert!(guard.check(&exit(), 0.0, at).is_ok());
        }
    }
}
