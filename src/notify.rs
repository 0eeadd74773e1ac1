use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    RiskHalt,
    RiskResumed,
    ProtectionFailure,
    Reconciliation,
    OrderRejected,
    TradeClosed,
    Engine,
}

/// Structured operator notification
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub kind: AlertKind,
    pub symbol: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: Severity, kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind,
            symbol: None,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn for_symbol(mut self, symbol: &str) -> Self {
        self.symbol = Some(symbol.to_string());
        self
    }
}

/// Notification sink
///
/// Must not block: implementations hand the alert off and return.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: Alert);
}

/// Writes alerts to the tracing log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, alert: Alert) {
        let symbol = alert.symbol.as_deref().unwrap_or("-");
        match alert.severity {
            Severity::Info => {
                tracing::info!(kind = ?alert.kind, symbol = %symbol, "{}", alert.message)
            }
            Severity::Warning => {
                tracing::warn!(kind = ?alert.kind, symbol = %symbol, "{}", alert.message)
            }
            Severity::Critical => {
                tracing::error!(kind = ?alert.kind, symbol = %symbol, "🚨 {}", alert.message)
            }
        }
    }
}

/// Forwards alerts to a channel (chat bridge, tests)
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Alert>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, alert: Alert) {
        if self.tx.send(alert).is_err() {
            tracing::debug!("Alert receiver dropped");
        }
    }
}
