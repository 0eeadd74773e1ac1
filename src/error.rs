use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by an exchange adapter
///
/// Raw exchange payloads are mapped into these variants at the adapter
/// boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("exchange unavailable: {0}")]
    Unavailable(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("order rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("duplicate client order id: {0}")]
    DuplicateClientOrderId(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Timeout
                | ExchangeError::Network(_)
                | ExchangeError::RateLimited { .. }
                | ExchangeError::Unavailable(_)
        )
    }

    /// Outcome of the request is unknown (it may have been applied)
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ExchangeError::Timeout | ExchangeError::Network(_))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout
        } else if err.is_decode() {
            ExchangeError::Decode(err.to_string())
        } else {
            ExchangeError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::Decode(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connect failed for {symbol}: {message}")]
    Connect { symbol: String, message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("stream closed by remote")]
    Closed,

    #[error("malformed message: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("protective orders could not be placed for {symbol}: {source}")]
    CriticalProtectionFailure {
        symbol: String,
        #[source]
        source: ExchangeError,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum TrackerError {
    #[error("no tracked position for {0}")]
    NoPosition(String),

    #[error("position already open for {0}")]
    AlreadyOpen(String),

    #[error("average count for {symbol} would exceed maximum {max}")]
    MaxAveragesReached { symbol: String, max: u32 },

    #[error("invalid fill for {symbol}: {reason}")]
    InvalidFill { symbol: String, reason: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum SizingError {
    #[error("invalid price {0}")]
    InvalidPrice(f64),

    #[error("non-positive equity {0}")]
    NoEquity(f64),

    #[error("quantity {qty} below minimum {min_qty}")]
    BelowMinimum { qty: f64, min_qty: f64 },

    #[error("averaging is not configured")]
    AveragingDisabled,

    #[error("average count {count} reached maximum {max}")]
    MaxAveragesReached { count: u32, max: u32 },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store connection timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors a retry loop can classify
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Server-requested wait, overriding the computed backoff
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for ExchangeError {
    fn is_retryable(&self) -> bool {
        ExchangeError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ExchangeError::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

impl Retryable for FeedError {
    fn is_retryable(&self) -> bool {
        true
    }
}
