use thiserror::Error;

/// Malformed telemetry payload. Never fatal to a subscription.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short: {len} bytes, weight window needs {needed}")]
    TooShort { len: usize, needed: usize },
    #[error("byte 0x{byte:02x} at index {index} is not an ASCII digit")]
    NotADigit { index: usize, byte: u8 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("transport rejected subscribe: {0}")]
    Rejected(String),
    #[error("no valid weight sample after {tries} checks")]
    NoSample { tries: u32 },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DoserError {
    #[error("could not connect to scale after {attempts} attempt(s): {cause}")]
    ConnectionFailure { attempts: u32, cause: String },
    #[error("subscription failed: {0}")]
    SubscriptionFailure(#[from] SubscriptionError),
    #[error("dose cancelled before the scale confirmed the subscription")]
    CancelledDose,
    #[error("telemetry decode failed: {0}")]
    DecodeFailure(#[from] DecodeError),
    #[error("relay error: {0}")]
    Relay(String),
    #[error("max run time exceeded ({limit_ms} ms)")]
    MaxRuntime { limit_ms: u64 },
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing transport")]
    MissingTransport,
    #[error("missing relay")]
    MissingRelay,
    #[error("missing scale address")]
    MissingAddress,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = std::result::Result<T, DoserError>;
pub use eyre::Report;
