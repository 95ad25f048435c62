use thiserror::Error;

/// Errors returned by x402 protocol operations.
///
/// Oracle calls never surface here: they report failures through
/// [`VerifyOutcome`](crate::VerifyOutcome) and [`SettleOutcome`](crate::SettleOutcome).
#[derive(Debug, Error)]
pub enum X402Error {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("invalid payment header: {0}")]
    InvalidPaymentHeader(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
