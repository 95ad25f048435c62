use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;

/// Errors from the SQLite-backed stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another request inserted a record for this fingerprint first.
    #[error("duplicate fingerprint: {0}")]
    DuplicateFingerprint(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e)
    }
}

impl StoreError {
    /// True for a PRIMARY KEY / UNIQUE constraint violation.
    pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
        if let rusqlite::Error::SqliteFailure(err, _) = e {
            // SQLITE_CONSTRAINT_PRIMARYKEY, SQLITE_CONSTRAINT_UNIQUE
            return err.extended_code == 1555 || err.extended_code == 2067;
        }
        false
    }
}

/// Errors loading a catalog seed into the database.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    /// An action amount or resource network the protocol cannot price.
    #[error("{entry}: {source}")]
    Invalid {
        entry: String,
        source: x402::X402Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of a paywalled request, mapped to HTTP by [`ResponseError`].
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// Malformed or mismatched payment header.
    #[error("invalid payment header: {0}")]
    InvalidPaymentHeader(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Malformed request body.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// The proof already paid for something else.
    #[error("payment already used: {0}")]
    AlreadyUsed(String),

    /// The oracle declared the proof invalid (or could not be reached).
    #[error("verification rejected: {0}")]
    VerificationRejected(String),

    /// The proof verified but settlement failed.
    #[error("settlement rejected: {0}")]
    SettlementRejected(String),

    /// The payer is not allowed to pay this resource.
    #[error("sender not permitted: {0}")]
    Forbidden(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PaymentError {
    /// Stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            PaymentError::InvalidPaymentHeader(_) => "invalid_header",
            PaymentError::InvalidAmount(_) => "invalid_amount",
            PaymentError::InvalidRequest(_) => "invalid_request",
            PaymentError::UnknownResource(_) => "unknown_resource",
            PaymentError::UnknownAction(_) => "unknown_action",
            PaymentError::AlreadyUsed(_) => "already_used",
            PaymentError::VerificationRejected(_) => "verify_rejected",
            PaymentError::SettlementRejected(_) => "settle_rejected",
            PaymentError::Forbidden(_) => "forbidden",
            PaymentError::Store(_) => "store_error",
            PaymentError::Internal(_) => "internal",
        }
    }
}

impl From<x402::X402Error> for PaymentError {
    fn from(e: x402::X402Error) -> Self {
        match e {
            x402::X402Error::InvalidAmount(msg) => PaymentError::InvalidAmount(msg),
            x402::X402Error::InvalidPaymentHeader(msg) => PaymentError::InvalidPaymentHeader(msg),
            x402::X402Error::UnsupportedNetwork(net) => {
                PaymentError::Internal(format!("resource configured with unsupported network {net}"))
            }
            x402::X402Error::SerdeError(e) => PaymentError::Internal(e.to_string()),
        }
    }
}

impl ResponseError for PaymentError {
    fn status_code(&self) -> StatusCode {
        match self {
            PaymentError::InvalidPaymentHeader(_)
            | PaymentError::InvalidAmount(_)
            | PaymentError::InvalidRequest(_)
            | PaymentError::AlreadyUsed(_)
            | PaymentError::VerificationRejected(_)
            | PaymentError::SettlementRejected(_) => StatusCode::BAD_REQUEST,
            PaymentError::UnknownResource(_) | PaymentError::UnknownAction(_) => {
                StatusCode::NOT_FOUND
            }
            PaymentError::Forbidden(_) => StatusCode::FORBIDDEN,
            PaymentError::Store(_) | PaymentError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        let body = match self {
            PaymentError::InvalidPaymentHeader(reason) => {
                json!({ "error": "Invalid payment header", "reason": reason })
            }
            PaymentError::InvalidAmount(reason) => {
                json!({ "error": "Invalid amount", "reason": reason })
            }
            PaymentError::InvalidRequest(reason) => {
                json!({ "error": "Invalid request", "reason": reason })
            }
            PaymentError::UnknownResource(id) => {
                json!({ "error": "Unknown resource", "reason": id })
            }
            PaymentError::UnknownAction(key) => json!({ "error": "Unknown action", "reason": key }),
            PaymentError::AlreadyUsed(reason) => {
                json!({ "error": "Payment already used", "reason": reason })
            }
            PaymentError::VerificationRejected(reason) => {
                json!({ "error": "Payment verification failed", "reason": reason })
            }
            PaymentError::SettlementRejected(reason) => {
                json!({ "error": "Payment settlement failed", "reason": reason })
            }
            PaymentError::Forbidden(reason) => {
                json!({ "error": "Sender not permitted", "reason": reason })
            }
            PaymentError::Store(e) => {
                tracing::error!(error = %e, "payment store error");
                json!({ "error": "Internal error" })
            }
            PaymentError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                json!({ "error": "Internal error" })
            }
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            PaymentError::VerificationRejected("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            PaymentError::Forbidden("x".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            PaymentError::UnknownResource("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            PaymentError::Store(StoreError::LockPoisoned).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_amount_error_maps_from_protocol() {
        let err: PaymentError = x402::X402Error::InvalidAmount("abc".into()).into();
        assert!(matches!(err, PaymentError::InvalidAmount(_)));
    }
}
