//! HTTP client for the external verification/settlement oracle.
//!
//! Both calls are non-throwing: transport errors, timeouts, non-success
//! statuses and unparseable bodies all come back as a negative outcome with a
//! synthesized reason. `settle` is attempted exactly once per call; retrying a
//! settlement is the caller's decision because a blind retry could submit the
//! same transfer twice.

use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::constants::{
    ORACLE_AUTH_HEADER, PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER, SETTLE_TIMEOUT_SECS,
    VERIFY_TIMEOUT_SECS,
};
use crate::payment::PaymentRequirements;
use crate::response::{OracleRequest, SettleOutcome, SettleResponse, VerifyOutcome, VerifyResponse};

/// The two remote calls the settlement pipeline depends on.
///
/// Object-safe so servers can hold an `Arc<dyn Oracle>` and tests can script
/// outcomes in-process.
pub trait Oracle: Send + Sync {
    fn verify<'a>(
        &'a self,
        payment_header: &'a str,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, VerifyOutcome>;

    fn settle<'a>(
        &'a self,
        payment_header: &'a str,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, SettleOutcome>;
}

#[derive(Debug, Clone, Copy)]
enum Call {
    Verify,
    Settle,
}

impl Call {
    fn path(self) -> &'static str {
        match self {
            Call::Verify => "verify",
            Call::Settle => "settle",
        }
    }
}

/// reqwest-backed [`Oracle`].
#[derive(Clone)]
pub struct OracleClient {
    http: reqwest::Client,
    base_url: String,
    hmac_secret: Option<Vec<u8>>,
    verify_timeout: Duration,
    settle_timeout: Duration,
}

impl OracleClient {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            hmac_secret: None,
            verify_timeout: Duration::from_secs(VERIFY_TIMEOUT_SECS),
            settle_timeout: Duration::from_secs(SETTLE_TIMEOUT_SECS),
        }
    }

    /// Sign every request body with HMAC-SHA256 under `secret`.
    pub fn with_hmac_secret(mut self, secret: Option<Vec<u8>>) -> Self {
        self.hmac_secret = secret;
        self
    }

    pub fn with_timeouts(mut self, verify: Duration, settle: Duration) -> Self {
        self.verify_timeout = verify;
        self.settle_timeout = settle;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST one oracle call and parse a success body.
    /// The error string is the reason reported back to the payer.
    async fn post<T: DeserializeOwned>(
        &self,
        call: Call,
        payment_header: &str,
        requirements: &PaymentRequirements,
    ) -> Result<T, String> {
        let url = format!("{}/{}", self.base_url, call.path());
        let body = OracleRequest {
            protocol_version: PROTOCOL_VERSION,
            payment_header,
            payment_requirements: requirements,
        };
        let body_bytes =
            serde_json::to_vec(&body).map_err(|e| format!("oracle request encoding failed: {e}"))?;

        let timeout = match call {
            Call::Verify => self.verify_timeout,
            Call::Settle => self.settle_timeout,
        };

        let mut request = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header(PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION.to_string())
            .timeout(timeout);

        if let Some(secret) = &self.hmac_secret {
            request = request.header(ORACLE_AUTH_HEADER, crate::auth::sign_body(secret, &body_bytes));
        }

        let resp = request.body(body_bytes).send().await.map_err(|e| {
            if e.is_timeout() {
                "oracle timed out".to_string()
            } else {
                format!("oracle unreachable: {e}")
            }
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err("oracle rate limited".to_string());
        }
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            tracing::warn!(
                call = call.path(),
                status = %status,
                body = %detail,
                "oracle returned non-success response"
            );
            return Err(format!("oracle returned {}", status.as_u16()));
        }

        resp.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                "oracle timed out".to_string()
            } else {
                format!("invalid oracle response: {e}")
            }
        })
    }
}

impl Oracle for OracleClient {
    fn verify<'a>(
        &'a self,
        payment_header: &'a str,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, VerifyOutcome> {
        Box::pin(async move {
            let started = Instant::now();
            let outcome = match self
                .post::<VerifyResponse>(Call::Verify, payment_header, requirements)
                .await
            {
                Ok(resp) => VerifyOutcome::from(resp),
                Err(reason) => VerifyOutcome::invalid(reason),
            };
            tracing::debug!(
                valid = outcome.valid,
                reason = outcome.reason.as_deref().unwrap_or(""),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "oracle verify finished"
            );
            outcome
        })
    }

    fn settle<'a>(
        &'a self,
        payment_header: &'a str,
        requirements: &'a PaymentRequirements,
    ) -> BoxFuture<'a, SettleOutcome> {
        Box::pin(async move {
            let started = Instant::now();
            let outcome = match self
                .post::<SettleResponse>(Call::Settle, payment_header, requirements)
                .await
            {
                Ok(resp) => SettleOutcome::from(resp),
                Err(reason) => SettleOutcome::Failed {
                    reason,
                    retryable: true,
                },
            };
            match &outcome {
                SettleOutcome::Settled(receipt) => tracing::info!(
                    tx = %receipt.transaction_id,
                    block = receipt.block_number,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "oracle settled payment"
                ),
                SettleOutcome::Failed { reason, retryable } => tracing::warn!(
                    reason = %reason,
                    retryable = *retryable,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "oracle settlement failed"
                ),
            }
            outcome
        })
    }
}
