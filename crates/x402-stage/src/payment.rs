use alloy::primitives::{Address, FixedBytes};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::constants::PROTOCOL_VERSION;
use crate::error::X402Error;

/// The payment challenge: what a payer must authorize to unlock a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    pub pay_to: Address,
    pub asset: Address,
    pub description: String,
    pub mime_type: String,
    /// Amount in the asset's base units, as a decimal integer string.
    pub max_amount_required: String,
    pub max_timeout_seconds: u64,
}

/// Body of an HTTP 402 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredBody {
    pub error: String,
    pub protocol_version: u32,
    pub payment_requirements: PaymentRequirements,
}

impl PaymentRequiredBody {
    pub fn new(requirements: PaymentRequirements) -> Self {
        Self {
            error: "Payment required".to_string(),
            protocol_version: PROTOCOL_VERSION,
            payment_requirements: requirements,
        }
    }
}

/// Signed transfer authorization inside a payment proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactPayload {
    pub from: Address,
    pub to: Address,
    pub value: String,
    pub valid_after: String,
    pub valid_before: String,
    pub nonce: FixedBytes<32>,
    pub signature: String,
    pub asset: Address,
}

/// Wire-format payment proof (sent in the `X-PAYMENT` header, base64-encoded JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentProof {
    pub protocol_version: u32,
    pub scheme: String,
    pub network: String,
    pub payload: ExactPayload,
}

/// Decode the `X-PAYMENT` header value into a [`PaymentProof`].
///
/// Surrounding whitespace is ignored; anything else that is not base64 of a
/// well-formed proof is rejected.
pub fn decode_payment_header(header_value: &str) -> Result<PaymentProof, X402Error> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(header_value.trim())
        .map_err(|e| X402Error::InvalidPaymentHeader(format!("invalid base64: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| X402Error::InvalidPaymentHeader(format!("invalid JSON payload: {e}")))
}

/// Encode a proof for the `X-PAYMENT` header.
pub fn encode_payment_header(proof: &PaymentProof) -> Result<String, X402Error> {
    let json = serde_json::to_vec(proof)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(json))
}
