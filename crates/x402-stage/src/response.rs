use serde::{Deserialize, Deserializer, Serialize};

use crate::payment::PaymentRequirements;

/// Request body sent to the oracle's `/verify` and `/settle` endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleRequest<'a> {
    pub protocol_version: u32,
    /// The raw `X-PAYMENT` header value, forwarded untouched.
    pub payment_header: &'a str,
    pub payment_requirements: &'a PaymentRequirements,
}

/// Response from the oracle's `/verify` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
}

/// Response from the oracle's `/settle` endpoint, tagged by `event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum SettleResponse {
    #[serde(rename = "payment.settled")]
    Settled(SettlementReceipt),
    #[serde(rename = "payment.failed")]
    Failed {
        #[serde(default)]
        error: Option<String>,
    },
}

/// On-chain receipt of a settled payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub transaction_id: String,
    pub from: String,
    pub to: String,
    pub value: String,
    #[serde(deserialize_with = "u64_from_string_or_number")]
    pub block_number: u64,
    #[serde(deserialize_with = "string_from_string_or_number")]
    pub timestamp: String,
}

/// Result of a verify call. Transport failures arrive as `valid == false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub valid: bool,
    pub reason: Option<String>,
}

impl VerifyOutcome {
    pub fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

impl From<VerifyResponse> for VerifyOutcome {
    fn from(resp: VerifyResponse) -> Self {
        if resp.is_valid {
            Self::valid()
        } else {
            Self::invalid(
                resp.invalid_reason
                    .unwrap_or_else(|| "payment invalid".to_string()),
            )
        }
    }
}

/// Result of a settle call.
///
/// `retryable` is false only when the oracle itself answered `payment.failed`.
/// Timeouts, transport errors, non-success statuses and unreadable bodies
/// leave the transfer's fate unknown and are reported as retryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Settled(SettlementReceipt),
    Failed { reason: String, retryable: bool },
}

impl From<SettleResponse> for SettleOutcome {
    fn from(resp: SettleResponse) -> Self {
        match resp {
            SettleResponse::Settled(receipt) => SettleOutcome::Settled(receipt),
            SettleResponse::Failed { error } => SettleOutcome::Failed {
                reason: error.unwrap_or_else(|| "settlement failed".to_string()),
                retryable: false,
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    String(String),
    Number(serde_json::Number),
}

fn u64_from_string_or_number<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        StringOrNumber::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom(format!("block number out of range: {n}"))),
    }
}

fn string_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::String(s) => s,
        StringOrNumber::Number(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settled_event_parses() {
        let body = r#"{
            "event": "payment.settled",
            "transactionId": "0xabc",
            "from": "0x1111111111111111111111111111111111111111",
            "to": "0x2222222222222222222222222222222222222222",
            "value": "50000",
            "blockNumber": 1234,
            "timestamp": "2026-01-01T00:00:00Z"
        }"#;
        let resp: SettleResponse = serde_json::from_str(body).unwrap();
        match SettleOutcome::from(resp) {
            SettleOutcome::Settled(r) => {
                assert_eq!(r.transaction_id, "0xabc");
                assert_eq!(r.block_number, 1234);
                assert_eq!(r.value, "50000");
            }
            other => panic!("expected settled, got {other:?}"),
        }
    }

    #[test]
    fn test_settled_event_accepts_string_block_and_numeric_timestamp() {
        let body = r#"{
            "event": "payment.settled",
            "transactionId": "0xabc",
            "from": "0x1",
            "to": "0x2",
            "value": "1",
            "blockNumber": "77",
            "timestamp": 1767225600
        }"#;
        let resp: SettleResponse = serde_json::from_str(body).unwrap();
        let SettleResponse::Settled(r) = resp else {
            panic!("expected settled");
        };
        assert_eq!(r.block_number, 77);
        assert_eq!(r.timestamp, "1767225600");
    }

    #[test]
    fn test_failed_event_parses() {
        let resp: SettleResponse =
            serde_json::from_str(r#"{"event":"payment.failed","error":"insufficient funds"}"#)
                .unwrap();
        assert_eq!(
            SettleOutcome::from(resp),
            SettleOutcome::Failed {
                reason: "insufficient funds".to_string(),
                retryable: false,
            }
        );
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(serde_json::from_str::<SettleResponse>(r#"{"event":"payment.pending"}"#).is_err());
    }

    #[test]
    fn test_verify_invalid_without_reason() {
        let outcome = VerifyOutcome::from(VerifyResponse {
            is_valid: false,
            invalid_reason: None,
        });
        assert!(!outcome.valid);
        assert_eq!(outcome.reason.as_deref(), Some("payment invalid"));
    }
}
