use std::time::Duration;

use alloy::primitives::Address;
use mockito::Matcher;
use x402::{build_challenge, Oracle, OracleClient, PaymentRequirements, SettleOutcome};

const HEADER: &str = "eyJwcm90b2NvbFZlcnNpb24iOjF9";

fn requirements() -> PaymentRequirements {
    build_challenge(
        "base-sepolia",
        Address::repeat_byte(0x22),
        None,
        "50000",
        "Sticker",
    )
    .unwrap()
}

#[tokio::test]
async fn test_verify_valid() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/verify")
        .match_header("x-protocol-version", "1")
        .match_header("content-type", "application/json")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "protocolVersion": 1,
            "paymentHeader": HEADER,
            "paymentRequirements": { "maxAmountRequired": "50000", "scheme": "exact" }
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"isValid":true}"#)
        .create_async()
        .await;

    let client = OracleClient::new(reqwest::Client::new(), &server.url());
    let outcome = client.verify(HEADER, &requirements()).await;

    assert!(outcome.valid);
    assert!(outcome.reason.is_none());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_verify_invalid_passes_reason_through() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/verify")
        .with_status(200)
        .with_body(r#"{"isValid":false,"invalidReason":"Authorization expired"}"#)
        .create_async()
        .await;

    let client = OracleClient::new(reqwest::Client::new(), &server.url());
    let outcome = client.verify(HEADER, &requirements()).await;

    assert!(!outcome.valid);
    assert_eq!(outcome.reason.as_deref(), Some("Authorization expired"));
}

#[tokio::test]
async fn test_verify_server_error_becomes_invalid() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/verify")
        .with_status(503)
        .with_body("upstream down")
        .create_async()
        .await;

    let client = OracleClient::new(reqwest::Client::new(), &server.url());
    let outcome = client.verify(HEADER, &requirements()).await;

    assert!(!outcome.valid);
    assert_eq!(outcome.reason.as_deref(), Some("oracle returned 503"));
}

#[tokio::test]
async fn test_verify_rate_limited() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/verify")
        .with_status(429)
        .create_async()
        .await;

    let client = OracleClient::new(reqwest::Client::new(), &server.url());
    let outcome = client.verify(HEADER, &requirements()).await;

    assert!(!outcome.valid);
    assert_eq!(outcome.reason.as_deref(), Some("oracle rate limited"));
}

#[tokio::test]
async fn test_verify_unreachable_oracle() {
    let client = OracleClient::new(reqwest::Client::new(), "http://127.0.0.1:1");
    let outcome = client.verify(HEADER, &requirements()).await;

    assert!(!outcome.valid);
    assert!(outcome.reason.unwrap().starts_with("oracle unreachable"));
}

#[tokio::test]
async fn test_settle_success() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/settle")
        .match_header("x-protocol-version", "1")
        .with_status(200)
        .with_body(
            r#"{
                "event": "payment.settled",
                "transactionId": "0xfeed",
                "from": "0x1111111111111111111111111111111111111111",
                "to": "0x2222222222222222222222222222222222222222",
                "value": "50000",
                "blockNumber": 42,
                "timestamp": "2026-10-17T12:00:00Z"
            }"#,
        )
        .create_async()
        .await;

    let client = OracleClient::new(reqwest::Client::new(), &server.url());
    match client.settle(HEADER, &requirements()).await {
        SettleOutcome::Settled(receipt) => {
            assert_eq!(receipt.transaction_id, "0xfeed");
            assert_eq!(receipt.value, "50000");
            assert_eq!(receipt.block_number, 42);
            assert_eq!(receipt.timestamp, "2026-10-17T12:00:00Z");
        }
        other => panic!("expected settled, got {other:?}"),
    }
}

#[tokio::test]
async fn test_settle_failed_event() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/settle")
        .with_status(200)
        .with_body(r#"{"event":"payment.failed","error":"nonce already used"}"#)
        .create_async()
        .await;

    let client = OracleClient::new(reqwest::Client::new(), &server.url());
    assert_eq!(
        client.settle(HEADER, &requirements()).await,
        SettleOutcome::Failed {
            reason: "nonce already used".to_string(),
            retryable: false,
        }
    );
}

#[tokio::test]
async fn test_settle_garbage_body_is_failure() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/settle")
        .with_status(200)
        .with_body("<html>oops</html>")
        .create_async()
        .await;

    let client = OracleClient::new(reqwest::Client::new(), &server.url());
    match client.settle(HEADER, &requirements()).await {
        SettleOutcome::Failed { reason, retryable } => {
            assert!(reason.starts_with("invalid oracle response"));
            assert!(retryable);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_settle_is_attempted_once() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/settle")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;

    let client = OracleClient::new(reqwest::Client::new(), &server.url());
    let outcome = client.settle(HEADER, &requirements()).await;

    assert!(matches!(
        outcome,
        SettleOutcome::Failed {
            retryable: true,
            ..
        }
    ));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_settle_timeout_is_failure() {
    // Accept the connection but never answer.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = OracleClient::new(reqwest::Client::new(), &format!("http://{addr}"))
        .with_timeouts(Duration::from_millis(200), Duration::from_millis(200));
    assert_eq!(
        client.settle(HEADER, &requirements()).await,
        SettleOutcome::Failed {
            reason: "oracle timed out".to_string(),
            retryable: true,
        }
    );
}

#[tokio::test]
async fn test_requests_are_signed_when_secret_configured() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/verify")
        .match_header("x-oracle-auth", Matcher::Regex("^[0-9a-f]{64}$".to_string()))
        .with_status(200)
        .with_body(r#"{"isValid":true}"#)
        .create_async()
        .await;

    let client = OracleClient::new(reqwest::Client::new(), &format!("{}/", server.url()))
        .with_hmac_secret(Some(b"shared-secret".to_vec()));
    assert!(client.verify(HEADER, &requirements()).await.valid);
    mock.assert_async().await;
}
