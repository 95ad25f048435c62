use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use serde::Deserialize;
use serde_json::json;

use crate::error::PaymentError;
use crate::metrics::REQUESTS_TOTAL;
use crate::orchestrator::{PaidAction, PaidRequest, SettlementOrchestrator, SettlementOutcome};
use crate::state::AppState;

const MAX_QUESTION_CHARS: usize = 500;
const MAX_MESSAGE_CHARS: usize = 280;

#[derive(Debug, Deserialize)]
pub struct QuestionBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct DonationBody {
    pub amount: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Read the raw `X-PAYMENT` header.
fn payment_header(req: &HttpRequest) -> Result<Option<String>, PaymentError> {
    match req.headers().get(x402::PAYMENT_HEADER) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|s| Some(s.to_string()))
            .map_err(|_| PaymentError::InvalidPaymentHeader("header is not valid ASCII".to_string())),
    }
}

/// Run a request through its orchestrator and render the HTTP response.
async fn run_paid(
    orchestrator: &SettlementOrchestrator,
    req: &HttpRequest,
    resource_id: String,
    action: PaidAction,
) -> HttpResponse {
    let kind = orchestrator.kind();
    let result = match payment_header(req) {
        Ok(payment_header) => {
            orchestrator
                .handle(PaidRequest {
                    resource_id,
                    action,
                    payment_header,
                })
                .await
        }
        Err(e) => Err(e),
    };

    let response = match result {
        Ok(SettlementOutcome::ChallengeIssued(body)) => HttpResponse::PaymentRequired().json(body),
        Ok(SettlementOutcome::Settled {
            payment_id,
            receipt,
            cached,
            ..
        }) => HttpResponse::Ok().json(json!({
            "success": true,
            "cached": cached,
            "action": kind.as_str(),
            "payment": {
                "paymentId": payment_id,
                "transactionId": receipt.transaction_id,
                "from": receipt.from,
                "to": receipt.to,
                "value": receipt.value,
                "blockNumber": receipt.block_number,
                "timestamp": receipt.timestamp,
            },
        })),
        Err(e) => {
            if e.status_code().is_server_error() {
                tracing::error!(action = kind.as_str(), error = %e, "paid request failed");
            } else {
                tracing::debug!(action = kind.as_str(), error = %e, "paid request rejected");
            }
            e.error_response()
        }
    };

    REQUESTS_TOTAL
        .with_label_values(&[kind.as_str(), response.status().as_str()])
        .inc();
    response
}

fn invalid_request(reason: &str) -> HttpResponse {
    PaymentError::InvalidRequest(reason.to_string()).error_response()
}

/// POST /resources/{resource_id}/effects/{effect_key}
pub async fn trigger_effect(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let (resource_id, effect_key) = path.into_inner();
    run_paid(
        &state.effects,
        &req,
        resource_id,
        PaidAction::Effect { effect_key },
    )
    .await
}

/// POST /resources/{resource_id}/questions
pub async fn submit_question(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<QuestionBody>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let text = body.into_inner().text.trim().to_string();
    if text.is_empty() {
        return invalid_request("question text is empty");
    }
    if text.chars().count() > MAX_QUESTION_CHARS {
        return invalid_request("question text is too long");
    }
    run_paid(
        &state.questions,
        &req,
        path.into_inner(),
        PaidAction::Question { text },
    )
    .await
}

/// POST /resources/{resource_id}/donations
pub async fn donate(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Json<DonationBody>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let DonationBody { amount, message } = body.into_inner();
    let amount = match x402::requirements::normalize_amount(&amount) {
        Ok(a) if a == "0" => {
            return PaymentError::InvalidAmount("donation must be positive".to_string())
                .error_response()
        }
        Ok(a) => a,
        Err(e) => return PaymentError::from(e).error_response(),
    };
    let message = message
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());
    if message
        .as_ref()
        .is_some_and(|m| m.chars().count() > MAX_MESSAGE_CHARS)
    {
        return invalid_request("donation message is too long");
    }
    run_paid(
        &state.donations,
        &req,
        path.into_inner(),
        PaidAction::Donation { amount, message },
    )
    .await
}

/// POST /resources/{resource_id}/memberships/{tier}
pub async fn join_membership(
    req: HttpRequest,
    path: web::Path<(String, String)>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let (resource_id, tier) = path.into_inner();
    run_paid(
        &state.memberships,
        &req,
        resource_id,
        PaidAction::Membership { tier },
    )
    .await
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route(
        "/resources/{resource_id}/effects/{effect_key}",
        web::post().to(trigger_effect),
    )
    .route(
        "/resources/{resource_id}/questions",
        web::post().to(submit_question),
    )
    .route("/resources/{resource_id}/donations", web::post().to(donate))
    .route(
        "/resources/{resource_id}/memberships/{tier}",
        web::post().to(join_membership),
    );
}
