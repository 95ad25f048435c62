use actix_web::{web, HttpResponse, ResponseError};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;

use crate::broker::Audience;
use crate::catalog::Catalog;
use crate::error::PaymentError;
use crate::state::AppState;

const CONNECTED_FRAME: &[u8] = b": connected\n\n";

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub audience: Option<Audience>,
}

/// GET /resources/{resource_id}/stream - realtime events as SSE
pub async fn stream(
    path: web::Path<String>,
    query: web::Query<StreamQuery>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let resource_id = path.into_inner();
    match state.db.resource(&resource_id) {
        Ok(Some(_)) => {}
        Ok(None) => return PaymentError::UnknownResource(resource_id).error_response(),
        Err(e) => return PaymentError::Store(e).error_response(),
    }

    let audience = query.audience.unwrap_or(Audience::Display);
    let subscription = state.broker.subscribe(&resource_id, audience);
    tracing::info!(
        resource_id = %resource_id,
        audience = audience.as_str(),
        subscriber = subscription.id,
        "stream opened"
    );

    let byte_stream = futures::stream::once(async { Bytes::from_static(CONNECTED_FRAME) })
        .chain(tokio_stream::wrappers::ReceiverStream::new(subscription.rx))
        .map(Ok::<_, actix_web::Error>);

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(byte_stream)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/resources/{resource_id}/stream", web::get().to(stream));
}
