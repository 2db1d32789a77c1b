use axum::{Extension, Json, http::StatusCode};
use std::sync::Arc;

use super::Endpoint;
use super::protocol::{Request, RpcEnvelope, RpcReply};

pub async fn handle_rpc(
    Extension(endpoint): Extension<Arc<dyn Endpoint>>,
    Json(envelope): Json<RpcEnvelope>,
) -> (StatusCode, Json<RpcReply>) {
    tracing::debug!("Received {} from {}", envelope.payload, envelope.source);

    match envelope.payload.parse::<Request>() {
        Ok(request) => {
            let body = endpoint.handle_request(envelope.source, request).await;
            (StatusCode::OK, Json(RpcReply { body }))
        }
        Err(e) => {
            tracing::error!(
                "Invalid request {:?} from {}: {}",
                envelope.payload,
                envelope.source,
                e
            );
            (
                StatusCode::BAD_REQUEST,
                Json(RpcReply {
                    body: format!("Error: Invalid request {}!", envelope.payload),
                }),
            )
        }
    }
}
