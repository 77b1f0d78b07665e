// Renders the error taxonomy as {error:{code,message}} JSON responses.
// Internal failures are logged with their cause and surfaced as an opaque
// message; stack traces and store errors never reach the client.

use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::gateway::errors::GatewayError;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let message = match &self {
            GatewayError::Store(cause) => {
                error!(error = %cause, "store error while handling request");
                "internal error".to_string()
            }
            GatewayError::Internal(cause) => {
                error!(error = %cause, "internal error while handling request");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[tokio::test]
    async fn internal_errors_do_not_leak_details() {
        let response =
            GatewayError::internal("secret detail about the store layout").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "internal");
        assert_eq!(body["error"]["message"], "internal error");
    }

    #[tokio::test]
    async fn client_errors_carry_their_message() {
        let response = GatewayError::conflict("order is already paid").into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "conflict");
        assert_eq!(body["error"]["message"], "order is already paid");
    }
}
