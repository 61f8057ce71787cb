use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

/// Error type for API handlers. Internal causes are logged server-side and
/// never leak into the response body.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    HashMismatch {
        server_hash: String,
        client_hash: String,
    },
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::NotFound(msg) => {
                tracing::warn!(target: "api::error", status = 404, error = %msg, "Not found");
                (StatusCode::NOT_FOUND, json!({ "error": msg }))
            }
            AppError::BadRequest(msg) => {
                tracing::warn!(target: "api::error", status = 400, error = %msg, "Bad request");
                (StatusCode::BAD_REQUEST, json!({ "error": msg }))
            }
            AppError::Conflict(msg) => {
                tracing::warn!(target: "api::error", status = 409, error = %msg, "Conflict");
                (StatusCode::CONFLICT, json!({ "error": msg }))
            }
            AppError::HashMismatch {
                server_hash,
                client_hash,
            } => {
                tracing::warn!(
                    target: "api::error",
                    status = 400,
                    server_hash = %server_hash,
                    client_hash = %client_hash,
                    "Hash mismatch"
                );
                (
                    StatusCode::BAD_REQUEST,
                    json!({
                        "error": "Hash mismatch",
                        "serverHash": server_hash,
                        "clientHash": client_hash,
                    }),
                )
            }
            AppError::Internal(err) => {
                tracing::error!(target: "api::error", status = 500, error = ?err, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
