//! HTTP-facing error type for the REST surface, grounded on the workspace's
//! layered-error convention: a thin `thiserror` enum converting from the
//! lower crates' errors, rendered to a JSON body via `IntoResponse`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use opsync_sync_server::ServerError;
use serde::Serialize;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Server(#[from] ServerError),
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
    message: String,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Server(ServerError::InvalidUserId(_)) => StatusCode::BAD_REQUEST,
            ApiError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "Unauthorized",
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Server(_) => "InternalServerError",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorResponse {
            error: self.label(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}
