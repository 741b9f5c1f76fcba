//! HTTP mapping of the core error taxonomy.

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use servcur_core::{CoreError, ErrorKind};

/// Result type alias for gateway handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// A core error on its way to the client. Never adds a kind of its own.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub CoreError);

impl ApiError {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RuntimeUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(kind = %self.0.kind(), error = %self.0, "request failed");
        }
        let body = serde_json::json!({
            "kind": self.0.kind(),
            "message": self.0.message(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(CoreError::InvalidRequest(rejection.body_text()))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(CoreError::InvalidRequest(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError(CoreError::InvalidRequest(rejection.body_text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn body_carries_kind_and_message() {
        let response =
            ApiError(CoreError::Conflict("job already active".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["kind"], "conflict");
        assert_eq!(json["message"], "job already active");
    }

    #[test]
    fn every_kind_has_a_status() {
        let cases = [
            (CoreError::NotFound(String::new()), StatusCode::NOT_FOUND),
            (CoreError::Conflict(String::new()), StatusCode::CONFLICT),
            (
                CoreError::RuntimeUnavailable(String::new()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (CoreError::InvalidRequest(String::new()), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status_code(), status);
        }
    }
}
