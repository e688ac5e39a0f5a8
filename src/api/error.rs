//! REST error mapping: spec error kinds to status codes, with safe messages.

use crate::error::{Error, ErrorKind};

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Wrapper giving crate errors an HTTP rendering. User-visible bodies carry
/// only an error code and a safe message.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let (status, code) = match kind {
            ErrorKind::Validation => (StatusCode::BAD_REQUEST, "validation_error"),
            ErrorKind::Auth => (StatusCode::UNAUTHORIZED, "auth_error"),
            ErrorKind::Authz => (StatusCode::FORBIDDEN, "authz_error"),
            ErrorKind::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorKind::DependencyUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "dependency_unavailable")
            }
            ErrorKind::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        if kind == ErrorKind::Internal {
            tracing::error!(error = %self.0, "internal error on REST surface");
        }

        let message = match kind {
            // Internal faults keep their context out of responses.
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.0.to_string(),
        };

        (
            status,
            Json(serde_json::json!({
                "success": false,
                "error": code,
                "message": message,
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RouterError;

    #[test]
    fn kinds_map_to_expected_statuses() {
        let cases: Vec<(Error, StatusCode)> = vec![
            (
                RouterError::Validation("bad".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                RouterError::RateLimited { key: "k".into() }.into(),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                crate::error::AuthError::InvalidServiceKey.into(),
                StatusCode::UNAUTHORIZED,
            ),
            (
                RouterError::EntityNotRouted("e".into()).into(),
                StatusCode::NOT_FOUND,
            ),
            (
                RouterError::DispatchTimeout {
                    target: "t".into(),
                    timeout_ms: 1,
                }
                .into(),
                StatusCode::GATEWAY_TIMEOUT,
            ),
        ];

        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
