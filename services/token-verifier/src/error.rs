use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use common_auth::AuthError;
use thiserror::Error;

use crate::model::{VerificationResult, VerificationStatus};

/// How long callers are told to wait before retrying a transient failure.
pub const RETRY_AFTER: Duration = Duration::from_secs(1);

/// Why a token did not verify. Every variant maps to exactly one [`ErrorClass`].
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("token rejected: {0}")]
    Rejected(String),
    #[error("token expired")]
    Expired,
    #[error("identity provider unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The caller sent something unusable. Not retryable.
    Client,
    /// The provider looked at the token and said no. Not retryable.
    Rejection,
    /// Infrastructure failure. The caller may retry.
    Transient,
}

impl VerifyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            VerifyError::Malformed(_) => ErrorClass::Client,
            VerifyError::Rejected(_) | VerifyError::Expired => ErrorClass::Rejection,
            VerifyError::Unreachable(_) => ErrorClass::Transient,
        }
    }

    pub fn status(&self) -> VerificationStatus {
        match self {
            VerifyError::Malformed(_) | VerifyError::Rejected(_) => VerificationStatus::Invalid,
            VerifyError::Expired => VerificationStatus::Expired,
            VerifyError::Unreachable(_) => VerificationStatus::ProviderUnreachable,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self.class() {
            ErrorClass::Client => StatusCode::BAD_REQUEST,
            ErrorClass::Rejection => StatusCode::UNAUTHORIZED,
            ErrorClass::Transient => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<AuthError> for VerifyError {
    fn from(error: AuthError) -> Self {
        VerifyError::Malformed(error.to_string())
    }
}

impl From<JsonRejection> for VerifyError {
    fn from(rejection: JsonRejection) -> Self {
        VerifyError::Malformed(rejection.body_text())
    }
}

impl IntoResponse for VerifyError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let mut response = (status, Json(VerificationResult::failed(&self))).into_response();

        if self.class() == ErrorClass::Transient {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(RETRY_AFTER.as_secs()),
            );
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_status() {
        let cases = [
            (
                VerifyError::Malformed("empty".into()),
                StatusCode::BAD_REQUEST,
                VerificationStatus::Invalid,
            ),
            (
                VerifyError::Rejected("bad signature".into()),
                StatusCode::UNAUTHORIZED,
                VerificationStatus::Invalid,
            ),
            (
                VerifyError::Expired,
                StatusCode::UNAUTHORIZED,
                VerificationStatus::Expired,
            ),
            (
                VerifyError::Unreachable("timeout".into()),
                StatusCode::SERVICE_UNAVAILABLE,
                VerificationStatus::ProviderUnreachable,
            ),
        ];

        for (error, http, status) in cases {
            assert_eq!(error.http_status(), http, "{error}");
            assert_eq!(error.status(), status, "{error}");
        }
    }

    #[test]
    fn transient_errors_set_retry_after() {
        let response = VerifyError::Unreachable("timeout".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");

        let response = VerifyError::Expired.into_response();
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn auth_errors_are_client_errors() {
        let error = VerifyError::from(AuthError::EmptyToken);
        assert_eq!(error.class(), ErrorClass::Client);
        assert_eq!(error.to_string(), "malformed request: token must not be empty");
    }
}
