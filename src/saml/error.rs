use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

/// Errors raised by the SAML core and the identity bridge.
///
/// Every variant except `Configuration` and `Resolution` ends the current
/// login attempt; the user has to start over from the login redirect.
#[derive(Debug, thiserror::Error)]
pub enum SamlError {
    /// Missing or mismatched key material, or a provider that was never loaded.
    #[error("{0}")]
    Configuration(String),

    #[error("Malformed SAML response: {0}")]
    MalformedResponse(String),

    #[error("No IdP certificate is configured to verify SAML responses")]
    NoTrustAnchor,

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Conditions not met: {0}")]
    ConditionsNotMet(String),

    #[error("Cannot decrypt assertion: {0}")]
    CannotDecrypt(String),

    #[error("Assertion does not identify a subject")]
    MissingIdentity,

    /// The IdP answered with a non-Success status code.
    #[error("IdP rejected the authentication request: {0}")]
    IdpStatus(String),

    #[error("Identity resolution failed: {0}")]
    Resolution(String),

    /// Login initiation refused because too many requests are outstanding.
    #[error("{0}")]
    Unavailable(String),
}

impl SamlError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            SamlError::Configuration(_) => "configuration_error",
            SamlError::MalformedResponse(_) => "malformed_response",
            SamlError::NoTrustAnchor => "no_trust_anchor",
            SamlError::InvalidSignature(_) => "invalid_signature",
            SamlError::ConditionsNotMet(_) => "conditions_not_met",
            SamlError::CannotDecrypt(_) => "cannot_decrypt",
            SamlError::MissingIdentity => "missing_identity",
            SamlError::IdpStatus(_) => "idp_status",
            SamlError::Resolution(_) => "resolution_error",
            SamlError::Unavailable(_) => "service_unavailable",
        }
    }

    /// Whether this error rejects a Response (as opposed to a setup or
    /// persistence failure).
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            SamlError::Configuration(_) | SamlError::Resolution(_) | SamlError::Unavailable(_)
        )
    }
}

/// JSON error body: `{"error": {"type": "...", "code": "...", "message": "..."}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn with_type(
        error_type: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error: ErrorInfo {
                error_type: error_type.into(),
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

impl IntoResponse for SamlError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            SamlError::Configuration(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "server_error", msg.clone())
            }
            SamlError::Resolution(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "server_error",
                "User store unavailable".to_string(),
            ),
            SamlError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "server_error", msg.clone())
            }
            // Rejection details stay in the logs.
            _ => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "SAML authentication failed".to_string(),
            ),
        };

        let body = ErrorResponse::with_type(error_type, self.code(), message);
        (status, Json(body)).into_response()
    }
}
