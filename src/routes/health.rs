//! Health check endpoint for load balancers and monitoring.

use axum::{Json, extract::State, response::IntoResponse};
use http::StatusCode;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// "healthy" or "unhealthy"
    pub status: String,
    pub version: String,
    pub saml: SamlStatus,
}

#[derive(Debug, Serialize)]
pub struct SamlStatus {
    /// A configuration snapshot is loaded.
    pub initialized: bool,
    /// An IdP certificate is available to verify Responses.
    pub trust_anchor: bool,
    pub signing_key: bool,
    pub decryption_key: bool,
    /// AuthnRequest IDs awaiting a Response.
    pub outstanding_requests: usize,
}

/// Report whether the SP can accept logins.
///
/// Returns 503 until a snapshot with an IdP certificate is loaded, since
/// every Response would be rejected before then.
#[tracing::instrument(name = "health.check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.provider.snapshot().ok();
    let keys = snapshot.as_ref().map(|s| &s.keys);

    let saml = SamlStatus {
        initialized: snapshot.is_some(),
        trust_anchor: keys.is_some_and(|k| k.idp_cert.is_some()),
        signing_key: keys.is_some_and(|k| k.signing.is_some()),
        decryption_key: keys.is_some_and(|k| k.decryption.is_some()),
        outstanding_requests: state.provider.request_cache().len(),
    };

    let healthy = saml.initialized && saml.trust_anchor;
    let health = HealthStatus {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        saml,
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::{
        config::SamlConfig,
        routes::testing::{app, get, saml_config, send},
    };

    #[tokio::test]
    async fn test_health_check_healthy() {
        let app = app(saml_config());
        let (status, _, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);

        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["saml"]["trust_anchor"], true);
        assert_eq!(body["saml"]["signing_key"], false);
        assert!(body["version"].as_str().unwrap().contains('.'));
    }

    #[tokio::test]
    async fn test_health_check_without_trust_anchor() {
        let app = app(SamlConfig {
            cert: None,
            ..saml_config()
        });
        let (status, _, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["saml"]["initialized"], true);
        assert_eq!(body["saml"]["trust_anchor"], false);
    }
}
