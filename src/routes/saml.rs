//! SAML routes.
//!
//! - `GET /metadata` - SP metadata for configuring the IdP
//! - `GET /auth/saml/login` - Builds an AuthnRequest and redirects to the IdP
//! - `POST /auth/saml/callback` - Assertion Consumer Service (HTTP-POST binding)
//! - `GET|POST /auth/saml/logout` - Single Logout stub
//! - `GET /auth/providers` - Login button descriptor for the host UI

use std::sync::Arc;

use axum::{
    Form, Json,
    extract::{Query, State},
    response::{IntoResponse, Response},
};
use http::{StatusCode, header};
use serde::{Deserialize, Serialize};

use crate::{AppState, saml::SamlError};

/// Query parameters for the login endpoint.
#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    /// Opaque value the IdP echoes back to the callback.
    #[serde(rename = "RelayState", alias = "relay_state", default)]
    pub relay_state: Option<String>,
}

/// Form data posted by the IdP.
#[derive(Debug, Deserialize)]
pub struct CallbackForm {
    /// Base64-encoded SAML Response.
    #[serde(rename = "SAMLResponse")]
    pub saml_response: String,
    #[serde(rename = "RelayState", default)]
    pub relay_state: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub user: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_state: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub saml: ProviderDescriptor,
}

#[derive(Debug, Serialize)]
pub struct ProviderDescriptor {
    pub label: String,
    pub sets_user_attribute: String,
}

/// Serve the SP metadata document.
///
/// Failures answer 500 with the bare error message as plain text.
#[tracing::instrument(name = "saml.metadata", skip(state))]
pub async fn metadata(State(state): State<AppState>) -> Response {
    match state.provider.metadata() {
        Ok(xml) => ([(header::CONTENT_TYPE, "application/xml")], xml).into_response(),
        Err(e) => {
            tracing::error!("GET /metadata: '{}'", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                e.to_string(),
            )
                .into_response()
        }
    }
}

/// Redirect the browser to the IdP with a fresh AuthnRequest.
#[tracing::instrument(name = "saml.login", skip(state, query))]
pub async fn login(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
) -> Result<Response, SamlError> {
    let relay_state = query.relay_state.unwrap_or_default();
    let (url, request) = state
        .provider
        .login_redirect(&relay_state)
        .inspect_err(|e| tracing::error!(error = %e, "Failed to build SAML AuthnRequest"))?;

    tracing::info!(request_id = %request.request_id, "Redirecting to SAML IdP");

    Ok((
        StatusCode::FOUND,
        [
            (header::LOCATION, url),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
    )
        .into_response())
}

/// Assertion Consumer Service: validate the Response and resolve the user.
#[tracing::instrument(name = "saml.callback", skip(state, form))]
pub async fn callback(
    State(state): State<AppState>,
    Form(form): Form<CallbackForm>,
) -> Result<Json<CallbackResponse>, SamlError> {
    let snapshot = state.provider.snapshot()?;
    let CallbackForm {
        saml_response,
        relay_state,
    } = form;

    // Decoding, canonicalization and RSA work stay off the async workers.
    let provider = Arc::clone(&state.provider);
    let task_snapshot = Arc::clone(&snapshot);
    let identity = tokio::task::spawn_blocking(move || {
        provider.validate_with(&task_snapshot, &saml_response)
    })
    .await
    .map_err(|e| SamlError::Configuration(format!("SAML validation task failed: {e}")))?
    .inspect_err(|e| {
        if !e.is_rejection() {
            tracing::error!(error = %e, "SAML callback failed");
        }
    })?;

    let user = state
        .resolver
        .resolve(&snapshot.config.external_attribute, &identity)
        .await?;

    tracing::info!(
        user_id = %user.id,
        name_id = %identity.name_id,
        issuer = ?identity.issuer,
        "SAML login succeeded"
    );

    Ok(Json(CallbackResponse {
        user: user.session_object(),
        relay_state: relay_state.filter(|r| !r.is_empty()),
    }))
}

/// Single Logout is not supported; the IdP's request is acknowledged and
/// the local session is left to the host.
#[tracing::instrument(name = "saml.logout")]
pub async fn logout() -> StatusCode {
    tracing::debug!("SAML logout requested; nothing to do");
    StatusCode::NO_CONTENT
}

#[tracing::instrument(name = "saml.providers", skip(state))]
pub async fn providers(State(state): State<AppState>) -> Result<Json<ProvidersResponse>, SamlError> {
    let snapshot = state.provider.snapshot()?;
    Ok(Json(ProvidersResponse {
        saml: ProviderDescriptor {
            label: snapshot.config.label.clone(),
            sets_user_attribute: snapshot.config.sets_user_attribute.clone(),
        },
    }))
}
