//! SAML 2.0 Service Provider adapter.
//!
//! Delegates user login to an external Identity Provider: builds
//! AuthnRequests, validates the IdP's Responses, publishes SP metadata and
//! maps the asserted NameID to a local user.

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    routing::{get, post},
};
use tokio_util::task::TaskTracker;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};

pub mod config;
pub mod identity;
pub mod jobs;
#[cfg(feature = "server")]
pub mod observability;
pub mod routes;
pub mod saml;

use config::AppConfig;
use identity::{IdentityResolver, StoreError, UserStore};
use saml::{SamlError, SamlProvider};

/// Errors that stop the service from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("SAML configuration error: {0}")]
    Saml(#[from] SamlError),

    #[error("User store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub provider: Arc<SamlProvider>,
    pub resolver: IdentityResolver,
    /// Background tasks; waited on during graceful shutdown.
    pub task_tracker: TaskTracker,
}

impl AppState {
    /// Load key material and open the user store.
    pub async fn new(config: AppConfig) -> Result<Self, StartupError> {
        let provider = SamlProvider::from_config(config.saml.clone())?;
        let store = identity::connect(&config.identity).await?;
        Ok(Self::with_parts(config, provider, store))
    }

    pub fn with_parts(
        config: AppConfig,
        provider: SamlProvider,
        store: Arc<dyn UserStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            provider: Arc::new(provider),
            resolver: IdentityResolver::new(store),
            task_tracker: TaskTracker::new(),
        }
    }
}

pub fn build_app(config: &AppConfig, state: AppState) -> Router {
    Router::new()
        .route("/metadata", get(routes::saml::metadata))
        .route("/auth/saml/login", get(routes::saml::login))
        .route("/auth/saml/callback", post(routes::saml::callback))
        .route(
            "/auth/saml/logout",
            get(routes::saml::logout).post(routes::saml::logout),
        )
        .route("/auth/providers", get(routes::saml::providers))
        .route("/health", get(routes::health::health_check))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.server.timeout_secs,
        )))
        .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
        .with_state(state)
}
