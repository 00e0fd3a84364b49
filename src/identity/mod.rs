//! Identity Resolver Bridge.
//!
//! Maps the NameID of an accepted Response to a local user, creating the user
//! on first sight.

mod memory;
#[cfg(feature = "database-sqlite")]
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use memory::MemoryUserStore;
use serde::Serialize;
#[cfg(feature = "database-sqlite")]
pub use sqlite::SqliteUserStore;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    config::IdentityConfig,
    saml::{ResolvedIdentity, SamlError},
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("User store unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "database-sqlite")]
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[cfg(feature = "database-sqlite")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A local user keyed by one external attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalUser {
    pub id: Uuid,
    /// Name of the attribute `external_id` is stored under, e.g. `samlId`.
    pub attribute: String,
    pub external_id: String,
    pub email: String,
    pub role_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LocalUser {
    /// The representation handed to the host's session layer.
    ///
    /// ```json
    /// { "id": "...", "email": "alice@example.com", "role_id": null, "samlId": "alice@example.com" }
    /// ```
    pub fn session_object(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        object.insert("id".to_string(), self.id.to_string().into());
        object.insert("email".to_string(), self.email.clone().into());
        object.insert(
            "role_id".to_string(),
            self.role_id
                .clone()
                .map_or(serde_json::Value::Null, serde_json::Value::from),
        );
        object.insert(self.attribute.clone(), self.external_id.clone().into());
        serde_json::Value::Object(object)
    }
}

/// Fields for a user created on first login.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Return the user whose `attribute` equals `value`, creating it from
    /// `new_user` when none exists. Concurrent calls for the same pair must
    /// return the same user.
    async fn find_or_create_by_attribute(
        &self,
        attribute: &str,
        value: &str,
        new_user: NewUser,
    ) -> StoreResult<LocalUser>;
}

/// Open the store described by `config`.
pub async fn connect(config: &IdentityConfig) -> StoreResult<Arc<dyn UserStore>> {
    match config {
        IdentityConfig::Memory => {
            tracing::warn!("Using the in-memory user store; users are lost on restart");
            Ok(Arc::new(MemoryUserStore::new()))
        }
        #[cfg(feature = "database-sqlite")]
        IdentityConfig::Sqlite(cfg) => Ok(Arc::new(SqliteUserStore::connect(cfg).await?)),
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn UserStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    /// Find or create the local user for `identity`, keyed by its NameID
    /// under `attribute`.
    ///
    /// A new user gets the NameID as its email too. Store failures surface as
    /// [`SamlError::Resolution`] and are not retried.
    #[tracing::instrument(skip(self, identity), fields(name_id = %identity.name_id))]
    pub async fn resolve(
        &self,
        attribute: &str,
        identity: &ResolvedIdentity,
    ) -> Result<LocalUser, SamlError> {
        let new_user = NewUser {
            email: identity.name_id.clone(),
        };
        let user = self
            .store
            .find_or_create_by_attribute(attribute, &identity.name_id, new_user)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to resolve SAML identity");
                SamlError::Resolution(e.to_string())
            })?;
        tracing::debug!(user_id = %user.id, "Resolved SAML identity");
        Ok(user)
    }
}
