//! SAML 2.0 Service Provider.
//!
//! [`SamlProvider`] owns the current configuration snapshot (settings plus
//! parsed key material) and the outstanding AuthnRequest IDs. Each request
//! handler takes one snapshot and uses it for the whole request, so a
//! concurrent [`SamlProvider::reload`] never mixes old and new settings.

mod encryption;
mod error;
#[cfg(test)]
pub(crate) mod fixtures;
pub mod keys;
mod metadata;
mod request;
mod request_cache;
mod response;
mod signature;
pub mod xml;

use std::{sync::Arc, time::Duration};

pub use error::{ErrorInfo, ErrorResponse, SamlError};
pub use keys::{FsKeySource, KeyMaterial, KeySource};
pub use metadata::generate_metadata;
use parking_lot::RwLock;
pub use request::{RequestState, build_authn_request, build_redirect};
pub use request_cache::RequestCache;
pub use response::{ResolvedIdentity, ResponseValidator, ValidationStage};

use crate::config::SamlConfig;

pub const ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const METADATA_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const HTTP_POST_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";
pub const HTTP_REDIRECT_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";

/// Settings and key material that are always used together.
#[derive(Debug)]
pub struct SamlSnapshot {
    pub config: SamlConfig,
    pub keys: KeyMaterial,
}

pub struct SamlProvider {
    current: RwLock<Option<Arc<SamlSnapshot>>>,
    requests: RequestCache,
    source: Arc<dyn KeySource>,
}

impl std::fmt::Debug for SamlProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamlProvider")
            .field("initialized", &self.current.read().is_some())
            .field("outstanding_requests", &self.requests.len())
            .finish()
    }
}

impl SamlProvider {
    /// An uninitialized provider; every operation fails until
    /// [`reload`](Self::reload) succeeds.
    pub fn new(source: Arc<dyn KeySource>) -> Self {
        Self {
            current: RwLock::new(None),
            requests: RequestCache::new(),
            source,
        }
    }

    /// Load `config` from the filesystem.
    pub fn from_config(config: SamlConfig) -> Result<Self, SamlError> {
        let provider = Self::new(Arc::new(FsKeySource));
        provider.reload(config)?;
        Ok(provider)
    }

    /// Load key material for `config` and swap it in.
    ///
    /// On error the previous snapshot stays active.
    pub fn reload(&self, config: SamlConfig) -> Result<(), SamlError> {
        let keys = KeyMaterial::load(&config, self.source.as_ref())?;
        tracing::info!(
            issuer = %config.issuer,
            entry_point = %config.entry_point,
            trust_anchor = keys.idp_cert.is_some(),
            signing = keys.signing.is_some(),
            decryption = keys.decryption.is_some(),
            "SAML provider configured"
        );
        *self.current.write() = Some(Arc::new(SamlSnapshot { config, keys }));
        Ok(())
    }

    pub fn snapshot(&self) -> Result<Arc<SamlSnapshot>, SamlError> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| SamlError::Configuration("SAML provider not initialized".to_string()))
    }

    pub fn metadata(&self) -> Result<String, SamlError> {
        let snapshot = self.snapshot()?;
        generate_metadata(&snapshot.config, &snapshot.keys)
    }

    /// Build the IdP redirect URL, remembering the request ID when
    /// `InResponseTo` validation is enabled.
    pub fn login_redirect(&self, relay_state: &str) -> Result<(String, RequestState), SamlError> {
        let snapshot = self.snapshot()?;
        let (url, state) = build_redirect(&snapshot.config, &snapshot.keys, relay_state)?;
        if snapshot.config.validate_in_response_to
            && !self.requests.insert(
                state.request_id.clone(),
                Duration::from_secs(snapshot.config.request_id_expiration_secs),
                snapshot.config.max_outstanding_requests,
            )
        {
            tracing::warn!(
                outstanding = self.requests.len(),
                capacity = snapshot.config.max_outstanding_requests,
                "Request ID cache full, refusing login"
            );
            return Err(SamlError::Unavailable(
                "Too many outstanding login requests".to_string(),
            ));
        }
        Ok((url, state))
    }

    /// Validate a posted `SAMLResponse`.
    pub fn validate(&self, encoded: &str) -> Result<ResolvedIdentity, SamlError> {
        self.validate_with(&*self.snapshot()?, encoded)
    }

    /// Validate against a snapshot the caller already holds.
    pub fn validate_with(
        &self,
        snapshot: &SamlSnapshot,
        encoded: &str,
    ) -> Result<ResolvedIdentity, SamlError> {
        let validator = ResponseValidator::new(&snapshot.config, &snapshot.keys);
        if snapshot.config.validate_in_response_to {
            validator.with_request_cache(&self.requests).validate(encoded)
        } else {
            validator.validate(encoded)
        }
    }

    pub fn request_cache(&self) -> &RequestCache {
        &self.requests
    }
}
