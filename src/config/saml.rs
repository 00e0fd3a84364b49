use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// SAML Service Provider configuration.
///
/// URL and issuer fields default to empty strings: an AuthnRequest is still
/// built with them, and a conformant IdP rejects it. Key locations are file
/// paths; relative paths resolve against `certs_dir` when it is set.
///
/// camelCase option names (`callbackUrl`, `entryPoint`, ...) are accepted as aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamlConfig {
    /// Button label shown by the host login page.
    #[serde(default = "default_label")]
    pub label: String,

    /// Assertion Consumer Service URL the IdP posts the Response to.
    #[serde(default, alias = "callbackUrl")]
    pub callback_url: String,

    /// IdP Single Sign-On URL (HTTP-Redirect binding).
    #[serde(default, alias = "entryPoint")]
    pub entry_point: String,

    /// SP entity ID sent as the AuthnRequest Issuer and published as `entityID`.
    #[serde(default)]
    pub issuer: String,

    /// Expected assertion audience.
    ///
    /// A string sets it; absent or empty falls back to `issuer`; `false`
    /// disables the audience check.
    #[serde(default)]
    pub audience: Option<AudienceSetting>,

    /// IdP signing certificate, the only trust anchor for Responses.
    #[serde(default)]
    pub cert: Option<String>,

    /// SP private key for signing AuthnRequests (and metadata).
    #[serde(default, alias = "privateKey")]
    pub private_key: Option<String>,

    /// Certificate matching `private_key`, published in metadata.
    #[serde(default, alias = "signingCert")]
    pub signing_cert: Option<String>,

    /// SP private key for decrypting encrypted assertions.
    #[serde(default, alias = "decryptionPvk")]
    pub decryption_pvk: Option<String>,

    /// Certificate matching `decryption_pvk`, published in metadata.
    #[serde(default, alias = "decryptionCert")]
    pub decryption_cert: Option<String>,

    /// Folder that relative key and certificate paths resolve against.
    #[serde(default, alias = "certsDir")]
    pub certs_dir: Option<PathBuf>,

    /// NameID format requested and published.
    #[serde(default = "default_identifier_format", alias = "identifierFormat")]
    pub identifier_format: String,

    /// Digest used when signing requests and metadata.
    #[serde(default, alias = "signatureAlgorithm")]
    pub signature_algorithm: SignatureAlgorithm,

    /// Optional `RequestedAuthnContext` class reference (exact comparison).
    #[serde(default, alias = "authnContext")]
    pub authn_context: Option<String>,

    /// Clock skew tolerated on NotBefore/NotOnOrAfter checks.
    #[serde(default = "default_clock_skew_secs")]
    pub accepted_clock_skew_secs: u64,

    /// Expected assertion Issuer; unchecked when unset.
    #[serde(default, alias = "idpIssuer")]
    pub idp_issuer: Option<String>,

    /// Require the Assertion itself to be signed, not just the Response.
    #[serde(default, alias = "wantAssertionsSigned")]
    pub want_assertions_signed: bool,

    /// Sign the published metadata when a signing key is configured.
    #[serde(default)]
    pub sign_metadata: bool,

    /// Require `InResponseTo` to name a request this SP issued.
    #[serde(default, alias = "validateInResponseTo")]
    pub validate_in_response_to: bool,

    /// How long issued request IDs remain acceptable.
    #[serde(default = "default_request_id_expiration_secs")]
    pub request_id_expiration_secs: u64,

    /// Outstanding request IDs kept at once; logins beyond it get a 503.
    #[serde(default = "default_max_outstanding_requests")]
    pub max_outstanding_requests: usize,

    /// User attribute the NameID is stored under.
    #[serde(default = "default_external_attribute")]
    pub external_attribute: String,

    /// User attribute name the host associates with this provider.
    #[serde(default = "default_sets_user_attribute")]
    pub sets_user_attribute: String,
}

impl Default for SamlConfig {
    fn default() -> Self {
        Self {
            label: default_label(),
            callback_url: String::new(),
            entry_point: String::new(),
            issuer: String::new(),
            audience: None,
            cert: None,
            private_key: None,
            signing_cert: None,
            decryption_pvk: None,
            decryption_cert: None,
            certs_dir: None,
            identifier_format: default_identifier_format(),
            signature_algorithm: SignatureAlgorithm::default(),
            authn_context: None,
            accepted_clock_skew_secs: default_clock_skew_secs(),
            idp_issuer: None,
            want_assertions_signed: false,
            sign_metadata: false,
            validate_in_response_to: false,
            request_id_expiration_secs: default_request_id_expiration_secs(),
            max_outstanding_requests: default_max_outstanding_requests(),
            external_attribute: default_external_attribute(),
            sets_user_attribute: default_sets_user_attribute(),
        }
    }
}

impl SamlConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.accepted_clock_skew_secs > 3600 {
            return Err(ConfigError::Validation(
                "saml.accepted_clock_skew_secs must be at most 3600".to_string(),
            ));
        }
        if self.validate_in_response_to && self.request_id_expiration_secs == 0 {
            return Err(ConfigError::Validation(
                "saml.request_id_expiration_secs must be > 0 when validate_in_response_to is set"
                    .to_string(),
            ));
        }
        if self.request_id_expiration_secs > MAX_REQUEST_ID_EXPIRATION_SECS {
            return Err(ConfigError::Validation(format!(
                "saml.request_id_expiration_secs must be at most {MAX_REQUEST_ID_EXPIRATION_SECS}"
            )));
        }
        if self.validate_in_response_to && self.max_outstanding_requests == 0 {
            return Err(ConfigError::Validation(
                "saml.max_outstanding_requests must be > 0 when validate_in_response_to is set"
                    .to_string(),
            ));
        }
        if self.external_attribute.trim().is_empty() {
            return Err(ConfigError::Validation(
                "saml.external_attribute cannot be empty".to_string(),
            ));
        }
        if let Some(dir) = &self.certs_dir
            && dir.as_os_str().is_empty()
        {
            return Err(ConfigError::Validation(
                "saml.certs_dir cannot be empty when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Audience the Response must be restricted to, or `None` when the check
    /// is disabled.
    pub fn expected_audience(&self) -> Option<&str> {
        match &self.audience {
            Some(AudienceSetting::Flag(false)) => None,
            Some(AudienceSetting::Value(value)) if !value.is_empty() => Some(value.as_str()),
            _ => Some(self.issuer.as_str()),
        }
    }

    /// Audience explicitly configured as a string, if any.
    pub fn explicit_audience(&self) -> Option<&str> {
        match &self.audience {
            Some(AudienceSetting::Value(value)) if !value.is_empty() => Some(value.as_str()),
            _ => None,
        }
    }

    /// Resolve a configured key location to a filesystem path.
    pub fn resolve_path(&self, location: &str) -> PathBuf {
        let path = Path::new(location);
        match &self.certs_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// `audience = "urn:sp"` or `audience = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AudienceSetting {
    Flag(bool),
    Value(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    Sha1,
    #[default]
    Sha256,
    Sha512,
}

fn default_label() -> String {
    "SAML".to_string()
}

fn default_identifier_format() -> String {
    "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress".to_string()
}

fn default_clock_skew_secs() -> u64 {
    60
}

fn default_request_id_expiration_secs() -> u64 {
    8 * 60 * 60
}

/// One week.
const MAX_REQUEST_ID_EXPIRATION_SECS: u64 = 7 * 24 * 60 * 60;

fn default_max_outstanding_requests() -> usize {
    10_000
}

fn default_external_attribute() -> String {
    "samlId".to_string()
}

fn default_sets_user_attribute() -> String {
    "saml2Id".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> SamlConfig {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse("");
        assert_eq!(config.label, "SAML");
        assert_eq!(config.callback_url, "");
        assert_eq!(config.accepted_clock_skew_secs, 60);
        assert_eq!(config.signature_algorithm, SignatureAlgorithm::Sha256);
        assert_eq!(config.external_attribute, "samlId");
        assert_eq!(config.sets_user_attribute, "saml2Id");
    }

    #[test]
    fn test_camel_case_aliases() {
        let config = parse(
            r#"
            callbackUrl = "https://host/cb"
            entryPoint = "https://idp/sso"
            issuer = "sp1"
            decryptionPvk = "sp.key"
            decryptionCert = "sp.crt"
            "#,
        );
        assert_eq!(config.callback_url, "https://host/cb");
        assert_eq!(config.entry_point, "https://idp/sso");
        assert_eq!(config.decryption_pvk.as_deref(), Some("sp.key"));
        assert_eq!(config.decryption_cert.as_deref(), Some("sp.crt"));
    }

    #[test]
    fn test_audience_defaults_to_issuer() {
        let config = parse(r#"issuer = "sp1""#);
        assert_eq!(config.expected_audience(), Some("sp1"));
        assert_eq!(config.explicit_audience(), None);

        let config = parse("issuer = \"sp1\"\naudience = \"\"");
        assert_eq!(config.expected_audience(), Some("sp1"));

        let config = parse("issuer = \"sp1\"\naudience = true");
        assert_eq!(config.expected_audience(), Some("sp1"));
    }

    #[test]
    fn test_audience_explicit_and_disabled() {
        let config = parse("issuer = \"sp1\"\naudience = \"urn:sp\"");
        assert_eq!(config.expected_audience(), Some("urn:sp"));
        assert_eq!(config.explicit_audience(), Some("urn:sp"));

        let config = parse("issuer = \"sp1\"\naudience = false");
        assert_eq!(config.expected_audience(), None);
    }

    #[test]
    fn test_resolve_path_uses_certs_dir_for_relative_paths() {
        let config = parse(r#"certs_dir = "/srv/certs""#);
        assert_eq!(config.resolve_path("idp.pem"), PathBuf::from("/srv/certs/idp.pem"));
        assert_eq!(config.resolve_path("/etc/idp.pem"), PathBuf::from("/etc/idp.pem"));

        let config = parse("");
        assert_eq!(config.resolve_path("idp.pem"), PathBuf::from("idp.pem"));
    }

    #[test]
    fn test_validate_rejects_large_skew() {
        let config = parse("accepted_clock_skew_secs = 7200");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_request_id_expiration() {
        let config = parse("request_id_expiration_secs = 9223372036854775807");
        assert!(config.validate().is_err());

        let config = parse("request_id_expiration_secs = 604800");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_request_capacity() {
        let config = parse("validate_in_response_to = true\nmax_outstanding_requests = 0");
        assert!(config.validate().is_err());

        let config = parse("validate_in_response_to = true");
        assert_eq!(config.max_outstanding_requests, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<SamlConfig, _> = toml::from_str("unknown = 1");
        assert!(result.is_err());
    }
}
