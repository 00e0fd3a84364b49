//! Key material loading.
//!
//! Certificates and keys are read as latin1 text, normalised (BOM, CRLF,
//! missing PEM armour) and parsed once per configuration snapshot.

use std::{fmt, io, path::Path};

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};

use super::SamlError;
use crate::config::SamlConfig;

/// Path to bytes. The filesystem in production; tests substitute their own.
pub trait KeySource: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsKeySource;

impl KeySource for FsKeySource {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

/// A private key with the certificate that carries its public half.
pub struct KeyPair {
    pub key: PKey<Private>,
    pub cert: X509,
}

impl KeyPair {
    /// Base64 DER of the certificate, as embedded in `ds:X509Certificate`.
    pub fn cert_base64(&self) -> Result<String, SamlError> {
        let der = self
            .cert
            .to_der()
            .map_err(|e| SamlError::Configuration(format!("Failed to encode certificate: {e}")))?;
        Ok(STANDARD.encode(der))
    }
}

/// Parsed key material for one configuration.
#[derive(Default)]
pub struct KeyMaterial {
    /// The IdP certificate, sole trust anchor for Responses.
    pub idp_cert: Option<X509>,
    pub signing: Option<KeyPair>,
    pub decryption: Option<KeyPair>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("idp_cert", &self.idp_cert.is_some())
            .field("signing", &self.signing.is_some())
            .field("decryption", &self.decryption.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Signing,
    Decryption,
}

impl Role {
    fn key_option(self) -> &'static str {
        match self {
            Role::Signing => "private_key",
            Role::Decryption => "decryption_pvk",
        }
    }

    fn cert_option(self) -> &'static str {
        match self {
            Role::Signing => "signing_cert",
            Role::Decryption => "decryption_cert",
        }
    }
}

impl KeyMaterial {
    /// Load every configured slot.
    ///
    /// An unreadable IdP certificate leaves the trust anchor absent, so
    /// Responses fail closed later. Signing and decryption keys are all or
    /// nothing: a key that cannot be read, a key without its certificate, or a
    /// certificate that does not match its key is a configuration error.
    pub fn load(config: &SamlConfig, source: &dyn KeySource) -> Result<Self, SamlError> {
        let idp_cert = match config.cert.as_deref().filter(|c| !c.is_empty()) {
            Some(location) => match read_pem(config, source, location, "CERTIFICATE") {
                Ok(pem) => Some(parse_cert(&pem, "cert")?),
                Err(e) => {
                    tracing::warn!(
                        path = %config.resolve_path(location).display(),
                        error = %e,
                        "IdP certificate unreadable; SAML responses will be rejected"
                    );
                    None
                }
            },
            None => None,
        };

        let signing = load_pair(
            config,
            source,
            Role::Signing,
            config.private_key.as_deref(),
            config.signing_cert.as_deref(),
        )?;
        let decryption = load_pair(
            config,
            source,
            Role::Decryption,
            config.decryption_pvk.as_deref(),
            config.decryption_cert.as_deref(),
        )?;

        Ok(Self {
            idp_cert,
            signing,
            decryption,
        })
    }
}

fn load_pair(
    config: &SamlConfig,
    source: &dyn KeySource,
    role: Role,
    key_location: Option<&str>,
    cert_location: Option<&str>,
) -> Result<Option<KeyPair>, SamlError> {
    let key_location = key_location.filter(|l| !l.is_empty());
    let cert_location = cert_location.filter(|l| !l.is_empty());

    match (key_location, cert_location) {
        (None, None) => Ok(None),
        (None, Some(_)) => {
            tracing::warn!(
                option = role.cert_option(),
                "Certificate configured without {}; ignoring it",
                role.key_option()
            );
            Ok(None)
        }
        (Some(_), None) => Err(SamlError::Configuration(format!(
            "{} requires {}",
            role.key_option(),
            role.cert_option()
        ))),
        (Some(key_location), Some(cert_location)) => {
            let key_pem = read_pem(config, source, key_location, "PRIVATE KEY").map_err(|e| {
                SamlError::Configuration(format!(
                    "Failed to read {} '{}': {e}",
                    role.key_option(),
                    key_location
                ))
            })?;
            let cert_pem =
                read_pem(config, source, cert_location, "CERTIFICATE").map_err(|e| {
                    SamlError::Configuration(format!(
                        "Failed to read {} '{}': {e}",
                        role.cert_option(),
                        cert_location
                    ))
                })?;

            let key = PKey::private_key_from_pem(ascii_only(&key_pem).as_bytes()).map_err(|e| {
                SamlError::Configuration(format!(
                    "{} is not a PEM private key: {e}",
                    role.key_option()
                ))
            })?;
            let cert = parse_cert(&cert_pem, role.cert_option())?;

            let matches = cert
                .public_key()
                .map(|public| key.public_eq(&public))
                .unwrap_or(false);
            if !matches {
                return Err(SamlError::Configuration(format!(
                    "{} does not match {}",
                    role.cert_option(),
                    role.key_option()
                )));
            }

            Ok(Some(KeyPair { key, cert }))
        }
    }
}

fn read_pem(
    config: &SamlConfig,
    source: &dyn KeySource,
    location: &str,
    label: &str,
) -> io::Result<String> {
    let bytes = source.read(&config.resolve_path(location))?;
    Ok(normalize_pem(&bytes, label))
}

// PEM parsing only needs ASCII; latin1 decoding can leave other code points.
fn ascii_only(pem: &str) -> String {
    pem.chars().filter(char::is_ascii).collect()
}

fn parse_cert(pem: &str, option: &str) -> Result<X509, SamlError> {
    X509::from_pem(ascii_only(pem).as_bytes())
        .map_err(|e| SamlError::Configuration(format!("{option} is not a PEM certificate: {e}")))
}

/// Decode `bytes` as latin1 and tidy the result into PEM.
///
/// A leading byte order mark is dropped, line endings become `\n` and a bare
/// base64 body is wrapped in `-----BEGIN {label}-----` armour.
pub fn normalize_pem(bytes: &[u8], label: &str) -> String {
    let text: String = bytes.iter().map(|&b| b as char).collect();
    let text = text
        .strip_prefix("\u{ef}\u{bb}\u{bf}")
        .or_else(|| text.strip_prefix('\u{feff}'))
        .unwrap_or(&text);
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed = text.trim();

    if trimmed.contains("-----BEGIN") {
        return format!("{trimmed}\n");
    }

    let body: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    let mut pem = format!("-----BEGIN {label}-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {label}-----\n"));
    pem
}
