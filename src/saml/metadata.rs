//! Service Provider metadata.
//!
//! The document carries no `validUntil` or `cacheDuration` and its `ID` is
//! derived from the issuer, so identical configuration and key material
//! always produce identical bytes. RSA PKCS#1 v1.5 signatures are
//! deterministic too, so this holds for signed metadata as well.

use uuid::Uuid;

use super::{
    HTTP_POST_BINDING, METADATA_NS, PROTOCOL_NS, SamlError,
    keys::{KeyMaterial, KeyPair},
    signature::{DSIG_NS, sign_enveloped},
    xml::Element,
};
use crate::config::SamlConfig;

/// Content encryption and key transport algorithms the SP can decrypt.
const ENCRYPTION_METHODS: &[&str] = &[
    "http://www.w3.org/2001/04/xmlenc#aes256-cbc",
    "http://www.w3.org/2001/04/xmlenc#aes128-cbc",
    "http://www.w3.org/2009/xmlenc11#aes256-gcm",
    "http://www.w3.org/2009/xmlenc11#aes128-gcm",
    "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p",
];

fn md(name: &str) -> Element {
    Element::new(Some("md"), name, Some(METADATA_NS))
}

fn key_descriptor(usage: &str, pair: &KeyPair) -> Result<Element, SamlError> {
    let ds = |name: &str| Element::new(Some("ds"), name, Some(DSIG_NS));
    Ok(md("KeyDescriptor").with_attr("use", usage).with_child(
        ds("KeyInfo").with_child(
            ds("X509Data").with_child(ds("X509Certificate").with_text(&pair.cert_base64()?)),
        ),
    ))
}

/// Render the SP's `EntityDescriptor`.
///
/// Fails when the issuer or the callback URL is empty: an IdP cannot be
/// configured against metadata that names neither.
pub fn generate_metadata(config: &SamlConfig, keys: &KeyMaterial) -> Result<String, SamlError> {
    if config.issuer.is_empty() {
        return Err(SamlError::Configuration(
            "SAML issuer is not configured".to_string(),
        ));
    }
    if config.callback_url.is_empty() {
        return Err(SamlError::Configuration(
            "SAML callback_url is not configured".to_string(),
        ));
    }

    let mut descriptor = md("SPSSODescriptor")
        .with_attr("protocolSupportEnumeration", PROTOCOL_NS)
        .with_attr(
            "AuthnRequestsSigned",
            if keys.signing.is_some() { "true" } else { "false" },
        )
        .with_attr(
            "WantAssertionsSigned",
            if config.want_assertions_signed { "true" } else { "false" },
        );

    if let Some(signing) = &keys.signing {
        descriptor = descriptor.with_child(key_descriptor("signing", signing)?);
    }
    if let Some(decryption) = &keys.decryption {
        let mut encryption = key_descriptor("encryption", decryption)?;
        for algorithm in ENCRYPTION_METHODS {
            encryption = encryption.with_child(md("EncryptionMethod").with_attr("Algorithm", algorithm));
        }
        descriptor = descriptor.with_child(encryption);
    }

    descriptor = descriptor
        .with_child(md("NameIDFormat").with_text(&config.identifier_format))
        .with_child(
            md("AssertionConsumerService")
                .with_attr("Binding", HTTP_POST_BINDING)
                .with_attr("Location", &config.callback_url)
                .with_attr("index", "1")
                .with_attr("isDefault", "true"),
        );

    let mut entity = md("EntityDescriptor")
        .declare(Some("md"), METADATA_NS)
        .declare(Some("ds"), DSIG_NS)
        .with_attr("entityID", &config.issuer);

    let signer = keys.signing.as_ref().filter(|_| config.sign_metadata);
    if signer.is_some() {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, config.issuer.as_bytes());
        entity.set_attr("ID", &format!("_{}", id.simple()));
    }
    entity = entity.with_child(descriptor);

    if let Some(signing) = signer {
        sign_enveloped(
            &mut entity,
            &signing.key,
            Some(&signing.cert),
            config.signature_algorithm,
        )
        .map_err(|e| SamlError::Configuration(format!("Failed to sign metadata: {e}")))?;
    }

    Ok(format!("<?xml version=\"1.0\"?>\n{}", entity.to_xml()))
}
