//! AuthnRequest construction and the HTTP-Redirect binding.
//!
//! Construction is permissive: an empty entry point, issuer or callback URL
//! still yields a request, which a conformant IdP will then reject.

use std::io::Write;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use flate2::{Compression, write::DeflateEncoder};
use openssl::sign::Signer;
use samael::{
    metadata::EntityDescriptor,
    schema::{AuthnContextClassRef, AuthnContextComparison, RequestedAuthnContext},
    service_provider::ServiceProviderBuilder,
    traits::ToXml,
};
use serde::Serialize;
use uuid::Uuid;

use super::{
    ASSERTION_NS, HTTP_REDIRECT_BINDING, PROTOCOL_NS, SamlError,
    keys::{KeyMaterial, KeyPair},
    xml::{self, Element},
};
use crate::config::SamlConfig;

/// What the SP remembers about an AuthnRequest it sent.
#[derive(Debug, Clone, Serialize)]
pub struct RequestState {
    pub request_id: String,
    pub relay_state: String,
    pub issue_instant: DateTime<Utc>,
    pub destination: String,
}

/// Build the AuthnRequest XML.
///
/// `ForceAuthn` is always set: every login makes the IdP challenge the user,
/// whatever session it already holds.
pub fn build_authn_request(config: &SamlConfig) -> Result<(String, RequestState), SamlError> {
    let sp = ServiceProviderBuilder::default()
        .entity_id(config.issuer.clone())
        .acs_url(config.callback_url.clone())
        .idp_metadata(idp_metadata(&config.entry_point)?)
        .authn_name_id_format(config.identifier_format.clone())
        .force_authn(true)
        .build()
        .map_err(|e| {
            SamlError::Configuration(format!("Failed to build ServiceProvider: {}", e))
        })?;

    let mut authn_request = sp
        .make_authentication_request(&config.entry_point)
        .map_err(|e| SamlError::Configuration(format!("Failed to create AuthnRequest: {}", e)))?;
    authn_request.id = format!("_{}", Uuid::new_v4().simple());

    if let Some(authn_context) = &config.authn_context {
        authn_request.requested_authn_context = Some(RequestedAuthnContext {
            authn_context_class_refs: Some(vec![AuthnContextClassRef {
                value: Some(authn_context.clone()),
            }]),
            authn_context_decl_refs: None,
            comparison: Some(AuthnContextComparison::Exact),
        });
    }

    let serialized = authn_request.to_string().map_err(|e| {
        SamlError::Configuration(format!("Failed to serialize AuthnRequest: {:?}", e))
    })?;
    let mut request = xml::parse(&serialized).map_err(|e| {
        SamlError::Configuration(format!("Failed to serialize AuthnRequest: {e}"))
    })?;

    if let Some(policy) = request.children.iter_mut().find_map(|node| match node {
        xml::Node::Element(e) if e.is(PROTOCOL_NS, "NameIDPolicy") => Some(e),
        _ => None,
    }) {
        policy.set_attr("AllowCreate", "true");
    }

    if let Some(audience) = config.explicit_audience() {
        let conditions = Element::new(Some("saml"), "Conditions", Some(ASSERTION_NS))
            .declare(Some("saml"), ASSERTION_NS)
            .with_child(
                Element::new(Some("saml"), "AudienceRestriction", Some(ASSERTION_NS)).with_child(
                    Element::new(Some("saml"), "Audience", Some(ASSERTION_NS)).with_text(audience),
                ),
            );
        let position = request
            .child_position(PROTOCOL_NS, "NameIDPolicy")
            .or_else(|| request.child_position(ASSERTION_NS, "Issuer"))
            .map(|index| index + 1)
            .unwrap_or(0);
        request.insert_child(position, conditions);
    }

    let state = RequestState {
        request_id: authn_request.id.clone(),
        relay_state: String::new(),
        issue_instant: authn_request.issue_instant,
        destination: config.entry_point.clone(),
    };
    Ok((request.to_xml(), state))
}

/// Build the IdP redirect URL for a fresh AuthnRequest.
///
/// The request is DEFLATE-compressed, base64 and URL encoded. With a signing
/// key, `SigAlg` and `Signature` are appended, the signature covering the
/// query string exactly as encoded.
pub fn build_redirect(
    config: &SamlConfig,
    keys: &KeyMaterial,
    relay_state: &str,
) -> Result<(String, RequestState), SamlError> {
    let (request_xml, mut state) = build_authn_request(config)?;
    state.relay_state = relay_state.to_string();

    let mut compressed = vec![];
    {
        let mut encoder = DeflateEncoder::new(&mut compressed, Compression::default());
        encoder.write_all(request_xml.as_bytes()).map_err(|e| {
            SamlError::Configuration(format!("Failed to compress AuthnRequest: {}", e))
        })?;
        encoder.finish().map_err(|e| {
            SamlError::Configuration(format!("Failed to compress AuthnRequest: {}", e))
        })?;
    }

    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("SAMLRequest", &STANDARD.encode(&compressed));
    if !relay_state.is_empty() {
        query.append_pair("RelayState", relay_state);
    }
    let mut query = query.finish();

    if let Some(signing) = &keys.signing {
        query = sign_query(query, signing, config)?;
    }

    let separator = if config.entry_point.contains('?') { '&' } else { '?' };
    let url = format!("{}{}{}", config.entry_point, separator, query);

    tracing::debug!(
        request_id = %state.request_id,
        destination = %config.entry_point,
        signed = keys.signing.is_some(),
        binding = HTTP_REDIRECT_BINDING,
        "Generated SAML AuthnRequest"
    );

    Ok((url, state))
}

fn sign_query(query: String, signing: &KeyPair, config: &SamlConfig) -> Result<String, SamlError> {
    let algorithm = config.signature_algorithm;
    let sig_alg = algorithm.redirect_uri(&signing.key);

    // SigAlg is part of the signed content
    let mut signed = query;
    signed.push('&');
    signed.push_str(
        &url::form_urlencoded::Serializer::new(String::new())
            .append_pair("SigAlg", sig_alg)
            .finish(),
    );

    let mut signer = Signer::new(algorithm.message_digest(), &signing.key)
        .map_err(|e| SamlError::Configuration(format!("Failed to create signer: {}", e)))?;
    signer
        .update(signed.as_bytes())
        .map_err(|e| SamlError::Configuration(format!("Failed to update signer: {}", e)))?;
    let signature = signer
        .sign_to_vec()
        .map_err(|e| SamlError::Configuration(format!("Failed to sign: {}", e)))?;

    signed.push('&');
    signed.push_str(
        &url::form_urlencoded::Serializer::new(String::new())
            .append_pair("Signature", &STANDARD.encode(&signature))
            .finish(),
    );
    Ok(signed)
}

/// Minimal IdP descriptor the samael builder needs; only the SSO location is
/// known here.
fn idp_metadata(entry_point: &str) -> Result<EntityDescriptor, SamlError> {
    let location = xml::escape(entry_point);
    let metadata_xml = format!(
        r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{location}">
    <md:IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
        <md:SingleSignOnService Binding="{HTTP_REDIRECT_BINDING}" Location="{location}"/>
    </md:IDPSSODescriptor>
</md:EntityDescriptor>"#
    );

    samael::metadata::de::from_str(&metadata_xml).map_err(|e| {
        tracing::error!(error = %e, "Failed to build IdP metadata from config");
        SamlError::Configuration(format!("Failed to build IdP metadata: {}", e))
    })
}
