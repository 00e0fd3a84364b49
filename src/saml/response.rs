//! SAML Response validation.
//!
//! A Response moves through a fixed sequence of stages and is rejected at the
//! first one it fails:
//!
//! 1. **Received**: base64 decoded and parsed.
//! 2. **SignatureChecked**: the Response and/or Assertion signature verifies
//!    against the configured IdP certificate, which must exist.
//! 3. **Decrypted**: an `EncryptedAssertion` is opened with the SP's
//!    decryption key.
//! 4. **ConditionsChecked**: validity window, audience, recipient,
//!    destination, issuer and (optionally) `InResponseTo`.
//! 5. **AttributeExtracted**: NameID and attributes are collected.
//!
//! There are no retries. A rejected login starts over with a new
//! AuthnRequest.

use std::collections::HashMap;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use openssl::x509::X509;
use serde::Serialize;

use super::{
    ASSERTION_NS, PROTOCOL_NS, STATUS_SUCCESS, SamlError,
    encryption::decrypt_element,
    keys::KeyMaterial,
    request_cache::RequestCache,
    signature::{signature_of, verify_enveloped},
    xml::{self, Element, Scope},
};
use crate::config::SamlConfig;

const BEARER: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";

/// Attribute names checked, in order, for the user's email address.
const EMAIL_ATTRIBUTES: &[&str] = &[
    "email",
    "mail",
    "emailAddress",
    "urn:oid:0.9.2342.19200300.100.1.3",
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress",
];

/// The identity asserted by an accepted Response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedIdentity {
    /// Subject NameID; the stable external key for the local user.
    pub name_id: String,
    pub name_id_format: Option<String>,
    /// Email from a well-known attribute, else the NameID.
    pub email: String,
    pub issuer: Option<String>,
    pub session_index: Option<String>,
    /// Attribute name (and FriendlyName) to values.
    pub attributes: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    Received,
    SignatureChecked,
    Decrypted,
    ConditionsChecked,
    AttributeExtracted,
    Accepted,
}

/// Validates Responses for one configuration snapshot.
pub struct ResponseValidator<'a> {
    config: &'a SamlConfig,
    keys: &'a KeyMaterial,
    requests: Option<&'a RequestCache>,
    now: DateTime<Utc>,
}

/// The assertion being read, with the namespace scope it sits in.
struct AssertionContext {
    element: Element,
    scope: Scope,
    signed: bool,
}

impl AssertionContext {
    /// Scope at `target`'s parent, `target` lying within the assertion.
    fn scope_of(&self, target: &Element) -> Scope {
        let mut scope = self.scope.clone();
        if let Some(inner) = self.element.scope_of(target) {
            scope.extend(inner);
        }
        scope
    }
}

impl<'a> ResponseValidator<'a> {
    pub fn new(config: &'a SamlConfig, keys: &'a KeyMaterial) -> Self {
        Self {
            config,
            keys,
            requests: None,
            now: Utc::now(),
        }
    }

    /// Require `InResponseTo` to name an outstanding request in `requests`.
    pub fn with_request_cache(mut self, requests: &'a RequestCache) -> Self {
        self.requests = Some(requests);
        self
    }

    /// Evaluate time conditions at `now` instead of the current time.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Validate a base64-encoded `SAMLResponse` form value.
    pub fn validate(&self, encoded: &str) -> Result<ResolvedIdentity, SamlError> {
        let mut stage = ValidationStage::Received;
        let result = self.run(encoded, &mut stage);
        match &result {
            Ok(identity) => tracing::debug!(
                name_id = %identity.name_id,
                issuer = ?identity.issuer,
                "SAML response accepted"
            ),
            Err(e) => tracing::warn!(
                stage = ?stage,
                code = e.code(),
                error = %e,
                "SAML response rejected"
            ),
        }
        result
    }

    fn run(
        &self,
        encoded: &str,
        stage: &mut ValidationStage,
    ) -> Result<ResolvedIdentity, SamlError> {
        let response = decode(encoded)?;
        if !response.is(PROTOCOL_NS, "Response") {
            return Err(SamlError::MalformedResponse(format!(
                "expected samlp:Response, found {}",
                response.qualified_name()
            )));
        }

        let idp_cert = self.keys.idp_cert.as_ref().ok_or(SamlError::NoTrustAnchor)?;

        let response_signed = signature_of(&response).is_some();
        if response_signed {
            verify_enveloped(&response, &response, idp_cert)
                .map_err(|e| SamlError::InvalidSignature(format!("response: {e}")))?;
        }
        for assertion in response.children_named(ASSERTION_NS, "Assertion") {
            if signature_of(assertion).is_some() {
                verify_enveloped(&response, assertion, idp_cert)
                    .map_err(|e| SamlError::InvalidSignature(format!("assertion: {e}")))?;
            }
        }
        *stage = ValidationStage::SignatureChecked;

        check_status(&response)?;

        let assertion = self.open_assertion(&response, idp_cert)?;
        *stage = ValidationStage::Decrypted;

        if !response_signed && !assertion.signed {
            return Err(SamlError::InvalidSignature(
                "neither the response nor the assertion is signed".to_string(),
            ));
        }
        if self.config.want_assertions_signed && !assertion.signed {
            return Err(SamlError::InvalidSignature(
                "assertion is not signed".to_string(),
            ));
        }

        self.check_conditions(&response, &assertion.element)?;
        *stage = ValidationStage::ConditionsChecked;

        let identity = self.extract_identity(&assertion)?;
        *stage = ValidationStage::AttributeExtracted;

        *stage = ValidationStage::Accepted;
        Ok(identity)
    }

    /// The single assertion in `response`, decrypted if need be.
    fn open_assertion(
        &self,
        response: &Element,
        idp_cert: &X509,
    ) -> Result<AssertionContext, SamlError> {
        let plain: Vec<&Element> = response.children_named(ASSERTION_NS, "Assertion").collect();
        let encrypted: Vec<&Element> = response
            .children_named(ASSERTION_NS, "EncryptedAssertion")
            .collect();

        match (plain.as_slice(), encrypted.as_slice()) {
            ([assertion], []) => Ok(AssertionContext {
                element: (*assertion).clone(),
                scope: response.scope_of(assertion).unwrap_or_default(),
                signed: signature_of(assertion).is_some(),
            }),
            ([], [container]) => {
                let key = self
                    .keys
                    .decryption
                    .as_ref()
                    .map(|pair| &pair.key)
                    .ok_or_else(|| {
                        SamlError::CannotDecrypt("no decryption key is configured".to_string())
                    })?;
                let outer = response.scope_of(container).unwrap_or_default();
                let element = decrypt_element(container, &outer, key)
                    .map_err(|e| SamlError::CannotDecrypt(e.to_string()))?;
                if !element.is(ASSERTION_NS, "Assertion") {
                    return Err(SamlError::MalformedResponse(format!(
                        "EncryptedAssertion holds {}",
                        element.qualified_name()
                    )));
                }

                let signed = signature_of(&element).is_some();
                if signed {
                    verify_enveloped(&element, &element, idp_cert)
                        .map_err(|e| SamlError::InvalidSignature(format!("assertion: {e}")))?;
                }
                Ok(AssertionContext {
                    scope: container.extend_scope(&outer),
                    element,
                    signed,
                })
            }
            ([], []) => Err(SamlError::MalformedResponse(
                "response contains no assertion".to_string(),
            )),
            _ => Err(SamlError::MalformedResponse(
                "response contains more than one assertion".to_string(),
            )),
        }
    }

    fn check_conditions(&self, response: &Element, assertion: &Element) -> Result<(), SamlError> {
        let skew = Duration::seconds(self.config.accepted_clock_skew_secs as i64);
        let now = self.now;

        if let Some(conditions) = assertion.child(ASSERTION_NS, "Conditions") {
            if let Some(not_before) = conditions.attr("NotBefore") {
                let not_before = parse_instant(not_before, "Conditions NotBefore")?;
                if now + skew < not_before {
                    return Err(SamlError::ConditionsNotMet(format!(
                        "assertion is not valid before {not_before}"
                    )));
                }
            }
            if let Some(not_on_or_after) = conditions.attr("NotOnOrAfter") {
                let not_on_or_after = parse_instant(not_on_or_after, "Conditions NotOnOrAfter")?;
                if now - skew >= not_on_or_after {
                    return Err(SamlError::ConditionsNotMet(format!(
                        "assertion expired at {not_on_or_after}"
                    )));
                }
            }

            if let Some(expected) = self.config.expected_audience() {
                for restriction in conditions.children_named(ASSERTION_NS, "AudienceRestriction") {
                    let matched = restriction
                        .children_named(ASSERTION_NS, "Audience")
                        .any(|audience| audience.text().trim() == expected);
                    if !matched {
                        return Err(SamlError::ConditionsNotMet(format!(
                            "audience does not include '{expected}'"
                        )));
                    }
                }
            }
        }

        if let Some(subject) = assertion.child(ASSERTION_NS, "Subject") {
            for confirmation in subject.children_named(ASSERTION_NS, "SubjectConfirmation") {
                if confirmation.attr("Method").is_some_and(|m| m != BEARER) {
                    continue;
                }
                let Some(data) = confirmation.child(ASSERTION_NS, "SubjectConfirmationData") else {
                    continue;
                };
                if let Some(not_before) = data.attr("NotBefore") {
                    let not_before = parse_instant(not_before, "SubjectConfirmationData NotBefore")?;
                    if now + skew < not_before {
                        return Err(SamlError::ConditionsNotMet(
                            "subject confirmation is not yet valid".to_string(),
                        ));
                    }
                }
                if let Some(not_on_or_after) = data.attr("NotOnOrAfter") {
                    let not_on_or_after =
                        parse_instant(not_on_or_after, "SubjectConfirmationData NotOnOrAfter")?;
                    if now - skew >= not_on_or_after {
                        return Err(SamlError::ConditionsNotMet(
                            "subject confirmation expired".to_string(),
                        ));
                    }
                }
                if let Some(recipient) = data.attr("Recipient")
                    && !self.config.callback_url.is_empty()
                    && recipient != self.config.callback_url
                {
                    return Err(SamlError::ConditionsNotMet(format!(
                        "recipient '{recipient}' is not this service provider"
                    )));
                }
            }
        }

        if let Some(destination) = response.attr("Destination")
            && !self.config.callback_url.is_empty()
            && destination != self.config.callback_url
        {
            return Err(SamlError::ConditionsNotMet(format!(
                "destination '{destination}' is not this service provider"
            )));
        }

        if let Some(expected) = self.config.idp_issuer.as_deref().filter(|i| !i.is_empty()) {
            let issuer = issuer_of(assertion).unwrap_or_default();
            if issuer != expected {
                return Err(SamlError::ConditionsNotMet(format!(
                    "unexpected issuer '{issuer}'"
                )));
            }
            if let Some(response_issuer) = issuer_of(response)
                && response_issuer != expected
            {
                return Err(SamlError::ConditionsNotMet(format!(
                    "unexpected response issuer '{response_issuer}'"
                )));
            }
        }

        if let Some(requests) = self.requests {
            let in_response_to = response
                .attr("InResponseTo")
                .or_else(|| confirmation_in_response_to(assertion))
                .ok_or_else(|| {
                    SamlError::ConditionsNotMet("response has no InResponseTo".to_string())
                })?;
            if !requests.take(in_response_to) {
                return Err(SamlError::ConditionsNotMet(format!(
                    "InResponseTo '{in_response_to}' does not match an outstanding request"
                )));
            }
        }

        Ok(())
    }

    fn extract_identity(&self, assertion: &AssertionContext) -> Result<ResolvedIdentity, SamlError> {
        let element = &assertion.element;
        let subject = element
            .child(ASSERTION_NS, "Subject")
            .ok_or(SamlError::MissingIdentity)?;

        let name_id = match subject.child(ASSERTION_NS, "NameID") {
            Some(name_id) => name_id.clone(),
            None => match subject.child(ASSERTION_NS, "EncryptedID") {
                Some(encrypted_id) => self.decrypt_name_id(assertion, encrypted_id)?,
                None => return Err(SamlError::MissingIdentity),
            },
        };
        let value = name_id.text().trim().to_string();
        if value.is_empty() {
            return Err(SamlError::MissingIdentity);
        }

        let attributes = self.collect_attributes(assertion);
        let email = EMAIL_ATTRIBUTES
            .iter()
            .filter_map(|name| attributes.get(*name))
            .flat_map(|values| values.iter())
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .unwrap_or(value.as_str())
            .to_string();

        let session_index = element
            .children_named(ASSERTION_NS, "AuthnStatement")
            .find_map(|statement| statement.attr("SessionIndex"))
            .map(str::to_string);

        Ok(ResolvedIdentity {
            name_id_format: name_id.attr("Format").map(str::to_string),
            name_id: value,
            email,
            issuer: issuer_of(element),
            session_index,
            attributes,
        })
    }

    fn decrypt_name_id(
        &self,
        assertion: &AssertionContext,
        encrypted_id: &Element,
    ) -> Result<Element, SamlError> {
        let key = self
            .keys
            .decryption
            .as_ref()
            .map(|pair| &pair.key)
            .ok_or_else(|| SamlError::CannotDecrypt("no decryption key is configured".to_string()))?;
        let element = decrypt_element(encrypted_id, &assertion.scope_of(encrypted_id), key)
            .map_err(|e| SamlError::CannotDecrypt(format!("EncryptedID: {e}")))?;
        if element.is(ASSERTION_NS, "NameID") {
            Ok(element)
        } else {
            Err(SamlError::MissingIdentity)
        }
    }

    fn collect_attributes(&self, assertion: &AssertionContext) -> HashMap<String, Vec<String>> {
        let mut attributes: HashMap<String, Vec<String>> = HashMap::new();

        for statement in assertion
            .element
            .children_named(ASSERTION_NS, "AttributeStatement")
        {
            for attribute in statement.children_named(ASSERTION_NS, "Attribute") {
                add_attribute(&mut attributes, attribute);
            }

            for encrypted in statement.children_named(ASSERTION_NS, "EncryptedAttribute") {
                let Some(pair) = &self.keys.decryption else {
                    tracing::debug!("Skipping EncryptedAttribute: no decryption key");
                    continue;
                };
                match decrypt_element(encrypted, &assertion.scope_of(encrypted), &pair.key) {
                    Ok(attribute) if attribute.is(ASSERTION_NS, "Attribute") => {
                        add_attribute(&mut attributes, &attribute)
                    }
                    Ok(_) => tracing::debug!("EncryptedAttribute does not hold an Attribute"),
                    Err(e) => tracing::warn!(error = %e, "Failed to decrypt EncryptedAttribute"),
                }
            }
        }

        attributes
    }
}

fn add_attribute(attributes: &mut HashMap<String, Vec<String>>, attribute: &Element) {
    let Some(name) = attribute.attr("Name") else {
        return;
    };
    let values: Vec<String> = attribute
        .children_named(ASSERTION_NS, "AttributeValue")
        .map(|value| value.text())
        .collect();

    if let Some(friendly) = attribute.attr("FriendlyName")
        && friendly != name
    {
        attributes
            .entry(friendly.to_string())
            .or_default()
            .extend(values.iter().cloned());
    }
    attributes.entry(name.to_string()).or_default().extend(values);
}

fn decode(encoded: &str) -> Result<Element, SamlError> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(SamlError::MalformedResponse(
            "SAMLResponse is empty".to_string(),
        ));
    }
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| SamlError::MalformedResponse(format!("invalid base64: {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| SamlError::MalformedResponse(format!("response is not UTF-8: {e}")))?;
    xml::parse(&text).map_err(|e| SamlError::MalformedResponse(e.to_string()))
}

fn check_status(response: &Element) -> Result<(), SamlError> {
    let status = response
        .child(PROTOCOL_NS, "Status")
        .ok_or_else(|| SamlError::MalformedResponse("response has no Status".to_string()))?;
    let code = status
        .child(PROTOCOL_NS, "StatusCode")
        .ok_or_else(|| SamlError::MalformedResponse("Status has no StatusCode".to_string()))?;
    let value = code.attr("Value").unwrap_or_default();
    if value == STATUS_SUCCESS {
        return Ok(());
    }

    let mut detail = value.to_string();
    if let Some(sub) = code
        .child(PROTOCOL_NS, "StatusCode")
        .and_then(|c| c.attr("Value"))
    {
        detail.push_str(&format!(" ({sub})"));
    }
    if let Some(message) = status.child(PROTOCOL_NS, "StatusMessage") {
        detail.push_str(&format!(": {}", message.text().trim()));
    }
    Err(SamlError::IdpStatus(detail))
}

fn issuer_of(element: &Element) -> Option<String> {
    element
        .child(ASSERTION_NS, "Issuer")
        .map(|issuer| issuer.text().trim().to_string())
}

fn confirmation_in_response_to(assertion: &Element) -> Option<&str> {
    assertion
        .child(ASSERTION_NS, "Subject")?
        .children_named(ASSERTION_NS, "SubjectConfirmation")
        .filter_map(|c| c.child(ASSERTION_NS, "SubjectConfirmationData"))
        .find_map(|data| data.attr("InResponseTo"))
}

fn parse_instant(value: &str, what: &str) -> Result<DateTime<Utc>, SamlError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|instant| instant.with_timezone(&Utc))
        .map_err(|e| SamlError::MalformedResponse(format!("invalid {what} '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use rstest::rstest;

    use super::*;
    use crate::{
        config::AudienceSetting,
        saml::{
            fixtures::{self, ResponseFixture, encode, idp, other_idp, sp_encryption},
            keys::KeyPair,
            signature::sign_enveloped,
        },
    };

    fn config() -> SamlConfig {
        SamlConfig {
            issuer: "sp1".to_string(),
            callback_url: "https://host/cb".to_string(),
            entry_point: "https://idp/sso".to_string(),
            ..Default::default()
        }
    }

    fn keys() -> KeyMaterial {
        KeyMaterial {
            idp_cert: Some(idp().cert.clone()),
            ..Default::default()
        }
    }

    fn keys_with_decryption() -> KeyMaterial {
        KeyMaterial {
            decryption: Some(KeyPair {
                key: sp_encryption().key.clone(),
                cert: sp_encryption().cert.clone(),
            }),
            ..keys()
        }
    }

    fn validate(encoded: &str) -> Result<ResolvedIdentity, SamlError> {
        ResponseValidator::new(&config(), &keys()).validate(encoded)
    }

    #[test]
    fn test_accepts_signed_assertion() {
        let identity = validate(&ResponseFixture::default().signed(idp())).unwrap();
        assert_eq!(identity.name_id, "alice@example.com");
        assert_eq!(identity.email, "alice@example.com");
        assert_eq!(identity.issuer.as_deref(), Some("https://idp.example.com"));
        assert_eq!(identity.session_index.as_deref(), Some("_session1"));
        assert_eq!(identity.attributes["groups"], ["admins", "staff"]);
        assert_eq!(
            identity.name_id_format.as_deref(),
            Some("urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress")
        );
    }

    #[test]
    fn test_accepts_signed_response() {
        let identity = validate(&ResponseFixture::default().signed_response(idp())).unwrap();
        assert_eq!(identity.name_id, "alice@example.com");
    }

    #[test]
    fn test_accepts_whitespace_in_encoding() {
        let encoded = ResponseFixture::default().signed(idp());
        let wrapped: String = encoded
            .as_bytes()
            .chunks(76)
            .map(|line| format!("{}\r\n", String::from_utf8_lossy(line)))
            .collect();
        assert!(validate(&wrapped).is_ok());
    }

    #[test]
    fn test_no_trust_anchor() {
        let keys = KeyMaterial::default();
        let result = ResponseValidator::new(&config(), &keys)
            .validate(&ResponseFixture::default().signed(idp()));
        assert!(matches!(result, Err(SamlError::NoTrustAnchor)));
    }

    #[test]
    fn test_signed_by_other_key() {
        let result = validate(&ResponseFixture::default().signed(other_idp()));
        assert!(matches!(result, Err(SamlError::InvalidSignature(_))));

        let result = validate(&ResponseFixture::default().signed_response(other_idp()));
        assert!(matches!(result, Err(SamlError::InvalidSignature(_))));
    }

    #[test]
    fn test_invalid_signature_wins_over_other_failures() {
        let fixture = ResponseFixture {
            status: "urn:oasis:names:tc:SAML:2.0:status:Requester".to_string(),
            not_on_or_after: Utc::now() - Duration::hours(1),
            audience: Some("someone-else".to_string()),
            ..Default::default()
        };
        let result = validate(&fixture.signed(other_idp()));
        assert!(matches!(result, Err(SamlError::InvalidSignature(_))));
    }

    #[test]
    fn test_unsigned_rejected() {
        let result = validate(&ResponseFixture::default().unsigned());
        assert!(matches!(result, Err(SamlError::InvalidSignature(_))));
    }

    #[test]
    fn test_want_assertions_signed() {
        let config = SamlConfig {
            want_assertions_signed: true,
            ..config()
        };
        let keys = keys();
        let validator = ResponseValidator::new(&config, &keys);
        assert!(matches!(
            validator.validate(&ResponseFixture::default().signed_response(idp())),
            Err(SamlError::InvalidSignature(_))
        ));
        assert!(validator.validate(&ResponseFixture::default().signed(idp())).is_ok());
    }

    #[test]
    fn test_tampered_assertion() {
        let fixture = ResponseFixture::default();
        let mut assertion = fixture.signed_assertion(idp());
        // Swap the NameID after signing.
        let xml = assertion.to_xml().replace("alice@example.com", "mallory@example.com");
        assertion = xml::parse(&xml).unwrap();
        let result = validate(&encode(&fixture.response(Some(assertion))));
        assert!(matches!(result, Err(SamlError::InvalidSignature(_))));
    }

    #[test]
    fn test_signature_wrapping_rejected() {
        // A signed assertion moved aside, an unsigned forged one read in its place.
        let fixture = ResponseFixture::default();
        let genuine = fixture.signed_assertion(idp());
        let forged = ResponseFixture {
            name_id: Some("mallory@example.com".to_string()),
            ..fixture.clone()
        }
        .assertion();
        let response = fixture
            .response(Some(forged))
            .with_child(
                Element::new(Some("samlp"), "Extensions", Some(PROTOCOL_NS)).with_child(genuine),
            );
        let result = validate(&encode(&response));
        assert!(matches!(result, Err(SamlError::InvalidSignature(_))));
    }

    #[rstest]
    #[case::not_base64("!!!not base64!!!")]
    #[case::empty("")]
    #[case::not_xml("bm90IHhtbA==")]
    fn test_malformed(#[case] encoded: &str) {
        assert!(matches!(
            validate(encoded),
            Err(SamlError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_doctype_rejected() {
        let xml = r#"<!DOCTYPE x [<!ENTITY a "b">]><samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol"/>"#;
        assert!(matches!(
            validate(&STANDARD.encode(xml)),
            Err(SamlError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_deeply_nested_response_rejected() {
        let depth = 10_000;
        let xml = format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_r">{}{}</samlp:Response>"#,
            "<a>".repeat(depth),
            "</a>".repeat(depth)
        );
        assert!(matches!(
            validate(&STANDARD.encode(xml)),
            Err(SamlError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_wrong_root_rejected() {
        let element = ResponseFixture::default().signed_assertion(idp());
        assert!(matches!(
            validate(&encode(&element)),
            Err(SamlError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_idp_status_error() {
        let fixture = ResponseFixture {
            status: "urn:oasis:names:tc:SAML:2.0:status:Responder".to_string(),
            ..Default::default()
        };
        let mut response = fixture.response(None);
        sign_enveloped(
            &mut response,
            &idp().key,
            None,
            crate::config::SignatureAlgorithm::Sha256,
        )
        .unwrap();
        match validate(&encode(&response)) {
            Err(SamlError::IdpStatus(detail)) => assert!(detail.contains("Responder")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_two_assertions_rejected() {
        let fixture = ResponseFixture::default();
        let response = fixture
            .response(Some(fixture.signed_assertion(idp())))
            .with_child(fixture.signed_assertion(idp()));
        assert!(matches!(
            validate(&encode(&response)),
            Err(SamlError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_expired_assertion() {
        let fixture = ResponseFixture {
            not_before: Utc::now() - Duration::hours(2),
            not_on_or_after: Utc::now() - Duration::hours(1),
            ..Default::default()
        };
        assert!(matches!(
            validate(&fixture.signed(idp())),
            Err(SamlError::ConditionsNotMet(_))
        ));
    }

    #[test]
    fn test_not_yet_valid_assertion() {
        let fixture = ResponseFixture {
            not_before: Utc::now() + Duration::hours(1),
            not_on_or_after: Utc::now() + Duration::hours(2),
            ..Default::default()
        };
        assert!(matches!(
            validate(&fixture.signed(idp())),
            Err(SamlError::ConditionsNotMet(_))
        ));
    }

    #[test]
    fn test_clock_skew_tolerated() {
        let fixture = ResponseFixture::default();
        let encoded = fixture.signed(idp());
        let config = config();
        let keys = keys();

        // 30 seconds past expiry is inside the default 60 second skew.
        let late = fixture.not_on_or_after + Duration::seconds(30);
        assert!(
            ResponseValidator::new(&config, &keys)
                .at(late)
                .validate(&encoded)
                .is_ok()
        );

        let too_late = fixture.not_on_or_after + Duration::seconds(61);
        assert!(matches!(
            ResponseValidator::new(&config, &keys)
                .at(too_late)
                .validate(&encoded),
            Err(SamlError::ConditionsNotMet(_))
        ));
    }

    #[test]
    fn test_audience_mismatch() {
        let fixture = ResponseFixture {
            audience: Some("other-sp".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            validate(&fixture.signed(idp())),
            Err(SamlError::ConditionsNotMet(_))
        ));
    }

    #[test]
    fn test_audience_check_disabled() {
        let fixture = ResponseFixture {
            audience: Some("other-sp".to_string()),
            ..Default::default()
        };
        let config = SamlConfig {
            audience: Some(AudienceSetting::Flag(false)),
            ..config()
        };
        let keys = keys();
        assert!(
            ResponseValidator::new(&config, &keys)
                .validate(&fixture.signed(idp()))
                .is_ok()
        );
    }

    #[test]
    fn test_explicit_audience() {
        let fixture = ResponseFixture {
            audience: Some("urn:sp".to_string()),
            ..Default::default()
        };
        let config = SamlConfig {
            audience: Some(AudienceSetting::Value("urn:sp".to_string())),
            ..config()
        };
        let keys = keys();
        assert!(
            ResponseValidator::new(&config, &keys)
                .validate(&fixture.signed(idp()))
                .is_ok()
        );
    }

    #[test]
    fn test_absent_audience_restriction_accepted() {
        let fixture = ResponseFixture {
            audience: None,
            ..Default::default()
        };
        assert!(validate(&fixture.signed(idp())).is_ok());
    }

    #[test]
    fn test_destination_and_recipient() {
        let good = ResponseFixture {
            destination: Some("https://host/cb".to_string()),
            recipient: Some("https://host/cb".to_string()),
            ..Default::default()
        };
        assert!(validate(&good.signed(idp())).is_ok());

        let wrong_destination = ResponseFixture {
            destination: Some("https://evil/cb".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            validate(&wrong_destination.signed(idp())),
            Err(SamlError::ConditionsNotMet(_))
        ));

        let wrong_recipient = ResponseFixture {
            recipient: Some("https://evil/cb".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            validate(&wrong_recipient.signed(idp())),
            Err(SamlError::ConditionsNotMet(_))
        ));
    }

    #[test]
    fn test_idp_issuer() {
        let config = SamlConfig {
            idp_issuer: Some("https://other-idp.example.com".to_string()),
            ..config()
        };
        let keys = keys();
        assert!(matches!(
            ResponseValidator::new(&config, &keys).validate(&ResponseFixture::default().signed(idp())),
            Err(SamlError::ConditionsNotMet(_))
        ));

        let config = SamlConfig {
            idp_issuer: Some("https://idp.example.com".to_string()),
            ..config
        };
        assert!(
            ResponseValidator::new(&config, &keys)
                .validate(&ResponseFixture::default().signed(idp()))
                .is_ok()
        );
    }

    #[test]
    fn test_in_response_to() {
        let requests = RequestCache::new();
        requests.insert("_req1", StdDuration::from_secs(60), 16);
        let config = config();
        let keys = keys();

        let fixture = ResponseFixture {
            in_response_to: Some("_req1".to_string()),
            ..Default::default()
        };
        let encoded = fixture.signed(idp());
        let validator = ResponseValidator::new(&config, &keys).with_request_cache(&requests);
        assert!(validator.validate(&encoded).is_ok());

        // Replaying the same Response fails: the ID was consumed.
        assert!(matches!(
            validator.validate(&encoded),
            Err(SamlError::ConditionsNotMet(_))
        ));

        // Unsolicited responses are rejected when the cache is in use.
        assert!(matches!(
            validator.validate(&ResponseFixture::default().signed(idp())),
            Err(SamlError::ConditionsNotMet(_))
        ));
    }

    #[test]
    fn test_missing_name_id() {
        let fixture = ResponseFixture {
            name_id: None,
            ..Default::default()
        };
        assert!(matches!(
            validate(&fixture.signed(idp())),
            Err(SamlError::MissingIdentity)
        ));
    }

    #[test]
    fn test_blank_name_id() {
        let fixture = ResponseFixture {
            name_id: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            validate(&fixture.signed(idp())),
            Err(SamlError::MissingIdentity)
        ));
    }

    #[test]
    fn test_email_falls_back_to_name_id() {
        let fixture = ResponseFixture {
            name_id: Some("u-1234".to_string()),
            attributes: vec![("mail".to_string(), vec!["bob@example.com".to_string()])],
            ..Default::default()
        };
        let identity = validate(&fixture.signed(idp())).unwrap();
        assert_eq!(identity.name_id, "u-1234");
        assert_eq!(identity.email, "bob@example.com");

        let fixture = ResponseFixture {
            name_id: Some("u-1234".to_string()),
            attributes: vec![],
            ..Default::default()
        };
        let identity = validate(&fixture.signed(idp())).unwrap();
        assert_eq!(identity.email, "u-1234");
    }

    #[test]
    fn test_encrypted_assertion() {
        let encoded = ResponseFixture::default().encrypted(idp(), &sp_encryption().cert);
        let keys = keys_with_decryption();
        let identity = ResponseValidator::new(&config(), &keys)
            .validate(&encoded)
            .unwrap();
        assert_eq!(identity.name_id, "alice@example.com");
    }

    #[test]
    fn test_encrypted_assertion_without_key() {
        let encoded = ResponseFixture::default().encrypted(idp(), &sp_encryption().cert);
        assert!(matches!(validate(&encoded), Err(SamlError::CannotDecrypt(_))));
    }

    #[test]
    fn test_encrypted_assertion_wrong_key() {
        let encoded = ResponseFixture::default().encrypted(idp(), &other_idp().cert);
        let keys = keys_with_decryption();
        assert!(matches!(
            ResponseValidator::new(&config(), &keys).validate(&encoded),
            Err(SamlError::CannotDecrypt(_))
        ));
    }

    #[test]
    fn test_encrypted_assertion_signed_by_other_key() {
        let encoded = ResponseFixture::default().encrypted(other_idp(), &sp_encryption().cert);
        let keys = keys_with_decryption();
        assert!(matches!(
            ResponseValidator::new(&config(), &keys).validate(&encoded),
            Err(SamlError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_encrypted_gcm_assertion() {
        let fixture = ResponseFixture::default();
        let assertion = fixture.signed_assertion(idp()).to_xml();
        let container = fixtures::encrypt_xml(
            &assertion,
            &sp_encryption().cert,
            fixtures::ContentCipher::Aes128Gcm,
        );
        let keys = keys_with_decryption();
        let identity = ResponseValidator::new(&config(), &keys)
            .validate(&encode(&fixture.response(Some(container))))
            .unwrap();
        assert_eq!(identity.name_id, "alice@example.com");
    }

    #[test]
    fn test_friendly_name_alias() {
        let xml = format!(
            r#"<saml:Attribute xmlns:saml="{ASSERTION_NS}" Name="urn:oid:0.9.2342.19200300.100.1.3" FriendlyName="mail"><saml:AttributeValue>carol@example.com</saml:AttributeValue></saml:Attribute>"#
        );
        let mut attributes = HashMap::new();
        add_attribute(&mut attributes, &xml::parse(&xml).unwrap());
        assert_eq!(attributes["mail"], ["carol@example.com"]);
        assert_eq!(
            attributes["urn:oid:0.9.2342.19200300.100.1.3"],
            ["carol@example.com"]
        );
    }
}
