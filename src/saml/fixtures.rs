//! Test-only key material and SAML Response builders.

use std::sync::OnceLock;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    encrypt::Encrypter,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rand::rand_bytes,
    rsa::{Padding, Rsa},
    symm::{Cipher, encrypt, encrypt_aead},
    x509::{X509, X509Builder, X509NameBuilder},
};
use uuid::Uuid;

use super::{
    ASSERTION_NS, PROTOCOL_NS, STATUS_SUCCESS,
    encryption::XENC_NS,
    signature::{DSIG_NS, sign_enveloped},
    xml::Element,
};
use crate::config::SignatureAlgorithm;

pub struct TestIdentity {
    pub key: PKey<Private>,
    pub cert: X509,
    pub key_pem: String,
    pub cert_pem: String,
}

/// Generate an RSA key and a matching self-signed certificate.
pub fn generate_identity(common_name: &str) -> TestIdentity {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    TestIdentity {
        key_pem: String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap(),
        cert_pem: String::from_utf8(cert.to_pem().unwrap()).unwrap(),
        key,
        cert,
    }
}

/// The IdP whose certificate tests configure as the trust anchor.
pub fn idp() -> &'static TestIdentity {
    static IDENTITY: OnceLock<TestIdentity> = OnceLock::new();
    IDENTITY.get_or_init(|| generate_identity("idp.example.com"))
}

/// An unrelated signer.
pub fn other_idp() -> &'static TestIdentity {
    static IDENTITY: OnceLock<TestIdentity> = OnceLock::new();
    IDENTITY.get_or_init(|| generate_identity("attacker.example.com"))
}

pub fn sp_signing() -> &'static TestIdentity {
    static IDENTITY: OnceLock<TestIdentity> = OnceLock::new();
    IDENTITY.get_or_init(|| generate_identity("sp-signing.example.com"))
}

pub fn sp_encryption() -> &'static TestIdentity {
    static IDENTITY: OnceLock<TestIdentity> = OnceLock::new();
    IDENTITY.get_or_init(|| generate_identity("sp-encryption.example.com"))
}

#[derive(Debug, Clone, Copy)]
pub enum ContentCipher {
    Aes256Cbc,
    Aes128Gcm,
}

/// Encrypt `plaintext` for `recipient` as an `EncryptedAssertion` with
/// RSA-OAEP key transport and the key carried inside `EncryptedData`.
pub fn encrypt_xml(plaintext: &str, recipient: &X509, cipher: ContentCipher) -> Element {
    let (key_len, algorithm) = match cipher {
        ContentCipher::Aes256Cbc => (32, "http://www.w3.org/2001/04/xmlenc#aes256-cbc"),
        ContentCipher::Aes128Gcm => (16, "http://www.w3.org/2009/xmlenc11#aes128-gcm"),
    };
    let mut content_key = vec![0u8; key_len];
    rand_bytes(&mut content_key).unwrap();

    let data = match cipher {
        ContentCipher::Aes256Cbc => {
            let mut iv = vec![0u8; 16];
            rand_bytes(&mut iv).unwrap();
            let body = encrypt(
                Cipher::aes_256_cbc(),
                &content_key,
                Some(iv.as_slice()),
                plaintext.as_bytes(),
            )
            .unwrap();
            [iv, body].concat()
        }
        ContentCipher::Aes128Gcm => {
            let mut iv = vec![0u8; 12];
            rand_bytes(&mut iv).unwrap();
            let mut tag = vec![0u8; 16];
            let body = encrypt_aead(
                Cipher::aes_128_gcm(),
                &content_key,
                Some(iv.as_slice()),
                &[],
                plaintext.as_bytes(),
                &mut tag,
            )
            .unwrap();
            [iv, body, tag].concat()
        }
    };

    let public_key = recipient.public_key().unwrap();
    let mut encrypter = Encrypter::new(&public_key).unwrap();
    encrypter.set_rsa_padding(Padding::PKCS1_OAEP).unwrap();
    let mut wrapped = vec![0u8; encrypter.encrypt_len(&content_key).unwrap()];
    let written = encrypter.encrypt(&content_key, &mut wrapped).unwrap();
    wrapped.truncate(written);

    let xenc = |name: &str| Element::new(Some("xenc"), name, Some(XENC_NS));
    let cipher_data = |bytes: &[u8]| {
        xenc("CipherData").with_child(xenc("CipherValue").with_text(&STANDARD.encode(bytes)))
    };

    let encrypted_key = xenc("EncryptedKey")
        .with_child(
            xenc("EncryptionMethod")
                .with_attr("Algorithm", "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p"),
        )
        .with_child(cipher_data(&wrapped));

    Element::new(Some("saml"), "EncryptedAssertion", Some(ASSERTION_NS))
        .declare(Some("saml"), ASSERTION_NS)
        .with_child(
            xenc("EncryptedData")
                .declare(Some("xenc"), XENC_NS)
                .with_attr("Type", "http://www.w3.org/2001/04/xmlenc#Element")
                .with_child(xenc("EncryptionMethod").with_attr("Algorithm", algorithm))
                .with_child(
                    Element::new(Some("ds"), "KeyInfo", Some(DSIG_NS))
                        .declare(Some("ds"), DSIG_NS)
                        .with_child(encrypted_key),
                )
                .with_child(cipher_data(&data)),
        )
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn saml(name: &str) -> Element {
    Element::new(Some("saml"), name, Some(ASSERTION_NS))
}

fn samlp(name: &str) -> Element {
    Element::new(Some("samlp"), name, Some(PROTOCOL_NS))
}

/// Builder for IdP Responses; defaults describe a valid login for
/// `alice@example.com` at SP `sp1`.
#[derive(Debug, Clone)]
pub struct ResponseFixture {
    pub issuer: String,
    pub name_id: Option<String>,
    pub audience: Option<String>,
    pub destination: Option<String>,
    pub recipient: Option<String>,
    pub in_response_to: Option<String>,
    pub status: String,
    pub not_before: DateTime<Utc>,
    pub not_on_or_after: DateTime<Utc>,
    pub attributes: Vec<(String, Vec<String>)>,
}

impl Default for ResponseFixture {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            issuer: "https://idp.example.com".to_string(),
            name_id: Some("alice@example.com".to_string()),
            audience: Some("sp1".to_string()),
            destination: None,
            recipient: None,
            in_response_to: None,
            status: STATUS_SUCCESS.to_string(),
            not_before: now - Duration::minutes(5),
            not_on_or_after: now + Duration::minutes(5),
            attributes: vec![
                ("email".to_string(), vec!["alice@example.com".to_string()]),
                (
                    "groups".to_string(),
                    vec!["admins".to_string(), "staff".to_string()],
                ),
            ],
        }
    }
}

impl ResponseFixture {
    pub fn assertion(&self) -> Element {
        let mut subject = saml("Subject");
        if let Some(name_id) = &self.name_id {
            subject = subject.with_child(
                saml("NameID")
                    .with_attr(
                        "Format",
                        "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress",
                    )
                    .with_text(name_id),
            );
        }
        let mut confirmation_data =
            saml("SubjectConfirmationData").with_attr("NotOnOrAfter", &timestamp(self.not_on_or_after));
        if let Some(recipient) = &self.recipient {
            confirmation_data = confirmation_data.with_attr("Recipient", recipient);
        }
        if let Some(in_response_to) = &self.in_response_to {
            confirmation_data = confirmation_data.with_attr("InResponseTo", in_response_to);
        }
        subject = subject.with_child(
            saml("SubjectConfirmation")
                .with_attr("Method", "urn:oasis:names:tc:SAML:2.0:cm:bearer")
                .with_child(confirmation_data),
        );

        let mut conditions = saml("Conditions")
            .with_attr("NotBefore", &timestamp(self.not_before))
            .with_attr("NotOnOrAfter", &timestamp(self.not_on_or_after));
        if let Some(audience) = &self.audience {
            conditions = conditions.with_child(
                saml("AudienceRestriction").with_child(saml("Audience").with_text(audience)),
            );
        }

        let mut statement = saml("AttributeStatement");
        for (name, values) in &self.attributes {
            let mut attribute = saml("Attribute").with_attr("Name", name);
            for value in values {
                attribute = attribute.with_child(saml("AttributeValue").with_text(value));
            }
            statement = statement.with_child(attribute);
        }

        saml("Assertion")
            .declare(Some("saml"), ASSERTION_NS)
            .with_attr("ID", &format!("_a{}", Uuid::new_v4().simple()))
            .with_attr("Version", "2.0")
            .with_attr("IssueInstant", &timestamp(Utc::now()))
            .with_child(saml("Issuer").with_text(&self.issuer))
            .with_child(subject)
            .with_child(conditions)
            .with_child(
                saml("AuthnStatement")
                    .with_attr("AuthnInstant", &timestamp(Utc::now()))
                    .with_attr("SessionIndex", "_session1")
                    .with_child(saml("AuthnContext").with_child(saml("AuthnContextClassRef").with_text(
                        "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport",
                    ))),
            )
            .with_child(statement)
    }

    pub fn signed_assertion(&self, signer: &TestIdentity) -> Element {
        let mut assertion = self.assertion();
        sign_enveloped(
            &mut assertion,
            &signer.key,
            Some(&signer.cert),
            SignatureAlgorithm::Sha256,
        )
        .unwrap();
        assertion
    }

    /// A Response wrapping `body` (an Assertion, EncryptedAssertion or nothing).
    pub fn response(&self, body: Option<Element>) -> Element {
        let mut response = samlp("Response")
            .declare(Some("samlp"), PROTOCOL_NS)
            .declare(Some("saml"), ASSERTION_NS)
            .with_attr("ID", &format!("_r{}", Uuid::new_v4().simple()))
            .with_attr("Version", "2.0")
            .with_attr("IssueInstant", &timestamp(Utc::now()));
        if let Some(destination) = &self.destination {
            response = response.with_attr("Destination", destination);
        }
        if let Some(in_response_to) = &self.in_response_to {
            response = response.with_attr("InResponseTo", in_response_to);
        }
        response = response
            .with_child(saml("Issuer").with_text(&self.issuer))
            .with_child(
                samlp("Status").with_child(samlp("StatusCode").with_attr("Value", &self.status)),
            );
        if let Some(body) = body {
            response = response.with_child(body);
        }
        response
    }

    /// Response carrying an assertion signed by `signer`, base64 encoded.
    pub fn signed(&self, signer: &TestIdentity) -> String {
        encode(&self.response(Some(self.signed_assertion(signer))))
    }

    /// Response signed at the Response level only.
    pub fn signed_response(&self, signer: &TestIdentity) -> String {
        let mut response = self.response(Some(self.assertion()));
        sign_enveloped(
            &mut response,
            &signer.key,
            Some(&signer.cert),
            SignatureAlgorithm::Sha256,
        )
        .unwrap();
        encode(&response)
    }

    pub fn unsigned(&self) -> String {
        encode(&self.response(Some(self.assertion())))
    }

    /// Response carrying a signed assertion encrypted for `recipient`.
    pub fn encrypted(&self, signer: &TestIdentity, recipient: &X509) -> String {
        let assertion = self.signed_assertion(signer).to_xml();
        let container = encrypt_xml(&assertion, recipient, ContentCipher::Aes256Cbc);
        encode(&self.response(Some(container)))
    }
}

pub fn encode(element: &Element) -> String {
    STANDARD.encode(element.to_xml())
}
