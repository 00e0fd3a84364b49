//! Enveloped XML signatures (XML-DSig) over exclusive canonicalization.
//!
//! Verification trusts only the certificate it is handed; any `KeyInfo`
//! carried inside the document is ignored. The signed element is the one the
//! caller goes on to read, and its `ID` must be both referenced by the
//! signature and unique within the document.
//!
//! Only exclusive canonicalization is implemented. A `Reference` must name
//! the exclusive c14n transform, and `SignedInfo` must use it too; inclusive
//! C14N 1.0 (still emitted by some ADFS and Shibboleth deployments) is
//! rejected as `Unsupported`.

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    hash::{MessageDigest, hash},
    pkey::{PKey, Private},
    sign::{Signer, Verifier},
    x509::X509,
};
use thiserror::Error;

use super::xml::{Element, Node, Scope};
use crate::config::SignatureAlgorithm;

pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Element is not signed")]
    Missing,

    #[error("Unsupported algorithm: {0}")]
    Unsupported(String),

    #[error("Malformed signature: {0}")]
    Malformed(String),

    #[error("Reference does not match the signed element: {0}")]
    Reference(String),

    #[error("Digest mismatch")]
    DigestMismatch,

    #[error("Signature value does not verify against the trusted certificate")]
    BadSignature,

    #[error("Crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

impl SignatureAlgorithm {
    pub fn message_digest(self) -> MessageDigest {
        match self {
            SignatureAlgorithm::Sha1 => MessageDigest::sha1(),
            SignatureAlgorithm::Sha256 => MessageDigest::sha256(),
            SignatureAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }

    /// XML-DSig `SignatureMethod` URI for an RSA key.
    pub fn rsa_uri(self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            SignatureAlgorithm::Sha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            SignatureAlgorithm::Sha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
        }
    }

    /// `SigAlg` URI for the HTTP-Redirect binding; EC keys use ECDSA.
    pub fn redirect_uri(self, key: &PKey<Private>) -> &'static str {
        if key.ec_key().is_err() {
            return self.rsa_uri();
        }
        match self {
            SignatureAlgorithm::Sha1 => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha1",
            SignatureAlgorithm::Sha256 => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256",
            SignatureAlgorithm::Sha512 => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha512",
        }
    }

    pub fn digest_uri(self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            SignatureAlgorithm::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            SignatureAlgorithm::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }
}

fn signature_method(uri: &str) -> Result<MessageDigest, SignatureError> {
    match uri {
        "http://www.w3.org/2000/09/xmldsig#rsa-sha1" => Ok(MessageDigest::sha1()),
        "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256" => Ok(MessageDigest::sha256()),
        "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384" => Ok(MessageDigest::sha384()),
        "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512" => Ok(MessageDigest::sha512()),
        other => Err(SignatureError::Unsupported(other.to_string())),
    }
}

fn digest_method(uri: &str) -> Result<MessageDigest, SignatureError> {
    match uri {
        "http://www.w3.org/2000/09/xmldsig#sha1" => Ok(MessageDigest::sha1()),
        "http://www.w3.org/2001/04/xmlenc#sha256" => Ok(MessageDigest::sha256()),
        "http://www.w3.org/2001/04/xmldsig-more#sha384" => Ok(MessageDigest::sha384()),
        "http://www.w3.org/2001/04/xmlenc#sha512" => Ok(MessageDigest::sha512()),
        other => Err(SignatureError::Unsupported(other.to_string())),
    }
}

/// The enveloped `ds:Signature` child of `element`, if any.
pub fn signature_of(element: &Element) -> Option<&Element> {
    element.child(DSIG_NS, "Signature")
}

/// Verify the enveloped signature on `signed`, which must lie within
/// `document`, against `cert`.
pub fn verify_enveloped(
    document: &Element,
    signed: &Element,
    cert: &X509,
) -> Result<(), SignatureError> {
    let signature = signature_of(signed).ok_or(SignatureError::Missing)?;
    if signed.children_named(DSIG_NS, "Signature").count() > 1 {
        return Err(SignatureError::Malformed(
            "more than one Signature on the element".to_string(),
        ));
    }

    let id = signed
        .attr("ID")
        .ok_or_else(|| SignatureError::Reference("signed element has no ID".to_string()))?;
    if document.find_by_id(id).len() != 1 {
        return Err(SignatureError::Reference(format!(
            "ID '{id}' is not unique in the document"
        )));
    }

    let signed_info = required(signature, "SignedInfo")?;
    let c14n_method = required(signed_info, "CanonicalizationMethod")?;
    let info_prefixes = exclusive_c14n_prefixes(c14n_method)?;
    let method = signature_method(algorithm(required(signed_info, "SignatureMethod")?)?)?;

    let mut references = signed_info.children_named(DSIG_NS, "Reference");
    let reference = references
        .next()
        .ok_or_else(|| SignatureError::Malformed("missing Reference".to_string()))?;
    if references.next().is_some() {
        return Err(SignatureError::Malformed(
            "more than one Reference".to_string(),
        ));
    }
    if reference.attr("URI") != Some(format!("#{id}").as_str()) {
        return Err(SignatureError::Reference(format!(
            "URI {:?} does not point at '{id}'",
            reference.attr("URI").unwrap_or_default()
        )));
    }

    let mut reference_prefixes = None;
    if let Some(transforms) = reference.child(DSIG_NS, "Transforms") {
        for transform in transforms.children_named(DSIG_NS, "Transform") {
            match algorithm(transform)? {
                ENVELOPED_SIGNATURE => {}
                EXC_C14N => reference_prefixes = Some(inclusive_prefixes(transform)),
                other => return Err(SignatureError::Unsupported(other.to_string())),
            }
        }
    }
    // Without a transform the default is inclusive C14N.
    let reference_prefixes = reference_prefixes.ok_or_else(|| {
        SignatureError::Unsupported("Reference without exclusive c14n transform".to_string())
    })?;

    // Reference digest over the element with the signature removed.
    let signed_scope = document.scope_of(signed).ok_or_else(|| {
        SignatureError::Reference("signed element is not part of the document".to_string())
    })?;
    let canonical = signed.canonicalize(&signed_scope, &reference_prefixes, Some(signature));
    let digest = hash(
        digest_method(algorithm(required(reference, "DigestMethod")?)?)?,
        canonical.as_bytes(),
    )?;
    let expected = decode_base64(&required(reference, "DigestValue")?.text())?;
    if expected.len() != digest.len() || !openssl::memcmp::eq(&expected, &digest) {
        return Err(SignatureError::DigestMismatch);
    }

    // Signature over SignedInfo, in the scope it was written in.
    let info_scope = signature.extend_scope(&signed.extend_scope(&signed_scope));
    let canonical_info = signed_info.canonicalize(&info_scope, &info_prefixes, None);
    let signature_value = decode_base64(&required(signature, "SignatureValue")?.text())?;

    let public_key = cert.public_key()?;
    let mut verifier = Verifier::new(method, &public_key)?;
    verifier.update(canonical_info.as_bytes())?;
    if verifier.verify(&signature_value).unwrap_or(false) {
        Ok(())
    } else {
        Err(SignatureError::BadSignature)
    }
}

/// Sign `target` in place with an enveloped signature, placed after its
/// `Issuer` child when it has one. The target must carry an `ID`.
pub fn sign_enveloped(
    target: &mut Element,
    key: &PKey<Private>,
    cert: Option<&X509>,
    algorithm: SignatureAlgorithm,
) -> Result<(), SignatureError> {
    if signature_of(target).is_some() {
        return Err(SignatureError::Malformed(
            "element is already signed".to_string(),
        ));
    }
    let id = target
        .attr("ID")
        .ok_or_else(|| SignatureError::Reference("signed element has no ID".to_string()))?
        .to_string();

    let canonical = target.canonicalize(&Scope::new(), &[], None);
    let digest = hash(algorithm.message_digest(), canonical.as_bytes())?;

    let signed_info = ds("SignedInfo")
        .with_child(ds("CanonicalizationMethod").with_attr("Algorithm", EXC_C14N))
        .with_child(ds("SignatureMethod").with_attr("Algorithm", algorithm.rsa_uri()))
        .with_child(
            ds("Reference")
                .with_attr("URI", &format!("#{id}"))
                .with_child(
                    ds("Transforms")
                        .with_child(ds("Transform").with_attr("Algorithm", ENVELOPED_SIGNATURE))
                        .with_child(ds("Transform").with_attr("Algorithm", EXC_C14N)),
                )
                .with_child(ds("DigestMethod").with_attr("Algorithm", algorithm.digest_uri()))
                .with_child(ds("DigestValue").with_text(&STANDARD.encode(&*digest))),
        );

    let canonical_info = signed_info.canonicalize(&Scope::new(), &[], None);
    let mut signer = Signer::new(algorithm.message_digest(), key)?;
    signer.update(canonical_info.as_bytes())?;
    let signature_value = signer.sign_to_vec()?;

    let mut signature = ds("Signature")
        .declare(Some("ds"), DSIG_NS)
        .with_child(signed_info)
        .with_child(ds("SignatureValue").with_text(&STANDARD.encode(&signature_value)));
    if let Some(cert) = cert {
        signature = signature.with_child(
            ds("KeyInfo").with_child(
                ds("X509Data")
                    .with_child(ds("X509Certificate").with_text(&STANDARD.encode(cert.to_der()?))),
            ),
        );
    }

    let position = target
        .children
        .iter()
        .position(|node| matches!(node, Node::Element(e) if e.name == "Issuer"))
        .map(|index| index + 1)
        .unwrap_or(0);
    target.insert_child(position, signature);
    Ok(())
}

fn ds(name: &str) -> Element {
    Element::new(Some("ds"), name, Some(DSIG_NS))
}

fn required<'a>(parent: &'a Element, name: &str) -> Result<&'a Element, SignatureError> {
    parent
        .child(DSIG_NS, name)
        .ok_or_else(|| SignatureError::Malformed(format!("missing {name}")))
}

fn algorithm(element: &Element) -> Result<&str, SignatureError> {
    element.attr("Algorithm").ok_or_else(|| {
        SignatureError::Malformed(format!("{} has no Algorithm", element.name))
    })
}

fn exclusive_c14n_prefixes(method: &Element) -> Result<Vec<String>, SignatureError> {
    match algorithm(method)? {
        EXC_C14N => Ok(inclusive_prefixes(method)),
        other => Err(SignatureError::Unsupported(other.to_string())),
    }
}

fn inclusive_prefixes(transform: &Element) -> Vec<String> {
    transform
        .child(EXC_C14N, "InclusiveNamespaces")
        .and_then(|e| e.attr("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

pub(crate) fn decode_base64(text: &str) -> Result<Vec<u8>, SignatureError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| SignatureError::Malformed(format!("invalid base64: {e}")))
}
