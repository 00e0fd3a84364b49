//! XML Encryption: decrypting `EncryptedAssertion` and `EncryptedID`.
//!
//! Supports RSA key transport (OAEP and PKCS#1 v1.5) wrapping an AES-CBC or
//! AES-GCM content key. The `EncryptedKey` may sit inside the data's
//! `KeyInfo` or next to `EncryptedData` in the container.

use openssl::{
    encrypt::Decrypter,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Padding,
    symm::{Cipher, Crypter, Mode, decrypt_aead},
};
use thiserror::Error;

use super::{
    signature::{DSIG_NS, SignatureError, decode_base64},
    xml::{self, Element, Scope, XmlError},
};

pub const XENC_NS: &str = "http://www.w3.org/2001/04/xmlenc#";
pub const XENC11_NS: &str = "http://www.w3.org/2009/xmlenc11#";

const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("Missing {0}")]
    Missing(&'static str),

    #[error("Unsupported encryption algorithm: {0}")]
    Unsupported(String),

    #[error("Content key could not be unwrapped")]
    KeyTransport,

    #[error("Encrypted content could not be decrypted")]
    Content,

    #[error("Invalid cipher data: {0}")]
    CipherData(String),

    #[error("Decrypted content is not valid XML: {0}")]
    Xml(#[from] XmlError),
}

#[derive(Clone, Copy)]
enum ContentAlgorithm {
    Cbc(Cipher),
    Gcm(Cipher),
}

fn content_algorithm(uri: &str) -> Result<ContentAlgorithm, EncryptionError> {
    match uri {
        "http://www.w3.org/2001/04/xmlenc#aes128-cbc" => Ok(ContentAlgorithm::Cbc(Cipher::aes_128_cbc())),
        "http://www.w3.org/2001/04/xmlenc#aes192-cbc" => Ok(ContentAlgorithm::Cbc(Cipher::aes_192_cbc())),
        "http://www.w3.org/2001/04/xmlenc#aes256-cbc" => Ok(ContentAlgorithm::Cbc(Cipher::aes_256_cbc())),
        "http://www.w3.org/2009/xmlenc11#aes128-gcm" => Ok(ContentAlgorithm::Gcm(Cipher::aes_128_gcm())),
        "http://www.w3.org/2009/xmlenc11#aes192-gcm" => Ok(ContentAlgorithm::Gcm(Cipher::aes_192_gcm())),
        "http://www.w3.org/2009/xmlenc11#aes256-gcm" => Ok(ContentAlgorithm::Gcm(Cipher::aes_256_gcm())),
        other => Err(EncryptionError::Unsupported(other.to_string())),
    }
}

/// Decrypt the single encrypted element held by `container` (an
/// `EncryptedAssertion` or `EncryptedID`). `scope` is the namespace scope
/// the container sits in, used to resolve prefixes the plaintext leaves
/// unbound.
pub fn decrypt_element(
    container: &Element,
    scope: &Scope,
    key: &PKey<Private>,
) -> Result<Element, EncryptionError> {
    let encrypted_data = container
        .child(XENC_NS, "EncryptedData")
        .ok_or(EncryptionError::Missing("EncryptedData"))?;
    let algorithm = encrypted_data
        .child(XENC_NS, "EncryptionMethod")
        .and_then(|m| m.attr("Algorithm"))
        .ok_or(EncryptionError::Missing("EncryptionMethod"))?;
    let algorithm = content_algorithm(algorithm)?;

    let encrypted_key = encrypted_data
        .child(DSIG_NS, "KeyInfo")
        .and_then(|info| info.child(XENC_NS, "EncryptedKey"))
        .or_else(|| container.child(XENC_NS, "EncryptedKey"))
        .ok_or(EncryptionError::Missing("EncryptedKey"))?;
    let content_key = unwrap_key(encrypted_key, key)?;

    let data = cipher_value(encrypted_data)?;
    let plaintext = match algorithm {
        ContentAlgorithm::Cbc(cipher) => decrypt_cbc(cipher, &content_key, &data)?,
        ContentAlgorithm::Gcm(cipher) => decrypt_gcm(cipher, &content_key, &data)?,
    };

    let text = String::from_utf8(plaintext)
        .map_err(|e| EncryptionError::CipherData(format!("plaintext is not UTF-8: {e}")))?;
    let scope = container.extend_scope(scope);
    Ok(xml::parse_in_scope(&text, &scope)?)
}

fn unwrap_key(encrypted_key: &Element, key: &PKey<Private>) -> Result<Vec<u8>, EncryptionError> {
    let method = encrypted_key
        .child(XENC_NS, "EncryptionMethod")
        .ok_or(EncryptionError::Missing("EncryptedKey/EncryptionMethod"))?;
    let algorithm = method
        .attr("Algorithm")
        .ok_or(EncryptionError::Missing("EncryptedKey/EncryptionMethod"))?;
    let wrapped = cipher_value(encrypted_key)?;

    let mut decrypter = Decrypter::new(key).map_err(|_| EncryptionError::KeyTransport)?;
    match algorithm {
        "http://www.w3.org/2001/04/xmlenc#rsa-1_5" => {
            decrypter
                .set_rsa_padding(Padding::PKCS1)
                .map_err(|_| EncryptionError::KeyTransport)?;
        }
        "http://www.w3.org/2001/04/xmlenc#rsa-oaep-mgf1p" | "http://www.w3.org/2009/xmlenc11#rsa-oaep" => {
            decrypter
                .set_rsa_padding(Padding::PKCS1_OAEP)
                .map_err(|_| EncryptionError::KeyTransport)?;
            if let Some(uri) = method.child(DSIG_NS, "DigestMethod").and_then(|d| d.attr("Algorithm")) {
                decrypter
                    .set_rsa_oaep_md(oaep_digest(uri)?)
                    .map_err(|_| EncryptionError::KeyTransport)?;
            }
            if let Some(uri) = method.child(XENC11_NS, "MGF").and_then(|m| m.attr("Algorithm")) {
                decrypter
                    .set_rsa_mgf1_md(mgf_digest(uri)?)
                    .map_err(|_| EncryptionError::KeyTransport)?;
            }
        }
        other => return Err(EncryptionError::Unsupported(other.to_string())),
    }

    let len = decrypter
        .decrypt_len(&wrapped)
        .map_err(|_| EncryptionError::KeyTransport)?;
    let mut content_key = vec![0u8; len];
    let written = decrypter
        .decrypt(&wrapped, &mut content_key)
        .map_err(|_| EncryptionError::KeyTransport)?;
    content_key.truncate(written);
    Ok(content_key)
}

fn oaep_digest(uri: &str) -> Result<MessageDigest, EncryptionError> {
    match uri {
        "http://www.w3.org/2000/09/xmldsig#sha1" => Ok(MessageDigest::sha1()),
        "http://www.w3.org/2001/04/xmlenc#sha256" => Ok(MessageDigest::sha256()),
        "http://www.w3.org/2001/04/xmlenc#sha512" => Ok(MessageDigest::sha512()),
        other => Err(EncryptionError::Unsupported(other.to_string())),
    }
}

fn mgf_digest(uri: &str) -> Result<MessageDigest, EncryptionError> {
    match uri {
        "http://www.w3.org/2009/xmlenc11#mgf1sha1" => Ok(MessageDigest::sha1()),
        "http://www.w3.org/2009/xmlenc11#mgf1sha256" => Ok(MessageDigest::sha256()),
        "http://www.w3.org/2009/xmlenc11#mgf1sha512" => Ok(MessageDigest::sha512()),
        other => Err(EncryptionError::Unsupported(other.to_string())),
    }
}

fn cipher_value(parent: &Element) -> Result<Vec<u8>, EncryptionError> {
    let value = parent
        .child(XENC_NS, "CipherData")
        .and_then(|data| data.child(XENC_NS, "CipherValue"))
        .ok_or(EncryptionError::Missing("CipherData/CipherValue"))?;
    decode_base64(&value.text()).map_err(|e| match e {
        SignatureError::Malformed(message) => EncryptionError::CipherData(message),
        other => EncryptionError::CipherData(other.to_string()),
    })
}

fn check_key_len(cipher: Cipher, key: &[u8]) -> Result<(), EncryptionError> {
    if key.len() != cipher.key_len() {
        return Err(EncryptionError::CipherData(format!(
            "content key is {} bytes, cipher needs {}",
            key.len(),
            cipher.key_len()
        )));
    }
    Ok(())
}

/// AES-CBC with the IV prepended. XML Encryption padding only fixes the last
/// byte (the pad length), so padding is stripped here rather than by OpenSSL.
fn decrypt_cbc(cipher: Cipher, key: &[u8], data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    check_key_len(cipher, key)?;
    let block = cipher.block_size();
    if data.len() < 2 * block || data.len() % block != 0 {
        return Err(EncryptionError::CipherData(
            "CBC ciphertext length is not a whole number of blocks".to_string(),
        ));
    }
    let (iv, body) = data.split_at(block);

    let mut crypter =
        Crypter::new(cipher, Mode::Decrypt, key, Some(iv)).map_err(|_| EncryptionError::Content)?;
    crypter.pad(false);
    let mut plaintext = vec![0u8; body.len() + block];
    let mut written = crypter
        .update(body, &mut plaintext)
        .map_err(|_| EncryptionError::Content)?;
    written += crypter
        .finalize(&mut plaintext[written..])
        .map_err(|_| EncryptionError::Content)?;
    plaintext.truncate(written);

    let pad = plaintext.last().copied().unwrap_or(0) as usize;
    if pad == 0 || pad > block || pad > plaintext.len() {
        return Err(EncryptionError::Content);
    }
    plaintext.truncate(plaintext.len() - pad);
    Ok(plaintext)
}

/// AES-GCM laid out as IV (12 bytes), ciphertext, tag (16 bytes).
fn decrypt_gcm(cipher: Cipher, key: &[u8], data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    check_key_len(cipher, key)?;
    if data.len() < GCM_IV_LEN + GCM_TAG_LEN {
        return Err(EncryptionError::CipherData(
            "GCM ciphertext is too short".to_string(),
        ));
    }
    let (iv, rest) = data.split_at(GCM_IV_LEN);
    let (body, tag) = rest.split_at(rest.len() - GCM_TAG_LEN);
    decrypt_aead(cipher, key, Some(iv), &[], body, tag).map_err(|_| EncryptionError::Content)
}
