//! Compact JWS encoding for mytokens.
//!
//! A mytoken travels as `base64url(header).base64url(claims).base64url(sig)`
//! with an Ed25519 signature over the first two segments. The header type
//! `MT+JWT` keeps mytokens from being confused with other JWTs.
//!
//! ## Security Limits
//!
//! - **Token size**: limited to [`MAX_TOKEN_SIZE`] before any decoding happens

use crate::crypto::{PublicKey, Signature, SigningKey};
use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Maximum accepted size of an encoded token (64 KB).
pub const MAX_TOKEN_SIZE: usize = 64 * 1024;

/// JWS `typ` of a mytoken.
pub const TOKEN_TYPE: &str = "MT+JWT";

/// JWS `alg` for Ed25519.
pub const ALGORITHM: &str = "EdDSA";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

/// Sign `claims` and return the compact serialization.
pub fn encode<T: Serialize>(claims: &T, key: &SigningKey) -> Result<String> {
    let header = Header {
        alg: ALGORITHM.to_string(),
        typ: TOKEN_TYPE.to_string(),
        kid: Some(key.public_key().fingerprint()),
    };
    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{}.{}", header, payload);
    let signature = key.sign(signing_input.as_bytes());
    Ok(format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

fn split(token: &str) -> Result<(&str, &str, &str)> {
    if token.len() > MAX_TOKEN_SIZE {
        return Err(Error::InvalidToken(format!(
            "token size {} exceeds maximum {}",
            token.len(),
            MAX_TOKEN_SIZE
        )));
    }
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() => Ok((h, p, s)),
        _ => Err(Error::InvalidToken("not a compact JWS".into())),
    }
}

fn decode_segment<T: DeserializeOwned>(segment: &str, what: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| Error::InvalidToken(format!("malformed {}: {}", what, e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::InvalidToken(format!("malformed {}: {}", what, e)))
}

/// Verify the signature and header, then decode the claims.
pub fn decode<T: DeserializeOwned>(token: &str, key: &PublicKey) -> Result<T> {
    let (header_b64, payload_b64, sig_b64) = split(token)?;
    let header: Header = decode_segment(header_b64, "header")?;
    if header.alg != ALGORITHM {
        return Err(Error::InvalidToken(format!(
            "unsupported algorithm '{}'",
            header.alg
        )));
    }
    if header.typ != TOKEN_TYPE {
        return Err(Error::InvalidToken(format!("unexpected type '{}'", header.typ)));
    }
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|e| Error::InvalidToken(format!("malformed signature: {}", e)))?;
    let signature = Signature::from_slice(&sig_bytes)?;
    let signing_input_len = header_b64.len() + 1 + payload_b64.len();
    key.verify(token[..signing_input_len].as_bytes(), &signature)?;
    decode_segment(payload_b64, "claims")
}

/// Decode the claims without verifying anything.
///
/// Only for values that were already verified, e.g. tokens read back from
/// the server's own storage.
pub fn decode_unverified<T: DeserializeOwned>(token: &str) -> Result<T> {
    let (_, payload_b64, _) = split(token)?;
    decode_segment(payload_b64, "claims")
}

/// Whether `s` looks like a compact JWS rather than an opaque code.
pub fn is_jws(s: &str) -> bool {
    s.matches('.').count() == 2
}
