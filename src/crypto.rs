//! Cryptographic primitives for mytoken.
//!
//! - Ed25519 keys sign the JWS representation of every mytoken.
//! - AES-256-GCM seals stored secrets (refresh tokens, their per-token keys
//!   and proxied token strings) under a password. The sealing key is derived
//!   with HKDF-SHA256 from the password and a random salt, so the password is
//!   typically a token string the server does not keep.
//! - SHA-512 content hashes identify restrictions and proxy tokens.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey as Ed25519SigningKey, Verifier, VerifyingKey,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use secrecy::{CloneableSecret, ExposeSecret, Secret, Zeroize};
use sha2::{Digest, Sha256, Sha512};

const SEAL_SALT_LEN: usize = 16;
const SEAL_NONCE_LEN: usize = 12;
const SEAL_INFO: &[u8] = b"mytoken-seal-v1";

/// A signing key for mytokens.
///
/// The Ed25519 private key is wrapped in `Secret` so it is zeroized on drop
/// and never printed by `Debug`.
#[derive(Clone)]
pub struct SigningKey {
    signing_key: Secret<Ed25519SigningKeyWrapper>,
}

// ed25519-dalek zeroizes on drop; Zeroize is only needed to satisfy Secret.
struct Ed25519SigningKeyWrapper(Ed25519SigningKey);

impl Clone for Ed25519SigningKeyWrapper {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Zeroize for Ed25519SigningKeyWrapper {
    fn zeroize(&mut self) {}
}

impl CloneableSecret for Ed25519SigningKeyWrapper {}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("signing_key", &"***SECRET***")
            .finish()
    }
}

impl SigningKey {
    /// Generate a new random signing key.
    pub fn generate() -> Self {
        let signing_key = Ed25519SigningKey::generate(&mut OsRng);
        Self {
            signing_key: Secret::new(Ed25519SigningKeyWrapper(signing_key)),
        }
    }

    /// Create a signing key from secret key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = Ed25519SigningKey::from_bytes(bytes);
        Self {
            signing_key: Secret::new(Ed25519SigningKeyWrapper(signing_key)),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.expose_secret().0.verifying_key(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            inner: self.signing_key.expose_secret().0.sign(message),
        }
    }

    /// Create a signing key from a PKCS#8 PEM string.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let signing_key = Ed25519SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| Error::Crypto(format!("invalid PEM: {}", e)))?;
        Ok(Self {
            signing_key: Secret::new(Ed25519SigningKeyWrapper(signing_key)),
        })
    }

    /// Convert the signing key to a PKCS#8 PEM string.
    pub fn to_pem(&self) -> Result<String> {
        self.signing_key
            .expose_secret()
            .0
            .to_pkcs8_pem(LineEnding::LF)
            .map(|s| s.to_string())
            .map_err(|e| Error::Crypto(format!("PEM encoding failed: {}", e)))
    }
}

/// A public key for verifying mytoken signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying_key: VerifyingKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let verifying_key =
            VerifyingKey::from_bytes(bytes).map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(Self { verifying_key })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Short key id (first 16 hex chars), used as the JWS `kid`.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.to_bytes()[..8])
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.verifying_key
            .verify(message, &signature.inner)
            .map_err(|e| Error::SignatureInvalid(e.to_string()))
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        let verifying_key = VerifyingKey::from_public_key_pem(pem)
            .map_err(|e| Error::Crypto(format!("invalid PEM: {}", e)))?;
        Ok(Self { verifying_key })
    }

    pub fn to_pem(&self) -> Result<String> {
        self.verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Crypto(format!("PEM encoding failed: {}", e)))
    }
}

/// An Ed25519 signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    inner: DalekSignature,
}

impl Signature {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let inner = DalekSignature::from_slice(bytes)?;
        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.inner.to_bytes()
    }
}

// ============================================================================
// Sealing
// ============================================================================

fn derive_seal_key(password: &[u8], salt: &[u8]) -> Result<Aes256Gcm> {
    let hk = Hkdf::<Sha256>::new(Some(salt), password);
    let mut okm = [0u8; 32];
    hk.expand(SEAL_INFO, &mut okm)
        .map_err(|e| Error::Crypto(format!("key derivation failed: {}", e)))?;
    let cipher = Aes256Gcm::new_from_slice(&okm)
        .map_err(|e| Error::Crypto(format!("invalid key length: {}", e)));
    okm.zeroize();
    cipher
}

/// Encrypt `plaintext` under `password`.
///
/// Output is base64url of `salt || nonce || ciphertext`.
pub fn seal(plaintext: &[u8], password: &str) -> Result<String> {
    let mut salt = [0u8; SEAL_SALT_LEN];
    let mut nonce = [0u8; SEAL_NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce);

    let cipher = derive_seal_key(password.as_bytes(), &salt)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::Crypto(format!("encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(SEAL_SALT_LEN + SEAL_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(URL_SAFE_NO_PAD.encode(out))
}

/// Decrypt a value produced by [`seal`].
///
/// A wrong password surfaces as a `Crypto` error.
pub fn open(sealed: &str, password: &str) -> Result<Vec<u8>> {
    let raw = URL_SAFE_NO_PAD
        .decode(sealed)
        .map_err(|e| Error::Crypto(format!("malformed sealed value: {}", e)))?;
    if raw.len() < SEAL_SALT_LEN + SEAL_NONCE_LEN {
        return Err(Error::Crypto("sealed value too short".into()));
    }
    let (salt, rest) = raw.split_at(SEAL_SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(SEAL_NONCE_LEN);
    let cipher = derive_seal_key(password.as_bytes(), salt)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Crypto("decryption failed".into()))
}

/// [`seal`] for strings.
pub fn seal_str(plaintext: &str, password: &str) -> Result<String> {
    seal(plaintext.as_bytes(), password)
}

/// [`open`] for strings.
pub fn open_str(sealed: &str, password: &str) -> Result<String> {
    String::from_utf8(open(sealed, password)?)
        .map_err(|e| Error::Crypto(format!("sealed value is not UTF-8: {}", e)))
}

// ============================================================================
// Hashing and randomness
// ============================================================================

/// Hex SHA-512 of `data`.
pub fn sha512_hex(data: &[u8]) -> String {
    hex::encode(Sha512::digest(data))
}

/// Base64url SHA-256 of `data`.
pub fn sha256_b64(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(data))
}

/// HMAC-SHA256 of `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Random alphanumeric string.
pub fn random_string(len: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Constant-time string comparison.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = SigningKey::generate();
        let signature = key.sign(b"header.payload");
        assert!(key.public_key().verify(b"header.payload", &signature).is_ok());
        assert!(key.public_key().verify(b"header.payloaX", &signature).is_err());
        assert!(SigningKey::generate()
            .public_key()
            .verify(b"header.payload", &signature)
            .is_err());
    }

    #[test]
    fn test_pem_round_trip_keeps_public_key() {
        let key = SigningKey::generate();
        let pem = key.to_pem().unwrap();
        assert!(pem.contains("PRIVATE KEY"));
        let restored = SigningKey::from_pem(&pem).unwrap();
        assert_eq!(key.public_key(), restored.public_key());
        assert!(SigningKey::from_pem("not a pem").is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = SigningKey::generate();
        assert!(format!("{:?}", key).contains("***SECRET***"));
    }

    #[test]
    fn test_seal_open() {
        let sealed = seal_str("refresh-token-value", "eyJhbGciOi.jwt").unwrap();
        assert!(!sealed.contains("refresh-token-value"));
        assert_eq!(open_str(&sealed, "eyJhbGciOi.jwt").unwrap(), "refresh-token-value");
        assert!(matches!(open_str(&sealed, "wrong"), Err(Error::Crypto(_))));
    }

    #[test]
    fn test_seal_is_randomized() {
        let a = seal_str("x", "pw").unwrap();
        let b = seal_str("x", "pw").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_rejects_garbage() {
        assert!(open("!!!", "pw").is_err());
        assert!(open("AAAA", "pw").is_err());
    }

    #[test]
    fn test_random_string() {
        let s = random_string(44);
        assert_eq!(s.len(), 44);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(s, random_string(44));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
