//! The mytoken itself: claims, signing, parsing and rotation.
//!
//! A mytoken is a signed set of claims ([`Mytoken`]) that references a
//! stored row by its `jti`. Bounds (`exp`, `nbf`) are computed once from the
//! restriction set at creation; only rotation changes them afterwards.
//!
//! # Example
//!
//! ```rust,ignore
//! let mt = Mytoken::new(NewMytoken { oidc_sub, oidc_iss, .. }, &issuer_url, now);
//! let jwt = mt.to_jwt(&signing_key)?;
//! let back = Mytoken::parse(&jwt, &signing_key.public_key(), &issuer_url, now)?;
//! ```

use crate::capabilities::{Capabilities, CAPABILITY_CREATE_MYTOKEN};
use crate::crypto::{sha256_b64, PublicKey, SigningKey};
use crate::error::{Error, Result};
use crate::restrictions::Restrictions;
use crate::wire;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

// ============================================================================
// Identifiers and policies
// ============================================================================

/// Unique identifier of a mytoken (`jti`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MytokenId(Uuid);

impl MytokenId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MytokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MytokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MytokenId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidToken(format!("invalid token id: {}", e)))
    }
}

/// Refresh-token rotation policy of a mytoken.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rotation {
    /// Rotate whenever an access token is obtained.
    #[serde(rename = "on_AT", alias = "on_at", default, skip_serializing_if = "is_false")]
    pub on_at: bool,
    /// Rotate on every other use.
    #[serde(default, skip_serializing_if = "is_false")]
    pub on_other: bool,
    /// Seconds a rotated token stays valid; 0 means unlimited.
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub lifetime: u64,
    /// Revoke the whole token when an old generation is replayed.
    #[serde(default, skip_serializing_if = "is_false")]
    pub auto_revoke: bool,
}

impl Rotation {
    pub fn is_enabled(&self) -> bool {
        self.on_at || self.on_other
    }
}

/// How a minted token is handed to the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    #[default]
    Token,
    ShortToken,
    TransferCode,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Token => "token",
            ResponseType::ShortToken => "short_token",
            ResponseType::TransferCode => "transfer_code",
        }
    }

    /// One-character code used inside state suffixes.
    pub fn code(&self) -> char {
        match self {
            ResponseType::Token => '0',
            ResponseType::ShortToken => '1',
            ResponseType::TransferCode => '2',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        match c {
            '0' => Some(ResponseType::Token),
            '1' => Some(ResponseType::ShortToken),
            '2' => Some(ResponseType::TransferCode),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable subject of a user across tokens.
pub fn create_subject(oidc_sub: &str, oidc_iss: &str) -> String {
    sha256_b64(format!("{}@{}", oidc_sub, oidc_iss).as_bytes())
}

// ============================================================================
// Mytoken
// ============================================================================

/// The claims of a mytoken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mytoken {
    #[serde(rename = "iss")]
    pub issuer: String,
    #[serde(rename = "sub")]
    pub subject: String,
    #[serde(rename = "exp", default, skip_serializing_if = "is_zero_i64")]
    pub expires_at: i64,
    #[serde(rename = "nbf", default)]
    pub not_before: i64,
    #[serde(rename = "iat")]
    pub issued_at: i64,
    #[serde(rename = "jti")]
    pub id: MytokenId,
    pub seq_no: u64,
    #[serde(rename = "aud")]
    pub audience: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub oidc_sub: String,
    pub oidc_iss: String,
    #[serde(default, skip_serializing_if = "Restrictions::is_empty")]
    pub restrictions: Restrictions,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtoken_capabilities: Option<Capabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
}

/// Inputs for [`Mytoken::new`].
#[derive(Debug, Clone, Default)]
pub struct NewMytoken {
    pub oidc_sub: String,
    pub oidc_iss: String,
    pub name: Option<String>,
    pub restrictions: Restrictions,
    pub capabilities: Capabilities,
    pub subtoken_capabilities: Option<Capabilities>,
    pub rotation: Option<Rotation>,
}

impl Mytoken {
    /// Mint fresh claims. `issuer_url` is both `iss` and `aud`.
    pub fn new(params: NewMytoken, issuer_url: &str, now: i64) -> Self {
        let restrictions = params.restrictions;
        let nbf = restrictions.not_before();
        // Only a child that may delegate carries a delegation ceiling.
        let subtoken_capabilities = params
            .subtoken_capabilities
            .filter(|_| params.capabilities.has(CAPABILITY_CREATE_MYTOKEN));
        Self {
            issuer: issuer_url.to_string(),
            subject: create_subject(&params.oidc_sub, &params.oidc_iss),
            expires_at: restrictions.expires_at(),
            not_before: if nbf > now { nbf } else { now },
            issued_at: now,
            id: MytokenId::new(),
            seq_no: 1,
            audience: issuer_url.to_string(),
            name: params.name,
            oidc_sub: params.oidc_sub,
            oidc_iss: params.oidc_iss,
            restrictions,
            capabilities: params.capabilities,
            subtoken_capabilities,
            rotation: params.rotation,
        }
    }

    /// Sign the claims.
    pub fn to_jwt(&self, key: &SigningKey) -> Result<String> {
        wire::encode(self, key)
    }

    /// Verify `jwt` and its claims.
    pub fn parse(jwt: &str, key: &PublicKey, issuer_url: &str, now: i64) -> Result<Self> {
        let mt: Mytoken = wire::decode(jwt, key)?;
        if mt.issuer != issuer_url {
            return Err(Error::InvalidToken("invalid issuer".into()));
        }
        if mt.audience != issuer_url {
            return Err(Error::InvalidToken("invalid audience".into()));
        }
        if mt.expires_at != 0 && now > mt.expires_at {
            return Err(Error::InvalidToken("token is expired".into()));
        }
        if now < mt.not_before {
            return Err(Error::InvalidToken("token is not yet valid".into()));
        }
        if mt.subject != create_subject(&mt.oidc_sub, &mt.oidc_iss) {
            return Err(Error::InvalidToken("invalid subject".into()));
        }
        Ok(mt)
    }

    /// The next generation of this token.
    pub fn rotate(&self, now: i64) -> Self {
        let mut rotated = self.clone();
        rotated.seq_no += 1;
        rotated.issued_at = now;
        rotated.not_before = now;
        if let Some(lifetime) = self.rotation.as_ref().map(|r| r.lifetime).filter(|l| *l > 0) {
            rotated.expires_at = now.saturating_add(i64::try_from(lifetime).unwrap_or(i64::MAX));
        }
        rotated
    }

    /// Seconds until expiry, 0 if unbounded or already expired.
    pub fn expires_in(&self, now: i64) -> u64 {
        if self.expires_at > now {
            (self.expires_at - now) as u64
        } else {
            0
        }
    }

    /// Require every capability in `required`.
    pub fn verify_capabilities(&self, required: &[&str]) -> Result<()> {
        match required.iter().find(|c| !self.capabilities.has(c)) {
            Some(missing) => Err(Error::InsufficientCapabilities(missing.to_string())),
            None => Ok(()),
        }
    }

    pub fn rotates_on_at(&self) -> bool {
        self.rotation.as_ref().is_some_and(|r| r.on_at)
    }

    pub fn rotates_on_other(&self) -> bool {
        self.rotation.as_ref().is_some_and(|r| r.on_other)
    }
}
