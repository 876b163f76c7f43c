//! OIDC state, consent codes and PKCE.
//!
//! A flow starts with a random consent code shown to the user. The OIDC
//! `state` is derived from it, so the server can find the flow from either
//! one without storing both. Both carry a two-character suffix with the
//! flow's [`StateInfo`]. Flows are stored under the hash of the state, and
//! a native flow's polling code is derived from the state under a server
//! secret.

use crate::crypto::{hmac_sha256, random_string, sha256_b64, sha512_hex};
use crate::error::{Error, Result};
use crate::mytoken::ResponseType;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::fmt;

const CONSENT_RANDOM_LEN: usize = 8;
const STATE_PREFIX_LEN: usize = 16;
const INFO_LEN: usize = 2;
/// Length of a PKCE code verifier.
pub const PKCE_VERIFIER_LEN: usize = 44;

/// Flow properties encoded into consent codes and states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateInfo {
    pub native: bool,
    pub response_type: ResponseType,
}

impl StateInfo {
    pub fn encode(&self) -> String {
        let mut s = String::with_capacity(INFO_LEN);
        s.push(if self.native { '1' } else { '0' });
        s.push(self.response_type.code());
        s
    }

    pub fn decode(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        let native = match chars.next() {
            Some('1') => true,
            Some('0') => false,
            _ => return Err(Error::InvalidRequest("malformed state info".into())),
        };
        let response_type = chars
            .next()
            .and_then(ResponseType::from_code)
            .ok_or_else(|| Error::InvalidRequest("malformed state info".into()))?;
        if chars.next().is_some() {
            return Err(Error::InvalidRequest("malformed state info".into()));
        }
        Ok(Self {
            native,
            response_type,
        })
    }
}

fn split_info(s: &str) -> Result<(&str, StateInfo)> {
    if s.len() <= INFO_LEN || !s.is_ascii() {
        return Err(Error::InvalidRequest("code too short".into()));
    }
    let (head, info) = s.split_at(s.len() - INFO_LEN);
    Ok((head, StateInfo::decode(info)?))
}

// ============================================================================
// Consent code
// ============================================================================

/// The code in the consent URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentCode {
    random: String,
    info: StateInfo,
}

impl ConsentCode {
    pub fn new(info: StateInfo) -> Self {
        Self {
            random: random_string(CONSENT_RANDOM_LEN),
            info,
        }
    }

    pub fn parse(code: &str) -> Result<Self> {
        let (random, info) = split_info(code)?;
        if random.len() != CONSENT_RANDOM_LEN {
            return Err(Error::InvalidRequest("malformed consent code".into()));
        }
        Ok(Self {
            random: random.to_string(),
            info,
        })
    }

    pub fn info(&self) -> StateInfo {
        self.info
    }

    /// The OIDC state belonging to this code.
    pub fn state(&self) -> Result<State> {
        let mac = hmac_sha256(b"state", self.random.as_bytes())?;
        let mut s = hex::encode(mac);
        s.truncate(STATE_PREFIX_LEN);
        s.push_str(&self.info.encode());
        Ok(State(s))
    }
}

impl fmt::Display for ConsentCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.random, self.info.encode())
    }
}

// ============================================================================
// State
// ============================================================================

/// The OIDC `state` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct State(String);

impl State {
    /// A fresh state with its consent code.
    pub fn create(info: StateInfo) -> Result<(State, ConsentCode)> {
        let cc = ConsentCode::new(info);
        Ok((cc.state()?, cc))
    }

    pub fn parse(state: &str) -> Result<Self> {
        split_info(state)?;
        Ok(Self(state.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Storage key of the flow.
    pub fn hash(&self) -> String {
        sha512_hex(self.0.as_bytes())
    }

    pub fn info(&self) -> Result<StateInfo> {
        Ok(split_info(&self.0)?.1)
    }

    /// The polling code of a native flow with this state.
    pub fn polling_code(&self, secret: &[u8], len: usize) -> Result<String> {
        let mut code = URL_SAFE_NO_PAD.encode(hmac_sha256(secret, self.0.as_bytes())?);
        code.truncate(len);
        Ok(code)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// PKCE
// ============================================================================

/// A PKCE code verifier (S256).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceVerifier(String);

impl PkceVerifier {
    pub fn generate() -> Self {
        Self(random_string(PKCE_VERIFIER_LEN))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn challenge(&self) -> String {
        sha256_b64(self.0.as_bytes())
    }
}

/// The PKCE method used for every flow.
pub const PKCE_METHOD: &str = "S256";
