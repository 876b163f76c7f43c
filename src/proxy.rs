//! Proxy tokens: opaque codes standing in for a mytoken JWT.
//!
//! A proxy token is a random string. The server indexes it by its SHA-512
//! hash and stores the JWT sealed under the string itself, so the storage
//! alone never reveals the JWT. Three kinds share this mechanism:
//!
//! - [`ShortToken`]: a compact replacement for a long JWT
//! - [`TransferCode`]: a one-time, expiring code to move a token elsewhere
//! - [`PollingCode`]: a transfer code created before its token exists, used
//!   by native clients that poll until the authorization flow completes

use crate::crypto::{open_str, random_string, seal_str, sha512_hex};
use crate::db::{self, ProxyTokenRow, TransferAttrs, Tx};
use crate::error::{Error, Result};
use crate::mytoken::{MytokenId, ResponseType};
use tracing::debug;

// ============================================================================
// Proxy token
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProxyToken {
    id: String,
    token: String,
    mytoken_id: Option<MytokenId>,
    sealed_jwt: Option<String>,
    jwt: Option<String>,
}

impl ProxyToken {
    pub fn generate(len: usize) -> Self {
        Self::from_code(random_string(len))
    }

    /// Wrap an existing code string.
    pub fn from_code(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            id: sha512_hex(token.as_bytes()),
            token,
            mytoken_id: None,
            sealed_jwt: None,
            jwt: None,
        }
    }

    /// Storage key.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The code handed to the client.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn mytoken_id(&self) -> Option<MytokenId> {
        self.mytoken_id
    }

    pub fn set_jwt(&mut self, jwt: &str, mytoken_id: MytokenId) -> Result<()> {
        self.sealed_jwt = Some(seal_str(jwt, &self.token)?);
        self.jwt = Some(jwt.to_string());
        self.mytoken_id = Some(mytoken_id);
        Ok(())
    }

    /// The linked JWT, loading it from storage if needed.
    ///
    /// `None` if the code is unknown or not linked to a token yet.
    pub async fn jwt(&mut self, tx: &mut Tx) -> Result<Option<String>> {
        if let Some(jwt) = &self.jwt {
            return Ok(Some(jwt.clone()));
        }
        if self.sealed_jwt.is_none() {
            let Some(row) = db::get_proxy_token(tx, &self.id).await? else {
                return Ok(None);
            };
            self.sealed_jwt = row.sealed_jwt;
            self.mytoken_id = row.mytoken_id;
        }
        let Some(sealed) = &self.sealed_jwt else {
            return Ok(None);
        };
        let jwt = open_str(sealed, &self.token)?;
        self.jwt = Some(jwt.clone());
        Ok(Some(jwt))
    }

    fn row(&self) -> ProxyTokenRow {
        ProxyTokenRow {
            sealed_jwt: self.sealed_jwt.clone(),
            mytoken_id: self.mytoken_id,
        }
    }

    pub async fn store(&self, tx: &mut Tx) -> Result<()> {
        db::insert_proxy_token(tx, &self.id, &self.row()).await
    }

    /// Update the linked JWT of an already stored code.
    pub async fn update(&self, tx: &mut Tx) -> Result<()> {
        if db::update_proxy_token(tx, &self.id, &self.row()).await? {
            Ok(())
        } else {
            Err(Error::BadCode)
        }
    }

    /// Returns false if the code was already gone.
    pub async fn delete(&self, tx: &mut Tx) -> Result<bool> {
        db::delete_proxy_token(tx, &self.id).await
    }
}

// ============================================================================
// Short tokens
// ============================================================================

/// A short replacement for a long mytoken JWT.
#[derive(Debug, Clone)]
pub struct ShortToken(ProxyToken);

impl ShortToken {
    pub fn new(jwt: &str, mytoken_id: MytokenId, len: usize) -> Result<Self> {
        let mut pt = ProxyToken::generate(len);
        pt.set_jwt(jwt, mytoken_id)?;
        Ok(Self(pt))
    }

    pub fn parse(token: &str) -> Self {
        Self(ProxyToken::from_code(token))
    }

    pub fn token(&self) -> &str {
        self.0.token()
    }

    pub async fn jwt(&mut self, tx: &mut Tx) -> Result<Option<String>> {
        self.0.jwt(tx).await
    }

    /// The JWT, if this short token was created in this process.
    pub fn cached_jwt(&self) -> Option<&str> {
        self.0.jwt.as_deref()
    }

    pub async fn store(&self, tx: &mut Tx) -> Result<()> {
        self.0.store(tx).await
    }

    /// Point a stored short token at a new JWT, e.g. after rotation.
    pub async fn update_jwt(&mut self, tx: &mut Tx, jwt: &str, mytoken_id: MytokenId) -> Result<()> {
        self.0.set_jwt(jwt, mytoken_id)?;
        self.0.update(tx).await
    }
}

// ============================================================================
// Transfer and polling codes
// ============================================================================

fn expiry(now: i64, expires_after: u64) -> i64 {
    now.saturating_add(i64::try_from(expires_after).unwrap_or(i64::MAX))
}

/// A one-time code that transfers a mytoken.
#[derive(Debug, Clone)]
pub struct TransferCode {
    proxy: ProxyToken,
    pub attrs: TransferAttrs,
}

impl TransferCode {
    pub fn new(
        jwt: &str,
        mytoken_id: MytokenId,
        new_mytoken: bool,
        response_type: ResponseType,
        len: usize,
        expires_after: u64,
        now: i64,
    ) -> Result<Self> {
        let mut proxy = ProxyToken::generate(len);
        proxy.set_jwt(jwt, mytoken_id)?;
        Ok(Self {
            proxy,
            attrs: TransferAttrs {
                expires_at: expiry(now, expires_after),
                new_mytoken,
                response_type,
                max_token_len: 0,
                consent_declined: false,
            },
        })
    }

    pub fn code(&self) -> &str {
        self.proxy.token()
    }

    pub async fn store(&self, tx: &mut Tx) -> Result<()> {
        self.proxy.store(tx).await?;
        db::insert_transfer_attrs(tx, self.proxy.id(), &self.attrs).await?;
        debug!("Transfer code stored");
        Ok(())
    }
}

/// A polling code, created when a native authorization flow starts.
#[derive(Debug, Clone)]
pub struct PollingCode {
    proxy: ProxyToken,
    pub attrs: TransferAttrs,
}

impl PollingCode {
    pub fn new(code: &str, response_type: ResponseType, max_token_len: usize, expires_after: u64, now: i64) -> Self {
        Self {
            proxy: ProxyToken::from_code(code),
            attrs: TransferAttrs {
                expires_at: expiry(now, expires_after),
                new_mytoken: true,
                response_type,
                max_token_len,
                consent_declined: false,
            },
        }
    }

    pub fn code(&self) -> &str {
        self.proxy.token()
    }

    pub async fn store(&self, tx: &mut Tx) -> Result<()> {
        self.proxy.store(tx).await?;
        db::insert_transfer_attrs(tx, self.proxy.id(), &self.attrs).await
    }
}

/// Stored state of a transfer or polling code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeStatus {
    pub found: bool,
    pub expired: bool,
    pub consent_declined: bool,
    pub response_type: ResponseType,
    pub max_token_len: usize,
}

/// Look up a transfer or polling code.
pub async fn check_code(tx: &mut Tx, code: &str, now: i64) -> Result<CodeStatus> {
    let id = ProxyToken::from_code(code).id;
    if db::get_proxy_token(tx, &id).await?.is_none() {
        return Ok(CodeStatus::default());
    }
    Ok(match db::get_transfer_attrs(tx, &id).await? {
        Some(attrs) => CodeStatus {
            found: true,
            expired: now > attrs.expires_at,
            consent_declined: attrs.consent_declined,
            response_type: attrs.response_type,
            max_token_len: attrs.max_token_len,
        },
        None => CodeStatus::default(),
    })
}

/// Read the linked JWT and delete the code. Nothing is deleted while the
/// code is not linked yet.
///
/// Of two transactions popping the same code, only the one that deletes it
/// gets the JWT.
pub async fn pop_token(tx: &mut Tx, code: &str) -> Result<Option<String>> {
    let mut pt = ProxyToken::from_code(code);
    let Some(jwt) = pt.jwt(tx).await?.filter(|j| !j.is_empty()) else {
        return Ok(None);
    };
    if !pt.delete(tx).await? {
        return Ok(None);
    }
    Ok(Some(jwt))
}

/// The mytoken a code is linked to, without decrypting anything.
pub async fn linked_mytoken(tx: &mut Tx, code: &str) -> Result<Option<MytokenId>> {
    let id = ProxyToken::from_code(code).id;
    Ok(db::get_proxy_token(tx, &id).await?.and_then(|r| r.mytoken_id))
}

/// Link a polling code to its freshly minted token.
pub async fn link_polling_code(tx: &mut Tx, code: &str, jwt: &str, mytoken_id: MytokenId) -> Result<()> {
    let mut pt = ProxyToken::from_code(code);
    pt.set_jwt(jwt, mytoken_id)?;
    pt.update(tx).await
}

/// Mark a polling code as declined by the user.
pub async fn decline_polling_code(tx: &mut Tx, code: &str) -> Result<()> {
    let id = ProxyToken::from_code(code).id;
    db::decline_transfer_attrs(tx, &id).await
}

pub async fn delete_code(tx: &mut Tx, code: &str) -> Result<()> {
    ProxyToken::from_code(code).delete(tx).await?;
    Ok(())
}
