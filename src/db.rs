//! Transactional storage on SQL.
//!
//! [`Database`] wraps a connection pool of one database node. Every
//! operation runs inside a [`Tx`], a real database transaction: it commits
//! when the operation returns `Ok` and rolls back otherwise, so an error
//! anywhere undoes every write of the operation.
//!
//! The schema in `sql/schema.sql` only uses TEXT and BIGINT columns and the
//! statements below only use `$N` placeholders and `ON CONFLICT` upserts,
//! which keeps one set of queries valid on SQLite and PostgreSQL. Structured
//! values (restrictions, rotation policies, whole flows) are stored as JSON
//! text.
//!
//! Lookups return `Option` for missing rows; "not found" is never an error.

use crate::capabilities::Capabilities;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::mytoken::{MytokenId, ResponseType, Rotation};
use crate::network::ClientMetadata;
use crate::restrictions::Restrictions;
use serde::{Deserialize, Serialize};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{query, AnyPool, Row};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");

/// Identifier of a stored refresh token.
pub type RefreshTokenId = Uuid;

/// An open transaction.
pub type Tx = sqlx::Transaction<'static, sqlx::Any>;

/// The future of one transaction body. It may borrow the transaction but
/// nothing else.
pub type TxFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 't>>;

// ============================================================================
// Rows
// ============================================================================

/// A stored mytoken. The signed token itself is never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MytokenRow {
    pub id: MytokenId,
    pub seq_no: u64,
    pub parent_id: Option<MytokenId>,
    pub root_id: Option<MytokenId>,
    pub rt_id: RefreshTokenId,
    pub name: Option<String>,
    pub created: i64,
    pub last_rotated: i64,
    pub expires_at: i64,
    pub client: ClientMetadata,
    pub oidc_sub: String,
    pub oidc_iss: String,
    pub rotation: Option<Rotation>,
}

impl MytokenRow {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A refresh token, sealed under a per-token random key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptedRefreshToken {
    pub sealed: String,
    pub created: i64,
}

/// The random key of a refresh token, sealed under one mytoken's JWT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionKeyRow {
    pub rt_id: RefreshTokenId,
    pub sealed_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageRow {
    pub usages_at: u64,
    pub usages_other: u64,
}

/// Pending authorization flow, keyed by the hash of its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFlowRow {
    pub issuer: String,
    pub restrictions: Restrictions,
    pub capabilities: Capabilities,
    pub subtoken_capabilities: Option<Capabilities>,
    pub rotation: Option<Rotation>,
    pub name: Option<String>,
    pub response_type: ResponseType,
    pub max_token_len: usize,
    pub native: bool,
    pub pkce_verifier: Option<String>,
    pub consent_updated: bool,
    pub expires_at: i64,
}

/// A proxy token: an opaque code whose hash indexes a sealed JWT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyTokenRow {
    pub sealed_jwt: Option<String>,
    pub mytoken_id: Option<MytokenId>,
}

/// Extra attributes of transfer and polling codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferAttrs {
    pub expires_at: i64,
    /// Revoke the linked mytoken when the code is revoked.
    pub new_mytoken: bool,
    pub response_type: ResponseType,
    pub max_token_len: usize,
    pub consent_declined: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTokenRow {
    pub mytoken_id: MytokenId,
    pub sealed_token: String,
    pub scopes: Vec<String>,
    pub audiences: Vec<String>,
    pub client: ClientMetadata,
    pub created: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRow {
    pub mytoken_id: MytokenId,
    pub event: Event,
    pub comment: String,
    pub client: ClientMetadata,
    pub time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRow {
    pub email: Option<String>,
    pub email_verified: bool,
}

// ============================================================================
// Column conversions
// ============================================================================

fn corrupt(column: &str, e: impl std::fmt::Display) -> Error {
    Error::Storage(format!("corrupt column {}: {}", column, e))
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn get_u64(row: &AnyRow, column: &str) -> Result<u64> {
    let v: i64 = row.try_get(column)?;
    u64::try_from(v).map_err(|e| corrupt(column, e))
}

fn get_usize(row: &AnyRow, column: &str) -> Result<usize> {
    let v: i64 = row.try_get(column)?;
    usize::try_from(v).map_err(|e| corrupt(column, e))
}

fn get_bool(row: &AnyRow, column: &str) -> Result<bool> {
    Ok(row.try_get::<i64, _>(column)? != 0)
}

fn get_id(row: &AnyRow, column: &str) -> Result<MytokenId> {
    let v: String = row.try_get(column)?;
    v.parse().map_err(|e| corrupt(column, e))
}

fn get_opt_id(row: &AnyRow, column: &str) -> Result<Option<MytokenId>> {
    let v: Option<String> = row.try_get(column)?;
    v.map(|s| s.parse().map_err(|e| corrupt(column, e)))
        .transpose()
}

fn get_uuid(row: &AnyRow, column: &str) -> Result<Uuid> {
    let v: String = row.try_get(column)?;
    Uuid::parse_str(&v).map_err(|e| corrupt(column, e))
}

fn get_json<T: serde::de::DeserializeOwned>(row: &AnyRow, column: &str) -> Result<T> {
    let v: String = row.try_get(column)?;
    serde_json::from_str(&v).map_err(|e| corrupt(column, e))
}

fn get_opt_json<T: serde::de::DeserializeOwned>(row: &AnyRow, column: &str) -> Result<Option<T>> {
    let v: Option<String> = row.try_get(column)?;
    v.map(|s| serde_json::from_str(&s).map_err(|e| corrupt(column, e)))
        .transpose()
}

fn get_client(row: &AnyRow) -> Result<ClientMetadata> {
    let ip: String = row.try_get("ip")?;
    Ok(ClientMetadata {
        ip: ip.parse().map_err(|e| corrupt("ip", e))?,
        user_agent: row.try_get("user_agent")?,
    })
}

fn response_type_of(v: &str) -> Result<ResponseType> {
    serde_json::from_value(serde_json::Value::String(v.to_string()))
        .map_err(|e| corrupt("response_type", e))
}

fn opt_json<T: Serialize>(v: Option<&T>) -> Result<Option<String>> {
    v.map(serde_json::to_string).transpose().map_err(Error::from)
}

// ============================================================================
// Mytokens
// ============================================================================

const MYTOKEN_COLUMNS: &str = "id, seq_no, parent_id, root_id, rt_id, name, created, \
     last_rotated, expires_at, ip, user_agent, oidc_sub, oidc_iss, rotation";

fn mytoken_from_row(row: &AnyRow) -> Result<MytokenRow> {
    Ok(MytokenRow {
        id: get_id(row, "id")?,
        seq_no: get_u64(row, "seq_no")?,
        parent_id: get_opt_id(row, "parent_id")?,
        root_id: get_opt_id(row, "root_id")?,
        rt_id: get_uuid(row, "rt_id")?,
        name: row.try_get("name")?,
        created: row.try_get("created")?,
        last_rotated: row.try_get("last_rotated")?,
        expires_at: row.try_get("expires_at")?,
        client: get_client(row)?,
        oidc_sub: row.try_get("oidc_sub")?,
        oidc_iss: row.try_get("oidc_iss")?,
        rotation: get_opt_json(row, "rotation")?,
    })
}

pub async fn insert_mytoken(tx: &mut Tx, row: &MytokenRow) -> Result<()> {
    query(
        "INSERT INTO mytokens (id, seq_no, parent_id, root_id, rt_id, name, created, \
         last_rotated, expires_at, ip, user_agent, oidc_sub, oidc_iss, rotation) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
    .bind(row.id.to_string())
    .bind(to_i64(row.seq_no))
    .bind(row.parent_id.map(|p| p.to_string()))
    .bind(row.root_id.map(|r| r.to_string()))
    .bind(row.rt_id.to_string())
    .bind(row.name.clone())
    .bind(row.created)
    .bind(row.last_rotated)
    .bind(row.expires_at)
    .bind(row.client.ip.to_string())
    .bind(row.client.user_agent.clone())
    .bind(row.oidc_sub.clone())
    .bind(row.oidc_iss.clone())
    .bind(opt_json(row.rotation.as_ref())?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn get_mytoken(tx: &mut Tx, id: &MytokenId) -> Result<Option<MytokenRow>> {
    let sql = format!("SELECT {} FROM mytokens WHERE id = $1", MYTOKEN_COLUMNS);
    query(&sql)
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| mytoken_from_row(&row))
        .transpose()
}

/// Every token of the user identified by issuer and subject.
pub async fn user_mytokens(tx: &mut Tx, oidc_iss: &str, oidc_sub: &str) -> Result<Vec<MytokenRow>> {
    let sql = format!(
        "SELECT {} FROM mytokens WHERE oidc_iss = $1 AND oidc_sub = $2",
        MYTOKEN_COLUMNS
    );
    query(&sql)
        .bind(oidc_iss.to_string())
        .bind(oidc_sub.to_string())
        .fetch_all(&mut **tx)
        .await?
        .iter()
        .map(mytoken_from_row)
        .collect()
}

/// Direct children of `parent`.
pub async fn child_ids(tx: &mut Tx, parent: &MytokenId) -> Result<Vec<MytokenId>> {
    query("SELECT id FROM mytokens WHERE parent_id = $1")
        .bind(parent.to_string())
        .fetch_all(&mut **tx)
        .await?
        .iter()
        .map(|row| get_id(row, "id"))
        .collect()
}

/// Record a new generation. Returns false if the token does not exist.
pub async fn update_generation(tx: &mut Tx, id: &MytokenId, seq_no: u64, now: i64) -> Result<bool> {
    let done = query("UPDATE mytokens SET seq_no = $1, last_rotated = $2 WHERE id = $3")
        .bind(to_i64(seq_no))
        .bind(now)
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(done.rows_affected() > 0)
}

pub async fn set_links(
    tx: &mut Tx,
    id: &MytokenId,
    parent_id: Option<MytokenId>,
    root_id: Option<MytokenId>,
) -> Result<()> {
    query("UPDATE mytokens SET parent_id = $1, root_id = $2 WHERE id = $3")
        .bind(parent_id.map(|p| p.to_string()))
        .bind(root_id.map(|r| r.to_string()))
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn set_root(tx: &mut Tx, id: &MytokenId, root_id: &MytokenId) -> Result<()> {
    query("UPDATE mytokens SET root_id = $1 WHERE id = $2")
        .bind(root_id.to_string())
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Delete a mytoken row and every row that references it.
///
/// Child rows are not touched; callers decide what happens to them.
/// Returns false if there was no such token.
pub async fn delete_mytoken(tx: &mut Tx, id: &MytokenId) -> Result<bool> {
    let id = id.to_string();
    for sql in [
        "DELETE FROM encryption_keys WHERE mytoken_id = $1",
        "DELETE FROM token_usages WHERE mytoken_id = $1",
        "DELETE FROM access_tokens WHERE mytoken_id = $1",
        "DELETE FROM mytoken_events WHERE mytoken_id = $1",
        "UPDATE proxy_tokens SET mytoken_id = NULL WHERE mytoken_id = $1",
    ] {
        query(sql).bind(id.clone()).execute(&mut **tx).await?;
    }
    let done = query("DELETE FROM mytokens WHERE id = $1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(done.rows_affected() > 0)
}

// ============================================================================
// Refresh tokens and their keys
// ============================================================================

pub async fn insert_refresh_token(tx: &mut Tx, id: &RefreshTokenId, rt: &CryptedRefreshToken) -> Result<()> {
    query("INSERT INTO refresh_tokens (id, sealed, created) VALUES ($1, $2, $3)")
        .bind(id.to_string())
        .bind(rt.sealed.clone())
        .bind(rt.created)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn get_refresh_token(tx: &mut Tx, id: &RefreshTokenId) -> Result<Option<CryptedRefreshToken>> {
    let Some(row) = query("SELECT sealed, created FROM refresh_tokens WHERE id = $1")
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await?
    else {
        return Ok(None);
    };
    Ok(Some(CryptedRefreshToken {
        sealed: row.try_get("sealed")?,
        created: row.try_get("created")?,
    }))
}

/// Returns false if there was no such refresh token.
pub async fn update_refresh_token(tx: &mut Tx, id: &RefreshTokenId, sealed: &str) -> Result<bool> {
    let done = query("UPDATE refresh_tokens SET sealed = $1 WHERE id = $2")
        .bind(sealed.to_string())
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(done.rows_affected() > 0)
}

pub async fn delete_refresh_token(tx: &mut Tx, id: &RefreshTokenId) -> Result<()> {
    query("DELETE FROM refresh_tokens WHERE id = $1")
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn insert_encryption_key(tx: &mut Tx, mytoken_id: &MytokenId, key: &EncryptionKeyRow) -> Result<()> {
    query("INSERT INTO encryption_keys (mytoken_id, rt_id, sealed_key) VALUES ($1, $2, $3)")
        .bind(mytoken_id.to_string())
        .bind(key.rt_id.to_string())
        .bind(key.sealed_key.clone())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn get_encryption_key(tx: &mut Tx, mytoken_id: &MytokenId) -> Result<Option<EncryptionKeyRow>> {
    let Some(row) = query("SELECT rt_id, sealed_key FROM encryption_keys WHERE mytoken_id = $1")
        .bind(mytoken_id.to_string())
        .fetch_optional(&mut **tx)
        .await?
    else {
        return Ok(None);
    };
    Ok(Some(EncryptionKeyRow {
        rt_id: get_uuid(&row, "rt_id")?,
        sealed_key: row.try_get("sealed_key")?,
    }))
}

pub async fn update_encryption_key(tx: &mut Tx, mytoken_id: &MytokenId, sealed_key: &str) -> Result<()> {
    query("UPDATE encryption_keys SET sealed_key = $1 WHERE mytoken_id = $2")
        .bind(sealed_key.to_string())
        .bind(mytoken_id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Number of tokens that still reference refresh token `rt_id`.
pub async fn count_rt_references(tx: &mut Tx, rt_id: &RefreshTokenId) -> Result<u64> {
    let row = query("SELECT COUNT(*) AS n FROM encryption_keys WHERE rt_id = $1")
        .bind(rt_id.to_string())
        .fetch_one(&mut **tx)
        .await?;
    get_u64(&row, "n")
}

// ============================================================================
// Usage counters
// ============================================================================

pub async fn get_usage(tx: &mut Tx, mytoken_id: &MytokenId, hash: &str) -> Result<Option<UsageRow>> {
    let Some(row) = query(
        "SELECT usages_at, usages_other FROM token_usages \
         WHERE mytoken_id = $1 AND restriction_hash = $2",
    )
    .bind(mytoken_id.to_string())
    .bind(hash.to_string())
    .fetch_optional(&mut **tx)
    .await?
    else {
        return Ok(None);
    };
    Ok(Some(UsageRow {
        usages_at: get_u64(&row, "usages_at")?,
        usages_other: get_u64(&row, "usages_other")?,
    }))
}

const INCREMENT_AT_SQL: &str = "INSERT INTO token_usages \
     (mytoken_id, restriction_hash, usages_at, usages_other) VALUES ($1, $2, 1, 0) \
     ON CONFLICT (mytoken_id, restriction_hash) \
     DO UPDATE SET usages_at = token_usages.usages_at + 1 \
     WHERE token_usages.usages_at < $3 \
     RETURNING usages_at AS n";

const INCREMENT_OTHER_SQL: &str = "INSERT INTO token_usages \
     (mytoken_id, restriction_hash, usages_at, usages_other) VALUES ($1, $2, 0, 1) \
     ON CONFLICT (mytoken_id, restriction_hash) \
     DO UPDATE SET usages_other = token_usages.usages_other + 1 \
     WHERE token_usages.usages_other < $3 \
     RETURNING usages_other AS n";

/// Count one use in a single upsert, unless the counter already reached
/// `cap`. Returns the new count, or `None` when the cap held.
///
/// The row lock taken by the upsert makes a concurrent increment wait and
/// re-check the cap, so two transactions can never both take the last use.
pub async fn increment_usage(
    tx: &mut Tx,
    mytoken_id: &MytokenId,
    hash: &str,
    access_token: bool,
    cap: Option<u64>,
) -> Result<Option<u64>> {
    let sql = if access_token {
        INCREMENT_AT_SQL
    } else {
        INCREMENT_OTHER_SQL
    };
    query(sql)
        .bind(mytoken_id.to_string())
        .bind(hash.to_string())
        .bind(cap.map(to_i64).unwrap_or(i64::MAX))
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| get_u64(&row, "n"))
        .transpose()
}

// ============================================================================
// Authorization flows
// ============================================================================

pub async fn insert_auth_flow(tx: &mut Tx, state_hash: &str, flow: &AuthFlowRow) -> Result<()> {
    query("INSERT INTO auth_flows (state_hash, flow, expires_at) VALUES ($1, $2, $3)")
        .bind(state_hash.to_string())
        .bind(serde_json::to_string(flow)?)
        .bind(flow.expires_at)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn get_auth_flow(tx: &mut Tx, state_hash: &str) -> Result<Option<AuthFlowRow>> {
    query("SELECT flow FROM auth_flows WHERE state_hash = $1")
        .bind(state_hash.to_string())
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| get_json(&row, "flow"))
        .transpose()
}

/// Returns false if the flow is gone.
pub async fn update_auth_flow(tx: &mut Tx, state_hash: &str, flow: &AuthFlowRow) -> Result<bool> {
    let done = query("UPDATE auth_flows SET flow = $1, expires_at = $2 WHERE state_hash = $3")
        .bind(serde_json::to_string(flow)?)
        .bind(flow.expires_at)
        .bind(state_hash.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(done.rows_affected() > 0)
}

/// Returns false if there was nothing to delete. Of two transactions
/// deleting the same flow, exactly one sees true.
pub async fn delete_auth_flow(tx: &mut Tx, state_hash: &str) -> Result<bool> {
    let done = query("DELETE FROM auth_flows WHERE state_hash = $1")
        .bind(state_hash.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(done.rows_affected() > 0)
}

// ============================================================================
// Proxy tokens and transfer attributes
// ============================================================================

pub async fn insert_proxy_token(tx: &mut Tx, id: &str, row: &ProxyTokenRow) -> Result<()> {
    query("INSERT INTO proxy_tokens (id, sealed_jwt, mytoken_id) VALUES ($1, $2, $3)")
        .bind(id.to_string())
        .bind(row.sealed_jwt.clone())
        .bind(row.mytoken_id.map(|m| m.to_string()))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn get_proxy_token(tx: &mut Tx, id: &str) -> Result<Option<ProxyTokenRow>> {
    let Some(row) = query("SELECT sealed_jwt, mytoken_id FROM proxy_tokens WHERE id = $1")
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await?
    else {
        return Ok(None);
    };
    Ok(Some(ProxyTokenRow {
        sealed_jwt: row.try_get("sealed_jwt")?,
        mytoken_id: get_opt_id(&row, "mytoken_id")?,
    }))
}

/// Returns false if there was no such proxy token.
pub async fn update_proxy_token(tx: &mut Tx, id: &str, row: &ProxyTokenRow) -> Result<bool> {
    let done = query("UPDATE proxy_tokens SET sealed_jwt = $1, mytoken_id = $2 WHERE id = $3")
        .bind(row.sealed_jwt.clone())
        .bind(row.mytoken_id.map(|m| m.to_string()))
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(done.rows_affected() > 0)
}

/// Delete a proxy token together with its transfer attributes.
pub async fn delete_proxy_token(tx: &mut Tx, id: &str) -> Result<bool> {
    query("DELETE FROM transfer_attrs WHERE id = $1")
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;
    let done = query("DELETE FROM proxy_tokens WHERE id = $1")
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(done.rows_affected() > 0)
}

pub async fn insert_transfer_attrs(tx: &mut Tx, id: &str, attrs: &TransferAttrs) -> Result<()> {
    query(
        "INSERT INTO transfer_attrs \
         (id, expires_at, new_mytoken, response_type, max_token_len, consent_declined) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(id.to_string())
    .bind(attrs.expires_at)
    .bind(i64::from(attrs.new_mytoken))
    .bind(attrs.response_type.as_str().to_string())
    .bind(i64::try_from(attrs.max_token_len).unwrap_or(i64::MAX))
    .bind(i64::from(attrs.consent_declined))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn get_transfer_attrs(tx: &mut Tx, id: &str) -> Result<Option<TransferAttrs>> {
    let Some(row) = query(
        "SELECT expires_at, new_mytoken, response_type, max_token_len, consent_declined \
         FROM transfer_attrs WHERE id = $1",
    )
    .bind(id.to_string())
    .fetch_optional(&mut **tx)
    .await?
    else {
        return Ok(None);
    };
    let response_type: String = row.try_get("response_type")?;
    Ok(Some(TransferAttrs {
        expires_at: row.try_get("expires_at")?,
        new_mytoken: get_bool(&row, "new_mytoken")?,
        response_type: response_type_of(&response_type)?,
        max_token_len: get_usize(&row, "max_token_len")?,
        consent_declined: get_bool(&row, "consent_declined")?,
    }))
}

pub async fn decline_transfer_attrs(tx: &mut Tx, id: &str) -> Result<()> {
    query("UPDATE transfer_attrs SET consent_declined = 1 WHERE id = $1")
        .bind(id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

// ============================================================================
// Access tokens, events and users
// ============================================================================

pub async fn insert_access_token(tx: &mut Tx, at: &AccessTokenRow) -> Result<()> {
    query(
        "INSERT INTO access_tokens \
         (mytoken_id, sealed_token, scopes, audiences, ip, user_agent, created) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(at.mytoken_id.to_string())
    .bind(at.sealed_token.clone())
    .bind(at.scopes.join(" "))
    .bind(serde_json::to_string(&at.audiences)?)
    .bind(at.client.ip.to_string())
    .bind(at.client.user_agent.clone())
    .bind(at.created)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn access_token_from_row(row: &AnyRow) -> Result<AccessTokenRow> {
    let scopes: String = row.try_get("scopes")?;
    Ok(AccessTokenRow {
        mytoken_id: get_id(row, "mytoken_id")?,
        sealed_token: row.try_get("sealed_token")?,
        scopes: scopes.split_whitespace().map(str::to_string).collect(),
        audiences: get_json(row, "audiences")?,
        client: get_client(row)?,
        created: row.try_get("created")?,
    })
}

/// Append an event. Events of one token are numbered in insertion order.
pub async fn insert_event(tx: &mut Tx, event: &EventRow) -> Result<()> {
    query(
        "INSERT INTO mytoken_events \
         (mytoken_id, seq, event, comment, ip, user_agent, created) \
         SELECT $1, COALESCE(MAX(seq), 0) + 1, $2, $3, $4, $5, $6 \
         FROM mytoken_events WHERE mytoken_id = $1",
    )
    .bind(event.mytoken_id.to_string())
    .bind(event.event.as_str().to_string())
    .bind(event.comment.clone())
    .bind(event.client.ip.to_string())
    .bind(event.client.user_agent.clone())
    .bind(event.time)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn event_from_row(row: &AnyRow) -> Result<EventRow> {
    let event: String = row.try_get("event")?;
    Ok(EventRow {
        mytoken_id: get_id(row, "mytoken_id")?,
        event: serde_json::from_value(serde_json::Value::String(event))
            .map_err(|e| corrupt("event", e))?,
        comment: row.try_get("comment")?,
        client: get_client(row)?,
        time: row.try_get("created")?,
    })
}

/// Events of `mytoken_id`, oldest first.
pub async fn events_of(tx: &mut Tx, mytoken_id: &MytokenId) -> Result<Vec<EventRow>> {
    query(
        "SELECT mytoken_id, event, comment, ip, user_agent, created FROM mytoken_events \
         WHERE mytoken_id = $1 ORDER BY created, seq",
    )
    .bind(mytoken_id.to_string())
    .fetch_all(&mut **tx)
    .await?
    .iter()
    .map(event_from_row)
    .collect()
}

/// Create the user on first login, and fill in the email once it is known.
pub async fn upsert_user(tx: &mut Tx, iss: &str, sub: &str, user: &UserRow) -> Result<()> {
    query(
        "INSERT INTO users (iss, sub, email, email_verified) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (iss, sub) DO UPDATE \
         SET email = excluded.email, email_verified = excluded.email_verified \
         WHERE users.email IS NULL",
    )
    .bind(iss.to_string())
    .bind(sub.to_string())
    .bind(user.email.clone())
    .bind(i64::from(user.email_verified))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ============================================================================
// Expiry
// ============================================================================

/// Rows removed by [`purge_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Purged {
    pub auth_flows: u64,
    pub codes: u64,
}

/// Delete authorization flows and transfer or polling codes that expired
/// before `now`.
pub async fn purge_expired(tx: &mut Tx, now: i64) -> Result<Purged> {
    let auth_flows = query("DELETE FROM auth_flows WHERE expires_at < $1")
        .bind(now)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    let codes = query(
        "DELETE FROM proxy_tokens WHERE id IN \
         (SELECT id FROM transfer_attrs WHERE expires_at < $1)",
    )
    .bind(now)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    query("DELETE FROM transfer_attrs WHERE expires_at < $1")
        .bind(now)
        .execute(&mut **tx)
        .await?;
    Ok(Purged { auth_flows, codes })
}

// ============================================================================
// Database
// ============================================================================

/// Connection pool settings of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// The database of one node.
#[derive(Debug, Clone)]
pub struct Database {
    pool: AnyPool,
}

impl Database {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    /// Open a pool to `url` (`sqlite:...` or `postgres://...`).
    ///
    /// Any failure to reach the node is reported as
    /// [`Error::ConnectionDead`].
    pub async fn connect(url: &str, settings: PoolSettings) -> Result<Self> {
        sqlx::any::install_default_drivers();
        let mut options = AnyPoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .acquire_timeout(settings.acquire_timeout);
        if is_in_memory(url) {
            // Every new connection would open a fresh, empty database, and
            // the one there is lives only as long as its connection.
            options = options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = options
            .connect(url)
            .await
            .map_err(|e| Error::ConnectionDead(e.to_string()))?;
        Ok(Self { pool })
    }

    /// A private in-memory SQLite database with the schema applied.
    pub async fn in_memory() -> Result<Self> {
        let db = Self::connect("sqlite::memory:", PoolSettings::default()).await?;
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Create missing tables and indexes.
    pub async fn migrate(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        for statement in SCHEMA_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            query(statement).execute(&mut *conn).await?;
        }
        debug!("Database schema applied");
        Ok(())
    }

    /// Cheap liveness check.
    pub async fn ping(&self) -> Result<()> {
        query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close_pool(&self) {
        self.pool.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub async fn begin(&self) -> Result<Tx> {
        Ok(self.pool.begin().await?)
    }

    /// Run `f` in a transaction. Writes are committed only if `f` succeeds.
    pub async fn transact<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut Tx) -> TxFuture<'t, T> + Send,
    {
        let mut tx = self.begin().await?;
        match f(&mut tx).await {
            Ok(out) => {
                tx.commit().await?;
                Ok(out)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    debug!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Read every table. Meant for inspection and tests.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let mut tx = self.begin().await?;
        let snapshot = Snapshot::load(&mut tx).await?;
        tx.commit().await?;
        Ok(snapshot)
    }
}

fn is_in_memory(url: &str) -> bool {
    url.starts_with("sqlite::memory:") || url.contains("mode=memory")
}

// ============================================================================
// Snapshot
// ============================================================================

/// The complete content of a database at one point in time.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub mytokens: HashMap<MytokenId, MytokenRow>,
    pub refresh_tokens: HashMap<RefreshTokenId, CryptedRefreshToken>,
    pub encryption_keys: HashMap<MytokenId, EncryptionKeyRow>,
    /// Keyed by (token, restriction hash).
    pub usages: HashMap<(MytokenId, String), UsageRow>,
    pub auth_flows: HashMap<String, AuthFlowRow>,
    pub proxy_tokens: HashMap<String, ProxyTokenRow>,
    pub transfer_attrs: HashMap<String, TransferAttrs>,
    pub access_tokens: Vec<AccessTokenRow>,
    /// Oldest first.
    pub events: Vec<EventRow>,
    /// Keyed by (issuer, subject).
    pub users: HashMap<(String, String), UserRow>,
}

impl Snapshot {
    async fn load(tx: &mut Tx) -> Result<Self> {
        let mut s = Snapshot::default();

        let sql = format!("SELECT {} FROM mytokens", MYTOKEN_COLUMNS);
        for row in query(&sql).fetch_all(&mut **tx).await? {
            let mt = mytoken_from_row(&row)?;
            s.mytokens.insert(mt.id, mt);
        }
        for row in query("SELECT id FROM refresh_tokens").fetch_all(&mut **tx).await? {
            let id = get_uuid(&row, "id")?;
            if let Some(rt) = get_refresh_token(tx, &id).await? {
                s.refresh_tokens.insert(id, rt);
            }
        }
        for row in query("SELECT mytoken_id FROM encryption_keys").fetch_all(&mut **tx).await? {
            let id = get_id(&row, "mytoken_id")?;
            if let Some(key) = get_encryption_key(tx, &id).await? {
                s.encryption_keys.insert(id, key);
            }
        }
        for row in query("SELECT mytoken_id, restriction_hash, usages_at, usages_other FROM token_usages")
            .fetch_all(&mut **tx)
            .await?
        {
            s.usages.insert(
                (get_id(&row, "mytoken_id")?, row.try_get("restriction_hash")?),
                UsageRow {
                    usages_at: get_u64(&row, "usages_at")?,
                    usages_other: get_u64(&row, "usages_other")?,
                },
            );
        }
        for row in query("SELECT state_hash, flow FROM auth_flows").fetch_all(&mut **tx).await? {
            s.auth_flows.insert(row.try_get("state_hash")?, get_json(&row, "flow")?);
        }
        for row in query("SELECT id FROM proxy_tokens").fetch_all(&mut **tx).await? {
            let id: String = row.try_get("id")?;
            if let Some(pt) = get_proxy_token(tx, &id).await? {
                s.proxy_tokens.insert(id, pt);
            }
        }
        for row in query("SELECT id FROM transfer_attrs").fetch_all(&mut **tx).await? {
            let id: String = row.try_get("id")?;
            if let Some(attrs) = get_transfer_attrs(tx, &id).await? {
                s.transfer_attrs.insert(id, attrs);
            }
        }
        s.access_tokens = query(
            "SELECT mytoken_id, sealed_token, scopes, audiences, ip, user_agent, created \
             FROM access_tokens ORDER BY created",
        )
        .fetch_all(&mut **tx)
        .await?
        .iter()
        .map(access_token_from_row)
        .collect::<Result<_>>()?;
        s.events = query(
            "SELECT mytoken_id, event, comment, ip, user_agent, created FROM mytoken_events \
             ORDER BY created, seq",
        )
        .fetch_all(&mut **tx)
        .await?
        .iter()
        .map(event_from_row)
        .collect::<Result<_>>()?;
        for row in query("SELECT iss, sub, email, email_verified FROM users")
            .fetch_all(&mut **tx)
            .await?
        {
            s.users.insert(
                (row.try_get("iss")?, row.try_get("sub")?),
                UserRow {
                    email: row.try_get("email")?,
                    email_verified: get_bool(&row, "email_verified")?,
                },
            );
        }
        Ok(s)
    }
}
