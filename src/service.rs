//! The mytoken service: every operation a client can invoke.
//!
//! [`MytokenService`] owns the database cluster and the current
//! [`Context`]. Each operation takes a snapshot of the context at entry, so
//! a concurrent [`MytokenService::reload`] never changes the configuration
//! under a running request.
//!
//! Token presentation is uniform: a JWT or a short token is resolved,
//! verified and checked for revocation inside the transaction that uses it.

use crate::authcode::{
    self, enforce_provider_lifetime, prepare_restrictions, AuthCodeFlowResponse,
    CodeExchangeOutcome, ConsentInfo, ConsentUpdate, OidcFlowRequest,
};
use crate::capabilities::{
    derive_for_child, Capabilities, CAPABILITY_AT, CAPABILITY_CREATE_MYTOKEN,
    CAPABILITY_LIST_MYTOKENS, CAPABILITY_TOKENINFO_HISTORY, CAPABILITY_TOKENINFO_INTROSPECT,
    CAPABILITY_TOKENINFO_TREE,
};
use crate::cluster::Cluster;
use crate::context::Context;
use crate::crypto::seal_str;
use crate::db::{self, AccessTokenRow, Tx, TxFuture};
use crate::error::{Error, Result};
use crate::event::{history, log_event, Event, EventEntry};
use crate::hierarchy::{
    self, all_trees, is_revoked, record_rotation, revoke_with_refresh_token, store_child,
    subtree, update_refresh_token, MytokenEntryTree, StoreMeta,
};
use crate::mytoken::{Mytoken, NewMytoken, ResponseType, Rotation};
use crate::network::ClientMetadata;
use crate::polling;
use crate::provider::normalize_issuer;
use crate::proxy::{check_code, delete_code, pop_token, ProxyToken, ShortToken, TransferCode};
use crate::response::{token_response, MytokenResponse, TokenUpdate};
use crate::restrictions::{tighten, Restriction, Restrictions};
use crate::usage::{self, used_at, used_other, UsageKind};
use crate::wire::is_jws;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// Grant types accepted at the mytoken endpoint.
pub const GRANT_TYPES: &[&str] = &["oidc_flow", "mytoken", "polling_code", "transfer_code"];

// ============================================================================
// Requests and responses
// ============================================================================

/// A request to the mytoken endpoint, discriminated by `grant_type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "grant_type", rename_all = "snake_case")]
pub enum MytokenRequest {
    OidcFlow(OidcFlowRequest),
    Mytoken(SubtokenRequest),
    PollingCode { polling_code: String },
    TransferCode { transfer_code: String },
}

impl MytokenRequest {
    /// Parse a request body, telling a missing grant type apart from an
    /// unsupported one.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| Error::InvalidRequest(format!("malformed body: {}", e)))?;
        let grant_type = value
            .get("grant_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::InvalidRequest("missing grant_type".into()))?;
        if !GRANT_TYPES.contains(&grant_type) {
            return Err(Error::UnsupportedGrantType(grant_type.to_string()));
        }
        serde_json::from_value(value).map_err(|e| Error::InvalidRequest(e.to_string()))
    }
}

/// Response of the mytoken endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenEndpointResponse {
    Mytoken(MytokenResponse),
    AuthCodeFlow(AuthCodeFlowResponse),
}

/// `grant_type=mytoken`: a child token from a parent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtokenRequest {
    pub mytoken: String,
    #[serde(default, alias = "oidc_issuer")]
    pub issuer: Option<String>,
    #[serde(default)]
    pub restrictions: Restrictions,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
    #[serde(default)]
    pub subtoken_capabilities: Option<Capabilities>,
    #[serde(default)]
    pub rotation: Option<Rotation>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub response_type: ResponseType,
    #[serde(default)]
    pub max_token_len: usize,
    #[serde(default)]
    pub failed_on_restrictions_not_tighter: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessTokenRequest {
    pub mytoken: String,
    #[serde(default, alias = "oidc_issuer")]
    pub issuer: Option<String>,
    /// Space separated.
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub audience: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audiences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_update: Option<TokenUpdate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevocationRequest {
    /// A mytoken JWT, short token, transfer code or polling code.
    pub token: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferCodeRequest {
    pub mytoken: String,
    #[serde(default)]
    pub response_type: ResponseType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCodeResponse {
    pub transfer_code: String,
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_update: Option<TokenUpdate>,
}

/// Which tokeninfo question is asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokeninfoAction {
    Introspect,
    EventHistory,
    SubtokenTree,
    ListMytokens,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokeninfoRequest {
    pub action: TokeninfoAction,
    pub mytoken: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokeninfoBody {
    Introspect { valid: bool, token: Box<Mytoken> },
    History { events: Vec<EventEntry> },
    Tree { mytokens: MytokenEntryTree },
    List { mytokens: Vec<MytokenEntryTree> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokeninfoResponse {
    #[serde(flatten)]
    pub body: TokeninfoBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_update: Option<TokenUpdate>,
}

/// Query parameters of the provider callback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedirectQuery {
    pub state: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

// ============================================================================
// Token presentation
// ============================================================================

/// A verified token as presented by the client.
#[derive(Debug, Clone)]
struct Presented {
    mt: Mytoken,
    jwt: String,
    /// Set when the client presented a short token instead of the JWT.
    short: Option<ShortToken>,
}

async fn parse_presented(ctx: &Context, tx: &mut Tx, token: &str, now: i64) -> Result<Presented> {
    let (jwt, short) = if is_jws(token) {
        (token.to_string(), None)
    } else {
        let mut short = ShortToken::parse(token);
        let jwt = short
            .jwt(tx)
            .await?
            .ok_or_else(|| Error::InvalidToken("unknown short token".into()))?;
        (jwt, Some(short))
    };
    let mt = Mytoken::parse(&jwt, &ctx.public_key, ctx.issuer(), now)?;
    Ok(Presented { mt, jwt, short })
}

/// An older generation of a rotating token was presented while a newer one
/// exists.
async fn is_replay(tx: &mut Tx, mt: &Mytoken) -> Result<bool> {
    if !mt.rotation.as_ref().is_some_and(|r| r.auto_revoke) {
        return Ok(false);
    }
    Ok(hierarchy::get(tx, &mt.id)
        .await?
        .is_some_and(|row| row.seq_no > mt.seq_no))
}

/// Resolve and verify a presented token.
///
/// The outer result aborts the transaction; the inner one is a client
/// error whose side effects (auto-revocation on replay) must commit.
async fn load_token(ctx: &Context, tx: &mut Tx, token: &str, now: i64) -> Result<Result<Presented>> {
    let presented = match parse_presented(ctx, tx, token, now).await {
        Ok(p) => p,
        Err(e) if e.is_internal() => return Err(e),
        Err(e) => return Ok(Err(e)),
    };
    let mt = &presented.mt;
    if !is_revoked(tx, &mt.id, mt.seq_no, mt.rotation.as_ref(), now).await? {
        return Ok(Ok(presented));
    }
    if is_replay(tx, mt).await? {
        let revoked = hierarchy::revoke(tx, &mt.id, true).await?;
        warn!(mytoken_id = %mt.id, seq_no = mt.seq_no, count = revoked.len(), "Replayed rotated mytoken, tree revoked");
    }
    Ok(Err(Error::TokenRevoked))
}

/// The first member of the token's restrictions admitting a use of `kind`
/// for the requested scopes and audiences. `None` for an unrestricted token.
#[allow(clippy::too_many_arguments)]
async fn usable_restriction(
    ctx: &Context,
    tx: &mut Tx,
    mt: &Mytoken,
    kind: UsageKind,
    client: &ClientMetadata,
    scopes: &[String],
    audiences: &[String],
    now: i64,
) -> Result<Option<Restriction>> {
    if mt.restrictions.is_empty() {
        return Ok(None);
    }
    let valid = usage::valid_for(tx, mt.id, &mt.restrictions, kind, client.ip, &ctx.lookups, now)
        .await?
        .with_scopes(scopes)
        .with_audiences(audiences);
    match valid.iter().next() {
        Some(r) => Ok(Some(r.clone())),
        None => Err(Error::UsageRestricted(
            "no restriction admits this usage".into(),
        )),
    }
}

fn check_issuer(mt: &Mytoken, issuer: Option<&str>) -> Result<()> {
    match issuer {
        Some(iss) if !iss.is_empty() && normalize_issuer(iss) != normalize_issuer(&mt.oidc_iss) => {
            Err(Error::InvalidRequest("token not for specified issuer".into()))
        }
        _ => Ok(()),
    }
}

/// Rotate the presented token after a use.
///
/// A client that presented a short token keeps it: the short token is
/// repointed at the new JWT and no update is returned.
async fn rotate_after_use(
    ctx: &Context,
    tx: &mut Tx,
    presented: &mut Presented,
    client: &ClientMetadata,
    now: i64,
) -> Result<Option<TokenUpdate>> {
    if !ctx.config.features.token_rotation.enabled {
        return Ok(None);
    }
    let rotated = presented.mt.rotate(now);
    let jwt = rotated.to_jwt(&ctx.signing_key)?;
    record_rotation(tx, &rotated.id, rotated.seq_no, &presented.jwt, &jwt, now).await?;
    log_event(tx, rotated.id, Event::TokenRotated, "", client, now).await?;
    let update = TokenUpdate {
        mytoken: jwt.clone(),
        expires_in: rotated.expires_in(now),
    };
    let id = rotated.id;
    presented.mt = rotated;
    presented.jwt = jwt;
    match presented.short.as_mut() {
        Some(short) => {
            short.update_jwt(tx, &presented.jwt, id).await?;
            Ok(None)
        }
        None => Ok(Some(update)),
    }
}

/// Count one non-AT use of the presented token and rotate it if its policy
/// asks for that.
async fn use_for_other(
    ctx: &Context,
    tx: &mut Tx,
    presented: &mut Presented,
    client: &ClientMetadata,
    now: i64,
) -> Result<Option<TokenUpdate>> {
    let used = usable_restriction(ctx, tx, &presented.mt, UsageKind::Other, client, &[], &[], now).await?;
    if let Some(r) = &used {
        used_other(tx, presented.mt.id, r).await?;
    }
    if presented.mt.rotates_on_other() {
        rotate_after_use(ctx, tx, presented, client, now).await
    } else {
        Ok(None)
    }
}

fn split_scope(scope: Option<&str>) -> Vec<String> {
    scope
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

impl TokeninfoAction {
    fn requirements(self) -> (&'static str, Event) {
        match self {
            TokeninfoAction::Introspect => (CAPABILITY_TOKENINFO_INTROSPECT, Event::TokeninfoIntrospect),
            TokeninfoAction::EventHistory => (CAPABILITY_TOKENINFO_HISTORY, Event::TokeninfoHistory),
            TokeninfoAction::SubtokenTree => (CAPABILITY_TOKENINFO_TREE, Event::TokeninfoSubtokens),
            TokeninfoAction::ListMytokens => (CAPABILITY_LIST_MYTOKENS, Event::TokeninfoListMytokens),
        }
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct MytokenService {
    context: RwLock<Arc<Context>>,
    cluster: Arc<Cluster>,
}

impl MytokenService {
    pub fn new(context: Context, cluster: Arc<Cluster>) -> Self {
        Self {
            context: RwLock::new(Arc::new(context)),
            cluster,
        }
    }

    /// Snapshot of the current context.
    pub fn context(&self) -> Result<Arc<Context>> {
        self.context
            .read()
            .map(|c| Arc::clone(&c))
            .map_err(|_| Error::Internal("context lock poisoned".into()))
    }

    /// Replace the context. Requests already running keep the old one.
    pub fn reload(&self, context: Context) -> Result<()> {
        let mut guard = self
            .context
            .write()
            .map_err(|_| Error::Internal("context lock poisoned".into()))?;
        *guard = Arc::new(context);
        info!(issuer = %guard.config.issuer, "Context reloaded");
        Ok(())
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Run `f` on the presented token inside one transaction.
    ///
    /// `f` gets the verified token by value and must capture owned values
    /// only; it runs again on the next node after a failover.
    async fn with_token<T, F>(&self, ctx: &Arc<Context>, token: &str, now: i64, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut Tx, Presented) -> TxFuture<'t, T> + Clone + Send + 'static,
    {
        let ctx = Arc::clone(ctx);
        let token = token.to_string();
        self.cluster
            .transact(move |tx| {
                Box::pin(async move {
                    let presented = match load_token(&ctx, tx, &token, now).await? {
                        Ok(p) => p,
                        Err(e) => return Ok(Err(e)),
                    };
                    f(tx, presented).await.map(Ok)
                })
            })
            .await?
    }

    // ------------------------------------------------------------------------
    // Mytoken endpoint
    // ------------------------------------------------------------------------

    /// Dispatch a request to the mytoken endpoint.
    pub async fn handle_token_request(
        &self,
        req: MytokenRequest,
        client: &ClientMetadata,
        now: i64,
    ) -> Result<TokenEndpointResponse> {
        match req {
            MytokenRequest::OidcFlow(req) => self
                .start_oidc_flow(req, client, now)
                .await
                .map(TokenEndpointResponse::AuthCodeFlow),
            MytokenRequest::Mytoken(req) => self
                .create_subtoken(req, client, now)
                .await
                .map(TokenEndpointResponse::Mytoken),
            MytokenRequest::PollingCode { polling_code } => self
                .poll(&polling_code, client, now)
                .await
                .map(TokenEndpointResponse::Mytoken),
            MytokenRequest::TransferCode { transfer_code } => self
                .exchange_transfer_code(&transfer_code, client, now)
                .await
                .map(TokenEndpointResponse::Mytoken),
        }
    }

    pub async fn start_oidc_flow(
        &self,
        req: OidcFlowRequest,
        client: &ClientMetadata,
        now: i64,
    ) -> Result<AuthCodeFlowResponse> {
        let ctx = self.context()?;
        authcode::start_flow(&ctx, &self.cluster, req, client, now).await
    }

    pub async fn poll(&self, polling_code: &str, client: &ClientMetadata, now: i64) -> Result<MytokenResponse> {
        let ctx = self.context()?;
        if !ctx.config.features.polling.enabled {
            return Err(Error::FeatureDisabled("polling codes"));
        }
        polling::poll(&ctx, &self.cluster, polling_code, client, now).await
    }

    pub async fn exchange_transfer_code(
        &self,
        transfer_code: &str,
        client: &ClientMetadata,
        now: i64,
    ) -> Result<MytokenResponse> {
        let ctx = self.context()?;
        polling::exchange_transfer_code(&ctx, &self.cluster, transfer_code, client, now).await
    }

    /// Mint a child token from a parent (`grant_type=mytoken`).
    pub async fn create_subtoken(
        &self,
        mut req: SubtokenRequest,
        client: &ClientMetadata,
        now: i64,
    ) -> Result<MytokenResponse> {
        let ctx = self.context()?;
        let parent = self
            .with_token(&ctx, &req.mytoken, now, |_, p| Box::pin(async move { Ok(p.mt) }))
            .await?;
        parent.verify_capabilities(&[CAPABILITY_CREATE_MYTOKEN])?;
        check_issuer(&parent, req.issuer.as_deref())?;

        let provider = ctx.providers.resolve(&parent.oidc_iss).await?;
        prepare_restrictions(&ctx, &mut req.restrictions, client)?;
        enforce_provider_lifetime(
            provider.as_ref(),
            &mut req.restrictions,
            req.failed_on_restrictions_not_tighter,
            now,
        )?;
        if let Some(c) = &req.capabilities {
            c.validate_known()?;
        }
        if let Some(c) = &req.subtoken_capabilities {
            c.validate_known()?;
        }
        let rotation = req
            .rotation
            .clone()
            .filter(|_| ctx.config.features.token_rotation.enabled);
        let meta = StoreMeta {
            client: client.clone(),
            now,
        };

        let token = req.mytoken.clone();
        let ctx_tx = Arc::clone(&ctx);
        let (response, child_id) = self
            .with_token(&ctx, &token, now, move |tx, mut parent| {
                Box::pin(async move {
                    let (ctx, req, client) = (ctx_tx, req, meta.client.clone());
                    let parent_id = parent.mt.id;
                    if db::get_encryption_key(tx, &parent_id).await?.is_none() {
                        return Err(Error::InvalidToken("token has no refresh token".into()));
                    }
                    let used =
                        usable_restriction(&ctx, tx, &parent.mt, UsageKind::Other, &client, &[], &[], now).await?;

                    let (restrictions, honored) = tighten(&parent.mt.restrictions, &req.restrictions);
                    if !honored && req.failed_on_restrictions_not_tighter {
                        return Err(Error::RestrictionsNotTighter);
                    }
                    let (capabilities, subtoken_capabilities) = derive_for_child(
                        &parent.mt.capabilities,
                        parent.mt.subtoken_capabilities.as_ref(),
                        req.capabilities.as_ref(),
                        req.subtoken_capabilities.as_ref(),
                    );
                    if capabilities.is_empty() {
                        return Err(Error::NoCapabilities);
                    }
                    let child = Mytoken::new(
                        NewMytoken {
                            oidc_sub: parent.mt.oidc_sub.clone(),
                            oidc_iss: parent.mt.oidc_iss.clone(),
                            name: req.name.clone(),
                            restrictions,
                            capabilities,
                            subtoken_capabilities,
                            rotation,
                        },
                        ctx.issuer(),
                        now,
                    );
                    if child.expires_at != 0 && child.expires_at <= now {
                        return Err(Error::AlreadyExpired);
                    }
                    let child_jwt = child.to_jwt(&ctx.signing_key)?;

                    if let Some(r) = &used {
                        used_other(tx, parent_id, r).await?;
                    }
                    store_child(tx, &child, &child_jwt, parent_id, &parent.jwt, &meta).await?;
                    log_event(tx, child.id, Event::InheritedRt, "Got RT from parent", &client, now).await?;
                    log_event(
                        tx,
                        parent_id,
                        Event::SubtokenCreated,
                        req.name.clone().unwrap_or_default(),
                        &client,
                        now,
                    )
                    .await?;
                    let token_update = if parent.mt.rotates_on_other() {
                        rotate_after_use(&ctx, tx, &mut parent, &client, now).await?
                    } else {
                        None
                    };
                    let mut response = token_response(
                        &ctx.config,
                        tx,
                        &child,
                        &child_jwt,
                        req.response_type,
                        req.max_token_len,
                        &client,
                        now,
                    )
                    .await?;
                    response.token_update = token_update;
                    Ok((response, child.id))
                })
            })
            .await?;
        info!(mytoken_id = %child_id, parent_id = %parent.id, "Child mytoken minted");
        Ok(response)
    }

    // ------------------------------------------------------------------------
    // Access tokens
    // ------------------------------------------------------------------------

    /// Obtain an access token from the provider.
    ///
    /// The provider is called between two transactions. The second one
    /// re-verifies the chosen restriction before counting the use.
    pub async fn access_token(
        &self,
        req: AccessTokenRequest,
        client: &ClientMetadata,
        now: i64,
    ) -> Result<AccessTokenResponse> {
        let ctx = self.context()?;
        let mut scopes = split_scope(req.scope.as_deref());
        let mut audiences = req.audience.clone();

        let (issuer, wanted) = (req.issuer.clone(), (scopes.clone(), audiences.clone()));
        let (ctx_tx, client_tx) = (Arc::clone(&ctx), client.clone());
        let (mt, restriction, refresh_token) = self
            .with_token(&ctx, &req.mytoken, now, move |tx, p| {
                Box::pin(async move {
                    let (ctx, client, (scopes, audiences)) = (ctx_tx, client_tx, wanted);
                    p.mt.verify_capabilities(&[CAPABILITY_AT])?;
                    check_issuer(&p.mt, issuer.as_deref())?;
                    let restriction = usable_restriction(
                        &ctx,
                        tx,
                        &p.mt,
                        UsageKind::AccessToken,
                        &client,
                        &scopes,
                        &audiences,
                        now,
                    )
                    .await?;
                    let rt = hierarchy::refresh_token(tx, &p.mt.id, &p.jwt)
                        .await?
                        .ok_or(Error::NoRefreshToken)?;
                    Ok((p.mt, restriction, rt))
                })
            })
            .await?;

        // An empty request asks for everything the restriction allows.
        if let Some(r) = &restriction {
            if scopes.is_empty() {
                scopes = r.scopes().into_iter().map(str::to_string).collect();
            }
            if audiences.is_empty() {
                audiences = r.audiences.clone();
            }
        }

        let provider = ctx.providers.resolve(&mt.oidc_iss).await?;
        let tokens = provider.refresh(&refresh_token, &scopes, &audiences).await?;
        let granted_scope = tokens.scope.clone().unwrap_or_else(|| scopes.join(" "));
        let granted_audiences = tokens.audiences().unwrap_or_else(|| audiences.clone());
        let comment = req.comment.clone().unwrap_or_default();

        let (ctx_tx, client_tx) = (Arc::clone(&ctx), client.clone());
        let access_token = tokens.access_token.clone();
        let new_rt = tokens
            .refresh_token
            .clone()
            .filter(|rt| !rt.is_empty() && *rt != refresh_token);
        let (at_scopes, at_audiences) = (split_scope(Some(&granted_scope)), granted_audiences.clone());
        let token_update = self
            .with_token(&ctx, &req.mytoken, now, move |tx, mut p| {
                Box::pin(async move {
                    let (ctx, client) = (ctx_tx, client_tx);
                    if let Some(r) = &restriction {
                        if !usage::verify(tx, p.mt.id, r, UsageKind::AccessToken, client.ip, &ctx.lookups, now).await? {
                            return Err(Error::UsageRestricted(
                                "restriction was used up concurrently".into(),
                            ));
                        }
                        used_at(tx, p.mt.id, r).await?;
                    }
                    let row = AccessTokenRow {
                        mytoken_id: p.mt.id,
                        sealed_token: seal_str(&access_token, &p.jwt)?,
                        scopes: at_scopes,
                        audiences: at_audiences,
                        client: client.clone(),
                        created: now,
                    };
                    db::insert_access_token(tx, &row).await?;
                    log_event(tx, p.mt.id, Event::AtCreated, comment, &client, now).await?;
                    if let Some(new_rt) = &new_rt {
                        update_refresh_token(tx, &p.mt.id, &p.jwt, new_rt).await?;
                        debug!(mytoken_id = %p.mt.id, "Provider rotated the refresh token");
                    }
                    if p.mt.rotates_on_at() {
                        rotate_after_use(&ctx, tx, &mut p, &client, now).await
                    } else {
                        Ok(None)
                    }
                })
            })
            .await?;
        info!(mytoken_id = %mt.id, issuer = %mt.oidc_iss, "Access token issued");

        Ok(AccessTokenResponse {
            access_token: tokens.access_token,
            token_type: tokens.token_type,
            expires_in: tokens.expires_in,
            scope: granted_scope,
            audiences: granted_audiences,
            token_update,
        })
    }

    // ------------------------------------------------------------------------
    // Revocation
    // ------------------------------------------------------------------------

    /// Revoke a mytoken, short token, transfer code or polling code.
    ///
    /// When the last token referencing a refresh token goes away, the
    /// refresh token is revoked at the provider as well. A failure there is
    /// logged and not reported.
    pub async fn revoke(&self, req: RevocationRequest, now: i64) -> Result<()> {
        let ctx = self.context()?;
        let ctx_tx = Arc::clone(&ctx);
        let RevocationRequest { token, recursive } = req;
        let orphaned = self
            .cluster
            .transact(move |tx| {
                Box::pin(async move {
                    let (ctx, token) = (ctx_tx, token.as_str());
                    if is_jws(token) {
                        let mt = Mytoken::parse(token, &ctx.public_key, ctx.issuer(), now)?;
                        let rt = revoke_with_refresh_token(tx, &mt.id, token, recursive).await?;
                        return Ok(rt.map(|rt| (mt.oidc_iss, rt)));
                    }

                    if check_code(tx, token, now).await?.found {
                        let new_mytoken = db::get_transfer_attrs(tx, ProxyToken::from_code(token).id())
                            .await?
                            .is_some_and(|a| a.new_mytoken);
                        let jwt = pop_token(tx, token).await?;
                        delete_code(tx, token).await?;
                        debug!("Code revoked");
                        return match jwt.filter(|_| new_mytoken) {
                            Some(jwt) => {
                                let mt = Mytoken::parse(&jwt, &ctx.public_key, ctx.issuer(), now)?;
                                let rt = revoke_with_refresh_token(tx, &mt.id, &jwt, recursive).await?;
                                Ok(rt.map(|rt| (mt.oidc_iss, rt)))
                            }
                            None => Ok(None),
                        };
                    }

                    let mut short = ShortToken::parse(token);
                    let Some(jwt) = short.jwt(tx).await? else {
                        return Err(Error::InvalidToken("unknown token".into()));
                    };
                    ProxyToken::from_code(token).delete(tx).await?;
                    let mt = Mytoken::parse(&jwt, &ctx.public_key, ctx.issuer(), now)?;
                    let rt = revoke_with_refresh_token(tx, &mt.id, &jwt, recursive).await?;
                    Ok(rt.map(|rt| (mt.oidc_iss, rt)))
                })
            })
            .await?;

        if let Some((issuer, rt)) = orphaned {
            let revoked = match ctx.providers.resolve(&issuer).await {
                Ok(provider) => provider.revoke_refresh_token(&rt).await,
                Err(e) => Err(e),
            };
            if let Err(e) = revoked {
                warn!(issuer = %issuer, error = %e, "Could not revoke refresh token at provider");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Transfer codes
    // ------------------------------------------------------------------------

    /// Create a transfer code for an existing token.
    pub async fn create_transfer_code(
        &self,
        req: TransferCodeRequest,
        client: &ClientMetadata,
        now: i64,
    ) -> Result<TransferCodeResponse> {
        let ctx = self.context()?;
        let ctx_tx = Arc::clone(&ctx);
        let client = client.clone();
        let response_type = req.response_type;
        self.with_token(&ctx, &req.mytoken, now, move |tx, mut p| {
            Box::pin(async move {
                let ctx = ctx_tx;
                let tc_config = &ctx.config.features.transfer_codes;
                // Rotate first so the code carries the current generation.
                let token_update = use_for_other(&ctx, tx, &mut p, &client, now).await?;
                let tc = TransferCode::new(
                    &p.jwt,
                    p.mt.id,
                    false,
                    response_type,
                    tc_config.len,
                    tc_config.expires_after,
                    now,
                )?;
                tc.store(tx).await?;
                log_event(tx, p.mt.id, Event::TransferCodeCreated, "", &client, now).await?;
                Ok(TransferCodeResponse {
                    transfer_code: tc.code().to_string(),
                    expires_in: tc_config.expires_after,
                    token_update,
                })
            })
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Tokeninfo
    // ------------------------------------------------------------------------

    /// Answer a tokeninfo question. Asking counts as a use of the token.
    async fn tokeninfo_use(
        &self,
        action: TokeninfoAction,
        token: &str,
        client: &ClientMetadata,
        now: i64,
    ) -> Result<TokeninfoResponse> {
        let ctx = self.context()?;
        let ctx_tx = Arc::clone(&ctx);
        let client = client.clone();
        self.with_token(&ctx, token, now, move |tx, mut p| {
            Box::pin(async move {
                let ctx = ctx_tx;
                let (capability, event) = action.requirements();
                p.mt.verify_capabilities(&[capability])?;
                let used = usable_restriction(&ctx, tx, &p.mt, UsageKind::Other, &client, &[], &[], now).await?;
                if let Some(r) = &used {
                    used_other(tx, p.mt.id, r).await?;
                }
                log_event(tx, p.mt.id, event, "", &client, now).await?;
                let body = match action {
                    TokeninfoAction::Introspect => TokeninfoBody::Introspect {
                        valid: true,
                        token: Box::new(p.mt.clone()),
                    },
                    TokeninfoAction::EventHistory => TokeninfoBody::History {
                        events: history(tx, &p.mt.id).await?,
                    },
                    TokeninfoAction::SubtokenTree => TokeninfoBody::Tree {
                        mytokens: subtree(tx, &p.mt.id).await?.ok_or(Error::TokenRevoked)?,
                    },
                    TokeninfoAction::ListMytokens => TokeninfoBody::List {
                        mytokens: all_trees(tx, &p.mt.oidc_iss, &p.mt.oidc_sub).await?,
                    },
                };
                let token_update = if p.mt.rotates_on_other() {
                    rotate_after_use(&ctx, tx, &mut p, &client, now).await?
                } else {
                    None
                };
                Ok(TokeninfoResponse { body, token_update })
            })
        })
        .await
    }

    pub async fn introspect(&self, token: &str, client: &ClientMetadata, now: i64) -> Result<TokeninfoResponse> {
        self.tokeninfo_use(TokeninfoAction::Introspect, token, client, now).await
    }

    pub async fn event_history(&self, token: &str, client: &ClientMetadata, now: i64) -> Result<TokeninfoResponse> {
        self.tokeninfo_use(TokeninfoAction::EventHistory, token, client, now).await
    }

    pub async fn subtoken_tree(&self, token: &str, client: &ClientMetadata, now: i64) -> Result<TokeninfoResponse> {
        self.tokeninfo_use(TokeninfoAction::SubtokenTree, token, client, now).await
    }

    pub async fn list_mytokens(&self, token: &str, client: &ClientMetadata, now: i64) -> Result<TokeninfoResponse> {
        self.tokeninfo_use(TokeninfoAction::ListMytokens, token, client, now).await
    }

    pub async fn tokeninfo(&self, req: TokeninfoRequest, client: &ClientMetadata, now: i64) -> Result<TokeninfoResponse> {
        self.tokeninfo_use(req.action, &req.mytoken, client, now).await
    }

    // ------------------------------------------------------------------------
    // Consent and provider callback
    // ------------------------------------------------------------------------

    pub async fn consent_info(&self, consent_code: &str, now: i64) -> Result<ConsentInfo> {
        authcode::consent_info(&self.cluster, consent_code, now).await
    }

    /// Approve the consent; returns the URL to redirect the user to.
    pub async fn approve_consent(
        &self,
        consent_code: &str,
        update: ConsentUpdate,
        client: &ClientMetadata,
        now: i64,
    ) -> Result<String> {
        let ctx = self.context()?;
        authcode::approve_consent(&ctx, &self.cluster, consent_code, update, client, now).await
    }

    pub async fn decline_consent(&self, consent_code: &str) -> Result<()> {
        let ctx = self.context()?;
        authcode::decline_consent(&ctx, &self.cluster, consent_code).await
    }

    /// Handle the provider redirecting the user back.
    pub async fn handle_redirect(
        &self,
        query: RedirectQuery,
        client: &ClientMetadata,
        now: i64,
    ) -> Result<CodeExchangeOutcome> {
        let ctx = self.context()?;
        if let Some(error) = &query.error {
            let description = query.error_description.as_deref().unwrap_or_default();
            return Err(authcode::callback_error(
                &ctx,
                &self.cluster,
                &query.state,
                error,
                description,
            )
            .await?);
        }
        let code = query
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::InvalidRequest("missing code".into()))?;
        authcode::code_exchange(&ctx, &self.cluster, &query.state, code, client, now)
            .await
            .inspect_err(|e| {
                if e.is_internal() {
                    error!(error = %e, "Code exchange failed");
                }
            })
    }
}

impl std::fmt::Debug for MytokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MytokenService")
            .field("nodes", &self.cluster.active_nodes())
            .finish_non_exhaustive()
    }
}
