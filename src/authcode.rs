//! The authorization code flow.
//!
//! ```text
//! start ──► consent pending ──► declined
//!                 │
//!                 ▼ approve (PKCE verifier stored, redirect to provider)
//!           provider callback ──► error: flow and polling code deleted
//!                 │
//!                 ▼ code exchange
//!           mytoken minted; web clients get it directly, native clients
//!           find it behind their polling code
//! ```
//!
//! Flows are stored under the hash of their OIDC state. The consent code
//! shown to the user derives that state, and native clients get a polling
//! code derived from it as well.

use crate::capabilities::Capabilities;
use crate::cluster::Cluster;
use crate::context::Context;
use crate::crypto::seal_str;
use crate::db::{self, AccessTokenRow, AuthFlowRow, Tx, UserRow};
use crate::enforced::{apply_template, template_for_user};
use crate::error::{Error, Result};
use crate::event::{log_event, Event};
use crate::hierarchy::{store_root, StoreMeta};
use crate::mytoken::{Mytoken, NewMytoken, ResponseType, Rotation};
use crate::network::ClientMetadata;
use crate::provider::{Provider, UserInfo};
use crate::proxy::{decline_polling_code, delete_code, link_polling_code, PollingCode};
use crate::response::{token_response, MytokenResponse};
use crate::restrictions::{Restriction, Restrictions};
use crate::state::{ConsentCode, PkceVerifier, State, StateInfo};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a native client is sent once the flow completed.
pub const NATIVE_DONE_PATH: &str = "/native";

/// Kind of client driving the flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    #[default]
    Web,
    Native,
}

/// A request to mint a mytoken through the authorization code flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OidcFlowRequest {
    pub issuer: String,
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
    pub client_type: ClientType,
    /// Reject instead of silently capping restrictions that exceed the
    /// provider's maximum lifetime.
    #[serde(default)]
    pub failed_on_restrictions_not_tighter: bool,
}

/// Handed to the client when a flow starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCodeFlowResponse {
    pub consent_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_info: Option<PollingInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingInfo {
    pub polling_code: String,
    pub polling_code_expires_in: u64,
    pub polling_interval: u64,
}

/// What the consent page shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentInfo {
    pub issuer: String,
    pub restrictions: Restrictions,
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtoken_capabilities: Option<Capabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub expires_at: i64,
}

/// Changes the user made on the consent page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentUpdate {
    #[serde(default)]
    pub restrictions: Option<Restrictions>,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
    #[serde(default)]
    pub subtoken_capabilities: Option<Capabilities>,
    #[serde(default)]
    pub rotation: Option<Rotation>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ConsentUpdate {
    pub fn is_empty(&self) -> bool {
        self == &ConsentUpdate::default()
    }
}

/// Result of a completed code exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeExchangeOutcome {
    /// Web client: the token in its requested representation.
    Web(MytokenResponse),
    /// Native client: the token waits behind the polling code.
    Native { redirect: String },
}

// ============================================================================
// Helpers
// ============================================================================

/// `now` plus a lifetime in seconds, saturating instead of wrapping.
fn after(now: i64, secs: u64) -> i64 {
    now.saturating_add(i64::try_from(secs).unwrap_or(i64::MAX))
}

fn polling_code_of(ctx: &Context, state: &State) -> Result<String> {
    state.polling_code(ctx.polling_secret(), ctx.config.features.polling.len)
}

/// Normalize requested restrictions the same way for every entry point.
pub(crate) fn prepare_restrictions(
    ctx: &Context,
    restrictions: &mut Restrictions,
    client: &ClientMetadata,
) -> Result<()> {
    restrictions.clear_unsupported_keys(&ctx.config.features.restrictions.disabled_keys);
    restrictions.replace_this_ip(client.ip);
    restrictions.validate()
}

/// Cap restrictions at the provider's maximum mytoken lifetime.
pub(crate) fn enforce_provider_lifetime(
    provider: &dyn Provider,
    restrictions: &mut Restrictions,
    fail_if_changed: bool,
    now: i64,
) -> Result<()> {
    let max = provider.max_mytoken_lifetime();
    if max == 0 {
        return Ok(());
    }
    if restrictions.enforce_max_lifetime(max, now) && fail_if_changed {
        return Err(Error::MaxLifetimeExceeded);
    }
    Ok(())
}

async fn load_flow(tx: &mut Tx, key: &str, now: i64) -> Result<AuthFlowRow> {
    match db::get_auth_flow(tx, key).await? {
        Some(flow) if flow.expires_at >= now => Ok(flow),
        Some(_) => {
            debug!("Authorization flow expired");
            Err(Error::StateMismatch)
        }
        None => Err(Error::StateMismatch),
    }
}

fn state_of_consent_code(consent_code: &str) -> Result<State> {
    ConsentCode::parse(consent_code)
        .and_then(|cc| cc.state())
        .map_err(|_| Error::StateMismatch)
}

async fn read_flow(cluster: &Cluster, state: &State, now: i64) -> Result<AuthFlowRow> {
    let key = state.hash();
    cluster
        .transact(move |tx| Box::pin(async move { load_flow(tx, &key, now).await }))
        .await
}

// ============================================================================
// Start
// ============================================================================

/// Start an authorization code flow.
pub async fn start_flow(
    ctx: &Context,
    cluster: &Cluster,
    mut req: OidcFlowRequest,
    client: &ClientMetadata,
    now: i64,
) -> Result<AuthCodeFlowResponse> {
    let provider = ctx.providers.resolve(&req.issuer).await?;
    prepare_restrictions(ctx, &mut req.restrictions, client)?;
    if req.restrictions.is_empty() && ctx.config.default_token_lifetime > 0 {
        req.restrictions.push(Restriction {
            expires_at: after(now, ctx.config.default_token_lifetime),
            ..Default::default()
        });
    }
    enforce_provider_lifetime(
        provider.as_ref(),
        &mut req.restrictions,
        req.failed_on_restrictions_not_tighter,
        now,
    )?;

    let capabilities = req
        .capabilities
        .filter(|c| !c.is_empty())
        .unwrap_or_else(Capabilities::defaults);
    capabilities.validate_known()?;
    if let Some(sub) = &req.subtoken_capabilities {
        sub.validate_known()?;
    }
    let rotation = req
        .rotation
        .filter(|_| ctx.config.features.token_rotation.enabled);

    let native = req.client_type == ClientType::Native;
    let polling = &ctx.config.features.polling;
    if native && !polling.enabled {
        return Err(Error::FeatureDisabled("polling codes"));
    }

    let (state, consent_code) = State::create(StateInfo {
        native,
        response_type: req.response_type,
    })?;
    let flow = AuthFlowRow {
        issuer: provider.issuer().to_string(),
        restrictions: req.restrictions,
        capabilities,
        subtoken_capabilities: req.subtoken_capabilities,
        rotation,
        name: req.name,
        response_type: req.response_type,
        max_token_len: req.max_token_len,
        native,
        pkce_verifier: None,
        consent_updated: false,
        expires_at: after(now, ctx.config.auth_flow_lifetime),
    };
    let polling_code = if native {
        let code = polling_code_of(ctx, &state)?;
        Some(PollingCode::new(
            &code,
            req.response_type,
            req.max_token_len,
            polling.expires_after,
            now,
        ))
    } else {
        None
    };

    let key = state.hash();
    let stored = flow.clone();
    let stored_code = polling_code.clone();
    cluster
        .transact(move |tx| {
            Box::pin(async move {
                db::insert_auth_flow(tx, &key, &stored).await?;
                if let Some(pc) = &stored_code {
                    pc.store(tx).await?;
                }
                Ok(())
            })
        })
        .await?;
    info!(issuer = %flow.issuer, native, "Authorization flow started");

    Ok(AuthCodeFlowResponse {
        consent_uri: ctx.config.consent_uri(&consent_code.to_string()),
        polling_info: polling_code.map(|pc| PollingInfo {
            polling_code: pc.code().to_string(),
            polling_code_expires_in: polling.expires_after,
            polling_interval: polling.interval,
        }),
    })
}

// ============================================================================
// Consent
// ============================================================================

/// What the user is asked to consent to.
pub async fn consent_info(cluster: &Cluster, consent_code: &str, now: i64) -> Result<ConsentInfo> {
    let state = state_of_consent_code(consent_code)?;
    let flow = read_flow(cluster, &state, now).await?;
    Ok(ConsentInfo {
        issuer: flow.issuer,
        restrictions: flow.restrictions,
        capabilities: flow.capabilities,
        subtoken_capabilities: flow.subtoken_capabilities,
        rotation: flow.rotation,
        name: flow.name,
        expires_at: flow.expires_at,
    })
}

fn apply_update(flow: &mut AuthFlowRow, update: ConsentUpdate) -> Result<()> {
    if update.is_empty() {
        return Ok(());
    }
    if flow.consent_updated {
        return Err(Error::InvalidRequest("consent was already updated".into()));
    }
    if let Some(r) = update.restrictions {
        flow.restrictions = r;
    }
    if let Some(c) = update.capabilities {
        flow.capabilities = c;
    }
    if let Some(c) = update.subtoken_capabilities {
        flow.subtoken_capabilities = Some(c);
    }
    if let Some(r) = update.rotation {
        flow.rotation = Some(r);
    }
    if let Some(n) = update.name {
        flow.name = Some(n);
    }
    flow.consent_updated = true;
    Ok(())
}

/// The user consented. Returns the provider's authorization URL.
///
/// The flow's parameters can be changed once, here.
pub async fn approve_consent(
    ctx: &Context,
    cluster: &Cluster,
    consent_code: &str,
    mut update: ConsentUpdate,
    client: &ClientMetadata,
    now: i64,
) -> Result<String> {
    let state = state_of_consent_code(consent_code)?;
    let flow = read_flow(cluster, &state, now).await?;
    let provider = ctx.providers.resolve(&flow.issuer).await?;

    if let Some(c) = &update.capabilities {
        c.validate_known()?;
    }
    if let Some(c) = &update.subtoken_capabilities {
        c.validate_known()?;
    }
    if let Some(r) = update.restrictions.as_mut() {
        prepare_restrictions(ctx, r, client)?;
        enforce_provider_lifetime(provider.as_ref(), r, false, now)?;
    }
    if !ctx.config.features.token_rotation.enabled {
        update.rotation = None;
    }

    let verifier = PkceVerifier::generate();
    let pkce = verifier.as_str().to_string();
    let key = state.hash();
    let flow = cluster
        .transact(move |tx| {
            Box::pin(async move {
                let mut flow = load_flow(tx, &key, now).await?;
                apply_update(&mut flow, update)?;
                flow.pkce_verifier = Some(pkce);
                if !db::update_auth_flow(tx, &key, &flow).await? {
                    return Err(Error::StateMismatch);
                }
                Ok(flow)
            })
        })
        .await?;
    debug!(issuer = %flow.issuer, "Consent given");

    provider.authorization_url(
        &ctx.config.redirect_uri(),
        state.as_str(),
        &verifier.challenge(),
        &flow.restrictions.scopes(),
        &flow.restrictions.audiences(),
    )
}

/// The user declined. The flow ends; a polling client learns about it on
/// its next poll.
pub async fn decline_consent(ctx: &Context, cluster: &Cluster, consent_code: &str) -> Result<()> {
    let state = state_of_consent_code(consent_code)?;
    let native = state.info()?.native;
    let polling_code = if native {
        Some(polling_code_of(ctx, &state)?)
    } else {
        None
    };
    let key = state.hash();
    cluster
        .transact(move |tx| {
            Box::pin(async move {
                if !db::delete_auth_flow(tx, &key).await? {
                    return Err(Error::StateMismatch);
                }
                if let Some(code) = &polling_code {
                    decline_polling_code(tx, code).await?;
                }
                Ok(())
            })
        })
        .await?;
    info!(native, "Consent declined");
    Ok(())
}

// ============================================================================
// Provider callback
// ============================================================================

/// The provider redirected back with an error instead of a code.
///
/// Cleans up the flow and returns the error to show.
pub async fn callback_error(
    ctx: &Context,
    cluster: &Cluster,
    state: &str,
    error: &str,
    description: &str,
) -> Result<Error> {
    let state = State::parse(state).map_err(|_| Error::StateMismatch)?;
    let polling_code = if state.info()?.native {
        Some(polling_code_of(ctx, &state)?)
    } else {
        None
    };
    let key = state.hash();
    cluster
        .transact(move |tx| {
            Box::pin(async move {
                db::delete_auth_flow(tx, &key).await?;
                if let Some(code) = &polling_code {
                    delete_code(tx, code).await?;
                }
                Ok(())
            })
        })
        .await?;
    warn!(error = %error, description = %description, "Provider returned an error");
    Ok(Error::oidc(None, error, description))
}

fn subject_of(userinfo: &UserInfo) -> Result<String> {
    userinfo
        .get("sub")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::InvalidProviderResponse("could not get 'subject' from id token".into())
        })
}

fn user_row(userinfo: &UserInfo) -> UserRow {
    UserRow {
        email: userinfo
            .get("email")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        email_verified: userinfo
            .get("email_verified")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    }
}

/// Exchange the authorization code and mint the mytoken.
///
/// The flow is claimed by deleting it in the minting transaction. A second
/// redirect carrying the same state, concurrent or replayed, finds nothing
/// to delete and fails with [`Error::StateMismatch`] without minting.
pub async fn code_exchange(
    ctx: &Arc<Context>,
    cluster: &Cluster,
    state: &str,
    code: &str,
    client: &ClientMetadata,
    now: i64,
) -> Result<CodeExchangeOutcome> {
    let state = State::parse(state).map_err(|_| Error::StateMismatch)?;
    let flow = read_flow(cluster, &state, now).await?;
    let verifier = flow.pkce_verifier.clone().ok_or(Error::StateMismatch)?;
    let provider: Arc<dyn Provider> = ctx.providers.resolve(&flow.issuer).await?;

    let tokens = provider
        .exchange_code(code, &verifier, &ctx.config.redirect_uri())
        .await?;
    let refresh_token = tokens
        .refresh_token
        .clone()
        .filter(|rt| !rt.is_empty())
        .ok_or(Error::NoRefreshToken)?;

    let mut restrictions = flow.restrictions.clone();
    if let Some(scopes) = tokens.scopes() {
        restrictions.set_max_scopes(&scopes);
    }
    let audiences = tokens
        .audiences()
        .unwrap_or_else(|| restrictions.audiences());
    restrictions.set_max_audiences(&audiences);

    let userinfo = provider.userinfo(&tokens).await?;
    let oidc_sub = subject_of(&userinfo)?;
    if let Some(conf) = provider.enforced_restrictions() {
        if let Some(template) = template_for_user(conf, &userinfo)? {
            restrictions = apply_template(&ctx.config.restriction_templates, template, &restrictions)?;
        }
    }

    let mt = Mytoken::new(
        NewMytoken {
            oidc_sub: oidc_sub.clone(),
            oidc_iss: provider.issuer().to_string(),
            name: flow.name.clone(),
            restrictions,
            capabilities: flow.capabilities.clone(),
            subtoken_capabilities: flow.subtoken_capabilities.clone(),
            rotation: flow.rotation.clone(),
        },
        ctx.issuer(),
        now,
    );
    let jwt = mt.to_jwt(&ctx.signing_key)?;
    let polling_code = if flow.native {
        Some(polling_code_of(ctx, &state)?)
    } else {
        None
    };
    let meta = StoreMeta {
        client: client.clone(),
        now,
    };
    let access_token = AccessTokenRow {
        mytoken_id: mt.id,
        sealed_token: seal_str(&tokens.access_token, &jwt)?,
        scopes: mt.restrictions.scopes(),
        audiences: mt.restrictions.audiences(),
        client: client.clone(),
        created: now,
    };
    let user = user_row(&userinfo);
    let key = state.hash();
    let minted = mt.clone();
    let ctx_tx = Arc::clone(ctx);
    let (response_type, max_token_len) = (flow.response_type, flow.max_token_len);

    let outcome = cluster
        .transact(move |tx| {
            Box::pin(async move {
                let (ctx, mt, client) = (ctx_tx, minted, meta.client.clone());
                if !db::delete_auth_flow(tx, &key).await? {
                    debug!("Authorization flow already redeemed");
                    return Err(Error::StateMismatch);
                }
                store_root(tx, &mt, &jwt, &refresh_token, &meta).await?;
                log_event(
                    tx,
                    mt.id,
                    Event::Created,
                    "Used grant_type oidc_flow authorization_code",
                    &client,
                    now,
                )
                .await?;
                db::insert_access_token(tx, &access_token).await?;
                db::upsert_user(tx, &mt.oidc_iss, &oidc_sub, &user).await?;
                match &polling_code {
                    Some(code) => {
                        link_polling_code(tx, code, &jwt, mt.id).await?;
                        Ok(CodeExchangeOutcome::Native {
                            redirect: NATIVE_DONE_PATH.to_string(),
                        })
                    }
                    None => token_response(
                        &ctx.config,
                        tx,
                        &mt,
                        &jwt,
                        response_type,
                        max_token_len,
                        &client,
                        now,
                    )
                    .await
                    .map(CodeExchangeOutcome::Web),
                }
            })
        })
        .await?;
    info!(mytoken_id = %mt.id, issuer = %mt.oidc_iss, native = flow.native, "Mytoken minted from authorization code");
    Ok(outcome)
}
