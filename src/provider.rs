//! OpenID providers.
//!
//! [`Provider`] is the seam between the flows and the upstream OP. The
//! static variant, [`OidcProvider`], talks to a configured provider over
//! HTTP; federation-discovered providers come from a [`FederationResolver`].
//! [`ProviderRegistry`] looks up the static providers first and caches
//! federation results for a limited time.

use crate::config::{AudienceConfig, Config, Endpoints, ProviderConfig};
use crate::enforced::EnforcedRestrictionsConfig;
use crate::error::{Error, Result};
use crate::state::PKCE_METHOD;
use crate::wire;
use async_trait::async_trait;
use moka::sync::Cache;
use reqwest::{Client, RequestBuilder, Url};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const SCOPE_OPENID: &str = "openid";
pub const SCOPE_OFFLINE_ACCESS: &str = "offline_access";

/// Claims about the user, from the ID token and the userinfo endpoint.
pub type UserInfo = Map<String, Value>;

/// Successful response of the token endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub id_token: Option<String>,
}

impl TokenResponse {
    /// Scopes granted by the provider, if it reported them.
    pub fn scopes(&self) -> Option<Vec<String>> {
        let scope = self.scope.as_deref().filter(|s| !s.trim().is_empty())?;
        Some(scope.split_whitespace().map(str::to_string).collect())
    }

    /// Audiences of the access token, if it is a JWT carrying `aud`.
    pub fn audiences(&self) -> Option<Vec<String>> {
        if !wire::is_jws(&self.access_token) {
            return None;
        }
        let claims: Value = wire::decode_unverified(&self.access_token).ok()?;
        match claims.get("aud")? {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Claims of the ID token. The token was received directly from the
    /// provider's token endpoint, so its signature is not checked again.
    pub fn id_token_claims(&self) -> UserInfo {
        self.id_token
            .as_deref()
            .and_then(|t| wire::decode_unverified::<UserInfo>(t).ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct OidcErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

// ============================================================================
// Provider trait
// ============================================================================

/// An OpenID provider this server can obtain tokens from.
#[async_trait]
pub trait Provider: Send + Sync {
    fn issuer(&self) -> &str;

    fn name(&self) -> &str {
        self.issuer()
    }

    fn client_id(&self) -> &str;

    /// Scopes requested when the user restricts none.
    fn scopes(&self) -> &[String];

    fn endpoints(&self) -> &Endpoints;

    fn audience(&self) -> &AudienceConfig;

    /// Maximum mytoken lifetime in seconds; 0 = unlimited.
    fn max_mytoken_lifetime(&self) -> u64 {
        0
    }

    fn enforced_restrictions(&self) -> Option<&EnforcedRestrictionsConfig> {
        None
    }

    /// Authenticate a request to the token or revocation endpoint.
    fn add_client_authentication(&self, request: RequestBuilder) -> RequestBuilder {
        request
    }

    /// The URL the user is sent to for authentication.
    fn authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        pkce_challenge: &str,
        scopes: &[String],
        audiences: &[String],
    ) -> Result<String> {
        let mut scopes: Vec<String> = if scopes.is_empty() {
            self.scopes().to_vec()
        } else {
            scopes.to_vec()
        };
        // offline_access for a refresh token; openid even if the user
        // restricted it away.
        for required in [SCOPE_OFFLINE_ACCESS, SCOPE_OPENID] {
            if !scopes.iter().any(|s| s == required) {
                scopes.push(required.to_string());
            }
        }
        let mut params = vec![
            ("response_type".to_string(), "code".to_string()),
            ("client_id".to_string(), self.client_id().to_string()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
            ("scope".to_string(), scopes.join(" ")),
            ("state".to_string(), state.to_string()),
            ("prompt".to_string(), "consent".to_string()),
            ("code_challenge".to_string(), pkce_challenge.to_string()),
            ("code_challenge_method".to_string(), PKCE_METHOD.to_string()),
        ];
        params.extend(audience_params(self.audience(), audiences));
        let url = Url::parse_with_params(&self.endpoints().authorization, &params).map_err(|e| {
            Error::Configuration(format!("invalid authorization endpoint: {}", e))
        })?;
        Ok(url.into())
    }

    /// Redeem an authorization code.
    async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse>;

    /// Obtain an access token with a refresh token.
    async fn refresh(
        &self,
        refresh_token: &str,
        scopes: &[String],
        audiences: &[String],
    ) -> Result<TokenResponse>;

    /// Claims about the user behind `tokens`.
    async fn userinfo(&self, tokens: &TokenResponse) -> Result<UserInfo>;

    /// Revoke a refresh token. Providers without a revocation endpoint
    /// succeed without doing anything.
    async fn revoke_refresh_token(&self, refresh_token: &str) -> Result<()>;
}

/// Request parameters for `audiences` under `policy`.
pub fn audience_params(policy: &AudienceConfig, audiences: &[String]) -> Vec<(String, String)> {
    if audiences.is_empty() {
        return Vec::new();
    }
    if policy.space_separate_auds {
        return vec![(policy.request_parameter.clone(), audiences.join(" "))];
    }
    audiences
        .iter()
        .map(|a| (policy.request_parameter.clone(), a.clone()))
        .collect()
}

/// Normalized form of an issuer URL for comparisons.
pub fn normalize_issuer(issuer: &str) -> &str {
    issuer.trim_end_matches('/')
}

// ============================================================================
// Static provider
// ============================================================================

/// A provider with a registered client, talking to the OP over HTTP.
pub struct OidcProvider {
    config: ProviderConfig,
    client: Client,
}

impl OidcProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Configuration(format!("http client: {}", e)))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn token_request(&self, form: Vec<(String, String)>) -> Result<TokenResponse> {
        let request = self.client.post(&self.config.endpoints.token).form(&form);
        let response = self.add_client_authentication(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(upstream_error(status.as_u16(), response.text().await.unwrap_or_default()));
        }
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::InvalidProviderResponse(e.to_string()))
    }
}

fn upstream_error(status: u16, body: String) -> Error {
    match serde_json::from_str::<OidcErrorResponse>(&body) {
        Ok(e) if !e.error.is_empty() => Error::oidc(Some(status), e.error, e.error_description),
        _ => Error::oidc(Some(status), "oidc_error", body),
    }
}

#[async_trait]
impl Provider for OidcProvider {
    fn issuer(&self) -> &str {
        &self.config.issuer
    }

    fn name(&self) -> &str {
        if self.config.name.is_empty() {
            &self.config.issuer
        } else {
            &self.config.name
        }
    }

    fn client_id(&self) -> &str {
        &self.config.client_id
    }

    fn scopes(&self) -> &[String] {
        &self.config.scopes
    }

    fn endpoints(&self) -> &Endpoints {
        &self.config.endpoints
    }

    fn audience(&self) -> &AudienceConfig {
        &self.config.audience
    }

    fn max_mytoken_lifetime(&self) -> u64 {
        self.config.max_mytoken_lifetime
    }

    fn enforced_restrictions(&self) -> Option<&EnforcedRestrictionsConfig> {
        Some(&self.config.enforced_restrictions).filter(|e| e.enabled)
    }

    fn add_client_authentication(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.config.client_id, Some(&self.config.client_secret))
    }

    async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse> {
        debug!(issuer = %self.config.issuer, "Exchanging authorization code");
        let form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("code_verifier".to_string(), pkce_verifier.to_string()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
            ("client_id".to_string(), self.config.client_id.clone()),
        ];
        self.token_request(form).await
    }

    async fn refresh(
        &self,
        refresh_token: &str,
        scopes: &[String],
        audiences: &[String],
    ) -> Result<TokenResponse> {
        debug!(issuer = %self.config.issuer, "Refreshing access token");
        let mut form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ];
        if !scopes.is_empty() {
            form.push(("scope".to_string(), scopes.join(" ")));
        }
        form.extend(audience_params(&self.config.audience, audiences));
        self.token_request(form).await
    }

    async fn userinfo(&self, tokens: &TokenResponse) -> Result<UserInfo> {
        let mut claims = tokens.id_token_claims();
        let Some(endpoint) = self.config.endpoints.userinfo.as_deref() else {
            return Ok(claims);
        };
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(&tokens.access_token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            // The ID token may still carry everything needed.
            warn!(issuer = %self.config.issuer, status = status.as_u16(), "Userinfo request failed");
            return Ok(claims);
        }
        let userinfo: UserInfo = response
            .json()
            .await
            .map_err(|e| Error::InvalidProviderResponse(e.to_string()))?;
        claims.extend(userinfo);
        Ok(claims)
    }

    async fn revoke_refresh_token(&self, refresh_token: &str) -> Result<()> {
        let Some(endpoint) = self.config.endpoints.revocation.as_deref() else {
            return Ok(());
        };
        let form = [
            ("token", refresh_token),
            ("token_type_hint", "refresh_token"),
        ];
        let request = self.client.post(endpoint).form(&form);
        let response = self.add_client_authentication(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(upstream_error(status.as_u16(), response.text().await.unwrap_or_default()));
        }
        debug!(issuer = %self.config.issuer, "Refresh token revoked at provider");
        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Discovers providers through OpenID federation.
#[async_trait]
pub trait FederationResolver: Send + Sync {
    /// The provider for `issuer`, or `None` if the federation does not
    /// trust it.
    async fn resolve(&self, issuer: &str) -> Result<Option<Arc<dyn Provider>>>;
}

struct Federation {
    resolver: Arc<dyn FederationResolver>,
    cache: Cache<String, Arc<dyn Provider>>,
}

/// All providers this server accepts.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    federation: Option<Federation>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of the statically configured providers.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for p in &config.providers {
            registry = registry.with_provider(Arc::new(OidcProvider::new(p.clone())?));
        }
        Ok(registry)
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers
            .insert(normalize_issuer(provider.issuer()).to_string(), provider);
        self
    }

    /// Fall back to `resolver` for unknown issuers, caching results for `ttl`.
    pub fn with_federation(
        mut self,
        resolver: Arc<dyn FederationResolver>,
        ttl: Duration,
        capacity: u64,
    ) -> Self {
        self.federation = Some(Federation {
            resolver,
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        });
        self
    }

    /// A statically configured provider.
    pub fn get(&self, issuer: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(normalize_issuer(issuer)).cloned()
    }

    /// Static providers first, then federation discovery.
    pub async fn resolve(&self, issuer: &str) -> Result<Arc<dyn Provider>> {
        if let Some(p) = self.get(issuer) {
            return Ok(p);
        }
        let Some(federation) = &self.federation else {
            return Err(Error::UnknownIssuer(issuer.to_string()));
        };
        let key = normalize_issuer(issuer).to_string();
        if let Some(p) = federation.cache.get(&key) {
            return Ok(p);
        }
        match federation.resolver.resolve(issuer).await? {
            Some(p) => {
                debug!(issuer = %key, "Provider discovered through federation");
                federation.cache.insert(key, p.clone());
                Ok(p)
            }
            None => Err(Error::UnknownIssuer(issuer.to_string())),
        }
    }

    /// Issuers of the static providers.
    pub fn issuers(&self) -> Vec<String> {
        let mut issuers: Vec<String> = self.providers.values().map(|p| p.issuer().to_string()).collect();
        issuers.sort();
        issuers
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("issuers", &self.issuers())
            .field("federation", &self.federation.is_some())
            .finish()
    }
}
