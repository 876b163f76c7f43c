//! Shared fixtures: an in-memory provider and a service wired to it.

#![allow(dead_code)]

use async_trait::async_trait;
use mytoken::config::{AudienceConfig, Endpoints};
use mytoken::enforced::EnforcedRestrictionsConfig;
use mytoken::{
    AuthCodeFlowResponse, ClientMetadata, Cluster, CodeExchangeOutcome, Config, ConsentUpdate,
    Context, Database, Lookups, Mytoken, MytokenResponse, MytokenService, OidcFlowRequest, Provider,
    ProviderRegistry, Result, SigningKey, TokenResponse, UserInfo,
};
use mytoken::service::RedirectQuery;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;

pub const ISSUER: &str = "https://mytoken.example";
pub const OP: &str = "https://op.example";
pub const NOW: i64 = 1_700_000_000;

// ============================================================================
// Mock provider
// ============================================================================

pub struct MockProvider {
    issuer: String,
    scopes: Vec<String>,
    endpoints: Endpoints,
    audience: AudienceConfig,
    pub max_lifetime: u64,
    pub enforced: Option<EnforcedRestrictionsConfig>,
    pub userinfo: Mutex<UserInfo>,
    /// Hand out a new refresh token on every refresh.
    pub rotate_refresh_tokens: bool,
    pub refresh_calls: AtomicUsize,
    pub revoked: Mutex<Vec<String>>,
    /// Hold code exchanges until this many are in flight.
    pub exchange_barrier: Option<Barrier>,
}

impl MockProvider {
    pub fn new() -> Self {
        let mut userinfo = UserInfo::new();
        userinfo.insert("sub".into(), json!("alice"));
        userinfo.insert("email".into(), json!("alice@example.org"));
        userinfo.insert("email_verified".into(), json!(true));
        Self {
            issuer: OP.into(),
            scopes: vec!["openid".into(), "profile".into()],
            endpoints: Endpoints {
                authorization: format!("{}/authorize", OP),
                token: format!("{}/token", OP),
                userinfo: None,
                revocation: Some(format!("{}/revoke", OP)),
            },
            audience: AudienceConfig::default(),
            max_lifetime: 0,
            enforced: None,
            userinfo: Mutex::new(userinfo),
            rotate_refresh_tokens: false,
            refresh_calls: AtomicUsize::new(0),
            revoked: Mutex::new(Vec::new()),
            exchange_barrier: None,
        }
    }

    pub fn set_claim(&self, name: &str, value: serde_json::Value) {
        self.userinfo.lock().unwrap().insert(name.into(), value);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn issuer(&self) -> &str {
        &self.issuer
    }

    fn client_id(&self) -> &str {
        "mytoken-test"
    }

    fn scopes(&self) -> &[String] {
        &self.scopes
    }

    fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn audience(&self) -> &AudienceConfig {
        &self.audience
    }

    fn max_mytoken_lifetime(&self) -> u64 {
        self.max_lifetime
    }

    fn enforced_restrictions(&self) -> Option<&EnforcedRestrictionsConfig> {
        self.enforced.as_ref()
    }

    async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &str,
        _redirect_uri: &str,
    ) -> Result<TokenResponse> {
        assert!(!pkce_verifier.is_empty());
        if let Some(barrier) = &self.exchange_barrier {
            barrier.wait().await;
        }
        Ok(TokenResponse {
            access_token: "at-initial".into(),
            token_type: "Bearer".into(),
            refresh_token: (code != "no-refresh-token").then(|| "rt-1".to_string()),
            scope: Some("openid profile storage.read storage.write".into()),
            expires_in: Some(3600),
            id_token: None,
        })
    }

    async fn refresh(
        &self,
        refresh_token: &str,
        scopes: &[String],
        _audiences: &[String],
    ) -> Result<TokenResponse> {
        assert!(refresh_token.starts_with("rt-"));
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenResponse {
            access_token: format!("at-{}", n),
            token_type: "Bearer".into(),
            refresh_token: self
                .rotate_refresh_tokens
                .then(|| format!("rt-{}", n + 1)),
            scope: (!scopes.is_empty()).then(|| scopes.join(" ")),
            expires_in: Some(3600),
            id_token: None,
        })
    }

    async fn userinfo(&self, _tokens: &TokenResponse) -> Result<UserInfo> {
        Ok(self.userinfo.lock().unwrap().clone())
    }

    async fn revoke_refresh_token(&self, refresh_token: &str) -> Result<()> {
        self.revoked.lock().unwrap().push(refresh_token.to_string());
        Ok(())
    }
}

// ============================================================================
// Service harness
// ============================================================================

pub struct Harness {
    pub service: MytokenService,
    pub provider: Arc<MockProvider>,
    pub db: Database,
}

pub fn config() -> Config {
    Config {
        issuer: ISSUER.into(),
        ..Default::default()
    }
}

pub fn client() -> ClientMetadata {
    ClientMetadata::new("192.0.2.10".parse().unwrap(), "integration-test")
}

pub async fn harness() -> Harness {
    harness_with(config(), MockProvider::new()).await
}

pub async fn harness_with(config: Config, provider: MockProvider) -> Harness {
    let db = Database::in_memory().await.unwrap();
    let cluster = Arc::new(Cluster::single(db.clone()));
    harness_on(config, provider, db, cluster)
}

/// A harness whose service talks to `db` through `cluster`.
pub fn harness_on(config: Config, provider: MockProvider, db: Database, cluster: Arc<Cluster>) -> Harness {
    let provider = Arc::new(provider);
    let registry = ProviderRegistry::new().with_provider(provider.clone() as Arc<dyn Provider>);
    let context = Context::new(config, SigningKey::generate(), registry, Lookups::default()).unwrap();
    Harness {
        service: MytokenService::new(context, cluster),
        provider,
        db,
    }
}

pub fn flow_request() -> OidcFlowRequest {
    OidcFlowRequest {
        issuer: OP.into(),
        ..Default::default()
    }
}

/// The consent code at the end of a consent URI.
pub fn consent_code(res: &AuthCodeFlowResponse) -> String {
    res.consent_uri.rsplit('/').next().unwrap().to_string()
}

/// The `state` parameter of an authorization URL.
pub fn state_of(authorization_url: &str) -> String {
    reqwest::Url::parse(authorization_url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

impl Harness {
    /// Drive a flow through consent up to the provider redirect.
    pub async fn consent(&self, req: OidcFlowRequest) -> (AuthCodeFlowResponse, String) {
        let started = self.service.start_oidc_flow(req, &client(), NOW).await.unwrap();
        let url = self
            .service
            .approve_consent(&consent_code(&started), ConsentUpdate::default(), &client(), NOW)
            .await
            .unwrap();
        (started, state_of(&url))
    }

    /// Complete a provider redirect with `code`.
    pub async fn redirect(&self, state: &str, code: &str) -> Result<CodeExchangeOutcome> {
        self.service
            .handle_redirect(
                RedirectQuery {
                    state: state.into(),
                    code: Some(code.into()),
                    ..Default::default()
                },
                &client(),
                NOW,
            )
            .await
    }

    /// Mint a root token through the web flow.
    pub async fn mint(&self, req: OidcFlowRequest) -> MytokenResponse {
        let (_, state) = self.consent(req).await;
        match self.redirect(&state, "authcode").await.unwrap() {
            CodeExchangeOutcome::Web(res) => res,
            other => panic!("expected a web response, got {:?}", other),
        }
    }

    /// Mint a root token and return its JWT.
    pub async fn mint_jwt(&self, req: OidcFlowRequest) -> String {
        self.mint(req).await.mytoken.expect("token response")
    }

    /// Verify and decode a JWT issued by this service.
    pub fn parse(&self, jwt: &str) -> Mytoken {
        let ctx = self.service.context().unwrap();
        Mytoken::parse(jwt, &ctx.public_key, ctx.issuer(), NOW).unwrap()
    }
}
