//! Discovery of trusted providers that are not configured statically.
//!
//! An issuer on the federation trust list is set up from its
//! `.well-known/openid-configuration` document with the client registration
//! shared by the federation. Anything else stays unknown.

use crate::config::{AudienceConfig, Endpoints, FederationConfig, ProviderConfig};
use crate::enforced::EnforcedRestrictionsConfig;
use crate::error::{Error, Result};
use crate::provider::{normalize_issuer, FederationResolver, OidcProvider, Provider, SCOPE_OFFLINE_ACCESS};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

const GRANT_REFRESH_TOKEN: &str = "refresh_token";

/// The parts of an OpenID provider metadata document mytoken relies on.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Option<Vec<String>>,
    #[serde(default)]
    pub grant_types_supported: Option<Vec<String>>,
}

impl ProviderMetadata {
    /// Provider configuration for `expected`, which must be the issuer the
    /// document was fetched for.
    ///
    /// Unlisted grant types and scopes are taken as supported.
    pub fn into_provider_config(self, expected: &str, federation: &FederationConfig) -> Result<ProviderConfig> {
        if normalize_issuer(&self.issuer) != normalize_issuer(expected) {
            return Err(Error::InvalidProviderResponse(format!(
                "discovery document of {} names issuer {}",
                expected, self.issuer
            )));
        }
        if let Some(grants) = &self.grant_types_supported {
            if !grants.iter().any(|g| g == GRANT_REFRESH_TOKEN) {
                return Err(Error::InvalidProviderResponse(format!(
                    "{} does not support refresh tokens",
                    expected
                )));
            }
        }
        if let Some(scopes) = &self.scopes_supported {
            if !scopes.iter().any(|s| s == SCOPE_OFFLINE_ACCESS) {
                return Err(Error::InvalidProviderResponse(format!(
                    "{} does not support {}",
                    expected, SCOPE_OFFLINE_ACCESS
                )));
            }
        }
        Ok(ProviderConfig {
            issuer: self.issuer,
            name: String::new(),
            client_id: federation.client_id.clone(),
            client_secret: federation.client_secret.clone(),
            endpoints: Endpoints {
                authorization: self.authorization_endpoint,
                token: self.token_endpoint,
                userinfo: self.userinfo_endpoint,
                revocation: self.revocation_endpoint,
            },
            scopes: federation.scopes.clone(),
            audience: AudienceConfig::default(),
            max_mytoken_lifetime: federation.max_mytoken_lifetime,
            enforced_restrictions: EnforcedRestrictionsConfig::default(),
        })
    }
}

/// Resolves trusted issuers through OpenID discovery.
pub struct DiscoveryResolver {
    config: FederationConfig,
    client: Client,
}

impl DiscoveryResolver {
    pub fn new(config: FederationConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Configuration(format!("http client: {}", e)))?;
        Ok(Self { config, client })
    }

    async fn fetch(&self, issuer: &str) -> Result<ProviderMetadata> {
        let url = format!("{}{}", normalize_issuer(issuer), DISCOVERY_PATH);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::oidc(
                Some(status.as_u16()),
                "discovery_failed",
                format!("GET {} returned {}", url, status),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| Error::InvalidProviderResponse(e.to_string()))
    }
}

#[async_trait]
impl FederationResolver for DiscoveryResolver {
    async fn resolve(&self, issuer: &str) -> Result<Option<Arc<dyn Provider>>> {
        if !self.config.trusts(issuer) {
            debug!(issuer = %issuer, "Issuer is not trusted by the federation");
            return Ok(None);
        }
        let config = self.fetch(issuer).await?.into_provider_config(issuer, &self.config)?;
        info!(issuer = %config.issuer, token = %config.endpoints.token, "Provider discovered");
        Ok(Some(Arc::new(OidcProvider::new(config)?)))
    }
}

impl std::fmt::Debug for DiscoveryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryResolver")
            .field("trusted_issuers", &self.config.trusted_issuers)
            .finish_non_exhaustive()
    }
}
