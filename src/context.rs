//! Immutable runtime context.
//!
//! Everything a request needs besides the database: configuration, the
//! signing key and the provider registry. A [`Context`] is built once and
//! never mutated; reloading swaps in a whole new one.

use crate::config::Config;
use crate::crypto::{PublicKey, SigningKey};
use crate::discovery::DiscoveryResolver;
use crate::error::{Error, Result};
use crate::network::Lookups;
use crate::provider::ProviderRegistry;
use std::sync::Arc;
use tracing::info;

/// Label of the signature that keys polling-code derivation.
const POLLING_SECRET_LABEL: &[u8] = b"polling_code";

pub struct Context {
    pub config: Config,
    pub signing_key: SigningKey,
    pub public_key: PublicKey,
    pub providers: ProviderRegistry,
    pub lookups: Lookups,
    polling_secret: Vec<u8>,
}

impl Context {
    pub fn new(
        config: Config,
        signing_key: SigningKey,
        providers: ProviderRegistry,
        lookups: Lookups,
    ) -> Result<Self> {
        config.validate()?;
        // Ed25519 signatures are deterministic, so the secret is stable for a key.
        let polling_secret = signing_key.sign(POLLING_SECRET_LABEL).to_bytes().to_vec();
        Ok(Self {
            public_key: signing_key.public_key(),
            config,
            signing_key,
            providers,
            lookups,
            polling_secret,
        })
    }

    /// Load the signing key named by the configuration and register the
    /// configured providers, with discovery for federation-trusted issuers
    /// when enabled.
    pub fn from_config(config: Config, lookups: Lookups) -> Result<Self> {
        let path = config
            .signing_key_file
            .clone()
            .ok_or_else(|| Error::Configuration("signing_key_file is not set".into()))?;
        let pem = std::fs::read_to_string(&path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        let signing_key = SigningKey::from_pem(&pem)?;
        let providers = registry(&config)?;
        info!(
            issuer = %config.issuer,
            key = %signing_key.public_key().fingerprint(),
            providers = config.providers.len(),
            "Context loaded"
        );
        Self::new(config, signing_key, providers, lookups)
    }

    /// Key for deriving polling codes from OIDC states.
    pub fn polling_secret(&self) -> &[u8] {
        &self.polling_secret
    }

    pub fn issuer(&self) -> &str {
        &self.config.issuer
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("issuer", &self.config.issuer)
            .field("public_key", &self.public_key.fingerprint())
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

fn registry(config: &Config) -> Result<ProviderRegistry> {
    let providers = ProviderRegistry::from_config(config)?;
    let federation = &config.federation;
    if !federation.enabled {
        return Ok(providers);
    }
    info!(trusted = federation.trusted_issuers.len(), "Federation discovery enabled");
    let resolver = DiscoveryResolver::new(federation.clone())?;
    Ok(providers.with_federation(Arc::new(resolver), federation.cache_ttl(), federation.cache_capacity))
}

/// Current unix time in seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
