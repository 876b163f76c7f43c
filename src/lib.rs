//! # Mytoken Core
//!
//! Delegable, restriction-bound bearer credentials backed by OpenID Connect
//! refresh tokens.
//!
//! A mytoken stands in for an OIDC refresh token. Its holder can obtain
//! access tokens from the provider without ever seeing the refresh token,
//! within the bounds its restrictions and capabilities allow. Tokens can
//! mint children, and a child never gets more than its parent.
//!
//! ## Key Concepts
//!
//! - **Restriction**: a clause bounding time, scope, audience, location and
//!   usage counts. A token is usable when any one of its clauses admits the use
//! - **Tightening**: deriving a child's restrictions so they are never wider
//!   than the parent's
//! - **Capabilities**: named permissions (`AT`, `create_mytoken`, ...)
//! - **Hierarchy**: children share their parent's refresh token; revoking a
//!   token can take its whole subtree with it
//! - **Proxy tokens**: short tokens, transfer codes and polling codes stand
//!   in for a JWT
//!
//! ## Example
//!
//! ```rust,ignore
//! use mytoken::{Restriction, Restrictions, tighten};
//!
//! let parent: Restrictions = vec![Restriction {
//!     scope: "openid storage.read storage.write".into(),
//!     expires_at: now + 3600,
//!     ..Default::default()
//! }]
//! .into();
//! let wanted: Restrictions = vec![Restriction {
//!     scope: "storage.read".into(),
//!     expires_at: now + 600,
//!     ..Default::default()
//! }]
//! .into();
//!
//! let (child, honored) = tighten(&parent, &wanted);
//! assert!(honored);
//! ```

pub mod authcode;
pub mod capabilities;
pub mod cluster;
pub mod config;
pub mod context;
pub mod crypto;
pub mod db;
pub mod discovery;
pub mod enforced;
pub mod error;
pub mod event;
pub mod hierarchy;
pub mod mytoken;
pub mod network;
pub mod polling;
pub mod provider;
pub mod proxy;
pub mod response;
pub mod restrictions;
pub mod service;
pub mod state;
pub mod usage;
pub mod wire;

// Re-exports for convenience
pub use authcode::{
    AuthCodeFlowResponse, ClientType, CodeExchangeOutcome, ConsentInfo, ConsentUpdate,
    OidcFlowRequest, PollingInfo,
};
pub use capabilities::{Capabilities, Capability};
pub use cluster::{Cluster, Connection, Periodic, PoolConnection};
pub use config::{Config, ConfigError, DatabaseConfig, FederationConfig, ProviderConfig};
pub use context::Context;
pub use crypto::{PublicKey, SigningKey};
pub use db::{Database, PoolSettings, Purged, Snapshot, Tx, TxFuture};
pub use discovery::{DiscoveryResolver, ProviderMetadata};
pub use error::{ApiError, Error, ErrorCode, Result};
pub use event::{Event, EventEntry};
pub use hierarchy::{MytokenEntry, MytokenEntryTree};
pub use mytoken::{Mytoken, MytokenId, NewMytoken, ResponseType, Rotation};
pub use network::{ClientMetadata, Lookups};
pub use provider::{OidcProvider, Provider, ProviderRegistry, TokenResponse, UserInfo};
pub use response::{MytokenResponse, TokenUpdate};
pub use restrictions::{tighten, Restriction, RestrictionKey, Restrictions};
pub use service::{
    AccessTokenRequest, AccessTokenResponse, MytokenRequest, MytokenService, RevocationRequest,
    SubtokenRequest, TokenEndpointResponse, TokeninfoAction, TokeninfoRequest, TokeninfoResponse,
    TransferCodeRequest, TransferCodeResponse,
};

/// Path prefix of the versioned API.
pub const API_PREFIX: &str = "/api/v0";
