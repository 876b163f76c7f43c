//! Error types for mytoken.
//!
//! Every failure is classified into one of six categories that decide the
//! HTTP status and the OAuth-style error body sent to clients. Internal
//! failures keep their detail for logging but never expose it on the wire.

use serde::Serialize;
use thiserror::Error;

/// Result type alias for mytoken operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Status used for upstream failures that carry no HTTP status of their own.
pub const UPSTREAM_DEFAULT_STATUS: u16 = 502;

/// Canonical error codes.
///
/// Code ranges:
/// - 1000-1099: Client errors (malformed request, unknown issuer, state mismatch)
/// - 1100-1199: Authentication errors (invalid, expired or revoked token or code)
/// - 1200-1299: Authorization errors (missing capability, usage exhausted, declined)
/// - 1300-1399: Not-yet-ready errors (pending native flow)
/// - 1400-1499: Upstream provider errors
/// - 1500-1599: Internal errors (storage, crypto, configuration)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Client errors (1000-1099)
    InvalidRequest = 1000,
    UnknownIssuer = 1001,
    StateMismatch = 1002,
    InvalidRestriction = 1003,
    UnknownCapability = 1004,
    RestrictionsNotTighter = 1005,
    NoCapabilities = 1006,
    UnsupportedGrantType = 1007,
    MaxLifetimeExceeded = 1008,
    AlreadyExpired = 1009,
    FeatureDisabled = 1010,

    // Authentication errors (1100-1199)
    InvalidToken = 1100,
    TokenRevoked = 1101,
    BadCode = 1102,
    CodeExpired = 1103,
    SignatureInvalid = 1104,

    // Authorization errors (1200-1299)
    InsufficientCapabilities = 1200,
    UsageRestricted = 1201,
    ConsentDeclined = 1202,
    AccessDenied = 1203,

    // Not-yet-ready errors (1300-1399)
    AuthorizationPending = 1300,

    // Upstream errors (1400-1499)
    OidcError = 1400,
    NoRefreshToken = 1401,
    InvalidProviderResponse = 1402,

    // Internal errors (1500-1599)
    Storage = 1500,
    NoDatabaseNode = 1501,
    ConnectionDead = 1502,
    Crypto = 1503,
    Serialization = 1504,
    Configuration = 1505,
    Internal = 1506,
}

impl ErrorCode {
    /// Get the numeric code value.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Get machine-readable name (kebab-case).
    pub fn name(self) -> &'static str {
        match self {
            // Client errors
            Self::InvalidRequest => "invalid-request",
            Self::UnknownIssuer => "unknown-issuer",
            Self::StateMismatch => "state-mismatch",
            Self::InvalidRestriction => "invalid-restriction",
            Self::UnknownCapability => "unknown-capability",
            Self::RestrictionsNotTighter => "restrictions-not-tighter",
            Self::NoCapabilities => "no-capabilities",
            Self::UnsupportedGrantType => "unsupported-grant-type",
            Self::MaxLifetimeExceeded => "max-lifetime-exceeded",
            Self::AlreadyExpired => "already-expired",
            Self::FeatureDisabled => "feature-disabled",

            // Authentication errors
            Self::InvalidToken => "invalid-token",
            Self::TokenRevoked => "token-revoked",
            Self::BadCode => "bad-code",
            Self::CodeExpired => "code-expired",
            Self::SignatureInvalid => "signature-invalid",

            // Authorization errors
            Self::InsufficientCapabilities => "insufficient-capabilities",
            Self::UsageRestricted => "usage-restricted",
            Self::ConsentDeclined => "consent-declined",
            Self::AccessDenied => "access-denied",

            // Not-yet-ready errors
            Self::AuthorizationPending => "authorization-pending",

            // Upstream errors
            Self::OidcError => "oidc-error",
            Self::NoRefreshToken => "no-refresh-token",
            Self::InvalidProviderResponse => "invalid-provider-response",

            // Internal errors
            Self::Storage => "storage",
            Self::NoDatabaseNode => "no-database-node",
            Self::ConnectionDead => "connection-dead",
            Self::Crypto => "crypto",
            Self::Serialization => "serialization",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }

    /// OAuth 2.0 style `error` value used in response bodies.
    pub fn oauth_error(self) -> &'static str {
        match self {
            Self::InvalidRequest
            | Self::InvalidRestriction
            | Self::UnknownCapability
            | Self::RestrictionsNotTighter
            | Self::NoCapabilities
            | Self::MaxLifetimeExceeded
            | Self::AlreadyExpired
            | Self::FeatureDisabled => "invalid_request",
            Self::UnknownIssuer => "unknown_issuer",
            Self::StateMismatch => "state_mismatch",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::InvalidToken | Self::TokenRevoked | Self::SignatureInvalid => "invalid_token",
            Self::BadCode => "bad_code",
            Self::CodeExpired => "code_expired",
            Self::InsufficientCapabilities => "insufficient_capabilities",
            Self::UsageRestricted => "usage_restricted",
            Self::ConsentDeclined => "consent_declined",
            Self::AccessDenied => "access_denied",
            Self::AuthorizationPending => "authorization_pending",
            Self::OidcError => "oidc_error",
            Self::NoRefreshToken => "no_refresh_token",
            Self::InvalidProviderResponse => "invalid_op_response",
            Self::Storage
            | Self::NoDatabaseNode
            | Self::ConnectionDead
            | Self::Crypto
            | Self::Serialization
            | Self::Configuration
            | Self::Internal => "internal_server_error",
        }
    }

    /// Get HTTP status code based on error category.
    pub fn http_status(self) -> u16 {
        match self.code() / 100 {
            10 => 400,                     // Client errors -> Bad Request
            11 => 401,                     // Authentication -> Unauthorized
            12 => 403,                     // Authorization -> Forbidden
            13 => 428,                     // Pending -> Precondition Required
            14 => UPSTREAM_DEFAULT_STATUS, // Upstream -> Bad Gateway unless mirrored
            _ => 500,                      // Internal -> Internal Server Error
        }
    }

    /// Whether details of this error may be shown to the client.
    pub fn is_internal(self) -> bool {
        self.code() / 100 == 15
    }

    /// Get human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            Self::InvalidRequest => "Malformed request",
            Self::UnknownIssuer => "The requested OpenID provider is not supported",
            Self::StateMismatch => "State does not belong to a pending authorization flow",
            Self::InvalidRestriction => "Malformed restriction",
            Self::UnknownCapability => "Unknown capability",
            Self::RestrictionsNotTighter => {
                "Requested restrictions are not a subset of the original restrictions"
            }
            Self::NoCapabilities => "The token cannot have any of the requested capabilities",
            Self::UnsupportedGrantType => "Unsupported grant_type",
            Self::MaxLifetimeExceeded => "Requested restrictions exceed the maximum token lifetime",
            Self::AlreadyExpired => "Token would already be expired",
            Self::FeatureDisabled => "Feature is not enabled on this server",
            Self::InvalidToken => "Token is invalid",
            Self::TokenRevoked => "Token has been revoked",
            Self::BadCode => "Code is unknown or was already used",
            Self::CodeExpired => "Code has expired",
            Self::SignatureInvalid => "Signature verification failed",
            Self::InsufficientCapabilities => "Token lacks the required capability",
            Self::UsageRestricted => "No restriction allows this usage",
            Self::ConsentDeclined => "The user declined consent",
            Self::AccessDenied => "Access denied",
            Self::AuthorizationPending => "Authorization is still pending",
            Self::OidcError => "The OpenID provider returned an error",
            Self::NoRefreshToken => "Did not receive a refresh token",
            Self::InvalidProviderResponse => "Could not understand the OpenID provider response",
            Self::Storage => "Storage failure",
            Self::NoDatabaseNode => "No database node available",
            Self::ConnectionDead => "Database connection lost",
            Self::Crypto => "Cryptographic failure",
            Self::Serialization => "Serialization failure",
            Self::Configuration => "Configuration error",
            Self::Internal => "Internal server error",
        }
    }
}

/// Errors that can occur in mytoken operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Client Errors
    // =========================================================================
    /// The request was malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The issuer is neither configured nor discoverable.
    #[error("unknown issuer: {0}")]
    UnknownIssuer(String),

    /// No pending authorization flow for the given state.
    #[error("state mismatch")]
    StateMismatch,

    /// A restriction could not be parsed or is inconsistent.
    #[error("invalid restriction: {0}")]
    InvalidRestriction(String),

    /// A capability name is not known to the server.
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),

    /// Requested restrictions would widen the parent's restrictions.
    #[error("requested restrictions are not subset of original restrictions")]
    RestrictionsNotTighter,

    /// Capability tightening produced an empty set.
    #[error("mytoken to be issued cannot have any of the requested capabilities")]
    NoCapabilities,

    /// Unsupported `grant_type`.
    #[error("unsupported grant_type '{0}'")]
    UnsupportedGrantType(String),

    /// Requested restrictions do not respect the issuer's maximum lifetime.
    #[error("requested restrictions do not respect maximum mytoken lifetime")]
    MaxLifetimeExceeded,

    /// The requested token would be expired on issuance.
    #[error("token would already be expired")]
    AlreadyExpired,

    /// The requested feature is disabled by configuration.
    #[error("feature '{0}' is not enabled")]
    FeatureDisabled(&'static str),

    // =========================================================================
    // Authentication Errors
    // =========================================================================
    /// The presented token is malformed, expired or otherwise invalid.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The presented token has been revoked or superseded.
    #[error("token revoked")]
    TokenRevoked,

    /// Transfer or polling code not found.
    #[error("bad code")]
    BadCode,

    /// Transfer or polling code expired.
    #[error("code expired")]
    CodeExpired,

    /// Token signature did not verify.
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    // =========================================================================
    // Authorization Errors
    // =========================================================================
    /// Token lacks the capability required for this action.
    #[error("token lacks capability '{0}'")]
    InsufficientCapabilities(String),

    /// None of the token's restrictions currently allow this usage.
    #[error("usage restricted: {0}")]
    UsageRestricted(String),

    /// The user declined the consent screen.
    #[error("consent declined")]
    ConsentDeclined,

    /// Access denied by policy.
    #[error("access denied: {0}")]
    AccessDenied(String),

    // =========================================================================
    // Not-yet-ready Errors
    // =========================================================================
    /// Native flow has not completed yet.
    #[error("authorization pending")]
    AuthorizationPending,

    // =========================================================================
    // Upstream Errors
    // =========================================================================
    /// The OpenID provider returned an error.
    #[error("{error}: {description}")]
    Oidc {
        status: Option<u16>,
        error: String,
        description: String,
    },

    /// The provider's token response contained no refresh token.
    #[error("did not receive a refresh token")]
    NoRefreshToken,

    /// The provider's response could not be understood.
    #[error("invalid provider response: {0}")]
    InvalidProviderResponse(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Storage layer failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Every database node is down or the retry budget is spent.
    #[error("no database node available")]
    NoDatabaseNode,

    /// The connection to a database node was lost mid-operation.
    #[error("database connection dead: {0}")]
    ConnectionDead(String),

    /// Cryptographic operation failed.
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Error::SignatureInvalid(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Internal(format!("http client: {}", e))
    }
}

/// Lost connections and an exhausted or closed pool mean the node is gone;
/// everything else is a failure of the statement itself.
impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Error::ConnectionDead(e.to_string()),
            other => Error::Storage(other.to_string()),
        }
    }
}

/// OAuth 2.0 style error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_description: String,
}

impl Error {
    /// Build an upstream error from an OIDC error response.
    pub fn oidc(status: Option<u16>, error: impl Into<String>, description: impl Into<String>) -> Self {
        Error::Oidc {
            status,
            error: error.into(),
            description: description.into(),
        }
    }

    /// Map this error to a canonical error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            // Client errors
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::UnknownIssuer(_) => ErrorCode::UnknownIssuer,
            Self::StateMismatch => ErrorCode::StateMismatch,
            Self::InvalidRestriction(_) => ErrorCode::InvalidRestriction,
            Self::UnknownCapability(_) => ErrorCode::UnknownCapability,
            Self::RestrictionsNotTighter => ErrorCode::RestrictionsNotTighter,
            Self::NoCapabilities => ErrorCode::NoCapabilities,
            Self::UnsupportedGrantType(_) => ErrorCode::UnsupportedGrantType,
            Self::MaxLifetimeExceeded => ErrorCode::MaxLifetimeExceeded,
            Self::AlreadyExpired => ErrorCode::AlreadyExpired,
            Self::FeatureDisabled(_) => ErrorCode::FeatureDisabled,

            // Authentication errors
            Self::InvalidToken(_) => ErrorCode::InvalidToken,
            Self::TokenRevoked => ErrorCode::TokenRevoked,
            Self::BadCode => ErrorCode::BadCode,
            Self::CodeExpired => ErrorCode::CodeExpired,
            Self::SignatureInvalid(_) => ErrorCode::SignatureInvalid,

            // Authorization errors
            Self::InsufficientCapabilities(_) => ErrorCode::InsufficientCapabilities,
            Self::UsageRestricted(_) => ErrorCode::UsageRestricted,
            Self::ConsentDeclined => ErrorCode::ConsentDeclined,
            Self::AccessDenied(_) => ErrorCode::AccessDenied,

            // Not-yet-ready errors
            Self::AuthorizationPending => ErrorCode::AuthorizationPending,

            // Upstream errors
            Self::Oidc { .. } => ErrorCode::OidcError,
            Self::NoRefreshToken => ErrorCode::NoRefreshToken,
            Self::InvalidProviderResponse(_) => ErrorCode::InvalidProviderResponse,

            // Internal errors
            Self::Storage(_) => ErrorCode::Storage,
            Self::NoDatabaseNode => ErrorCode::NoDatabaseNode,
            Self::ConnectionDead(_) => ErrorCode::ConnectionDead,
            Self::Crypto(_) => ErrorCode::Crypto,
            Self::Serialization(_) => ErrorCode::Serialization,
            Self::Configuration(_) => ErrorCode::Configuration,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Get the machine-readable error name (kebab-case).
    pub fn name(&self) -> &'static str {
        self.code().name()
    }

    /// Get HTTP status code for this error.
    ///
    /// Upstream errors mirror the provider's status when it is known.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Oidc {
                status: Some(status),
                ..
            } => *status,
            _ => self.code().http_status(),
        }
    }

    /// Get human-readable description.
    pub fn description(&self) -> &'static str {
        self.code().description()
    }

    /// Whether this error is an internal failure.
    pub fn is_internal(&self) -> bool {
        self.code().is_internal()
    }

    /// Build the OAuth-style body for this error.
    ///
    /// Internal errors only carry their generic description.
    pub fn to_api_error(&self) -> ApiError {
        let code = self.code();
        let error_description = match self {
            _ if code.is_internal() => code.description().to_string(),
            Self::Oidc {
                error, description, ..
            } => {
                if description.is_empty() {
                    error.clone()
                } else {
                    format!("{}: {}", error, description)
                }
            }
            Self::StateMismatch
            | Self::BadCode
            | Self::CodeExpired
            | Self::ConsentDeclined
            | Self::AuthorizationPending
            | Self::NoRefreshToken => code.description().to_string(),
            other => other.to_string(),
        };
        ApiError {
            error: code.oauth_error().to_string(),
            error_description,
        }
    }
}
